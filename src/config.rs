//! Process-wide settings
//!
//! Settings are resolved once at startup from the environment. Nothing here
//! is persisted; the engine re-reads runtime state on every invocation.

use std::path::{Path, PathBuf};

/// Environment variable overriding the data root
pub const DATA_ROOT_ENV: &str = "RUNECTL_DATA_ROOT";

/// Environment variable bounding concurrent lifecycle operations
pub const PARALLEL_LIMIT_ENV: &str = "COMPOSE_PARALLEL_LIMIT";

/// Runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for runtime state, volumes and locks
    pub data_root: PathBuf,
    /// Maximum number of concurrently active lifecycle operations
    pub parallelism: usize,
    /// Debug logging
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            parallelism: default_parallelism(),
            debug: false,
        }
    }
}

impl Settings {
    /// Resolve settings from the process environment
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(root) = std::env::var_os(DATA_ROOT_ENV).filter(|v| !v.is_empty()) {
            settings.data_root = PathBuf::from(root);
        }

        if let Ok(limit) = std::env::var(PARALLEL_LIMIT_ENV) {
            match limit.parse::<usize>() {
                Ok(n) if n > 0 => settings.parallelism = n,
                _ => tracing::warn!("Ignoring invalid {}={}", PARALLEL_LIMIT_ENV, limit),
            }
        }

        settings
    }

    /// Settings rooted at an explicit directory
    pub fn with_root(root: &Path) -> Self {
        Self {
            data_root: root.to_path_buf(),
            ..Self::default()
        }
    }

    /// Enable debug logging
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Directory holding runtime state
    pub fn runtime_dir(&self) -> PathBuf {
        self.data_root.join("runtime")
    }

    /// Directory holding per-project lock files
    pub fn compose_dir(&self) -> PathBuf {
        self.data_root.join("compose")
    }
}

fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("runectl")
}

fn default_parallelism() -> usize {
    num_cpus::get().max(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_root_paths() {
        let settings = Settings::with_root(Path::new("/tmp/rc"));
        assert_eq!(settings.runtime_dir(), PathBuf::from("/tmp/rc/runtime"));
        assert_eq!(settings.compose_dir(), PathBuf::from("/tmp/rc/compose"));
        assert!(settings.parallelism >= 4);
        assert!(!settings.debug);
    }
}
