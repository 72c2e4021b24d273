//! Options of the lifecycle operations
//!
//! Each operation takes a plain options struct. Flag combinations that
//! cannot work together are rejected by `validate` with a flag conflict.

use super::planner::RecreatePolicy;
use super::project::PullPolicy;
use crate::error::{CtlError, Result};
use crate::runtime::ContainerStatus;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Graceful stop timeout of services without `stop_grace_period`
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// When to build images of services with a `build:` section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildPolicy {
    /// Build only when the image is missing
    #[default]
    Missing,
    /// Always build (`--build`)
    Always,
    /// Never build (`--no-build`)
    Never,
}

/// Output format of the listing commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Table,
    Json,
}

impl std::str::FromStr for Format {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "table" => Ok(Format::Table),
            "json" => Ok(Format::Json),
            other => Err(CtlError::ConfigInvalid(format!(
                "unsupported format {:?} (expected table or json)",
                other
            ))),
        }
    }
}

/// Log rendering switches
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFormat {
    pub no_color: bool,
    pub no_log_prefix: bool,
    pub timestamps: bool,
}

/// Options of `create`, shared by `up`
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub recreate: RecreatePolicy,
    pub build: BuildPolicy,
    /// Engine-level pull policy; a service's `pull_policy` takes precedence
    pub pull: Option<PullPolicy>,
    pub remove_orphans: bool,
    /// `--scale SERVICE=N` overrides
    pub scale: BTreeMap<String, u32>,
    /// Do not pull in dependencies of the selected services
    pub no_deps: bool,
    /// Stop timeout used when replacing containers; each service's
    /// `stop_grace_period` when unset
    pub timeout: Option<Duration>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            recreate: RecreatePolicy::default(),
            build: BuildPolicy::default(),
            pull: None,
            remove_orphans: false,
            scale: BTreeMap::new(),
            no_deps: false,
            timeout: None,
        }
    }
}

impl CreateOptions {
    /// Combine `--force-recreate` / `--no-recreate`
    pub fn recreate_policy(force: bool, never: bool) -> Result<RecreatePolicy> {
        match (force, never) {
            (true, true) => Err(CtlError::FlagConflict(
                "--force-recreate and --no-recreate are incompatible".to_string(),
            )),
            (true, false) => Ok(RecreatePolicy::Force),
            (false, true) => Ok(RecreatePolicy::Never),
            (false, false) => Ok(RecreatePolicy::Diverged),
        }
    }

    /// Combine `--build` / `--no-build`
    pub fn build_policy(build: bool, no_build: bool) -> Result<BuildPolicy> {
        match (build, no_build) {
            (true, true) => Err(CtlError::FlagConflict(
                "--build and --no-build are incompatible".to_string(),
            )),
            (true, false) => Ok(BuildPolicy::Always),
            (false, true) => Ok(BuildPolicy::Never),
            (false, false) => Ok(BuildPolicy::Missing),
        }
    }

    /// Parse `SERVICE=N` scale overrides
    pub fn parse_scale(entries: &[String]) -> Result<BTreeMap<String, u32>> {
        entries
            .iter()
            .map(|entry| {
                let (service, count) = entry.split_once('=').ok_or_else(|| {
                    CtlError::ConfigInvalid(format!("invalid --scale {:?}: expected SERVICE=N", entry))
                })?;
                let count = count.parse::<u32>().map_err(|_| {
                    CtlError::ConfigInvalid(format!("invalid --scale {:?}: not a number", entry))
                })?;
                Ok((service.to_string(), count))
            })
            .collect()
    }
}

/// Options of `up`
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    pub create: CreateOptions,
    pub detach: bool,
    pub abort_on_container_exit: bool,
    /// Return the exit code of this service's container; implies
    /// `abort_on_container_exit`
    pub exit_code_from: Option<String>,
    pub log: LogFormat,
}

impl UpOptions {
    pub fn validate(&self) -> Result<()> {
        if self.detach && self.abort_on_container_exit {
            return Err(CtlError::FlagConflict(
                "--abort-on-container-exit and --detach are incompatible".to_string(),
            ));
        }
        if self.detach && self.exit_code_from.is_some() {
            return Err(CtlError::FlagConflict(
                "--exit-code-from and --detach are incompatible".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the first container exit stops the session
    pub fn aborts(&self) -> bool {
        self.abort_on_container_exit || self.exit_code_from.is_some()
    }
}

/// Options of `stop` and `restart`
#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// Overrides every service's `stop_grace_period`
    pub timeout: Option<Duration>,
}

/// Options of `kill`
#[derive(Debug, Clone)]
pub struct KillOptions {
    pub signal: String,
    pub remove_orphans: bool,
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            signal: "SIGKILL".to_string(),
            remove_orphans: false,
        }
    }
}

/// Options of `rm`
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Stop running containers first
    pub stop: bool,
    /// Remove anonymous volumes of the containers
    pub volumes: bool,
    pub timeout: Option<Duration>,
}

/// Options of `down`
#[derive(Debug, Clone, Default)]
pub struct DownOptions {
    pub remove_orphans: bool,
    /// Remove named volumes and anonymous volumes
    pub volumes: bool,
    pub timeout: Option<Duration>,
}

/// Options of `run`
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub service: String,
    /// Command override; the service command when empty
    pub command: Vec<String>,
    pub entrypoint: Option<String>,
    pub name: Option<String>,
    pub detach: bool,
    pub rm: bool,
    pub service_ports: bool,
    /// `-p` publishings
    pub publish: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    /// `KEY=VALUE` overrides
    pub env: Vec<String>,
    pub labels: Vec<String>,
    /// Extra `-v` mounts
    pub volumes: Vec<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub no_deps: bool,
    pub build: BuildPolicy,
    pub pull: Option<PullPolicy>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            service: String::new(),
            command: Vec::new(),
            entrypoint: None,
            name: None,
            detach: false,
            rm: false,
            service_ports: false,
            publish: Vec::new(),
            interactive: true,
            tty: true,
            env: Vec::new(),
            labels: Vec::new(),
            volumes: Vec::new(),
            workdir: None,
            user: None,
            no_deps: false,
            build: BuildPolicy::default(),
            pull: None,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.service_ports && !self.publish.is_empty() {
            return Err(CtlError::FlagConflict(
                "--service-ports and --publish are incompatible".to_string(),
            ));
        }
        check_detach(self.detach, self.interactive, self.tty)
    }
}

/// Options of `exec`
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub service: String,
    pub index: u32,
    pub command: Vec<String>,
    pub detach: bool,
    pub interactive: bool,
    pub tty: bool,
    pub env: Vec<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub privileged: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            service: String::new(),
            index: 1,
            command: Vec::new(),
            detach: false,
            interactive: true,
            tty: true,
            env: Vec::new(),
            workdir: None,
            user: None,
            privileged: false,
        }
    }
}

impl ExecOptions {
    pub fn validate(&self) -> Result<()> {
        check_detach(self.detach, self.interactive, self.tty)
    }
}

fn check_detach(detach: bool, interactive: bool, tty: bool) -> Result<()> {
    if detach && interactive {
        return Err(CtlError::FlagConflict(
            "--detach and --interactive are incompatible".to_string(),
        ));
    }
    if detach && tty {
        return Err(CtlError::FlagConflict(
            "--detach and --tty are incompatible".to_string(),
        ));
    }
    Ok(())
}

/// Options of `logs`
#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    pub follow: bool,
    /// Trailing lines per container, all when unset
    pub tail: Option<usize>,
    pub index: Option<u32>,
    pub log: LogFormat,
}

/// Options of `ps`
#[derive(Debug, Clone, Default)]
pub struct PsOptions {
    pub all: bool,
    pub quiet: bool,
    pub services: bool,
    pub format: Format,
    pub status: Vec<ContainerStatus>,
}

/// Options of `images`
#[derive(Debug, Clone, Default)]
pub struct ImagesOptions {
    pub quiet: bool,
    pub format: Format,
}

/// Options of `port`
#[derive(Debug, Clone, Default)]
pub struct PortOptions {
    pub service: String,
    pub private_port: u16,
    pub protocol: crate::runtime::Protocol,
    pub index: u32,
}

/// Options of `config`
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    /// Print service names only
    pub services: bool,
    /// Print volume names only
    pub volumes: bool,
    /// `*` for every service, or one service name
    pub hash: Option<String>,
    pub format: ConfigFormat,
}

/// Output format of `config`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Yaml,
    Json,
}

/// Options of `build`
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub no_cache: bool,
    /// `--build-arg` overrides
    pub args: BTreeMap<String, String>,
    pub quiet: bool,
}

/// Options of `pull`
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub ignore_pull_failures: bool,
    pub quiet: bool,
}

/// Options of `push`
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub ignore_push_failures: bool,
}

/// Direction of `cp`
#[derive(Debug, Clone)]
pub enum CopyDirection {
    /// `SERVICE:PATH` to a local path
    FromContainer { service: String, path: String, dest: PathBuf },
    /// Local path to `SERVICE:PATH`
    ToContainer { src: PathBuf, service: String, path: String },
}

/// Options of `cp`
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub direction: CopyDirection,
    pub index: u32,
    /// Copy to every replica of the service
    pub all: bool,
}

impl CopyOptions {
    /// Parse `cp SRC DEST` where exactly one side is `SERVICE:PATH`
    pub fn parse(src: &str, dest: &str, index: u32, all: bool) -> Result<Self> {
        let remote = |s: &str| -> Option<(String, String)> {
            let (service, path) = s.split_once(':')?;
            if service.is_empty() || service.contains('/') || service.starts_with('.') {
                return None;
            }
            Some((service.to_string(), path.to_string()))
        };

        let direction = match (remote(src), remote(dest)) {
            (Some((service, path)), None) => CopyDirection::FromContainer {
                service,
                path,
                dest: PathBuf::from(dest),
            },
            (None, Some((service, path))) => CopyDirection::ToContainer {
                src: PathBuf::from(src),
                service,
                path,
            },
            _ => {
                return Err(CtlError::ConfigInvalid(
                    "cp requires exactly one of source and destination to be SERVICE:PATH"
                        .to_string(),
                ))
            }
        };

        Ok(Self {
            direction,
            index,
            all,
        })
    }
}
