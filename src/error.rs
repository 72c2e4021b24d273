//! Error types for runectl

use thiserror::Error;

/// Result type for runectl operations
pub type Result<T> = std::result::Result<T, CtlError>;

/// Exit code for any failure
pub const EXIT_FAILURE: i32 = 1;

/// Exit code reserved for incompatible flag combinations
pub const EXIT_FLAG_CONFLICT: i32 = 125;

/// runectl error types
#[derive(Error, Debug)]
pub enum CtlError {
    #[error("invalid compose project: {0}")]
    ConfigInvalid(String),

    #[error("dependency cycle detected between services: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("external {kind} {name} not found")]
    ExternalResourceMissing { kind: &'static str, name: String },

    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    #[error("resource in use: {0}")]
    ResourceInUse(String),

    #[error("image not available: {0}")]
    ImageMissing(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Runtime client failure; the message is surfaced unchanged
    #[error("{0}")]
    Runtime(String),

    #[error("no such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{0}")]
    FlagConflict(String),

    #[error("service {service}: {source}")]
    Service {
        service: String,
        #[source]
        source: Box<CtlError>,
    },

    #[error("{}", display_aggregate(.0))]
    Aggregate(Vec<CtlError>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn display_aggregate(errors: &[CtlError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl CtlError {
    /// Attribute an error to a service or resource name
    pub fn for_service(service: impl Into<String>, err: CtlError) -> Self {
        CtlError::Service {
            service: service.into(),
            source: Box::new(err),
        }
    }

    /// Collapse a list of branch errors into a single error.
    ///
    /// Returns `Ok(())` when the list is empty and the error itself when
    /// only one branch failed.
    pub fn aggregate(mut errors: Vec<CtlError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CtlError::Aggregate(errors)),
        }
    }

    /// The innermost error, skipping attribution and aggregation wrappers
    pub fn root(&self) -> &CtlError {
        match self {
            CtlError::Service { source, .. } => source.root(),
            CtlError::Aggregate(errors) => errors.first().map(|e| e.root()).unwrap_or(self),
            other => other,
        }
    }

    /// Whether the runtime reported the object as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), CtlError::NotFound { .. })
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            CtlError::FlagConflict(_) => EXIT_FLAG_CONFLICT,
            _ => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_prefix() {
        let err = CtlError::for_service("web", CtlError::ImageMissing("nginx".to_string()));
        assert_eq!(err.to_string(), "service web: image not available: nginx");
        assert!(matches!(err.root(), CtlError::ImageMissing(_)));
    }

    #[test]
    fn test_aggregate() {
        assert!(CtlError::aggregate(Vec::new()).is_ok());

        let single = CtlError::aggregate(vec![CtlError::Cancelled]).unwrap_err();
        assert!(matches!(single, CtlError::Cancelled));

        let many = CtlError::aggregate(vec![
            CtlError::FlagConflict("-d and -i".to_string()),
            CtlError::Runtime("boom".to_string()),
        ])
        .unwrap_err();
        assert_eq!(many.exit_code(), EXIT_FLAG_CONFLICT);
        assert_eq!(many.to_string(), "-d and -i\nboom");
    }

    #[test]
    fn test_not_found_through_wrappers() {
        let err = CtlError::for_service(
            "db",
            CtlError::NotFound {
                kind: "container",
                name: "abc".to_string(),
            },
        );
        assert!(err.is_not_found());
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }
}
