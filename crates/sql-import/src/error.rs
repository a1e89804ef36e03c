//! Error types for the import library.

use thiserror::Error;

/// Main error type for import operations.
#[derive(Error, Debug)]
pub enum ImportError {
    /// Mapping descriptor failed validation. Blocks job start.
    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),

    /// Source or target unreachable, authentication failure, or a query
    /// failing at the driver level.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single field could not be coerced by its transform.
    #[error("Transform error for field {field}: {message}")]
    Transform { field: String, message: String },

    /// The target store rejected a batch write.
    #[error("Write failed for {entity}: {message}")]
    Write { entity: String, message: String },

    /// A batch stopped part-way after some of its records were committed.
    #[error("{source} (after {written} records were committed)")]
    PartialWrite {
        written: u64,
        #[source]
        source: Box<ImportError>,
    },

    /// A stored value could not be converted to or from the store's type.
    #[error("Decode error: {0}")]
    Decode(String),

    /// An update mode was requested without a key resolution strategy.
    #[error("Key resolution error: {0}")]
    KeyResolution(String),

    /// The verifier itself could not run.
    #[error("Verification error: {0}")]
    Verification(String),

    /// A job lifecycle transition was attempted from the wrong state.
    #[error("Job {job} cannot {action} while {state}")]
    InvalidState {
        job: String,
        state: String,
        action: String,
    },

    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job store error (corrupt or tampered state file).
    #[error("State error: {0}")]
    State(String),

    /// Unknown job or mapping.
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job was cancelled (SIGINT, cancel request, etc.)
    #[error("Job cancelled")]
    Cancelled,
}

impl From<tiberius::error::Error> for ImportError {
    fn from(e: tiberius::error::Error) -> Self {
        ImportError::Connection(format!("source: {}", e))
    }
}

impl From<tokio_postgres::Error> for ImportError {
    fn from(e: tokio_postgres::Error) -> Self {
        ImportError::Connection(format!("target: {}", e))
    }
}

impl From<deadpool_postgres::PoolError> for ImportError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        ImportError::Connection(format!("target pool: {}", e))
    }
}

impl ImportError {
    /// Create a Transform error.
    pub fn transform(field: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Transform {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a Write error.
    pub fn write(entity: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Write {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidState error.
    pub fn invalid_state(
        job: impl Into<String>,
        state: impl std::fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        ImportError::InvalidState {
            job: job.into(),
            state: state.to_string(),
            action: action.into(),
        }
    }

    /// Whether a job may continue past this error when `skip_errors` is set.
    ///
    /// Only per-record and per-batch failures qualify. Mapping, connection
    /// and key-resolution errors mean the job cannot proceed at all.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ImportError::Transform { .. } | ImportError::Write { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ImportError::Config(_) | ImportError::Yaml(_) => 2,
            ImportError::InvalidMapping(_) | ImportError::KeyResolution(_) => 3,
            ImportError::Connection(_) => 4,
            ImportError::Transform { .. }
            | ImportError::Write { .. }
            | ImportError::Decode(_) => 5,
            ImportError::PartialWrite { source, .. } => source.exit_code(),
            ImportError::Verification(_) => 6,
            ImportError::InvalidState { .. } | ImportError::NotFound(_) => 7,
            ImportError::Cancelled => 130,
            ImportError::State(_) | ImportError::Io(_) | ImportError::Json(_) => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for import operations.
pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(ImportError::transform("age", "not a number").is_recoverable());
        assert!(ImportError::write("res.partner", "rejected").is_recoverable());
        assert!(!ImportError::InvalidMapping("empty".into()).is_recoverable());
        assert!(!ImportError::Connection("refused".into()).is_recoverable());
        assert!(!ImportError::KeyResolution("no key".into()).is_recoverable());
    }

    #[test]
    fn test_transform_error_names_field() {
        let err = ImportError::transform("partner_age", "invalid digit");
        assert_eq!(
            err.to_string(),
            "Transform error for field partner_age: invalid digit"
        );
    }

    #[test]
    fn test_partial_write_keeps_cause() {
        let err = ImportError::PartialWrite {
            written: 3,
            source: Box::new(ImportError::Connection("reset".into())),
        };
        assert_eq!(
            err.to_string(),
            "Connection error: reset (after 3 records were committed)"
        );
        assert_eq!(err.exit_code(), 4);
        assert!(!err.is_recoverable());
        assert!(!ImportError::Decode("numeric overflow".into()).is_recoverable());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = ImportError::invalid_state("job-1", "done", "start");
        assert_eq!(err.to_string(), "Job job-1 cannot start while done");
        assert_eq!(err.exit_code(), 7);
    }
}
