// rust/restart-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestartError {

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Resource error at '{path}': {message}")]
    Resource {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error(
        "Transfer error on dataset '{dataset}': {failed} of {attempted} transfers failed \
         (first failure at part {first_failed_part})"
    )]
    Transfer {
        dataset: String,
        first_failed_part: usize,
        failed: usize,
        attempted: usize,
        #[source]
        source: Option<Box<RestartError>>,
    },

    #[error("Group synchronization error: {message}")]
    GroupSynchronization {
        message: String,
    },

    #[error("Format error in '{path}': {message}")]
    Format {
        path: PathBuf,
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, RestartError>;

// Convenience constructors
impl RestartError {

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn resource(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Resource {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn resource_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Resource {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn transfer(
        dataset: impl Into<String>,
        first_failed_part: usize,
        failed: usize,
        attempted: usize,
        source: RestartError,
    ) -> Self {
        Self::Transfer {
            dataset: dataset.into(),
            first_failed_part,
            failed,
            attempted,
            source: Some(Box::new(source)),
        }
    }

    pub fn group_sync(message: impl Into<String>) -> Self {
        Self::GroupSynchronization {
            message: message.into(),
        }
    }

    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns `true` for errors detected before any I/O was attempted.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_reports_first_failure() {
        let cause = RestartError::resource("ckpt.rst", "short write");
        let err = RestartError::transfer("pressure", 3, 2, 8, cause);

        let msg = err.to_string();
        assert!(msg.contains("pressure"));
        assert!(msg.contains("2 of 8"));
        assert!(msg.contains("part 3"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_is_configuration() {
        assert!(RestartError::config("bad rank").is_configuration());
        assert!(!RestartError::group_sync("diverged").is_configuration());
    }
}
