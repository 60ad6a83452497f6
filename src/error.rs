use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error for {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store directory {path} is locked by another process")]
    StoreLocked { path: String },

    #[error("Relay runtime has stopped")]
    Closed,
}

impl RelayError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        RelayError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serialization(key: impl Into<String>, source: serde_json::Error) -> Self {
        RelayError::Serialization {
            key: key.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_path() {
        let err = RelayError::io(
            "delivert_watch_0001",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("delivert_watch_0001"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_invalid_config_display() {
        let err = RelayError::InvalidConfig("PAYLOAD_LIMIT must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: PAYLOAD_LIMIT must be at least 1"
        );
    }
}
