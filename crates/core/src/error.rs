//! Error types for binlift

use std::path::PathBuf;

use thiserror::Error;

use crate::types::BinaryFormat;

/// Main error type for the analysis pipeline
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(BinaryFormat),

    #[error("File too large: {path} is {size} bytes (limit {limit})")]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Custom(String),
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::io(
            "/tmp/missing.exe",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/missing.exe"));

        let err = Error::UnsupportedFormat(BinaryFormat::ZipBased);
        assert_eq!(err.to_string(), "Unsupported format: ZIP");

        let err = Error::FileTooLarge {
            path: "big.bin".into(),
            size: 10,
            limit: 5,
        };
        assert!(err.to_string().contains("limit 5"));
    }
}
