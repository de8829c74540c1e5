//! Error types for binary parsing

use binlift_core::BinaryFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown binary format")]
    UnknownFormat,

    #[error("No structure parser for {0} files")]
    UnsupportedFormat(BinaryFormat),

    #[error("Invalid magic number: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Address out of bounds: {0:#x}")]
    AddressOutOfBounds(u64),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Truncated data: expected {expected} bytes, got {actual}")]
    TruncatedData { expected: usize, actual: usize },
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

impl ParseError {
    pub fn invalid_header(msg: impl Into<String>) -> Self {
        Self::InvalidHeader(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn truncated(expected: usize, actual: usize) -> Self {
        Self::TruncatedData { expected, actual }
    }

    /// Magic mismatch or a header field outside the file
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidMagic { .. }
                | Self::InvalidHeader(_)
                | Self::AddressOutOfBounds(_)
                | Self::Parse(_)
                | Self::TruncatedData { .. }
        )
    }
}

impl From<scroll::Error> for ParseError {
    fn from(err: scroll::Error) -> Self {
        match err {
            scroll::Error::TooBig { size, len } => Self::truncated(size, len),
            scroll::Error::BadOffset(offset) => Self::AddressOutOfBounds(offset as u64),
            other => Self::parse(other.to_string()),
        }
    }
}

impl From<ParseError> for binlift_core::Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::UnsupportedFormat(format) => binlift_core::Error::UnsupportedFormat(format),
            ParseError::UnknownFormat => binlift_core::Error::UnsupportedFormat(BinaryFormat::Unknown),
            other => binlift_core::Error::parse(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        assert!(ParseError::truncated(4, 1).is_structural());
        assert!(ParseError::InvalidMagic { expected: 0x5A4D, actual: 0 }.is_structural());
        assert!(!ParseError::UnknownFormat.is_structural());
        assert!(!ParseError::UnsupportedFormat(BinaryFormat::ZipBased).is_structural());
    }

    #[test]
    fn test_scroll_error_conversion() {
        let err: ParseError = scroll::Error::TooBig { size: 8, len: 2 }.into();
        assert!(matches!(err, ParseError::TruncatedData { expected: 8, actual: 2 }));
    }

    #[test]
    fn test_into_core_error() {
        let err: binlift_core::Error = ParseError::UnsupportedFormat(BinaryFormat::ZipBased).into();
        assert!(matches!(err, binlift_core::Error::UnsupportedFormat(BinaryFormat::ZipBased)));
    }
}
