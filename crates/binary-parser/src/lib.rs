//! Binary format detection and structure parsing
//!
//! Supports PE (Windows), ELF (Linux) and Mach-O (macOS) executables, plus
//! printable string extraction over raw file bytes.

pub mod common;
pub mod elf;
pub mod error;
pub mod macho;
pub mod pe;
pub mod strings;

pub use common::{BinaryReader, BinaryStructure, Section, SectionFlags, SectionKind};
pub use error::{ParseError, ParseResult};
pub use strings::{ExtractedString, StringContext, StringEncoding, StringExtractor, StringKind};

use binlift_core::BinaryFormat;
use memmap2::Mmap;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use tracing::debug;

/// Classify a byte stream by its leading magic bytes
///
/// Anything shorter than four bytes, or with an unrecognized prefix, is `Unknown`.
pub fn detect_format(data: &[u8]) -> BinaryFormat {
    if data.len() < 4 {
        return BinaryFormat::Unknown;
    }

    match &data[0..4] {
        [b'M', b'Z', _, _] => BinaryFormat::PE,
        [0x7F, b'E', b'L', b'F'] => BinaryFormat::ELF,
        [0xFE, 0xED, 0xFA, 0xCE]
        | [0xFE, 0xED, 0xFA, 0xCF]
        | [0xCE, 0xFA, 0xED, 0xFE]
        | [0xCF, 0xFA, 0xED, 0xFE] => BinaryFormat::MachO,
        [b'P', b'K', _, _] => BinaryFormat::ZipBased,
        _ => BinaryFormat::Unknown,
    }
}

/// Parse raw bytes into a `BinaryStructure`, dispatching on the detected format
pub fn parse_structure(data: &[u8]) -> ParseResult<BinaryStructure> {
    parse_structure_as(detect_format(data), data)
}

/// Parse raw bytes with an already-detected format
pub fn parse_structure_as(format: BinaryFormat, data: &[u8]) -> ParseResult<BinaryStructure> {
    match format {
        BinaryFormat::PE => pe::parse(data),
        BinaryFormat::ELF => elf::parse(data),
        BinaryFormat::MachO => macho::parse(data),
        BinaryFormat::ZipBased => Err(ParseError::UnsupportedFormat(format)),
        BinaryFormat::Unknown => Err(ParseError::UnknownFormat),
    }
}

/// File contents, memory-mapped when non-empty
pub enum BinarySource {
    Mapped(Mmap),
    Empty,
}

impl BinarySource {
    /// Map a file read-only; files over `max_size` bytes are rejected before mapping
    pub fn open(path: &Path, max_size: u64) -> binlift_core::Result<Self> {
        let file = File::open(path).map_err(|e| binlift_core::Error::io(path, e))?;
        let size = file
            .metadata()
            .map_err(|e| binlift_core::Error::io(path, e))?
            .len();

        if size > max_size {
            return Err(binlift_core::Error::FileTooLarge {
                path: path.to_path_buf(),
                size,
                limit: max_size,
            });
        }
        if size == 0 {
            return Ok(Self::Empty);
        }

        // The mapping is read-only and lives no longer than this value
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| binlift_core::Error::io(path, e))?;
        debug!("Mapped {} ({} bytes)", path.display(), size);
        Ok(Self::Mapped(mmap))
    }
}

impl Deref for BinarySource {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => &mmap[..],
            Self::Empty => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(b"MZ\x90\x00"), BinaryFormat::PE);
        assert_eq!(detect_format(b"\x7FELF"), BinaryFormat::ELF);
        assert_eq!(detect_format(b"\x7FELF\xFF\xFF\xFF"), BinaryFormat::ELF);
        assert_eq!(detect_format(&[0xFE, 0xED, 0xFA, 0xCE]), BinaryFormat::MachO);
        assert_eq!(detect_format(&[0xFE, 0xED, 0xFA, 0xCF]), BinaryFormat::MachO);
        assert_eq!(detect_format(&[0xCE, 0xFA, 0xED, 0xFE]), BinaryFormat::MachO);
        assert_eq!(detect_format(&[0xCF, 0xFA, 0xED, 0xFE, 7, 0, 0, 1]), BinaryFormat::MachO);
        assert_eq!(detect_format(b"PK\x03\x04"), BinaryFormat::ZipBased);
    }

    #[test]
    fn test_detect_unknown_never_fails() {
        assert_eq!(detect_format(b""), BinaryFormat::Unknown);
        assert_eq!(detect_format(b"\x7FEL"), BinaryFormat::Unknown);
        assert_eq!(detect_format(b"MZ"), BinaryFormat::Unknown);
        assert_eq!(detect_format(b"\0\0\0\0"), BinaryFormat::Unknown);
        assert_eq!(detect_format(b"#!/bin/sh"), BinaryFormat::Unknown);
        // Java class files share the universal binary magic
        assert_eq!(detect_format(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 0x34]), BinaryFormat::Unknown);
    }

    #[test]
    fn test_parse_structure_errors() {
        assert!(matches!(parse_structure(b"hello"), Err(ParseError::UnknownFormat)));
        assert!(matches!(
            parse_structure(b"PK\x03\x04rest"),
            Err(ParseError::UnsupportedFormat(BinaryFormat::ZipBased))
        ));
        assert!(parse_structure(b"MZ\0\0").unwrap_err().is_structural());
        assert!(matches!(
            parse_structure(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 0x34]),
            Err(ParseError::UnknownFormat)
        ));
    }

    #[test]
    fn test_binary_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"MZ\0\0payload").unwrap();
        let source = BinarySource::open(file.path(), 1024).unwrap();
        assert_eq!(&source[..2], b"MZ");
        assert_eq!(source.len(), 11);

        assert!(matches!(
            BinarySource::open(file.path(), 4),
            Err(binlift_core::Error::FileTooLarge { size: 11, limit: 4, .. })
        ));

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(BinarySource::open(empty.path(), 1024).unwrap().is_empty());
    }
}
