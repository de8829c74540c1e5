//! Printable string extraction (ASCII and UTF-16LE)

use std::collections::BTreeSet;

use binlift_core::config::StringsConfig;
use binlift_core::BinaryFormat;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::common::BinaryStructure;

static ALL_CONTROL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\x00-\x1F]+$").unwrap());
static ALL_FF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\xFF+$").unwrap());
static HEX_DUMP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Fa-f0-9]{8,}$").unwrap());
static BINARY_DUMP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[01]{8,}$").unwrap());

static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(https?|ftp)://\S+").unwrap());
static REGISTRY_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(HKEY_[A-Z_]+|HKLM|HKCU)\\").unwrap());
static FILE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^[a-z]:\\|^\\\\|^/(usr|etc|bin|lib|tmp|home|var|opt)/|\.(dll|exe|sys|so|dylib)$)")
        .unwrap()
});

/// x86 `push imm32` opcode; a string address often follows it
const PUSH_IMM32: u8 = 0x68;
const REFERENCE_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringEncoding {
    Ascii,
    Utf16Le,
}

/// Coarse guess at what a string names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringKind {
    Url,
    FilePath,
    RegistryKey,
    Unknown,
}

impl StringKind {
    pub fn classify(value: &str) -> Self {
        if URL.is_match(value) {
            StringKind::Url
        } else if REGISTRY_KEY.is_match(value) {
            StringKind::RegistryKey
        } else if FILE_PATH.is_match(value) {
            StringKind::FilePath
        } else {
            StringKind::Unknown
        }
    }
}

/// Bytes surrounding a string that hint at how it is used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringContext {
    /// The byte before the string is zero
    pub null_prefixed: bool,
    /// File offset of a `push imm32` opcode shortly before the string
    pub possible_reference: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedString {
    pub value: String,
    /// File offset of the first byte
    pub offset: u64,
    /// Length in bytes
    pub length: usize,
    pub encoding: StringEncoding,
    pub context: StringContext,
    pub kind: StringKind,
}

/// Printable ASCII runs (0x20..=0x7E) of at least `min_len` bytes
pub fn ascii_runs(data: &[u8], min_len: usize) -> Vec<(usize, String)> {
    let mut runs = Vec::new();
    let mut start = None;

    for (i, &b) in data.iter().enumerate() {
        if (0x20..=0x7E).contains(&b) {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            if i - s >= min_len {
                runs.push((s, String::from_utf8_lossy(&data[s..i]).into_owned()));
            }
        }
    }
    if let Some(s) = start {
        if data.len() - s >= min_len {
            runs.push((s, String::from_utf8_lossy(&data[s..]).into_owned()));
        }
    }
    runs
}

/// UTF-16LE runs of printable ASCII code points, scanned at even offsets
pub fn utf16le_runs(data: &[u8], min_len: usize) -> Vec<(usize, String)> {
    let mut runs = Vec::new();
    let mut current = String::new();
    let mut start = 0usize;

    for (index, pair) in data.chunks_exact(2).enumerate() {
        let code_point = u16::from_le_bytes([pair[0], pair[1]]);
        if (32..=126).contains(&code_point) {
            if current.is_empty() {
                start = index * 2;
            }
            current.push(code_point as u8 as char);
        } else {
            if current.len() >= min_len {
                runs.push((start, std::mem::take(&mut current)));
            }
            current.clear();
        }
    }
    if current.len() >= min_len {
        runs.push((start, current));
    }
    runs
}

/// Sections whose contents are scanned a second time in format-aware mode
fn is_string_section(format: BinaryFormat, name: &str) -> bool {
    match format {
        BinaryFormat::PE => name.starts_with(".rsrc") || name.starts_with(".rdata"),
        BinaryFormat::ELF => name == ".rodata" || name.starts_with(".rodata."),
        BinaryFormat::MachO => name.ends_with(",__cstring") || name.ends_with(",__const"),
        BinaryFormat::ZipBased | BinaryFormat::Unknown => false,
    }
}

/// String extractor with a configurable validity filter
#[derive(Debug, Clone, Default)]
pub struct StringExtractor {
    config: StringsConfig,
}

impl StringExtractor {
    pub fn new(config: StringsConfig) -> Self {
        Self { config }
    }

    /// Sorted, deduplicated strings from the whole file plus format-specific sections
    pub fn extract_strings(&self, data: &[u8], structure: Option<&BinaryStructure>) -> Vec<String> {
        let min_len = self.config.min_length;
        let mut strings = BTreeSet::new();

        let mut collect = |bytes: &[u8]| {
            for (_, value) in ascii_runs(bytes, min_len)
                .into_iter()
                .chain(utf16le_runs(bytes, min_len))
            {
                strings.insert(value);
            }
        };

        collect(data);
        if let Some(structure) = structure {
            for section in structure
                .sections
                .iter()
                .filter(|s| is_string_section(structure.format, &s.name))
            {
                collect(section.data(data));
            }
        }

        strings.into_iter().filter(|s| self.is_valid(s)).collect()
    }

    /// Every valid string with its offset and context, ordered by offset
    pub fn extract_with_context(&self, data: &[u8]) -> Vec<ExtractedString> {
        let min_len = self.config.min_length;

        let ascii = ascii_runs(data, min_len).into_iter().map(|(offset, value)| {
            let length = value.len();
            (offset, value, length, StringEncoding::Ascii)
        });
        let utf16 = utf16le_runs(data, min_len).into_iter().map(|(offset, value)| {
            let length = value.len() * 2;
            (offset, value, length, StringEncoding::Utf16Le)
        });

        let mut strings: Vec<ExtractedString> = ascii
            .chain(utf16)
            .filter(|(_, value, _, _)| self.is_valid(value))
            .map(|(offset, value, length, encoding)| ExtractedString {
                kind: StringKind::classify(&value),
                context: analyze_context(data, offset),
                value,
                offset: offset as u64,
                length,
                encoding,
            })
            .collect();

        strings.sort_by_key(|s| s.offset);
        strings
    }

    /// Rejects noise: wrong length, control or 0xFF runs, low printable ratio, hex or binary dumps
    pub fn is_valid(&self, value: &str) -> bool {
        let len = value.chars().count();
        if len < self.config.min_length || len > self.config.max_length {
            return false;
        }
        if ALL_CONTROL.is_match(value) || ALL_FF.is_match(value) {
            return false;
        }

        let printable = value.chars().filter(|c| (' '..='~').contains(c)).count();
        if (printable as f64 / len as f64) < self.config.min_printable_ratio {
            return false;
        }

        !(HEX_DUMP.is_match(value) || BINARY_DUMP.is_match(value))
    }
}

fn analyze_context(data: &[u8], offset: usize) -> StringContext {
    let window_start = offset.saturating_sub(REFERENCE_WINDOW);
    StringContext {
        null_prefixed: offset > 0 && data[offset - 1] == 0,
        possible_reference: data[window_start..offset]
            .iter()
            .position(|&b| b == PUSH_IMM32)
            .map(|i| (window_start + i) as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn test_ascii_runs() {
        let data = b"\x00\x01Hello\x00abc\x00World!!";
        let runs = ascii_runs(data, 4);
        assert_eq!(runs, vec![(2, "Hello".to_string()), (12, "World!!".to_string())]);
    }

    #[test]
    fn test_utf16_runs() {
        let mut data = vec![0u8, 0];
        data.extend(utf16("Config"));
        data.extend([0, 0]);
        data.extend(utf16("ab"));
        let runs = utf16le_runs(&data, 4);
        assert_eq!(runs, vec![(2, "Config".to_string())]);
    }

    #[test]
    fn test_extract_strings_sorted_and_deduplicated() {
        let mut data = b"zeta\0alpha\0zeta\0\x01\x02".to_vec();
        data.extend(utf16("alpha"));
        let extractor = StringExtractor::default();
        assert_eq!(extractor.extract_strings(&data, None), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_validity_filter() {
        let extractor = StringExtractor::default();
        assert!(extractor.is_valid("kernel32.dll"));
        assert!(!extractor.is_valid("abc"));
        assert!(!extractor.is_valid("DEADBEEF00"));
        assert!(!extractor.is_valid("0101010101"));
        assert!(!extractor.is_valid("\u{1}\u{2}\u{3}\u{4}"));
        assert!(!extractor.is_valid("\u{ff}\u{ff}\u{ff}\u{ff}"));
        assert!(!extractor.is_valid(&"x".repeat(1001)));
        // A short hex-looking run is still text
        assert!(extractor.is_valid("cafe"));
    }

    #[test]
    fn test_context_flags() {
        let mut data = vec![0x90u8; 8];
        data[2] = PUSH_IMM32;
        data.push(0);
        data.extend_from_slice(b"Hello World");
        let strings = StringExtractor::default().extract_with_context(&data);
        let hello = strings.iter().find(|s| s.value == "Hello World").unwrap();
        assert_eq!(hello.offset, 9);
        assert_eq!(hello.encoding, StringEncoding::Ascii);
        assert!(hello.context.null_prefixed);
        assert_eq!(hello.context.possible_reference, Some(2));
    }

    #[test]
    fn test_context_list_is_offset_ordered() {
        let mut data = utf16("WideString");
        data.extend_from_slice(b"\0\0narrow text\0");
        let strings = StringExtractor::default().extract_with_context(&data);
        let offsets: Vec<u64> = strings.iter().map(|s| s.offset).collect();
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);
        assert_eq!(strings[0].encoding, StringEncoding::Utf16Le);
        assert_eq!(strings[0].length, 20);
    }

    #[test]
    fn test_string_kind() {
        assert_eq!(StringKind::classify("https://example.com/a"), StringKind::Url);
        assert_eq!(StringKind::classify("C:\\Windows\\system32"), StringKind::FilePath);
        assert_eq!(StringKind::classify("HKEY_LOCAL_MACHINE\\Software"), StringKind::RegistryKey);
        assert_eq!(StringKind::classify("user32.dll"), StringKind::FilePath);
        assert_eq!(StringKind::classify("hello"), StringKind::Unknown);
    }
}
