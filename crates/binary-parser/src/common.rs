//! Common types shared by the format parsers

use std::collections::BTreeMap;

use binlift_core::{Address, Architecture, BinaryFormat, Platform};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::{ParseError, ParseResult};

/// Unified view of a parsed executable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinaryStructure {
    pub format: BinaryFormat,
    pub architecture: Architecture,
    pub platform: Platform,
    /// Absolute entry point (image base included for PE)
    pub entry_point: Address,
    pub image_base: Address,
    /// Sections in header order; addresses are relative to `image_base`
    pub sections: Vec<Section>,
    /// Directly linked library names, in import-table order
    pub linked_libraries: Vec<String>,
    pub packed: bool,
    pub packer: Option<String>,
    /// Format-specific header values worth reporting
    pub headers: BTreeMap<String, String>,
}

impl BinaryStructure {
    pub fn new(format: BinaryFormat, platform: Platform) -> Self {
        Self {
            format,
            platform,
            ..Default::default()
        }
    }

    /// Find a section by name
    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Sections the disassembler should walk
    pub fn code_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.kind == SectionKind::Code)
    }

    /// Section whose virtual range contains `rva`
    pub fn section_containing(&self, rva: u64) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// Translate a relative virtual address to a file offset
    pub fn rva_to_file_offset(&self, rva: u64) -> Option<u64> {
        self.section_containing(rva)
            .and_then(|s| s.rva_to_file_offset(rva))
    }

    /// Entry point relative to the image base
    pub fn entry_point_rva(&self) -> u64 {
        self.entry_point
            .as_u64()
            .saturating_sub(self.image_base.as_u64())
    }
}

/// Binary section information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Virtual address relative to the image base
    pub virtual_address: u64,
    /// Virtual size
    pub virtual_size: u64,
    /// Raw file offset
    pub raw_offset: u64,
    /// Raw file size
    pub raw_size: u64,
    /// Permission and content flags
    pub flags: SectionFlags,
    /// Best guess at what the section holds
    pub kind: SectionKind,
}

impl Section {
    pub fn contains_rva(&self, rva: u64) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.virtual_size
    }

    /// `raw_offset + (rva - virtual_address)` for any rva inside the virtual range
    pub fn rva_to_file_offset(&self, rva: u64) -> Option<u64> {
        if !self.contains_rva(rva) {
            return None;
        }
        self.raw_offset.checked_add(rva - self.virtual_address)
    }

    pub fn is_executable(&self) -> bool {
        self.flags.contains(SectionFlags::EXECUTE)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(SectionFlags::WRITE)
    }

    /// Raw bytes of the section, clamped to what the file actually holds
    pub fn data<'a>(&self, file: &'a [u8]) -> &'a [u8] {
        let len = file.len() as u64;
        let start = self.raw_offset.min(len);
        let end = self.raw_offset.saturating_add(self.raw_size).min(len);
        &file[start as usize..end as usize]
    }
}

bitflags::bitflags! {
    /// Section flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SectionFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const EXECUTE = 0x0004;
        const CODE = 0x0008;
        const INITIALIZED = 0x0010;
        const UNINITIALIZED = 0x0020;
    }
}

/// Section content guess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionKind {
    Code,
    Data,
    Resources,
    Imports,
    Exports,
    Debug,
    Unknown,
}

/// Helper to read primitives from byte slices
pub struct BinaryReader<'a> {
    data: &'a [u8],
    offset: usize,
    little_endian: bool,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8], little_endian: bool) -> Self {
        Self {
            data,
            offset: 0,
            little_endian,
        }
    }

    pub fn new_at(data: &'a [u8], offset: usize, little_endian: bool) -> Self {
        Self {
            data,
            offset,
            little_endian,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    fn take(&mut self, count: usize) -> ParseResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ParseError::truncated(count, self.remaining()))?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> ParseResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> ParseResult<u16> {
        let bytes = self.take(2)?;
        Ok(if self.little_endian {
            LittleEndian::read_u16(bytes)
        } else {
            BigEndian::read_u16(bytes)
        })
    }

    pub fn read_u32(&mut self) -> ParseResult<u32> {
        let bytes = self.take(4)?;
        Ok(if self.little_endian {
            LittleEndian::read_u32(bytes)
        } else {
            BigEndian::read_u32(bytes)
        })
    }

    pub fn read_u64(&mut self) -> ParseResult<u64> {
        let bytes = self.take(8)?;
        Ok(if self.little_endian {
            LittleEndian::read_u64(bytes)
        } else {
            BigEndian::read_u64(bytes)
        })
    }

    /// Reads a u32 or u64 depending on the file class
    pub fn read_word(&mut self, is_64bit: bool) -> ParseResult<u64> {
        if is_64bit {
            self.read_u64()
        } else {
            Ok(self.read_u32()? as u64)
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> ParseResult<&'a [u8]> {
        self.take(count)
    }

    pub fn skip(&mut self, count: usize) -> ParseResult<()> {
        self.take(count).map(|_| ())
    }
}

/// Null-padded fixed-width name field (PE section names, Mach-O segment names)
pub(crate) fn fixed_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

/// Null-terminated string starting at `offset`, empty when out of range
pub(crate) fn cstring_at(data: &[u8], offset: usize, max_len: usize) -> String {
    if offset >= data.len() {
        return String::new();
    }
    let end = offset.saturating_add(max_len).min(data.len());
    let len = data[offset..end]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(end - offset);
    String::from_utf8_lossy(&data[offset..offset + len]).into_owned()
}
