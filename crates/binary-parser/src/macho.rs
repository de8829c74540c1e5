//! Mach-O format parser for macOS binaries

use binlift_core::{Address, Architecture, BinaryFormat, Platform};
use tracing::{debug, warn};

use crate::common::{fixed_name, BinaryReader, BinaryStructure, Section, SectionFlags, SectionKind};
use crate::error::{ParseError, ParseResult};

/// Mach-O magic numbers, as read big-endian from the first four bytes
const MH_MAGIC: u32 = 0xFEEDFACE; // 32-bit, big endian file
const MH_MAGIC_64: u32 = 0xFEEDFACF; // 64-bit, big endian file
const MH_CIGAM: u32 = 0xCEFAEDFE; // 32-bit, little endian file
const MH_CIGAM_64: u32 = 0xCFFAEDFE; // 64-bit, little endian file
const FAT_MAGIC: u32 = 0xCAFEBABE; // Universal binary

/// CPU types
const CPU_TYPE_I386: u32 = 7;
const CPU_TYPE_X86_64: u32 = 0x01000007;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_ARM64: u32 = 0x0100000C;

/// Load commands
const LC_SEGMENT: u32 = 0x01;
const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x80000028;

/// Segment protection
const VM_PROT_READ: u32 = 0x01;
const VM_PROT_WRITE: u32 = 0x02;
const VM_PROT_EXECUTE: u32 = 0x04;

/// Section attributes
const SECTION_TYPE: u32 = 0x000000ff;
const S_ZEROFILL: u32 = 0x1;
const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x80000000;
const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x00000400;

/// Byte order and class of a thin Mach-O image, from its magic
fn thin_layout(magic: u32) -> Option<(bool, bool)> {
    match magic {
        MH_MAGIC => Some((false, false)),
        MH_MAGIC_64 => Some((true, false)),
        MH_CIGAM => Some((false, true)),
        MH_CIGAM_64 => Some((true, true)),
        _ => None,
    }
}

/// Parse a thin or universal Mach-O file into a `BinaryStructure`
///
/// Linked dylibs are not resolved for Mach-O; `linked_libraries` stays empty.
/// `detect_format` never reports a universal file as Mach-O because Java class
/// files carry the same magic, so those are only parsed through an explicit
/// `parse_structure_as(BinaryFormat::MachO, ..)`.
pub fn parse(data: &[u8]) -> ParseResult<BinaryStructure> {
    let magic = BinaryReader::new(data, false).read_u32()?;

    if magic == FAT_MAGIC {
        return parse_fat_binary(data);
    }

    let (is_64bit, little_endian) = thin_layout(magic).ok_or(ParseError::InvalidMagic {
        expected: MH_MAGIC_64,
        actual: magic,
    })?;
    parse_macho(data, 0, is_64bit, little_endian)
}

fn parse_fat_binary(data: &[u8]) -> ParseResult<BinaryStructure> {
    let mut reader = BinaryReader::new(data, false); // FAT headers are big endian
    let _magic = reader.read_u32()?;
    let nfat_arch = reader.read_u32()?;

    // Prefer the first 64-bit x86/ARM slice, else the first 32-bit one
    let mut best_offset = None;

    for _ in 0..nfat_arch {
        let cputype = reader.read_u32()?;
        let _cpusubtype = reader.read_u32()?;
        let offset = reader.read_u32()?;
        let _size = reader.read_u32()?;
        let _align = reader.read_u32()?;

        match cputype {
            CPU_TYPE_X86_64 | CPU_TYPE_ARM64 => {
                best_offset = Some(offset as usize);
                break;
            }
            CPU_TYPE_I386 | CPU_TYPE_ARM => {
                if best_offset.is_none() {
                    best_offset = Some(offset as usize);
                }
            }
            _ => {}
        }
    }

    let offset = best_offset
        .ok_or_else(|| ParseError::invalid_header("No supported architecture in FAT binary"))?;

    let magic = BinaryReader::new_at(data, offset, false).read_u32()?;
    let (is_64bit, little_endian) = thin_layout(magic).ok_or(ParseError::InvalidMagic {
        expected: MH_MAGIC_64,
        actual: magic,
    })?;

    let mut structure = parse_macho(data, offset, is_64bit, little_endian)?;
    structure.headers.insert("fat_slice_offset".into(), format!("{:#x}", offset));
    Ok(structure)
}

fn parse_macho(
    data: &[u8],
    base_offset: usize,
    is_64bit: bool,
    little_endian: bool,
) -> ParseResult<BinaryStructure> {
    let mut reader = BinaryReader::new_at(data, base_offset, little_endian);

    let _magic = reader.read_u32()?;
    let cputype = reader.read_u32()?;
    let _cpusubtype = reader.read_u32()?;
    let filetype = reader.read_u32()?;
    let ncmds = reader.read_u32()?;
    let _sizeofcmds = reader.read_u32()?;
    let _flags = reader.read_u32()?;

    if is_64bit {
        let _reserved = reader.read_u32()?;
    }

    let architecture = match cputype {
        CPU_TYPE_I386 => Architecture::X86,
        CPU_TYPE_X86_64 => Architecture::X64,
        CPU_TYPE_ARM => Architecture::Arm32,
        CPU_TYPE_ARM64 => Architecture::Arm64,
        _ => Architecture::Unknown,
    };

    let mut state = LoadCommandState::default();
    for i in 0..ncmds {
        match read_load_command(&mut reader, base_offset, &mut state) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!("Mach-O load commands truncated after {} of {}: {}", i, ncmds, e);
                break;
            }
        }
    }

    let entry_point = match state.entry_offset {
        Some(entryoff) => Address::new(state.text_base.wrapping_add(entryoff)),
        None => Address::ZERO,
    };

    let mut structure = BinaryStructure::new(BinaryFormat::MachO, Platform::MacOS);
    structure.architecture = architecture;
    structure.entry_point = entry_point;
    structure.sections = state.sections;
    structure.headers.insert("filetype".into(), filetype.to_string());
    structure.headers.insert("ncmds".into(), ncmds.to_string());
    structure.headers.insert(
        "endianness".into(),
        if little_endian { "little" } else { "big" }.into(),
    );

    debug!("Mach-O: {} sections, entry {}", structure.sections.len(), structure.entry_point);

    Ok(structure)
}

#[derive(Default)]
struct LoadCommandState {
    sections: Vec<Section>,
    text_base: u64,
    entry_offset: Option<u64>,
}

/// Reads one load command; `Ok(false)` stops the walk on a malformed size
fn read_load_command(
    reader: &mut BinaryReader<'_>,
    base_offset: usize,
    state: &mut LoadCommandState,
) -> ParseResult<bool> {
    let cmd_start = reader.offset();
    let cmd = reader.read_u32()?;
    let cmdsize = reader.read_u32()? as usize;
    if cmdsize < 8 {
        return Ok(false);
    }

    match cmd {
        LC_SEGMENT | LC_SEGMENT_64 => {
            let is_64 = cmd == LC_SEGMENT_64;
            let segname = fixed_name(reader.read_bytes(16)?);
            let vmaddr = reader.read_word(is_64)?;
            let _vmsize = reader.read_word(is_64)?;
            let _fileoff = reader.read_word(is_64)?;
            let _filesize = reader.read_word(is_64)?;
            let _maxprot = reader.read_u32()?;
            let initprot = reader.read_u32()?;
            let nsects = reader.read_u32()?;
            let _flags = reader.read_u32()?;

            if segname == "__TEXT" {
                state.text_base = vmaddr;
            }

            for _ in 0..nsects {
                let section = read_section(reader, is_64, &segname, initprot, base_offset)?;
                state.sections.push(section);
            }
        }
        LC_MAIN => {
            state.entry_offset = Some(reader.read_u64()?);
        }
        _ => {}
    }

    reader.set_offset(cmd_start.saturating_add(cmdsize));
    Ok(true)
}

fn read_section(
    reader: &mut BinaryReader<'_>,
    is_64: bool,
    segname: &str,
    initprot: u32,
    base_offset: usize,
) -> ParseResult<Section> {
    let sectname = fixed_name(reader.read_bytes(16)?);
    let _segname = reader.read_bytes(16)?;
    let addr = reader.read_word(is_64)?;
    let size = reader.read_word(is_64)?;
    let offset = reader.read_u32()?;
    let _align = reader.read_u32()?;
    let _reloff = reader.read_u32()?;
    let _nreloc = reader.read_u32()?;
    let sect_flags = reader.read_u32()?;
    let _reserved1 = reader.read_u32()?;
    let _reserved2 = reader.read_u32()?;
    if is_64 {
        let _reserved3 = reader.read_u32()?;
    }

    let mut flags = SectionFlags::empty();
    if initprot & VM_PROT_READ != 0 {
        flags |= SectionFlags::READ;
    }
    if initprot & VM_PROT_WRITE != 0 {
        flags |= SectionFlags::WRITE;
    }
    if initprot & VM_PROT_EXECUTE != 0 {
        flags |= SectionFlags::EXECUTE;
    }
    let has_code = sect_flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0;
    if has_code {
        flags |= SectionFlags::CODE;
    }
    let zerofill = sect_flags & SECTION_TYPE == S_ZEROFILL;
    flags |= if zerofill {
        SectionFlags::UNINITIALIZED
    } else {
        SectionFlags::INITIALIZED
    };

    let kind = match sectname.as_str() {
        "__text" => SectionKind::Code,
        _ if has_code => SectionKind::Code,
        "__cstring" | "__const" | "__data" | "__bss" => SectionKind::Data,
        _ => SectionKind::Unknown,
    };

    Ok(Section {
        name: format!("{},{}", segname, sectname),
        virtual_address: addr,
        virtual_size: size,
        raw_offset: (base_offset as u64).saturating_add(offset as u64),
        raw_size: if zerofill { 0 } else { size },
        flags,
        kind,
    })
}
