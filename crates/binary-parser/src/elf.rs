//! ELF (Executable and Linkable Format) parser for Linux binaries

use binlift_core::{Address, Architecture, BinaryFormat, Platform};
use tracing::{debug, warn};

use crate::common::{cstring_at, BinaryReader, BinaryStructure, Section, SectionFlags, SectionKind};
use crate::error::{ParseError, ParseResult};

/// ELF magic
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF classes
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;

/// ELF endianness
const ELFDATA2LSB: u8 = 1; // Little endian
const ELFDATA2MSB: u8 = 2; // Big endian

/// ELF machine types
const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// Section flags
const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

/// Section types
const SHT_NOBITS: u32 = 8;

const MAX_SECTION_NAME: usize = 256;

struct RawSection {
    name: u32,
    kind: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
}

/// Parse an ELF file into a `BinaryStructure`
///
/// Linked libraries are not resolved for ELF; `linked_libraries` stays empty.
pub fn parse(data: &[u8]) -> ParseResult<BinaryStructure> {
    if data.len() < 16 {
        return Err(ParseError::truncated(16, data.len()));
    }

    // Check magic
    if data[0..4] != ELF_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u32::from_le_bytes(ELF_MAGIC),
            actual: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        });
    }

    let elf_class = data[4];
    let is_64bit = match elf_class {
        ELFCLASS32 => false,
        ELFCLASS64 => true,
        _ => return Err(ParseError::invalid_header(format!("Invalid ELF class: {}", elf_class))),
    };

    let elf_data = data[5];
    let little_endian = match elf_data {
        ELFDATA2LSB => true,
        ELFDATA2MSB => false,
        _ => return Err(ParseError::invalid_header(format!("Invalid ELF data encoding: {}", elf_data))),
    };

    let mut reader = BinaryReader::new_at(data, 16, little_endian);

    let e_type = reader.read_u16()?;
    let e_machine = reader.read_u16()?;
    let _e_version = reader.read_u32()?;
    let e_entry = reader.read_word(is_64bit)?;
    let _e_phoff = reader.read_word(is_64bit)?;
    let e_shoff = reader.read_word(is_64bit)?;
    let _e_flags = reader.read_u32()?;
    let _e_ehsize = reader.read_u16()?;
    let _e_phentsize = reader.read_u16()?;
    let _e_phnum = reader.read_u16()?;
    let e_shentsize = reader.read_u16()?;
    let e_shnum = reader.read_u16()?;
    let e_shstrndx = reader.read_u16()?;

    let architecture = match e_machine {
        EM_386 => Architecture::X86,
        EM_X86_64 => Architecture::X64,
        EM_ARM => Architecture::Arm32,
        EM_AARCH64 => Architecture::Arm64,
        _ => Architecture::Unknown,
    };

    let raw_sections = read_section_headers(&mut reader, is_64bit, e_shoff, e_shentsize, e_shnum);

    // Resolve section names through the section header string table
    let strtab = raw_sections
        .get(e_shstrndx as usize)
        .map(|s| (s.offset, s.size));

    let sections = raw_sections
        .iter()
        .map(|raw| {
            let name = match strtab {
                Some((offset, size)) if (raw.name as u64) < size => cstring_at(
                    data,
                    offset.saturating_add(raw.name as u64) as usize,
                    MAX_SECTION_NAME,
                ),
                _ => String::new(),
            };
            to_section(name, raw)
        })
        .collect::<Vec<_>>();

    let mut structure = BinaryStructure::new(BinaryFormat::ELF, Platform::Linux);
    structure.architecture = architecture;
    structure.entry_point = Address::new(e_entry);
    structure.sections = sections;
    structure.headers.insert("class".into(), if is_64bit { "ELF64" } else { "ELF32" }.into());
    structure.headers.insert(
        "endianness".into(),
        if little_endian { "little" } else { "big" }.into(),
    );
    structure.headers.insert("e_type".into(), e_type.to_string());
    structure.headers.insert("e_machine".into(), e_machine.to_string());

    debug!("ELF: {} sections, entry {}", structure.sections.len(), structure.entry_point);

    Ok(structure)
}

fn read_section_headers(
    reader: &mut BinaryReader<'_>,
    is_64bit: bool,
    sh_offset: u64,
    sh_entsize: u16,
    sh_num: u16,
) -> Vec<RawSection> {
    let mut raw_sections = Vec::with_capacity(sh_num as usize);
    if sh_num == 0 || sh_offset == 0 {
        return raw_sections;
    }

    for i in 0..sh_num as usize {
        let offset = (sh_offset as usize).saturating_add(i * sh_entsize as usize);
        reader.set_offset(offset);
        match read_section_header(reader, is_64bit) {
            Ok(raw) => raw_sections.push(raw),
            Err(e) => {
                warn!("ELF section table truncated after {} of {} entries: {}", i, sh_num, e);
                break;
            }
        }
    }
    raw_sections
}

fn read_section_header(reader: &mut BinaryReader<'_>, is_64bit: bool) -> ParseResult<RawSection> {
    let name = reader.read_u32()?;
    let kind = reader.read_u32()?;
    let flags = reader.read_word(is_64bit)?;
    let addr = reader.read_word(is_64bit)?;
    let offset = reader.read_word(is_64bit)?;
    let size = reader.read_word(is_64bit)?;
    Ok(RawSection {
        name,
        kind,
        flags,
        addr,
        offset,
        size,
    })
}

fn to_section(name: String, raw: &RawSection) -> Section {
    let mut flags = SectionFlags::empty();
    if raw.flags & SHF_ALLOC != 0 {
        flags |= SectionFlags::READ;
    }
    if raw.flags & SHF_WRITE != 0 {
        flags |= SectionFlags::WRITE;
    }
    if raw.flags & SHF_EXECINSTR != 0 {
        flags |= SectionFlags::EXECUTE | SectionFlags::CODE;
    }
    if raw.kind == SHT_NOBITS {
        flags |= SectionFlags::UNINITIALIZED;
    } else if raw.flags & SHF_ALLOC != 0 {
        flags |= SectionFlags::INITIALIZED;
    }

    let kind = if raw.flags & SHF_EXECINSTR != 0 {
        SectionKind::Code
    } else if name == ".rodata" || name == ".data" || name == ".bss" {
        SectionKind::Data
    } else if name.starts_with(".debug") {
        SectionKind::Debug
    } else if name == ".dynsym" || name == ".dynstr" {
        SectionKind::Imports
    } else {
        SectionKind::Unknown
    };

    // NOBITS sections occupy no file space
    let raw_size = if raw.kind == SHT_NOBITS { 0 } else { raw.size };

    Section {
        name,
        virtual_address: raw.addr,
        virtual_size: raw.size,
        raw_offset: raw.offset,
        raw_size,
        flags,
        kind,
    }
}
