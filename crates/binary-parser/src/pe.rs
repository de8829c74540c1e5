//! PE (Portable Executable) format parser for Windows binaries

use binlift_core::{Address, Architecture, BinaryFormat, Platform};
use scroll::{Pread, LE};
use tracing::{debug, warn};

use crate::common::{cstring_at, fixed_name, BinaryReader, BinaryStructure, Section, SectionFlags, SectionKind};
use crate::error::{ParseError, ParseResult};

/// DOS header magic
const DOS_MAGIC: u16 = 0x5A4D; // "MZ"

/// Offset of e_lfanew in the DOS header
const E_LFANEW_OFFSET: usize = 0x3C;

/// PE signature
const PE_SIGNATURE: u32 = 0x00004550; // "PE\0\0"

/// PE machine types
const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_MACHINE_ARM: u16 = 0x01c0;
const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01c4;
const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

/// PE optional header magic
const PE32_MAGIC: u16 = 0x10b;
const PE32PLUS_MAGIC: u16 = 0x20b;

/// Section characteristics
const IMAGE_SCN_CNT_CODE: u32 = 0x00000020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x00000040;
const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x00000080;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x20000000;
const IMAGE_SCN_MEM_READ: u32 = 0x40000000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x80000000;

const SECTION_HEADER_SIZE: usize = 40;
const IMPORT_DESCRIPTOR_SIZE: usize = 20;
const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
const MAX_DLL_NAME: usize = 256;
const MAX_IMPORT_DESCRIPTORS: usize = 4096;

/// Section names left behind by well-known packers
const PACKER_SECTIONS: &[&str] = &["UPX0", "UPX1", ".aspack", ".adata", "MEW", ".mew", ".vmp"];

#[derive(Debug, Clone, Copy, Pread)]
struct CoffHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    _pointer_to_symbol_table: u32,
    _number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[derive(Debug, Clone, Copy, Pread)]
struct SectionHeader {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    _pointer_to_relocations: u32,
    _pointer_to_linenumbers: u32,
    _number_of_relocations: u16,
    _number_of_linenumbers: u16,
    characteristics: u32,
}

#[derive(Debug, Clone, Copy, Pread)]
struct ImportDescriptor {
    original_first_thunk: u32,
    _time_date_stamp: u32,
    _forwarder_chain: u32,
    name: u32,
    first_thunk: u32,
}

impl ImportDescriptor {
    fn is_null(&self) -> bool {
        self.original_first_thunk == 0 && self.name == 0 && self.first_thunk == 0
    }
}

/// Fields of the optional header the pipeline reports on
#[derive(Debug, Clone, Default)]
struct OptionalHeader {
    magic: u16,
    address_of_entry_point: u32,
    image_base: u64,
    size_of_image: u32,
    subsystem: u16,
    dll_characteristics: u16,
    data_directories: Vec<(u32, u32)>,
}

impl OptionalHeader {
    fn is_64bit(&self) -> bool {
        self.magic == PE32PLUS_MAGIC
    }

    fn data_directory(&self, index: usize) -> Option<(u32, u32)> {
        self.data_directories
            .get(index)
            .copied()
            .filter(|(rva, _)| *rva != 0)
    }

    fn parse(data: &[u8], offset: usize, size: usize) -> ParseResult<Self> {
        let mut reader = BinaryReader::new_at(data, offset, true);
        let magic = reader.read_u16()?;
        if magic != PE32_MAGIC && magic != PE32PLUS_MAGIC {
            return Err(ParseError::invalid_header(format!(
                "Invalid optional header magic: {:#x}",
                magic
            )));
        }
        let is_64bit = magic == PE32PLUS_MAGIC;

        reader.skip(2)?; // MajorLinkerVersion, MinorLinkerVersion
        reader.skip(12)?; // SizeOfCode, SizeOfInitializedData, SizeOfUninitializedData
        let address_of_entry_point = reader.read_u32()?;
        reader.skip(4)?; // BaseOfCode
        if !is_64bit {
            reader.skip(4)?; // BaseOfData (PE32 only)
        }
        let image_base = reader.read_word(is_64bit)?;
        reader.skip(8)?; // SectionAlignment, FileAlignment
        reader.skip(12)?; // OS, image and subsystem versions
        reader.skip(4)?; // Win32VersionValue
        let size_of_image = reader.read_u32()?;
        reader.skip(8)?; // SizeOfHeaders, CheckSum
        let subsystem = reader.read_u16()?;
        let dll_characteristics = reader.read_u16()?;

        let mut header = Self {
            magic,
            address_of_entry_point,
            image_base,
            size_of_image,
            subsystem,
            dll_characteristics,
            data_directories: Vec::new(),
        };

        // Data directories are optional; a short header simply has fewer of them
        match read_data_directories(&mut reader, is_64bit, offset.saturating_add(size)) {
            Ok(dirs) => header.data_directories = dirs,
            Err(e) => debug!("PE data directories unreadable: {}", e),
        }

        Ok(header)
    }
}

fn read_data_directories(
    reader: &mut BinaryReader<'_>,
    is_64bit: bool,
    end: usize,
) -> ParseResult<Vec<(u32, u32)>> {
    reader.skip(if is_64bit { 32 } else { 16 })?; // stack and heap sizes
    reader.skip(4)?; // LoaderFlags
    let count = reader.read_u32()?.min(16) as usize;
    let mut dirs = Vec::with_capacity(count);
    for _ in 0..count {
        if reader.offset() + 8 > end {
            break;
        }
        dirs.push((reader.read_u32()?, reader.read_u32()?));
    }
    Ok(dirs)
}

/// Parse a PE file into a `BinaryStructure`
pub fn parse(data: &[u8]) -> ParseResult<BinaryStructure> {
    let mut reader = BinaryReader::new(data, true);

    // Parse DOS header
    let dos_magic = reader.read_u16()?;
    if dos_magic != DOS_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: DOS_MAGIC as u32,
            actual: dos_magic as u32,
        });
    }

    reader.set_offset(E_LFANEW_OFFSET);
    let pe_offset = reader.read_u32()? as usize;

    // Parse PE signature
    reader.set_offset(pe_offset);
    let pe_sig = reader.read_u32()?;
    if pe_sig != PE_SIGNATURE {
        return Err(ParseError::InvalidMagic {
            expected: PE_SIGNATURE,
            actual: pe_sig,
        });
    }

    let coff_offset = reader.offset();
    let coff: CoffHeader = data.pread_with(coff_offset, LE)?;
    let optional_offset = coff_offset + 20;
    let optional_size = coff.size_of_optional_header as usize;

    let optional = if optional_size >= 2 {
        OptionalHeader::parse(data, optional_offset, optional_size)?
    } else {
        OptionalHeader::default()
    };

    let architecture = match coff.machine {
        IMAGE_FILE_MACHINE_I386 => Architecture::X86,
        IMAGE_FILE_MACHINE_AMD64 => Architecture::X64,
        IMAGE_FILE_MACHINE_ARM | IMAGE_FILE_MACHINE_ARMNT => Architecture::Arm32,
        IMAGE_FILE_MACHINE_ARM64 => Architecture::Arm64,
        _ if optional.is_64bit() => Architecture::X64,
        _ => Architecture::X86,
    };

    let mut structure = BinaryStructure::new(BinaryFormat::PE, Platform::Windows);
    structure.architecture = architecture;
    structure.image_base = Address::new(optional.image_base);
    structure.entry_point =
        Address::new(optional.image_base.wrapping_add(optional.address_of_entry_point as u64));
    structure.sections = parse_sections(data, optional_offset + optional_size, coff.number_of_sections);

    structure.linked_libraries = match parse_imports(data, &structure, &optional) {
        Ok(imports) => imports,
        Err(e) => {
            warn!("PE import table unreadable, continuing without imports: {}", e);
            Vec::new()
        }
    };

    if let Some(packer) = detect_packer(&structure.sections) {
        structure.packed = true;
        structure.packer = Some(packer);
    }

    let headers = &mut structure.headers;
    headers.insert("machine".into(), format!("{:#06x}", coff.machine));
    headers.insert("number_of_sections".into(), coff.number_of_sections.to_string());
    headers.insert("time_date_stamp".into(), coff.time_date_stamp.to_string());
    headers.insert("characteristics".into(), format!("{:#06x}", coff.characteristics));
    headers.insert("optional_magic".into(), format!("{:#x}", optional.magic));
    headers.insert("is_64bit".into(), optional.is_64bit().to_string());
    headers.insert("image_base".into(), format!("{:#x}", optional.image_base));
    headers.insert("size_of_image".into(), format!("{:#x}", optional.size_of_image));
    headers.insert("subsystem".into(), optional.subsystem.to_string());
    headers.insert("dll_characteristics".into(), format!("{:#06x}", optional.dll_characteristics));
    if !(3..=10).contains(&coff.number_of_sections) {
        headers.insert("suspicious_section_count".into(), "true".into());
    }

    debug!(
        "PE: {} sections, {} imports, entry {}",
        structure.sections.len(),
        structure.linked_libraries.len(),
        structure.entry_point
    );

    Ok(structure)
}

/// Section headers follow the optional header; a truncated table yields the sections that fit
fn parse_sections(data: &[u8], table_offset: usize, count: u16) -> Vec<Section> {
    let mut sections = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let offset = table_offset + i * SECTION_HEADER_SIZE;
        let header: SectionHeader = match data.pread_with(offset, LE) {
            Ok(header) => header,
            Err(e) => {
                warn!("PE section table truncated after {} of {} entries: {}", i, count, e);
                break;
            }
        };
        let name = fixed_name(&header.name);
        let flags = section_flags(header.characteristics);
        let kind = section_kind(&name, header.characteristics);
        sections.push(Section {
            name,
            virtual_address: header.virtual_address as u64,
            virtual_size: header.virtual_size as u64,
            raw_offset: header.pointer_to_raw_data as u64,
            raw_size: header.size_of_raw_data as u64,
            flags,
            kind,
        });
    }
    sections
}

fn section_flags(characteristics: u32) -> SectionFlags {
    let mut flags = SectionFlags::empty();
    if characteristics & IMAGE_SCN_CNT_CODE != 0 {
        flags |= SectionFlags::CODE;
    }
    if characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
        flags |= SectionFlags::INITIALIZED;
    }
    if characteristics & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
        flags |= SectionFlags::UNINITIALIZED;
    }
    if characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
        flags |= SectionFlags::EXECUTE;
    }
    if characteristics & IMAGE_SCN_MEM_READ != 0 {
        flags |= SectionFlags::READ;
    }
    if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
        flags |= SectionFlags::WRITE;
    }
    flags
}

fn section_kind(name: &str, characteristics: u32) -> SectionKind {
    if name == ".text" || characteristics & IMAGE_SCN_CNT_CODE != 0 {
        SectionKind::Code
    } else if name == ".data" || name == ".bss" {
        SectionKind::Data
    } else if name == ".rsrc" {
        SectionKind::Resources
    } else if name == ".idata" {
        SectionKind::Imports
    } else if name == ".edata" {
        SectionKind::Exports
    } else if name.contains("debug") {
        SectionKind::Debug
    } else {
        SectionKind::Unknown
    }
}

/// Walk the import descriptor array until the zero name-RVA sentinel
fn parse_imports(
    data: &[u8],
    structure: &BinaryStructure,
    optional: &OptionalHeader,
) -> ParseResult<Vec<String>> {
    let table_offset = optional
        .data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT)
        .and_then(|(rva, _)| structure.rva_to_file_offset(rva as u64))
        .or_else(|| structure.find_section(".idata").map(|s| s.raw_offset));

    let Some(table_offset) = table_offset else {
        return Ok(Vec::new());
    };

    let mut imports = Vec::new();
    for i in 0..MAX_IMPORT_DESCRIPTORS {
        let offset = table_offset as usize + i * IMPORT_DESCRIPTOR_SIZE;
        let descriptor: ImportDescriptor = data.pread_with(offset, LE)?;
        if descriptor.name == 0 || descriptor.is_null() {
            break;
        }
        // Names outside every section are read as if the headers were mapped 1:1
        let name_offset = structure
            .rva_to_file_offset(descriptor.name as u64)
            .unwrap_or(descriptor.name as u64);
        let name = cstring_at(data, name_offset as usize, MAX_DLL_NAME);
        if !name.is_empty() {
            imports.push(name);
        }
    }
    Ok(imports)
}

fn detect_packer(sections: &[Section]) -> Option<String> {
    if let Some(section) = sections
        .iter()
        .find(|s| PACKER_SECTIONS.contains(&s.name.as_str()))
    {
        return Some(format!("Known Packer: {}", section.name));
    }

    let total: u64 = sections.iter().map(|s| s.raw_size).sum();
    let text = sections.iter().find(|s| s.name == ".text")?;
    if total > 0 && text.raw_size as f64 / total as f64 > 0.8 {
        return Some("Unknown Packer (High code ratio)".to_string());
    }
    None
}
