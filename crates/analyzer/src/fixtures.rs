//! Synthetic PE images for unit tests

const TEXT: u32 = 0x6000_0020;
const IDATA: u32 = 0xC000_0040;

/// PE32 with `.text` holding `push eax; ret` and, when `imports` is non-empty,
/// an `.idata` section at rva 0x3000 naming them
pub(crate) fn pe_image(imports: &[&str]) -> Vec<u8> {
    let mut code = vec![0u8; 0x100];
    code[0] = 0x50;
    code[1] = 0xC3;

    let mut sections = vec![(".text", 0x1000u32, 0x200u32, TEXT, code)];
    if !imports.is_empty() {
        sections.push((".idata", 0x3000, 0x400, IDATA, idata(imports)));
    }

    let mut file = vec![0u8; 0x200];
    file[0] = b'M';
    file[1] = b'Z';
    file[0x3C] = 0x80;
    file[0x80..0x84].copy_from_slice(b"PE\0\0");
    file[0x84..0x86].copy_from_slice(&0x014Cu16.to_le_bytes());
    file[0x86..0x88].copy_from_slice(&(sections.len() as u16).to_le_bytes());
    file[0x94..0x96].copy_from_slice(&0xE0u16.to_le_bytes());

    let opt = 0x98;
    file[opt..opt + 2].copy_from_slice(&0x10Bu16.to_le_bytes());
    file[opt + 16..opt + 20].copy_from_slice(&0x1000u32.to_le_bytes());
    file[opt + 28..opt + 32].copy_from_slice(&0x40_0000u32.to_le_bytes());
    file[opt + 92..opt + 96].copy_from_slice(&16u32.to_le_bytes());

    let mut table = opt + 0xE0;
    for (name, va, raw, characteristics, bytes) in &sections {
        let size = bytes.len() as u32;
        file[table..table + name.len()].copy_from_slice(name.as_bytes());
        file[table + 8..table + 12].copy_from_slice(&size.to_le_bytes());
        file[table + 12..table + 16].copy_from_slice(&va.to_le_bytes());
        file[table + 16..table + 20].copy_from_slice(&size.to_le_bytes());
        file[table + 20..table + 24].copy_from_slice(&raw.to_le_bytes());
        file[table + 36..table + 40].copy_from_slice(&characteristics.to_le_bytes());
        table += 40;
    }

    for (_, _, raw, _, bytes) in &sections {
        let start = *raw as usize;
        let end = start + bytes.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(bytes);
    }
    file
}

/// Import descriptors followed by the DLL names they point at
fn idata(names: &[&str]) -> Vec<u8> {
    let mut bytes = vec![0u8; 0x100];
    let mut name_offset = (names.len() + 1) * 20;
    for (i, name) in names.iter().enumerate() {
        let descriptor = i * 20;
        let rva = 0x3000 + name_offset as u32;
        bytes[descriptor + 12..descriptor + 16].copy_from_slice(&rva.to_le_bytes());
        bytes[name_offset..name_offset + name.len()].copy_from_slice(name.as_bytes());
        name_offset += name.len() + 1;
    }
    bytes
}
