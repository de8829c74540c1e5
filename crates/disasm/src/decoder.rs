//! Table-driven x86/x64 instruction decoding
//!
//! Only a practical subset of the encoding space is modeled. Anything else,
//! including truncated encodings, decodes as a one-byte `db` so that callers
//! can always make forward progress.

use binlift_core::Architecture;

use crate::instruction::{Instruction, InstructionType};

const REG32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];

const REG64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

/// `Jcc` condition suffixes in opcode order (0x70..=0x7F, 0x0F 0x80..=0x8F)
const CONDITIONS: [&str; 16] = [
    "jo", "jno", "jb", "jae", "je", "jne", "jbe", "ja", "js", "jns", "jp", "jnp", "jl", "jge", "jle",
    "jg",
];

/// Group-1 arithmetic selected by ModRM.reg for opcodes 0x81/0x83
const GROUP1: [(&str, InstructionType); 8] = [
    ("add", InstructionType::Arithmetic),
    ("or", InstructionType::Logical),
    ("adc", InstructionType::Arithmetic),
    ("sbb", InstructionType::Arithmetic),
    ("and", InstructionType::Logical),
    ("sub", InstructionType::Arithmetic),
    ("xor", InstructionType::Logical),
    ("cmp", InstructionType::Arithmetic),
];

/// Per-architecture instruction decoder
pub trait InstructionDecoder: Send + Sync {
    fn architecture(&self) -> Architecture;

    /// Function prolog byte patterns used to seed function starts
    fn prologs(&self) -> &[&'static [u8]];

    /// Decode one instruction at the start of `data`, located at `address`.
    /// Returns `None` only when `data` is empty.
    fn decode(&self, data: &[u8], address: u64) -> Option<Instruction>;
}

/// Decoder for the given architecture, if one exists
pub fn decoder_for(architecture: Architecture) -> Option<Box<dyn InstructionDecoder>> {
    match architecture {
        Architecture::X86 | Architecture::X64 => {
            Some(Box::new(X86Decoder::new(architecture.is_64bit())))
        }
        Architecture::Arm32 | Architecture::Arm64 | Architecture::Unknown => None,
    }
}

/// Whether `name` is a general-purpose register name the decoder emits
pub fn is_register(name: &str) -> bool {
    REG32.contains(&name) || REG64.contains(&name)
}

const X86_PROLOGS: &[&[u8]] = &[
    &[0x55, 0x8B, 0xEC], // push ebp; mov ebp, esp
    &[0x55, 0x89, 0xE5], // push ebp; mov ebp, esp (AT&T encoding)
];

const X64_PROLOGS: &[&[u8]] = &[
    &[0x48, 0x8B, 0xEC],       // mov rbp, rsp
    &[0x48, 0x8B, 0xE5],       // mov rsp, rbp
    &[0x55, 0x48, 0x89, 0xE5], // push rbp; mov rbp, rsp
];

/// x86 decoder; in 64-bit mode REX prefixes select extended and 64-bit registers
#[derive(Debug, Clone, Copy)]
pub struct X86Decoder {
    long_mode: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: bool,
    b: bool,
}

impl Rex {
    fn from_byte(byte: u8) -> Self {
        Self {
            w: byte & 0x08 != 0,
            r: byte & 0x04 != 0,
            b: byte & 0x01 != 0,
        }
    }
}

/// Register-direct ModRM operands (mod == 11)
struct RegisterPair {
    reg: usize,
    rm: usize,
}

impl X86Decoder {
    pub fn new(long_mode: bool) -> Self {
        Self { long_mode }
    }

    fn reg_name(&self, index: usize, wide: bool) -> String {
        if wide {
            REG64[index & 0xF].to_string()
        } else {
            REG32[index & 0xF].to_string()
        }
    }

    /// Registers used by push/pop are always full width
    fn stack_reg(&self, index: usize) -> String {
        self.reg_name(index, self.long_mode)
    }

    fn target(&self, next: u64, displacement: i64) -> String {
        let target = next.wrapping_add_signed(displacement);
        let target = if self.long_mode {
            target
        } else {
            target & 0xFFFF_FFFF
        };
        format!("0x{:08X}", target)
    }

    fn decode_inner(&self, data: &[u8], address: u64) -> Option<Instruction> {
        let mut pos = 0;
        let mut rex = Rex::default();
        if self.long_mode && (0x40..=0x4F).contains(data.first()?) {
            rex = Rex::from_byte(data[0]);
            pos = 1;
        }

        let opcode = *data.get(pos)?;
        pos += 1;

        let ins = |len: usize, mnemonic: &str, operands: Vec<String>, kind| {
            Some(Instruction::new(address, mnemonic, operands, &data[..len], kind))
        };

        match opcode {
            0x50..=0x57 => {
                let reg = self.stack_reg((opcode - 0x50) as usize | (rex.b as usize) << 3);
                ins(pos, "push", vec![reg], InstructionType::Memory)
            }
            0x58..=0x5F => {
                let reg = self.stack_reg((opcode - 0x58) as usize | (rex.b as usize) << 3);
                ins(pos, "pop", vec![reg], InstructionType::Memory)
            }
            0x68 => {
                let imm = read_u32(data, pos)?;
                ins(pos + 4, "push", vec![format!("0x{:08X}", imm)], InstructionType::Memory)
            }
            0x6A => {
                let imm = *data.get(pos)?;
                ins(pos + 1, "push", vec![format!("0x{:02X}", imm)], InstructionType::Memory)
            }
            0x70..=0x7F => {
                let rel = *data.get(pos)? as i8;
                let len = pos + 1;
                let target = self.target(address.wrapping_add(len as u64), rel as i64);
                ins(len, CONDITIONS[(opcode - 0x70) as usize], vec![target], InstructionType::ControlFlow)
            }
            0x0F => self.decode_two_byte(data, address, pos),
            0x31 | 0x33 | 0x85 | 0x89 | 0x8B => {
                let pair = register_pair(data, pos, rex)?;
                let dst_src = |reversed: bool| {
                    let reg = self.reg_name(pair.reg, rex.w);
                    let rm = self.reg_name(pair.rm, rex.w);
                    if reversed {
                        vec![reg, rm]
                    } else {
                        vec![rm, reg]
                    }
                };
                let (mnemonic, operands, kind) = match opcode {
                    0x31 => ("xor", dst_src(false), InstructionType::Logical),
                    0x33 => ("xor", dst_src(true), InstructionType::Logical),
                    0x85 => ("test", dst_src(false), InstructionType::Logical),
                    0x89 => ("mov", dst_src(false), InstructionType::Memory),
                    _ => ("mov", dst_src(true), InstructionType::Memory),
                };
                ins(pos + 1, mnemonic, operands, kind)
            }
            0x81 | 0x83 => {
                let pair = register_pair(data, pos, rex)?;
                let (mnemonic, kind) = GROUP1[pair.reg & 0x7];
                let dst = self.reg_name(pair.rm, rex.w);
                let (imm, len) = if opcode == 0x83 {
                    (format!("0x{:02X}", data.get(pos + 1)?), pos + 2)
                } else {
                    (format!("0x{:08X}", read_u32(data, pos + 1)?), pos + 5)
                };
                ins(len, mnemonic, vec![dst, imm], kind)
            }
            0x90 => ins(pos, "nop", vec![], InstructionType::Unknown),
            0xB8..=0xBF => {
                let reg = self.reg_name((opcode - 0xB8) as usize | (rex.b as usize) << 3, rex.w);
                let (imm, len) = if rex.w {
                    (read_u64(data, pos)?, pos + 8)
                } else {
                    (read_u32(data, pos)? as u64, pos + 4)
                };
                ins(len, "mov", vec![reg, format!("0x{:08X}", imm)], InstructionType::Memory)
            }
            0xC2 => {
                let imm = u16::from_le_bytes([*data.get(pos)?, *data.get(pos + 1)?]);
                ins(pos + 2, "ret", vec![format!("0x{:04X}", imm)], InstructionType::ControlFlow)
            }
            0xC3 => ins(pos, "ret", vec![], InstructionType::ControlFlow),
            0xC9 => ins(pos, "leave", vec![], InstructionType::Memory),
            0xCC => ins(pos, "int3", vec![], InstructionType::System),
            0xCD => {
                let vector = *data.get(pos)?;
                ins(pos + 1, "int", vec![format!("0x{:02X}", vector)], InstructionType::System)
            }
            0xE8 | 0xE9 => {
                let rel = read_u32(data, pos)? as i32;
                let len = pos + 4;
                let target = self.target(address.wrapping_add(len as u64), rel as i64);
                let mnemonic = if opcode == 0xE8 { "call" } else { "jmp" };
                ins(len, mnemonic, vec![target], InstructionType::ControlFlow)
            }
            0xEB => {
                let rel = *data.get(pos)? as i8;
                let len = pos + 1;
                let target = self.target(address.wrapping_add(len as u64), rel as i64);
                ins(len, "jmp", vec![target], InstructionType::ControlFlow)
            }
            0xF4 => ins(pos, "hlt", vec![], InstructionType::System),
            0xFF => {
                let pair = register_pair(data, pos, rex)?;
                let mnemonic = match pair.reg & 0x7 {
                    2 => "call",
                    4 => "jmp",
                    _ => return None,
                };
                let target = self.reg_name(pair.rm, self.long_mode);
                ins(pos + 1, mnemonic, vec![target], InstructionType::ControlFlow)
            }
            _ => None,
        }
    }

    fn decode_two_byte(&self, data: &[u8], address: u64, pos: usize) -> Option<Instruction> {
        let opcode = *data.get(pos)?;
        let pos = pos + 1;
        match opcode {
            0x80..=0x8F => {
                let rel = read_u32(data, pos)? as i32;
                let len = pos + 4;
                let target = self.target(address.wrapping_add(len as u64), rel as i64);
                Some(Instruction::new(
                    address,
                    CONDITIONS[(opcode - 0x80) as usize],
                    vec![target],
                    &data[..len],
                    InstructionType::ControlFlow,
                ))
            }
            0x31 => Some(Instruction::new(address, "rdtsc", vec![], &data[..pos], InstructionType::System)),
            0xA2 => Some(Instruction::new(address, "cpuid", vec![], &data[..pos], InstructionType::System)),
            _ => None,
        }
    }
}

impl InstructionDecoder for X86Decoder {
    fn architecture(&self) -> Architecture {
        if self.long_mode {
            Architecture::X64
        } else {
            Architecture::X86
        }
    }

    fn prologs(&self) -> &[&'static [u8]] {
        if self.long_mode {
            X64_PROLOGS
        } else {
            X86_PROLOGS
        }
    }

    fn decode(&self, data: &[u8], address: u64) -> Option<Instruction> {
        let first = *data.first()?;
        Some(
            self.decode_inner(data, address)
                .unwrap_or_else(|| Instruction::raw_byte(address, first)),
        )
    }
}

fn register_pair(data: &[u8], pos: usize, rex: Rex) -> Option<RegisterPair> {
    let modrm = *data.get(pos)?;
    if modrm >> 6 != 0b11 {
        return None;
    }
    Some(RegisterPair {
        reg: ((modrm >> 3) & 0x7) as usize | (rex.r as usize) << 3,
        rm: (modrm & 0x7) as usize | (rex.b as usize) << 3,
    })
}

fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], pos: usize) -> Option<u64> {
    let bytes = data.get(pos..pos + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Some(u64::from_le_bytes(buf))
}
