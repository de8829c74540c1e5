//! Prolog-seeded linear-sweep disassembly

use std::collections::BTreeSet;

use binlift_binary_parser::{BinaryStructure, Section};
use binlift_core::config::DisassemblyConfig;
use binlift_core::Address;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cfg::ControlFlowGraph;
use crate::decoder::{decoder_for, InstructionDecoder};
use crate::instruction::Instruction;

/// A function recovered from a prolog seed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisassembledFunction {
    /// `sub_<hex start>`
    pub name: String,
    pub start_address: Address,
    /// Address just past the last decoded instruction
    pub end_address: Address,
    pub instructions: Vec<Instruction>,
    pub cfg: Option<ControlFlowGraph>,
    pub called_functions: BTreeSet<String>,
}

impl DisassembledFunction {
    pub fn new(start: u64, instructions: Vec<Instruction>) -> Self {
        let end = instructions.last().map_or(start, Instruction::next_address);
        Self {
            name: format!("sub_{:x}", start),
            start_address: Address::new(start),
            end_address: Address::new(end),
            instructions,
            cfg: None,
            called_functions: BTreeSet::new(),
        }
    }

    /// Attach a graph and record the functions it calls
    pub fn attach_cfg(&mut self, cfg: ControlFlowGraph) {
        self.called_functions
            .extend(cfg.calls.iter().map(|call| call.target_name.clone()));
        self.cfg = Some(cfg);
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start_address.as_u64() && address < self.end_address.as_u64()
    }
}

/// Disassembly engine
#[derive(Debug, Clone, Default)]
pub struct DisassemblyEngine {
    config: DisassemblyConfig,
}

impl DisassemblyEngine {
    pub fn new(config: DisassemblyConfig) -> Self {
        Self { config }
    }

    /// Disassemble every code section of `structure`
    ///
    /// Architectures without a decoder yield no functions.
    pub fn disassemble(&self, data: &[u8], structure: &BinaryStructure) -> Vec<DisassembledFunction> {
        let Some(decoder) = decoder_for(structure.architecture) else {
            warn!("No instruction decoder for {}, skipping disassembly", structure.architecture);
            return Vec::new();
        };

        let mut functions = Vec::new();
        for section in structure.code_sections() {
            let base = structure.image_base.as_u64().wrapping_add(section.virtual_address);
            let found = self.disassemble_section(decoder.as_ref(), section.data(data), base, section_span(section));
            debug!("Section {}: {} functions", section.name, found.len());
            functions.extend(found);
        }
        functions
    }

    /// Disassemble one block of code loaded at `base`, covering `span` bytes of address space
    pub fn disassemble_section(
        &self,
        decoder: &dyn InstructionDecoder,
        code: &[u8],
        base: u64,
        span: u64,
    ) -> Vec<DisassembledFunction> {
        let end = base.saturating_add(span);
        let seeds = self.find_function_seeds(decoder, code, base);

        seeds
            .iter()
            .enumerate()
            .filter_map(|(i, &start)| {
                let limit = seeds.get(i + 1).copied().unwrap_or(end);
                let instructions = self.decode_function(decoder, code, base, start, limit);
                if instructions.is_empty() {
                    None
                } else {
                    Some(DisassembledFunction::new(start, instructions))
                }
            })
            .collect()
    }

    /// Sorted, deduplicated candidate starts: the section start plus every prolog match
    pub fn find_function_seeds(&self, decoder: &dyn InstructionDecoder, code: &[u8], base: u64) -> Vec<u64> {
        let mut seeds = BTreeSet::new();
        seeds.insert(base);

        for offset in 0..code.len() {
            let window = &code[offset..];
            if decoder.prologs().iter().any(|p| window.starts_with(p)) {
                seeds.insert(base + offset as u64);
            }
        }

        let mut seeds: Vec<u64> = seeds.into_iter().collect();
        if seeds.len() > self.config.max_functions_per_section {
            warn!(
                "{} function seeds at 0x{:X}, keeping the first {}",
                seeds.len(),
                base,
                self.config.max_functions_per_section
            );
            seeds.truncate(self.config.max_functions_per_section);
        }
        seeds
    }

    /// Linear decode from `start` until a return, `limit`, the end of `code`, or the instruction budget
    fn decode_function(
        &self,
        decoder: &dyn InstructionDecoder,
        code: &[u8],
        base: u64,
        start: u64,
        limit: u64,
    ) -> Vec<Instruction> {
        let mut instructions = Vec::new();
        let mut address = start;

        while address < limit && instructions.len() < self.config.max_instructions_per_function {
            let offset = (address - base) as usize;
            let Some(instruction) = code.get(offset..).and_then(|rest| decoder.decode(rest, address)) else {
                break;
            };
            if instruction.is_empty() {
                break;
            }

            address = instruction.next_address();
            let done = instruction.is_ret();
            instructions.push(instruction);
            if done {
                break;
            }
        }
        instructions
    }
}

/// Address span of a section; falls back to the raw size when no virtual size is recorded
fn section_span(section: &Section) -> u64 {
    if section.virtual_size > 0 {
        section.virtual_size
    } else {
        section.raw_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::X86Decoder;
    use binlift_binary_parser::{SectionFlags, SectionKind};
    use binlift_core::{Architecture, BinaryFormat, Platform};

    fn engine() -> DisassemblyEngine {
        DisassemblyEngine::default()
    }

    #[test]
    fn test_push_ret_function() {
        let code = [0x50, 0xC3];
        let functions = engine().disassemble_section(&X86Decoder::new(false), &code, 0x1000, 0x100);
        assert_eq!(functions.len(), 1);
        let f = &functions[0];
        assert_eq!(f.name, "sub_1000");
        assert_eq!(f.instructions.len(), 2);
        assert_eq!(f.instructions[0].mnemonic, "push");
        assert_eq!(f.instructions[1].mnemonic, "ret");
        assert_eq!(f.end_address, Address::new(0x1002));
    }

    #[test]
    fn test_prolog_seeds_split_functions() {
        // sub_1000: nop; ret   sub_1002: push ebp; mov ebp, esp; pop ebp; ret
        let code = [0x90, 0xC3, 0x55, 0x8B, 0xEC, 0x5D, 0xC3];
        let decoder = X86Decoder::new(false);
        assert_eq!(engine().find_function_seeds(&decoder, &code, 0x1000), vec![0x1000, 0x1002]);

        let functions = engine().disassemble_section(&decoder, &code, 0x1000, code.len() as u64);
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[1].name, "sub_1002");
        let mnemonics: Vec<&str> = functions[1].instructions.iter().map(|i| i.mnemonic.as_str()).collect();
        assert_eq!(mnemonics, vec!["push", "mov", "pop", "ret"]);
    }

    #[test]
    fn test_decode_stops_at_next_seed() {
        // No return before the second prolog
        let code = [0x90, 0x90, 0x55, 0x8B, 0xEC, 0xC3];
        let functions = engine().disassemble_section(&X86Decoder::new(false), &code, 0, code.len() as u64);
        assert_eq!(functions[0].instructions.len(), 2);
        assert_eq!(functions[0].end_address, Address::new(2));
    }

    #[test]
    fn test_unknown_bytes_do_not_abort() {
        let code = [0xD6, 0x0F, 0xFF, 0x50, 0xC3];
        let functions = engine().disassemble_section(&X86Decoder::new(false), &code, 0, 5);
        let mnemonics: Vec<&str> = functions[0].instructions.iter().map(|i| i.mnemonic.as_str()).collect();
        assert_eq!(mnemonics, vec!["db", "db", "db", "push", "ret"]);
    }

    #[test]
    fn test_instruction_budget() {
        let code = [0x90; 64];
        let engine = DisassemblyEngine::new(DisassemblyConfig {
            max_instructions_per_function: 8,
            ..Default::default()
        });
        let functions = engine.disassemble_section(&X86Decoder::new(false), &code, 0, 64);
        assert_eq!(functions[0].instructions.len(), 8);
    }

    #[test]
    fn test_empty_section_has_no_functions() {
        let functions = engine().disassemble_section(&X86Decoder::new(false), &[], 0x1000, 0x100);
        assert!(functions.is_empty());
    }

    #[test]
    fn test_disassemble_structure_uses_image_base() {
        let mut data = vec![0u8; 0x210];
        data[0x200] = 0x50;
        data[0x201] = 0xC3;

        let mut structure = BinaryStructure::new(BinaryFormat::PE, Platform::Windows);
        structure.architecture = Architecture::X86;
        structure.image_base = Address::new(0x400000);
        structure.sections.push(Section {
            name: ".text".into(),
            virtual_address: 0x1000,
            virtual_size: 0x10,
            raw_offset: 0x200,
            raw_size: 0x10,
            flags: SectionFlags::CODE | SectionFlags::EXECUTE | SectionFlags::READ,
            kind: SectionKind::Code,
        });

        let functions = engine().disassemble(&data, &structure);
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].start_address, Address::new(0x401000));

        structure.architecture = Architecture::Arm64;
        assert!(engine().disassemble(&data, &structure).is_empty());
    }
}
