//! Obfuscation detectors
//!
//! Every detector is an independent yes/no probe; none of them can fail.

use binlift_binary_parser::{BinaryStructure, Section};
use binlift_core::config::DeobfuscationConfig;
use binlift_disasm::instruction::parse_literal;
use binlift_disasm::{DisassembledFunction, Instruction};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::entropy::string_entropy;

/// Short numbered section names such as `.x1` or `.ab12`
static NUMBERED_SECTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\.[a-z]{1,2}\d+$").unwrap());

const PACKER_MARKERS: [&str; 3] = ["upx", "aspack", "mew"];

/// `int` vectors used by debugger checks
const ANTI_DEBUG_VECTORS: [u64; 2] = [0x2D, 0x03];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObfuscationType {
    Packing,
    StringEncryption,
    ControlFlowObfuscation,
    JunkCode,
    AntiAnalysis,
    EntryPointObfuscation,
    SectionModification,
    ImportObfuscation,
}

/// Run every detector and collect the positive tags in a fixed order
pub fn detect_obfuscation(
    config: &DeobfuscationConfig,
    structure: &BinaryStructure,
    strings: &[String],
    functions: &[DisassembledFunction],
) -> Vec<ObfuscationType> {
    let probes = [
        (ObfuscationType::Packing, structure.packed),
        (ObfuscationType::SectionModification, has_suspicious_sections(&structure.sections)),
        (ObfuscationType::EntryPointObfuscation, has_obfuscated_entry_point(structure)),
        (ObfuscationType::ControlFlowObfuscation, has_control_flow_obfuscation(config, functions)),
        (ObfuscationType::JunkCode, has_junk_code(config, functions)),
        (ObfuscationType::StringEncryption, has_encrypted_strings(config, strings)),
        (ObfuscationType::AntiAnalysis, has_anti_analysis(functions)),
    ];

    probes
        .into_iter()
        .filter_map(|(kind, hit)| hit.then_some(kind))
        .collect()
}

/// Writable code, or a name left behind by a packer
pub fn has_suspicious_sections(sections: &[Section]) -> bool {
    sections.iter().any(|section| {
        if section.is_executable() && section.is_writable() {
            return true;
        }
        let name = section.name.to_lowercase();
        PACKER_MARKERS.iter().any(|m| name.contains(m)) || NUMBERED_SECTION.is_match(&name)
    })
}

fn is_primary_code_section(name: &str) -> bool {
    name == ".text" || name.ends_with(",__text")
}

/// The entry point lands in some section other than the main code section
pub fn has_obfuscated_entry_point(structure: &BinaryStructure) -> bool {
    let entry = structure.entry_point_rva();
    structure
        .sections
        .iter()
        .filter(|s| s.contains_rva(entry))
        .any(|s| !is_primary_code_section(&s.name))
}

fn jump_ratio(instructions: &[Instruction]) -> f64 {
    if instructions.is_empty() {
        return 0.0;
    }
    let jumps = instructions.iter().filter(|i| i.is_jump()).count();
    jumps as f64 / instructions.len() as f64
}

fn longest_jump_chain(instructions: &[Instruction]) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for ins in instructions {
        if ins.is_jump() {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

pub fn has_control_flow_obfuscation(config: &DeobfuscationConfig, functions: &[DisassembledFunction]) -> bool {
    functions.iter().any(|f| {
        jump_ratio(&f.instructions) > config.jump_ratio_threshold
            || longest_jump_chain(&f.instructions) > config.jump_chain_length
    })
}

pub(crate) fn is_self_xor(ins: &Instruction) -> bool {
    ins.mnemonic == "xor" && ins.operands.len() == 2 && ins.operands[0] == ins.operands[1]
}

pub(crate) fn cancels(push: &Instruction, pop: &Instruction) -> bool {
    push.mnemonic == "push" && pop.mnemonic == "pop" && push.operands == pop.operands
}

pub fn has_junk_code(config: &DeobfuscationConfig, functions: &[DisassembledFunction]) -> bool {
    functions.iter().any(|f| {
        let instructions = &f.instructions;
        let nops = instructions.iter().filter(|i| i.mnemonic == "nop").count();
        nops as f64 > instructions.len() as f64 * config.nop_ratio_threshold
            || instructions.iter().any(is_self_xor)
            || instructions.windows(2).any(|pair| cancels(&pair[0], &pair[1]))
    })
}

pub fn has_encrypted_strings(config: &DeobfuscationConfig, strings: &[String]) -> bool {
    let suspicious = strings
        .iter()
        .filter(|s| string_entropy(s) > config.string_entropy_threshold)
        .count();
    suspicious as f64 > strings.len() as f64 * config.encrypted_string_ratio
}

/// Debugger-check interrupts or timestamp reads
pub fn has_anti_analysis(functions: &[DisassembledFunction]) -> bool {
    functions
        .iter()
        .flat_map(|f| f.instructions.iter())
        .any(|ins| match ins.mnemonic.as_str() {
            "rdtsc" => true,
            "int" => ins
                .operand(0)
                .and_then(parse_literal)
                .map_or(false, |vector| ANTI_DEBUG_VECTORS.contains(&vector)),
            _ => false,
        })
}
