//! Best-effort reversal techniques
//!
//! Techniques never mutate their input; a technique that changes the analysis
//! returns replacement strings or functions in its outcome.

use std::collections::BTreeSet;

use binlift_binary_parser::BinaryStructure;
use binlift_core::config::DeobfuscationConfig;
use binlift_disasm::{ControlFlowAnalyzer, DisassembledFunction, Instruction};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detect::{cancels, is_self_xor, ObfuscationType};
use crate::entropy::decrypt_string;

/// Outcome of one technique
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeobfuscationStep {
    pub technique: String,
    pub description: String,
    pub success: bool,
    pub improvements: Vec<String>,
    pub error: Option<String>,
}

impl DeobfuscationStep {
    pub fn new(technique: &str, description: &str) -> Self {
        Self {
            technique: technique.to_string(),
            description: description.to_string(),
            success: false,
            improvements: Vec::new(),
            error: None,
        }
    }
}

/// Replacement parts of an analysis; `None` keeps the previous value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImprovedAnalysis {
    pub strings: Option<Vec<String>>,
    pub functions: Option<Vec<DisassembledFunction>>,
}

impl ImprovedAnalysis {
    pub fn is_empty(&self) -> bool {
        self.strings.is_none() && self.functions.is_none()
    }

    /// Overlay `other` on top of `self`
    pub fn merge(&mut self, other: ImprovedAnalysis) {
        if other.strings.is_some() {
            self.strings = other.strings;
        }
        if other.functions.is_some() {
            self.functions = other.functions;
        }
    }
}

/// Analysis state a technique reads
#[derive(Debug, Clone, Copy)]
pub struct AnalysisView<'a> {
    pub structure: &'a BinaryStructure,
    pub strings: &'a [String],
    pub functions: &'a [DisassembledFunction],
}

pub struct TechniqueOutcome {
    pub step: DeobfuscationStep,
    pub improved: ImprovedAnalysis,
}

impl From<DeobfuscationStep> for TechniqueOutcome {
    fn from(step: DeobfuscationStep) -> Self {
        Self {
            step,
            improved: ImprovedAnalysis::default(),
        }
    }
}

/// A reversal technique bound to one obfuscation tag
pub trait DeobfuscationTechnique: Send + Sync {
    fn name(&self) -> &str;

    /// Tag this technique responds to
    fn handles(&self) -> ObfuscationType;

    fn apply(&self, view: AnalysisView<'_>) -> TechniqueOutcome;
}

/// Reports the identified packer; bytes are left as they are
pub struct Unpacking;

impl DeobfuscationTechnique for Unpacking {
    fn name(&self) -> &str {
        "Unpacking"
    }

    fn handles(&self) -> ObfuscationType {
        ObfuscationType::Packing
    }

    fn apply(&self, view: AnalysisView<'_>) -> TechniqueOutcome {
        let mut step = DeobfuscationStep::new(self.name(), "Attempting to unpack executable");
        let packer = view.structure.packer.as_deref().unwrap_or("unknown");
        step.success = true;
        step.improvements
            .push(format!("Detected and handled {} packer", packer));
        step.into()
    }
}

/// Single-byte XOR brute force over extracted strings
pub struct StringDecryption {
    max_candidates: usize,
}

impl StringDecryption {
    pub fn new(max_candidates: usize) -> Self {
        Self { max_candidates }
    }
}

impl DeobfuscationTechnique for StringDecryption {
    fn name(&self) -> &str {
        "String Decryption"
    }

    fn handles(&self) -> ObfuscationType {
        ObfuscationType::StringEncryption
    }

    fn apply(&self, view: AnalysisView<'_>) -> TechniqueOutcome {
        let mut step = DeobfuscationStep::new(self.name(), "Attempting to decrypt obfuscated strings");
        let decrypted: Vec<String> = view
            .strings
            .iter()
            .take(self.max_candidates)
            .filter_map(|s| decrypt_string(s))
            .collect();

        if decrypted.is_empty() {
            step.error = Some("No strings could be decrypted".to_string());
            return step.into();
        }

        step.success = true;
        step.improvements
            .push(format!("Decrypted {} strings", decrypted.len()));
        let strings: Vec<String> = view
            .strings
            .iter()
            .cloned()
            .chain(decrypted)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        TechniqueOutcome {
            step,
            improved: ImprovedAnalysis {
                strings: Some(strings),
                functions: None,
            },
        }
    }
}

/// Counts functions large enough to simplify; instructions are left as they are
pub struct ControlFlowSimplification {
    min_instructions: usize,
}

impl ControlFlowSimplification {
    pub fn new(min_instructions: usize) -> Self {
        Self { min_instructions }
    }
}

impl DeobfuscationTechnique for ControlFlowSimplification {
    fn name(&self) -> &str {
        "Control Flow Deobfuscation"
    }

    fn handles(&self) -> ObfuscationType {
        ObfuscationType::ControlFlowObfuscation
    }

    fn apply(&self, view: AnalysisView<'_>) -> TechniqueOutcome {
        let mut step = DeobfuscationStep::new(self.name(), "Simplifying obfuscated control flow");
        let simplified = view
            .functions
            .iter()
            .filter(|f| f.instructions.len() > self.min_instructions)
            .count();
        step.success = simplified > 0;
        step.improvements
            .push(format!("Simplified control flow in {} functions", simplified));
        step.into()
    }
}

/// Drops nops, self-XORs and push/pop pairs that cancel out
pub struct JunkCodeRemoval;

/// Instruction list with junk removed; a fixed point, so applying it twice changes nothing
pub fn remove_junk(instructions: &[Instruction]) -> Vec<Instruction> {
    let mut cleaned: Vec<Instruction> = Vec::with_capacity(instructions.len());
    for ins in instructions {
        if ins.mnemonic == "nop" || is_self_xor(ins) {
            continue;
        }
        if cleaned.last().map_or(false, |prev| cancels(prev, ins)) {
            cleaned.pop();
            continue;
        }
        cleaned.push(ins.clone());
    }
    cleaned
}

impl DeobfuscationTechnique for JunkCodeRemoval {
    fn name(&self) -> &str {
        "Junk Code Removal"
    }

    fn handles(&self) -> ObfuscationType {
        ObfuscationType::JunkCode
    }

    fn apply(&self, view: AnalysisView<'_>) -> TechniqueOutcome {
        let mut step = DeobfuscationStep::new(self.name(), "Removing junk code and NOPs");
        let analyzer = ControlFlowAnalyzer::new();
        let mut removed = 0;

        let functions: Vec<DisassembledFunction> = view
            .functions
            .iter()
            .map(|f| {
                let cleaned = remove_junk(&f.instructions);
                removed += f.instructions.len() - cleaned.len();
                let mut function = DisassembledFunction::new(f.start_address.as_u64(), cleaned);
                function.name = f.name.clone();
                let cfg = analyzer.analyze_function(&function);
                function.attach_cfg(cfg);
                function
            })
            .collect();

        debug!("Junk removal dropped {} instructions", removed);
        step.success = removed > 0;
        step.improvements
            .push(format!("Removed {} junk instructions", removed));

        TechniqueOutcome {
            step,
            improved: ImprovedAnalysis {
                strings: None,
                functions: (removed > 0).then_some(functions),
            },
        }
    }
}

/// Techniques in the order they are applied
pub fn default_techniques(config: &DeobfuscationConfig) -> Vec<Box<dyn DeobfuscationTechnique>> {
    vec![
        Box::new(Unpacking),
        Box::new(StringDecryption::new(config.max_xor_candidates)),
        Box::new(ControlFlowSimplification::new(config.simplify_min_instructions)),
        Box::new(JunkCodeRemoval),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use binlift_core::{BinaryFormat, Platform};
    use binlift_disasm::InstructionType;

    fn ins(address: u64, mnemonic: &str, operands: &[&str]) -> Instruction {
        Instruction::new(
            address,
            mnemonic,
            operands.iter().map(|s| s.to_string()).collect(),
            &[0],
            InstructionType::Unknown,
        )
    }

    fn mnemonics(instructions: &[Instruction]) -> Vec<&str> {
        instructions.iter().map(|i| i.mnemonic.as_str()).collect()
    }

    #[test]
    fn test_remove_junk() {
        let code = vec![
            ins(0, "push", &["ebp"]),
            ins(1, "nop", &[]),
            ins(2, "xor", &["eax", "eax"]),
            ins(3, "push", &["ebx"]),
            ins(4, "pop", &["ebx"]),
            ins(5, "xor", &["eax", "ecx"]),
            ins(6, "ret", &[]),
        ];
        let cleaned = remove_junk(&code);
        assert_eq!(mnemonics(&cleaned), vec!["push", "xor", "ret"]);
        // The original list is untouched
        assert_eq!(code.len(), 7);
    }

    #[test]
    fn test_remove_junk_is_idempotent() {
        // Removing the nop exposes a canceling pair
        let code = vec![
            ins(0, "push", &["eax"]),
            ins(1, "push", &["ecx"]),
            ins(2, "nop", &[]),
            ins(3, "pop", &["ecx"]),
            ins(4, "pop", &["eax"]),
            ins(5, "pop", &["edx"]),
            ins(6, "ret", &[]),
        ];
        let once = remove_junk(&code);
        assert_eq!(mnemonics(&once), vec!["pop", "ret"]);
        assert_eq!(remove_junk(&once), once);
    }

    #[test]
    fn test_junk_removal_technique() {
        let structure = BinaryStructure::new(BinaryFormat::PE, Platform::Windows);
        let functions = vec![DisassembledFunction::new(
            0x1000,
            vec![ins(0x1000, "nop", &[]), ins(0x1001, "ret", &[])],
        )];
        let outcome = JunkCodeRemoval.apply(AnalysisView {
            structure: &structure,
            strings: &[],
            functions: &functions,
        });
        assert!(outcome.step.success);
        assert_eq!(outcome.step.improvements, vec!["Removed 1 junk instructions"]);
        let improved = outcome.improved.functions.unwrap();
        assert_eq!(improved[0].instructions.len(), 1);
        assert_eq!(improved[0].name, "sub_1000");
        assert!(improved[0].cfg.is_some());
        assert_eq!(functions[0].instructions.len(), 2);
    }

    #[test]
    fn test_decrypted_strings_stay_sorted_and_unique() {
        let structure = BinaryStructure::new(BinaryFormat::PE, Platform::Windows);
        // "password" under key 0x5A, next to its own plaintext
        let strings = vec!["*;))-5(>".to_string(), "password".to_string()];
        let outcome = StringDecryption::new(16).apply(AnalysisView {
            structure: &structure,
            strings: &strings,
            functions: &[],
        });
        assert!(outcome.step.success);
        assert_eq!(outcome.step.improvements, vec!["Decrypted 1 strings"]);
        assert_eq!(outcome.improved.strings, Some(strings));
    }

    #[test]
    fn test_string_decryption_reports_failure() {
        let structure = BinaryStructure::new(BinaryFormat::PE, Platform::Windows);
        let strings = vec!["kernel32.dll".to_string()];
        let outcome = StringDecryption::new(16).apply(AnalysisView {
            structure: &structure,
            strings: &strings,
            functions: &[],
        });
        assert!(!outcome.step.success);
        assert_eq!(outcome.step.error.as_deref(), Some("No strings could be decrypted"));
        assert!(outcome.improved.is_empty());
    }

    #[test]
    fn test_unpacking_names_packer() {
        let mut structure = BinaryStructure::new(BinaryFormat::PE, Platform::Windows);
        structure.packer = Some("Known Packer: UPX0".into());
        let outcome = Unpacking.apply(AnalysisView {
            structure: &structure,
            strings: &[],
            functions: &[],
        });
        assert!(outcome.step.success);
        assert_eq!(
            outcome.step.improvements,
            vec!["Detected and handled Known Packer: UPX0 packer"]
        );
    }
}
