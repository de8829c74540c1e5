//! Obfuscation detection and best-effort reversal
//!
//! Detection runs a fixed set of heuristics over the parsed structure, the
//! extracted strings and the disassembled functions. Each detected tag then
//! triggers its technique. Nothing here returns an error: a technique that
//! cannot help records a failed step instead.

pub mod detect;
pub mod entropy;
pub mod techniques;

pub use detect::{detect_obfuscation, ObfuscationType};
pub use entropy::{decrypt_xor, shannon_entropy, string_entropy};
pub use techniques::{
    AnalysisView, DeobfuscationStep, DeobfuscationTechnique, ImprovedAnalysis, TechniqueOutcome,
};

use binlift_binary_parser::BinaryStructure;
use binlift_core::config::DeobfuscationConfig;
use binlift_disasm::DisassembledFunction;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Detection report plus the outcome of every technique that ran
///
/// The analysis the engine was given is the "before" state; `improved` holds
/// only the parts the techniques replaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeobfuscationResult {
    pub obfuscated: bool,
    pub detected: Vec<ObfuscationType>,
    pub steps: Vec<DeobfuscationStep>,
    pub improved: ImprovedAnalysis,
    /// Successful steps over all steps, 0 when nothing ran
    pub success_rate: f64,
}

impl DeobfuscationResult {
    pub fn has(&self, kind: ObfuscationType) -> bool {
        self.detected.contains(&kind)
    }
}

/// Deobfuscation engine
pub struct DeobfuscationEngine {
    config: DeobfuscationConfig,
    techniques: Vec<Box<dyn DeobfuscationTechnique>>,
}

impl DeobfuscationEngine {
    pub fn new(config: DeobfuscationConfig) -> Self {
        let techniques = techniques::default_techniques(&config);
        Self { config, techniques }
    }

    /// Register an additional technique; it runs after the built-in ones
    pub fn add_technique(&mut self, technique: Box<dyn DeobfuscationTechnique>) {
        self.techniques.push(technique);
    }

    pub fn deobfuscate(
        &self,
        structure: &BinaryStructure,
        strings: &[String],
        functions: &[DisassembledFunction],
    ) -> DeobfuscationResult {
        let detected = detect_obfuscation(&self.config, structure, strings, functions);
        if detected.is_empty() {
            debug!("No obfuscation detected");
            return DeobfuscationResult::default();
        }
        info!("Detected obfuscation: {:?}", detected);

        let mut improved = ImprovedAnalysis::default();
        let mut steps = Vec::new();

        for technique in self.techniques.iter().filter(|t| detected.contains(&t.handles())) {
            // Each technique sees the output of the successful ones before it
            let view = AnalysisView {
                structure,
                strings: improved.strings.as_deref().unwrap_or(strings),
                functions: improved.functions.as_deref().unwrap_or(functions),
            };
            let outcome = technique.apply(view);
            debug!(
                "{}: {}",
                outcome.step.technique,
                if outcome.step.success { "succeeded" } else { "failed" }
            );
            if outcome.step.success {
                improved.merge(outcome.improved);
            }
            steps.push(outcome.step);
        }

        let success_rate = if steps.is_empty() {
            0.0
        } else {
            steps.iter().filter(|s| s.success).count() as f64 / steps.len() as f64
        };

        DeobfuscationResult {
            obfuscated: true,
            detected,
            steps,
            improved,
            success_rate,
        }
    }
}

impl Default for DeobfuscationEngine {
    fn default() -> Self {
        Self::new(DeobfuscationConfig::default())
    }
}
