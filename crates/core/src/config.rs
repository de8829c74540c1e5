//! Analysis configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for an analysis run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// String extraction settings
    pub strings: StringsConfig,
    /// Disassembly limits
    pub disassembly: DisassemblyConfig,
    /// Obfuscation detection thresholds
    pub deobfuscation: DeobfuscationConfig,
    /// API call analysis settings
    pub api: ApiConfig,
    /// Dependency resolution settings
    pub dependencies: DependencyConfig,
    /// Resource limits
    pub limits: LimitsConfig,
}

/// String extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StringsConfig {
    /// Minimum run length for ASCII and UTF-16 strings
    pub min_length: usize,
    /// Strings longer than this are dropped by the validity filter
    pub max_length: usize,
    /// Minimum fraction of printable characters
    pub min_printable_ratio: f64,
}

impl Default for StringsConfig {
    fn default() -> Self {
        Self {
            min_length: 4,
            max_length: 1000,
            min_printable_ratio: 0.7,
        }
    }
}

/// Disassembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisassemblyConfig {
    pub max_instructions_per_function: usize,
    pub max_functions_per_section: usize,
}

impl Default for DisassemblyConfig {
    fn default() -> Self {
        Self {
            max_instructions_per_function: 10_000,
            max_functions_per_section: 50_000,
        }
    }
}

/// Obfuscation detection and deobfuscation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeobfuscationConfig {
    /// Fraction of jump instructions above which control flow counts as obfuscated
    pub jump_ratio_threshold: f64,
    /// Consecutive jumps strictly above this count as obfuscated
    pub jump_chain_length: usize,
    /// Fraction of nops above which junk code is reported
    pub nop_ratio_threshold: f64,
    /// Per-string Shannon entropy above which a string looks encrypted
    pub string_entropy_threshold: f64,
    /// Fraction of high-entropy strings above which encryption is reported
    pub encrypted_string_ratio: f64,
    /// Upper bound on strings tried by XOR decryption
    pub max_xor_candidates: usize,
    /// Functions with more instructions than this are simplification candidates
    pub simplify_min_instructions: usize,
}

impl Default for DeobfuscationConfig {
    fn default() -> Self {
        Self {
            jump_ratio_threshold: 0.30,
            jump_chain_length: 3,
            nop_ratio_threshold: 0.10,
            string_entropy_threshold: 4.5,
            encrypted_string_ratio: 0.30,
            max_xor_candidates: 4096,
            simplify_min_instructions: 10,
        }
    }
}

/// API call analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// How many instructions to scan backwards for call arguments
    pub argument_lookback: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { argument_lookback: 10 }
    }
}

/// Dependency walker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Walk imported libraries after the main binary is analyzed
    pub analyze_dependencies: bool,
    /// Absolute directories searched after the binary's own directory
    pub system_search_paths: Vec<PathBuf>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            analyze_dependencies: true,
            system_search_paths: [
                "C:\\Windows\\System32",
                "C:\\Windows\\SysWOW64",
                "/lib",
                "/usr/lib",
                "/usr/local/lib",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Files larger than this are rejected before mapping
    pub max_file_size: u64,
    /// Worker threads for parallel dependency analysis (0 = rayon default)
    pub worker_threads: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 256 * 1024 * 1024,
            worker_threads: 0,
        }
    }
}

fn check_ratio(name: &str, value: f64) -> crate::Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(crate::Error::config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

impl AnalysisConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| crate::Error::io(path, e))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| crate::Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::config(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| crate::Error::io(path, e))?;
        Ok(())
    }

    /// Reject settings that would make the pipeline misbehave
    pub fn validate(&self) -> crate::Result<()> {
        if self.strings.min_length == 0 {
            return Err(crate::Error::config("strings.min_length must be at least 1"));
        }
        if self.strings.max_length < self.strings.min_length {
            return Err(crate::Error::config(
                "strings.max_length must not be below strings.min_length",
            ));
        }
        check_ratio("strings.min_printable_ratio", self.strings.min_printable_ratio)?;
        check_ratio(
            "deobfuscation.jump_ratio_threshold",
            self.deobfuscation.jump_ratio_threshold,
        )?;
        check_ratio(
            "deobfuscation.nop_ratio_threshold",
            self.deobfuscation.nop_ratio_threshold,
        )?;
        check_ratio(
            "deobfuscation.encrypted_string_ratio",
            self.deobfuscation.encrypted_string_ratio,
        )?;
        if self.disassembly.max_instructions_per_function == 0 {
            return Err(crate::Error::config(
                "disassembly.max_instructions_per_function must be at least 1",
            ));
        }
        if self.limits.max_file_size == 0 {
            return Err(crate::Error::config("limits.max_file_size must be non-zero"));
        }
        Ok(())
    }
}
