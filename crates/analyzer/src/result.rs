//! Aggregate analysis results

use std::fmt::Write as _;
use std::path::PathBuf;

use binlift_binary_parser::{BinaryStructure, ExtractedString};
use binlift_core::{AnalysisStage, BinaryFormat};
use binlift_deobfuscation::DeobfuscationResult;
use binlift_disasm::{ApiCall, DisassembledFunction};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dependency::Dependency;
use crate::directory::ResourceInfo;

/// Where and why a file's analysis stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisFailure {
    pub stage: AnalysisStage,
    pub message: String,
}

/// Everything learned about one file
///
/// Stages past a failure are left empty; whatever ran before it is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryFileAnalysis {
    pub path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub format: BinaryFormat,
    pub structure: Option<BinaryStructure>,
    /// Sorted, deduplicated string values
    pub strings: Vec<String>,
    /// Every string occurrence in file order, with context
    pub string_occurrences: Vec<ExtractedString>,
    pub functions: Vec<DisassembledFunction>,
    pub api_calls: Vec<ApiCall>,
    pub deobfuscation: Option<DeobfuscationResult>,
    pub failure: Option<AnalysisFailure>,
}

impl BinaryFileAnalysis {
    pub fn new(path: PathBuf) -> Self {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            file_name,
            file_size: 0,
            format: BinaryFormat::Unknown,
            structure: None,
            strings: Vec::new(),
            string_occurrences: Vec::new(),
            functions: Vec::new(),
            api_calls: Vec::new(),
            deobfuscation: None,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Strings after deobfuscation, falling back to the extracted ones
    pub fn effective_strings(&self) -> &[String] {
        self.deobfuscation
            .as_ref()
            .and_then(|d| d.improved.strings.as_deref())
            .unwrap_or(&self.strings)
    }

    /// Functions after deobfuscation, falling back to the disassembled ones
    pub fn effective_functions(&self) -> &[DisassembledFunction] {
        self.deobfuscation
            .as_ref()
            .and_then(|d| d.improved.functions.as_deref())
            .unwrap_or(&self.functions)
    }
}

/// Result of one analysis run over a file or a directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryAnalysisResult {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub input_path: PathBuf,
    pub main_executable: Option<PathBuf>,
    pub main_analysis: Option<BinaryFileAnalysis>,
    /// Transitive imports of the main executable, in discovery order
    pub dependencies: Vec<Dependency>,
    /// Analyses of the dependencies found on disk, keyed by library name
    pub dependency_analyses: IndexMap<String, BinaryFileAnalysis>,
    /// Configuration files read verbatim, keyed by path relative to the input directory
    pub configuration_files: IndexMap<String, String>,
    pub resources: Vec<ResourceInfo>,
}

impl BinaryAnalysisResult {
    pub fn new(input_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            input_path,
            main_executable: None,
            main_analysis: None,
            dependencies: Vec::new(),
            dependency_analyses: IndexMap::new(),
            configuration_files: IndexMap::new(),
            resources: Vec::new(),
        }
    }

    /// Main executable analysed without a failure
    pub fn is_success(&self) -> bool {
        self.main_analysis
            .as_ref()
            .map_or(false, BinaryFileAnalysis::is_success)
    }

    /// Every analysed file, the main executable first
    pub fn files(&self) -> impl Iterator<Item = &BinaryFileAnalysis> {
        self.main_analysis
            .iter()
            .chain(self.dependency_analyses.values())
    }

    pub fn failures(&self) -> impl Iterator<Item = &BinaryFileAnalysis> {
        self.files().filter(|f| !f.is_success())
    }

    /// Human-readable overview for reports
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Analysis {} ({})", self.id, self.timestamp.to_rfc3339());
        let _ = writeln!(out, "Input: {}", self.input_path.display());

        let Some(main) = &self.main_analysis else {
            let _ = writeln!(out, "No executable found");
            return out;
        };

        let _ = writeln!(out, "Main executable: {} ({} bytes)", main.path.display(), main.file_size);
        if let Some(failure) = &main.failure {
            let _ = writeln!(out, "  Failed during {}: {}", failure.stage, failure.message);
        }
        if let Some(structure) = &main.structure {
            let _ = writeln!(
                out,
                "  Format: {}, architecture: {}, platform: {}",
                structure.format, structure.architecture, structure.platform
            );
            let _ = writeln!(out, "  Entry point: {}", structure.entry_point);
            let _ = writeln!(
                out,
                "  Sections: {}, linked libraries: {}",
                structure.sections.len(),
                structure.linked_libraries.len()
            );
            if let Some(packer) = &structure.packer {
                let _ = writeln!(out, "  Packer: {}", packer);
            }
        }
        let _ = writeln!(
            out,
            "  Strings: {}, functions: {}, API calls: {}",
            main.strings.len(),
            main.functions.len(),
            main.api_calls.len()
        );
        if let Some(deob) = main.deobfuscation.as_ref().filter(|d| d.obfuscated) {
            let _ = writeln!(
                out,
                "  Obfuscation: {:?} ({:.0}% of techniques succeeded)",
                deob.detected,
                deob.success_rate * 100.0
            );
        }

        if !self.dependencies.is_empty() {
            let resolved = self.dependencies.iter().filter(|d| d.is_resolved()).count();
            let _ = writeln!(
                out,
                "Dependencies: {} ({} found on disk, {} analysed)",
                self.dependencies.len(),
                resolved,
                self.dependency_analyses.len()
            );
        }
        if !self.configuration_files.is_empty() || !self.resources.is_empty() {
            let _ = writeln!(
                out,
                "Configuration files: {}, resources: {}",
                self.configuration_files.len(),
                self.resources.len()
            );
        }
        let failed = self.failures().count();
        if failed > 0 {
            let _ = writeln!(out, "Failed files: {}", failed);
        }
        out
    }
}
