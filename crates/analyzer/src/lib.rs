//! End-to-end analysis of native executables
//!
//! `BinaryAnalyzer` drives detection, parsing, string extraction,
//! disassembly, control-flow and API analysis and deobfuscation for one file,
//! then follows the file's imports with `DependencyWalker`. Directory inputs
//! additionally collect configuration and resource files.

pub mod dependency;
pub mod directory;
pub mod orchestrator;
pub mod result;

#[cfg(test)]
mod fixtures;

pub use dependency::{Dependency, DependencyKind, DependencyWalker};
pub use directory::{scan_directory, DirectoryListing, ResourceInfo, ResourceType};
pub use orchestrator::BinaryAnalyzer;
pub use result::{AnalysisFailure, BinaryAnalysisResult, BinaryFileAnalysis};
