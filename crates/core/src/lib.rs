//! Core types and traits for binlift
//!
//! This crate provides the foundational types shared by the parser,
//! disassembler, deobfuscator and analysis orchestrator.

pub mod error;
pub mod types;
pub mod config;
pub mod events;

pub use error::{Error, Result};
pub use types::*;
pub use config::AnalysisConfig;
pub use events::{AnalysisEvent, AnalysisStage, EventBus};
