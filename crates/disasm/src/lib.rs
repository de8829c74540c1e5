//! Machine-code analysis for binlift
//!
//! Decodes a practical subset of x86/x64, recovers function boundaries from
//! prolog patterns, builds per-function control-flow graphs and recognizes
//! calls into well-known APIs.

pub mod api;
pub mod cfg;
pub mod decoder;
pub mod engine;
pub mod instruction;

pub use api::{ApiCall, ApiCallAnalyzer, ApiCategory, ApiSignature, CallType};
pub use cfg::{BasicBlock, ControlFlowAnalyzer, ControlFlowGraph, Edge, EdgeKind, FunctionCall, Loop, Pattern, PatternKind};
pub use decoder::{decoder_for, InstructionDecoder, X86Decoder};
pub use engine::{DisassembledFunction, DisassemblyEngine};
pub use instruction::{Instruction, InstructionType};
