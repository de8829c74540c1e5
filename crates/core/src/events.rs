//! Event types for progress reporting

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pipeline stages, in the order they run for a single binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisStage {
    Detect,
    Parse,
    Strings,
    Disassembly,
    ControlFlow,
    ApiCalls,
    Deobfuscation,
    Dependencies,
}

impl std::fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisStage::Detect => write!(f, "detect"),
            AnalysisStage::Parse => write!(f, "parse"),
            AnalysisStage::Strings => write!(f, "strings"),
            AnalysisStage::Disassembly => write!(f, "disassembly"),
            AnalysisStage::ControlFlow => write!(f, "control-flow"),
            AnalysisStage::ApiCalls => write!(f, "api-calls"),
            AnalysisStage::Deobfuscation => write!(f, "deobfuscation"),
            AnalysisStage::Dependencies => write!(f, "dependencies"),
        }
    }
}

/// Analysis events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AnalysisEvent {
    FileStarted {
        path: PathBuf,
    },
    StageCompleted {
        path: PathBuf,
        stage: AnalysisStage,
    },
    FileCompleted {
        path: PathBuf,
        functions: usize,
        strings: usize,
    },
    FileFailed {
        path: PathBuf,
        stage: AnalysisStage,
        message: String,
    },
    DependencyResolved {
        name: String,
        path: PathBuf,
    },
    DependencyUnresolved {
        name: String,
    },
}

/// Event bus for broadcasting events
pub struct EventBus {
    subscribers: Vec<Box<dyn Fn(&AnalysisEvent) + Send + Sync>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: Fn(&AnalysisEvent) + Send + Sync + 'static,
    {
        self.subscribers.push(Box::new(callback));
    }

    pub fn emit(&self, event: AnalysisEvent) {
        for subscriber in &self.subscribers {
            subscriber(&event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
