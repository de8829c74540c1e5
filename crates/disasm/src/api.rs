//! API call recognition and argument recovery

use std::collections::HashMap;

use binlift_core::config::ApiConfig;
use binlift_core::Address;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decoder::is_register;
use crate::engine::DisassembledFunction;
use crate::instruction::{parse_literal, Instruction};

/// Registers that carry call arguments in the common calling conventions
static ARGUMENT_REGISTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(e?[abcd]x|e?[sb]p|e?[sd]i|r[abcd]x|r[sd]i|r8|r9)$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiCategory {
    FileIo,
    Memory,
    Process,
    Thread,
    Registry,
    Network,
    Ui,
    Graphics,
    Audio,
    Crypto,
    System,
    Io,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallType {
    /// Literal target address
    Direct,
    /// Target held in a register
    Indirect,
    /// Target computed through memory or a symbolic expression
    Dynamic,
    Unknown,
}

/// Known API prototype
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSignature {
    pub name: String,
    pub category: ApiCategory,
    pub description: String,
    pub parameter_types: Vec<String>,
    pub return_type: String,
}

impl ApiSignature {
    pub fn new(
        name: &str,
        category: ApiCategory,
        description: &str,
        parameter_types: &[&str],
        return_type: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            category,
            description: description.to_string(),
            parameter_types: parameter_types.iter().map(|s| s.to_string()).collect(),
            return_type: return_type.to_string(),
        }
    }
}

/// One `call` site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCall {
    pub address: Address,
    /// Containing function name
    pub caller: String,
    /// Resolved target name
    pub function_name: String,
    pub call_type: CallType,
    pub category: ApiCategory,
    pub signature: Option<ApiSignature>,
    /// Recovered argument operands, first argument first
    pub parameters: Vec<String>,
}

impl ApiCall {
    pub fn description(&self) -> Option<&str> {
        self.signature.as_ref().map(|s| s.description.as_str())
    }
}

/// Resolves call targets and matches them against a signature table
#[derive(Debug, Clone)]
pub struct ApiCallAnalyzer {
    /// Keyed by lowercase name
    signatures: HashMap<String, ApiSignature>,
    lookback: usize,
}

impl ApiCallAnalyzer {
    pub fn new(config: ApiConfig) -> Self {
        let mut analyzer = Self {
            signatures: HashMap::new(),
            lookback: config.argument_lookback,
        };
        analyzer.add_windows_apis();
        analyzer.add_c_runtime_apis();
        analyzer.add_posix_apis();
        analyzer
    }

    pub fn add_signature(&mut self, signature: ApiSignature) {
        self.signatures.insert(signature.name.to_lowercase(), signature);
    }

    /// Case-insensitive signature lookup
    pub fn signature(&self, name: &str) -> Option<&ApiSignature> {
        self.signatures.get(&name.to_lowercase())
    }

    /// Every call site across `functions`, in function then address order
    pub fn analyze(&self, functions: &[DisassembledFunction]) -> Vec<ApiCall> {
        let calls: Vec<ApiCall> = functions
            .iter()
            .flat_map(|f| self.analyze_function(f))
            .collect();
        debug!(
            "{} call sites, {} matched known APIs",
            calls.len(),
            calls.iter().filter(|c| c.signature.is_some()).count()
        );
        calls
    }

    pub fn analyze_function(&self, function: &DisassembledFunction) -> Vec<ApiCall> {
        function
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, ins)| ins.is_call())
            .filter_map(|(index, ins)| {
                let target = ins.operand(0)?;
                let (function_name, call_type) = resolve_target(target);
                let signature = self.signature(&function_name).cloned();

                Some(ApiCall {
                    address: ins.address,
                    caller: function.name.clone(),
                    category: signature.as_ref().map_or(ApiCategory::Unknown, |s| s.category),
                    parameters: recover_arguments(&function.instructions, index, self.lookback),
                    function_name,
                    call_type,
                    signature,
                })
            })
            .collect()
    }

    fn add_windows_apis(&mut self) {
        use ApiCategory::*;

        self.add_signature(ApiSignature::new(
            "CreateFileA",
            FileIo,
            "Creates or opens a file or I/O device",
            &["LPCSTR", "DWORD", "DWORD", "LPSECURITY_ATTRIBUTES", "DWORD", "DWORD", "HANDLE"],
            "HANDLE",
        ));
        self.add_signature(ApiSignature::new(
            "ReadFile",
            FileIo,
            "Reads data from the specified file or input/output device",
            &["HANDLE", "LPVOID", "DWORD", "LPDWORD", "LPOVERLAPPED"],
            "BOOL",
        ));
        self.add_signature(ApiSignature::new(
            "WriteFile",
            FileIo,
            "Writes data to the specified file or input/output device",
            &["HANDLE", "LPCVOID", "DWORD", "LPDWORD", "LPOVERLAPPED"],
            "BOOL",
        ));
        self.add_signature(ApiSignature::new(
            "VirtualAlloc",
            Memory,
            "Reserves, commits, or changes the state of pages in the virtual address space",
            &["LPVOID", "SIZE_T", "DWORD", "DWORD"],
            "LPVOID",
        ));
        self.add_signature(ApiSignature::new(
            "VirtualFree",
            Memory,
            "Releases or decommits pages within the virtual address space",
            &["LPVOID", "SIZE_T", "DWORD"],
            "BOOL",
        ));
        self.add_signature(ApiSignature::new(
            "CreateProcessA",
            Process,
            "Creates a new process and its primary thread",
            &[
                "LPCSTR",
                "LPSTR",
                "LPSECURITY_ATTRIBUTES",
                "LPSECURITY_ATTRIBUTES",
                "BOOL",
                "DWORD",
                "LPVOID",
                "LPCSTR",
                "LPSTARTUPINFOA",
                "LPPROCESS_INFORMATION",
            ],
            "BOOL",
        ));
        self.add_signature(ApiSignature::new(
            "RegOpenKeyExA",
            Registry,
            "Opens the specified registry key",
            &["HKEY", "LPCSTR", "DWORD", "REGSAM", "PHKEY"],
            "LSTATUS",
        ));
        self.add_signature(ApiSignature::new(
            "WSAStartup",
            Network,
            "Initiates use of the Winsock DLL",
            &["WORD", "LPWSADATA"],
            "int",
        ));
        self.add_signature(ApiSignature::new(
            "socket",
            Network,
            "Creates a socket",
            &["int", "int", "int"],
            "SOCKET",
        ));
        self.add_signature(ApiSignature::new(
            "MessageBoxA",
            Ui,
            "Displays a modal dialog box",
            &["HWND", "LPCSTR", "LPCSTR", "UINT"],
            "int",
        ));
        self.add_signature(ApiSignature::new(
            "CreateWindowExA",
            Ui,
            "Creates an overlapped, pop-up, or child window",
            &[
                "DWORD", "LPCSTR", "LPCSTR", "DWORD", "int", "int", "int", "int", "HWND", "HMENU",
                "HINSTANCE", "LPVOID",
            ],
            "HWND",
        ));
    }

    fn add_c_runtime_apis(&mut self) {
        use ApiCategory::*;

        self.add_signature(ApiSignature::new("malloc", Memory, "Allocates memory", &["size_t"], "void*"));
        self.add_signature(ApiSignature::new("free", Memory, "Deallocates memory", &["void*"], "void"));
        self.add_signature(ApiSignature::new(
            "printf",
            Io,
            "Prints formatted output",
            &["const char*", "..."],
            "int",
        ));
        self.add_signature(ApiSignature::new(
            "fopen",
            FileIo,
            "Opens a file",
            &["const char*", "const char*"],
            "FILE*",
        ));
    }

    fn add_posix_apis(&mut self) {
        use ApiCategory::*;

        self.add_signature(ApiSignature::new(
            "open",
            FileIo,
            "Opens a file",
            &["const char*", "int", "..."],
            "int",
        ));
        self.add_signature(ApiSignature::new(
            "read",
            FileIo,
            "Reads from a file descriptor",
            &["int", "void*", "size_t"],
            "ssize_t",
        ));
        self.add_signature(ApiSignature::new(
            "write",
            FileIo,
            "Writes to a file descriptor",
            &["int", "const void*", "size_t"],
            "ssize_t",
        ));
    }
}

impl Default for ApiCallAnalyzer {
    fn default() -> Self {
        Self::new(ApiConfig::default())
    }
}

/// Symbolic name and call type for a call operand
pub fn resolve_target(target: &str) -> (String, CallType) {
    if let Some(address) = parse_literal(target) {
        (format!("sub_{:x}", address), CallType::Direct)
    } else if is_register(target) {
        (format!("indirect_call_{}", target), CallType::Indirect)
    } else if target.starts_with('[') || target.contains("ptr") {
        (target.to_string(), CallType::Dynamic)
    } else {
        (target.to_string(), CallType::Unknown)
    }
}

/// Up to `lookback` instructions before `index`, nearest first, stopping at a branch, call or return
fn preceding(instructions: &[Instruction], index: usize, lookback: usize) -> impl Iterator<Item = &Instruction> {
    instructions[..index]
        .iter()
        .rev()
        .take(lookback)
        .take_while(|ins| !(ins.is_jump() || ins.is_call() || ins.is_ret()))
}

/// Stack pushes become leading arguments; argument-register moves contribute their source
fn recover_arguments(instructions: &[Instruction], index: usize, lookback: usize) -> Vec<String> {
    let mut arguments = Vec::new();
    for ins in preceding(instructions, index, lookback) {
        if ins.mnemonic == "push" {
            if let Some(value) = ins.operand(0) {
                arguments.insert(0, value.to_string());
            }
        } else if ins.mnemonic.starts_with("mov") {
            if let (Some(dest), Some(source)) = (ins.operand(0), ins.operand(1)) {
                if ARGUMENT_REGISTER.is_match(dest) {
                    arguments.push(source.to_string());
                }
            }
        }
    }
    arguments
}
