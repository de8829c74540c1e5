//! Decoded instruction representation

use binlift_core::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse instruction category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionType {
    Arithmetic,
    Logical,
    Memory,
    ControlFlow,
    System,
    Unknown,
}

/// A single decoded instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: Address,
    /// Lowercase mnemonic (`db` for an undecodable byte)
    pub mnemonic: String,
    pub operands: Vec<String>,
    pub bytes: Vec<u8>,
    pub kind: InstructionType,
}

impl Instruction {
    pub fn new(
        address: u64,
        mnemonic: impl Into<String>,
        operands: Vec<String>,
        bytes: &[u8],
        kind: InstructionType,
    ) -> Self {
        Self {
            address: Address::new(address),
            mnemonic: mnemonic.into(),
            operands,
            bytes: bytes.to_vec(),
            kind,
        }
    }

    /// One-byte opaque pseudo-instruction for bytes the decoder does not model
    pub fn raw_byte(address: u64, byte: u8) -> Self {
        Self::new(
            address,
            "db",
            vec![format!("0x{:02X}", byte)],
            &[byte],
            InstructionType::Unknown,
        )
    }

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the following instruction
    pub fn next_address(&self) -> u64 {
        self.address.as_u64().wrapping_add(self.len() as u64)
    }

    pub fn operand(&self, index: usize) -> Option<&str> {
        self.operands.get(index).map(String::as_str)
    }

    pub fn is_jump(&self) -> bool {
        self.mnemonic.starts_with('j')
    }

    pub fn is_unconditional_jump(&self) -> bool {
        self.mnemonic == "jmp"
    }

    pub fn is_conditional_jump(&self) -> bool {
        self.is_jump() && !self.is_unconditional_jump()
    }

    pub fn is_call(&self) -> bool {
        self.mnemonic == "call"
    }

    pub fn is_ret(&self) -> bool {
        self.mnemonic.starts_with("ret")
    }

    pub fn is_interrupt(&self) -> bool {
        self.mnemonic == "int" || self.mnemonic == "int3"
    }

    /// Ends a basic block: jump, call, return or interrupt
    pub fn is_control_flow(&self) -> bool {
        self.is_jump() || self.is_call() || self.is_ret() || self.is_interrupt()
    }

    /// Literal branch target of a jump or call (`0x`-prefixed hex or plain decimal)
    pub fn branch_target(&self) -> Option<u64> {
        self.operand(0).and_then(parse_literal)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}: {}", self.address.as_u64(), self.mnemonic)?;
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands.join(", "))?;
        }
        Ok(())
    }
}

/// Parse an operand written as `0x<hex>` or as decimal digits
pub fn parse_literal(operand: &str) -> Option<u64> {
    if let Some(hex) = operand.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if !operand.is_empty() && operand.bytes().all(|b| b.is_ascii_digit()) {
        operand.parse().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(mnemonic: &str, operands: &[&str]) -> Instruction {
        Instruction::new(
            0x1000,
            mnemonic,
            operands.iter().map(|s| s.to_string()).collect(),
            &[0x90],
            InstructionType::Unknown,
        )
    }

    #[test]
    fn test_display() {
        assert_eq!(ins("ret", &[]).to_string(), "0x00001000: ret");
        assert_eq!(ins("mov", &["eax", "ebx"]).to_string(), "0x00001000: mov eax, ebx");
        assert_eq!(Instruction::raw_byte(0x20, 0xAB).to_string(), "0x00000020: db 0xAB");
    }

    #[test]
    fn test_control_flow_predicates() {
        assert!(ins("jmp", &["0x2000"]).is_unconditional_jump());
        assert!(ins("jne", &["0x2000"]).is_conditional_jump());
        assert!(!ins("jmp", &["0x2000"]).is_conditional_jump());
        assert!(ins("ret", &["0x0008"]).is_ret());
        assert!(ins("int", &["0x2D"]).is_control_flow());
        assert!(ins("int3", &[]).is_control_flow());
        assert!(ins("call", &["eax"]).is_control_flow());
        assert!(!ins("push", &["eax"]).is_control_flow());
        assert!(!ins("nop", &[]).is_control_flow());
    }

    #[test]
    fn test_branch_target() {
        assert_eq!(ins("call", &["0x00401000"]).branch_target(), Some(0x401000));
        assert_eq!(ins("jmp", &["4096"]).branch_target(), Some(4096));
        assert_eq!(ins("call", &["eax"]).branch_target(), None);
        assert_eq!(ins("ret", &[]).branch_target(), None);
        assert_eq!(parse_literal("0xZZ"), None);
        assert_eq!(parse_literal(""), None);
    }
}
