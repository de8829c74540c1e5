//! Control-flow graph construction over a disassembled function

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use binlift_core::Address;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::DisassembledFunction;
use crate::instruction::Instruction;

/// A run of instructions with a single entry and a single exit
///
/// Instructions are not copied: `instructions` indexes the owning function's list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub start_address: Address,
    /// Address of the last instruction in the block
    pub end_address: Address,
    pub instructions: Range<usize>,
}

impl BasicBlock {
    pub fn instructions<'a>(&self, function: &'a [Instruction]) -> &'a [Instruction] {
        &function[self.instructions.clone()]
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    FallThrough,
    Unconditional,
    ConditionalTrue,
    ConditionalFalse,
}

/// Directed edge between two blocks, by block index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: usize,
    pub target: usize,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopKind {
    While,
}

/// Loop found from a back edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    /// Block index of the loop header (the back edge's target)
    pub header: usize,
    /// Index into `ControlFlowGraph::edges`
    pub back_edge: usize,
    pub kind: LoopKind,
    /// Blocks laid out between the header and the back edge's source, inclusive
    pub body: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternKind {
    IfElse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub kind: PatternKind,
    pub block: usize,
}

/// A `call` with a literal target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub address: Address,
    pub target_address: Address,
    /// `sub_<hex target>`
    pub target_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlFlowGraph {
    /// Start address of the function this graph belongs to
    pub function: Address,
    pub blocks: Vec<BasicBlock>,
    pub edges: Vec<Edge>,
    pub loops: Vec<Loop>,
    pub calls: Vec<FunctionCall>,
    pub patterns: Vec<Pattern>,
}

impl ControlFlowGraph {
    pub fn outgoing(&self, block: usize) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.source == block)
    }

    pub fn incoming(&self, block: usize) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.target == block)
    }

    fn add_edge(&mut self, source: usize, target: usize, kind: EdgeKind) {
        self.edges.push(Edge { source, target, kind });
    }
}

/// Builds control-flow graphs
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlFlowAnalyzer;

impl ControlFlowAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Build the graph of one function
    pub fn analyze_function(&self, function: &DisassembledFunction) -> ControlFlowGraph {
        let instructions = &function.instructions;
        let mut cfg = ControlFlowGraph {
            function: function.start_address,
            ..Default::default()
        };
        if instructions.is_empty() {
            return cfg;
        }

        cfg.blocks = build_blocks(instructions);
        build_edges(&mut cfg, instructions);
        find_loops(&mut cfg);
        cfg.calls = find_calls(instructions);
        find_patterns(&mut cfg);

        debug!(
            "{}: {} blocks, {} edges, {} loops",
            function.name,
            cfg.blocks.len(),
            cfg.edges.len(),
            cfg.loops.len()
        );
        cfg
    }

    /// Build and attach a graph to every function
    pub fn analyze_all(&self, functions: &mut [DisassembledFunction]) {
        for function in functions.iter_mut() {
            let cfg = self.analyze_function(function);
            function.attach_cfg(cfg);
        }
    }
}

/// First instruction, literal jump/call targets, and every instruction after a control transfer
fn find_leaders(instructions: &[Instruction]) -> BTreeSet<u64> {
    let mut leaders = BTreeSet::new();
    if let Some(first) = instructions.first() {
        leaders.insert(first.address.as_u64());
    }

    for (i, instruction) in instructions.iter().enumerate() {
        if instruction.is_jump() || instruction.is_call() {
            if let Some(target) = instruction.branch_target() {
                leaders.insert(target);
            }
        }
        if instruction.is_control_flow() {
            if let Some(next) = instructions.get(i + 1) {
                leaders.insert(next.address.as_u64());
            }
        }
    }
    leaders
}

fn build_blocks(instructions: &[Instruction]) -> Vec<BasicBlock> {
    let leaders = find_leaders(instructions);
    let mut blocks = Vec::new();
    let mut start: Option<usize> = None;

    let close = |blocks: &mut Vec<BasicBlock>, from: usize, to: usize| {
        blocks.push(BasicBlock {
            start_address: instructions[from].address,
            end_address: instructions[to - 1].address,
            instructions: from..to,
        });
    };

    for (i, instruction) in instructions.iter().enumerate() {
        if leaders.contains(&instruction.address.as_u64()) {
            if let Some(from) = start.take() {
                close(&mut blocks, from, i);
            }
            start = Some(i);
        }
        if instruction.is_control_flow() {
            if let Some(from) = start.take() {
                close(&mut blocks, from, i + 1);
            }
        }
    }
    if let Some(from) = start {
        close(&mut blocks, from, instructions.len());
    }
    blocks
}

fn build_edges(cfg: &mut ControlFlowGraph, instructions: &[Instruction]) {
    let by_address: HashMap<u64, usize> = cfg
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.start_address.as_u64(), i))
        .collect();

    for i in 0..cfg.blocks.len() {
        let Some(last) = cfg.blocks[i].instructions(instructions).last() else {
            continue;
        };
        let target = last
            .branch_target()
            .and_then(|t| by_address.get(&t).copied());
        let next = (i + 1 < cfg.blocks.len()).then_some(i + 1);

        if last.is_unconditional_jump() {
            if let Some(target) = target {
                cfg.add_edge(i, target, EdgeKind::Unconditional);
            }
        } else if last.is_conditional_jump() {
            if let Some(target) = target {
                cfg.add_edge(i, target, EdgeKind::ConditionalTrue);
            }
            if let Some(next) = next {
                cfg.add_edge(i, next, EdgeKind::ConditionalFalse);
            }
        } else if !last.is_ret() {
            if let Some(next) = next {
                cfg.add_edge(i, next, EdgeKind::FallThrough);
            }
        }
    }
}

/// Back edges by layout order: the target block starts before the source block
fn find_loops(cfg: &mut ControlFlowGraph) {
    let loops: Vec<Loop> = cfg
        .edges
        .iter()
        .enumerate()
        .filter(|(_, e)| cfg.blocks[e.target].start_address < cfg.blocks[e.source].start_address)
        .map(|(index, e)| Loop {
            header: e.target,
            back_edge: index,
            kind: LoopKind::While,
            body: (e.target.min(e.source)..=e.source.max(e.target)).collect(),
        })
        .collect();
    cfg.loops = loops;
}

fn find_calls(instructions: &[Instruction]) -> Vec<FunctionCall> {
    instructions
        .iter()
        .filter(|i| i.is_call())
        .filter_map(|i| {
            let target = i.branch_target()?;
            Some(FunctionCall {
                address: i.address,
                target_address: Address::new(target),
                target_name: format!("sub_{:x}", target),
            })
        })
        .collect()
}

/// A block whose only exits are a taken and a not-taken branch
fn find_patterns(cfg: &mut ControlFlowGraph) {
    let patterns: Vec<Pattern> = (0..cfg.blocks.len())
        .filter(|&block| {
            let kinds: Vec<EdgeKind> = cfg.outgoing(block).map(|e| e.kind).collect();
            kinds.len() == 2
                && kinds.contains(&EdgeKind::ConditionalTrue)
                && kinds.contains(&EdgeKind::ConditionalFalse)
        })
        .map(|block| Pattern {
            kind: PatternKind::IfElse,
            block,
        })
        .collect();
    cfg.patterns = patterns;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::X86Decoder;
    use crate::engine::DisassemblyEngine;

    fn function(code: &[u8]) -> DisassembledFunction {
        let mut functions = DisassemblyEngine::default().disassemble_section(
            &X86Decoder::new(false),
            code,
            0x1000,
            code.len() as u64,
        );
        functions.remove(0)
    }

    fn assert_partition(f: &DisassembledFunction, cfg: &ControlFlowGraph) {
        let mut next = 0;
        for block in &cfg.blocks {
            assert!(!block.is_empty());
            assert_eq!(block.instructions.start, next);
            next = block.instructions.end;
            let body = block.instructions(&f.instructions);
            for ins in &body[..body.len() - 1] {
                assert!(!ins.is_control_flow());
            }
        }
        assert_eq!(next, f.instructions.len());
    }

    #[test]
    fn test_single_block_push_ret() {
        let f = function(&[0x50, 0xC3]);
        let cfg = ControlFlowAnalyzer::new().analyze_function(&f);
        assert_eq!(cfg.blocks.len(), 1);
        assert!(cfg.edges.is_empty());
        assert!(cfg.loops.is_empty());
        assert_partition(&f, &cfg);
    }

    #[test]
    fn test_conditional_branch_is_if_else() {
        // 1000: je 1004 / 1002: push eax / 1003: nop / 1004: pop eax / 1005: ret
        let f = function(&[0x74, 0x02, 0x50, 0x90, 0x58, 0xC3]);
        let cfg = ControlFlowAnalyzer::new().analyze_function(&f);
        assert_partition(&f, &cfg);

        let starts: Vec<u64> = cfg.blocks.iter().map(|b| b.start_address.as_u64()).collect();
        assert_eq!(starts, vec![0x1000, 0x1002, 0x1004]);

        let kinds: Vec<(usize, usize, EdgeKind)> = cfg.edges.iter().map(|e| (e.source, e.target, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (0, 2, EdgeKind::ConditionalTrue),
                (0, 1, EdgeKind::ConditionalFalse),
                (1, 2, EdgeKind::FallThrough),
            ]
        );
        assert_eq!(cfg.patterns, vec![Pattern { kind: PatternKind::IfElse, block: 0 }]);
        assert!(cfg.loops.is_empty());
    }

    #[test]
    fn test_backward_jump_is_loop() {
        // 1000: nop / 1001: push eax / 1002: je 1006 / 1004: jmp 1001 / 1006: ret
        let f = function(&[0x90, 0x50, 0x74, 0x02, 0xEB, 0xFB, 0xC3]);
        let cfg = ControlFlowAnalyzer::new().analyze_function(&f);
        assert_partition(&f, &cfg);
        assert_eq!(cfg.blocks.len(), 4);

        assert_eq!(cfg.loops.len(), 1);
        let l = &cfg.loops[0];
        assert_eq!(cfg.blocks[l.header].start_address, Address::new(0x1001));
        assert_eq!(cfg.edges[l.back_edge].kind, EdgeKind::Unconditional);
        assert_eq!(l.body, vec![1, 2]);
    }

    #[test]
    fn test_self_loop_is_not_a_back_edge() {
        // 1000: push eax / 1001: jne 1000 / 1003: ret
        let f = function(&[0x50, 0x75, 0xFD, 0xC3]);
        let cfg = ControlFlowAnalyzer::new().analyze_function(&f);
        assert!(cfg.edges.iter().any(|e| e.source == 0 && e.target == 0));
        assert!(cfg.loops.is_empty());
    }

    #[test]
    fn test_call_sites_and_called_functions() {
        // call 0x2000 / ret
        let mut functions = vec![function(&[0xE8, 0xFB, 0x0F, 0x00, 0x00, 0xC3])];
        ControlFlowAnalyzer::new().analyze_all(&mut functions);

        let f = &functions[0];
        let cfg = f.cfg.as_ref().unwrap();
        assert_eq!(cfg.calls.len(), 1);
        assert_eq!(cfg.calls[0].target_address, Address::new(0x2000));
        assert_eq!(cfg.calls[0].target_name, "sub_2000");
        assert!(f.called_functions.contains("sub_2000"));
        // The call ends its block and falls through to the return
        assert_eq!(cfg.blocks.len(), 2);
        assert_eq!(cfg.edges[0].kind, EdgeKind::FallThrough);
    }

    #[test]
    fn test_unconditional_jump_has_no_fallthrough() {
        // 1000: jmp 1003 / 1002: nop / 1003: ret
        let f = function(&[0xEB, 0x01, 0x90, 0xC3]);
        let cfg = ControlFlowAnalyzer::new().analyze_function(&f);
        assert_partition(&f, &cfg);
        assert_eq!(cfg.blocks.len(), 3);
        let outgoing: Vec<&Edge> = cfg.outgoing(0).collect();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].kind, EdgeKind::Unconditional);
        assert_eq!(outgoing[0].target, 2);
        assert_eq!(cfg.incoming(2).count(), 2);
    }

    #[test]
    fn test_empty_function() {
        let f = DisassembledFunction::new(0x1000, Vec::new());
        let cfg = ControlFlowAnalyzer::new().analyze_function(&f);
        assert!(cfg.blocks.is_empty());
        assert!(cfg.edges.is_empty());
    }
}
