use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::DegmlError;
use crate::instr::Instr;
use crate::opcode::OpCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchType {
    Unconditional,
    IfTrue,
    IfFalse,
}

impl BranchType {
    pub fn of(op: OpCode) -> Self {
        match op {
            OpCode::Brt => BranchType::IfTrue,
            OpCode::Brf => BranchType::IfFalse,
            _ => BranchType::Unconditional,
        }
    }

    pub fn invert(self) -> Self {
        match self {
            BranchType::IfTrue => BranchType::IfFalse,
            BranchType::IfFalse => BranchType::IfTrue,
            BranchType::Unconditional => BranchType::Unconditional,
        }
    }
}

pub type VertexId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphBranch {
    /// `None` when the edge leaves the function through its end offset.
    pub to: Option<VertexId>,
    pub ty: BranchType,
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphVertex {
    pub start: u32,
    /// Indices into the instruction table.
    pub instrs: Range<usize>,
    pub branches: Vec<GraphBranch>,
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph<'a> {
    instrs: &'a [Instr],
    vertices: Vec<GraphVertex>,
    by_offset: BTreeMap<u32, VertexId>,
    end: u32,
}

impl<'a> ControlFlowGraph<'a> {
    pub fn build(instrs: &'a [Instr]) -> Result<Self, DegmlError> {
        let end = match instrs.last() {
            Some(last) => last.next_offset()?,
            None => 0,
        };
        let offsets: BTreeSet<u32> = instrs.iter().map(|i| i.offset).collect();

        let mut leaders: BTreeSet<u32> = BTreeSet::new();
        if let Some(first) = instrs.first() {
            leaders.insert(first.offset);
        }
        for (idx, ins) in instrs.iter().enumerate() {
            let Some(t) = ins.target() else { continue };
            if t != end && !offsets.contains(&t) {
                return Err(DegmlError::BadBranchTarget { offset: ins.offset, target: t });
            }
            if !ins.opcode.is_branch() {
                continue;
            }
            if t != end {
                leaders.insert(t);
            }
            if let Some(next) = instrs.get(idx + 1) {
                leaders.insert(next.offset);
            }
        }

        let mut vertices: Vec<GraphVertex> = Vec::new();
        let mut by_offset: BTreeMap<u32, VertexId> = BTreeMap::new();
        for (idx, ins) in instrs.iter().enumerate() {
            if leaders.contains(&ins.offset) {
                by_offset.insert(ins.offset, vertices.len());
                vertices.push(GraphVertex { start: ins.offset, instrs: idx..idx, branches: Vec::new() });
            }
            if let Some(v) = vertices.last_mut() {
                v.instrs.end = idx + 1;
            }
        }

        for vi in 0..vertices.len() {
            let last = &instrs[vertices[vi].instrs.end - 1];
            let fallthrough = match vertices.get(vi + 1) {
                Some(next) => (Some(vi + 1), next.start),
                None => (None, end),
            };
            let mut branches = Vec::new();
            if last.opcode.is_branch() {
                let target = last.target().unwrap_or(end);
                let ty = BranchType::of(last.opcode);
                branches.push(GraphBranch { to: by_offset.get(&target).copied(), ty, target });
                if ty != BranchType::Unconditional {
                    branches.push(GraphBranch { to: fallthrough.0, ty: ty.invert(), target: fallthrough.1 });
                }
            } else if !matches!(last.opcode, OpCode::Ret | OpCode::Exit) && fallthrough.0.is_some() {
                branches.push(GraphBranch { to: fallthrough.0, ty: BranchType::Unconditional, target: fallthrough.1 });
            }
            trace!(start = vertices[vi].start, edges = branches.len(), "vertex");
            vertices[vi].branches = branches;
        }

        Ok(Self { instrs, vertices, by_offset, end })
    }

    pub fn vertices(&self) -> &[GraphVertex] {
        &self.vertices
    }

    pub fn vertex_at(&self, offset: u32) -> Option<VertexId> {
        self.by_offset.get(&offset).copied()
    }

    pub fn instrs_of(&self, id: VertexId) -> &'a [Instr] {
        &self.instrs[self.vertices[id].instrs.clone()]
    }

    /// Offset one past the last instruction.
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Incoming vertices of every vertex, ascending and without duplicates.
    pub fn predecessors(&self) -> Vec<Vec<VertexId>> {
        let mut preds: Vec<BTreeSet<VertexId>> = vec![BTreeSet::new(); self.vertices.len()];
        for (from, v) in self.vertices.iter().enumerate() {
            for to in v.branches.iter().filter_map(|b| b.to) {
                preds[to].insert(from);
            }
        }
        preds.into_iter().map(|p| p.into_iter().collect()).collect()
    }
}
