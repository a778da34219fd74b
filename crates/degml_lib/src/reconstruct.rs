//! Symbolic execution of basic blocks against an abstract operand stack.
//!
//! Values a block leaves on the stack flow into its successor when every
//! incoming edge of that successor brings the same depth. The two arms of a
//! short-circuit or ternary diamond merge into a [`Expression::Conditional`].

use tracing::warn;

use crate::DegmlError;
use crate::ast::{BinaryOperator, CallExpr, Expression, Scalar, SetStatement, Statement, UnaryOperator, VariableExpr};
use crate::cfg::{BranchType, ControlFlowGraph, VertexId};
use crate::instr::{Instr, Operand, PushValue, VarRef};
use crate::opcode::OpCode;
use crate::symbols::{SymbolRef, SymbolTable};
use crate::types::{DataType, InstanceType, VariableType};

struct Block<'s> {
    symbols: &'s dyn SymbolTable,
    lenient: bool,
    stack: Vec<Expression>,
    stmts: Vec<Statement>,
}

impl<'s> Block<'s> {
    fn pop(&mut self, offset: u32) -> Result<Expression, DegmlError> {
        self.stack.pop().ok_or(DegmlError::StackUnderflow { offset })
    }

    fn symbol(&self, index: u32) -> Result<SymbolRef, DegmlError> {
        self.symbols.resolve(index).cloned().ok_or(DegmlError::UnknownSymbol(index))
    }

    fn variable(&mut self, offset: u32, ty: DataType, instance: InstanceType, var: VarRef) -> Result<Expression, DegmlError> {
        let mut v = VariableExpr { symbol: self.symbol(var.index)?, access: var.kind, scope: instance, index: None, ty };
        Ok(match var.kind {
            VariableType::Array => {
                v.index = Some(Box::new(self.pop(offset)?));
                Expression::Variable(v)
            }
            VariableType::StackTop => {
                let owner = self.pop(offset)?;
                Expression::Member { owner: Box::new(owner), var: v }
            }
            VariableType::Plain | VariableType::Instance => Expression::Variable(v),
        })
    }

    fn step(&mut self, ins: &Instr) -> Result<(), DegmlError> {
        let off = ins.offset;
        match &ins.operand {
            Operand::Push { ty, value } => {
                let e = match value {
                    PushValue::Variable { instance, var } => self.variable(off, *ty, *instance, *var)?,
                    PushValue::String(idx) => {
                        let s = self.symbols.string(*idx).ok_or(DegmlError::UnknownString(*idx))?;
                        Expression::literal(*ty, Scalar::String(s.to_string()))
                    }
                    PushValue::Int16(v) | PushValue::Instance(v) => Expression::literal(*ty, Scalar::Int16(*v)),
                    PushValue::Int32(v) => Expression::literal(*ty, Scalar::Int32(*v)),
                    PushValue::Int64(v) => Expression::literal(*ty, Scalar::Int64(*v)),
                    PushValue::Double(v) => Expression::literal(*ty, Scalar::Double(*v)),
                    PushValue::Single(v) => Expression::literal(*ty, Scalar::Single(*v)),
                    PushValue::Bool(v) => Expression::literal(*ty, Scalar::Bool(*v)),
                };
                self.stack.push(e);
            }
            Operand::Dup { extra, .. } => {
                let n = *extra as usize + 1;
                if self.stack.len() < n {
                    if !self.lenient {
                        return Err(DegmlError::StackUnderflow { offset: off });
                    }
                    warn!(offset = off, depth = self.stack.len(), n, "dup past the block's stack");
                    self.stmts.push(Statement::Dup);
                    return Ok(());
                }
                let from = self.stack.len() - n;
                let copies: Vec<Expression> = self.stack[from..].to_vec();
                self.stack.extend(copies);
            }
            Operand::Set { t1, t2, instance, var } => {
                let mut index = None;
                let mut owner = None;
                match var.kind {
                    VariableType::Array => index = Some(self.pop(off)?),
                    VariableType::StackTop => owner = Some(Box::new(self.pop(off)?)),
                    VariableType::Plain | VariableType::Instance => {}
                }
                let value = self.pop(off)?;
                self.stmts.push(Statement::Set(SetStatement {
                    value,
                    access: var.kind,
                    scope: *instance,
                    target: self.symbol(var.index)?,
                    owner,
                    index,
                    ty: *t1,
                    original_type: *t2,
                }));
            }
            Operand::Call { ret, argc, function } => {
                let mut args = Vec::with_capacity(*argc as usize);
                for _ in 0..*argc {
                    args.push(self.pop(off)?);
                }
                let call = CallExpr { function: self.symbol(function.index)?, kind: function.kind, args, ty: *ret };
                self.stack.push(Expression::Call(call));
            }
            Operand::Goto { target } => {
                let target = *target;
                match ins.opcode {
                    OpCode::Brt | OpCode::Brf => {
                        let condition = self.pop(off)?;
                        self.stmts.push(Statement::Branch { ty: BranchType::of(ins.opcode), condition: Some(condition), target });
                    }
                    OpCode::PushEnv => {
                        let parent = self.pop(off)?;
                        self.stmts.push(Statement::PushEnv { parent, target, offset: off });
                    }
                    OpCode::PopEnv => self.stmts.push(Statement::PopEnv { target, offset: off }),
                    _ => self.stmts.push(Statement::Branch { ty: BranchType::Unconditional, condition: None, target }),
                }
            }
            Operand::Break { ty, signal } => self.stmts.push(Statement::Break { ty: *ty, signal: *signal }),
            Operand::Single { ty } => match ins.opcode {
                OpCode::Ret => {
                    let value = self.pop(off)?;
                    self.stmts.push(Statement::Return { ty: *ty, value: Some(value) });
                }
                OpCode::Exit => self.stmts.push(Statement::Return { ty: *ty, value: None }),
                OpCode::Popz => match self.stack.pop() {
                    Some(Expression::Call(c)) => self.stmts.push(Statement::Call(c)),
                    Some(e) => {
                        self.stmts.push(Statement::Push(e));
                        self.stmts.push(Statement::Pop);
                    }
                    None if self.lenient => {
                        warn!(offset = off, "popz on an empty block stack");
                        self.stmts.push(Statement::Pop);
                    }
                    None => return Err(DegmlError::StackUnderflow { offset: off }),
                },
                op => {
                    let op = UnaryOperator::from_opcode(op).ok_or(DegmlError::InvalidOpcode { offset: off, op: op.pair().version_f })?;
                    let input = self.pop(off)?;
                    let original_type = input.return_type();
                    self.stack.push(Expression::Unary { op, input: Box::new(input), ty: *ty, original_type });
                }
            },
            Operand::Double { t1, t2 } => {
                if ins.opcode == OpCode::Conv {
                    let input = self.pop(off)?;
                    let original_type = input.return_type();
                    self.stack.push(Expression::Unary { op: UnaryOperator::Convert, input: Box::new(input), ty: *t2, original_type });
                    return Ok(());
                }
                let op = BinaryOperator::from_opcode(ins.opcode)
                    .ok_or(DegmlError::InvalidOpcode { offset: off, op: ins.opcode.pair().version_f })?;
                let right = self.pop(off)?;
                let left = self.pop(off)?;
                let ty = if op.is_comparison() { DataType::Boolean } else { t1.widen(*t2) };
                let original_type = left.return_type();
                self.stack.push(Expression::Binary { op, left: Box::new(left), right: Box::new(right), ty, original_type });
            }
        }
        Ok(())
    }

}

/// Turns values left for a successor that could not take them into `push`
/// statements, placed before a trailing branch or return.
fn flush(mut stmts: Vec<Statement>, residue: Vec<Expression>, start: u32) -> Vec<Statement> {
    if residue.is_empty() {
        return stmts;
    }
    warn!(block = start, depth = residue.len(), "operand stack not empty at block end");
    let residue: Vec<Statement> = residue
        .into_iter()
        .map(|e| match e {
            Expression::Call(c) => Statement::Call(c),
            e => Statement::Push(e),
        })
        .collect();
    let at = match stmts.last() {
        Some(Statement::Branch { .. } | Statement::Return { .. }) => stmts.len() - 1,
        _ => stmts.len(),
    };
    stmts.splice(at..at, residue);
    stmts
}

fn execute(instrs: &[Instr], entry: Vec<Expression>, symbols: &dyn SymbolTable, lenient: bool) -> Result<(Vec<Statement>, Vec<Expression>), DegmlError> {
    let mut block = Block { symbols, lenient, stack: entry, stmts: Vec::new() };
    for ins in instrs {
        block.step(ins)?;
    }
    Ok((block.stmts, block.stack))
}

/// Reconstructs the statements of one vertex in isolation.
pub fn reconstruct_block(instrs: &[Instr], symbols: &dyn SymbolTable, lenient: bool) -> Result<Vec<Statement>, DegmlError> {
    let (stmts, stack) = execute(instrs, Vec::new(), symbols, lenient)?;
    Ok(flush(stmts, stack, instrs.first().map(|i| i.offset).unwrap_or(0)))
}

struct Done {
    stmts: Vec<Statement>,
    stack: Vec<Expression>,
    /// The residue was taken over by the successors.
    carried: bool,
}

struct Flow<'g, 'a> {
    graph: &'g ControlFlowGraph<'a>,
    preds: Vec<Vec<VertexId>>,
    done: Vec<Done>,
}

impl Flow<'_, '_> {
    /// Whether `p` hands its residue to its successors: every edge stays in
    /// the function and moves forward, and either all edges reach the same
    /// vertex or each successor is entered from `p` alone.
    fn offers(&self, p: VertexId) -> bool {
        let edges = &self.graph.vertices()[p].branches;
        let Some(first) = edges.first() else { return false };
        let single = edges.iter().all(|e| e.to == first.to);
        edges.iter().all(|e| match e.to {
            Some(s) => s > p && (single || self.preds[s] == [p]),
            None => false,
        })
    }

    /// The operand stack `v` starts with. Marks the predecessors whose residue
    /// it takes over.
    fn entry(&mut self, v: VertexId) -> Vec<Expression> {
        let preds = self.preds[v].clone();
        if preds.is_empty() || preds.iter().any(|&p| p >= v) || preds.iter().all(|&p| self.done[p].stack.is_empty()) {
            return Vec::new();
        }
        let start = self.graph.vertices()[v].start;
        if !preds.iter().all(|&p| self.offers(p)) {
            warn!(block = start, "predecessor residue cannot flow into the block");
            return Vec::new();
        }
        let depth = self.done[preds[0]].stack.len();
        if preds.iter().any(|&p| self.done[p].stack.len() != depth) {
            warn!(block = start, "predecessors leave different stack depths");
            return Vec::new();
        }

        let first = &self.done[preds[0]].stack;
        let below_agrees = preds.iter().all(|&p| self.done[p].stack[..depth - 1] == first[..depth - 1]);
        let top_agrees = preds.iter().all(|&p| self.done[p].stack[depth - 1] == first[depth - 1]);
        let entry = if below_agrees && top_agrees {
            first.clone()
        } else {
            let merged = match (below_agrees, preds.as_slice()) {
                (true, &[a, b]) => self.fold(v, a, b).or_else(|| self.fold(v, b, a)),
                _ => None,
            };
            let Some(top) = merged else {
                warn!(block = start, "predecessors leave different values");
                return Vec::new();
            };
            let mut entry = self.done[preds[0]].stack[..depth - 1].to_vec();
            entry.push(top);
            entry
        };
        for p in preds {
            self.done[p].carried = true;
        }
        entry
    }

    /// Folds a diamond that joins at `join` into one conditional value.
    /// `short` is entered when a chain of conditional branches jumps past
    /// `long`, as `&&`, `||` and `?:` compile. The branches feeding the
    /// diamond are dropped from the statement lists.
    fn fold(&mut self, join: VertexId, short: VertexId, long: VertexId) -> Option<Expression> {
        let join_start = self.graph.vertices()[join].start;
        if !passes_to(&self.done[short].stmts, join_start) || !passes_to(&self.done[long].stmts, join_start) {
            return None;
        }

        // Heads are collected from the one nearest `long` outwards.
        let mut heads: Vec<VertexId> = Vec::new();
        let mut taken_ty = None;
        let mut cur = long;
        loop {
            let &[h] = self.preds[cur].as_slice() else { return None };
            if h >= cur {
                return None;
            }
            let edges = &self.graph.vertices()[h].branches;
            let (taken, other) = (edges.first()?, edges.get(1)?);
            if taken.ty == BranchType::Unconditional || taken.to != Some(short) || other.to != Some(cur) {
                return None;
            }
            if *taken_ty.get_or_insert(taken.ty) != taken.ty {
                return None;
            }
            heads.push(h);
            let mut reached: Vec<VertexId> = heads.clone();
            reached.sort_unstable();
            if reached == self.preds[short] {
                break;
            }
            // An inner head must hold nothing but its branch.
            if self.done[h].stmts.len() != 1 || !self.done[h].stack.is_empty() {
                return None;
            }
            cur = h;
        }
        let outer = *heads.last()?;
        if heads.len() > 1 && !self.done[outer].stack.is_empty() {
            return None;
        }

        let short_value = self.done[short].stack.last()?.clone();
        let mut value = self.done[long].stack.last()?.clone();
        for &h in &heads {
            let Some(Statement::Branch { condition: Some(c), .. }) = self.done[h].stmts.last() else { return None };
            let (if_true, if_false) = match taken_ty? {
                BranchType::IfTrue => (short_value.clone(), value),
                _ => (value, short_value.clone()),
            };
            let ty = if if_true.return_type() == if_false.return_type() { if_true.return_type() } else { DataType::Variable };
            value = Expression::Conditional { condition: Box::new(c.clone()), if_true: Box::new(if_true), if_false: Box::new(if_false), ty };
        }

        for &h in &heads {
            self.done[h].stmts.pop();
        }
        for arm in [short, long] {
            if !self.done[arm].stmts.is_empty() {
                self.done[arm].stmts.pop();
            }
        }
        Some(value)
    }
}

/// Whether `stmts` is empty or only jumps to `target`.
fn passes_to(stmts: &[Statement], target: u32) -> bool {
    match stmts {
        [] => true,
        [Statement::Branch { ty: BranchType::Unconditional, target: t, .. }] => *t == target,
        _ => false,
    }
}

/// Reconstructs every vertex of `graph` in order, carrying operand stacks
/// across edges. The result holds one statement list per vertex.
pub fn reconstruct_graph(graph: &ControlFlowGraph<'_>, symbols: &dyn SymbolTable, lenient: bool) -> Result<Vec<Vec<Statement>>, DegmlError> {
    let mut flow = Flow { graph, preds: graph.predecessors(), done: Vec::with_capacity(graph.vertices().len()) };
    for v in 0..graph.vertices().len() {
        let entry = flow.entry(v);
        let (stmts, stack) = execute(graph.instrs_of(v), entry, symbols, lenient)?;
        flow.done.push(Done { stmts, stack, carried: false });
    }
    Ok(flow
        .done
        .into_iter()
        .zip(graph.vertices())
        .map(|(d, vertex)| if d.carried { d.stmts } else { flush(d.stmts, d.stack, vertex.start) })
        .collect())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::symbols::Symbols;

    fn symbols() -> Symbols {
        Symbols::new(
            vec![SymbolRef::variable("x"), SymbolRef::variable("arr"), SymbolRef::function("foo")],
            vec!["hi".into()],
        )
    }

    fn int(offset: u32, v: i16) -> Instr {
        Instr::new(offset, OpCode::Push, Operand::Push { ty: DataType::Int16, value: PushValue::Int16(v) })
    }

    fn var(offset: u32, index: u32, kind: VariableType) -> Instr {
        Instr::new(
            offset,
            OpCode::Push,
            Operand::Push {
                ty: DataType::Variable,
                value: PushValue::Variable { instance: InstanceType::SelfRef, var: VarRef { index, kind } },
            },
        )
    }

    fn call(offset: u32, argc: u16) -> Instr {
        Instr::new(offset, OpCode::Call, Operand::Call { ret: DataType::Variable, argc, function: VarRef { index: 2, kind: VariableType::Plain } })
    }

    fn single(offset: u32, op: OpCode) -> Instr {
        Instr::new(offset, op, Operand::Single { ty: DataType::Variable })
    }

    fn goto(offset: u32, op: OpCode, target: u32) -> Instr {
        Instr::new(offset, op, Operand::Goto { target })
    }

    fn run(instrs: &[Instr]) -> Result<Vec<Statement>, DegmlError> {
        reconstruct_block(instrs, &symbols(), false)
    }

    fn run_graph(instrs: &[Instr]) -> Result<Vec<Statement>, DegmlError> {
        let graph = ControlFlowGraph::build(instrs)?;
        Ok(reconstruct_graph(&graph, &symbols(), false)?.into_iter().flatten().collect())
    }

    #[test]
    fn binary_operands_pop_right_first() {
        let sub = Instr::new(8, OpCode::Sub, Operand::Double { t1: DataType::Int16, t2: DataType::Int16 });
        let stmts = run(&[int(0, 5), int(4, 3), sub, single(12, OpCode::Ret)]).unwrap();
        let Statement::Return { value: Some(Expression::Binary { left, right, .. }), .. } = &stmts[0] else {
            panic!("{stmts:?}")
        };
        assert_eq!(**left, Expression::literal(DataType::Int16, Scalar::Int16(5)));
        assert_eq!(**right, Expression::literal(DataType::Int16, Scalar::Int16(3)));
    }

    #[test]
    fn call_arguments_come_off_the_stack_in_order() {
        let stmts = run(&[int(0, 2), int(4, 1), call(8, 2), single(16, OpCode::Popz)]).unwrap();
        let Statement::Call(c) = &stmts[0] else { panic!("{stmts:?}") };
        let args = c.args.clone();
        assert_eq!(
            args,
            vec![Expression::literal(DataType::Int16, Scalar::Int16(1)), Expression::literal(DataType::Int16, Scalar::Int16(2))]
        );
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn unconsumed_call_becomes_a_statement() {
        let stmts = run(&[call(0, 0)]).unwrap();
        assert!(matches!(&stmts[..], [Statement::Call(_)]));
    }

    #[test]
    fn array_push_pops_its_index() {
        let stmts = run(&[int(0, 4), var(4, 1, VariableType::Array), single(12, OpCode::Ret)]).unwrap();
        let Statement::Return { value: Some(Expression::Variable(v)), .. } = &stmts[0] else { panic!("{stmts:?}") };
        assert_eq!(v.symbol.name, "arr");
        assert_eq!(v.index.as_deref(), Some(&Expression::literal(DataType::Int16, Scalar::Int16(4))));
    }

    #[test]
    fn stack_top_access_builds_a_member() {
        let stmts = run(&[var(0, 0, VariableType::Plain), var(8, 1, VariableType::StackTop), single(16, OpCode::Ret)]).unwrap();
        assert!(matches!(&stmts[0], Statement::Return { value: Some(Expression::Member { .. }), .. }));
    }

    #[test]
    fn dup_copies_the_top_entries() {
        let dup = Instr::new(8, OpCode::Dup, Operand::Dup { ty: DataType::Int16, extra: 1 });
        let syms = symbols();
        let mut block = Block { symbols: &syms, lenient: false, stack: Vec::new(), stmts: Vec::new() };
        for ins in [int(0, 1), int(4, 2), dup] {
            block.step(&ins).unwrap();
        }
        let values: Vec<_> = block.stack.iter().map(|e| match e {
            Expression::Literal { value: Scalar::Int16(v), .. } => *v,
            _ => unreachable!(),
        }).collect();
        assert_eq!(values, vec![1, 2, 1, 2]);
    }

    #[test]
    fn popping_an_empty_stack_underflows() {
        let err = run(&[single(0, OpCode::Ret)]).unwrap_err();
        assert!(matches!(err, DegmlError::StackUnderflow { offset: 0 }));
        let neg = Instr::new(4, OpCode::Neg, Operand::Single { ty: DataType::Int32 });
        assert!(matches!(run(&[neg]), Err(DegmlError::StackUnderflow { offset: 4 })));
    }

    #[test]
    fn lenient_mode_keeps_bare_pop_and_dup() {
        let dup = Instr::new(4, OpCode::Dup, Operand::Dup { ty: DataType::Int16, extra: 0 });
        let stmts = reconstruct_block(&[single(0, OpCode::Popz), dup], &symbols(), true).unwrap();
        assert_eq!(stmts, vec![Statement::Pop, Statement::Dup]);
    }

    #[test]
    fn residue_is_flushed_before_the_trailing_branch() {
        let br = Instr::new(4, OpCode::Br, Operand::Goto { target: 0 });
        let stmts = run(&[int(0, 7), br]).unwrap();
        assert_eq!(
            stmts,
            vec![
                Statement::Push(Expression::literal(DataType::Int16, Scalar::Int16(7))),
                Statement::Branch { ty: BranchType::Unconditional, condition: None, target: 0 },
            ]
        );
    }

    #[test]
    fn conversion_records_the_source_type() {
        let conv = Instr::new(4, OpCode::Conv, Operand::Double { t1: DataType::Int16, t2: DataType::Variable });
        let stmts = run(&[int(0, 1), conv, single(8, OpCode::Ret)]).unwrap();
        let Statement::Return { value: Some(Expression::Unary { op, ty, original_type, .. }), .. } = &stmts[0] else {
            panic!("{stmts:?}")
        };
        assert_eq!((*op, *ty, *original_type), (UnaryOperator::Convert, DataType::Variable, DataType::Int16));
    }

    #[test]
    fn string_push_resolves_through_the_table() {
        let push = Instr::new(0, OpCode::Push, Operand::Push { ty: DataType::String, value: PushValue::String(0) });
        let stmts = run(&[push, single(8, OpCode::Ret)]).unwrap();
        assert!(matches!(&stmts[0], Statement::Return { value: Some(Expression::Literal { value: Scalar::String(s), .. }), .. } if s == "hi"));
        let missing = Instr::new(0, OpCode::Push, Operand::Push { ty: DataType::String, value: PushValue::String(9) });
        assert!(matches!(run(&[missing]), Err(DegmlError::UnknownString(9))));
    }

    #[test]
    fn ternary_argument_keeps_the_value_below_it() {
        let stmts = run_graph(&[
            int(0, 1),
            var(4, 0, VariableType::Plain),
            goto(12, OpCode::Brf, 24),
            int(16, 2),
            goto(20, OpCode::Br, 28),
            int(24, 3),
            call(28, 2),
            single(36, OpCode::Popz),
        ])
        .unwrap();
        assert_eq!(stmts.len(), 1, "{stmts:?}");
        assert_eq!(crate::render::statement(&stmts[0]).unwrap(), "call (foo:var (? self.x 2s 3s) 1s)");
    }

    #[test]
    fn or_chain_folds_right_to_left() {
        let stmts = run_graph(&[
            var(0, 0, VariableType::Plain),
            goto(8, OpCode::Brt, 32),
            var(12, 1, VariableType::Plain),
            goto(20, OpCode::Brt, 32),
            int(24, 5),
            goto(28, OpCode::Br, 36),
            int(32, 1),
            single(36, OpCode::Ret),
        ])
        .unwrap();
        assert_eq!(stmts.len(), 1, "{stmts:?}");
        assert_eq!(crate::render::statement(&stmts[0]).unwrap(), "ret var (? self.x 1s (? self.arr 1s 5s))");
    }

    #[test]
    fn disagreeing_depths_fall_back_to_push_statements() {
        let exit = Instr::new(16, OpCode::Exit, Operand::Single { ty: DataType::Int32 });
        let stmts = run_graph(&[int(0, 1), int(4, 2), goto(8, OpCode::Brf, 16), int(12, 3), exit]).unwrap();
        let lit = |v| Expression::literal(DataType::Int16, Scalar::Int16(v));
        assert_eq!(
            stmts,
            vec![
                Statement::Push(lit(1)),
                Statement::Branch { ty: BranchType::IfFalse, condition: Some(lit(2)), target: 16 },
                Statement::Push(lit(3)),
                Statement::Return { ty: DataType::Int32, value: None },
            ]
        );
    }

    #[test]
    fn loop_header_starts_with_an_empty_stack() {
        // The back edge from the body never carries values into the header.
        let stmts = run_graph(&[int(0, 1), goto(4, OpCode::Brt, 0), single(8, OpCode::Exit)]).unwrap();
        assert_eq!(
            stmts,
            vec![
                Statement::Branch {
                    ty: BranchType::IfTrue,
                    condition: Some(Expression::literal(DataType::Int16, Scalar::Int16(1))),
                    target: 0
                },
                Statement::Return { ty: DataType::Variable, value: None },
            ]
        );
    }
}
