use serde::{Deserialize, Serialize};

use crate::cfg::BranchType;
use crate::opcode::OpCode;
use crate::symbols::SymbolRef;
use crate::types::{DataType, InstanceType, VariableType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOperator {
    Negation,
    Complement,
    Convert,
}

impl UnaryOperator {
    pub fn from_opcode(op: OpCode) -> Option<Self> {
        Some(match op {
            OpCode::Neg => UnaryOperator::Negation,
            OpCode::Not => UnaryOperator::Complement,
            OpCode::Conv => UnaryOperator::Convert,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOperator {
    Addition,
    Subtraction,
    Multiplication,
    Division,
    Remainder,
    Modulo,
    And,
    Or,
    Xor,
    LeftShift,
    RightShift,
    Equality,
    Inequality,
    GreaterThan,
    LowerThan,
    GTOrEqual,
    LTOrEqual,
}

impl BinaryOperator {
    pub fn from_opcode(op: OpCode) -> Option<Self> {
        Some(match op {
            OpCode::Add => BinaryOperator::Addition,
            OpCode::Sub => BinaryOperator::Subtraction,
            OpCode::Mul => BinaryOperator::Multiplication,
            OpCode::Div => BinaryOperator::Division,
            OpCode::Rem => BinaryOperator::Remainder,
            OpCode::Mod => BinaryOperator::Modulo,
            OpCode::And => BinaryOperator::And,
            OpCode::Or => BinaryOperator::Or,
            OpCode::Xor => BinaryOperator::Xor,
            OpCode::Shl => BinaryOperator::LeftShift,
            OpCode::Shr => BinaryOperator::RightShift,
            OpCode::Ceq => BinaryOperator::Equality,
            OpCode::Cne => BinaryOperator::Inequality,
            OpCode::Cgt => BinaryOperator::GreaterThan,
            OpCode::Clt => BinaryOperator::LowerThan,
            OpCode::Cge => BinaryOperator::GTOrEqual,
            OpCode::Cle => BinaryOperator::LTOrEqual,
            _ => return None,
        })
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOperator::Equality
                | BinaryOperator::Inequality
                | BinaryOperator::GreaterThan
                | BinaryOperator::LowerThan
                | BinaryOperator::GTOrEqual
                | BinaryOperator::LTOrEqual
        )
    }
}

/// Literal payload. Its tag must agree with the literal's declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Double(f64),
    Single(f32),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    String(String),
}

impl Scalar {
    pub fn tag(&self) -> &'static str {
        match self {
            Scalar::Bool(_) => "bool",
            Scalar::Double(_) => "double",
            Scalar::Single(_) => "float",
            Scalar::Int16(_) => "short",
            Scalar::Int32(_) => "int",
            Scalar::Int64(_) => "long",
            Scalar::String(_) => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableExpr {
    pub symbol: SymbolRef,
    pub access: VariableType,
    pub scope: InstanceType,
    /// Present iff `access` is `Array`.
    pub index: Option<Box<Expression>>,
    pub ty: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallExpr {
    pub function: SymbolRef,
    pub kind: VariableType,
    pub args: Vec<Expression>,
    pub ty: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal {
        ty: DataType,
        value: Scalar,
    },
    Variable(VariableExpr),
    /// Field access through an owner expression (`owner:name`).
    Member {
        owner: Box<Expression>,
        var: VariableExpr,
    },
    Unary {
        op: UnaryOperator,
        input: Box<Expression>,
        ty: DataType,
        original_type: DataType,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
        ty: DataType,
        original_type: DataType,
    },
    Call(CallExpr),
    /// A value merged from the two arms of a short-circuit or ternary diamond.
    Conditional {
        condition: Box<Expression>,
        if_true: Box<Expression>,
        if_false: Box<Expression>,
        ty: DataType,
    },
}

impl Expression {
    pub fn literal(ty: DataType, value: Scalar) -> Self {
        Expression::Literal { ty, value }
    }

    pub fn return_type(&self) -> DataType {
        match self {
            Expression::Literal { ty, .. } => *ty,
            Expression::Variable(v) | Expression::Member { var: v, .. } => v.ty,
            Expression::Unary { ty, .. } | Expression::Binary { ty, .. } | Expression::Conditional { ty, .. } => *ty,
            Expression::Call(c) => c.ty,
        }
    }

    /// Visits this node and every sub-expression, parents first.
    pub fn walk(&self, f: &mut impl FnMut(&Expression)) {
        f(self);
        match self {
            Expression::Literal { .. } => {}
            Expression::Variable(v) => {
                if let Some(i) = &v.index {
                    i.walk(f);
                }
            }
            Expression::Member { owner, var } => {
                owner.walk(f);
                if let Some(i) = &var.index {
                    i.walk(f);
                }
            }
            Expression::Unary { input, .. } => input.walk(f),
            Expression::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expression::Call(c) => {
                for a in &c.args {
                    a.walk(f);
                }
            }
            Expression::Conditional { condition, if_true, if_false, .. } => {
                condition.walk(f);
                if_true.walk(f);
                if_false.walk(f);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetStatement {
    pub value: Expression,
    pub access: VariableType,
    pub scope: InstanceType,
    pub target: SymbolRef,
    /// Owner expression for stack-top destinations.
    pub owner: Option<Box<Expression>>,
    /// Present iff `access` is `Array`.
    pub index: Option<Expression>,
    pub ty: DataType,
    pub original_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Set(SetStatement),
    Call(CallExpr),
    Branch {
        ty: BranchType,
        /// `None` iff `ty` is `Unconditional`.
        condition: Option<Expression>,
        target: u32,
    },
    Break {
        ty: DataType,
        signal: u16,
    },
    /// `value` is `None` for `exit`.
    Return {
        ty: DataType,
        value: Option<Expression>,
    },
    PushEnv {
        parent: Expression,
        target: u32,
        offset: u32,
    },
    PopEnv {
        target: u32,
        offset: u32,
    },
    Push(Expression),
    Pop,
    Dup,
    Label(u32),
    /// A reconciled `pushenv`/`popenv` pair.
    Scoped {
        parent: Expression,
        target: u32,
        body: Vec<Statement>,
    },
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn walk_visits_parents_first() {
        let e = Expression::Binary {
            op: BinaryOperator::Addition,
            left: Box::new(Expression::literal(DataType::Int32, Scalar::Int32(1))),
            right: Box::new(Expression::Unary {
                op: UnaryOperator::Negation,
                input: Box::new(Expression::literal(DataType::Int32, Scalar::Int32(2))),
                ty: DataType::Int32,
                original_type: DataType::Int32,
            }),
            ty: DataType::Int32,
            original_type: DataType::Int32,
        };
        let mut seen = Vec::new();
        e.walk(&mut |n| seen.push(n.return_type()));
        assert_eq!(seen.len(), 4);
        assert!(matches!(e, Expression::Binary { .. }));
    }

    #[test]
    fn comparison_opcodes_map_to_comparison_operators() {
        for op in [OpCode::Clt, OpCode::Cle, OpCode::Ceq, OpCode::Cne, OpCode::Cge, OpCode::Cgt] {
            assert!(BinaryOperator::from_opcode(op).is_some_and(BinaryOperator::is_comparison));
        }
        assert_eq!(BinaryOperator::from_opcode(OpCode::Popz), None);
    }
}
