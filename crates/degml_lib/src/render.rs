//! Canonical text form of expressions and statements.
//!
//! Downstream diff/patch tooling depends on this output byte for byte: one
//! space between tokens, six uppercase hex digits for offsets, and fixed
//! literal suffixes.

use std::fmt::{self, Write as _};

use crate::DegmlError;
use crate::ast::{BinaryOperator, CallExpr, Expression, Scalar, SetStatement, Statement, UnaryOperator, VariableExpr};
use crate::cfg::BranchType;
use crate::types::DataType;

pub const INDENT: &str = "    ";

impl fmt::Display for UnaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOperator::Negation => "-",
            UnaryOperator::Complement => "~",
            UnaryOperator::Convert => "conv",
        })
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOperator::Addition => "+",
            BinaryOperator::Subtraction => "-",
            BinaryOperator::Multiplication => "*",
            BinaryOperator::Division => "/",
            BinaryOperator::Remainder => "rem",
            BinaryOperator::Modulo => "%",
            BinaryOperator::And => "&",
            BinaryOperator::Or => "|",
            BinaryOperator::Xor => "^",
            BinaryOperator::LeftShift => "<<",
            BinaryOperator::RightShift => ">>",
            BinaryOperator::Equality => "==",
            BinaryOperator::Inequality => "!=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::LowerThan => "<",
            BinaryOperator::GTOrEqual => ">=",
            BinaryOperator::LTOrEqual => "<=",
        })
    }
}

pub fn hex(offset: u32) -> String {
    format!("0x{offset:06X}")
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Formats `v` the way .NET's general format does with `precision`
/// significant digits: trailing zeros dropped, positional notation for
/// decimal exponents in `-5 < e < precision`, `E+NN`/`E-NN` otherwise.
pub fn general(v: f64, precision: usize) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if v == 0.0 {
        return "0".to_string();
    }

    let sci = format!("{:.*e}", precision.saturating_sub(1), v.abs());
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let digits = digits.trim_end_matches('0');
    let digits = if digits.is_empty() { "0" } else { digits };

    let mut out = String::new();
    if v < 0.0 {
        out.push('-');
    }
    if exp > -5 && exp < precision as i32 {
        if exp < 0 {
            out.push_str("0.");
            out.extend(std::iter::repeat_n('0', (-exp - 1) as usize));
            out.push_str(digits);
        } else {
            let int_len = exp as usize + 1;
            if digits.len() > int_len {
                out.push_str(&digits[..int_len]);
                out.push('.');
                out.push_str(&digits[int_len..]);
            } else {
                out.push_str(digits);
                out.extend(std::iter::repeat_n('0', int_len - digits.len()));
            }
        }
    } else {
        out.push_str(&digits[..1]);
        if digits.len() > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        let _ = write!(out, "E{}{:02}", if exp < 0 { '-' } else { '+' }, exp.unsigned_abs());
    }
    out
}

/// Renders a literal of declared type `ty`; the scalar's tag must match it.
pub fn literal(ty: DataType, value: &Scalar) -> Result<String, DegmlError> {
    Ok(match (ty, value) {
        (DataType::Boolean, Scalar::Bool(b)) => b.to_string(),
        (DataType::Double, Scalar::Double(v)) => format!("{}d", general(*v, 15)),
        (DataType::Single, Scalar::Single(v)) => format!("{}f", general(f64::from(*v), 7)),
        (DataType::Int16, Scalar::Int16(v)) => format!("{v}s"),
        (DataType::Int32, Scalar::Int32(v)) => v.to_string(),
        (DataType::Int64, Scalar::Int64(v)) => v.to_string(),
        (DataType::String, Scalar::String(s)) => escape(s),
        (DataType::Instance, Scalar::Int16(v)) => format!("({ty} {v})"),
        _ => return Err(DegmlError::TypeMismatch { expected: ty, found: value.tag() }),
    })
}

fn write_variable(out: &mut String, v: &VariableExpr, owner: Option<&Expression>) -> Result<(), DegmlError> {
    match owner {
        Some(o) => {
            write_expression(out, o)?;
            out.push(':');
        }
        None => {
            let _ = write!(out, "{}.", v.scope);
        }
    }
    out.push_str(&v.symbol.name);
    match &v.index {
        Some(i) => {
            out.push('[');
            write_expression(out, i)?;
            out.push(']');
        }
        None if owner.is_none() => out.push_str(v.access.suffix()),
        None => {}
    }
    Ok(())
}

fn write_call(out: &mut String, c: &CallExpr) -> Result<(), DegmlError> {
    let _ = write!(out, "({}{}:{}", c.function.name, c.kind.suffix(), c.ty);
    for a in &c.args {
        out.push(' ');
        write_expression(out, a)?;
    }
    out.push(')');
    Ok(())
}

fn write_expression(out: &mut String, e: &Expression) -> Result<(), DegmlError> {
    match e {
        Expression::Literal { ty, value } => out.push_str(&literal(*ty, value)?),
        Expression::Variable(v) => write_variable(out, v, None)?,
        Expression::Member { owner, var } => write_variable(out, var, Some(owner))?,
        Expression::Unary { op, input, ty, .. } => {
            match op {
                UnaryOperator::Convert => { let _ = write!(out, "({ty} "); }
                op => { let _ = write!(out, "({op} "); }
            }
            write_expression(out, input)?;
            out.push(')');
        }
        Expression::Binary { op, left, right, .. } => {
            let _ = write!(out, "({op} ");
            write_expression(out, left)?;
            out.push(' ');
            write_expression(out, right)?;
            out.push(')');
        }
        Expression::Call(c) => write_call(out, c)?,
        Expression::Conditional { condition, if_true, if_false, .. } => {
            out.push_str("(? ");
            for (i, e) in [condition, if_true, if_false].into_iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_expression(out, e)?;
            }
            out.push(')');
        }
    }
    Ok(())
}

pub fn expression(e: &Expression) -> Result<String, DegmlError> {
    let mut out = String::new();
    write_expression(&mut out, e)?;
    Ok(out)
}

fn write_set(out: &mut String, s: &SetStatement) -> Result<(), DegmlError> {
    out.push('(');
    match &s.owner {
        Some(o) => {
            write_expression(out, o)?;
            out.push(':');
        }
        None => {
            let _ = write!(out, "{}.", s.scope);
        }
    }
    out.push_str(&s.target.name);
    match &s.index {
        Some(i) => {
            out.push('[');
            write_expression(out, i)?;
            out.push(']');
        }
        None if s.owner.is_none() => out.push_str(s.access.suffix()),
        None => {}
    }
    out.push_str(" = ");
    write_expression(out, &s.value)?;
    out.push(')');
    Ok(())
}

fn write_statement(out: &mut String, s: &Statement, indent: usize) -> Result<(), DegmlError> {
    match s {
        Statement::Set(set) => write_set(out, set)?,
        Statement::Call(c) => {
            out.push_str("call ");
            write_call(out, c)?;
        }
        Statement::Branch { ty, condition, target } => {
            match (ty, condition) {
                (BranchType::IfFalse, Some(c)) => {
                    out.push_str("if !");
                    write_expression(out, c)?;
                    out.push(' ');
                }
                (BranchType::IfTrue, Some(c)) => {
                    out.push_str("if ");
                    write_expression(out, c)?;
                    out.push(' ');
                }
                _ => {}
            }
            out.push_str("goto ");
            out.push_str(&hex(*target));
        }
        Statement::Break { ty, signal } => {
            let _ = write!(out, "break {ty} {signal}");
        }
        Statement::Return { ty, value: Some(v) } => {
            let _ = write!(out, "ret {ty} ");
            write_expression(out, v)?;
        }
        Statement::Return { value: None, .. } => out.push_str("exit"),
        Statement::PushEnv { parent, target, .. } => {
            out.push_str("pushenv ");
            write_expression(out, parent)?;
            out.push(' ');
            out.push_str(&hex(*target));
        }
        Statement::PopEnv { target, .. } => {
            out.push_str("popenv ");
            out.push_str(&hex(*target));
        }
        Statement::Push(e) => {
            out.push_str("push ");
            write_expression(out, e)?;
        }
        Statement::Pop => out.push_str("pop"),
        Statement::Dup => out.push_str("dup"),
        Statement::Label(offset) => {
            out.push_str(&hex(*offset));
            out.push(':');
        }
        Statement::Scoped { parent, body, .. } => {
            out.push_str("pushenv ");
            write_expression(out, parent)?;
            out.push_str(" {\n");
            write_statements(out, body, indent + 1)?;
            out.push_str(&INDENT.repeat(indent));
            out.push('}');
        }
    }
    Ok(())
}

fn write_statements(out: &mut String, stmts: &[Statement], indent: usize) -> Result<(), DegmlError> {
    let pad = INDENT.repeat(indent);
    for s in stmts {
        out.push_str(&pad);
        write_statement(out, s, indent)?;
        out.push('\n');
    }
    Ok(())
}

pub fn statement(s: &Statement) -> Result<String, DegmlError> {
    let mut out = String::new();
    write_statement(&mut out, s, 0)?;
    Ok(out)
}

/// Renders one statement per line, nested blocks indented by four spaces per level.
pub fn statements(stmts: &[Statement], indent: usize) -> Result<String, DegmlError> {
    let mut out = String::new();
    write_statements(&mut out, stmts, indent)?;
    Ok(out)
}

pub fn function(name: &str, stmts: &[Statement]) -> Result<String, DegmlError> {
    let mut out = format!("function {name} {{\n");
    write_statements(&mut out, stmts, 1)?;
    out.push_str("}\n");
    Ok(out)
}
