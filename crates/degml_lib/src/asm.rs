//! Text assembler IR.
//!
//! One instruction per line. Each [`AsmInstr`] renders to a line that parses
//! back to the same value; [`assemble`] resolves branch labels to byte offsets
//! and [`Assembly::lower`] turns the IR into encodable instructions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::DegmlError;
use crate::ast::Scalar;
use crate::instr::{Instr, Operand, PushValue, VarRef, encode, push_extra_words};
use crate::opcode::{Dialect, InstrKind, OpCode, OpCodePair};
use crate::render;
use crate::symbols::{SymbolKind, SymbolTable};
use crate::types::{ComparisonType, DataType, InstanceType, VariableType};

/// A branch label: either a rendered offset (`0x000010`) or a free name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LabelKey {
    Offset(u32),
    Name(String),
}

impl LabelKey {
    pub fn parse(s: &str) -> Self {
        s.strip_prefix("0x")
            .and_then(|h| u32::from_str_radix(h, 16).ok())
            .map(LabelKey::Offset)
            .unwrap_or_else(|| LabelKey::Name(s.to_string()))
    }
}

impl fmt::Display for LabelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelKey::Offset(o) => f.write_str(&render::hex(*o)),
            LabelKey::Name(n) => f.write_str(n),
        }
    }
}

/// Instance part of a variable operand: a scope keyword or raw value, or an
/// object named through the symbol table (`obj_player:x`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceRef {
    Type(InstanceType),
    Name(String),
}

impl InstanceRef {
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(t) = InstanceType::from_name(s) {
            return Some(InstanceRef::Type(t));
        }
        let mut chars = s.chars();
        let head = chars.next()?;
        let is_ident = (head.is_ascii_alphabetic() || head == '_') && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        is_ident.then(|| InstanceRef::Name(s.to_string()))
    }

    /// Object names become the object's index.
    pub fn resolve(&self, symbols: &dyn SymbolTable) -> Result<InstanceType, DegmlError> {
        match self {
            InstanceRef::Type(t) => Ok(*t),
            InstanceRef::Name(name) => symbols
                .find_object(name)
                .and_then(|i| i16::try_from(i).ok())
                .map(InstanceType::Object)
                .ok_or_else(|| DegmlError::UnknownName { name: name.clone() }),
        }
    }
}

impl From<InstanceType> for InstanceRef {
    fn from(t: InstanceType) -> Self {
        InstanceRef::Type(t)
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRef::Type(t) => write!(f, "{t}"),
            InstanceRef::Name(n) => f.write_str(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AsmInstr {
    Label(LabelKey),
    /// neg, not, ret, exit, popz
    SingleType { op: OpCode, ty: DataType },
    /// conv and the arithmetic/bitwise operators
    DoubleType { op: OpCode, t1: DataType, t2: DataType },
    Compare { cmp: ComparisonType, t1: DataType, t2: DataType },
    /// br, brt, brf, pushenv, popenv
    Branch { op: OpCode, label: LabelKey },
    Set { t1: DataType, t2: DataType, instance: InstanceRef, name: String, kind: VariableType },
    Call { ret: DataType, argc: u16, name: String, kind: VariableType },
    Break { ty: DataType, signal: u16 },
    Dup { ty: DataType, extra: u8 },
    PushConst { op: OpCode, ty: DataType, value: Scalar },
    PushVariable { op: OpCode, instance: InstanceRef, name: String, kind: VariableType },
}

impl AsmInstr {
    pub fn opcode(&self) -> Option<OpCode> {
        Some(match self {
            AsmInstr::Label(_) => return None,
            AsmInstr::SingleType { op, .. }
            | AsmInstr::DoubleType { op, .. }
            | AsmInstr::Branch { op, .. }
            | AsmInstr::PushConst { op, .. }
            | AsmInstr::PushVariable { op, .. } => *op,
            AsmInstr::Compare { cmp, .. } => OpCode::from_comparison(*cmp),
            AsmInstr::Set { .. } => OpCode::Set,
            AsmInstr::Call { .. } => OpCode::Call,
            AsmInstr::Break { .. } => OpCode::Break,
            AsmInstr::Dup { .. } => OpCode::Dup,
        })
    }

    /// Byte encodings under both dialects; labels have none.
    pub fn opcode_pair(&self) -> Option<OpCodePair> {
        self.opcode().map(OpCode::pair)
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> u32 {
        match self {
            AsmInstr::Label(_) => 0,
            AsmInstr::PushConst { ty, .. } => 4 * (1 + push_extra_words(*ty)),
            AsmInstr::PushVariable { .. } | AsmInstr::Set { .. } | AsmInstr::Call { .. } => 8,
            _ => 4,
        }
    }

    pub fn render(&self) -> Result<String, DegmlError> {
        Ok(match self {
            AsmInstr::Label(key) => format!("{key}:"),
            AsmInstr::SingleType { op, ty } => format!("{op} {ty}"),
            AsmInstr::DoubleType { op, t1, t2 } => format!("{op} {t1}:{t2}"),
            AsmInstr::Compare { cmp, t1, t2 } => format!("cmp {cmp} {t1}:{t2}"),
            AsmInstr::Branch { op, label } => format!("{op} {label}"),
            AsmInstr::Set { t1, t2, instance, name, kind } => format!("set {t1}:{t2} {instance}:{name}{}", kind.suffix()),
            AsmInstr::Call { ret, argc, name, kind } => format!("call {ret}:{argc} {name}{}", kind.suffix()),
            AsmInstr::Break { ty, signal } => format!("break {ty} {signal}"),
            AsmInstr::Dup { ty, extra } => format!("dup {ty} {extra}"),
            AsmInstr::PushConst { op, ty, value } => format!("{op} {ty} {}", render::literal(*ty, value)?),
            AsmInstr::PushVariable { op, instance, name, kind } => {
                format!("{op} {} {instance}:{name}{}", DataType::Variable, kind.suffix())
            }
        })
    }

    /// Lifts a decoded instruction back into assembler IR, resolving names
    /// through `symbols`. Branch targets become offset labels.
    pub fn from_instr(ins: &Instr, symbols: &dyn SymbolTable) -> Result<Self, DegmlError> {
        let name = |var: &VarRef| symbols.resolve(var.index).map(|s| s.name.clone()).ok_or(DegmlError::UnknownSymbol(var.index));
        Ok(match &ins.operand {
            Operand::Single { ty } => AsmInstr::SingleType { op: ins.opcode, ty: *ty },
            Operand::Double { t1, t2 } => match ins.opcode.comparison() {
                Some(cmp) => AsmInstr::Compare { cmp, t1: *t1, t2: *t2 },
                None => AsmInstr::DoubleType { op: ins.opcode, t1: *t1, t2: *t2 },
            },
            Operand::Dup { ty, extra } => AsmInstr::Dup { ty: *ty, extra: *extra },
            Operand::Goto { target } => AsmInstr::Branch { op: ins.opcode, label: LabelKey::Offset(*target) },
            Operand::Set { t1, t2, instance, var } => {
                AsmInstr::Set { t1: *t1, t2: *t2, instance: (*instance).into(), name: name(var)?, kind: var.kind }
            }
            Operand::Call { ret, argc, function } => {
                AsmInstr::Call { ret: *ret, argc: *argc, name: name(function)?, kind: function.kind }
            }
            Operand::Break { ty, signal } => AsmInstr::Break { ty: *ty, signal: *signal },
            Operand::Push { value: PushValue::Variable { instance, var }, .. } => {
                AsmInstr::PushVariable { op: ins.opcode, instance: (*instance).into(), name: name(var)?, kind: var.kind }
            }
            Operand::Push { ty, value } => {
                let value = match value {
                    PushValue::Int16(v) | PushValue::Instance(v) => Scalar::Int16(*v),
                    PushValue::Int32(v) => Scalar::Int32(*v),
                    PushValue::Int64(v) => Scalar::Int64(*v),
                    PushValue::Double(v) => Scalar::Double(*v),
                    PushValue::Single(v) => Scalar::Single(*v),
                    PushValue::Bool(v) => Scalar::Bool(*v),
                    PushValue::String(idx) => {
                        Scalar::String(symbols.string(*idx).ok_or(DegmlError::UnknownString(*idx))?.to_string())
                    }
                    PushValue::Variable { .. } => return Err(DegmlError::TypeMismatch { expected: *ty, found: "var" }),
                };
                AsmInstr::PushConst { op: ins.opcode, ty: *ty, value }
            }
        })
    }
}

struct Line<'a> {
    no: usize,
    rest: &'a str,
}

impl<'a> Line<'a> {
    fn err(&self, message: impl Into<String>) -> DegmlError {
        DegmlError::Syntax { line: self.no, message: message.into() }
    }

    fn token(&mut self, what: &str) -> Result<&'a str, DegmlError> {
        let s = self.rest.trim_start();
        let (tok, rest) = match s.find(char::is_whitespace) {
            Some(i) => (&s[..i], &s[i..]),
            None => (s, ""),
        };
        if tok.is_empty() {
            return Err(self.err(format!("expected {what}")));
        }
        self.rest = rest;
        Ok(tok)
    }

    /// Everything left on the line; literals may contain spaces.
    fn remainder(&mut self, what: &str) -> Result<&'a str, DegmlError> {
        let r = self.rest.trim();
        if r.is_empty() {
            return Err(self.err(format!("expected {what}")));
        }
        self.rest = "";
        Ok(r)
    }

    fn end(&self) -> Result<(), DegmlError> {
        match self.rest.trim() {
            "" => Ok(()),
            extra => Err(self.err(format!("unexpected `{extra}`"))),
        }
    }

    fn type_name(&self, s: &str) -> Result<DataType, DegmlError> {
        DataType::from_name(s).ok_or_else(|| self.err(format!("unknown type `{s}`")))
    }

    fn data_type(&mut self) -> Result<DataType, DegmlError> {
        let t = self.token("type")?;
        self.type_name(t)
    }

    fn number<T: FromStr>(&self, s: &str) -> Result<T, DegmlError> {
        s.parse().map_err(|_| self.err(format!("bad number `{s}`")))
    }

    /// `<a>:<b>` as a pair of tokens.
    fn pair(&mut self, what: &str) -> Result<(&'a str, &'a str), DegmlError> {
        let t = self.token(what)?;
        t.split_once(':').ok_or_else(|| self.err(format!("expected {what}, found `{t}`")))
    }

    fn type_pair(&mut self) -> Result<(DataType, DataType), DegmlError> {
        let (a, b) = self.pair("<type>:<type>")?;
        Ok((self.type_name(a)?, self.type_name(b)?))
    }

    fn symbol(&self, tok: &'a str) -> Result<(String, VariableType), DegmlError> {
        let (name, kind) = VariableType::split_suffix(tok);
        if name.is_empty() {
            return Err(self.err(format!("missing name in `{tok}`")));
        }
        Ok((name.to_string(), kind))
    }

    fn variable(&mut self) -> Result<(InstanceRef, String, VariableType), DegmlError> {
        let (inst, rest) = self.pair("<instance>:<name>")?;
        let instance = InstanceRef::parse(inst).ok_or_else(|| self.err(format!("unknown instance `{inst}`")))?;
        let (name, kind) = self.symbol(rest)?;
        Ok((instance, name, kind))
    }

    fn literal(&self, ty: DataType, s: &str) -> Result<Scalar, DegmlError> {
        let suffixed = |suffix: char| s.strip_suffix(suffix).ok_or_else(|| self.err(format!("`{s}` lacks the `{suffix}` suffix")));
        Ok(match ty {
            DataType::Boolean => match s {
                "true" => Scalar::Bool(true),
                "false" => Scalar::Bool(false),
                _ => return Err(self.err(format!("bad bool `{s}`"))),
            },
            DataType::Double => Scalar::Double(self.number(suffixed('d')?)?),
            DataType::Single => Scalar::Single(self.number(suffixed('f')?)?),
            DataType::Int16 => Scalar::Int16(self.number(suffixed('s')?)?),
            DataType::Int32 => Scalar::Int32(self.number(s)?),
            DataType::Int64 => Scalar::Int64(self.number(s)?),
            DataType::String => Scalar::String(self.unescape(s)?),
            DataType::Instance => {
                let inner = s
                    .strip_prefix("(inst ")
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| self.err(format!("bad instance literal `{s}`")))?;
                Scalar::Int16(self.number(inner)?)
            }
            DataType::Variable => return Err(self.err("var literals are not allowed")),
        })
    }

    /// Text between the first and the last quote of `s`.
    fn unescape(&self, s: &str) -> Result<String, DegmlError> {
        let inner = s
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .ok_or_else(|| self.err(format!("expected a quoted string, found `{s}`")))?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            out.push(match chars.next() {
                Some('\\') => '\\',
                Some('n') => '\n',
                Some('r') => '\r',
                Some('t') => '\t',
                Some('b') => '\u{8}',
                Some('0') => '\0',
                Some('"') => '"',
                Some(other) => return Err(self.err(format!("unknown escape `\\{other}`"))),
                None => return Err(self.err("dangling backslash")),
            });
        }
        Ok(out)
    }
}

/// Parses one source line; blank and `;` comment lines yield `None`.
pub fn parse_line(no: usize, raw: &str) -> Result<Option<AsmInstr>, DegmlError> {
    let text = raw.trim();
    if text.is_empty() || text.starts_with(';') {
        return Ok(None);
    }
    if let Some(label) = text.strip_suffix(':') {
        if !label.is_empty() && !label.contains(char::is_whitespace) {
            return Ok(Some(AsmInstr::Label(LabelKey::parse(label))));
        }
    }

    let mut line = Line { no, rest: text };
    let mnemonic = line.token("mnemonic")?;
    let instr = if mnemonic == "cmp" {
        let c = line.token("comparison")?;
        let cmp = ComparisonType::from_name(c).ok_or_else(|| line.err(format!("unknown comparison `{c}`")))?;
        let (t1, t2) = line.type_pair()?;
        AsmInstr::Compare { cmp, t1, t2 }
    } else {
        let op = OpCode::from_name(mnemonic).ok_or_else(|| line.err(format!("unknown mnemonic `{mnemonic}`")))?;
        match op.kind() {
            InstrKind::Goto => AsmInstr::Branch { op, label: LabelKey::parse(line.token("label")?) },
            InstrKind::Set => {
                let (t1, t2) = line.type_pair()?;
                let (instance, name, kind) = line.variable()?;
                AsmInstr::Set { t1, t2, instance, name, kind }
            }
            InstrKind::Call => {
                let (ret, argc) = line.pair("<type>:<argc>")?;
                let ret = line.type_name(ret)?;
                let argc = line.number(argc)?;
                let tok = line.token("function")?;
                let (name, kind) = line.symbol(tok)?;
                AsmInstr::Call { ret, argc, name, kind }
            }
            InstrKind::Push => match line.data_type()? {
                DataType::Variable => {
                    let (instance, name, kind) = line.variable()?;
                    AsmInstr::PushVariable { op, instance, name, kind }
                }
                ty => {
                    let lit = line.remainder("literal")?;
                    AsmInstr::PushConst { op, ty, value: line.literal(ty, lit)? }
                }
            },
            InstrKind::Normal => match op {
                OpCode::Dup => {
                    let ty = line.data_type()?;
                    let extra = line.token("count")?;
                    AsmInstr::Dup { ty, extra: line.number(extra)? }
                }
                OpCode::Break => {
                    let ty = line.data_type()?;
                    let signal = line.token("signal")?;
                    AsmInstr::Break { ty, signal: line.number(signal)? }
                }
                op if op.is_single_type() => AsmInstr::SingleType { op, ty: line.data_type()? },
                op => {
                    let (t1, t2) = line.type_pair()?;
                    match op.comparison() {
                        Some(cmp) => AsmInstr::Compare { cmp, t1, t2 },
                        None => AsmInstr::DoubleType { op, t1, t2 },
                    }
                }
            },
        }
    };
    line.end()?;
    Ok(Some(instr))
}

pub fn parse(text: &str) -> Result<Vec<AsmInstr>, DegmlError> {
    let mut out = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        out.extend(parse_line(i + 1, raw)?);
    }
    Ok(out)
}

/// Parsed program with every label bound to the byte offset it marks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assembly {
    pub instrs: Vec<AsmInstr>,
    pub labels: BTreeMap<LabelKey, u32>,
}

pub fn assemble(text: &str) -> Result<Assembly, DegmlError> {
    let mut instrs = Vec::new();
    let mut labels = BTreeMap::new();
    let mut offset = 0u32;
    for (i, raw) in text.lines().enumerate() {
        let Some(ins) = parse_line(i + 1, raw)? else { continue };
        if let AsmInstr::Label(key) = &ins {
            if labels.insert(key.clone(), offset).is_some() {
                return Err(DegmlError::Syntax { line: i + 1, message: format!("duplicate label `{key}`") });
            }
        }
        offset = offset.checked_add(ins.size()).ok_or(DegmlError::OffsetOverflow { offset })?;
        instrs.push(ins);
    }
    for ins in &instrs {
        if let AsmInstr::Branch { label, .. } = ins {
            if !labels.contains_key(label) {
                return Err(DegmlError::UnknownLabel { label: label.to_string() });
            }
        }
    }
    debug!(instructions = instrs.len(), labels = labels.len(), bytes = offset, "assembled");
    Ok(Assembly { instrs, labels })
}

impl Assembly {
    /// Resolves names and labels, yielding instructions at their final offsets.
    pub fn lower(&self, symbols: &dyn SymbolTable) -> Result<Vec<Instr>, DegmlError> {
        let var = |name: &str, kind: VariableType, sk: SymbolKind| {
            symbols
                .find(name, sk)
                .map(|index| VarRef { index, kind })
                .ok_or_else(|| DegmlError::UnknownName { name: name.to_string() })
        };

        let mut out = Vec::with_capacity(self.instrs.len());
        let mut offset = 0u32;
        for ins in &self.instrs {
            let Some(opcode) = ins.opcode() else { continue };
            let operand = match ins {
                AsmInstr::Label(_) => continue,
                AsmInstr::SingleType { ty, .. } => Operand::Single { ty: *ty },
                AsmInstr::DoubleType { t1, t2, .. } | AsmInstr::Compare { t1, t2, .. } => Operand::Double { t1: *t1, t2: *t2 },
                AsmInstr::Branch { label, .. } => {
                    let target = self
                        .labels
                        .get(label)
                        .copied()
                        .ok_or_else(|| DegmlError::UnknownLabel { label: label.to_string() })?;
                    Operand::Goto { target }
                }
                AsmInstr::Set { t1, t2, instance, name, kind } => Operand::Set {
                    t1: *t1,
                    t2: *t2,
                    instance: instance.resolve(symbols)?,
                    var: var(name.as_str(), *kind, SymbolKind::Variable)?,
                },
                AsmInstr::Call { ret, argc, name, kind } => Operand::Call {
                    ret: *ret,
                    argc: *argc,
                    function: var(name.as_str(), *kind, SymbolKind::Function)?,
                },
                AsmInstr::Break { ty, signal } => Operand::Break { ty: *ty, signal: *signal },
                AsmInstr::Dup { ty, extra } => Operand::Dup { ty: *ty, extra: *extra },
                AsmInstr::PushVariable { instance, name, kind, .. } => Operand::Push {
                    ty: DataType::Variable,
                    value: PushValue::Variable { instance: instance.resolve(symbols)?, var: var(name.as_str(), *kind, SymbolKind::Variable)? },
                },
                AsmInstr::PushConst { ty, value, .. } => {
                    let v = match (ty, value) {
                        (DataType::Int16, Scalar::Int16(v)) => PushValue::Int16(*v),
                        (DataType::Instance, Scalar::Int16(v)) => PushValue::Instance(*v),
                        (DataType::Int32, Scalar::Int32(v)) => PushValue::Int32(*v),
                        (DataType::Int64, Scalar::Int64(v)) => PushValue::Int64(*v),
                        (DataType::Double, Scalar::Double(v)) => PushValue::Double(*v),
                        (DataType::Single, Scalar::Single(v)) => PushValue::Single(*v),
                        (DataType::Boolean, Scalar::Bool(v)) => PushValue::Bool(*v),
                        (DataType::String, Scalar::String(s)) => {
                            PushValue::String(symbols.find_string(s).ok_or_else(|| DegmlError::UnknownName { name: s.clone() })?)
                        }
                        (ty, v) => return Err(DegmlError::TypeMismatch { expected: *ty, found: v.tag() }),
                    };
                    Operand::Push { ty: *ty, value: v }
                }
            };
            let instr = Instr::new(offset, opcode, operand);
            offset = instr.next_offset()?;
            out.push(instr);
        }
        Ok(out)
    }

    pub fn encode(&self, symbols: &dyn SymbolTable, dialect: Dialect) -> Result<Vec<u8>, DegmlError> {
        encode(&self.lower(symbols)?, dialect)
    }
}

/// Renders an instruction table as assembler text, with an offset label in
/// front of every jump target.
pub fn disassemble(instrs: &[Instr], symbols: &dyn SymbolTable) -> Result<String, DegmlError> {
    let targets: BTreeSet<u32> = instrs.iter().filter_map(Instr::target).collect();
    let mut out = String::new();
    let label = |out: &mut String, offset: u32| {
        if targets.contains(&offset) {
            out.push_str(&format!("{}:\n", LabelKey::Offset(offset)));
        }
    };
    for ins in instrs {
        label(&mut out, ins.offset);
        out.push_str(&AsmInstr::from_instr(ins, symbols)?.render()?);
        out.push('\n');
    }
    if let Some(last) = instrs.last() {
        label(&mut out, last.next_offset()?);
    }
    Ok(out)
}
