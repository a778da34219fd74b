use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ComparisonType;

/// Wire dialect of a code blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Dialect {
    /// Bytecode 14 and earlier.
    E,
    #[default]
    F,
}

impl Dialect {
    pub fn from_bytecode_version(version: u8) -> Self {
        if version <= 14 { Dialect::E } else { Dialect::F }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrKind {
    Normal,
    Goto,
    Push,
    Set,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Conv,
    Mul,
    Div,
    Rem,
    Mod,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Neg,
    Not,
    Shl,
    Shr,
    Clt,
    Cle,
    Ceq,
    Cne,
    Cge,
    Cgt,
    Set,
    Dup,
    Ret,
    Exit,
    Popz,
    Br,
    Brt,
    Brf,
    PushEnv,
    PopEnv,
    Push,
    PushLoc,
    PushGlb,
    PushBltn,
    PushI,
    Call,
    Break,
}

/// Byte encodings of one logical opcode under both dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpCodePair {
    pub version_e: u8,
    pub version_f: u8,
}

impl OpCodePair {
    pub fn get(self, dialect: Dialect) -> u8 {
        match dialect {
            Dialect::E => self.version_e,
            Dialect::F => self.version_f,
        }
    }
}

/// Renders as `<e mnemonic>/<f mnemonic>`, e.g. `push/pushi`. The folded
/// dialect F comparison byte is `cmp`.
impl fmt::Display for OpCodePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match OpCode::from_byte(Dialect::E, self.version_e, 0) {
            Some(op) => f.write_str(op.name())?,
            None => write!(f, "{:02x}", self.version_e)?,
        }
        f.write_str("/")?;
        match OpCode::from_byte(Dialect::F, self.version_f, 0) {
            _ if self.version_f == F_CMP => f.write_str("cmp"),
            Some(op) => f.write_str(op.name()),
            None => write!(f, "{:02x}", self.version_f),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub op: OpCode,
    pub name: &'static str,
    pub kind: InstrKind,
    pub pair: OpCodePair,
}

const fn info(op: OpCode, name: &'static str, kind: InstrKind, version_e: u8, version_f: u8) -> OpInfo {
    OpInfo { op, name, kind, pair: OpCodePair { version_e, version_f } }
}

/// Dialect F shares one byte for all comparisons; the comparison kind rides in bits 8..15.
pub const F_CMP: u8 = 0x15;

// Ordered like `OpCode`; the first entry for a byte wins when decoding.
static OPCODE_INFO: &[OpInfo] = &[
    info(OpCode::Conv, "conv", InstrKind::Normal, 0x03, 0x07),
    info(OpCode::Mul, "mul", InstrKind::Normal, 0x04, 0x08),
    info(OpCode::Div, "div", InstrKind::Normal, 0x05, 0x09),
    info(OpCode::Rem, "rem", InstrKind::Normal, 0x06, 0x0A),
    info(OpCode::Mod, "mod", InstrKind::Normal, 0x07, 0x0B),
    info(OpCode::Add, "add", InstrKind::Normal, 0x08, 0x0C),
    info(OpCode::Sub, "sub", InstrKind::Normal, 0x09, 0x0D),
    info(OpCode::And, "and", InstrKind::Normal, 0x0A, 0x0E),
    info(OpCode::Or, "or", InstrKind::Normal, 0x0B, 0x0F),
    info(OpCode::Xor, "xor", InstrKind::Normal, 0x0C, 0x10),
    info(OpCode::Neg, "neg", InstrKind::Normal, 0x0D, 0x11),
    info(OpCode::Not, "not", InstrKind::Normal, 0x0E, 0x12),
    info(OpCode::Shl, "shl", InstrKind::Normal, 0x0F, 0x13),
    info(OpCode::Shr, "shr", InstrKind::Normal, 0x10, 0x14),
    info(OpCode::Clt, "clt", InstrKind::Normal, 0x11, F_CMP),
    info(OpCode::Cle, "cle", InstrKind::Normal, 0x12, F_CMP),
    info(OpCode::Ceq, "ceq", InstrKind::Normal, 0x13, F_CMP),
    info(OpCode::Cne, "cne", InstrKind::Normal, 0x14, F_CMP),
    info(OpCode::Cge, "cge", InstrKind::Normal, 0x15, F_CMP),
    info(OpCode::Cgt, "cgt", InstrKind::Normal, 0x16, F_CMP),
    info(OpCode::Set, "set", InstrKind::Set, 0x41, 0x45),
    info(OpCode::Dup, "dup", InstrKind::Normal, 0x82, 0x86),
    info(OpCode::Ret, "ret", InstrKind::Normal, 0x9D, 0x9C),
    info(OpCode::Exit, "exit", InstrKind::Normal, 0x9E, 0x9D),
    info(OpCode::Popz, "popz", InstrKind::Normal, 0x9F, 0x9E),
    info(OpCode::Br, "br", InstrKind::Goto, 0xB7, 0xB6),
    info(OpCode::Brt, "brt", InstrKind::Goto, 0xB8, 0xB7),
    info(OpCode::Brf, "brf", InstrKind::Goto, 0xB9, 0xB8),
    info(OpCode::PushEnv, "pushenv", InstrKind::Goto, 0xBB, 0xBA),
    info(OpCode::PopEnv, "popenv", InstrKind::Goto, 0xBC, 0xBB),
    info(OpCode::Push, "push", InstrKind::Push, 0xC0, 0xC0),
    info(OpCode::PushLoc, "pushloc", InstrKind::Push, 0xC0, 0xC1),
    info(OpCode::PushGlb, "pushglb", InstrKind::Push, 0xC0, 0xC2),
    info(OpCode::PushBltn, "pushbltn", InstrKind::Push, 0xC0, 0xC3),
    info(OpCode::PushI, "pushi", InstrKind::Push, 0xC0, 0x84),
    info(OpCode::Call, "call", InstrKind::Call, 0xDA, 0xD9),
    info(OpCode::Break, "break", InstrKind::Normal, 0xFF, 0xFF),
];

impl OpCode {
    pub fn info(self) -> &'static OpInfo {
        &OPCODE_INFO[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn kind(self) -> InstrKind {
        self.info().kind
    }

    pub fn pair(self) -> OpCodePair {
        self.info().pair
    }

    pub fn from_name(name: &str) -> Option<Self> {
        OPCODE_INFO.iter().find(|i| i.name == name).map(|i| i.op)
    }

    /// Decodes an opcode byte. `cmp` is the comparison field, consulted only for
    /// the folded dialect F comparison byte.
    pub fn from_byte(dialect: Dialect, byte: u8, cmp: u8) -> Option<Self> {
        if dialect == Dialect::F && byte == F_CMP {
            return ComparisonType::from_raw(cmp).map(OpCode::from_comparison);
        }
        OPCODE_INFO.iter().find(|i| i.pair.get(dialect) == byte).map(|i| i.op)
    }

    pub fn comparison(self) -> Option<ComparisonType> {
        Some(match self {
            OpCode::Clt => ComparisonType::LowerThan,
            OpCode::Cle => ComparisonType::LTOrEqual,
            OpCode::Ceq => ComparisonType::Equality,
            OpCode::Cne => ComparisonType::Inequality,
            OpCode::Cge => ComparisonType::GTOrEqual,
            OpCode::Cgt => ComparisonType::GreaterThan,
            _ => return None,
        })
    }

    pub fn from_comparison(c: ComparisonType) -> Self {
        match c {
            ComparisonType::LowerThan => OpCode::Clt,
            ComparisonType::LTOrEqual => OpCode::Cle,
            ComparisonType::Equality => OpCode::Ceq,
            ComparisonType::Inequality => OpCode::Cne,
            ComparisonType::GTOrEqual => OpCode::Cge,
            ComparisonType::GreaterThan => OpCode::Cgt,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, OpCode::Br | OpCode::Brt | OpCode::Brf)
    }

    /// Opcodes whose operand is a single data type.
    pub fn is_single_type(self) -> bool {
        matches!(self, OpCode::Neg | OpCode::Not | OpCode::Ret | OpCode::Exit | OpCode::Popz)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn table_is_indexed_by_opcode() {
        for (i, info) in OPCODE_INFO.iter().enumerate() {
            assert_eq!(info.op as usize, i, "{}", info.name);
        }
    }

    #[test]
    fn every_opcode_survives_its_own_dialect_encoding() {
        for info in OPCODE_INFO {
            let cmp = info.op.comparison().map(|c| c.raw()).unwrap_or(0);
            let f = OpCode::from_byte(Dialect::F, info.pair.version_f, cmp);
            assert_eq!(f, Some(info.op), "{}", info.name);
        }
    }

    #[test]
    fn dialect_e_push_flavours_collapse_to_push() {
        assert_eq!(OpCode::from_byte(Dialect::E, 0xC0, 0), Some(OpCode::Push));
        assert_eq!(OpCode::PushGlb.pair().get(Dialect::E), 0xC0);
        assert_eq!(OpCode::from_byte(Dialect::E, 0x15, 0), Some(OpCode::Cge));
        assert_eq!(OpCode::from_byte(Dialect::F, F_CMP, 0), None);
    }

    #[test]
    fn pair_renders_mnemonics_of_both_dialects() {
        assert_eq!(OpCode::PushI.pair().to_string(), "push/pushi");
        assert_eq!(OpCode::PushGlb.pair().to_string(), "push/pushglb");
        assert_eq!(OpCode::Clt.pair().to_string(), "clt/cmp");
        assert_eq!(OpCode::Ret.pair().to_string(), "ret/ret");
        assert_eq!(OpCodePair { version_e: 0x01, version_f: 0x02 }.to_string(), "01/02");
    }

    #[test]
    fn bytecode_version_selects_dialect() {
        assert_eq!(Dialect::from_bytecode_version(13), Dialect::E);
        assert_eq!(Dialect::from_bytecode_version(14), Dialect::E);
        assert_eq!(Dialect::from_bytecode_version(16), Dialect::F);
    }
}
