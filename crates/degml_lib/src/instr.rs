use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::DegmlError;
use crate::opcode::{Dialect, F_CMP, InstrKind, OpCode};
use crate::types::{DataType, InstanceType, VariableType};

/// A variable or function reference as stored in the operand word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarRef {
    pub index: u32,
    pub kind: VariableType,
}

impl VarRef {
    const INDEX_MASK: u32 = 0x00FF_FFFF;

    fn from_word(offset: u32, w: u32) -> Result<Self, DegmlError> {
        let tag = (w >> 24) as u8;
        let kind = VariableType::from_tag(tag).ok_or(DegmlError::InvalidVariableType { offset, tag })?;
        Ok(Self { index: w & Self::INDEX_MASK, kind })
    }

    fn word(self) -> u32 {
        ((self.kind.tag() as u32) << 24) | (self.index & Self::INDEX_MASK)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Single(f32),
    Bool(bool),
    /// Index into the string table.
    String(u32),
    Instance(i16),
    Variable { instance: InstanceType, var: VarRef },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Single { ty: DataType },
    Double { t1: DataType, t2: DataType },
    Dup { ty: DataType, extra: u8 },
    Goto { target: u32 },
    Push { ty: DataType, value: PushValue },
    Set { t1: DataType, t2: DataType, instance: InstanceType, var: VarRef },
    Call { ret: DataType, argc: u16, function: VarRef },
    Break { ty: DataType, signal: u16 },
}

/// One decoded instruction. Instructions live in an ordered table and are
/// addressed by their byte offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instr {
    pub offset: u32,
    pub opcode: OpCode,
    pub operand: Operand,
}

/// Number of extra operand words following a push of `ty`.
pub fn push_extra_words(ty: DataType) -> u32 {
    match ty {
        DataType::Int16 | DataType::Instance => 0,
        DataType::Int64 | DataType::Double => 2,
        _ => 1,
    }
}

impl Instr {
    pub fn new(offset: u32, opcode: OpCode, operand: Operand) -> Self {
        Self { offset, opcode, operand }
    }

    pub fn kind(&self) -> InstrKind {
        self.opcode.kind()
    }

    /// Encoded size in bytes, the same under both dialects.
    pub fn size(&self) -> u32 {
        let extra = match &self.operand {
            Operand::Push { ty, .. } => push_extra_words(*ty),
            Operand::Set { .. } | Operand::Call { .. } => 1,
            _ => 0,
        };
        4 * (1 + extra)
    }

    /// Offset just past this instruction. Fails when it does not fit the
    /// 32-bit offset space.
    pub fn next_offset(&self) -> Result<u32, DegmlError> {
        self.offset.checked_add(self.size()).ok_or(DegmlError::OffsetOverflow { offset: self.offset })
    }

    pub fn target(&self) -> Option<u32> {
        match self.operand {
            Operand::Goto { target } => Some(target),
            _ => None,
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn get_u32(&mut self) -> Result<u32, DegmlError> {
        if self.remaining() < 4 {
            return Err(DegmlError::Eof);
        }
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn get_u64(&mut self) -> Result<u64, DegmlError> {
        if self.remaining() < 8 {
            return Err(DegmlError::Eof);
        }
        let v = LittleEndian::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }
}

fn goto_bits(dialect: Dialect) -> u32 {
    match dialect {
        Dialect::E => 24,
        Dialect::F => 23,
    }
}

fn data_type(offset: u32, nibble: u8) -> Result<DataType, DegmlError> {
    DataType::from_nibble(nibble).ok_or(DegmlError::InvalidDataType { offset, nibble })
}

/// Decodes one code blob into its instruction table.
pub fn decode(bytes: &[u8], dialect: Dialect) -> Result<Vec<Instr>, DegmlError> {
    let mut r = Reader::new(bytes);
    let mut out = Vec::new();
    while r.remaining() > 0 {
        let offset = r.pos as u32;
        let w = r.get_u32()?;
        let byte = (w >> 24) as u8;
        let low = (w & 0xFFFF) as u16;
        let opcode = OpCode::from_byte(dialect, byte, (low >> 8) as u8)
            .ok_or(DegmlError::InvalidOpcode { offset, op: byte })?;
        let t1 = ((w >> 16) & 0xF) as u8;
        let t2 = ((w >> 20) & 0xF) as u8;

        let operand = match opcode.kind() {
            InstrKind::Goto => {
                let bits = goto_bits(dialect);
                let field = w & ((1 << bits) - 1);
                let words = ((field << (32 - bits)) as i32) >> (32 - bits);
                let target = offset as i64 + words as i64 * 4;
                Operand::Goto { target: u32::try_from(target).map_err(|_| DegmlError::BranchOutOfRange { offset })? }
            }
            InstrKind::Push => {
                let ty = data_type(offset, t1)?;
                let value = match ty {
                    DataType::Int16 => PushValue::Int16(low as i16),
                    DataType::Instance => PushValue::Instance(low as i16),
                    DataType::Int32 => PushValue::Int32(r.get_u32()? as i32),
                    DataType::Single => PushValue::Single(f32::from_bits(r.get_u32()?)),
                    DataType::Boolean => PushValue::Bool(r.get_u32()? != 0),
                    DataType::String => PushValue::String(r.get_u32()?),
                    DataType::Int64 => PushValue::Int64(r.get_u64()? as i64),
                    DataType::Double => PushValue::Double(f64::from_bits(r.get_u64()?)),
                    DataType::Variable => PushValue::Variable {
                        instance: InstanceType::from_raw(low as i16),
                        var: VarRef::from_word(offset, r.get_u32()?)?,
                    },
                };
                Operand::Push { ty, value }
            }
            InstrKind::Set => Operand::Set {
                t1: data_type(offset, t1)?,
                t2: data_type(offset, t2)?,
                instance: InstanceType::from_raw(low as i16),
                var: VarRef::from_word(offset, r.get_u32()?)?,
            },
            InstrKind::Call => Operand::Call {
                ret: data_type(offset, t1)?,
                argc: low,
                function: VarRef::from_word(offset, r.get_u32()?)?,
            },
            InstrKind::Normal => match opcode {
                OpCode::Dup => Operand::Dup { ty: data_type(offset, t1)?, extra: low as u8 },
                OpCode::Break => Operand::Break { ty: data_type(offset, t1)?, signal: low },
                op if op.is_single_type() => Operand::Single { ty: data_type(offset, t1)? },
                _ => Operand::Double { t1: data_type(offset, t1)?, t2: data_type(offset, t2)? },
            },
        };
        out.push(Instr { offset, opcode, operand });
    }
    Ok(out)
}

fn word(op: u8, t1: DataType, t2: DataType, low: u16) -> u32 {
    ((op as u32) << 24) | ((t2.nibble() as u32) << 20) | ((t1.nibble() as u32) << 16) | low as u32
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    out.extend_from_slice(&b);
}

/// Encodes an instruction table. Instructions are laid out back to back; their
/// `offset` fields are only consulted to compute branch displacements.
pub fn encode(instrs: &[Instr], dialect: Dialect) -> Result<Vec<u8>, DegmlError> {
    let mut out = Vec::new();
    for ins in instrs {
        let op = ins.opcode.pair().get(dialect);
        let cmp_low = match (dialect, ins.opcode.comparison()) {
            (Dialect::F, Some(c)) => (c.raw() as u16) << 8,
            _ => 0,
        };
        // Unused type nibbles are written as double (0).
        let d = DataType::Double;
        match &ins.operand {
            Operand::Single { ty } => push_u32(&mut out, word(op, *ty, d, 0)),
            Operand::Double { t1, t2 } => push_u32(&mut out, word(op, *t1, *t2, cmp_low)),
            Operand::Dup { ty, extra } => push_u32(&mut out, word(op, *ty, d, *extra as u16)),
            Operand::Break { ty, signal } => push_u32(&mut out, word(op, *ty, d, *signal)),
            Operand::Goto { target } => {
                let delta = *target as i64 - ins.offset as i64;
                if delta % 4 != 0 {
                    return Err(DegmlError::MisalignedBranch { offset: ins.offset, target: *target });
                }
                let bits = goto_bits(dialect);
                let field = ((delta / 4) as i32 as u32) & ((1 << bits) - 1);
                push_u32(&mut out, ((op as u32) << 24) | field);
            }
            Operand::Push { ty, value } => {
                let low = match value {
                    PushValue::Int16(v) | PushValue::Instance(v) => *v as u16,
                    PushValue::Variable { instance, .. } => instance.raw() as u16,
                    _ => 0,
                };
                push_u32(&mut out, word(op, *ty, d, low));
                match value {
                    PushValue::Int16(_) | PushValue::Instance(_) => {}
                    PushValue::Int32(v) => push_u32(&mut out, *v as u32),
                    PushValue::Single(v) => push_u32(&mut out, v.to_bits()),
                    PushValue::Bool(v) => push_u32(&mut out, *v as u32),
                    PushValue::String(idx) => push_u32(&mut out, *idx),
                    PushValue::Int64(v) => push_u64(&mut out, *v as u64),
                    PushValue::Double(v) => push_u64(&mut out, v.to_bits()),
                    PushValue::Variable { var, .. } => push_u32(&mut out, var.word()),
                }
            }
            Operand::Set { t1, t2, instance, var } => {
                push_u32(&mut out, word(op, *t1, *t2, instance.raw() as u16));
                push_u32(&mut out, var.word());
            }
            Operand::Call { ret, argc, function } => {
                push_u32(&mut out, word(op, *ret, d, *argc));
                push_u32(&mut out, function.word());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> Vec<Instr> {
        let x = VarRef { index: 3, kind: VariableType::Plain };
        vec![
            Instr::new(0, OpCode::Push, Operand::Push { ty: DataType::Int16, value: PushValue::Int16(-2) }),
            Instr::new(4, OpCode::Push, Operand::Push { ty: DataType::Double, value: PushValue::Double(1.5) }),
            Instr::new(16, OpCode::Add, Operand::Double { t1: DataType::Double, t2: DataType::Int16 }),
            Instr::new(20, OpCode::Cgt, Operand::Double { t1: DataType::Variable, t2: DataType::Int32 }),
            Instr::new(24, OpCode::Brf, Operand::Goto { target: 40 }),
            Instr::new(28, OpCode::Set, Operand::Set { t1: DataType::Variable, t2: DataType::Double, instance: InstanceType::SelfRef, var: x }),
            Instr::new(36, OpCode::Br, Operand::Goto { target: 0 }),
            Instr::new(40, OpCode::Exit, Operand::Single { ty: DataType::Int32 }),
        ]
    }

    #[test]
    fn sizes_follow_operand_words() {
        let sizes: Vec<u32> = sample().iter().map(Instr::size).collect();
        assert_eq!(sizes, vec![4, 12, 4, 4, 4, 8, 4, 4]);
    }

    #[test]
    fn both_dialects_decode_what_they_encode() {
        for dialect in [Dialect::E, Dialect::F] {
            let bytes = encode(&sample(), dialect).unwrap();
            assert_eq!(bytes.len(), 44);
            assert_eq!(decode(&bytes, dialect).unwrap(), sample());
        }
    }

    #[test]
    fn comparison_encoding_differs_per_dialect() {
        let cmp = [Instr::new(0, OpCode::Cgt, Operand::Double { t1: DataType::Int32, t2: DataType::Int32 })];
        let e = encode(&cmp, Dialect::E).unwrap();
        let f = encode(&cmp, Dialect::F).unwrap();
        assert_eq!(e[3], 0x16);
        assert_eq!(f[3], F_CMP);
        assert_eq!(f[1], 6);
    }

    #[test]
    fn backward_branch_sign_extends() {
        let bytes = encode(&sample(), Dialect::F).unwrap();
        let instrs = decode(&bytes, Dialect::F).unwrap();
        assert_eq!(instrs[6].target(), Some(0));
    }

    #[test]
    fn truncated_operand_is_eof() {
        let mut bytes = encode(&sample()[..2], Dialect::F).unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(matches!(decode(&bytes, Dialect::F), Err(DegmlError::Eof)));
    }

    #[test]
    #[allow(arithmetic_overflow)]
    fn offset_past_u32_max_is_an_error() {
        let push = Instr::new(u32::MAX - 3, OpCode::Push, Operand::Push { ty: DataType::Int32, value: PushValue::Int32(1) });
        assert!(matches!(push.next_offset(), Err(DegmlError::OffsetOverflow { offset }) if offset == u32::MAX - 3));
        let exit = Instr::new(u32::MAX - 3, OpCode::Exit, Operand::Single { ty: DataType::Int32 });
        assert_eq!(exit.next_offset().unwrap(), u32::MAX - 3 + 4);
    }

    #[test]
    fn unknown_opcode_reports_offset() {
        let bytes = [0, 0, 0, 0x01];
        assert!(matches!(decode(&bytes, Dialect::E), Err(DegmlError::InvalidOpcode { offset: 0, op: 1 })));
    }
}
