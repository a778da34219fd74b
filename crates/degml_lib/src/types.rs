use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Double,
    Single,
    Int32,
    Int64,
    Boolean,
    Variable,
    String,
    Instance,
    Int16,
}

impl DataType {
    pub fn from_nibble(n: u8) -> Option<Self> {
        Some(match n {
            0x0 => DataType::Double,
            0x1 => DataType::Single,
            0x2 => DataType::Int32,
            0x3 => DataType::Int64,
            0x4 => DataType::Boolean,
            0x5 => DataType::Variable,
            0x6 => DataType::String,
            0x7 => DataType::Instance,
            0xF => DataType::Int16,
            _ => return None,
        })
    }

    pub fn nibble(self) -> u8 {
        match self {
            DataType::Double => 0x0,
            DataType::Single => 0x1,
            DataType::Int32 => 0x2,
            DataType::Int64 => 0x3,
            DataType::Boolean => 0x4,
            DataType::Variable => 0x5,
            DataType::String => 0x6,
            DataType::Instance => 0x7,
            DataType::Int16 => 0xF,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Double => "double",
            DataType::Single => "float",
            DataType::Int32 => "int",
            DataType::Int64 => "long",
            DataType::Boolean => "bool",
            DataType::Variable => "var",
            DataType::String => "string",
            DataType::Instance => "inst",
            DataType::Int16 => "short",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "double" => DataType::Double,
            "float" => DataType::Single,
            "int" => DataType::Int32,
            "long" => DataType::Int64,
            "bool" => DataType::Boolean,
            "var" => DataType::Variable,
            "string" => DataType::String,
            "inst" => DataType::Instance,
            "short" => DataType::Int16,
            _ => return None,
        })
    }

    fn rank(self) -> u8 {
        match self {
            DataType::Boolean => 0,
            DataType::Int16 => 1,
            DataType::Int32 => 2,
            DataType::Instance => 2,
            DataType::Int64 => 3,
            DataType::Single => 4,
            DataType::Double => 5,
            DataType::String => 6,
            DataType::Variable => 7,
        }
    }

    /// Result type of an arithmetic operator applied to `self` and `other`.
    pub fn widen(self, other: DataType) -> DataType {
        if other.rank() > self.rank() { other } else { self }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Owner scope of a variable access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceType {
    SelfRef,
    Other,
    All,
    Noone,
    Global,
    Builtin,
    Local,
    StackTop,
    /// Object index, or any raw value without a keyword.
    Object(i16),
}

impl InstanceType {
    pub fn from_raw(v: i16) -> Self {
        match v {
            -1 => InstanceType::SelfRef,
            -2 => InstanceType::Other,
            -3 => InstanceType::All,
            -4 => InstanceType::Noone,
            -5 => InstanceType::Global,
            -6 => InstanceType::Builtin,
            -7 => InstanceType::Local,
            -9 => InstanceType::StackTop,
            v => InstanceType::Object(v),
        }
    }

    pub fn raw(self) -> i16 {
        match self {
            InstanceType::SelfRef => -1,
            InstanceType::Other => -2,
            InstanceType::All => -3,
            InstanceType::Noone => -4,
            InstanceType::Global => -5,
            InstanceType::Builtin => -6,
            InstanceType::Local => -7,
            InstanceType::StackTop => -9,
            InstanceType::Object(v) => v,
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "self" => InstanceType::SelfRef,
            "other" => InstanceType::Other,
            "all" => InstanceType::All,
            "noone" => InstanceType::Noone,
            "global" => InstanceType::Global,
            "builtin" => InstanceType::Builtin,
            "local" => InstanceType::Local,
            "stog" => InstanceType::StackTop,
            n => InstanceType::from_raw(n.parse().ok()?),
        })
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceType::SelfRef => f.write_str("self"),
            InstanceType::Other => f.write_str("other"),
            InstanceType::All => f.write_str("all"),
            InstanceType::Noone => f.write_str("noone"),
            InstanceType::Global => f.write_str("global"),
            InstanceType::Builtin => f.write_str("builtin"),
            InstanceType::Local => f.write_str("local"),
            InstanceType::StackTop => f.write_str("stog"),
            InstanceType::Object(v) => write!(f, "{v}"),
        }
    }
}

/// Addressing mode of a variable or function reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableType {
    Array,
    StackTop,
    Plain,
    Instance,
}

impl VariableType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x00 => VariableType::Array,
            0x80 => VariableType::StackTop,
            0xA0 => VariableType::Plain,
            0xE0 => VariableType::Instance,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        match self {
            VariableType::Array => 0x00,
            VariableType::StackTop => 0x80,
            VariableType::Plain => 0xA0,
            VariableType::Instance => 0xE0,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            VariableType::Array => "[]",
            VariableType::StackTop => "[stog]",
            VariableType::Plain => "",
            VariableType::Instance => "[inst]",
        }
    }

    /// Splits a trailing addressing suffix off a symbol token.
    pub fn split_suffix(token: &str) -> (&str, VariableType) {
        for vt in [VariableType::Array, VariableType::StackTop, VariableType::Instance] {
            if let Some(name) = token.strip_suffix(vt.suffix()) {
                return (name, vt);
            }
        }
        (token, VariableType::Plain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonType {
    LowerThan,
    LTOrEqual,
    Equality,
    Inequality,
    GTOrEqual,
    GreaterThan,
}

impl ComparisonType {
    pub const ALL: [ComparisonType; 6] = [
        ComparisonType::LowerThan,
        ComparisonType::LTOrEqual,
        ComparisonType::Equality,
        ComparisonType::Inequality,
        ComparisonType::GTOrEqual,
        ComparisonType::GreaterThan,
    ];

    pub fn from_raw(v: u8) -> Option<Self> {
        Self::ALL.get((v as usize).checked_sub(1)?).copied()
    }

    pub fn raw(self) -> u8 {
        self as u8 + 1
    }

    pub fn name(self) -> &'static str {
        match self {
            ComparisonType::LowerThan => "lt",
            ComparisonType::LTOrEqual => "le",
            ComparisonType::Equality => "eq",
            ComparisonType::Inequality => "ne",
            ComparisonType::GTOrEqual => "ge",
            ComparisonType::GreaterThan => "gt",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == s)
    }
}

impl fmt::Display for ComparisonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
