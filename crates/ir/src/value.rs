//! Value definitions for the arietta IR.
use core::fmt;

pub use primitive_types::U256;

use cranelift_entity::entity_impl;

use crate::{function::BlockId, inst::InstId, types::Type};

/// An opaque reference to [`Value`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct ValueId(pub u32);
entity_impl!(ValueId, "v");

/// A value data definition.
///
/// Every temporary has exactly one definition site for the lifetime of its
/// function: an instruction result, a parameter binding, a phi destination,
/// or a call-terminator destination. Immediates are interned and immutable.
#[derive(Debug, Clone)]
pub enum Value {
    /// The value is defined by an instruction.
    Inst { inst: InstId, ty: Type },

    /// The value is a function parameter.
    Arg { ty: Type, idx: usize },

    /// The value is an immediate.
    Immediate { imm: Immediate, ty: Type },

    /// The value is the destination of a phi node at the top of `block`.
    Phi { block: BlockId, ty: Type },

    /// The value is the destination of the call terminator of `block`.
    Call { block: BlockId, ty: Type },
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Value::Inst { ty, .. }
            | Value::Arg { ty, .. }
            | Value::Immediate { ty, .. }
            | Value::Phi { ty, .. }
            | Value::Call { ty, .. } => *ty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Immediate {
    I1(bool),
    I256(U256),
}

impl Immediate {
    pub fn ty(&self) -> Type {
        match self {
            Self::I1(..) => Type::I1,
            Self::I256(..) => Type::I256,
        }
    }

    /// Word representation pushed on the operand stack.
    pub fn as_u256(&self) -> U256 {
        match self {
            Self::I1(false) => U256::zero(),
            Self::I1(true) => U256::one(),
            Self::I256(v) => *v,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_u256().is_zero()
    }

    /// Big-endian bytes with leading zeros stripped; the empty slice for
    /// zero (encoded as a zero-width push).
    pub fn to_be_bytes_trimmed(&self) -> Vec<u8> {
        let buf = self.as_u256().to_big_endian();
        let skip = buf.iter().take_while(|b| **b == 0).count();
        buf[skip..].to_vec()
    }
}

impl From<bool> for Immediate {
    fn from(b: bool) -> Self {
        Self::I1(b)
    }
}

impl From<u64> for Immediate {
    fn from(v: u64) -> Self {
        Self::I256(U256::from(v))
    }
}

impl From<U256> for Immediate {
    fn from(v: U256) -> Self {
        Self::I256(v)
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::I1(v) => write!(f, "{}", *v as u8),
            Self::I256(v) => write!(f, "{v}"),
        }
    }
}
