//! Instruction, phi and terminator definitions for the arietta IR.
use smallvec::{smallvec, SmallVec};

use crate::{
    function::BlockId, module::FuncRef, span::SourceSpan, types::Type, value::ValueId,
};

/// An opaque reference to [`InstData`].
#[derive(Debug, Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);
cranelift_entity::entity_impl!(InstId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Eq,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Eq => "eq",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::Shr => "shr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Not,
    IsZero,
}

impl UnOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Not => "not",
            Self::IsZero => "iszero",
        }
    }
}

/// Reads from the execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvOp {
    Caller,
    CallValue,
    Timestamp,
    BlockNumber,
}

impl EnvOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::CallValue => "callvalue",
            Self::Timestamp => "timestamp",
            Self::BlockNumber => "blocknumber",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    /// Widen `i1` to a full word.
    Zext,
    /// Narrow a word to `i1` (zero / non-zero).
    Trunc,
}

impl CastOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zext => "zext",
            Self::Trunc => "trunc",
        }
    }
}

/// An instruction data definition.
///
/// Operand counts are fixed by the variant shape; the type checker
/// guarantees they are respected before IR construction begins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstData {
    /// Materialize a string/bytes constant in scratch memory. The result
    /// is a pointer to the length-prefixed payload; the length is the
    /// UTF-8 byte length, not the code-point count.
    Bytes { data: Box<[u8]> },

    /// Binary instructions.
    Bin { code: BinOp, args: [ValueId; 2] },

    /// Unary instructions.
    Un { code: UnOp, args: [ValueId; 1] },

    /// Environment reads.
    EnvRead { code: EnvOp },

    /// Hash of a memory region, `args = [addr, len]`.
    Hash { args: [ValueId; 2] },

    /// Cast operations.
    Cast {
        code: CastOp,
        args: [ValueId; 1],
        ty: Type,
    },

    /// Byte length of a length-prefixed payload, `args = [addr]`.
    Len { args: [ValueId; 1] },

    /// Element slot of an indexed storage root, `args = [index]`.
    SlotIndex { base: u32, args: [ValueId; 1] },

    /// Load a word from linear memory.
    MLoad { args: [ValueId; 1], ty: Type },

    /// Store a word to linear memory, `args = [addr, value]`.
    MStore { args: [ValueId; 2] },

    /// Load a word from persistent storage, `args = [slot]`.
    SLoad { args: [ValueId; 1] },

    /// Store a word to persistent storage, `args = [slot, value]`.
    SStore { args: [ValueId; 2] },

    /// Bump-allocate `args = [size]` bytes of scratch memory.
    Alloc { args: [ValueId; 1] },
}

impl InstData {
    pub fn args(&self) -> &[ValueId] {
        match self {
            Self::Bytes { .. } | Self::EnvRead { .. } => &[],
            Self::Un { args, .. } | Self::Cast { args, .. } => args,
            Self::Len { args }
            | Self::SlotIndex { args, .. }
            | Self::MLoad { args, .. }
            | Self::SLoad { args }
            | Self::Alloc { args } => args,
            Self::Bin { args, .. }
            | Self::Hash { args }
            | Self::MStore { args }
            | Self::SStore { args } => args,
        }
    }

    pub fn args_mut(&mut self) -> &mut [ValueId] {
        match self {
            Self::Bytes { .. } | Self::EnvRead { .. } => &mut [],
            Self::Un { args, .. } | Self::Cast { args, .. } => args,
            Self::Len { args }
            | Self::SlotIndex { args, .. }
            | Self::MLoad { args, .. }
            | Self::SLoad { args }
            | Self::Alloc { args } => args,
            Self::Bin { args, .. }
            | Self::Hash { args }
            | Self::MStore { args }
            | Self::SStore { args } => args,
        }
    }

    /// Whether the instruction defines a destination temporary.
    pub fn has_result(&self) -> bool {
        !matches!(self, Self::MStore { .. } | Self::SStore { .. })
    }
}

/// A phi node: selects a value depending on the predecessor execution
/// arrived from.
///
/// Once a function is finalized every phi's mapping has exactly one entry
/// per actual predecessor of its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phi {
    pub result: ValueId,
    pub ty: Type,
    pub args: SmallVec<[(BlockId, ValueId); 2]>,
    pub span: Option<SourceSpan>,
}

impl Phi {
    pub fn new(result: ValueId, ty: Type) -> Self {
        Self {
            result,
            ty,
            args: SmallVec::new(),
            span: None,
        }
    }

    pub fn value_for(&self, block: BlockId) -> Option<ValueId> {
        self.args
            .iter()
            .find(|(b, _)| *b == block)
            .map(|(_, v)| *v)
    }

    pub fn append_arg(&mut self, block: BlockId, value: ValueId) {
        debug_assert!(
            self.value_for(block).is_none(),
            "phi already has a source for {block}"
        );
        self.args.push((block, value));
    }

    pub fn remove_arg(&mut self, block: BlockId) -> Option<ValueId> {
        let pos = self.args.iter().position(|(b, _)| *b == block)?;
        Some(self.args.remove(pos).1)
    }
}

/// The final control-transfer operation of a block.
///
/// A call is a terminator, not a value-producing instruction: the calling
/// block's only successor is the continuation block, which makes the
/// tail-call rewrite a pure graph transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Jump {
        dest: BlockId,
    },
    Br {
        cond: ValueId,
        nz_dest: BlockId,
        z_dest: BlockId,
    },
    Return {
        arg: Option<ValueId>,
    },
    Call {
        callee: FuncRef,
        args: SmallVec<[ValueId; 4]>,
        result: Option<ValueId>,
        cont: BlockId,
    },
}

impl Terminator {
    /// Successor blocks, in branch order.
    pub fn dests(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Self::Jump { dest } => smallvec![*dest],
            Self::Br {
                nz_dest, z_dest, ..
            } => {
                if nz_dest == z_dest {
                    smallvec![*nz_dest]
                } else {
                    smallvec![*nz_dest, *z_dest]
                }
            }
            Self::Return { .. } => SmallVec::new(),
            Self::Call { cont, .. } => smallvec![*cont],
        }
    }

    /// Value operands read by the terminator.
    pub fn args(&self) -> SmallVec<[ValueId; 4]> {
        match self {
            Self::Jump { .. } => SmallVec::new(),
            Self::Br { cond, .. } => smallvec![*cond],
            Self::Return { arg } => arg.iter().copied().collect(),
            Self::Call { args, .. } => args.clone(),
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }

    pub fn rewrite_dest(&mut self, from: BlockId, to: BlockId) {
        match self {
            Self::Jump { dest } => rewrite_if_match(dest, from, to),
            Self::Br {
                nz_dest, z_dest, ..
            } => {
                rewrite_if_match(nz_dest, from, to);
                rewrite_if_match(z_dest, from, to);
            }
            Self::Return { .. } => {}
            Self::Call { cont, .. } => rewrite_if_match(cont, from, to),
        }
    }
}

fn rewrite_if_match(block: &mut BlockId, from: BlockId, to: BlockId) {
    if *block == from {
        *block = to
    }
}
