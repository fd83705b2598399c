//! Blocks and functions of the arietta IR.
use std::collections::BTreeSet;

use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{
    dfg::DataFlowGraph,
    inst::{InstId, Phi, Terminator},
    span::SourceSpan,
    types::Type,
    value::{Value, ValueId},
};

/// An opaque reference to [`Block`].
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);
entity_impl!(BlockId, "block");

/// A basic block: ordered phis, ordered instructions, one terminator.
///
/// Predecessor sets are maintained incrementally as terminators are
/// committed, because they drive phi-insertion decisions during
/// construction. A block created only as a jump target before being
/// visited carries a self-jump terminator (a placeholder) until populated.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub phis: Vec<Phi>,
    pub insts: Vec<InstId>,
    pub term: Option<Terminator>,
    pub term_span: Option<SourceSpan>,
    pub preds: BTreeSet<BlockId>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// `id` is the block's own id in the owning function.
    pub fn is_placeholder(&self, id: BlockId) -> bool {
        self.phis.is_empty()
            && self.insts.is_empty()
            && matches!(self.term, Some(Terminator::Jump { dest }) if dest == id)
    }

    pub fn phi_for(&self, value: ValueId) -> Option<&Phi> {
        self.phis.iter().find(|phi| phi.result == value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    name: SmolStr,
    params: SmallVec<[Type; 8]>,
    ret_ty: Type,
}

impl Signature {
    pub fn new(name: &str, params: &[Type], ret_ty: Type) -> Self {
        Self {
            name: name.into(),
            params: params.into(),
            ret_ty,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Type] {
        &self.params
    }

    pub fn ret_ty(&self) -> Type {
        self.ret_ty
    }
}

/// SSA bookkeeping for one temporary: which source variable and version it
/// captures. Only meaningful during construction; later stages never read
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsaMeta {
    pub var: SmolStr,
    pub version: u32,
    pub scope: u32,
    pub ty: Type,
}

pub struct Function {
    pub sig: Signature,
    pub arg_values: SmallVec<[ValueId; 8]>,
    pub dfg: DataFlowGraph,
    pub blocks: PrimaryMap<BlockId, Block>,
    pub entry: PackedOption<BlockId>,
    pub ssa_meta: SecondaryMap<ValueId, Option<SsaMeta>>,
}

impl Function {
    pub fn new(sig: Signature) -> Self {
        let mut dfg = DataFlowGraph::new();
        let arg_values = sig
            .params()
            .iter()
            .enumerate()
            .map(|(idx, ty)| dfg.make_value(Value::Arg { ty: *ty, idx }))
            .collect();

        Self {
            sig,
            arg_values,
            dfg,
            blocks: PrimaryMap::default(),
            entry: None.into(),
            ssa_meta: SecondaryMap::default(),
        }
    }

    pub fn make_block(&mut self) -> BlockId {
        self.blocks.push(Block::new())
    }

    pub fn entry(&self) -> BlockId {
        self.entry.expand().expect("function has no entry block")
    }

    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block]
    }

    pub fn block_mut(&mut self, block: BlockId) -> &mut Block {
        &mut self.blocks[block]
    }

    /// Commit `term` as the terminator of `block`.
    ///
    /// Adds `block` to the predecessor set of every possible destination.
    /// A destination that has never been populated becomes a placeholder
    /// (self-jump) until the builder switches into it.
    pub fn commit_term(&mut self, block: BlockId, term: Terminator, span: Option<SourceSpan>) {
        for dest in term.dests() {
            if dest != block && self.blocks[dest].term.is_none() {
                self.blocks[dest].term = Some(Terminator::Jump { dest });
            }
            self.blocks[dest].preds.insert(block);
        }
        let data = &mut self.blocks[block];
        data.term = Some(term);
        data.term_span = span;
    }

    pub fn succs_of(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        match &self.blocks[block].term {
            Some(term) if !self.blocks[block].is_placeholder(block) => term.dests(),
            _ => SmallVec::new(),
        }
    }

    pub fn preds_of(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks[block].preds.iter().copied()
    }

    /// The phi defining `value`, if any.
    pub fn phi_of(&self, value: ValueId) -> Option<&Phi> {
        match self.dfg.value(value) {
            Value::Phi { block, .. } => self.blocks[*block].phi_for(value),
            _ => None,
        }
    }
}
