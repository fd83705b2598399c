//! The emitted-instruction stream for one function.
use arietta_ir::{BlockId, FuncRef, SourceSpan};
use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

use crate::opcode::Opcode;

#[derive(Debug, Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct EmitInstId(pub u32);
entity_impl!(EmitInstId);

#[derive(Debug, Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);
entity_impl!(LabelId);

/// A not-yet-resolved jump target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Label {
    Block(BlockId),
    Func(FuncRef),
}

/// Instructions in final emission order, with immediate bytes, label
/// references, and provenance kept in side tables.
pub struct VCode {
    pub insts: PrimaryMap<EmitInstId, Opcode>,
    pub imm_bytes: SecondaryMap<EmitInstId, Option<SmallVec<[u8; 8]>>>,
    pub labels: PrimaryMap<LabelId, Label>,
    pub label_uses: SecondaryMap<EmitInstId, PackedOption<LabelId>>,
    pub spans: SecondaryMap<EmitInstId, Option<SourceSpan>>,
    /// Half-open instruction ranges per block, in layout order.
    pub block_ranges: Vec<(BlockId, u32, u32)>,
    /// Index where each block's terminator sequence begins.
    pub term_starts: SecondaryMap<BlockId, u32>,
}

impl VCode {
    pub fn new() -> Self {
        Self {
            insts: PrimaryMap::default(),
            imm_bytes: SecondaryMap::default(),
            labels: PrimaryMap::default(),
            label_uses: SecondaryMap::default(),
            spans: SecondaryMap::default(),
            block_ranges: Vec::new(),
            term_starts: SecondaryMap::default(),
        }
    }

    pub fn push(&mut self, op: Opcode, span: Option<SourceSpan>) -> EmitInstId {
        let inst = self.insts.push(op);
        self.spans[inst] = span;
        inst
    }

    pub fn push_with_imm(
        &mut self,
        op: Opcode,
        bytes: &[u8],
        span: Option<SourceSpan>,
    ) -> EmitInstId {
        debug_assert_eq!(op.immediate_width(), bytes.len());
        let inst = self.push(op, span);
        self.imm_bytes[inst] = Some(bytes.into());
        inst
    }

    pub fn push_with_label(
        &mut self,
        op: Opcode,
        dest: Label,
        span: Option<SourceSpan>,
    ) -> EmitInstId {
        let inst = self.push(op, span);
        let label = self.labels.push(dest);
        self.label_uses[inst] = label.into();
        inst
    }

    pub fn block_insts(&self, block: BlockId) -> impl Iterator<Item = EmitInstId> + '_ {
        let range = self
            .block_ranges
            .iter()
            .find(|(b, _, _)| *b == block)
            .map(|(_, start, end)| (*start, *end))
            .unwrap_or((0, 0));
        (range.0..range.1).map(EmitInstId)
    }

    /// Net stack effect of a block's instructions before its terminator
    /// sequence, per the declared stack-effect table.
    pub fn net_effect_before_term(&self, block: BlockId) -> i32 {
        let term_start = self.term_starts[block];
        self.block_insts(block)
            .filter(|inst| inst.0 < term_start)
            .map(|inst| {
                let (consumed, produced) = self.insts[inst].stack_effect();
                produced as i32 - consumed as i32
            })
            .sum()
    }
}

impl Default for VCode {
    fn default() -> Self {
        Self::new()
    }
}
