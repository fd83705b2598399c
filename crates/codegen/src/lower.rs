//! Instruction emission for one SSA function.
//!
//! Operands are materialized at the top of the implicit operand stack
//! right before each operation: immediates are pushed, spilled temporaries
//! are reloaded from their planned offsets, and block-local values are
//! duplicated from their tracked stack position (or consumed in place on
//! their last use). Values the memory plan stages through memory are
//! written back as soon as they are produced, so the operand stack is
//! empty (up to the callee's return address) at every block boundary.
//!
//! An operand deeper than the shuffle reach cannot be duplicated; the
//! emitter records a spill request for it and the caller re-plans and
//! re-emits. The symbolic stack model doubles as a debug-mode check of
//! the stack-effect table.
use arietta_ir::{
    BlockId, Function, Immediate, InstData, InstId, SourceSpan, Terminator, ValueId,
};
use rustc_hash::FxHashMap;

use crate::{
    bitset::BitSet,
    memory_plan::MemoryPlan,
    opcode::{Opcode, STACK_REACH},
    sym_stack::{StackVal, SymStack},
    vcode::{Label, VCode},
};

/// Scratch address of the bump-allocator frontier word.
pub const FREE_PTR: u32 = 0x00;
/// Scratch buffer a value-returning entry function returns through.
pub const RETURN_BUF: u32 = 0x20;
/// First byte available for spill slots and static data.
pub const SCRATCH_BASE: u32 = 0x40;

/// How a function sits in its output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    /// First function of a stream: runs with an empty stack, returns with
    /// `RETURN`/`STOP`.
    StreamEntry,
    /// Reached through the calling convention: keeps the caller's return
    /// address at the bottom of its frame and returns by jumping to it.
    Internal,
}

/// Emit `func` as a linear opcode stream in `order`.
///
/// `Err` carries spill requests for operands that were out of shuffle
/// reach; the caller re-plans memory and tries again.
pub fn lower_func(
    func: &Function,
    plan: &MemoryPlan,
    order: &[BlockId],
    kind: FuncKind,
    watermark: u32,
) -> Result<VCode, BitSet<ValueId>> {
    let mut ctx = LowerCtx::new(func, plan, order, kind, watermark);
    for (idx, &block) in order.iter().enumerate() {
        ctx.lower_block(block, idx);
    }

    if ctx.requests.is_empty() {
        Ok(ctx.vcode)
    } else {
        Err(ctx.requests)
    }
}

struct LowerCtx<'a> {
    func: &'a Function,
    plan: &'a MemoryPlan,
    order: &'a [BlockId],
    pos: FxHashMap<BlockId, usize>,
    /// Call continuations and the result value they receive.
    conts: FxHashMap<BlockId, Option<ValueId>>,
    vcode: VCode,
    stack: SymStack,
    uses_left: FxHashMap<ValueId, u32>,
    requests: BitSet<ValueId>,
    cur_span: Option<SourceSpan>,
    kind: FuncKind,
    watermark: u32,
}

impl<'a> LowerCtx<'a> {
    fn new(
        func: &'a Function,
        plan: &'a MemoryPlan,
        order: &'a [BlockId],
        kind: FuncKind,
        watermark: u32,
    ) -> Self {
        let pos = order.iter().enumerate().map(|(i, b)| (*b, i)).collect();

        let mut conts = FxHashMap::default();
        for block in func.blocks.keys() {
            if let Some(Terminator::Call { result, cont, .. }) = &func.block(block).term {
                conts.insert(*cont, *result);
            }
        }

        Self {
            func,
            plan,
            order,
            pos,
            conts,
            vcode: VCode::new(),
            stack: SymStack::new(),
            uses_left: FxHashMap::default(),
            requests: BitSet::new(),
            cur_span: None,
            kind,
            watermark,
        }
    }

    fn base_depth(&self) -> usize {
        match self.kind {
            FuncKind::StreamEntry => 0,
            FuncKind::Internal => 1,
        }
    }

    fn lower_block(&mut self, block: BlockId, idx: usize) {
        let start = self.vcode.insts.len() as u32;
        self.cur_span = None;

        self.stack.clear();
        if self.kind == FuncKind::Internal {
            // Caller's return address sits at the bottom of the frame.
            self.stack.push_scratch();
        }

        let is_entry = block == self.func.entry();
        if is_entry && self.kind == FuncKind::Internal {
            for arg in self.func.arg_values.iter().rev() {
                self.stack.push_value(*arg);
            }
        }
        let cont_result = self.conts.get(&block).copied();
        if let Some(Some(result)) = cont_result {
            self.stack.push_value(result);
        }

        if self.needs_jumpdest(block, idx) {
            self.emit(Opcode::JumpDest);
        }

        if is_entry {
            match self.kind {
                FuncKind::StreamEntry => {
                    // Initialize the allocation frontier past the static
                    // scratch region.
                    self.push_imm_u32(self.watermark);
                    self.push_imm_u32(FREE_PTR);
                    self.emit(Opcode::MStore);
                }
                FuncKind::Internal => {
                    let staged = self
                        .func
                        .arg_values
                        .first()
                        .is_some_and(|arg| self.plan.contains(*arg));
                    if staged {
                        for arg in self.func.arg_values.clone() {
                            let slot = self.plan.expect_slot(arg);
                            self.push_imm_u32(slot);
                            self.emit(Opcode::MStore);
                        }
                    }
                }
            }
        }

        if let Some(Some(result)) = cont_result {
            let slot = self.plan.expect_slot(result);
            self.push_imm_u32(slot);
            self.emit(Opcode::MStore);
        }

        self.uses_left = self.count_block_uses(block);

        let insts = self.func.block(block).insts.clone();
        for inst in insts {
            self.lower_inst(inst);
        }

        self.vcode.term_starts[block] = self.vcode.insts.len() as u32;
        self.lower_term(block, idx);

        let end = self.vcode.insts.len() as u32;
        self.vcode.block_ranges.push((block, start, end));
    }

    fn lower_inst(&mut self, inst: InstId) {
        self.cur_span = self.func.dfg.inst_span(inst);
        let data = self.func.dfg.inst(inst).clone();

        match &data {
            InstData::Bytes { data } => self.lower_bytes(inst, data),

            InstData::Bin { code, args } => {
                self.stage_args(args);
                let op = match code {
                    arietta_ir::BinOp::Add => Opcode::Add,
                    arietta_ir::BinOp::Sub => Opcode::Sub,
                    arietta_ir::BinOp::Mul => Opcode::Mul,
                    arietta_ir::BinOp::Div => Opcode::Div,
                    arietta_ir::BinOp::Mod => Opcode::Mod,
                    arietta_ir::BinOp::Lt => Opcode::Lt,
                    arietta_ir::BinOp::Gt => Opcode::Gt,
                    arietta_ir::BinOp::Eq => Opcode::Eq,
                    arietta_ir::BinOp::And => Opcode::And,
                    arietta_ir::BinOp::Or => Opcode::Or,
                    arietta_ir::BinOp::Xor => Opcode::Xor,
                    arietta_ir::BinOp::Shl => Opcode::Shl,
                    arietta_ir::BinOp::Shr => Opcode::Shr,
                };
                self.emit(op);
            }

            InstData::Un { code, args } => {
                self.stage_args(args);
                let op = match code {
                    arietta_ir::UnOp::Not => Opcode::Not,
                    arietta_ir::UnOp::IsZero => Opcode::IsZero,
                };
                self.emit(op);
            }

            InstData::EnvRead { code } => {
                let op = match code {
                    arietta_ir::EnvOp::Caller => Opcode::Caller,
                    arietta_ir::EnvOp::CallValue => Opcode::CallValue,
                    arietta_ir::EnvOp::Timestamp => Opcode::Timestamp,
                    arietta_ir::EnvOp::BlockNumber => Opcode::Number,
                };
                self.emit(op);
            }

            InstData::Hash { args } => {
                self.stage_args(args);
                self.emit(Opcode::Keccak256);
            }

            InstData::Cast { code, args, .. } => match code {
                // An i1 is already a 0/1 word; widening is free.
                arietta_ir::CastOp::Zext => self.stage_args(args),
                arietta_ir::CastOp::Trunc => {
                    self.stage_args(args);
                    self.emit(Opcode::IsZero);
                    self.emit(Opcode::IsZero);
                }
            },

            InstData::Len { args } => {
                // The byte length is the word the payload pointer points at.
                self.stage_args(args);
                self.emit(Opcode::MLoad);
            }

            InstData::SlotIndex { base, args } => {
                self.stage_args(args);
                self.push_imm_u32(*base);
                self.emit(Opcode::Add);
            }

            InstData::MLoad { args, .. } => {
                self.stage_args(args);
                self.emit(Opcode::MLoad);
            }

            InstData::MStore { args } => {
                self.stage_args(args);
                self.emit(Opcode::MStore);
            }

            InstData::SLoad { args } => {
                self.stage_args(args);
                self.emit(Opcode::SLoad);
            }

            InstData::SStore { args } => {
                self.stage_args(args);
                self.emit(Opcode::SStore);
            }

            InstData::Alloc { args } => {
                self.push_imm_u32(FREE_PTR);
                self.emit(Opcode::MLoad);
                self.emit(Opcode::Dup(1));
                self.stage_one(args[0], 1);
                self.emit(Opcode::Add);
                self.push_imm_u32(FREE_PTR);
                self.emit(Opcode::MStore);
            }
        }

        if let Some(result) = self.func.dfg.inst_result(inst) {
            self.place_result(result);
        }
    }

    /// Write a string/bytes constant into its planned static buffer:
    /// first the byte length, then the contents in 32-byte chunks.
    fn lower_bytes(&mut self, inst: InstId, data: &[u8]) {
        let offset = self.plan.data_offset(inst);

        self.push_imm_u64(data.len() as u64);
        self.push_imm_u32(offset);
        self.emit(Opcode::MStore);

        for (i, chunk) in data.chunks(32).enumerate() {
            let mut word = [0u8; 32];
            word[..chunk.len()].copy_from_slice(chunk);
            self.vcode
                .push_with_imm(Opcode::Push(32), &word, self.cur_span);
            self.stack.push_scratch();
            self.push_imm_u32(offset + 32 + 32 * i as u32);
            self.emit(Opcode::MStore);
        }

        self.push_imm_u32(offset);
    }

    fn place_result(&mut self, result: ValueId) {
        if let Some(slot) = self.plan.slot(result) {
            self.push_imm_u32(slot);
            self.emit(Opcode::MStore);
        } else {
            self.stack.name_top(result);
            if self.uses_left.get(&result).copied().unwrap_or(0) == 0 {
                self.emit(Opcode::Pop);
            }
        }
    }

    fn lower_term(&mut self, block: BlockId, idx: usize) {
        let data = self.func.block(block);
        self.cur_span = data.term_span;
        let term = data
            .term
            .clone()
            .unwrap_or_else(|| panic!("{block} reached emission without a terminator"));

        // Write this edge's phi sources into the destinations' slots. Each
        // predecessor edge writes its own source before entering the
        // successor, so an unconditionally emitted store on the untaken
        // branch is always overwritten before it can be observed.
        for dest in term.dests() {
            if !self.pos.contains_key(&dest) {
                panic!("terminator of {block} targets unlaid-out {dest}");
            }
            let phis = self.func.block(dest).phis.clone();
            for phi in &phis {
                let value = phi.value_for(block).unwrap_or_else(|| {
                    panic!("phi {} lacks a source for predecessor {block}", phi.result)
                });
                self.stage_one(value, 0);
                let slot = self.plan.expect_slot(phi.result);
                self.push_imm_u32(slot);
                self.emit(Opcode::MStore);
            }
        }

        self.drain_dead();

        match term {
            Terminator::Jump { dest } => {
                if !self.is_next(dest, idx) {
                    self.push_label(Label::Block(dest));
                    self.emit(Opcode::Jump);
                }
                debug_assert_eq!(self.stack.depth(), self.base_depth());
            }

            Terminator::Br {
                cond,
                nz_dest,
                z_dest,
            } => {
                self.stage_one(cond, 0);
                self.push_label(Label::Block(nz_dest));
                self.emit(Opcode::JumpI);
                if !self.is_next(z_dest, idx) {
                    self.push_label(Label::Block(z_dest));
                    self.emit(Opcode::Jump);
                }
                debug_assert_eq!(self.stack.depth(), self.base_depth());
            }

            Terminator::Return { arg } => match self.kind {
                FuncKind::StreamEntry => match arg {
                    Some(value) => {
                        // The staged return value belongs to the block
                        // body; only the transfer itself is terminator
                        // territory.
                        self.stage_one(value, 0);
                        self.vcode.term_starts[block] = self.vcode.insts.len() as u32;
                        self.push_imm_u32(RETURN_BUF);
                        self.emit(Opcode::MStore);
                        self.push_imm_u64(32);
                        self.push_imm_u32(RETURN_BUF);
                        self.emit(Opcode::Return);
                    }
                    None => self.emit(Opcode::Stop),
                },
                FuncKind::Internal => match arg {
                    Some(value) => {
                        self.stage_one(value, 0);
                        self.vcode.term_starts[block] = self.vcode.insts.len() as u32;
                        self.emit(Opcode::Swap(1));
                        self.emit(Opcode::Jump);
                    }
                    None => self.emit(Opcode::Jump),
                },
            },

            Terminator::Call {
                callee, args, cont, ..
            } => {
                // Continuation address below the arguments; the first
                // argument ends on top for the callee's entry staging.
                self.push_label(Label::Block(cont));
                for (staged, &arg) in args.iter().rev().enumerate() {
                    self.stage_one(arg, staged + 1);
                }
                self.push_label(Label::Func(callee));
                self.emit(Opcode::Jump);
                // The callee consumes the staged frame; account for the
                // handoff so the model ends the block balanced.
                for _ in 0..=args.len() {
                    self.stack.pop();
                }
                debug_assert_eq!(self.stack.depth(), self.base_depth());
            }
        }
    }

    /// Pop values whose uses in this block are exhausted. A buried dead
    /// value is swapped to the top first; the model tracks the live value
    /// it displaces.
    fn drain_dead(&mut self) {
        loop {
            let above_base = self.stack.depth() - self.base_depth();
            let dead = (0..above_base).find(|&depth| match self.stack.get(depth) {
                Some(StackVal::Value(value)) => {
                    self.uses_left.get(&value).copied().unwrap_or(0) == 0
                }
                _ => false,
            });
            let Some(depth) = dead else { break };

            if depth > 0 {
                assert!(
                    depth <= STACK_REACH as usize,
                    "dead operand beyond shuffle reach during cleanup"
                );
                self.emit(Opcode::Swap(depth as u8));
            }
            self.emit(Opcode::Pop);
        }
    }

    /// Materialize `value` on top of the stack, above `staged` operands
    /// that were already put in place for the same operation.
    fn stage_one(&mut self, value: ValueId, staged: usize) {
        if let Some(imm) = self.func.dfg.value_imm(value) {
            self.push_imm(imm);
            return;
        }
        if let Some(slot) = self.plan.slot(value) {
            self.push_imm_u32(slot);
            self.emit(Opcode::MLoad);
            return;
        }

        let Some(depth) = self.stack.depth_of_below(value, staged) else {
            panic!("operand {value} is neither on the stack nor in the memory plan");
        };
        let remaining = self.uses_left.get(&value).copied().unwrap_or(0);
        if remaining <= 1 && depth == staged {
            // Last use, already in position: consume it in place.
            self.dec_use(value);
            return;
        }

        let reach = depth + 1;
        if reach > STACK_REACH as usize {
            // Out of shuffle reach. Request a spill and keep the stream
            // well-formed with a placeholder; this emission attempt will
            // be discarded.
            self.requests.insert(value);
            self.push_bytes(&[]);
        } else {
            self.emit(Opcode::Dup(reach as u8));
        }
        self.dec_use(value);
    }

    fn stage_args(&mut self, args: &[ValueId]) {
        for (staged, &arg) in args.iter().rev().enumerate() {
            self.stage_one(arg, staged);
        }
    }

    fn count_block_uses(&self, block: BlockId) -> FxHashMap<ValueId, u32> {
        let mut counts: FxHashMap<ValueId, u32> = FxHashMap::default();
        let tracked = |v: ValueId| self.func.dfg.value_imm(v).is_none() && !self.plan.contains(v);

        let data = self.func.block(block);
        for inst in &data.insts {
            for &arg in self.func.dfg.inst(*inst).args() {
                if tracked(arg) {
                    *counts.entry(arg).or_default() += 1;
                }
            }
        }
        if let Some(term) = &data.term {
            for arg in term.args() {
                if tracked(arg) {
                    *counts.entry(arg).or_default() += 1;
                }
            }
            for dest in term.dests() {
                for phi in &self.func.block(dest).phis {
                    if let Some(value) = phi.value_for(block) {
                        if tracked(value) {
                            *counts.entry(value).or_default() += 1;
                        }
                    }
                }
            }
        }
        counts
    }

    fn dec_use(&mut self, value: ValueId) {
        if let Some(count) = self.uses_left.get_mut(&value) {
            *count = count.saturating_sub(1);
        }
    }

    /// A block needs a jump-target marker only when some predecessor
    /// reaches it by an explicit jump or branch rather than fallthrough.
    fn needs_jumpdest(&self, block: BlockId, idx: usize) -> bool {
        if block == self.func.entry() {
            return self.kind == FuncKind::Internal;
        }
        let prev = self.order[idx - 1];

        self.func.preds_of(block).any(|pred| {
            if !self.pos.contains_key(&pred) {
                return false;
            }
            match &self.func.block(pred).term {
                Some(Terminator::Jump { dest }) => !(pred == prev && *dest == block),
                Some(Terminator::Br {
                    nz_dest, z_dest, ..
                }) => block == *nz_dest || (block == *z_dest && pred != prev),
                // A continuation is reached by the callee's return jump.
                Some(Terminator::Call { .. }) => true,
                _ => false,
            }
        })
    }

    fn is_next(&self, block: BlockId, idx: usize) -> bool {
        self.order.get(idx + 1) == Some(&block)
    }

    fn emit(&mut self, op: Opcode) {
        match op {
            Opcode::Dup(n) => self.stack.dup(n as usize),
            Opcode::Swap(n) => self.stack.swap(n as usize),
            _ => {
                let (consumed, produced) = op.stack_effect();
                self.stack.apply_effect(consumed, produced);
            }
        }
        self.vcode.push(op, self.cur_span);
    }

    fn push_label(&mut self, dest: Label) {
        // Width is a guess; address resolution ratchets it up as needed.
        self.vcode
            .push_with_label(Opcode::Push(2), dest, self.cur_span);
        self.stack.push_scratch();
    }

    fn push_imm(&mut self, imm: Immediate) {
        let bytes = imm.to_be_bytes_trimmed();
        self.push_bytes(&bytes);
    }

    fn push_imm_u32(&mut self, value: u32) {
        self.push_imm_u64(value as u64);
    }

    fn push_imm_u64(&mut self, value: u64) {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let bytes = bytes[skip..].to_vec();
        self.push_bytes(&bytes);
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.vcode
            .push_with_imm(Opcode::Push(bytes.len() as u8), bytes, self.cur_span);
        self.stack.push_scratch();
    }
}
