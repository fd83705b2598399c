//! Block ordering and the address-resolution fixed point.
//!
//! Jump-target immediates are variable-width pushes whose width depends on
//! the final byte offsets, which in turn depend on every width chosen so
//! far. We lay out optimistically, measure, patch, and repeat until no
//! offset changes; widths only ever ratchet upward, so the loop
//! terminates.
use std::collections::VecDeque;

use arietta_ir::{BlockId, FuncRef, Function, Terminator};
use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashSet;

use crate::{
    opcode::Opcode,
    vcode::{EmitInstId, Label, VCode},
};

/// Choose a linear emission order for `func`'s reachable blocks.
///
/// Each block is followed by its fallthrough successor where possible
/// (the untaken side of a branch, a jump's destination, a call's
/// continuation), which lets the emitter elide explicit jumps.
pub fn block_order(func: &Function) -> Vec<BlockId> {
    let mut order = Vec::new();
    let mut placed = FxHashSet::default();
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    queue.push_back(func.entry());

    while let Some(block) = queue.pop_front() {
        if placed.contains(&block) {
            continue;
        }

        let mut cur = block;
        loop {
            order.push(cur);
            placed.insert(cur);

            let preferred = match &func.block(cur).term {
                Some(Terminator::Jump { dest }) => Some(*dest),
                Some(Terminator::Br { z_dest, .. }) => Some(*z_dest),
                Some(Terminator::Call { cont, .. }) => Some(*cont),
                _ => None,
            };

            for succ in func.succs_of(cur) {
                if Some(succ) != preferred && !placed.contains(&succ) {
                    queue.push_back(succ);
                }
            }

            match preferred {
                Some(next) if !placed.contains(&next) => cur = next,
                _ => break,
            }
        }
    }

    order
}

/// One function's resolved piece of a stream.
struct FuncSlot {
    func: FuncRef,
    vcode: VCode,
    order: Vec<BlockId>,
    block_offsets: SecondaryMap<BlockId, u32>,
    size: u32,
}

/// Byte-address assignment for every function sharing one flat code
/// stream.
pub struct StreamLayout {
    slots: Vec<FuncSlot>,
    func_offsets: SecondaryMap<FuncRef, u32>,
}

impl StreamLayout {
    pub fn new(funcs: Vec<(FuncRef, VCode, Vec<BlockId>)>) -> Self {
        let slots = funcs
            .into_iter()
            .map(|(func, vcode, order)| FuncSlot {
                func,
                vcode,
                order,
                block_offsets: SecondaryMap::default(),
                size: 0,
            })
            .collect();

        Self {
            slots,
            func_offsets: SecondaryMap::default(),
        }
    }

    /// Iterate measure→patch to the fixed point.
    pub fn resolve(&mut self) {
        while self.resize() {}
    }

    fn resize(&mut self) -> bool {
        let mut did_change = false;
        let mut offset = 0u32;

        for idx in 0..self.slots.len() {
            let func = self.slots[idx].func;
            did_change |= update(&mut self.func_offsets[func], offset);

            let mut cursor = offset;
            let slot = &mut self.slots[idx];
            for i in 0..slot.order.len() {
                let block = slot.order[i];
                did_change |= update(&mut slot.block_offsets[block], cursor);

                let insts: Vec<EmitInstId> = slot.vcode.block_insts(block).collect();
                for inst in insts {
                    // Ratchet label pushes wide enough for their target.
                    if let Some(label) = slot.vcode.label_uses[inst].expand() {
                        let address = match slot.vcode.labels[label] {
                            Label::Block(b) => slot.block_offsets[b],
                            Label::Func(f) => self.func_offsets[f],
                        };
                        let needed = be_width(address);
                        if let Opcode::Push(width) = slot.vcode.insts[inst] {
                            if needed > width {
                                slot.vcode.insts[inst] = Opcode::Push(needed);
                                did_change = true;
                            }
                        } else {
                            panic!("label attached to a non-push opcode");
                        }
                    }

                    cursor += 1 + slot.vcode.insts[inst].immediate_width() as u32;
                }
            }

            did_change |= update(&mut slot.size, cursor - offset);
            offset = cursor;
        }

        did_change
    }

    /// Encode the stream; every jump immediate now equals the byte offset
    /// of its destination's first emitted instruction.
    pub fn emit(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for slot in &self.slots {
            for &block in &slot.order {
                for inst in slot.vcode.block_insts(block) {
                    let op = slot.vcode.insts[inst];
                    buf.push(op.encode());

                    if let Some(label) = slot.vcode.label_uses[inst].expand() {
                        let address = match slot.vcode.labels[label] {
                            Label::Block(b) => slot.block_offsets[b],
                            Label::Func(f) => self.func_offsets[f],
                        };
                        let width = op.immediate_width();
                        let be = address.to_be_bytes();
                        buf.extend_from_slice(&be[4 - width..]);
                    } else if let Some(bytes) = &slot.vcode.imm_bytes[inst] {
                        buf.extend_from_slice(bytes);
                    }
                }
            }
        }
        buf
    }

    pub fn func_offset(&self, func: FuncRef) -> u32 {
        self.func_offsets[func]
    }

    pub fn block_offset(&self, func: FuncRef, block: BlockId) -> u32 {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.func == func)
            .expect("function not in this stream");
        slot.block_offsets[block]
    }

    pub fn funcs(&self) -> impl Iterator<Item = FuncRef> + '_ {
        self.slots.iter().map(|slot| slot.func)
    }

    pub fn vcode_of(&self, func: FuncRef) -> &VCode {
        &self
            .slots
            .iter()
            .find(|slot| slot.func == func)
            .expect("function not in this stream")
            .vcode
    }
}

fn update(val: &mut u32, to: u32) -> bool {
    let did_change = *val != to;
    *val = to;
    did_change
}

/// Minimal big-endian byte width of `value`; at least one byte so a zero
/// address still gets a real immediate.
fn be_width(value: u32) -> u8 {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    (bytes.len() - skip).max(1) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use arietta_ir::{
        builder::build_program,
        span::{SourceId, SourceSpan},
        tast::{Expr, Stmt, TypedFunc, TypedProgram},
        Type,
    };

    fn sp() -> SourceSpan {
        SourceSpan::new(SourceId(0), 0, 0)
    }

    #[test]
    fn order_prefers_fallthrough_and_covers_reachable_blocks() {
        // if true { storage[0] = 1 } else { storage[0] = 2 }
        let body = vec![Stmt::If {
            cond: Expr::boolean(true, sp()),
            then_body: vec![Stmt::StorageAssign {
                slot: 0,
                index: None,
                value: Expr::word(1, sp()),
                span: sp(),
            }],
            else_body: vec![Stmt::StorageAssign {
                slot: 0,
                index: None,
                value: Expr::word(2, sp()),
                span: sp(),
            }],
            span: sp(),
        }];
        let prog = TypedProgram {
            storage: Vec::new(),
            main: TypedFunc {
                name: "main".into(),
                params: Vec::new(),
                ret_ty: Type::Unit,
                body,
            },
            create: None,
            funcs: Vec::new(),
        };
        let module = build_program(&prog);
        let func = &module.funcs[module.main()];

        let order = block_order(func);
        assert_eq!(order[0], func.entry());

        // The untaken (else) edge follows the branch directly.
        let Some(Terminator::Br { z_dest, .. }) = &func.block(func.entry()).term else {
            panic!("entry must end in a branch");
        };
        assert_eq!(order[1], *z_dest);

        // Every reachable block appears exactly once.
        let reachable: Vec<_> = arietta_ir::post_order(func).collect();
        assert_eq!(order.len(), reachable.len());
        let mut sorted = order.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), order.len());
    }
}
