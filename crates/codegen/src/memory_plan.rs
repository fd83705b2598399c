//! Spill selection and scratch-memory assignment for one function.
//!
//! A temporary is staged through linear memory when it is live across a
//! block boundary, feeds or is produced by a phi, is produced by a call,
//! or when the emitter reports that reaching it on the stack would exceed
//! the shuffle depth. Offsets come from a bump allocator: function-local
//! scratch memory is discarded wholesale on return, so nothing is ever
//! freed or reused.
use arietta_ir::{Function, InstData, InstId, Terminator, ValueId};
use rustc_hash::FxHashMap;

use crate::{bitset::BitSet, liveness::Liveness};

/// Word size of the target machine.
pub const WORD: u32 = 32;

pub struct MemoryPlan {
    slots: FxHashMap<ValueId, (u32, u32)>,
    /// Static buffers for string/bytes constants, keyed by their
    /// defining instruction.
    data: FxHashMap<InstId, u32>,
    next_offset: u32,
}

impl MemoryPlan {
    /// Scratch (offset, size) of a spilled temporary.
    pub fn entry(&self, value: ValueId) -> Option<(u32, u32)> {
        self.slots.get(&value).copied()
    }

    pub fn slot(&self, value: ValueId) -> Option<u32> {
        self.entry(value).map(|(offset, _)| offset)
    }

    pub fn contains(&self, value: ValueId) -> bool {
        self.slots.contains_key(&value)
    }

    pub fn expect_slot(&self, value: ValueId) -> u32 {
        self.slot(value)
            .unwrap_or_else(|| panic!("spill reference without a memory-plan entry: {value}"))
    }

    pub fn data_offset(&self, inst: InstId) -> u32 {
        *self
            .data
            .get(&inst)
            .unwrap_or_else(|| panic!("bytes constant without a planned buffer"))
    }

    /// First free offset past everything this plan reserved.
    pub fn end_offset(&self) -> u32 {
        self.next_offset
    }
}

/// Plan `func`'s scratch region starting at `base`.
///
/// `requests` carries spill demands discovered by a previous emission
/// attempt (operands out of shuffle reach); planning and emission iterate
/// until no new demands appear.
pub fn plan_function(
    func: &Function,
    liveness: &Liveness,
    requests: &BitSet<ValueId>,
    base: u32,
) -> MemoryPlan {
    let mut selected: BitSet<ValueId> = BitSet::new();

    for block in func.blocks.keys() {
        for value in liveness.live_in(block).iter() {
            selected.insert(value);
        }

        let data = func.block(block);
        for phi in &data.phis {
            selected.insert(phi.result);
            for (_, value) in &phi.args {
                if func.dfg.value_imm(*value).is_none() {
                    selected.insert(*value);
                }
            }
        }
        if let Some(Terminator::Call {
            result: Some(result),
            ..
        }) = &data.term
        {
            selected.insert(*result);
        }
    }

    selected.union_with(requests);

    // Parameters arrive on the operand stack. A single-block function can
    // consume them in place; otherwise they are all staged to memory by
    // the entry bootstrap so later blocks find them at fixed offsets.
    let multi_block = func.blocks.len() > 1;
    let any_param_selected = func.arg_values.iter().any(|arg| selected.contains(*arg));
    if multi_block || any_param_selected {
        for arg in &func.arg_values {
            selected.insert(*arg);
        }
    }

    let mut plan = MemoryPlan {
        slots: FxHashMap::default(),
        data: FxHashMap::default(),
        next_offset: base,
    };

    for value in selected.iter() {
        let size = func.dfg.value_ty(value).size_of() as u32;
        let size = size.max(WORD);
        plan.slots.insert(value, (plan.next_offset, size));
        plan.next_offset += size;
    }

    for block in func.blocks.keys() {
        for inst in &func.block(block).insts {
            if let InstData::Bytes { data } = func.dfg.inst(*inst) {
                let content = (data.len() as u32).div_ceil(WORD) * WORD;
                plan.data.insert(*inst, plan.next_offset);
                plan.next_offset += WORD + content;
            }
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use arietta_ir::{
        builder::build_program,
        inst::BinOp,
        span::{SourceId, SourceSpan},
        tast::{Expr, Stmt, TypedFunc, TypedProgram},
        Type,
    };

    fn sp() -> SourceSpan {
        SourceSpan::new(SourceId(0), 0, 0)
    }

    fn plan_main(body: Vec<Stmt>) -> (arietta_ir::Module, MemoryPlan) {
        let prog = TypedProgram {
            storage: Vec::new(),
            main: TypedFunc {
                name: "test_func".into(),
                params: Vec::new(),
                ret_ty: Type::I256,
                body,
            },
            create: None,
            funcs: Vec::new(),
        };
        let module = build_program(&prog);
        let func = &module.funcs[module.main()];
        let mut live = Liveness::new();
        live.compute(func);
        let plan = plan_function(func, &live, &BitSet::new(), 0x40);
        (module, plan)
    }

    #[test]
    fn straight_line_function_spills_nothing() {
        let body = vec![Stmt::Return {
            value: Some(Expr::word(42, sp())),
            span: sp(),
        }];
        let (_, plan) = plan_main(body);
        assert_eq!(plan.end_offset(), 0x40);
    }

    #[test]
    fn loop_spills_phi_and_back_edge_value() {
        let body = vec![
            Stmt::Let {
                name: "i".into(),
                ty: Type::I256,
                init: Expr::word(0, sp()),
                span: sp(),
            },
            Stmt::While {
                cond: Expr::bin(
                    BinOp::Lt,
                    Type::I1,
                    Expr::var("i", Type::I256, sp()),
                    Expr::word(10, sp()),
                    sp(),
                ),
                body: vec![Stmt::Assign {
                    name: "i".into(),
                    value: Expr::bin(
                        BinOp::Add,
                        Type::I256,
                        Expr::var("i", Type::I256, sp()),
                        Expr::word(1, sp()),
                        sp(),
                    ),
                    span: sp(),
                }],
                span: sp(),
            },
            Stmt::Return {
                value: Some(Expr::var("i", Type::I256, sp())),
                span: sp(),
            },
        ];
        let (module, plan) = plan_main(body);
        let func = &module.funcs[module.main()];

        let header = func
            .blocks
            .keys()
            .find(|b| !func.block(*b).phis.is_empty())
            .unwrap();
        let phi = &func.block(header).phis[0];

        // The phi destination and its non-immediate source are both
        // staged through memory; offsets are bump-allocated words.
        assert!(plan.contains(phi.result));
        let back_edge = phi
            .args
            .iter()
            .map(|(_, v)| *v)
            .find(|v| func.dfg.value_imm(*v).is_none())
            .unwrap();
        assert!(plan.contains(back_edge));
        assert_eq!(plan.end_offset(), 0x40 + 2 * WORD);

        let mut offsets: Vec<u32> = [phi.result, back_edge]
            .iter()
            .map(|v| plan.expect_slot(*v))
            .collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0x40, 0x60]);
    }
}
