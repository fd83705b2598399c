//! Backward liveness over a function's block graph.
//!
//! Per block we compute definitions and upward-exposed uses, then iterate
//! the standard dataflow equations to a fixed point. The visitation order
//! only affects convergence speed, never the result.
//!
//! Phi arguments count as uses at the tail of the contributing
//! predecessor, not of the block containing the phi; a phi's result is a
//! definition of its own block. Immediates are rematerialized at every use
//! and never participate in liveness.
use arietta_ir::{cfg::post_order, BlockId, Function, ValueId};
use cranelift_entity::SecondaryMap;

use crate::bitset::BitSet;

#[derive(Default)]
pub struct Liveness {
    live_ins: SecondaryMap<BlockId, BitSet<ValueId>>,
    live_outs: SecondaryMap<BlockId, BitSet<ValueId>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(&mut self, func: &Function) {
        self.clear();

        let blocks: Vec<BlockId> = post_order(func).collect();

        // Strict SSA puts every definition before its in-block uses, so
        // def and use sets can be collected independently. Phis define
        // their own block; a call terminator's destination is defined at
        // the top of the continuation.
        let mut defs: SecondaryMap<BlockId, BitSet<ValueId>> = SecondaryMap::default();
        for &block in &blocks {
            let data = func.block(block);
            for phi in &data.phis {
                defs[block].insert(phi.result);
            }
            for inst in &data.insts {
                if let Some(result) = func.dfg.inst_result(*inst) {
                    defs[block].insert(result);
                }
            }
            if let Some(arietta_ir::Terminator::Call {
                result: Some(result),
                cont,
                ..
            }) = &data.term
            {
                defs[*cont].insert(*result);
            }
        }

        let mut upuses: SecondaryMap<BlockId, BitSet<ValueId>> = SecondaryMap::default();
        for &block in &blocks {
            let data = func.block(block);
            for inst in &data.insts {
                for &arg in func.dfg.inst(*inst).args() {
                    mark_use(func, &defs[block], &mut upuses[block], arg);
                }
            }
            if let Some(term) = &data.term {
                for arg in term.args() {
                    mark_use(func, &defs[block], &mut upuses[block], arg);
                }
            }
            // A phi source is a use at the end of the predecessor it names.
            for succ in func.succs_of(block) {
                for phi in &func.block(succ).phis {
                    if let Some(value) = phi.value_for(block) {
                        mark_use(func, &defs[block], &mut upuses[block], value);
                    }
                }
            }
        }

        loop {
            let mut changed = false;
            for &block in &blocks {
                let mut out = BitSet::new();
                for succ in func.succs_of(block) {
                    out.union_with(&self.live_ins[succ]);
                }

                let mut live_in = upuses[block].clone();
                for value in out.iter() {
                    if !defs[block].contains(value) {
                        live_in.insert(value);
                    }
                }

                if out != self.live_outs[block] {
                    self.live_outs[block] = out;
                    changed = true;
                }
                if live_in != self.live_ins[block] {
                    self.live_ins[block] = live_in;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    pub fn live_in(&self, block: BlockId) -> &BitSet<ValueId> {
        &self.live_ins[block]
    }

    pub fn live_out(&self, block: BlockId) -> &BitSet<ValueId> {
        &self.live_outs[block]
    }

    pub fn clear(&mut self) {
        self.live_ins.clear();
        self.live_outs.clear();
    }
}

fn mark_use(
    func: &Function,
    defs: &BitSet<ValueId>,
    upuses: &mut BitSet<ValueId>,
    value: ValueId,
) {
    if func.dfg.value_imm(value).is_some() || defs.contains(value) {
        return;
    }
    upuses.insert(value);
}
