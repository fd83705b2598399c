//! Structural consistency checks over finished IR.
//!
//! Everything rejected here indicates a defect in the builder or in a
//! pass, never a user error: the external type checker guarantees that
//! user-facing error classes were already rejected upstream.
use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{
    cfg::post_order,
    function::{BlockId, Function},
    module::Module,
    value::{Value, ValueId},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifierError {
    #[error("{block} has no terminator")]
    MissingTerminator { block: BlockId },

    #[error("{block} is an unresolved placeholder")]
    Placeholder { block: BlockId },

    #[error("terminator of {block} targets a block outside the function")]
    UnknownBlock { block: BlockId },

    #[error("phi {value} in {block} disagrees with the block's predecessors")]
    PhiPredMismatch { block: BlockId, value: ValueId },

    #[error("{value} has no definition site")]
    MissingDef { value: ValueId },
}

pub fn verify_module(module: &Module) -> Result<(), VerifierError> {
    for func_ref in module.iter_functions() {
        verify_func(&module.funcs[func_ref])?;
    }
    Ok(())
}

pub fn verify_func(func: &Function) -> Result<(), VerifierError> {
    let reachable: BTreeSet<BlockId> = post_order(func).collect();

    // Recompute predecessor sets from committed terminators.
    let mut computed_preds: FxHashMap<BlockId, BTreeSet<BlockId>> = FxHashMap::default();
    for &block in &reachable {
        let data = func.block(block);
        let Some(term) = &data.term else {
            return Err(VerifierError::MissingTerminator { block });
        };
        if data.is_placeholder(block) {
            return Err(VerifierError::Placeholder { block });
        }
        for dest in term.dests() {
            if !func.blocks.is_valid(dest) {
                return Err(VerifierError::UnknownBlock { block });
            }
            computed_preds.entry(dest).or_default().insert(block);
        }
    }

    for &block in &reachable {
        let data = func.block(block);
        let preds = computed_preds.remove(&block).unwrap_or_default();

        // The incrementally maintained set must cover every real edge.
        debug_assert!(
            preds.iter().all(|p| data.preds.contains(p)),
            "stale predecessor set on {block}"
        );

        for phi in &data.phis {
            let sources: BTreeSet<BlockId> = phi.args.iter().map(|(b, _)| *b).collect();
            if sources != preds || phi.args.len() != preds.len() {
                return Err(VerifierError::PhiPredMismatch {
                    block,
                    value: phi.result,
                });
            }
            for (_, value) in &phi.args {
                check_def(func, *value)?;
            }
        }

        for inst in &data.insts {
            for arg in func.dfg.inst(*inst).args() {
                check_def(func, *arg)?;
            }
        }
        for arg in data.term.as_ref().unwrap().args() {
            check_def(func, arg)?;
        }
    }

    Ok(())
}

/// Every referenced temporary must have exactly one defining instruction,
/// phi, parameter binding, or call destination, and that definition site
/// must agree that it defines this value.
fn check_def(func: &Function, value: ValueId) -> Result<(), VerifierError> {
    let ok = match func.dfg.value(value) {
        Value::Immediate { .. } => true,
        Value::Arg { idx, .. } => func.arg_values.get(*idx) == Some(&value),
        Value::Inst { inst, .. } => func.dfg.inst_result(*inst) == Some(value),
        Value::Phi { block, .. } => func.block(*block).phi_for(value).is_some(),
        Value::Call { block, .. } => matches!(
            &func.block(*block).term,
            Some(crate::inst::Terminator::Call { result, .. }) if *result == Some(value)
        ),
    };

    if ok {
        Ok(())
    } else {
        Err(VerifierError::MissingDef { value })
    }
}
