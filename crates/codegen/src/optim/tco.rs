//! Tail-call elimination as a control-flow rewrite.
//!
//! Because calls are terminators, a tail call is recognizable purely from
//! graph shape: a self-call whose continuation block does nothing but
//! return the call's result (or nothing). Each such call becomes a jump
//! back to a loop-header block that threads the arguments through
//! loop-carried phi nodes; self-recursion turns into iteration without
//! scanning linear code for a return-after-call pattern.
use arietta_ir::{Block, BlockId, FuncRef, Function, Phi, Terminator, Value, ValueId};

/// Rewrite every eliminable self tail call in `func`. Returns `true` if
/// the function changed.
pub fn run(func: &mut Function, self_ref: FuncRef) -> bool {
    let candidates = collect_candidates(func, self_ref);
    if candidates.is_empty() {
        return false;
    }

    let entry = func.entry();
    let header = install_loop_header(func);

    // The entry's body (and with it any candidate terminator) now lives in
    // the header.
    let candidates = candidates
        .into_iter()
        .map(|block| if block == entry { header } else { block });

    for block in candidates {
        let Some(Terminator::Call { args, cont, .. }) = func.block(block).term.clone() else {
            unreachable!("candidate lost its call terminator");
        };

        // The recursive call becomes a back edge into the header; the
        // continuation is now unreachable from this block.
        func.blocks[cont].preds.remove(&block);
        func.commit_term(block, Terminator::Jump { dest: header }, None);

        let phis = &mut func.blocks[header].phis;
        for (phi, arg) in phis.iter_mut().zip(args.iter()) {
            phi.append_arg(block, *arg);
        }
    }

    true
}

/// Blocks ending in a self-call whose continuation only forwards the
/// result out of the function.
fn collect_candidates(func: &Function, self_ref: FuncRef) -> Vec<BlockId> {
    func.blocks
        .keys()
        .filter(|&block| {
            let Some(Terminator::Call {
                callee,
                result,
                cont,
                ..
            }) = &func.block(block).term
            else {
                return false;
            };
            if *callee != self_ref {
                return false;
            }

            let cont_data = func.block(*cont);
            cont_data.phis.is_empty()
                && cont_data.insts.is_empty()
                && matches!(
                    &cont_data.term,
                    Some(Terminator::Return { arg }) if *arg == *result
                )
        })
        .collect()
}

/// Split the entry: its body moves to a fresh loop-header block, the entry
/// itself degenerates to a jump, and every parameter gains a header phi
/// seeded with the entry-edge argument value.
fn install_loop_header(func: &mut Function) -> BlockId {
    let entry = func.entry();
    let header = func.make_block();

    let moved = std::mem::replace(&mut func.blocks[entry], Block::new());
    func.blocks[header] = moved;
    func.blocks[header].preds.clear();

    // Successor bookkeeping follows the moved terminator.
    let dests: Vec<BlockId> = func.blocks[header]
        .term
        .as_ref()
        .map(|term| term.dests().to_vec())
        .unwrap_or_default();
    for dest in dests {
        func.blocks[dest].preds.remove(&entry);
        func.blocks[dest].preds.insert(header);
    }
    for block in func.blocks.keys().collect::<Vec<_>>() {
        for phi in &mut func.blocks[block].phis {
            for (pred, _) in phi.args.iter_mut() {
                if *pred == entry {
                    *pred = header;
                }
            }
        }
    }

    // One loop-carried phi per parameter. Uses are redirected before the
    // entry-edge source is attached, so the phi's own seed keeps referring
    // to the raw argument value.
    let params: Vec<ValueId> = func.arg_values.iter().copied().collect();
    for param in params {
        let ty = func.dfg.value_ty(param);
        let dest = func.dfg.make_value(Value::Phi { block: header, ty });
        replace_uses(func, param, dest);
        let mut phi = Phi::new(dest, ty);
        phi.append_arg(entry, param);
        func.blocks[header].phis.push(phi);
    }

    func.commit_term(entry, Terminator::Jump { dest: header }, None);
    header
}

fn replace_uses(func: &mut Function, from: ValueId, to: ValueId) {
    let blocks: Vec<BlockId> = func.blocks.keys().collect();
    for block in blocks {
        let data = &mut func.blocks[block];
        for phi in &mut data.phis {
            for (_, value) in phi.args.iter_mut() {
                if *value == from {
                    *value = to;
                }
            }
        }

        let insts = data.insts.clone();
        if let Some(term) = &mut data.term {
            replace_in_term(term, from, to);
        }
        for inst in insts {
            for arg in func.dfg.inst_mut(inst).args_mut() {
                if *arg == from {
                    *arg = to;
                }
            }
        }
    }
}

fn replace_in_term(term: &mut Terminator, from: ValueId, to: ValueId) {
    match term {
        Terminator::Jump { .. } => {}
        Terminator::Br { cond, .. } => {
            if *cond == from {
                *cond = to;
            }
        }
        Terminator::Return { arg } => {
            if *arg == Some(from) {
                *arg = Some(to);
            }
        }
        Terminator::Call { args, .. } => {
            for arg in args.iter_mut() {
                if *arg == from {
                    *arg = to;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arietta_ir::{
        builder::build_program,
        inst::BinOp,
        span::{SourceId, SourceSpan},
        tast::{Expr, ExprKind, Param, Stmt, TypedFunc, TypedProgram},
        verify::verify_func,
        Type,
    };

    fn sp() -> SourceSpan {
        SourceSpan::new(SourceId(0), 0, 0)
    }

    fn factorial() -> TypedFunc {
        // factorial(n, acc): if n == 0 { return acc }
        //                    return factorial(n - 1, acc * n)
        TypedFunc {
            name: "factorial".into(),
            params: vec![
                Param {
                    name: "n".into(),
                    ty: Type::I256,
                },
                Param {
                    name: "acc".into(),
                    ty: Type::I256,
                },
            ],
            ret_ty: Type::I256,
            body: vec![
                Stmt::If {
                    cond: Expr::bin(
                        BinOp::Eq,
                        Type::I1,
                        Expr::var("n", Type::I256, sp()),
                        Expr::word(0, sp()),
                        sp(),
                    ),
                    then_body: vec![Stmt::Return {
                        value: Some(Expr::var("acc", Type::I256, sp())),
                        span: sp(),
                    }],
                    else_body: Vec::new(),
                    span: sp(),
                },
                Stmt::Return {
                    value: Some(Expr::new(
                        ExprKind::Call {
                            callee: "factorial".into(),
                            args: vec![
                                Expr::bin(
                                    BinOp::Sub,
                                    Type::I256,
                                    Expr::var("n", Type::I256, sp()),
                                    Expr::word(1, sp()),
                                    sp(),
                                ),
                                Expr::bin(
                                    BinOp::Mul,
                                    Type::I256,
                                    Expr::var("acc", Type::I256, sp()),
                                    Expr::var("n", Type::I256, sp()),
                                    sp(),
                                ),
                            ],
                        },
                        Type::I256,
                        sp(),
                    )),
                    span: sp(),
                },
            ],
        }
    }

    fn count_calls(func: &Function) -> usize {
        func.blocks
            .keys()
            .filter(|b| matches!(func.block(*b).term, Some(Terminator::Call { .. })))
            .count()
    }

    #[test]
    fn self_tail_call_becomes_a_loop() {
        let prog = TypedProgram {
            storage: Vec::new(),
            main: TypedFunc {
                name: "main".into(),
                params: Vec::new(),
                ret_ty: Type::Unit,
                body: Vec::new(),
            },
            create: None,
            funcs: vec![factorial()],
        };
        let mut module = build_program(&prog);
        let fref = module.func_by_name("factorial").unwrap();

        let func = &module.funcs[fref];
        assert_eq!(count_calls(func), 1);
        let blocks_before = func.blocks.len();

        assert!(run(&mut module.funcs[fref], fref));
        let func = &module.funcs[fref];
        verify_func(func).unwrap();

        assert_eq!(count_calls(func), 0);
        assert_eq!(func.blocks.len(), blocks_before + 1);

        // The new header carries one loop phi per parameter, each with an
        // entry-edge source and one back-edge source.
        let header = func
            .blocks
            .keys()
            .find(|b| !func.block(*b).phis.is_empty())
            .unwrap();
        let phis = &func.block(header).phis;
        assert_eq!(phis.len(), func.arg_values.len());
        for phi in phis {
            assert_eq!(phi.args.len(), 2);
        }

        // A second run finds nothing left to rewrite.
        assert!(!run(&mut module.funcs[fref], fref));
    }
}
