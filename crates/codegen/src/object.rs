//! The module pipeline: tail-call rewrite, per-function lowering, and the
//! two output streams.
//!
//! The target platform addresses `create` (constructor) code and `runtime`
//! (post-deployment) code independently, so each stream is laid out as its
//! own flat code space: the entry function first, then every user function
//! reachable from it through call terminators, with one module-wide
//! address fixed point per stream. Spill regions are likewise assigned
//! module-wide within a stream so no frame pointer is needed.
use std::collections::VecDeque;

use arietta_ir::{verify::verify_func, BlockId, FuncRef, Module, Terminator, ValueId};
use rustc_hash::FxHashSet;

use crate::{
    bitset::BitSet,
    error::CodegenError,
    layout::{block_order, StreamLayout},
    liveness::Liveness,
    lower::{lower_func, FuncKind, SCRATCH_BASE},
    memory_plan::{plan_function, MemoryPlan},
    optim::tco,
    vcode::VCode,
};

pub struct CompiledModule {
    pub runtime: StreamArtifact,
    pub create: Option<StreamArtifact>,
}

/// One independently addressed byte stream plus its layout, kept around
/// for inspection and debug-information emission.
pub struct StreamArtifact {
    pub code: Vec<u8>,
    layout: StreamLayout,
}

impl StreamArtifact {
    pub fn funcs(&self) -> impl Iterator<Item = FuncRef> + '_ {
        self.layout.funcs()
    }

    pub fn vcode_of(&self, func: FuncRef) -> &VCode {
        self.layout.vcode_of(func)
    }

    pub fn func_offset(&self, func: FuncRef) -> u32 {
        self.layout.func_offset(func)
    }

    pub fn block_offset(&self, func: FuncRef, block: BlockId) -> u32 {
        self.layout.block_offset(func, block)
    }
}

/// Compile every function and encode both streams.
///
/// A function either lowers completely and correctly or the whole module
/// fails; there is no partial output.
pub fn compile_module(module: &mut Module) -> Result<CompiledModule, CodegenError> {
    let refs: Vec<FuncRef> = module.iter_functions().collect();
    for fref in refs {
        tco::run(&mut module.funcs[fref], fref);
    }

    let runtime = compile_stream(module, module.main())?;
    let create = match module.create() {
        Some(create) => Some(compile_stream(module, create)?),
        None => None,
    };

    Ok(CompiledModule { runtime, create })
}

fn compile_stream(module: &Module, entry: FuncRef) -> Result<StreamArtifact, CodegenError> {
    let funcs = reachable_funcs(module, entry);

    let mut base = SCRATCH_BASE;
    let mut lowered: Vec<(FuncRef, VCode, Vec<BlockId>)> = Vec::new();
    let mut entry_requests = BitSet::new();

    for &fref in &funcs {
        let func = &module.funcs[fref];
        verify_func(func).map_err(|source| CodegenError::Verifier {
            func: func.sig.name().to_string(),
            span: None,
            source,
        })?;

        let mut liveness = Liveness::new();
        liveness.compute(func);
        let order = block_order(func);
        let kind = if fref == entry {
            FuncKind::StreamEntry
        } else {
            FuncKind::Internal
        };

        let mut requests = BitSet::new();
        let (vcode, plan) =
            lower_with_retries(module, fref, &liveness, &order, kind, 0, base, &mut requests)?;
        if fref == entry {
            entry_requests = requests;
        }
        base = plan.end_offset();
        lowered.push((fref, vcode, order));
    }

    // The entry prologue seeds the allocation frontier with the stream's
    // final scratch watermark, which is only known now; re-emit it.
    let watermark = base;
    {
        let func = &module.funcs[entry];
        let mut liveness = Liveness::new();
        liveness.compute(func);
        let order = block_order(func);
        let (vcode, _) = lower_with_retries(
            module,
            entry,
            &liveness,
            &order,
            FuncKind::StreamEntry,
            watermark,
            SCRATCH_BASE,
            &mut entry_requests,
        )?;
        lowered[0] = (entry, vcode, order);
    }

    let mut layout = StreamLayout::new(lowered);
    layout.resolve();
    let code = layout.emit();

    Ok(StreamArtifact { code, layout })
}

/// Plan, emit, and re-plan until the emitter stops requesting spills.
#[allow(clippy::too_many_arguments)]
fn lower_with_retries(
    module: &Module,
    fref: FuncRef,
    liveness: &Liveness,
    order: &[BlockId],
    kind: FuncKind,
    watermark: u32,
    base: u32,
    requests: &mut BitSet<ValueId>,
) -> Result<(VCode, MemoryPlan), CodegenError> {
    let func = &module.funcs[fref];
    loop {
        let plan = plan_function(func, liveness, requests, base);
        match lower_func(func, &plan, order, kind, watermark) {
            Ok(vcode) => return Ok((vcode, plan)),
            Err(new_requests) => {
                if new_requests.is_subset(requests) {
                    return Err(CodegenError::SpillPlanning {
                        func: func.sig.name().to_string(),
                    });
                }
                requests.union_with(&new_requests);
            }
        }
    }
}

/// The entry function followed by every function reachable from it, in
/// discovery order.
fn reachable_funcs(module: &Module, entry: FuncRef) -> Vec<FuncRef> {
    let mut seen = FxHashSet::default();
    let mut queue = VecDeque::new();
    let mut out = Vec::new();
    queue.push_back(entry);

    while let Some(fref) = queue.pop_front() {
        if !seen.insert(fref) {
            continue;
        }
        out.push(fref);

        let func = &module.funcs[fref];
        for block in func.blocks.keys() {
            if let Some(Terminator::Call { callee, .. }) = &func.block(block).term {
                queue.push_back(*callee);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use arietta_ir::{
        builder::build_program,
        inst::BinOp,
        span::{SourceId, SourceSpan},
        tast::{Expr, ExprKind, Param, Stmt, TypedFunc, TypedProgram},
        Type,
    };

    use crate::opcode::Opcode;

    fn sp() -> SourceSpan {
        SourceSpan::new(SourceId(0), 0, 0)
    }

    fn main_func(ret_ty: Type, body: Vec<Stmt>) -> TypedFunc {
        TypedFunc {
            name: "main".into(),
            params: Vec::new(),
            ret_ty,
            body,
        }
    }

    fn compile(main: TypedFunc, funcs: Vec<TypedFunc>) -> (arietta_ir::Module, CompiledModule) {
        let prog = TypedProgram {
            storage: Vec::new(),
            main,
            create: None,
            funcs,
        };
        let mut module = build_program(&prog);
        let compiled = compile_module(&mut module).unwrap();
        (module, compiled)
    }

    /// Decode a stream into (pc, opcode byte, immediate bytes).
    fn decode(code: &[u8]) -> Vec<(u32, u8, Vec<u8>)> {
        let mut out = Vec::new();
        let mut pc = 0usize;
        while pc < code.len() {
            let op = code[pc];
            let width = if (0x5f..=0x7f).contains(&op) {
                (op - 0x5f) as usize
            } else {
                0
            };
            let imm = code[pc + 1..pc + 1 + width].to_vec();
            out.push((pc as u32, op, imm));
            pc += 1 + width;
        }
        out
    }

    fn be_value(bytes: &[u8]) -> u32 {
        bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
    }

    /// Every statically addressed jump must land on a jump-target marker.
    fn assert_jumps_resolve(code: &[u8]) {
        let insts = decode(code);
        for window in insts.windows(2) {
            let (_, push_op, imm) = &window[0];
            let (_, jump_op, _) = &window[1];
            if (*jump_op == 0x56 || *jump_op == 0x57) && (0x5f..=0x7f).contains(push_op) {
                let target = be_value(imm) as usize;
                assert!(target < code.len(), "jump target out of bounds");
                assert_eq!(code[target], 0x5b, "jump target is not a JUMPDEST");
            }
        }
    }

    #[test]
    fn concrete_codegen_const_return() {
        // t1 = const 42; return t1
        let (module, compiled) = compile(
            main_func(
                Type::I256,
                vec![Stmt::Return {
                    value: Some(Expr::word(42, sp())),
                    span: sp(),
                }],
            ),
            Vec::new(),
        );

        let main = module.main();
        let vcode = compiled.runtime.vcode_of(main);

        // No spill traffic: nothing is ever reloaded from memory.
        assert!(vcode.insts.values().all(|op| *op != Opcode::MLoad));

        // Exactly one word (the 42) on the operand stack when the return
        // sequence takes over.
        let entry = module.funcs[main].entry();
        assert_eq!(vcode.net_effect_before_term(entry), 1);

        // The full stream, bootstrap included.
        assert_eq!(
            compiled.runtime.code,
            vec![
                0x60, 0x40, // PUSH1 0x40   allocation watermark
                0x5f, // PUSH0
                0x52, // MSTORE
                0x60, 0x2a, // PUSH1 42
                0x60, 0x20, // PUSH1 0x20
                0x52, // MSTORE
                0x60, 0x20, // PUSH1 32
                0x60, 0x20, // PUSH1 0x20
                0xf3, // RETURN
            ]
        );
    }

    #[test]
    fn unit_main_is_stack_neutral() {
        let (module, compiled) = compile(main_func(Type::Unit, Vec::new()), Vec::new());
        let main = module.main();
        let vcode = compiled.runtime.vcode_of(main);
        let entry = module.funcs[main].entry();
        assert_eq!(vcode.net_effect_before_term(entry), 0);
        assert_eq!(*compiled.runtime.code.last().unwrap(), 0x00); // STOP
    }

    #[test]
    fn forward_branch_addresses_are_patched() {
        // if callvalue() != 0 { storage[0] = 1 }  — the taken edge is a
        // forward jump whose immediate must equal the byte offset of the
        // then-block's first emitted instruction.
        let body = vec![
            Stmt::If {
                cond: Expr::new(
                    ExprKind::Un(
                        arietta_ir::UnOp::IsZero,
                        Expr::new(ExprKind::Env(arietta_ir::EnvOp::CallValue), Type::I256, sp())
                            .into(),
                    ),
                    Type::I1,
                    sp(),
                ),
                then_body: vec![Stmt::StorageAssign {
                    slot: 0,
                    index: None,
                    value: Expr::word(1, sp()),
                    span: sp(),
                }],
                else_body: Vec::new(),
                span: sp(),
            },
            Stmt::Return {
                value: None,
                span: sp(),
            },
        ];
        let (module, compiled) = compile(main_func(Type::Unit, body), Vec::new());

        let main = module.main();
        let func = &module.funcs[main];
        let then_block = match func.block(func.entry()).term.as_ref().unwrap() {
            Terminator::Br { nz_dest, .. } => *nz_dest,
            other => panic!("expected a branch, got {other:?}"),
        };

        let code = &compiled.runtime.code;
        let insts = decode(code);
        let (pc_jumpi, _, _) = insts.iter().find(|(_, op, _)| *op == 0x57).unwrap();
        let (_, _, imm) = insts
            .iter()
            .take_while(|(pc, _, _)| pc < pc_jumpi)
            .last()
            .unwrap();

        let target = be_value(imm);
        assert_eq!(target, compiled.runtime.block_offset(main, then_block));
        assert_eq!(code[target as usize], 0x5b);
        assert_jumps_resolve(code);
    }

    #[test]
    fn loop_compiles_with_spilled_induction_variable() {
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
        let (module, compiled) = compile(main_func(Type::I256, body), Vec::new());

        let main = module.main();
        let vcode = compiled.runtime.vcode_of(main);
        // The induction variable lives in memory across iterations.
        assert!(vcode.insts.values().any(|op| *op == Opcode::MLoad));
        assert_jumps_resolve(&compiled.runtime.code);
    }

    #[test]
    fn utf8_byte_length_not_char_count() {
        // "héllo": five characters, six bytes.
        let body = vec![
            Stmt::Let {
                name: "s".into(),
                ty: Type::Ptr,
                init: Expr::new(ExprKind::Str("héllo".into()), Type::Ptr, sp()),
                span: sp(),
            },
            Stmt::Return {
                value: Some(Expr::new(
                    ExprKind::Len(Expr::var("s", Type::Ptr, sp()).into()),
                    Type::I256,
                    sp(),
                )),
                span: sp(),
            },
        ];
        let (module, compiled) = compile(main_func(Type::I256, body), Vec::new());

        let vcode = compiled.runtime.vcode_of(module.main());
        let imm_pushes: Vec<Vec<u8>> = vcode
            .insts
            .keys()
            .filter_map(|inst| vcode.imm_bytes[inst].clone())
            .map(|bytes| bytes.to_vec())
            .collect();
        assert!(imm_pushes.contains(&vec![6]));

        // The payload itself is written somewhere; the length that gets
        // stored is the byte count, never the code-point count.
        assert!(!imm_pushes.contains(&vec![5]));
    }

    #[test]
    fn factorial_through_the_whole_backend() {
        let factorial = TypedFunc {
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
        };

        let main_body = vec![Stmt::Return {
            value: Some(Expr::new(
                ExprKind::Call {
                    callee: "factorial".into(),
                    args: vec![Expr::word(5, sp()), Expr::word(1, sp())],
                },
                Type::I256,
                sp(),
            )),
            span: sp(),
        }];

        let (module, compiled) = compile(main_func(Type::I256, main_body), vec![factorial]);

        // The self tail call was rewritten into a loop before lowering;
        // only main's outward call remains.
        let fref = module.func_by_name("factorial").unwrap();
        let fact = &module.funcs[fref];
        let calls = fact
            .blocks
            .keys()
            .filter(|b| matches!(fact.block(*b).term, Some(Terminator::Call { .. })))
            .count();
        assert_eq!(calls, 0);

        // Both functions share the runtime stream; the callee's entry
        // begins with a jump-target marker at its resolved offset.
        let entry_offset = compiled.runtime.func_offset(fref);
        assert_eq!(compiled.runtime.code[entry_offset as usize], 0x5b);
        assert_jumps_resolve(&compiled.runtime.code);
    }

    #[test]
    fn create_stream_is_separate() {
        let prog = TypedProgram {
            storage: Vec::new(),
            main: main_func(Type::Unit, Vec::new()),
            create: Some(TypedFunc {
                name: "create".into(),
                params: Vec::new(),
                ret_ty: Type::Unit,
                body: vec![Stmt::StorageAssign {
                    slot: 0,
                    index: None,
                    value: Expr::new(
                        ExprKind::Env(arietta_ir::EnvOp::Caller),
                        Type::I256,
                        sp(),
                    ),
                    span: sp(),
                }],
            }),
            funcs: Vec::new(),
        };
        let mut module = build_program(&prog);
        let compiled = compile_module(&mut module).unwrap();

        let create = compiled.create.expect("constructor stream");
        // Independently addressed: both streams start at offset zero.
        assert!(create.code.contains(&0x55)); // SSTORE
        assert!(!compiled.runtime.code.contains(&0x55));
        assert_eq!(compiled.runtime.func_offset(module.main()), 0);
        assert_eq!(create.func_offset(module.create().unwrap()), 0);
    }
}
