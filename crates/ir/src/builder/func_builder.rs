//! One-pass SSA construction for a single function body.
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use smol_str::SmolStr;

use super::{ssa::SsaBuilder, ssa::VarKey, FnDecls};
use crate::{
    function::{BlockId, Function, Signature},
    inst::{InstData, Terminator},
    span::SourceSpan,
    tast::{Expr, ExprKind, Stmt, TypedFunc},
    types::Type,
    value::{Value, ValueId},
};

struct LoopCtx {
    header: BlockId,
    exit: BlockId,
}

pub struct FunctionBuilder<'a> {
    pub func: Function,
    decls: &'a FnDecls,
    cur: BlockId,
    ssa: SsaBuilder,
    loops: Vec<LoopCtx>,
    /// Set when the walk has entered a block no control flow can reach
    /// (e.g. the merge point after two terminated branches).
    dead: bool,
}

impl<'a> FunctionBuilder<'a> {
    /// Convert one typed function body into a well-formed SSA graph.
    pub fn build(tf: &TypedFunc, decls: &'a FnDecls) -> Function {
        let params: Vec<Type> = tf.params.iter().map(|p| p.ty).collect();
        let sig = Signature::new(&tf.name, &params, tf.ret_ty);
        let mut func = Function::new(sig);
        let entry = func.make_block();
        func.entry = entry.into();

        let mut builder = Self {
            func,
            decls,
            cur: entry,
            ssa: SsaBuilder::new(),
            loops: Vec::new(),
            dead: false,
        };

        builder.ssa.push_scope();
        for (idx, param) in tf.params.iter().enumerate() {
            let key = builder.ssa.declare(&param.name, param.ty);
            let value = builder.func.arg_values[idx];
            builder
                .ssa
                .def_var(&mut builder.func, &key, param.ty, entry, value);
        }

        builder.walk_stmts(&tf.body);
        if !builder.dead && !builder.is_terminated() {
            builder
                .func
                .commit_term(builder.cur, Terminator::Return { arg: None }, None);
        }

        builder.func
    }

    fn is_terminated(&self) -> bool {
        self.func.blocks[self.cur].term.is_some()
    }

    fn switch_to(&mut self, block: BlockId) {
        if self.func.blocks[block].is_placeholder(block) {
            self.func.blocks[block].term = None;
        }
        self.dead = self.func.blocks[block].preds.is_empty();
        self.cur = block;
    }

    fn walk_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if self.dead || self.is_terminated() {
                break;
            }
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let {
                name,
                ty,
                init,
                span: _,
            } => {
                let value = self.eval_expr(init);
                let key = self.ssa.declare(name, *ty);
                self.ssa.def_var(&mut self.func, &key, *ty, self.cur, value);
            }

            Stmt::Assign {
                name,
                value,
                span: _,
            } => {
                let value = self.eval_expr(value);
                let (key, ty) = self
                    .ssa
                    .lookup(name)
                    .unwrap_or_else(|| panic!("assignment to undeclared variable `{name}`"));
                self.ssa.def_var(&mut self.func, &key, ty, self.cur, value);
            }

            Stmt::StorageAssign {
                slot,
                index,
                value,
                span,
            } => {
                let slot_val = self.storage_slot(*slot, index.as_ref(), *span);
                let value = self.eval_expr(value);
                self.insert_inst_no_result(
                    InstData::SStore {
                        args: [slot_val, value],
                    },
                    Some(*span),
                );
            }

            Stmt::MemWrite { addr, value, span } => {
                let addr = self.eval_expr(addr);
                let value = self.eval_expr(value);
                self.insert_inst_no_result(InstData::MStore { args: [addr, value] }, Some(*span));
            }

            Stmt::If {
                cond,
                then_body,
                else_body,
                span,
            } => self.build_if(cond, then_body, else_body, *span),

            Stmt::While { cond, body, span } => self.build_while(cond, body, *span),

            Stmt::Break { span } => {
                let exit = self.loops.last().expect("`break` outside of a loop").exit;
                self.func
                    .commit_term(self.cur, Terminator::Jump { dest: exit }, Some(*span));
            }

            Stmt::Continue { span } => {
                let header = self
                    .loops
                    .last()
                    .expect("`continue` outside of a loop")
                    .header;
                self.func
                    .commit_term(self.cur, Terminator::Jump { dest: header }, Some(*span));
            }

            Stmt::Return { value, span } => {
                let arg = value.as_ref().map(|e| self.eval_expr(e));
                self.func
                    .commit_term(self.cur, Terminator::Return { arg }, Some(*span));
            }

            Stmt::Expr { expr } => {
                if let ExprKind::Call { callee, args } = &expr.kind {
                    if expr.ty.is_unit() {
                        self.eval_call(callee, args, expr.span, false);
                        return;
                    }
                }
                self.eval_expr(expr);
            }
        }
    }

    fn build_if(&mut self, cond: &Expr, then_body: &[Stmt], else_body: &[Stmt], span: SourceSpan) {
        let cond_val = self.eval_expr(cond);
        let then_b = self.func.make_block();
        let merge_b = self.func.make_block();
        let else_b = if else_body.is_empty() {
            merge_b
        } else {
            self.func.make_block()
        };

        self.func.commit_term(
            self.cur,
            Terminator::Br {
                cond: cond_val,
                nz_dest: then_b,
                z_dest: else_b,
            },
            Some(span),
        );

        self.switch_to(then_b);
        self.ssa.push_scope();
        self.walk_stmts(then_body);
        self.ssa.pop_scope();
        if !self.dead && !self.is_terminated() {
            self.func
                .commit_term(self.cur, Terminator::Jump { dest: merge_b }, None);
        }

        if !else_body.is_empty() {
            self.switch_to(else_b);
            self.ssa.push_scope();
            self.walk_stmts(else_body);
            self.ssa.pop_scope();
            if !self.dead && !self.is_terminated() {
                self.func
                    .commit_term(self.cur, Terminator::Jump { dest: merge_b }, None);
            }
        }

        self.switch_to(merge_b);
    }

    fn build_while(&mut self, cond: &Expr, body: &[Stmt], span: SourceSpan) {
        let entry_pred = self.cur;
        let header = self.func.make_block();
        let body_b = self.func.make_block();
        let exit = self.func.make_block();

        self.func
            .commit_term(entry_pred, Terminator::Jump { dest: header }, Some(span));
        self.switch_to(header);

        // The back-edge predecessor does not exist yet, so speculatively
        // insert a header phi for every visible variable the loop mentions,
        // with only the entry-edge source populated.
        let mut mentioned = FxHashSet::default();
        collect_expr_mentions(cond, &mut mentioned);
        collect_stmt_mentions(body, &mut mentioned);

        let mut header_phis: Vec<(VarKey, Type, ValueId)> = Vec::new();
        for (key, ty) in self.ssa.visible_vars() {
            if !mentioned.contains(&key.name) {
                continue;
            }
            let entry_val = self.ssa.use_var(&mut self.func, &key, ty, entry_pred);
            let dest = self.ssa.make_phi(&mut self.func, &key, ty, header);
            let phi = self.func.blocks[header]
                .phis
                .iter_mut()
                .find(|phi| phi.result == dest)
                .unwrap();
            phi.append_arg(entry_pred, entry_val);
            header_phis.push((key, ty, dest));
        }

        let cond_val = self.eval_expr(cond);
        self.func.commit_term(
            self.cur,
            Terminator::Br {
                cond: cond_val,
                nz_dest: body_b,
                z_dest: exit,
            },
            Some(span),
        );

        self.loops.push(LoopCtx { header, exit });
        self.switch_to(body_b);
        self.ssa.push_scope();
        self.walk_stmts(body);
        self.ssa.pop_scope();
        if !self.dead && !self.is_terminated() {
            self.func
                .commit_term(self.cur, Terminator::Jump { dest: header }, None);
        }
        self.loops.pop();

        // The body's final blocks are now known; complete every header phi
        // along each back edge.
        let back_preds: SmallVec<[BlockId; 4]> = self
            .func
            .blocks[header]
            .preds
            .iter()
            .copied()
            .filter(|pred| *pred != entry_pred)
            .collect();
        for (key, ty, dest) in &header_phis {
            for pred in &back_preds {
                let value = self.ssa.use_var(&mut self.func, key, *ty, *pred);
                let phi = self.func.blocks[header]
                    .phis
                    .iter_mut()
                    .find(|phi| phi.result == *dest)
                    .unwrap();
                if phi.value_for(*pred).is_none() {
                    phi.append_arg(*pred, value);
                }
            }
        }

        self.switch_to(exit);
    }

    fn eval_expr(&mut self, expr: &Expr) -> ValueId {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Imm(imm) => self.func.dfg.make_imm_value(*imm),

            ExprKind::Str(data) => self.insert_inst(
                InstData::Bytes {
                    data: data.as_bytes().into(),
                },
                Type::Ptr,
                Some(span),
            ),

            ExprKind::Var(name) => {
                let (key, ty) = self
                    .ssa
                    .lookup(name)
                    .unwrap_or_else(|| panic!("read of undeclared variable `{name}`"));
                self.ssa.use_var(&mut self.func, &key, ty, self.cur)
            }

            ExprKind::Bin(code, lhs, rhs) => {
                let lhs = self.eval_expr(lhs);
                let rhs = self.eval_expr(rhs);
                self.insert_inst(
                    InstData::Bin {
                        code: *code,
                        args: [lhs, rhs],
                    },
                    expr.ty,
                    Some(span),
                )
            }

            ExprKind::Un(code, arg) => {
                let arg = self.eval_expr(arg);
                self.insert_inst(
                    InstData::Un {
                        code: *code,
                        args: [arg],
                    },
                    expr.ty,
                    Some(span),
                )
            }

            ExprKind::Env(code) => {
                self.insert_inst(InstData::EnvRead { code: *code }, expr.ty, Some(span))
            }

            ExprKind::Hash { addr, len } => {
                let addr = self.eval_expr(addr);
                let len = self.eval_expr(len);
                self.insert_inst(InstData::Hash { args: [addr, len] }, expr.ty, Some(span))
            }

            ExprKind::Cast(code, arg) => {
                let arg = self.eval_expr(arg);
                self.insert_inst(
                    InstData::Cast {
                        code: *code,
                        args: [arg],
                        ty: expr.ty,
                    },
                    expr.ty,
                    Some(span),
                )
            }

            ExprKind::Len(arg) => {
                let arg = self.eval_expr(arg);
                self.insert_inst(InstData::Len { args: [arg] }, expr.ty, Some(span))
            }

            ExprKind::StorageLoad { slot, index } => {
                let slot_val = self.storage_slot(*slot, index.as_deref(), span);
                self.insert_inst(InstData::SLoad { args: [slot_val] }, expr.ty, Some(span))
            }

            ExprKind::MemRead(addr) => {
                let addr = self.eval_expr(addr);
                self.insert_inst(
                    InstData::MLoad {
                        args: [addr],
                        ty: expr.ty,
                    },
                    expr.ty,
                    Some(span),
                )
            }

            ExprKind::Alloc(size) => {
                let size = self.eval_expr(size);
                self.insert_inst(InstData::Alloc { args: [size] }, expr.ty, Some(span))
            }

            ExprKind::Call { callee, args } => self
                .eval_call(callee, args, span, true)
                .expect("unit call used as a value"),
        }
    }

    /// Commit a call terminator and continue in its continuation block.
    fn eval_call(
        &mut self,
        callee: &SmolStr,
        args: &[Expr],
        span: SourceSpan,
        want_result: bool,
    ) -> Option<ValueId> {
        let (fref, sig) = self
            .decls
            .get(callee)
            .unwrap_or_else(|| panic!("call to unresolved function `{callee}`"));
        let (fref, ret_ty) = (*fref, sig.ret_ty());

        let args: SmallVec<[ValueId; 4]> = args.iter().map(|a| self.eval_expr(a)).collect();
        let cont = self.func.make_block();
        let result = (want_result && !ret_ty.is_unit()).then(|| {
            self.func.dfg.make_value(Value::Call {
                block: self.cur,
                ty: ret_ty,
            })
        });

        self.func.commit_term(
            self.cur,
            Terminator::Call {
                callee: fref,
                args,
                result,
                cont,
            },
            Some(span),
        );
        self.switch_to(cont);
        result
    }

    fn storage_slot(&mut self, slot: u32, index: Option<&Expr>, span: SourceSpan) -> ValueId {
        match index {
            Some(index) => {
                let index = self.eval_expr(index);
                self.insert_inst(
                    InstData::SlotIndex {
                        base: slot,
                        args: [index],
                    },
                    Type::I256,
                    Some(span),
                )
            }
            None => self.func.dfg.make_imm_value(slot as u64),
        }
    }

    fn insert_inst(&mut self, data: InstData, ty: Type, span: Option<SourceSpan>) -> ValueId {
        debug_assert!(data.has_result());
        let inst = self.func.dfg.make_inst(data, span);
        self.func.blocks[self.cur].insts.push(inst);
        let result = self.func.dfg.make_value(Value::Inst { inst, ty });
        self.func.dfg.attach_result(inst, result);
        result
    }

    fn insert_inst_no_result(&mut self, data: InstData, span: Option<SourceSpan>) {
        debug_assert!(!data.has_result());
        let inst = self.func.dfg.make_inst(data, span);
        self.func.blocks[self.cur].insts.push(inst);
    }
}

fn collect_stmt_mentions(stmts: &[Stmt], out: &mut FxHashSet<SmolStr>) {
    for stmt in stmts {
        match stmt {
            Stmt::Let { name, init, .. } => {
                out.insert(name.clone());
                collect_expr_mentions(init, out);
            }
            Stmt::Assign { name, value, .. } => {
                out.insert(name.clone());
                collect_expr_mentions(value, out);
            }
            Stmt::StorageAssign { index, value, .. } => {
                if let Some(index) = index {
                    collect_expr_mentions(index, out);
                }
                collect_expr_mentions(value, out);
            }
            Stmt::MemWrite { addr, value, .. } => {
                collect_expr_mentions(addr, out);
                collect_expr_mentions(value, out);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                collect_expr_mentions(cond, out);
                collect_stmt_mentions(then_body, out);
                collect_stmt_mentions(else_body, out);
            }
            Stmt::While { cond, body, .. } => {
                collect_expr_mentions(cond, out);
                collect_stmt_mentions(body, out);
            }
            Stmt::Break { .. } | Stmt::Continue { .. } => {}
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    collect_expr_mentions(value, out);
                }
            }
            Stmt::Expr { expr } => collect_expr_mentions(expr, out),
        }
    }
}

fn collect_expr_mentions(expr: &Expr, out: &mut FxHashSet<SmolStr>) {
    match &expr.kind {
        ExprKind::Var(name) => {
            out.insert(name.clone());
        }
        ExprKind::Imm(..) | ExprKind::Str(..) | ExprKind::Env(..) => {}
        ExprKind::Bin(_, lhs, rhs) => {
            collect_expr_mentions(lhs, out);
            collect_expr_mentions(rhs, out);
        }
        ExprKind::Un(_, arg)
        | ExprKind::Cast(_, arg)
        | ExprKind::Len(arg)
        | ExprKind::MemRead(arg)
        | ExprKind::Alloc(arg) => collect_expr_mentions(arg, out),
        ExprKind::Hash { addr, len } => {
            collect_expr_mentions(addr, out);
            collect_expr_mentions(len, out);
        }
        ExprKind::StorageLoad { index, .. } => {
            if let Some(index) = index {
                collect_expr_mentions(index, out);
            }
        }
        ExprKind::Call { args, .. } => {
            for arg in args {
                collect_expr_mentions(arg, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::build_program,
        inst::BinOp,
        ir_writer::dump_func,
        span::{SourceId, SourceSpan},
        tast::{Param, Stmt, TypedFunc, TypedProgram},
        verify::verify_module,
    };

    fn sp() -> SourceSpan {
        SourceSpan::new(SourceId(0), 0, 0)
    }

    fn test_func(ret_ty: Type, body: Vec<Stmt>) -> TypedFunc {
        TypedFunc {
            name: "test_func".into(),
            params: Vec::new(),
            ret_ty,
            body,
        }
    }

    fn test_program(main: TypedFunc, funcs: Vec<TypedFunc>) -> TypedProgram {
        TypedProgram {
            storage: Vec::new(),
            main,
            create: None,
            funcs,
        }
    }

    #[test]
    fn merge_phi_on_divergent_assign() {
        let body = vec![
            Stmt::Let {
                name: "x".into(),
                ty: Type::I256,
                init: Expr::word(1, sp()),
                span: sp(),
            },
            Stmt::If {
                cond: Expr::boolean(true, sp()),
                then_body: vec![Stmt::Assign {
                    name: "x".into(),
                    value: Expr::word(2, sp()),
                    span: sp(),
                }],
                else_body: vec![Stmt::Assign {
                    name: "x".into(),
                    value: Expr::word(3, sp()),
                    span: sp(),
                }],
                span: sp(),
            },
            Stmt::Return {
                value: Some(Expr::var("x", Type::I256, sp())),
                span: sp(),
            },
        ];

        let module = build_program(&test_program(test_func(Type::I256, body), Vec::new()));
        verify_module(&module).unwrap();

        assert_eq!(
            dump_func(&module, module.main()),
            "func %test_func() -> i256 {
    block0:
        br 1.i1 block1 block3;

    block1:
        jump block2;

    block2:
        v4.i256 = phi (2.i256 block1) (3.i256 block3);
        return v4;

    block3:
        jump block2;
}
"
        );
    }

    #[test]
    fn merge_without_divergence_resolves_directly() {
        // `x` is only reassigned on one path to the same temporary it
        // already holds, so the read after the merge must not see a phi.
        let body = vec![
            Stmt::Let {
                name: "x".into(),
                ty: Type::I256,
                init: Expr::word(1, sp()),
                span: sp(),
            },
            Stmt::If {
                cond: Expr::boolean(false, sp()),
                then_body: vec![Stmt::Expr {
                    expr: Expr::word(9, sp()),
                }],
                else_body: Vec::new(),
                span: sp(),
            },
            Stmt::Return {
                value: Some(Expr::var("x", Type::I256, sp())),
                span: sp(),
            },
        ];

        let module = build_program(&test_program(test_func(Type::I256, body), Vec::new()));
        verify_module(&module).unwrap();

        let main = &module.funcs[module.main()];
        assert!(main.blocks.values().all(|block| block.phis.is_empty()));
    }

    #[test]
    fn loop_phi_shape() {
        // One reassigned induction variable: exactly one header phi with
        // exactly two sources (entry edge, back edge).
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

        let module = build_program(&test_program(test_func(Type::I256, body), Vec::new()));
        verify_module(&module).unwrap();

        assert_eq!(
            dump_func(&module, module.main()),
            "func %test_func() -> i256 {
    block0:
        jump block1;

    block1:
        v1.i256 = phi (0.i256 block0) (v5 block2);
        v3.i1 = lt v1 10.i256;
        br v3 block2 block3;

    block2:
        v5.i256 = add v1 1.i256;
        jump block1;

    block3:
        return v1;
}
"
        );
    }

    #[test]
    fn loop_keeps_self_referential_phi_for_untouched_var() {
        let body = vec![
            Stmt::Let {
                name: "a".into(),
                ty: Type::I256,
                init: Expr::word(5, sp()),
                span: sp(),
            },
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
                    Expr::word(2, sp()),
                    sp(),
                ),
                body: vec![Stmt::Assign {
                    name: "i".into(),
                    value: Expr::bin(
                        BinOp::Add,
                        Type::I256,
                        Expr::var("i", Type::I256, sp()),
                        Expr::var("a", Type::I256, sp()),
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

        let module = build_program(&test_program(test_func(Type::I256, body), Vec::new()));
        verify_module(&module).unwrap();

        let main = &module.funcs[module.main()];
        let header = main
            .blocks
            .values()
            .find(|block| !block.phis.is_empty())
            .unwrap();
        assert_eq!(header.phis.len(), 2);

        // `a` is read but never reassigned inside the loop: its header phi
        // keeps a self-referential back-edge source, which is legal IR.
        let a_phi = &header.phis[0];
        assert_eq!(a_phi.args.len(), 2);
        assert_eq!(a_phi.args[1].1, a_phi.result);
    }

    #[test]
    fn call_is_a_terminator_with_continuation() {
        let helper = TypedFunc {
            name: "helper".into(),
            params: vec![Param {
                name: "x".into(),
                ty: Type::I256,
            }],
            ret_ty: Type::I256,
            body: vec![Stmt::Return {
                value: Some(Expr::var("x", Type::I256, sp())),
                span: sp(),
            }],
        };

        let body = vec![
            Stmt::Let {
                name: "r".into(),
                ty: Type::I256,
                init: Expr::new(
                    ExprKind::Call {
                        callee: "helper".into(),
                        args: vec![Expr::word(7, sp())],
                    },
                    Type::I256,
                    sp(),
                ),
                span: sp(),
            },
            Stmt::Return {
                value: Some(Expr::var("r", Type::I256, sp())),
                span: sp(),
            },
        ];

        let module = build_program(&test_program(test_func(Type::I256, body), vec![helper]));
        verify_module(&module).unwrap();

        assert_eq!(
            dump_func(&module, module.main()),
            "func %test_func() -> i256 {
    block0:
        v1.i256 = call %helper 7.i256 -> block1;

    block1:
        return v1;
}
"
        );
    }

    #[test]
    #[should_panic]
    fn undeclared_read_is_an_internal_error() {
        let body = vec![Stmt::Return {
            value: Some(Expr::var("nope", Type::I256, sp())),
            span: sp(),
        }];
        build_program(&test_program(test_func(Type::I256, body), Vec::new()));
    }
}
