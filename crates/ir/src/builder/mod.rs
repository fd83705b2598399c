//! SSA construction from the typed program tree.
mod func_builder;
mod ssa;

use indexmap::IndexMap;
use smol_str::SmolStr;

pub use func_builder::FunctionBuilder;

use crate::{
    function::Signature,
    module::{FuncRef, Module},
    tast::{TypedFunc, TypedProgram},
    types::Type,
};

/// Callee signatures visible to every function body, resolved before any
/// body is built so call terminators can reference their targets.
pub struct FnDecls {
    map: IndexMap<SmolStr, (FuncRef, Signature)>,
}

impl FnDecls {
    pub fn get(&self, name: &str) -> Option<&(FuncRef, Signature)> {
        self.map.get(name)
    }
}

fn sig_of(tf: &TypedFunc) -> Signature {
    let params: Vec<Type> = tf.params.iter().map(|p| p.ty).collect();
    Signature::new(&tf.name, &params, tf.ret_ty)
}

/// Build a whole module from the typed program.
///
/// User functions are declared first so that bodies built afterwards can
/// resolve forward references; `main` and `create` are not callable by
/// name.
pub fn build_program(prog: &TypedProgram) -> Module {
    let mut module = Module::new();
    let mut map = IndexMap::default();

    for tf in &prog.funcs {
        let sig = sig_of(tf);
        let fref = module.funcs.push(crate::Function::new(sig.clone()));
        module.declared.insert(tf.name.clone(), fref);
        map.insert(tf.name.clone(), (fref, sig));
    }

    let main_ref = module.funcs.push(crate::Function::new(sig_of(&prog.main)));
    module.main = main_ref.into();

    let create_ref = prog
        .create
        .as_ref()
        .map(|tf| module.funcs.push(crate::Function::new(sig_of(tf))));
    module.create = create_ref.into();

    let decls = FnDecls { map };

    for tf in &prog.funcs {
        let fref = module.declared[&tf.name];
        module.funcs[fref] = FunctionBuilder::build(tf, &decls);
    }
    module.funcs[main_ref] = FunctionBuilder::build(&prog.main, &decls);
    if let (Some(fref), Some(tf)) = (create_ref, prog.create.as_ref()) {
        module.funcs[fref] = FunctionBuilder::build(tf, &decls);
    }

    module
}
