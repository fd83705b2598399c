//! Deterministic text rendering of IR functions, for debugging and tests.
use std::fmt::Write;

use crate::{
    function::{BlockId, Function},
    inst::{InstData, InstId, Terminator},
    module::{FuncRef, Module},
    value::{Value, ValueId},
};

/// Render `func_ref` the way the builder tests expect it.
pub fn dump_func(module: &Module, func_ref: FuncRef) -> String {
    let func = &module.funcs[func_ref];
    let mut w = String::new();

    write!(w, "func %{}(", func.sig.name()).unwrap();
    for (idx, value) in func.arg_values.iter().enumerate() {
        if idx > 0 {
            w.push(' ');
        }
        write!(w, "{}.{}", value, func.dfg.value_ty(*value)).unwrap();
    }
    w.push(')');
    if !func.sig.ret_ty().is_unit() {
        write!(w, " -> {}", func.sig.ret_ty()).unwrap();
    }
    w.push_str(" {\n");

    let blocks: Vec<BlockId> = func.blocks.keys().collect();
    for (idx, block) in blocks.iter().enumerate() {
        write_block(&mut w, module, func, *block);
        if idx + 1 < blocks.len() {
            w.push('\n');
        }
    }

    w.push_str("}\n");
    w
}

fn write_block(w: &mut String, module: &Module, func: &Function, block: BlockId) {
    writeln!(w, "    {block}:").unwrap();

    let data = func.block(block);
    for phi in &data.phis {
        write!(w, "        {}.{} = phi", phi.result, phi.ty).unwrap();
        for (pred, value) in &phi.args {
            write!(w, " ({} {})", value_str(func, *value), pred).unwrap();
        }
        w.push_str(";\n");
    }

    for inst in &data.insts {
        write_inst(w, func, *inst);
    }

    if let Some(term) = &data.term {
        write_term(w, module, func, term);
    }
}

fn write_inst(w: &mut String, func: &Function, inst: InstId) {
    w.push_str("        ");
    if let Some(result) = func.dfg.inst_result(inst) {
        write!(w, "{}.{} = ", result, func.dfg.value_ty(result)).unwrap();
    }

    match func.dfg.inst(inst) {
        InstData::Bytes { data } => {
            write!(w, "bytes \"{}\"", String::from_utf8_lossy(data)).unwrap()
        }
        InstData::Bin { code, args } => write!(
            w,
            "{} {} {}",
            code.as_str(),
            value_str(func, args[0]),
            value_str(func, args[1])
        )
        .unwrap(),
        InstData::Un { code, args } => {
            write!(w, "{} {}", code.as_str(), value_str(func, args[0])).unwrap()
        }
        InstData::EnvRead { code } => write!(w, "{}", code.as_str()).unwrap(),
        InstData::Hash { args } => write!(
            w,
            "hash {} {}",
            value_str(func, args[0]),
            value_str(func, args[1])
        )
        .unwrap(),
        InstData::Cast { code, args, ty } => {
            write!(w, "{} {} {}", code.as_str(), value_str(func, args[0]), ty).unwrap()
        }
        InstData::Len { args } => write!(w, "len {}", value_str(func, args[0])).unwrap(),
        InstData::SlotIndex { base, args } => {
            write!(w, "slot_index {} {}", base, value_str(func, args[0])).unwrap()
        }
        InstData::MLoad { args, .. } => write!(w, "mload {}", value_str(func, args[0])).unwrap(),
        InstData::MStore { args } => write!(
            w,
            "mstore {} {}",
            value_str(func, args[0]),
            value_str(func, args[1])
        )
        .unwrap(),
        InstData::SLoad { args } => write!(w, "sload {}", value_str(func, args[0])).unwrap(),
        InstData::SStore { args } => write!(
            w,
            "sstore {} {}",
            value_str(func, args[0]),
            value_str(func, args[1])
        )
        .unwrap(),
        InstData::Alloc { args } => write!(w, "alloc {}", value_str(func, args[0])).unwrap(),
    }
    w.push_str(";\n");
}

fn write_term(w: &mut String, module: &Module, func: &Function, term: &Terminator) {
    w.push_str("        ");
    match term {
        Terminator::Jump { dest } => write!(w, "jump {dest}").unwrap(),
        Terminator::Br {
            cond,
            nz_dest,
            z_dest,
        } => write!(
            w,
            "br {} {} {}",
            value_str(func, *cond),
            nz_dest,
            z_dest
        )
        .unwrap(),
        Terminator::Return { arg } => match arg {
            Some(arg) => write!(w, "return {}", value_str(func, *arg)).unwrap(),
            None => w.push_str("return"),
        },
        Terminator::Call {
            callee,
            args,
            result,
            cont,
        } => {
            if let Some(result) = result {
                write!(w, "{}.{} = ", result, func.dfg.value_ty(*result)).unwrap();
            }
            write!(w, "call %{}", module.funcs[*callee].sig.name()).unwrap();
            for arg in args {
                write!(w, " {}", value_str(func, *arg)).unwrap();
            }
            write!(w, " -> {cont}").unwrap();
        }
    }
    w.push_str(";\n");
}

fn value_str(func: &Function, value: ValueId) -> String {
    match func.dfg.value(value) {
        Value::Immediate { imm, ty } => format!("{imm}.{ty}"),
        _ => format!("{value}"),
    }
}
