//! Value and instruction arenas for one function.
use cranelift_entity::{packed_option::PackedOption, PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;

use crate::{
    inst::{InstData, InstId},
    span::SourceSpan,
    types::Type,
    value::{Immediate, Value, ValueId},
};

pub struct DataFlowGraph {
    pub values: PrimaryMap<ValueId, Value>,
    pub insts: PrimaryMap<InstId, InstData>,
    inst_results: SecondaryMap<InstId, PackedOption<ValueId>>,
    inst_spans: SecondaryMap<InstId, Option<SourceSpan>>,
    pub immediates: FxHashMap<Immediate, ValueId>,
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self {
            values: PrimaryMap::default(),
            insts: PrimaryMap::default(),
            inst_results: SecondaryMap::default(),
            inst_spans: SecondaryMap::default(),
            immediates: FxHashMap::default(),
        }
    }

    pub fn make_value(&mut self, value: Value) -> ValueId {
        self.values.push(value)
    }

    pub fn make_inst(&mut self, data: InstData, span: Option<SourceSpan>) -> InstId {
        let inst = self.insts.push(data);
        self.inst_spans[inst] = span;
        inst
    }

    pub fn make_imm_value<Imm>(&mut self, imm: Imm) -> ValueId
    where
        Imm: Into<Immediate>,
    {
        let imm: Immediate = imm.into();
        if let Some(&value) = self.immediates.get(&imm) {
            return value;
        }

        let ty = imm.ty();
        let value = self.make_value(Value::Immediate { imm, ty });
        self.immediates.insert(imm, value);
        value
    }

    pub fn attach_result(&mut self, inst: InstId, value: ValueId) {
        debug_assert!(self.inst_results[inst].is_none());
        self.inst_results[inst] = value.into();
    }

    pub fn inst(&self, inst: InstId) -> &InstData {
        &self.insts[inst]
    }

    pub fn inst_mut(&mut self, inst: InstId) -> &mut InstData {
        &mut self.insts[inst]
    }

    pub fn inst_result(&self, inst: InstId) -> Option<ValueId> {
        self.inst_results[inst].expand()
    }

    pub fn inst_span(&self, inst: InstId) -> Option<SourceSpan> {
        self.inst_spans[inst]
    }

    pub fn value(&self, value: ValueId) -> &Value {
        &self.values[value]
    }

    pub fn value_ty(&self, value: ValueId) -> Type {
        self.values[value].ty()
    }

    pub fn value_imm(&self, value: ValueId) -> Option<Immediate> {
        match self.values[value] {
            Value::Immediate { imm, .. } => Some(imm),
            _ => None,
        }
    }
}

impl Default for DataFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}
