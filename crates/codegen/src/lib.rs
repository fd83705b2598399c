pub mod bitset;
pub mod error;
pub mod layout;
pub mod liveness;
pub mod lower;
pub mod memory_plan;
pub mod object;
pub mod opcode;
pub mod optim;
pub mod sym_stack;
pub mod vcode;

pub use error::CodegenError;
pub use layout::{block_order, StreamLayout};
pub use liveness::Liveness;
pub use memory_plan::MemoryPlan;
pub use object::{compile_module, CompiledModule, StreamArtifact};
pub use opcode::Opcode;
pub use vcode::{EmitInstId, Label, LabelId, VCode};
