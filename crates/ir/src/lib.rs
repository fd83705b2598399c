pub mod builder;
pub mod cfg;
pub mod dfg;
pub mod function;
pub mod inst;
pub mod ir_writer;
pub mod module;
pub mod span;
pub mod tast;
pub mod types;
pub mod value;
pub mod verify;

pub use cfg::post_order;
pub use dfg::DataFlowGraph;
pub use function::{Block, BlockId, Function, Signature, SsaMeta};
pub use inst::{BinOp, CastOp, EnvOp, InstData, InstId, Phi, Terminator, UnOp};
pub use module::{FuncRef, Module};
pub use span::{SourceId, SourceSpan};
pub use types::Type;
pub use value::{Immediate, Value, ValueId, U256};
