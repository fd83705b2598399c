use arietta_ir::{verify::VerifierError, SourceSpan};
use thiserror::Error;

/// Failures surfaced by the backend.
///
/// Everything here is an internal-consistency class: the external
/// type-checking contract guarantees user-facing errors never reach this
/// stage, so one arriving means a defect in the builder or a pass.
/// Compilation of the module stops; there is no partial-failure mode.
#[derive(Debug, Clone, Error)]
pub enum CodegenError {
    #[error("function `{func}`: {source}")]
    Verifier {
        func: String,
        span: Option<SourceSpan>,
        #[source]
        source: VerifierError,
    },

    #[error("function `{func}`: spill planning did not converge")]
    SpillPlanning { func: String },
}
