use thiserror::Error;

pub type Result<T> = std::result::Result<T, DevlaError>;

#[derive(Error, Debug)]
pub enum DevlaError {
    #[error("device allocation of {requested} bytes failed: {reason}")]
    Allocation { requested: usize, reason: String },

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid matrix dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A read hit a vector whose host and device copies are both stale.
    /// Always a logic error upstream, never a recoverable condition.
    #[error("Undefined state: {0}")]
    UndefinedState(String),

    #[error("No device representation for matrix type {0}")]
    UnsupportedType(String),

    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Operands live in different accelerator contexts")]
    ContextMismatch,

    #[error("Accelerator handle creation failed: {0}")]
    HandleCreation(String),

    #[error("Accelerator initialization failed: {0}")]
    BackendInit(String),

    #[error("Kernel launch failed: {0}")]
    Kernel(String),

    #[error("Zero diagonal entry at row {0}")]
    ZeroDiagonal(usize),

    #[error("Algorithm did not converge after {iterations} iterations (residual norm {residual_norm})")]
    NonConvergence {
        iterations: usize,
        residual_norm: f64,
    },

    #[error("Solver breakdown at iteration {iteration}: {value_name} ({value}) is near zero.")]
    Breakdown {
        iteration: usize,
        value_name: String, // e.g., "rho", "omega"
        value: f64,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DevlaError {
    /// True for errors that signal a violated coherence invariant rather than
    /// a bad request.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, DevlaError::UndefinedState(_))
    }

    pub(crate) fn not_implemented(what: impl Into<String>) -> Self {
        DevlaError::NotImplemented(what.into())
    }

    pub(crate) fn dimension_mismatch(what: &str, expected: usize, found: usize) -> Self {
        DevlaError::DimensionMismatch(format!("{what}: expected {expected}, found {found}"))
    }
}
