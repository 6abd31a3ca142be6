//! `devla-solver`: Krylov solvers for `A x = b` over the devla vector and
//! matrix contract.
//!
//! The same solver runs on host matrices and on device matrices; in the latter
//! case every vector update stays in accelerator memory and only scalars come
//! back to the host.

pub mod algorithms;

pub use algorithms::{BiCGSTAB, ConjugateGradient, SolveAlgorithm, SolveResult};
pub use devla_core::{
    AcceleratorContext, BaseMatrix, BaseVector, DeviceJacobiPreconditioner, DevlaError,
    HostVector, JacobiPreconditioner, SparseMatrix, Triplet, UnifiedVector,
};
