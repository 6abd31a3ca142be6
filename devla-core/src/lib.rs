//! # devla-core
//!
//! Device-resident linear algebra: vectors that keep a host and a device copy
//! coherent, device matrices (sparse, dense, element-by-element), and the
//! accelerator context that owns device memory and the BLAS handles.
//!
//! The default build runs every kernel on an emulated device in host memory.
//! The `wgpu` feature adds a real GPU backend.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod dense_matrix;
pub mod dev_matrix;
pub mod dofs;
pub mod ebe_matrix;
pub mod error;
pub mod factory;
pub mod jacobi;
pub mod sparse_matrix;
pub mod traits;
pub mod vector;

pub use buffer::DeviceBuffer;
pub use config::{BackendKind, ContextConfig, PowerPreference};
pub use context::{default_context, AcceleratorContext, TransferStats};
pub use dense_matrix::DenseMatrix;
pub use dev_matrix::{
    DenseDeviceMatrix, DeviceJacobiPreconditioner, DeviceMatrix, EbeDeviceMatrix,
    SparseDeviceMatrix,
};
pub use dofs::{DofTable, ElementDofs};
pub use ebe_matrix::ConstantElementByElementMatrix;
pub use error::{DevlaError, Result};
pub use factory::DeviceMatrixFactory;
pub use jacobi::JacobiPreconditioner;
pub use sparse_matrix::{SparseMatrix, Triplet};
pub use traits::{BaseMatrix, BaseVector, Residency};
pub use vector::{Coherence, HostVector, UnifiedVector};
