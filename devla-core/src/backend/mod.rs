//! Accelerator runtime boundary.
//!
//! The rest of the crate never touches device memory directly: it holds opaque
//! [`BufferId`]s and goes through the three traits below, which play the role of
//! the vendor memory API, dense BLAS and sparse BLAS respectively. Kernel bodies
//! live entirely behind these traits.
//!
//! Every call blocks until the accelerator has finished the operation.

pub mod emulated;
#[cfg(feature = "wgpu")]
pub mod gpu;

use crate::error::Result;
use std::fmt::Debug;
use std::sync::Arc;

pub use emulated::EmulatedBackend;
#[cfg(feature = "wgpu")]
pub use gpu::WgpuBackend;

/// Opaque handle to one allocation in the accelerator's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Operation applied to a column-major matrix operand of `gemv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    NoTrans,
    Trans,
}

/// Describes a dense device vector to the sparse runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseVecDescriptor {
    pub buffer: BufferId,
    pub len: usize,
}

/// Describes a zero-based CSR matrix (`u32` indices, `f64` values) to the
/// sparse runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrDescriptor {
    pub rows: usize,
    pub cols: usize,
    pub nnz: usize,
    pub row_offsets: BufferId,
    pub col_indices: BufferId,
    pub values: BufferId,
}

/// Raw device memory management. Sizes and offsets are in bytes.
pub trait DeviceMemory: Send + Sync + Debug {
    /// Allocates `bytes` of device memory. Contents are unspecified.
    fn allocate(&self, bytes: usize) -> Result<BufferId>;

    /// Frees an allocation. Unknown ids are ignored.
    fn release(&self, id: BufferId);

    /// Host to device copy into the start of `dst`.
    fn write(&self, dst: BufferId, data: &[u8]) -> Result<()>;

    /// Device to host copy from the start of `src`.
    fn read(&self, src: BufferId, out: &mut [u8]) -> Result<()>;

    /// Device to device copy of the first `bytes` of `src` into `dst`.
    fn copy(&self, src: BufferId, dst: BufferId, bytes: usize) -> Result<()>;

    /// Number of allocations not yet released.
    fn live_allocations(&self) -> usize;
}

/// Level-1/level-2 dense BLAS over `f64` device buffers.
///
/// `gemv` follows the column-major convention of the vendor libraries:
/// `a` is an `m x n` matrix with leading dimension `lda`, and
/// `y := alpha * op(a) * x + beta * y`. When `beta == 0` the previous
/// contents of `y` are not read.
pub trait DenseBlas: Send + Sync + Debug {
    fn fill(&self, n: usize, value: f64, x: BufferId) -> Result<()>;

    fn scal(&self, n: usize, alpha: f64, x: BufferId) -> Result<()>;

    /// `y := alpha * x + y`
    fn axpy(&self, n: usize, alpha: f64, x: BufferId, y: BufferId) -> Result<()>;

    fn dot(&self, n: usize, x: BufferId, y: BufferId) -> Result<f64>;

    #[allow(clippy::too_many_arguments)]
    fn gemv(
        &self,
        trans: Transpose,
        m: usize,
        n: usize,
        alpha: f64,
        a: BufferId,
        lda: usize,
        x: BufferId,
        beta: f64,
        y: BufferId,
    ) -> Result<()>;
}

/// Sparse BLAS over CSR matrices.
pub trait SparseBlas: Send + Sync + Debug {
    /// `y := alpha * A * x + beta * y`. When `beta == 0` the previous contents
    /// of `y` are not read.
    fn spmv(
        &self,
        alpha: f64,
        a: &CsrDescriptor,
        x: &DenseVecDescriptor,
        beta: f64,
        y: &DenseVecDescriptor,
    ) -> Result<()>;
}

/// An accelerator runtime: device memory plus the factories for its BLAS
/// execution contexts.
pub trait Backend: DeviceMemory {
    fn name(&self) -> &str;

    /// Creates the dense BLAS execution context. Called at most once per
    /// [`AcceleratorContext`](crate::context::AcceleratorContext).
    fn create_dense_blas(&self) -> Result<Arc<dyn DenseBlas>>;

    /// Creates the sparse BLAS execution context. Called at most once per
    /// [`AcceleratorContext`](crate::context::AcceleratorContext).
    fn create_sparse_blas(&self) -> Result<Arc<dyn SparseBlas>>;
}
