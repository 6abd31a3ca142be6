//! Device-resident matrices.
//!
//! Every variant applies itself only to [`UnifiedVector`] operands living in
//! the matrix's own context, and checks all operands before touching any of
//! them.

mod dense;
mod ebe;
mod jacobi;
mod sparse;

pub use dense::DenseDeviceMatrix;
pub use ebe::EbeDeviceMatrix;
pub use jacobi::DeviceJacobiPreconditioner;
pub use sparse::SparseDeviceMatrix;

use crate::context::AcceleratorContext;
use crate::error::{DevlaError, Result};
use crate::traits::{BaseMatrix, BaseVector};
use crate::vector::UnifiedVector;
use std::fmt::Display;
use std::sync::Arc;

/// A matrix whose data lives in accelerator memory.
pub trait DeviceMatrix: BaseMatrix + Display {
    fn context(&self) -> &Arc<AcceleratorContext>;

    /// This matrix as a plain operator, for APIs taking `&dyn BaseMatrix`.
    fn as_base(&self) -> &dyn BaseMatrix;

    /// `self := factor * self`
    fn scale(&mut self, _factor: f64) -> Result<()> {
        Err(DevlaError::not_implemented(format!(
            "{}::scale",
            self.type_name()
        )))
    }

    /// `self := self + other`
    fn add(&mut self, _other: &dyn DeviceMatrix) -> Result<()> {
        Err(DevlaError::not_implemented(format!(
            "{}::add",
            self.type_name()
        )))
    }

    /// The product `self * other` as a new device matrix.
    fn mat_mult(&self, _other: &dyn DeviceMatrix) -> Result<Box<dyn DeviceMatrix>> {
        Err(DevlaError::not_implemented(format!(
            "{}::mat_mult",
            self.type_name()
        )))
    }

    fn as_dense(&self) -> Option<&DenseDeviceMatrix> {
        None
    }
}

fn require_unified<'a>(role: &str, v: &'a dyn BaseVector) -> Result<&'a UnifiedVector> {
    v.as_unified().ok_or_else(|| DevlaError::TypeMismatch {
        expected: "UnifiedVector",
        found: format!("{} vector as {role}", v.residency()),
    })
}

/// Validates `x` and `y` for `y = A x` with `A` of `height x width` in `ctx`
/// and hands them back as unified vectors.
pub(crate) fn unified_operands<'a>(
    ctx: &Arc<AcceleratorContext>,
    height: usize,
    width: usize,
    x: &'a dyn BaseVector,
    y: &'a mut dyn BaseVector,
) -> Result<(&'a UnifiedVector, &'a mut UnifiedVector)> {
    let x = require_unified("x", x)?;
    require_unified("y", &*y)?;
    if x.len() != width {
        return Err(DevlaError::dimension_mismatch("x length", width, x.len()));
    }
    if y.len() != height {
        return Err(DevlaError::dimension_mismatch("y length", height, y.len()));
    }
    let y = y.as_unified_mut().ok_or_else(|| DevlaError::TypeMismatch {
        expected: "UnifiedVector",
        found: "non-unified vector as y".to_string(),
    })?;
    if !Arc::ptr_eq(ctx, x.context()) || !Arc::ptr_eq(ctx, y.context()) {
        return Err(DevlaError::ContextMismatch);
    }
    Ok((x, y))
}
