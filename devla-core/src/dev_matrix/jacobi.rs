use super::{DeviceMatrix, SparseDeviceMatrix};
use crate::context::AcceleratorContext;
use crate::error::{DevlaError, Result};
use crate::jacobi::JacobiPreconditioner;
use crate::sparse_matrix::SparseMatrix;
use crate::traits::{BaseMatrix, BaseVector, Residency};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Jacobi preconditioner on the device, stored as a diagonal CSR matrix with
/// entries only on the inner dofs.
#[derive(Debug)]
pub struct DeviceJacobiPreconditioner {
    diag: SparseDeviceMatrix,
    inner_dofs: usize,
}

impl DeviceJacobiPreconditioner {
    pub fn from_sparse(
        context: &Arc<AcceleratorContext>,
        matrix: &SparseMatrix,
        inner: Option<&[bool]>,
    ) -> Result<Self> {
        let host = JacobiPreconditioner::from_sparse(matrix, inner)?;
        Self::from_inverse_diagonal(context, host.inverse_diagonal(), host.inner())
    }

    pub fn from_inverse_diagonal(
        context: &Arc<AcceleratorContext>,
        inv_diag: &[f64],
        inner: Option<&[bool]>,
    ) -> Result<Self> {
        let n = inv_diag.len();
        if let Some(mask) = inner {
            if mask.len() != n {
                return Err(DevlaError::dimension_mismatch(
                    "inner dof mask length",
                    n,
                    mask.len(),
                ));
            }
        }
        if u32::try_from(n).is_err() {
            return Err(DevlaError::InvalidDimensions(format!(
                "{n} rows do not fit 32-bit indices"
            )));
        }

        let mut row_offsets = Vec::with_capacity(n + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0u32);
        for (i, &d) in inv_diag.iter().enumerate() {
            if inner.map_or(true, |mask| mask[i]) {
                col_indices.push(i as u32);
                values.push(d);
            }
            row_offsets.push(col_indices.len() as u32);
        }
        log::debug!("Jacobi preconditioner on {} of {} dofs", values.len(), n);
        Ok(Self {
            inner_dofs: values.len(),
            diag: SparseDeviceMatrix::from_parts(
                context,
                n,
                n,
                &row_offsets,
                &col_indices,
                &values,
            )?,
        })
    }

    /// Number of rows the preconditioner acts on.
    pub fn inner_dofs(&self) -> usize {
        self.inner_dofs
    }
}

impl BaseMatrix for DeviceJacobiPreconditioner {
    fn height(&self) -> usize {
        self.diag.height()
    }

    fn width(&self) -> usize {
        self.diag.width()
    }

    fn residency(&self) -> Residency {
        Residency::Device
    }

    fn mult(&self, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        self.diag.mult(x, y)
    }

    fn mult_add(&self, s: f64, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        self.diag.mult_add(s, x, y)
    }

    fn create_row_vector(&self) -> Result<Box<dyn BaseVector>> {
        self.diag.create_row_vector()
    }

    fn create_col_vector(&self) -> Result<Box<dyn BaseVector>> {
        self.diag.create_col_vector()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl DeviceMatrix for DeviceJacobiPreconditioner {
    fn context(&self) -> &Arc<AcceleratorContext> {
        self.diag.context()
    }

    fn as_base(&self) -> &dyn BaseMatrix {
        self
    }
}

impl fmt::Display for DeviceJacobiPreconditioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "DeviceJacobiPreconditioner on {} of {} dofs",
            self.inner_dofs,
            self.diag.height()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::UnifiedVector;

    #[test]
    fn test_applies_inverse_diagonal_on_inner_dofs() {
        let ctx = AcceleratorContext::emulated();
        let a = SparseMatrix::from_dense(&[
            vec![2.0, 1.0, 0.0],
            vec![1.0, 4.0, 0.0],
            vec![0.0, 0.0, 8.0],
        ])
        .unwrap();
        let pre =
            DeviceJacobiPreconditioner::from_sparse(&ctx, &a, Some(&[true, false, true])).unwrap();
        assert_eq!(pre.inner_dofs(), 2);

        let x = UnifiedVector::from_slice(&ctx, &[4.0, 4.0, 4.0]).unwrap();
        let mut y = UnifiedVector::from_slice(&ctx, &[9.0, 9.0, 9.0]).unwrap();
        pre.mult(&x, &mut y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![2.0, 0.0, 0.5]);
    }

    #[test]
    fn test_host_jacobi_converts_through_context() {
        let ctx = AcceleratorContext::emulated();
        let a = SparseMatrix::from_dense(&[vec![4.0, 0.0], vec![0.0, 5.0]]).unwrap();
        let host = JacobiPreconditioner::from_sparse(&a, None).unwrap();
        let dev = ctx.create_device_matrix(&host).unwrap();
        assert_eq!(dev.residency(), Residency::Device);
        assert!(dev.to_string().contains("2 of 2 dofs"));
    }

    #[test]
    fn test_mask_length_is_checked() {
        let ctx = AcceleratorContext::emulated();
        assert!(matches!(
            DeviceJacobiPreconditioner::from_inverse_diagonal(&ctx, &[1.0, 1.0], Some(&[true])),
            Err(DevlaError::DimensionMismatch(_))
        ));
    }
}
