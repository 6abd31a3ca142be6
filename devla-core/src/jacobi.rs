use crate::context::AcceleratorContext;
use crate::dev_matrix::{DeviceJacobiPreconditioner, DeviceMatrix};
use crate::error::{DevlaError, Result};
use crate::sparse_matrix::SparseMatrix;
use crate::traits::{BaseMatrix, BaseVector, Residency};
use crate::vector::HostVector;
use std::any::Any;
use std::sync::Arc;

/// Inverse of the main diagonal of a square matrix, optionally restricted to
/// the "inner" (free) dofs; rows outside the mask map to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobiPreconditioner {
    inv_diag: Vec<f64>,
    inner: Option<Vec<bool>>,
}

impl JacobiPreconditioner {
    pub fn from_sparse(matrix: &SparseMatrix, inner: Option<&[bool]>) -> Result<Self> {
        if !matrix.is_square() {
            return Err(DevlaError::InvalidDimensions(format!(
                "Jacobi preconditioner needs a square matrix, got {}x{}",
                matrix.rows(),
                matrix.cols()
            )));
        }
        if let Some(mask) = inner {
            if mask.len() != matrix.rows() {
                return Err(DevlaError::dimension_mismatch(
                    "inner dof mask length",
                    matrix.rows(),
                    mask.len(),
                ));
            }
        }
        let inv_diag = matrix
            .diagonal()
            .into_iter()
            .enumerate()
            .map(|(i, d)| {
                let active = inner.map_or(true, |mask| mask[i]);
                match (active, d == 0.0) {
                    (false, _) => Ok(0.0),
                    (true, true) => Err(DevlaError::ZeroDiagonal(i)),
                    (true, false) => Ok(1.0 / d),
                }
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(Self {
            inv_diag,
            inner: inner.map(<[bool]>::to_vec),
        })
    }

    /// Inverse diagonal, zero outside the inner dofs.
    pub fn inverse_diagonal(&self) -> &[f64] {
        &self.inv_diag
    }

    pub fn inner(&self) -> Option<&[bool]> {
        self.inner.as_deref()
    }
}

impl BaseMatrix for JacobiPreconditioner {
    fn height(&self) -> usize {
        self.inv_diag.len()
    }

    fn width(&self) -> usize {
        self.inv_diag.len()
    }

    fn residency(&self) -> Residency {
        Residency::Host
    }

    fn mult(&self, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        self.mult_add(0.0, x, y)
    }

    fn mult_add(&self, s: f64, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        let n = self.inv_diag.len();
        if x.len() != n {
            return Err(DevlaError::dimension_mismatch("jacobi x length", n, x.len()));
        }
        if y.len() != n {
            return Err(DevlaError::dimension_mismatch("jacobi y length", n, y.len()));
        }
        let xs = x.host_values()?;
        let mut ys = if s == 0.0 {
            y.host_values_write_only()?
        } else {
            y.host_values_mut()?
        };
        for ((out, d), xi) in ys.iter_mut().zip(&self.inv_diag).zip(xs.iter()) {
            let value = d * xi;
            *out = if s == 0.0 { value } else { s * *out + value };
        }
        Ok(())
    }

    fn create_row_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(HostVector::zeros(self.inv_diag.len())))
    }

    fn create_col_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(HostVector::zeros(self.inv_diag.len())))
    }

    fn create_device_matrix(
        &self,
        ctx: &Arc<AcceleratorContext>,
    ) -> Option<Result<Box<dyn DeviceMatrix>>> {
        Some(
            DeviceJacobiPreconditioner::from_inverse_diagonal(ctx, &self.inv_diag, self.inner())
                .map(|m| Box::new(m) as Box<dyn DeviceMatrix>),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> SparseMatrix {
        SparseMatrix::from_dense(&[
            vec![2.0, 1.0, 0.0],
            vec![1.0, 4.0, 0.0],
            vec![0.0, 0.0, 0.0],
        ])
        .unwrap()
    }

    #[test]
    fn test_zero_diagonal_on_inner_dof_is_an_error() {
        assert!(matches!(
            JacobiPreconditioner::from_sparse(&matrix(), None),
            Err(DevlaError::ZeroDiagonal(2))
        ));
    }

    #[test]
    fn test_mask_excludes_rows() {
        let jac = JacobiPreconditioner::from_sparse(&matrix(), Some(&[true, true, false])).unwrap();
        assert_eq!(jac.inverse_diagonal(), &[0.5, 0.25, 0.0]);

        let x = HostVector::from_vec(vec![2.0, 2.0, 2.0]);
        let mut y = HostVector::from_vec(vec![1.0, 1.0, 1.0]);
        jac.mult(&x, &mut y).unwrap();
        assert_eq!(y.as_slice(), &[1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_non_square_is_rejected() {
        let m = SparseMatrix::new(2, 3);
        assert!(matches!(
            JacobiPreconditioner::from_sparse(&m, None),
            Err(DevlaError::InvalidDimensions(_))
        ));
    }
}
