use super::{unified_operands, DeviceMatrix};
use crate::backend::CsrDescriptor;
use crate::buffer::DeviceBuffer;
use crate::context::AcceleratorContext;
use crate::error::{DevlaError, Result};
use crate::sparse_matrix::SparseMatrix;
use crate::traits::{BaseMatrix, BaseVector, Residency};
use crate::vector::UnifiedVector;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

fn to_u32(what: &str, values: &[usize]) -> Result<Vec<u32>> {
    values
        .iter()
        .map(|&v| {
            u32::try_from(v).map_err(|_| {
                DevlaError::InvalidDimensions(format!("{what} {v} does not fit a 32-bit index"))
            })
        })
        .collect()
}

/// CSR matrix in device memory: `u32` row offsets and column indices, `f64`
/// values.
#[derive(Debug)]
pub struct SparseDeviceMatrix {
    rows: usize,
    cols: usize,
    nnz: usize,
    row_offsets: DeviceBuffer<u32>,
    col_indices: DeviceBuffer<u32>,
    values: DeviceBuffer<f64>,
}

impl SparseDeviceMatrix {
    /// Uploads `matrix` into `context`.
    pub fn new(context: &Arc<AcceleratorContext>, matrix: &SparseMatrix) -> Result<Self> {
        let row_offsets = to_u32("row offset", matrix.row_ptr())?;
        let col_indices = to_u32("column index", matrix.col_indices())?;
        Self::from_parts(
            context,
            matrix.rows(),
            matrix.cols(),
            &row_offsets,
            &col_indices,
            matrix.values(),
        )
    }

    /// Uploads CSR arrays that are already narrowed and known to be valid.
    pub(crate) fn from_parts(
        context: &Arc<AcceleratorContext>,
        rows: usize,
        cols: usize,
        row_offsets: &[u32],
        col_indices: &[u32],
        values: &[f64],
    ) -> Result<Self> {
        log::debug!(
            "Uploading sparse matrix {}x{} with {} non-zeros",
            rows,
            cols,
            values.len()
        );
        Ok(Self {
            rows,
            cols,
            nnz: values.len(),
            row_offsets: DeviceBuffer::from_slice(context, row_offsets)?,
            col_indices: DeviceBuffer::from_slice(context, col_indices)?,
            values: DeviceBuffer::from_slice(context, values)?,
        })
    }

    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// The matrix as seen by the sparse runtime.
    pub fn csr_descriptor(&self) -> CsrDescriptor {
        CsrDescriptor {
            rows: self.rows,
            cols: self.cols,
            nnz: self.nnz,
            row_offsets: self.row_offsets.id(),
            col_indices: self.col_indices.id(),
            values: self.values.id(),
        }
    }

    /// Downloads the matrix back into host CSR form.
    pub fn to_host(&self) -> Result<SparseMatrix> {
        let widen = |v: Vec<u32>| v.into_iter().map(|i| i as usize).collect::<Vec<_>>();
        SparseMatrix::from_csr(
            self.rows,
            self.cols,
            self.values.to_vec()?,
            widen(self.col_indices.to_vec()?),
            widen(self.row_offsets.to_vec()?),
        )
    }

    /// `y := alpha * A * x + beta * y` on the device, `y` left device-owned.
    pub(crate) fn spmv(
        &self,
        alpha: f64,
        x: &UnifiedVector,
        beta: f64,
        y: &mut UnifiedVector,
    ) -> Result<()> {
        x.update_device()?;
        if beta != 0.0 {
            y.update_device()?;
        }
        self.context().sparse_blas()?.spmv(
            alpha,
            &self.csr_descriptor(),
            &x.descriptor(),
            beta,
            &y.descriptor(),
        )?;
        y.mark_device_written();
        Ok(())
    }
}

impl BaseMatrix for SparseDeviceMatrix {
    fn height(&self) -> usize {
        self.rows
    }

    fn width(&self) -> usize {
        self.cols
    }

    fn residency(&self) -> Residency {
        Residency::Device
    }

    fn mult(&self, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        let (x, y) = unified_operands(self.context(), self.rows, self.cols, x, y)?;
        x.update_device()?;
        y.set_scalar(0.0)?;
        self.spmv(1.0, x, 0.0, y)
    }

    fn mult_add(&self, s: f64, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        let (x, y) = unified_operands(self.context(), self.rows, self.cols, x, y)?;
        self.spmv(1.0, x, s, y)
    }

    fn create_row_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(UnifiedVector::new(self.context(), self.cols)?))
    }

    fn create_col_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(UnifiedVector::new(self.context(), self.rows)?))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl DeviceMatrix for SparseDeviceMatrix {
    fn context(&self) -> &Arc<AcceleratorContext> {
        self.values.context()
    }

    fn as_base(&self) -> &dyn BaseMatrix {
        self
    }

    fn scale(&mut self, factor: f64) -> Result<()> {
        if self.nnz == 0 {
            return Ok(());
        }
        self.context()
            .dense_blas()?
            .scal(self.nnz, factor, self.values.id())
    }
}

impl fmt::Display for SparseDeviceMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "SparseDeviceMatrix {}x{}, {} non-zeros",
            self.rows, self.cols, self.nnz
        )?;
        match self.to_host() {
            Ok(host) => {
                for entry in host.iter() {
                    writeln!(f, "({}, {}) {}", entry.row(), entry.col(), entry.value())?;
                }
                Ok(())
            }
            Err(e) => writeln!(f, "<device read failed: {e}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{Coherence, HostVector};

    fn sample() -> SparseMatrix {
        SparseMatrix::from_dense(&[
            vec![2.0, 0.0, 0.0],
            vec![0.0, 3.0, 1.0],
            vec![1.0, 0.0, 4.0],
        ])
        .unwrap()
    }

    #[test]
    fn test_mult_leaves_result_on_device() {
        let ctx = AcceleratorContext::emulated();
        let a = SparseDeviceMatrix::new(&ctx, &sample()).unwrap();
        let x = UnifiedVector::from_slice(&ctx, &[1.0, 1.0, 1.0]).unwrap();
        let mut y = UnifiedVector::new(&ctx, 3).unwrap();
        a.mult(&x, &mut y).unwrap();
        assert_eq!(y.status(), Coherence::DeviceOwned);
        assert_eq!(y.to_vec().unwrap(), vec![2.0, 4.0, 5.0]);
    }

    #[test]
    fn test_mult_add_scales_existing_result() {
        let ctx = AcceleratorContext::emulated();
        let a = SparseDeviceMatrix::new(&ctx, &sample()).unwrap();
        let x = UnifiedVector::from_slice(&ctx, &[1.0, 1.0, 1.0]).unwrap();
        let mut y = UnifiedVector::from_slice(&ctx, &[1.0, 2.0, 3.0]).unwrap();
        a.mult_add(2.0, &x, &mut y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![4.0, 8.0, 11.0]);
    }

    #[test]
    fn test_host_operands_are_rejected_untouched() {
        let ctx = AcceleratorContext::emulated();
        let a = SparseDeviceMatrix::new(&ctx, &sample()).unwrap();
        let x = HostVector::from_vec(vec![1.0; 3]);
        let mut y = UnifiedVector::from_slice(&ctx, &[7.0; 3]).unwrap();
        assert!(matches!(
            a.mult(&x, &mut y),
            Err(DevlaError::TypeMismatch { .. })
        ));
        assert_eq!(y.status(), Coherence::HostOwned);
        assert_eq!(y.to_vec().unwrap(), vec![7.0; 3]);
    }

    #[test]
    fn test_scale_and_download() {
        let ctx = AcceleratorContext::emulated();
        let mut a = SparseDeviceMatrix::new(&ctx, &sample()).unwrap();
        a.scale(0.5).unwrap();
        let host = a.to_host().unwrap();
        assert_eq!(host.get(1, 1), Some(1.5));
        assert_eq!(host.get(2, 0), Some(0.5));
        assert_eq!(host.nnz(), 5);
        assert!(a.to_string().contains("5 non-zeros"));
    }

    #[test]
    fn test_add_is_not_implemented() {
        let ctx = AcceleratorContext::emulated();
        let mut a = SparseDeviceMatrix::new(&ctx, &sample()).unwrap();
        let b = SparseDeviceMatrix::new(&ctx, &sample()).unwrap();
        assert!(matches!(
            a.add(&b),
            Err(DevlaError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_vectors_come_from_the_matrix_context() {
        let ctx = AcceleratorContext::emulated();
        let a = SparseDeviceMatrix::new(&ctx, &SparseMatrix::new(2, 4)).unwrap();
        let row = a.create_row_vector().unwrap();
        let col = a.create_col_vector().unwrap();
        assert_eq!((row.len(), col.len()), (4, 2));
        assert!(Arc::ptr_eq(row.as_unified().unwrap().context(), &ctx));
    }
}
