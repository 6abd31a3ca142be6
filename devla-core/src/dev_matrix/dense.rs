use super::{unified_operands, DeviceMatrix};
use crate::backend::Transpose;
use crate::buffer::DeviceBuffer;
use crate::context::AcceleratorContext;
use crate::dense_matrix::DenseMatrix;
use crate::error::{DevlaError, Result};
use crate::traits::{BaseMatrix, BaseVector, Residency};
use crate::vector::UnifiedVector;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Dense matrix in device memory, one contiguous row-major buffer.
///
/// The BLAS kernels are column-major, so the buffer is handed to them as the
/// `width x height` transpose with leading dimension `width`.
#[derive(Debug)]
pub struct DenseDeviceMatrix {
    height: usize,
    width: usize,
    data: DeviceBuffer<f64>,
}

impl DenseDeviceMatrix {
    /// A zero matrix of `height x width`.
    pub fn new(context: &Arc<AcceleratorContext>, height: usize, width: usize) -> Result<Self> {
        let data = DeviceBuffer::new(context, height * width)?;
        let matrix = Self {
            height,
            width,
            data,
        };
        matrix.fill(0.0)?;
        Ok(matrix)
    }

    pub fn from_host(context: &Arc<AcceleratorContext>, matrix: &DenseMatrix) -> Result<Self> {
        log::debug!(
            "Uploading dense matrix {}x{}",
            matrix.rows(),
            matrix.cols()
        );
        Ok(Self {
            height: matrix.rows(),
            width: matrix.cols(),
            data: DeviceBuffer::from_slice(context, matrix.data())?,
        })
    }

    /// A device-side copy with its own buffer.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            height: self.height,
            width: self.width,
            data: self.data.try_clone()?,
        })
    }

    fn len(&self) -> usize {
        self.height * self.width
    }

    fn fill(&self, value: f64) -> Result<()> {
        if self.len() == 0 {
            return Ok(());
        }
        self.context()
            .dense_blas()?
            .fill(self.len(), value, self.data.id())
    }

    fn check_shape(&self, other: &DenseDeviceMatrix) -> Result<()> {
        if (self.height, self.width) != (other.height, other.width) {
            return Err(DevlaError::DimensionMismatch(format!(
                "dense device matrices {}x{} and {}x{}",
                self.height, self.width, other.height, other.width
            )));
        }
        Ok(())
    }

    /// Copies `other` into this matrix on the device.
    pub fn assign(&mut self, other: &DenseDeviceMatrix) -> Result<()> {
        self.check_shape(other)?;
        self.data.copy_from(&other.data)
    }

    /// Sets every entry to `value`.
    pub fn assign_scalar(&mut self, value: f64) -> Result<()> {
        self.fill(value)
    }

    pub fn set_zero(&mut self) -> Result<()> {
        self.fill(0.0)
    }

    pub fn to_host(&self) -> Result<DenseMatrix> {
        DenseMatrix::new(self.height, self.width, self.data.to_vec()?)
    }
}

impl BaseMatrix for DenseDeviceMatrix {
    fn height(&self) -> usize {
        self.height
    }

    fn width(&self) -> usize {
        self.width
    }

    fn residency(&self) -> Residency {
        Residency::Device
    }

    fn mult(&self, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        self.mult_add(0.0, x, y)
    }

    /// `y := s * y + A * x` with a single `gemv`.
    fn mult_add(&self, s: f64, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        let (x, y) = unified_operands(self.context(), self.height, self.width, x, y)?;
        if self.height == 0 {
            return Ok(());
        }
        if self.width == 0 {
            if s == 0.0 {
                return y.set_scalar(0.0);
            }
            return y.scale(s);
        }
        x.update_device()?;
        if s != 0.0 {
            y.update_device()?;
        }
        self.context().dense_blas()?.gemv(
            Transpose::Trans,
            self.width,
            self.height,
            1.0,
            self.data.id(),
            self.width,
            x.device_buffer().id(),
            s,
            y.device_buffer().id(),
        )?;
        y.mark_device_written();
        Ok(())
    }

    fn create_row_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(UnifiedVector::new(self.context(), self.width)?))
    }

    fn create_col_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(UnifiedVector::new(self.context(), self.height)?))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl DeviceMatrix for DenseDeviceMatrix {
    fn context(&self) -> &Arc<AcceleratorContext> {
        self.data.context()
    }

    fn as_base(&self) -> &dyn BaseMatrix {
        self
    }

    fn scale(&mut self, factor: f64) -> Result<()> {
        if self.len() == 0 {
            return Ok(());
        }
        self.context()
            .dense_blas()?
            .scal(self.len(), factor, self.data.id())
    }

    /// `self := self + other`; `other` must be a dense device matrix of the
    /// same shape in the same context.
    fn add(&mut self, other: &dyn DeviceMatrix) -> Result<()> {
        let other = other.as_dense().ok_or_else(|| DevlaError::TypeMismatch {
            expected: "DenseDeviceMatrix",
            found: other.type_name().to_string(),
        })?;
        self.check_shape(other)?;
        if !Arc::ptr_eq(self.context(), other.context()) {
            return Err(DevlaError::ContextMismatch);
        }
        if self.len() == 0 {
            return Ok(());
        }
        self.context()
            .dense_blas()?
            .axpy(self.len(), 1.0, other.data.id(), self.data.id())
    }

    fn as_dense(&self) -> Option<&DenseDeviceMatrix> {
        Some(self)
    }
}

impl fmt::Display for DenseDeviceMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DenseDeviceMatrix {}x{}", self.height, self.width)?;
        match self.to_host() {
            Ok(host) => write!(f, "{host}"),
            Err(e) => writeln!(f, "<device read failed: {e}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse_matrix::SparseMatrix;
    use crate::dev_matrix::SparseDeviceMatrix;
    use crate::vector::Coherence;

    fn upload(ctx: &Arc<AcceleratorContext>, rows: &[Vec<f64>]) -> DenseDeviceMatrix {
        DenseDeviceMatrix::from_host(ctx, &DenseMatrix::from_rows(rows).unwrap()).unwrap()
    }

    #[test]
    fn test_mult_uses_row_major_layout() {
        let ctx = AcceleratorContext::emulated();
        let a = upload(&ctx, &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        let x = UnifiedVector::from_slice(&ctx, &[1.0, 0.0, 1.0]).unwrap();
        let mut y = UnifiedVector::new(&ctx, 2).unwrap();
        a.mult(&x, &mut y).unwrap();
        assert_eq!(y.status(), Coherence::DeviceOwned);
        assert_eq!(y.to_vec().unwrap(), vec![4.0, 10.0]);

        a.mult_add(-1.0, &x, &mut y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_new_is_zero_and_in_place_ops() {
        let ctx = AcceleratorContext::emulated();
        let mut a = DenseDeviceMatrix::new(&ctx, 2, 2).unwrap();
        assert_eq!(a.to_host().unwrap().data(), &[0.0; 4]);

        a.assign_scalar(3.0).unwrap();
        a.scale(2.0).unwrap();
        let b = upload(&ctx, &[vec![1.0, 2.0], vec![3.0, 4.0]]);
        a.add(&b).unwrap();
        assert_eq!(a.to_host().unwrap().data(), &[7.0, 8.0, 9.0, 10.0]);

        a.set_zero().unwrap();
        assert_eq!(a.to_host().unwrap().data(), &[0.0; 4]);
    }

    #[test]
    fn test_add_with_other_shape_changes_nothing() {
        let ctx = AcceleratorContext::emulated();
        let mut a = upload(&ctx, &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        let b = upload(&ctx, &[vec![1.0, 1.0], vec![1.0, 1.0], vec![1.0, 1.0]]);
        assert!(matches!(
            a.add(&b),
            Err(DevlaError::DimensionMismatch(_))
        ));
        assert_eq!(a.to_host().unwrap().data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(b.to_host().unwrap().data(), &[1.0; 6]);
    }

    #[test]
    fn test_add_requires_dense_operand() {
        let ctx = AcceleratorContext::emulated();
        let mut a = DenseDeviceMatrix::new(&ctx, 2, 2).unwrap();
        let s = SparseDeviceMatrix::new(&ctx, &SparseMatrix::new(2, 2)).unwrap();
        assert!(matches!(
            a.add(&s),
            Err(DevlaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_clone_and_assign_stay_on_device() {
        let ctx = AcceleratorContext::emulated();
        let a = upload(&ctx, &[vec![1.0, 2.0]]);
        ctx.reset_transfer_stats();
        let mut b = a.try_clone().unwrap();
        b.scale(10.0).unwrap();
        let mut c = DenseDeviceMatrix::new(&ctx, 1, 2).unwrap();
        c.assign(&b).unwrap();
        assert_eq!(ctx.transfer_stats().uploads, 0);
        assert_eq!(ctx.transfer_stats().device_copies, 2);
        assert_eq!(c.to_host().unwrap().data(), &[10.0, 20.0]);
        assert_eq!(a.to_host().unwrap().data(), &[1.0, 2.0]);
    }

    #[test]
    fn test_mat_mult_is_not_implemented() {
        let ctx = AcceleratorContext::emulated();
        let a = DenseDeviceMatrix::new(&ctx, 2, 2).unwrap();
        let b = DenseDeviceMatrix::new(&ctx, 2, 2).unwrap();
        assert!(matches!(
            a.mat_mult(&b),
            Err(DevlaError::NotImplemented(_))
        ));
    }
}
