use super::{DenseDeviceMatrix, DeviceMatrix};
use crate::buffer::DeviceBuffer;
use crate::context::AcceleratorContext;
use crate::ebe_matrix::ConstantElementByElementMatrix;
use crate::error::{DevlaError, Result};
use crate::traits::{BaseMatrix, BaseVector, Residency};
use crate::vector::UnifiedVector;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

fn flatten_dofs(what: &str, dofs: &[Vec<usize>]) -> Result<Vec<u32>> {
    dofs.iter()
        .flatten()
        .map(|&d| {
            u32::try_from(d).map_err(|_| {
                DevlaError::InvalidDimensions(format!("{what} dof {d} does not fit a 32-bit index"))
            })
        })
        .collect()
}

/// Device storage for a [`ConstantElementByElementMatrix`]: the shared block
/// plus the flattened element dof tables.
///
/// Products are not available on the device yet; `mult` and `mult_add` fail
/// with [`DevlaError::NotImplemented`].
#[derive(Debug)]
pub struct EbeDeviceMatrix {
    height: usize,
    width: usize,
    num_elements: usize,
    block: DenseDeviceMatrix,
    row_dofs: DeviceBuffer<u32>,
    col_dofs: DeviceBuffer<u32>,
}

impl EbeDeviceMatrix {
    pub fn new(
        context: &Arc<AcceleratorContext>,
        matrix: &ConstantElementByElementMatrix,
    ) -> Result<Self> {
        log::debug!(
            "Uploading element-by-element matrix {}x{} ({} elements, {}x{} block)",
            matrix.height(),
            matrix.width(),
            matrix.num_elements(),
            matrix.block().rows(),
            matrix.block().cols()
        );
        let row_dofs = flatten_dofs("row", matrix.row_dofs())?;
        let col_dofs = flatten_dofs("column", matrix.col_dofs())?;
        Ok(Self {
            height: matrix.height(),
            width: matrix.width(),
            num_elements: matrix.num_elements(),
            block: DenseDeviceMatrix::from_host(context, matrix.block())?,
            row_dofs: DeviceBuffer::from_slice(context, &row_dofs)?,
            col_dofs: DeviceBuffer::from_slice(context, &col_dofs)?,
        })
    }

    pub fn num_elements(&self) -> usize {
        self.num_elements
    }

    pub fn block(&self) -> &DenseDeviceMatrix {
        &self.block
    }

    /// Row dofs of all elements, element after element.
    pub fn row_dofs(&self) -> &DeviceBuffer<u32> {
        &self.row_dofs
    }

    pub fn col_dofs(&self) -> &DeviceBuffer<u32> {
        &self.col_dofs
    }
}

impl BaseMatrix for EbeDeviceMatrix {
    fn height(&self) -> usize {
        self.height
    }

    fn width(&self) -> usize {
        self.width
    }

    fn residency(&self) -> Residency {
        Residency::Device
    }

    fn mult(&self, _x: &dyn BaseVector, _y: &mut dyn BaseVector) -> Result<()> {
        Err(DevlaError::not_implemented(
            "element-by-element device matrix-vector product",
        ))
    }

    fn mult_add(&self, _s: f64, _x: &dyn BaseVector, _y: &mut dyn BaseVector) -> Result<()> {
        Err(DevlaError::not_implemented(
            "element-by-element device matrix-vector product",
        ))
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

impl DeviceMatrix for EbeDeviceMatrix {
    fn context(&self) -> &Arc<AcceleratorContext> {
        self.row_dofs.context()
    }

    fn as_base(&self) -> &dyn BaseMatrix {
        self
    }
}

impl fmt::Display for EbeDeviceMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "EbeDeviceMatrix {}x{}, {} elements",
            self.height, self.width, self.num_elements
        )?;
        write!(f, "{}", self.block)
    }
}
