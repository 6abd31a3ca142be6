use crate::dense_matrix::DenseMatrix;
use crate::dofs::DofTable;
use crate::error::{DevlaError, Result};
use crate::traits::{BaseMatrix, BaseVector, Residency};
use crate::vector::HostVector;
use std::any::Any;

/// A matrix assembled from one element matrix shared by every element:
/// `A = sum_e R_e^T B C_e`, where `R_e`/`C_e` pick the row/column dofs of
/// element `e` and `B` is the constant local block.
#[derive(Debug, Clone)]
pub struct ConstantElementByElementMatrix {
    height: usize,
    width: usize,
    block: DenseMatrix,
    row_dofs: Vec<Vec<usize>>,
    col_dofs: Vec<Vec<usize>>,
}

impl ConstantElementByElementMatrix {
    pub fn new(
        height: usize,
        width: usize,
        block: DenseMatrix,
        row_dofs: Vec<Vec<usize>>,
        col_dofs: Vec<Vec<usize>>,
    ) -> Result<Self> {
        if row_dofs.len() != col_dofs.len() {
            return Err(DevlaError::dimension_mismatch(
                "element count of column dofs",
                row_dofs.len(),
                col_dofs.len(),
            ));
        }
        for (rows, cols) in row_dofs.iter().zip(&col_dofs) {
            if rows.len() != block.rows() {
                return Err(DevlaError::dimension_mismatch(
                    "element row dofs",
                    block.rows(),
                    rows.len(),
                ));
            }
            if cols.len() != block.cols() {
                return Err(DevlaError::dimension_mismatch(
                    "element column dofs",
                    block.cols(),
                    cols.len(),
                ));
            }
            if let Some(&bad) = rows.iter().find(|&&d| d >= height) {
                return Err(DevlaError::IndexOutOfBounds {
                    index: bad,
                    len: height,
                });
            }
            if let Some(&bad) = cols.iter().find(|&&d| d >= width) {
                return Err(DevlaError::IndexOutOfBounds {
                    index: bad,
                    len: width,
                });
            }
        }
        Ok(Self {
            height,
            width,
            block,
            row_dofs,
            col_dofs,
        })
    }

    /// Takes rows from `rows` and columns from `cols`; the matrix is
    /// `rows.ndof() x cols.ndof()`.
    pub fn from_dof_tables(
        block: DenseMatrix,
        rows: &dyn DofTable,
        cols: &dyn DofTable,
    ) -> Result<Self> {
        let collect = |table: &dyn DofTable| -> Vec<Vec<usize>> {
            (0..table.num_elements())
                .map(|e| table.element_dofs(e).to_vec())
                .collect()
        };
        Self::new(rows.ndof(), cols.ndof(), block, collect(rows), collect(cols))
    }

    pub fn block(&self) -> &DenseMatrix {
        &self.block
    }

    pub fn row_dofs(&self) -> &[Vec<usize>] {
        &self.row_dofs
    }

    pub fn col_dofs(&self) -> &[Vec<usize>] {
        &self.col_dofs
    }

    pub fn num_elements(&self) -> usize {
        self.row_dofs.len()
    }
}

impl BaseMatrix for ConstantElementByElementMatrix {
    fn height(&self) -> usize {
        self.height
    }

    fn width(&self) -> usize {
        self.width
    }

    fn residency(&self) -> Residency {
        Residency::Host
    }

    fn mult(&self, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        self.mult_add(0.0, x, y)
    }

    fn mult_add(&self, s: f64, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        if x.len() != self.width {
            return Err(DevlaError::dimension_mismatch(
                "ebe mult x length",
                self.width,
                x.len(),
            ));
        }
        if y.len() != self.height {
            return Err(DevlaError::dimension_mismatch(
                "ebe mult y length",
                self.height,
                y.len(),
            ));
        }
        let xs = x.host_values()?;
        let mut ys = if s == 0.0 {
            let mut ys = y.host_values_write_only()?;
            ys.fill(0.0);
            ys
        } else {
            let mut ys = y.host_values_mut()?;
            ys.iter_mut().for_each(|v| *v *= s);
            ys
        };

        let mut local_x = vec![0.0; self.block.cols()];
        let mut local_y = vec![0.0; self.block.rows()];
        for (rows, cols) in self.row_dofs.iter().zip(&self.col_dofs) {
            for (slot, &dof) in local_x.iter_mut().zip(cols) {
                *slot = xs[dof];
            }
            self.block.apply(0.0, &local_x, &mut local_y);
            for (&dof, v) in rows.iter().zip(&local_y) {
                ys[dof] += v;
            }
        }
        Ok(())
    }

    fn create_row_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(HostVector::zeros(self.width)))
    }

    fn create_col_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(HostVector::zeros(self.height)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dofs::ElementDofs;

    /// 1D Laplacian on three nodes from two linear elements.
    fn laplace_1d() -> ConstantElementByElementMatrix {
        let block = DenseMatrix::from_rows(&[vec![1.0, -1.0], vec![-1.0, 1.0]]).unwrap();
        let dofs = ElementDofs::uniform(3, 2, &[0, 1, 1, 2]).unwrap();
        ConstantElementByElementMatrix::from_dof_tables(block, &dofs, &dofs).unwrap()
    }

    #[test]
    fn test_assembles_by_scatter_add() {
        let m = laplace_1d();
        assert_eq!((m.height(), m.width(), m.num_elements()), (3, 3, 2));
        let x = HostVector::from_vec(vec![1.0, 2.0, 4.0]);
        let mut y = HostVector::from_vec(vec![9.0, 9.0, 9.0]);
        m.mult(&x, &mut y).unwrap();
        // [[1,-1,0],[-1,2,-1],[0,-1,1]] * [1,2,4]
        assert_eq!(y.as_slice(), &[-1.0, -1.0, 2.0]);

        m.mult_add(1.0, &x, &mut y).unwrap();
        assert_eq!(y.as_slice(), &[-2.0, -2.0, 4.0]);
    }

    #[test]
    fn test_rejects_dofs_that_do_not_match_block() {
        let block = DenseMatrix::zeros(2, 2);
        assert!(matches!(
            ConstantElementByElementMatrix::new(3, 3, block.clone(), vec![vec![0]], vec![vec![0, 1]]),
            Err(DevlaError::DimensionMismatch(_))
        ));
        assert!(matches!(
            ConstantElementByElementMatrix::new(3, 3, block, vec![vec![0, 3]], vec![vec![0, 1]]),
            Err(DevlaError::IndexOutOfBounds { index: 3, len: 3 })
        ));
    }
}
