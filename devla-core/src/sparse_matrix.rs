use crate::error::{DevlaError, Result};
use crate::traits::{BaseMatrix, BaseVector, Residency};
use crate::vector::HostVector;
use std::any::Any;

/// Represents a sparse matrix in Compressed Sparse Row (CSR) format on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    /// Number of rows.
    rows: usize,
    /// Number of columns.
    cols: usize,
    /// Non-zero values, row by row.
    values: Vec<f64>,
    /// Column index of each entry of `values`.
    col_indices: Vec<usize>,
    /// `row_ptr[i]..row_ptr[i + 1]` is the range of row `i` in `values`.
    /// Length `rows + 1`; the last entry equals nnz.
    row_ptr: Vec<usize>,
}

impl SparseMatrix {
    /// Creates a new empty SparseMatrix with given dimensions.
    pub fn new(rows: usize, cols: usize) -> Self {
        SparseMatrix {
            rows,
            cols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_ptr: vec![0; rows + 1],
        }
    }

    /// Builds a matrix from `(row, col, value)` entries in any order.
    /// Duplicate positions are summed.
    pub fn from_triplets(rows: usize, cols: usize, triplets: &[Triplet]) -> Result<Self> {
        let mut coords = triplets.to_vec();
        coords.sort_unstable_by_key(|t| (t.row, t.col));
        coords.dedup_by(|later, kept| {
            if later.row == kept.row && later.col == kept.col {
                kept.value += later.value;
                true
            } else {
                false
            }
        });

        let mut row_ptr = vec![0usize; rows + 1];
        for t in &coords {
            if t.row >= rows {
                return Err(DevlaError::InvalidDimensions(
                    "Row index out of bounds".to_string(),
                ));
            }
            if t.col >= cols {
                return Err(DevlaError::InvalidDimensions(
                    "Column index out of bounds".to_string(),
                ));
            }
            row_ptr[t.row + 1] += 1;
        }
        for i in 1..=rows {
            row_ptr[i] += row_ptr[i - 1];
        }

        let values = coords.iter().map(|t| t.value).collect();
        let col_indices = coords.iter().map(|t| t.col).collect();
        Ok(SparseMatrix {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Creates a SparseMatrix from CSR components.
    pub fn from_csr(
        rows: usize,
        cols: usize,
        values: Vec<f64>,
        col_indices: Vec<usize>,
        row_ptr: Vec<usize>,
    ) -> Result<Self> {
        if row_ptr.len() != rows + 1 {
            return Err(DevlaError::InvalidDimensions(
                "row_ptr length must be rows + 1".to_string(),
            ));
        }
        if values.len() != col_indices.len() {
            return Err(DevlaError::InvalidDimensions(
                "values and col_indices must have the same length".to_string(),
            ));
        }
        if row_ptr.last() != Some(&values.len()) {
            return Err(DevlaError::InvalidDimensions(
                "Last element of row_ptr must equal the number of non-zero values".to_string(),
            ));
        }
        if row_ptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(DevlaError::InvalidDimensions(
                "row_ptr must be non-decreasing".to_string(),
            ));
        }
        if col_indices.iter().any(|&c| c >= cols) {
            return Err(DevlaError::InvalidDimensions(
                "Column index out of bounds".to_string(),
            ));
        }

        Ok(SparseMatrix {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Creates a SparseMatrix from dense rows, keeping the non-zero entries.
    pub fn from_dense(dense: &[Vec<f64>]) -> Result<Self> {
        let rows = dense.len();
        let cols = dense.first().map_or(0, |row| row.len());
        let mut values = Vec::new();
        let mut col_indices = Vec::new();
        let mut row_ptr = vec![0; rows + 1];

        for (r, row) in dense.iter().enumerate() {
            if row.len() != cols {
                return Err(DevlaError::InvalidDimensions(format!(
                    "row {r} has {} entries, expected {cols}",
                    row.len()
                )));
            }
            for (c, &val) in row.iter().enumerate() {
                if val != 0.0 {
                    values.push(val);
                    col_indices.push(c);
                }
            }
            row_ptr[r + 1] = values.len();
        }
        SparseMatrix::from_csr(rows, cols, values, col_indices, row_ptr)
    }

    /// Returns the dimensions of the matrix (rows, cols).
    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    /// Returns the number of non-zero elements.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Gets the stored value at a specific row and column, `None` if the
    /// position is not part of the sparsity pattern.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        (self.row_ptr[row]..self.row_ptr[row + 1])
            .find(|&i| self.col_indices[i] == col)
            .map(|i| self.values[i])
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    /// The main diagonal; positions outside the pattern read as zero.
    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.rows.min(self.cols))
            .map(|i| self.get(i, i).unwrap_or(0.0))
            .collect()
    }

    pub fn iter(&self) -> SparseMatrixIter<'_> {
        SparseMatrixIter {
            matrix: self,
            row: 0,
            index: 0,
        }
    }

    fn check_operands(&self, x: &dyn BaseVector, y: &dyn BaseVector) -> Result<()> {
        if x.len() != self.cols {
            return Err(DevlaError::dimension_mismatch(
                "sparse mult x length",
                self.cols,
                x.len(),
            ));
        }
        if y.len() != self.rows {
            return Err(DevlaError::dimension_mismatch(
                "sparse mult y length",
                self.rows,
                y.len(),
            ));
        }
        Ok(())
    }
}

/// One matrix entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triplet {
    row: usize,
    col: usize,
    value: f64,
}

impl Triplet {
    pub fn new(row: usize, col: usize, value: f64) -> Self {
        Triplet { row, col, value }
    }

    pub fn row(&self) -> usize {
        self.row
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Iterates the stored entries in row-major order.
pub struct SparseMatrixIter<'a> {
    matrix: &'a SparseMatrix,
    row: usize,
    index: usize,
}

impl Iterator for SparseMatrixIter<'_> {
    type Item = Triplet;

    fn next(&mut self) -> Option<Self::Item> {
        while self.row < self.matrix.rows && self.index >= self.matrix.row_ptr[self.row + 1] {
            self.row += 1;
        }
        if self.row >= self.matrix.rows {
            return None;
        }
        let index = self.index;
        self.index += 1;
        Some(Triplet {
            row: self.row,
            col: self.matrix.col_indices[index],
            value: self.matrix.values[index],
        })
    }
}

impl BaseMatrix for SparseMatrix {
    fn height(&self) -> usize {
        self.rows
    }

    fn width(&self) -> usize {
        self.cols
    }

    fn residency(&self) -> Residency {
        Residency::Host
    }

    fn mult(&self, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        self.mult_add(0.0, x, y)
    }

    fn mult_add(&self, s: f64, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()> {
        self.check_operands(x, y)?;
        let xs = x.host_values()?;
        let mut ys = if s == 0.0 {
            y.host_values_write_only()?
        } else {
            y.host_values_mut()?
        };
        for row in 0..self.rows {
            let sum: f64 = (self.row_ptr[row]..self.row_ptr[row + 1])
                .map(|i| self.values[i] * xs[self.col_indices[i]])
                .sum();
            ys[row] = if s == 0.0 { sum } else { s * ys[row] + sum };
        }
        Ok(())
    }

    fn create_row_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(HostVector::zeros(self.cols)))
    }

    fn create_col_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(HostVector::zeros(self.rows)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_matrix_new() {
        let matrix = SparseMatrix::new(3, 4);
        assert_eq!(matrix.dims(), (3, 4));
        assert_eq!(matrix.nnz(), 0);
        assert_eq!(matrix.row_ptr, vec![0, 0, 0, 0]);
        assert!(matrix.values.is_empty());
        assert!(matrix.col_indices.is_empty());
    }

    #[test]
    fn test_sparse_matrix_from_csr_valid() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let col_indices = vec![0, 2, 1, 3, 2];
        let row_ptr = vec![0, 2, 4, 5];

        let matrix =
            SparseMatrix::from_csr(3, 4, values.clone(), col_indices.clone(), row_ptr.clone())
                .unwrap();

        assert_eq!(matrix.dims(), (3, 4));
        assert_eq!(matrix.nnz(), 5);
        assert_eq!(matrix.values, values);
        assert_eq!(matrix.col_indices, col_indices);
        assert_eq!(matrix.row_ptr, row_ptr);
    }

    #[test]
    fn test_sparse_matrix_from_csr_invalid_row_ptr_len() {
        let matrix = SparseMatrix::from_csr(3, 4, vec![1.0], vec![0], vec![0, 1]);
        match matrix.err().unwrap() {
            DevlaError::InvalidDimensions(msg) => assert!(msg.contains("row_ptr length")),
            _ => panic!("Expected InvalidDimensions error"),
        }
    }

    #[test]
    fn test_sparse_matrix_from_csr_invalid_last_row_ptr() {
        let matrix = SparseMatrix::from_csr(3, 4, vec![1.0, 2.0], vec![0, 1], vec![0, 1, 1, 1]);
        match matrix.err().unwrap() {
            DevlaError::InvalidDimensions(msg) => {
                assert!(msg.contains("Last element of row_ptr"))
            }
            _ => panic!("Expected InvalidDimensions error"),
        }
    }

    #[test]
    fn test_sparse_matrix_from_csr_invalid_col_index() {
        let matrix = SparseMatrix::from_csr(2, 3, vec![1.0, 2.0], vec![0, 3], vec![0, 1, 2]);
        match matrix.err().unwrap() {
            DevlaError::InvalidDimensions(msg) => {
                assert!(msg.contains("Column index out of bounds"))
            }
            _ => panic!("Expected InvalidDimensions error"),
        }
    }

    #[test]
    fn test_sparse_matrix_from_csr_mismatch_values_indices() {
        let matrix = SparseMatrix::from_csr(2, 3, vec![1.0, 2.0], vec![0], vec![0, 1, 1]);
        match matrix.err().unwrap() {
            DevlaError::InvalidDimensions(msg) => assert!(msg.contains("values and col_indices")),
            _ => panic!("Expected InvalidDimensions error"),
        }
    }

    #[test]
    fn test_sparse_matrix_get() {
        // [ 1.0, 0.0, 2.0, 0.0 ]
        // [ 0.0, 3.0, 0.0, 4.0 ]
        // [ 0.0, 0.0, 5.0, 0.0 ]
        let matrix = SparseMatrix::from_csr(
            3,
            4,
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            vec![0, 2, 1, 3, 2],
            vec![0, 2, 4, 5],
        )
        .unwrap();

        assert_eq!(matrix.get(0, 0), Some(1.0));
        assert_eq!(matrix.get(0, 2), Some(2.0));
        assert_eq!(matrix.get(1, 1), Some(3.0));
        assert_eq!(matrix.get(1, 3), Some(4.0));
        assert_eq!(matrix.get(2, 2), Some(5.0));

        assert_eq!(matrix.get(0, 1), None);
        assert_eq!(matrix.get(2, 3), None);

        assert_eq!(matrix.get(3, 0), None);
        assert_eq!(matrix.get(0, 4), None);
    }

    #[test]
    fn test_from_triplets_sorts_and_sums_duplicates() {
        let matrix = SparseMatrix::from_triplets(
            2,
            2,
            &[
                Triplet::new(1, 1, 4.0),
                Triplet::new(0, 1, 2.0),
                Triplet::new(1, 1, 1.0),
                Triplet::new(0, 0, 1.0),
            ],
        )
        .unwrap();
        assert_eq!(matrix.row_ptr(), &[0, 2, 3]);
        assert_eq!(matrix.col_indices(), &[0, 1, 1]);
        assert_eq!(matrix.values(), &[1.0, 2.0, 5.0]);

        assert!(SparseMatrix::from_triplets(2, 2, &[Triplet::new(2, 0, 1.0)]).is_err());
    }

    #[test]
    fn test_iter_skips_empty_rows() {
        let matrix =
            SparseMatrix::from_dense(&[vec![0.0, 1.0], vec![0.0, 0.0], vec![2.0, 0.0]]).unwrap();
        let entries: Vec<(usize, usize, f64)> =
            matrix.iter().map(|t| (t.row(), t.col(), t.value())).collect();
        assert_eq!(entries, vec![(0, 1, 1.0), (2, 0, 2.0)]);
    }

    #[test]
    fn test_diagonal() {
        let matrix = SparseMatrix::from_dense(&[vec![2.0, 1.0], vec![0.0, 0.0]]).unwrap();
        assert_eq!(matrix.diagonal(), vec![2.0, 0.0]);
    }

    #[test]
    fn test_host_mult_and_mult_add() {
        let matrix = SparseMatrix::from_dense(&[
            vec![2.0, 0.0, 0.0],
            vec![0.0, 3.0, 1.0],
            vec![1.0, 0.0, 4.0],
        ])
        .unwrap();
        let x = HostVector::from_vec(vec![1.0, 1.0, 1.0]);
        let mut y = HostVector::zeros(3);
        matrix.mult(&x, &mut y).unwrap();
        assert_eq!(y.as_slice(), &[2.0, 4.0, 5.0]);

        matrix.mult_add(2.0, &x, &mut y).unwrap();
        assert_eq!(y.as_slice(), &[6.0, 12.0, 15.0]);

        let mut short = HostVector::zeros(2);
        assert!(matches!(
            matrix.mult(&x, &mut short),
            Err(DevlaError::DimensionMismatch(_))
        ));
    }
}
