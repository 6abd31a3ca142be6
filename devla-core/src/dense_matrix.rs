use crate::error::{DevlaError, Result};
use crate::traits::{BaseMatrix, BaseVector, Residency};
use crate::vector::HostVector;
use std::any::Any;
use std::fmt;

/// Represents a dense matrix stored in row-major order on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>, // data[row * cols + col]
}

impl DenseMatrix {
    /// Creates a new DenseMatrix from row-major data.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(DevlaError::InvalidDimensions(format!(
                "Data length ({}) does not match dimensions ({}x{})",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Creates a new DenseMatrix filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map_or(0, |r| r.len());
        if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != cols) {
            return Err(DevlaError::InvalidDimensions(format!(
                "row {i} has {} entries, expected {cols}",
                r.len()
            )));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data: rows.concat(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Returns None if indices are out of bounds.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            self.data.get(row * self.cols + col).copied()
        } else {
            None
        }
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        if row >= self.rows {
            return Err(DevlaError::IndexOutOfBounds {
                index: row,
                len: self.rows,
            });
        }
        if col >= self.cols {
            return Err(DevlaError::IndexOutOfBounds {
                index: col,
                len: self.cols,
            });
        }
        self.data[row * self.cols + col] = value;
        Ok(())
    }

    /// `y := s * y + self * x` on plain slices.
    pub(crate) fn apply(&self, s: f64, x: &[f64], y: &mut [f64]) {
        for (row, out) in y.iter_mut().enumerate() {
            let sum: f64 = self.data[row * self.cols..(row + 1) * self.cols]
                .iter()
                .zip(x)
                .map(|(a, b)| a * b)
                .sum();
            *out = if s == 0.0 { sum } else { s * *out + sum };
        }
    }
}

impl BaseMatrix for DenseMatrix {
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
        if x.len() != self.cols {
            return Err(DevlaError::dimension_mismatch(
                "dense mult x length",
                self.cols,
                x.len(),
            ));
        }
        if y.len() != self.rows {
            return Err(DevlaError::dimension_mismatch(
                "dense mult y length",
                self.rows,
                y.len(),
            ));
        }
        let xs = x.host_values()?;
        let mut ys = if s == 0.0 {
            y.host_values_write_only()?
        } else {
            y.host_values_mut()?
        };
        self.apply(s, &xs, &mut ys);
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

impl fmt::Display for DenseMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..self.rows {
            let cells: Vec<String> = self.data[row * self.cols..(row + 1) * self.cols]
                .iter()
                .map(|v| format!("{v:>10.4}"))
                .collect();
            writeln!(f, "{}", cells.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_data_length() {
        assert!(matches!(
            DenseMatrix::new(2, 2, vec![1.0; 3]),
            Err(DevlaError::InvalidDimensions(_))
        ));
    }

    #[test]
    fn test_from_rows_and_access() {
        let mut m = DenseMatrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!((m.rows(), m.cols()), (2, 3));
        assert_eq!(m.get(1, 2), Some(6.0));
        assert_eq!(m.get(2, 0), None);
        m.set(0, 1, -2.0).unwrap();
        assert_eq!(m.data()[1], -2.0);
        assert!(m.set(0, 3, 0.0).is_err());
        assert!(DenseMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_host_mult() {
        let m = DenseMatrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        let x = HostVector::from_vec(vec![1.0, 0.0, 1.0]);
        let mut y = HostVector::from_vec(vec![1.0, 1.0]);
        m.mult(&x, &mut y).unwrap();
        assert_eq!(y.as_slice(), &[4.0, 10.0]);
        m.mult_add(0.5, &x, &mut y).unwrap();
        assert_eq!(y.as_slice(), &[6.0, 15.0]);
    }
}
