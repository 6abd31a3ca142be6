use devla_core::{BaseMatrix, BaseVector, DevlaError, HostVector, Result};
use num_traits::Float;
use std::fmt::Debug;

pub mod bicgstab;
pub mod cg;

pub use bicgstab::BiCGSTABMetadata;
pub use cg::ConjugateGradientMetadata;

pub struct SolveResult<M> {
    pub x: Vec<f64>, // Solution vector
    pub metadata: M, // Metadata about the solve process
}

/// A Krylov method solving `A x = b`.
///
/// The iteration runs wherever `a` lives: work vectors come from
/// `a.create_col_vector()`, so a device matrix keeps every update on the
/// accelerator and a host matrix keeps them on the host. `b` and the initial
/// guess `x` may be of any vector kind; `x` receives the solution.
pub trait SolveAlgorithm {
    type Metadata: Debug;

    /// Runs the method, applying `pre` (an approximation of `A^-1`) when
    /// given.
    fn solve_with(
        &self,
        a: &dyn BaseMatrix,
        pre: Option<&dyn BaseMatrix>,
        b: &dyn BaseVector,
        x: &mut dyn BaseVector,
    ) -> Result<SolveResult<Self::Metadata>>;

    fn solve(
        &self,
        a: &dyn BaseMatrix,
        b: &dyn BaseVector,
        x: &mut dyn BaseVector,
    ) -> Result<SolveResult<Self::Metadata>> {
        self.solve_with(a, None, b, x)
    }

    fn solve_preconditioned(
        &self,
        a: &dyn BaseMatrix,
        pre: &dyn BaseMatrix,
        b: &dyn BaseVector,
        x: &mut dyn BaseVector,
    ) -> Result<SolveResult<Self::Metadata>> {
        self.solve_with(a, Some(pre), b, x)
    }

    /// Solves from a zero initial guess with the right-hand side given as a
    /// slice.
    fn solve_slice(&self, a: &dyn BaseMatrix, b: &[f64]) -> Result<SolveResult<Self::Metadata>> {
        let mut rhs = a.create_col_vector()?;
        if rhs.len() != b.len() {
            return Err(DevlaError::InvalidDimensions(format!(
                "Matrix A rows ({}) must match RHS vector b length ({})",
                rhs.len(),
                b.len()
            )));
        }
        rhs.assign(&HostVector::from_vec(b.to_vec()))?;
        let mut x = a.create_row_vector()?;
        x.set_scalar(0.0)?;
        self.solve(a, rhs.as_ref(), x.as_mut())
    }

    fn validate_inputs(
        &self,
        a: &dyn BaseMatrix,
        pre: Option<&dyn BaseMatrix>,
        b: &dyn BaseVector,
        x: &dyn BaseVector,
    ) -> Result<()> {
        let (rows, cols) = (a.height(), a.width());
        if rows != cols {
            return Err(DevlaError::InvalidDimensions(format!(
                "Matrix A must be square (dims: {}x{})",
                rows, cols
            )));
        }
        if rows != b.len() {
            return Err(DevlaError::InvalidDimensions(format!(
                "Matrix A rows ({}) must match RHS vector b length ({})",
                rows,
                b.len()
            )));
        }
        if cols != x.len() {
            return Err(DevlaError::InvalidDimensions(format!(
                "Matrix A columns ({}) must match solution vector x length ({})",
                cols,
                x.len()
            )));
        }
        if let Some(pre) = pre {
            if (pre.height(), pre.width()) != (rows, cols) {
                return Err(DevlaError::InvalidDimensions(format!(
                    "Preconditioner ({}x{}) must match A ({}x{})",
                    pre.height(),
                    pre.width(),
                    rows,
                    cols
                )));
            }
        }
        Ok(())
    }
}

/// `value` is negligible against `scale`, the magnitude it would have if the
/// vectors it was computed from were not (nearly) orthogonal.
pub(crate) fn near_zero<T: Float>(value: T, scale: T) -> bool {
    value.abs() <= T::epsilon() * scale.abs()
}

pub(crate) fn norm(v: &dyn BaseVector) -> Result<f64> {
    Ok(v.inner_product(v, false)?.sqrt())
}

/// `r := b - A x`
pub(crate) fn residual(
    a: &dyn BaseMatrix,
    b: &dyn BaseVector,
    x: &dyn BaseVector,
    r: &mut dyn BaseVector,
) -> Result<()> {
    r.assign(b)?;
    a.mult_add(-1.0, x, r)?;
    r.scale(-1.0)
}

/// `out := pre * v`, or a plain copy without a preconditioner.
pub(crate) fn apply_preconditioner(
    pre: Option<&dyn BaseMatrix>,
    v: &dyn BaseVector,
    out: &mut dyn BaseVector,
) -> Result<()> {
    match pre {
        Some(pre) => pre.mult(v, out),
        None => out.assign(v),
    }
}

// --- Algorithm Struct Definitions ---

/// BiConjugate Gradient Stabilized Algorithm.
#[derive(Debug, Clone)]
pub struct BiCGSTAB {
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for BiCGSTAB {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 1000,
        }
    }
}

impl BiCGSTAB {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
        }
    }
}

/// Conjugate Gradient Algorithm, for symmetric positive definite `A`.
#[derive(Debug, Clone)]
pub struct ConjugateGradient {
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 1000,
        }
    }
}

impl ConjugateGradient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
        }
    }
}
