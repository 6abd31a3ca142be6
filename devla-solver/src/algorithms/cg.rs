use devla_core::{BaseMatrix, BaseVector, DevlaError, Result};
use log::{debug, info, warn};

use super::{
    apply_preconditioner, near_zero, norm, residual, ConjugateGradient, SolveAlgorithm,
    SolveResult,
};

#[derive(Debug, Clone, Copy)]
pub struct ConjugateGradientMetadata {
    pub iterations: usize,
    pub residual_norm: f64,
}

impl SolveAlgorithm for ConjugateGradient {
    type Metadata = ConjugateGradientMetadata;

    fn solve_with(
        &self,
        a: &dyn BaseMatrix,
        pre: Option<&dyn BaseMatrix>,
        b: &dyn BaseVector,
        x: &mut dyn BaseVector,
    ) -> Result<SolveResult<Self::Metadata>> {
        self.validate_inputs(a, pre, b, x)?;

        // Iterate on vectors that live with `a`.
        let mut x_work = a.create_row_vector()?;
        x_work.assign(x)?;
        let mut b_work = a.create_col_vector()?;
        b_work.assign(b)?;

        let metadata = solve_cg(
            a,
            pre,
            b_work.as_ref(),
            x_work.as_mut(),
            self.max_iterations,
            self.tolerance,
        )?;

        x.assign(x_work.as_ref())?;
        Ok(SolveResult {
            x: x.to_vec()?,
            metadata,
        })
    }
}

fn breakdown(iteration: usize, value_name: &str, value: f64) -> DevlaError {
    warn!(
        "CG breakdown: {} ({}) is near zero at iteration {}",
        value_name, value, iteration
    );
    DevlaError::Breakdown {
        iteration,
        value_name: value_name.to_string(),
        value,
    }
}

/// Preconditioned conjugate gradient. `x` holds the initial guess and is
/// overwritten with the solution; `a` must be symmetric positive definite.
pub fn solve_cg(
    a: &dyn BaseMatrix,
    pre: Option<&dyn BaseMatrix>,
    b: &dyn BaseVector,
    x: &mut dyn BaseVector,
    max_iterations: usize,
    tolerance: f64,
) -> Result<ConjugateGradientMetadata> {
    let mut r = a.create_col_vector()?;
    let mut z = a.create_col_vector()?;
    let mut p = a.create_col_vector()?;
    let mut ap = a.create_col_vector()?;

    // r = b - A*x
    residual(a, b, x, r.as_mut())?;
    let initial_residual_norm = norm(r.as_ref())?;
    info!("Initial residual norm: {}", initial_residual_norm);
    if initial_residual_norm < tolerance {
        info!("Initial guess is already within tolerance.");
        return Ok(ConjugateGradientMetadata {
            iterations: 0,
            residual_norm: initial_residual_norm,
        });
    }

    // z = M r, p = z
    apply_preconditioner(pre, r.as_ref(), z.as_mut())?;
    p.assign(z.as_ref())?;
    let mut rz_old = r.inner_product(z.as_ref(), false)?;
    if near_zero(rz_old, initial_residual_norm * norm(z.as_ref())?) {
        return Err(breakdown(0, "r^T z", rz_old));
    }

    let mut residual_norm = initial_residual_norm;
    for iteration in 1..=max_iterations {
        // Ap = A * p
        a.mult(p.as_ref(), ap.as_mut())?;

        // alpha = (r^T z) / (p^T A p)
        let pt_ap = p.inner_product(ap.as_ref(), false)?;
        if near_zero(pt_ap, rz_old) {
            return Err(breakdown(iteration, "p^T A p", pt_ap));
        }
        let alpha = rz_old / pt_ap;

        x.add_scaled(alpha, p.as_ref())?;
        r.add_scaled(-alpha, ap.as_ref())?;

        residual_norm = norm(r.as_ref())?;
        debug!("Iteration {}: residual norm = {}", iteration, residual_norm);
        if residual_norm < tolerance {
            info!("CG converged in {} iterations.", iteration);
            return Ok(ConjugateGradientMetadata {
                iterations: iteration,
                residual_norm,
            });
        }

        apply_preconditioner(pre, r.as_ref(), z.as_mut())?;
        let rz_new = r.inner_product(z.as_ref(), false)?;
        if near_zero(rz_new, residual_norm * norm(z.as_ref())?) {
            return Err(breakdown(iteration, "r^T z", rz_new));
        }
        let beta = rz_new / rz_old;

        // p = z + beta * p
        p.scale(beta)?;
        p.add_scaled(1.0, z.as_ref())?;

        rz_old = rz_new;
    }

    warn!(
        "CG reached maximum iterations ({}) without converging. Residual norm: {}",
        max_iterations, residual_norm
    );
    Err(DevlaError::NonConvergence {
        iterations: max_iterations,
        residual_norm,
    })
}
