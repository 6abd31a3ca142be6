use devla_core::{BaseMatrix, BaseVector, DevlaError, Result};
use log::{debug, info, warn};

use super::{apply_preconditioner, near_zero, norm, residual, BiCGSTAB, SolveAlgorithm, SolveResult};

#[derive(Debug, Clone, Copy)]
pub struct BiCGSTABMetadata {
    pub iterations: usize,
    pub residual_norm: f64,
}

impl SolveAlgorithm for BiCGSTAB {
    type Metadata = BiCGSTABMetadata;

    fn solve_with(
        &self,
        a: &dyn BaseMatrix,
        pre: Option<&dyn BaseMatrix>,
        b: &dyn BaseVector,
        x: &mut dyn BaseVector,
    ) -> Result<SolveResult<Self::Metadata>> {
        self.validate_inputs(a, pre, b, x)?;

        let mut x_work = a.create_row_vector()?;
        x_work.assign(x)?;
        let mut b_work = a.create_col_vector()?;
        b_work.assign(b)?;

        let metadata = solve_bicgstab(
            a,
            pre,
            b_work.as_ref(),
            x_work.as_mut(),
            self.tolerance,
            self.max_iterations,
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
        "BiCGSTAB breakdown: {} ({}) is near zero at iteration {}",
        value_name, value, iteration
    );
    DevlaError::Breakdown {
        iteration,
        value_name: value_name.to_string(),
        value,
    }
}

/// Right-preconditioned BiCGSTAB. `x` holds the initial guess and is
/// overwritten with the solution.
pub fn solve_bicgstab(
    a: &dyn BaseMatrix,
    pre: Option<&dyn BaseMatrix>,
    b: &dyn BaseVector,
    x: &mut dyn BaseVector,
    tolerance: f64,
    max_iterations: usize,
) -> Result<BiCGSTABMetadata> {
    let mut r = a.create_col_vector()?;
    let mut r_hat_0 = a.create_col_vector()?;
    let mut p = a.create_col_vector()?;
    let mut phat = a.create_col_vector()?;
    let mut v = a.create_col_vector()?;
    let mut s = a.create_col_vector()?;
    let mut shat = a.create_col_vector()?;
    let mut t = a.create_col_vector()?;

    // r = b - A*x, r_hat_0 = r
    residual(a, b, x, r.as_mut())?;
    r_hat_0.assign(r.as_ref())?;

    let initial_residual_norm = norm(r.as_ref())?;
    let mut residual_norm = initial_residual_norm;
    info!("BiCGSTAB Initial Residual Norm: {}", residual_norm);
    if residual_norm < tolerance {
        info!("BiCGSTAB converged in 0 iterations.");
        return Ok(BiCGSTABMetadata {
            iterations: 0,
            residual_norm,
        });
    }

    let mut rho_prev = 1.0;
    let mut alpha = 1.0;
    let mut omega = 1.0;

    for i in 1..=max_iterations {
        let rho = r_hat_0.inner_product(r.as_ref(), false)?;
        if near_zero(rho, initial_residual_norm * residual_norm) {
            return Err(breakdown(i, "rho", rho));
        }

        if i == 1 {
            p.assign(r.as_ref())?;
        } else {
            let beta = (rho / rho_prev) * (alpha / omega);
            // p = r + beta * (p - omega * v)
            p.add_scaled(-omega, v.as_ref())?;
            p.scale(beta)?;
            p.add_scaled(1.0, r.as_ref())?;
        }

        // v = A * M p
        apply_preconditioner(pre, p.as_ref(), phat.as_mut())?;
        a.mult(phat.as_ref(), v.as_mut())?;

        let r_hat_0_dot_v = r_hat_0.inner_product(v.as_ref(), false)?;
        if near_zero(r_hat_0_dot_v, initial_residual_norm * norm(v.as_ref())?) {
            return Err(breakdown(i, "r_hat_0_dot_v", r_hat_0_dot_v));
        }
        alpha = rho / r_hat_0_dot_v;

        // s = r - alpha * v
        s.assign(r.as_ref())?;
        s.add_scaled(-alpha, v.as_ref())?;

        let s_norm = norm(s.as_ref())?;
        if s_norm < tolerance {
            x.add_scaled(alpha, phat.as_ref())?;
            info!("BiCGSTAB converged early on s norm at iteration {}", i);
            return Ok(BiCGSTABMetadata {
                iterations: i,
                residual_norm: s_norm,
            });
        }

        // t = A * M s
        apply_preconditioner(pre, s.as_ref(), shat.as_mut())?;
        a.mult(shat.as_ref(), t.as_mut())?;

        let t_dot_t = t.inner_product(t.as_ref(), false)?;
        let t_norm = t_dot_t.sqrt();
        if near_zero(t_norm, s_norm) {
            return Err(breakdown(i, "t_dot_t", t_dot_t));
        }
        let t_dot_s = t.inner_product(s.as_ref(), false)?;
        omega = t_dot_s / t_dot_t;

        // x = x + alpha * phat + omega * shat
        x.add_scaled(alpha, phat.as_ref())?;
        x.add_scaled(omega, shat.as_ref())?;

        // r = s - omega * t
        r.assign(s.as_ref())?;
        r.add_scaled(-omega, t.as_ref())?;

        residual_norm = norm(r.as_ref())?;
        debug!("Iteration {}: residual norm = {}", i, residual_norm);
        if residual_norm < tolerance {
            info!("BiCGSTAB converged on r norm at iteration {}", i);
            return Ok(BiCGSTABMetadata {
                iterations: i,
                residual_norm,
            });
        }

        if near_zero(t_dot_s, t_norm * s_norm) {
            return Err(breakdown(i, "omega", omega));
        }
        rho_prev = rho;
    }

    warn!(
        "BiCGSTAB reached maximum iterations ({}) without converging. Residual norm: {}",
        max_iterations, residual_norm
    );
    Err(DevlaError::NonConvergence {
        iterations: max_iterations,
        residual_norm,
    })
}
