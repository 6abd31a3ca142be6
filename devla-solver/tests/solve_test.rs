use devla_core::{DenseMatrix, Residency};
use devla_solver::{
    algorithms::{BiCGSTAB, ConjugateGradient, SolveAlgorithm},
    AcceleratorContext, BaseMatrix, DevlaError, HostVector, JacobiPreconditioner,
    SparseMatrix, Triplet, UnifiedVector,
};

// Helper for float comparison in tests
fn assert_approx_eq_vec(a: &[f64], b: &[f64], tolerance: f64) {
    assert_eq!(a.len(), b.len(), "Vector lengths differ");
    for i in 0..a.len() {
        let diff = (a[i] - b[i]).abs();
        assert!(
            diff <= tolerance,
            "Verification failed at index {}: expected {}, got {}, diff {}",
            i,
            b[i],
            a[i],
            diff
        );
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spd_3x3() -> SparseMatrix {
    SparseMatrix::from_dense(&[
        vec![4.0, -1.0, 0.0],
        vec![-1.0, 4.0, -1.0],
        vec![0.0, -1.0, 4.0],
    ])
    .unwrap()
}

fn nonsymmetric_3x3() -> SparseMatrix {
    SparseMatrix::from_dense(&[
        vec![4.0, 1.0, 0.0],
        vec![-1.0, 4.0, 1.0],
        vec![0.0, -1.0, 4.0],
    ])
    .unwrap()
}

/// Tridiagonal SPD matrix with a strongly varying diagonal.
fn graded(n: usize) -> SparseMatrix {
    let mut triplets = Vec::new();
    for i in 0..n {
        triplets.push(Triplet::new(i, i, 1.0 + i as f64));
        if i + 1 < n {
            triplets.push(Triplet::new(i, i + 1, -0.3));
            triplets.push(Triplet::new(i + 1, i, -0.3));
        }
    }
    SparseMatrix::from_triplets(n, n, &triplets).unwrap()
}

fn residual_norm(a: &SparseMatrix, x: &[f64], b: &[f64]) -> f64 {
    let mut ax = HostVector::zeros(b.len());
    a.mult(&HostVector::from_vec(x.to_vec()), &mut ax).unwrap();
    ax.as_slice()
        .iter()
        .zip(b)
        .map(|(l, r)| (l - r).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[test]
fn test_host_solve_conjugate_gradient() -> Result<(), DevlaError> {
    init_logger();
    let a = spd_3x3();
    let result = ConjugateGradient::default().solve_slice(&a, &[1.0, 2.0, 3.0])?;
    let expected_x = vec![0.464, 0.857, 0.964];
    assert_approx_eq_vec(&result.x, &expected_x, 1e-3);
    assert!(result.metadata.iterations <= 3);
    Ok(())
}

#[test]
fn test_device_solve_conjugate_gradient() -> Result<(), DevlaError> {
    init_logger();
    let ctx = AcceleratorContext::emulated();
    let a = ctx.create_device_matrix(&spd_3x3())?;
    assert_eq!(a.residency(), Residency::Device);

    let b = HostVector::from_vec(vec![1.0, 2.0, 3.0]);
    let mut x = HostVector::zeros(3);
    let result = ConjugateGradient::default().solve(a.as_base(), &b, &mut x)?;

    assert_approx_eq_vec(x.as_slice(), &[0.464, 0.857, 0.964], 1e-3);
    assert_eq!(result.x, x.as_slice());
    Ok(())
}

#[test]
fn test_device_iterations_do_not_round_trip_vectors() -> Result<(), DevlaError> {
    init_logger();
    let ctx = AcceleratorContext::emulated();
    let host = graded(50);
    let a = ctx.create_device_matrix(&host)?;
    let b = UnifiedVector::from_slice(&ctx, &vec![1.0; 50])?;
    let mut x = UnifiedVector::from_slice(&ctx, &vec![0.0; 50])?;
    ctx.reset_transfer_stats();

    let result = ConjugateGradient::default().solve(a.as_base(), &b, &mut x)?;

    // b and x go up once each, the solution comes down once.
    let stats = ctx.transfer_stats();
    assert_eq!(stats.uploads, 2);
    assert_eq!(stats.downloads, 1);
    assert!(residual_norm(&host, &result.x, &[1.0; 50]) < 1e-8);
    Ok(())
}

#[test]
fn test_host_solve_bicgstab() -> Result<(), DevlaError> {
    init_logger();
    let a = nonsymmetric_3x3();
    let result = BiCGSTAB::default().solve_slice(&a, &[5.0, 4.0, 3.0])?;
    assert_approx_eq_vec(&result.x, &[1.0, 1.0, 1.0], 1e-8);
    Ok(())
}

#[test]
fn test_device_solve_bicgstab() -> Result<(), DevlaError> {
    init_logger();
    let ctx = AcceleratorContext::emulated();
    let a = ctx.create_device_matrix(&nonsymmetric_3x3())?;
    let result = BiCGSTAB::default().solve_slice(a.as_base(), &[5.0, 4.0, 3.0])?;
    assert_approx_eq_vec(&result.x, &[1.0, 1.0, 1.0], 1e-8);
    Ok(())
}

#[test]
fn test_jacobi_reduces_iterations() -> Result<(), DevlaError> {
    init_logger();
    let n = 100;
    let host = graded(n);
    let b = HostVector::from_vec(vec![1.0; n]);
    let cg = ConjugateGradient::default();

    let mut x_plain = HostVector::zeros(n);
    let plain = cg.solve(&host, &b, &mut x_plain)?;

    let jacobi = JacobiPreconditioner::from_sparse(&host, None)?;
    let mut x_pre = HostVector::zeros(n);
    let preconditioned = cg.solve_preconditioned(&host, &jacobi, &b, &mut x_pre)?;

    assert!(preconditioned.metadata.iterations < plain.metadata.iterations);
    assert_approx_eq_vec(x_pre.as_slice(), x_plain.as_slice(), 1e-8);
    Ok(())
}

#[test]
fn test_device_jacobi_bicgstab() -> Result<(), DevlaError> {
    init_logger();
    let n = 100;
    let ctx = AcceleratorContext::emulated();
    let host = graded(n);
    let a = ctx.create_device_matrix(&host)?;
    let jacobi = ctx.create_device_matrix(&JacobiPreconditioner::from_sparse(&host, None)?)?;

    let b = HostVector::from_vec(vec![1.0; n]);
    let mut x = HostVector::zeros(n);
    let result = BiCGSTAB::default().solve_preconditioned(a.as_base(), jacobi.as_base(), &b, &mut x)?;

    assert!(result.metadata.iterations < 20);
    assert!(residual_norm(&host, x.as_slice(), b.as_slice()) < 1e-8);
    Ok(())
}

#[test]
fn test_dense_device_matrix_solve() -> Result<(), DevlaError> {
    init_logger();
    let ctx = AcceleratorContext::emulated();
    let dense = DenseMatrix::from_rows(&[
        vec![4.0, -1.0, 0.0],
        vec![-1.0, 4.0, -1.0],
        vec![0.0, -1.0, 4.0],
    ])?;
    let a = ctx.create_device_matrix(&dense)?;
    let result = ConjugateGradient::default().solve_slice(a.as_base(), &[1.0, 2.0, 3.0])?;
    assert_approx_eq_vec(&result.x, &[0.464, 0.857, 0.964], 1e-3);
    Ok(())
}

#[test]
fn test_cg_converges_from_a_small_right_hand_side() -> Result<(), DevlaError> {
    init_logger();
    // ||r|| goes from about 5e-6 down to the 1e-10 tolerance, so r^T r drops
    // far below machine epsilon before the solve is done.
    let n = 30;
    let host = graded(n);
    let b = vec![1e-6; n];
    let result = ConjugateGradient::default().solve_slice(&host, &b)?;
    assert!(result.metadata.residual_norm < 1e-10);
    assert!(residual_norm(&host, &result.x, &b) < 1e-9);

    let ctx = AcceleratorContext::emulated();
    let jacobi = JacobiPreconditioner::from_sparse(&host, None)?;
    let mut x = HostVector::zeros(n);
    let preconditioned = ConjugateGradient::default().solve_preconditioned(
        &host,
        &jacobi,
        &HostVector::from_vec(b.clone()),
        &mut x,
    )?;
    assert!(preconditioned.metadata.residual_norm < 1e-10);

    let a = ctx.create_device_matrix(&host)?;
    let device = ConjugateGradient::default().solve_slice(a.as_base(), &b)?;
    assert_approx_eq_vec(&device.x, &result.x, 1e-9);
    Ok(())
}

#[test]
fn test_bicgstab_converges_from_a_small_right_hand_side() -> Result<(), DevlaError> {
    init_logger();
    let n = 30;
    let host = graded(n);
    let b = vec![1e-6; n];
    let result = BiCGSTAB::default().solve_slice(&host, &b)?;
    assert!(residual_norm(&host, &result.x, &b) < 1e-9);
    Ok(())
}

#[test]
fn test_breakdown_is_reported() {
    init_logger();
    // p^T A p vanishes on the first step.
    let a = SparseMatrix::from_dense(&[vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
    match ConjugateGradient::default().solve_slice(&a, &[1.0, 0.0]) {
        Err(DevlaError::Breakdown { iteration, .. }) => assert_eq!(iteration, 1),
        other => panic!("Expected Breakdown, got {:?}", other.map(|r| r.x)),
    }
}

#[test]
fn test_non_convergence_is_reported() {
    init_logger();
    let a = graded(100);
    let b = HostVector::from_vec(vec![1.0; 100]);
    let mut x = HostVector::zeros(100);
    match ConjugateGradient::with_params(1e-12, 2).solve(&a, &b, &mut x) {
        Err(DevlaError::NonConvergence { iterations, .. }) => assert_eq!(iterations, 2),
        other => panic!("Expected NonConvergence, got {:?}", other.map(|r| r.x)),
    }
}

#[test]
fn test_rejects_mismatched_inputs() {
    let a = spd_3x3();
    let b = HostVector::zeros(2);
    let mut x = HostVector::zeros(3);
    assert!(matches!(
        BiCGSTAB::default().solve(&a, &b, &mut x),
        Err(DevlaError::InvalidDimensions(_))
    ));
}
