use devla_core::{ContextConfig, DeviceMatrix, TransferStats};
use devla_solver::{
    algorithms::{BiCGSTAB, SolveAlgorithm},
    AcceleratorContext, SparseMatrix, Triplet,
};
use std::time::Instant;

/// Creates a pentadiagonal sparse matrix A of size n x n.
/// Diagonals:
/// - Main: 4.0
/// - Adjacent (+1, -1): -1.0
/// - Outer (+2, -2): -0.5
fn create_pentadiagonal_matrix(n: usize) -> SparseMatrix {
    let mut triplets = Vec::new();

    for i in 0..n {
        if i >= 2 {
            triplets.push(Triplet::new(i, i - 2, -0.5));
        }
        if i >= 1 {
            triplets.push(Triplet::new(i, i - 1, -1.0));
        }
        triplets.push(Triplet::new(i, i, 4.0));
        if i + 1 < n {
            triplets.push(Triplet::new(i, i + 1, -1.0));
        }
        if i + 2 < n {
            triplets.push(Triplet::new(i, i + 2, -0.5));
        }
    }

    SparseMatrix::from_triplets(n, n, &triplets).expect("Failed to create sparse matrix from COO")
}

/// Right-hand side `b[i] = sin(i / n)` plus a little noise.
fn create_rhs(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| (i as f64 / n as f64).sin() + 1e-3 * fastrand::f64())
        .collect()
}

fn main() {
    // Initialize logging based on RUST_LOG environment variable
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("wgpu", log::LevelFilter::Off)
        .filter_module("devla_core", log::LevelFilter::Warn)
        .init();

    let n = 500;
    log::info!(
        "Setting up {}x{} pentadiagonal matrix A and sin vector b...",
        n,
        n
    );
    let a = create_pentadiagonal_matrix(n);
    let b = create_rhs(n);

    // DEVLA_BACKEND=wgpu selects the GPU when built with the `wgpu` feature.
    let config = ContextConfig::from_env().expect("Invalid accelerator configuration");
    let ctx = AcceleratorContext::new(&config).expect("Failed to create accelerator context");
    log::info!("Using the '{}' backend", ctx.backend_name());

    let a = ctx
        .create_device_matrix(&a)
        .expect("Failed to upload matrix");
    let tolerance = 1e-8;
    let max_iterations = n * 5;

    log::info!("Running device BiCGSTAB solver...");
    log::info!("  Size: {}", n);
    log::info!("  Tolerance: {}", tolerance);
    log::info!("  Max Iterations: {}", max_iterations);

    let algorithm = BiCGSTAB::with_params(tolerance, max_iterations);

    log::info!("Resetting transfer counters...");
    ctx.reset_transfer_stats();

    let start_time = Instant::now();
    let x_result = algorithm.solve_slice(a.as_base(), &b);
    let duration = start_time.elapsed();

    let TransferStats {
        bytes_to_device,
        bytes_from_device,
        uploads,
        downloads,
        device_copies,
    } = ctx.transfer_stats();
    log::info!("Transfer Stats:");
    log::info!("  Bytes host -> device: {} ({} uploads)", bytes_to_device, uploads);
    log::info!("  Bytes device -> host: {} ({} downloads)", bytes_from_device, downloads);
    log::info!("  Device-side copies: {}", device_copies);

    match x_result {
        Ok(result) => {
            log::info!("Solver finished successfully!");
            log::info!("  Iterations: {}", result.metadata.iterations);
            log::info!(
                "  Final Residual Norm: {:.6e}",
                result.metadata.residual_norm
            );
            log::info!("  Time elapsed: {:?}", duration);
            log::debug!("Solution vector x (first 10 elements): {:?}", &result.x[..10.min(n)]);
        }
        Err(e) => {
            log::error!("Solver failed: {:?}", e);
        }
    }
}
