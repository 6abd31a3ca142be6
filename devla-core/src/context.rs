use crate::backend::{Backend, BufferId, DenseBlas, EmulatedBackend, SparseBlas};
use crate::config::{BackendKind, ContextConfig};
use crate::dev_matrix::DeviceMatrix;
use crate::error::{DevlaError, Result};
use crate::factory::DeviceMatrixFactory;
use crate::traits::BaseMatrix;
use cfg_if::cfg_if;
use serde::Serialize;
use std::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock, RwLock,
};

/// Host/device traffic observed by one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub bytes_to_device: u64,
    pub bytes_from_device: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub device_copies: u64,
}

#[derive(Debug, Default)]
struct TransferCounters {
    bytes_to_device: AtomicU64,
    bytes_from_device: AtomicU64,
    uploads: AtomicU64,
    downloads: AtomicU64,
    device_copies: AtomicU64,
}

/// One accelerator: its memory, its two BLAS execution contexts, the device
/// matrix factory and the transfer counters.
///
/// The dense and sparse BLAS handles are created at most once, on first use
/// or through [`init_handles`](Self::init_handles), and shared read-only for
/// the lifetime of the context.
pub struct AcceleratorContext {
    backend: Arc<dyn Backend>,
    dense_blas: OnceLock<std::result::Result<Arc<dyn DenseBlas>, String>>,
    sparse_blas: OnceLock<std::result::Result<Arc<dyn SparseBlas>, String>>,
    factory: RwLock<DeviceMatrixFactory>,
    counters: TransferCounters,
}

impl fmt::Debug for AcceleratorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorContext")
            .field("backend", &self.backend.name())
            .field("dense_blas", &self.dense_blas.get().map(|h| h.is_ok()))
            .field("sparse_blas", &self.sparse_blas.get().map(|h| h.is_ok()))
            .field("transfers", &self.transfer_stats())
            .finish()
    }
}

impl AcceleratorContext {
    /// Builds the backend selected by `config`.
    pub fn new(config: &ContextConfig) -> Result<Arc<Self>> {
        log::info!("Creating accelerator context ({:?} backend)", config.backend);
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Emulated => Arc::new(match config.memory_limit {
                Some(limit) => EmulatedBackend::with_memory_limit(limit),
                None => EmulatedBackend::new(),
            }),
            BackendKind::Wgpu => wgpu_backend(config)?,
        };
        let ctx = Self::with_backend(backend);
        if config.eager_handles {
            ctx.init_handles()?;
        }
        Ok(ctx)
    }

    pub fn with_backend(backend: Arc<dyn Backend>) -> Arc<Self> {
        log::debug!("Accelerator context on backend '{}'", backend.name());
        Arc::new(Self {
            backend,
            dense_blas: OnceLock::new(),
            sparse_blas: OnceLock::new(),
            factory: RwLock::new(DeviceMatrixFactory::with_builtins()),
            counters: TransferCounters::default(),
        })
    }

    /// A context on a fresh emulated device.
    pub fn emulated() -> Arc<Self> {
        Self::with_backend(Arc::new(EmulatedBackend::new()))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// The dense BLAS handle, created on first request. A failed creation is
    /// reported again on every later request.
    pub fn dense_blas(&self) -> Result<&Arc<dyn DenseBlas>> {
        self.dense_blas
            .get_or_init(|| {
                log::debug!("Creating dense BLAS handle on '{}'", self.backend.name());
                self.backend.create_dense_blas().map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| DevlaError::HandleCreation(format!("dense BLAS: {e}")))
    }

    /// The sparse BLAS handle, created on first request.
    pub fn sparse_blas(&self) -> Result<&Arc<dyn SparseBlas>> {
        self.sparse_blas
            .get_or_init(|| {
                log::debug!("Creating sparse BLAS handle on '{}'", self.backend.name());
                self.backend.create_sparse_blas().map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| DevlaError::HandleCreation(format!("sparse BLAS: {e}")))
    }

    /// Creates both BLAS handles now instead of on first use.
    pub fn init_handles(&self) -> Result<()> {
        self.dense_blas()?;
        self.sparse_blas()?;
        log::info!("Accelerator linear algebra initialized on '{}'", self.backend.name());
        Ok(())
    }

    // --- device memory, instrumented ---

    pub(crate) fn allocate(&self, bytes: usize) -> Result<BufferId> {
        self.backend.allocate(bytes)
    }

    pub(crate) fn release(&self, id: BufferId) {
        self.backend.release(id)
    }

    pub(crate) fn upload(&self, dst: BufferId, data: &[u8]) -> Result<()> {
        self.backend.write(dst, data)?;
        let byte_len = data.len() as u64;
        self.counters.uploads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_to_device
            .fetch_add(byte_len, Ordering::Relaxed);
        log::trace!(
            "bytes_to_device incremented by {}, now: {}",
            byte_len,
            self.counters.bytes_to_device.load(Ordering::Relaxed)
        );
        Ok(())
    }

    pub(crate) fn download(&self, src: BufferId, out: &mut [u8]) -> Result<()> {
        self.backend.read(src, out)?;
        let byte_len = out.len() as u64;
        self.counters.downloads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_from_device
            .fetch_add(byte_len, Ordering::Relaxed);
        log::trace!(
            "bytes_from_device incremented by {}, now: {}",
            byte_len,
            self.counters.bytes_from_device.load(Ordering::Relaxed)
        );
        Ok(())
    }

    pub(crate) fn copy_on_device(&self, src: BufferId, dst: BufferId, bytes: usize) -> Result<()> {
        self.backend.copy(src, dst, bytes)?;
        self.counters.device_copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Device allocations currently alive on the backend.
    pub fn live_allocations(&self) -> usize {
        self.backend.live_allocations()
    }

    /// Returns the current transfer statistics.
    pub fn transfer_stats(&self) -> TransferStats {
        TransferStats {
            bytes_to_device: self.counters.bytes_to_device.load(Ordering::Relaxed),
            bytes_from_device: self.counters.bytes_from_device.load(Ordering::Relaxed),
            uploads: self.counters.uploads.load(Ordering::Relaxed),
            downloads: self.counters.downloads.load(Ordering::Relaxed),
            device_copies: self.counters.device_copies.load(Ordering::Relaxed),
        }
    }

    /// Resets the transfer statistics counters to zero.
    pub fn reset_transfer_stats(&self) {
        self.counters.bytes_to_device.store(0, Ordering::Relaxed);
        self.counters.bytes_from_device.store(0, Ordering::Relaxed);
        self.counters.uploads.store(0, Ordering::Relaxed);
        self.counters.downloads.store(0, Ordering::Relaxed);
        self.counters.device_copies.store(0, Ordering::Relaxed);
        log::info!("Accelerator transfer counters reset.");
    }

    // --- device matrix factory ---

    /// Adds (or replaces) the device conversion for host matrices of type `M`.
    pub fn register<M, F>(&self, name: &'static str, creator: F) -> Result<()>
    where
        M: BaseMatrix,
        F: Fn(&M, &Arc<AcceleratorContext>) -> Result<Box<dyn DeviceMatrix>>
            + Send
            + Sync
            + 'static,
    {
        self.factory
            .write()
            .map_err(|_| factory_poisoned())?
            .register::<M, F>(name, creator);
        Ok(())
    }

    pub fn is_registered<M: BaseMatrix>(&self) -> Result<bool> {
        Ok(self
            .factory
            .read()
            .map_err(|_| factory_poisoned())?
            .is_registered::<M>())
    }

    /// Device counterpart of `matrix`: the matrix's own conversion if it has
    /// one, else the registered conversion for its type.
    pub fn create_device_matrix(
        self: &Arc<Self>,
        matrix: &dyn BaseMatrix,
    ) -> Result<Box<dyn DeviceMatrix>> {
        if let Some(result) = matrix.create_device_matrix(self) {
            log::debug!("{} built its own device matrix", matrix.type_name());
            return result;
        }
        let entry = self
            .factory
            .read()
            .map_err(|_| factory_poisoned())?
            .lookup(matrix);
        match entry {
            Some((name, creator)) => {
                log::debug!(
                    "Creating device matrix for {} through '{}'",
                    matrix.type_name(),
                    name
                );
                creator(matrix, self)
            }
            None => Err(DevlaError::UnsupportedType(matrix.type_name().to_string())),
        }
    }
}

fn factory_poisoned() -> DevlaError {
    log::error!("Device matrix factory lock poisoned");
    DevlaError::Internal("device matrix factory lock poisoned".to_string())
}

cfg_if! {
    if #[cfg(feature = "wgpu")] {
        fn wgpu_backend(config: &ContextConfig) -> Result<Arc<dyn Backend>> {
            Ok(Arc::new(crate::backend::WgpuBackend::new(config.power_preference)?))
        }
    } else {
        fn wgpu_backend(_config: &ContextConfig) -> Result<Arc<dyn Backend>> {
            Err(DevlaError::BackendInit(
                "the wgpu backend requires building with the `wgpu` feature".to_string(),
            ))
        }
    }
}

/// The process-wide context, configured from the environment on first use.
///
/// Prefer creating a context explicitly and passing it around; this exists for
/// callers that cannot thread one through.
pub fn default_context() -> Result<Arc<AcceleratorContext>> {
    static DEFAULT: OnceLock<std::result::Result<Arc<AcceleratorContext>, String>> =
        OnceLock::new();
    DEFAULT
        .get_or_init(|| {
            ContextConfig::from_env()
                .and_then(|config| AcceleratorContext::new(&config))
                .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(DevlaError::BackendInit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CsrDescriptor, DenseVecDescriptor, DeviceMemory, Transpose};
    use crate::sparse_matrix::SparseMatrix;
    use std::sync::atomic::AtomicUsize;

    /// Backend whose handle creation can be made to fail, counting attempts.
    #[derive(Debug, Default)]
    struct FlakyBackend {
        inner: EmulatedBackend,
        fail: bool,
        attempts: AtomicUsize,
    }

    impl DeviceMemory for FlakyBackend {
        fn allocate(&self, bytes: usize) -> Result<BufferId> {
            self.inner.allocate(bytes)
        }
        fn release(&self, id: BufferId) {
            self.inner.release(id)
        }
        fn write(&self, dst: BufferId, data: &[u8]) -> Result<()> {
            self.inner.write(dst, data)
        }
        fn read(&self, src: BufferId, out: &mut [u8]) -> Result<()> {
            self.inner.read(src, out)
        }
        fn copy(&self, src: BufferId, dst: BufferId, bytes: usize) -> Result<()> {
            self.inner.copy(src, dst, bytes)
        }
        fn live_allocations(&self) -> usize {
            self.inner.live_allocations()
        }
    }

    impl Backend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }
        fn create_dense_blas(&self) -> Result<Arc<dyn DenseBlas>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DevlaError::BackendInit("no BLAS today".to_string()));
            }
            self.inner.create_dense_blas()
        }
        fn create_sparse_blas(&self) -> Result<Arc<dyn SparseBlas>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DevlaError::BackendInit("no sparse BLAS today".to_string()));
            }
            self.inner.create_sparse_blas()
        }
    }

    #[test]
    fn test_handles_are_created_once_under_concurrent_first_use() {
        let backend = EmulatedBackend::new();
        let ctx = AcceleratorContext::with_backend(Arc::new(backend.clone()));

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    ctx.dense_blas().unwrap();
                    ctx.sparse_blas().unwrap();
                });
            }
        });

        assert_eq!(backend.handles_created(), 2);
        let first = Arc::as_ptr(ctx.dense_blas().unwrap());
        let second = Arc::as_ptr(ctx.dense_blas().unwrap());
        assert!(std::ptr::addr_eq(first, second));
    }

    #[test]
    fn test_failed_handle_creation_is_sticky() {
        let flaky = Arc::new(FlakyBackend {
            fail: true,
            ..Default::default()
        });
        let ctx = AcceleratorContext::with_backend(flaky.clone());

        for _ in 0..3 {
            match ctx.dense_blas() {
                Err(DevlaError::HandleCreation(msg)) => assert!(msg.contains("no BLAS today")),
                other => panic!("Expected HandleCreation, got {:?}", other.map(|_| ())),
            }
        }
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            ctx.init_handles(),
            Err(DevlaError::HandleCreation(_))
        ));
    }

    #[test]
    fn test_eager_handles_from_config() {
        let config = ContextConfig::default().with_eager_handles(true);
        let ctx = AcceleratorContext::new(&config).unwrap();
        assert!(ctx.dense_blas.get().is_some());
        assert!(ctx.sparse_blas.get().is_some());
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn test_wgpu_backend_requires_feature() {
        let config = ContextConfig::default().with_backend(BackendKind::Wgpu);
        assert!(matches!(
            AcceleratorContext::new(&config),
            Err(DevlaError::BackendInit(_))
        ));
    }

    #[test]
    fn test_transfer_counters() {
        let ctx = AcceleratorContext::emulated();
        let a = ctx.allocate(16).unwrap();
        let b = ctx.allocate(16).unwrap();
        ctx.upload(a, bytemuck::cast_slice(&[1.0f64, 2.0])).unwrap();
        ctx.copy_on_device(a, b, 16).unwrap();
        let mut out = [0.0f64; 2];
        ctx.download(b, bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, [1.0, 2.0]);

        let stats = ctx.transfer_stats();
        assert_eq!(stats.uploads, 1);
        assert_eq!(stats.downloads, 1);
        assert_eq!(stats.device_copies, 1);
        assert_eq!(stats.bytes_to_device, 16);
        assert_eq!(stats.bytes_from_device, 16);

        ctx.reset_transfer_stats();
        assert_eq!(ctx.transfer_stats(), TransferStats::default());
        ctx.release(a);
        ctx.release(b);
        assert_eq!(ctx.live_allocations(), 0);
    }

    #[test]
    fn test_blas_handles_drive_the_backend() {
        let ctx = AcceleratorContext::emulated();
        let a = ctx.allocate(32).unwrap();
        let x = ctx.allocate(16).unwrap();
        let y = ctx.allocate(16).unwrap();
        // row-major 2x2 [[1, 2], [3, 4]] seen as column-major transposed
        ctx.upload(a, bytemuck::cast_slice(&[1.0f64, 2.0, 3.0, 4.0]))
            .unwrap();
        ctx.upload(x, bytemuck::cast_slice(&[1.0f64, 1.0])).unwrap();
        ctx.dense_blas()
            .unwrap()
            .gemv(Transpose::Trans, 2, 2, 1.0, a, 2, x, 0.0, y)
            .unwrap();
        let mut out = [0.0f64; 2];
        ctx.download(y, bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, [3.0, 7.0]);

        let offsets = ctx.allocate(12).unwrap();
        let cols = ctx.allocate(8).unwrap();
        let vals = ctx.allocate(16).unwrap();
        ctx.upload(offsets, bytemuck::cast_slice(&[0u32, 1, 2])).unwrap();
        ctx.upload(cols, bytemuck::cast_slice(&[1u32, 0])).unwrap();
        ctx.upload(vals, bytemuck::cast_slice(&[2.0f64, 3.0])).unwrap();
        let csr = CsrDescriptor {
            rows: 2,
            cols: 2,
            nnz: 2,
            row_offsets: offsets,
            col_indices: cols,
            values: vals,
        };
        ctx.sparse_blas()
            .unwrap()
            .spmv(
                1.0,
                &csr,
                &DenseVecDescriptor { buffer: y, len: 2 },
                0.0,
                &DenseVecDescriptor { buffer: x, len: 2 },
            )
            .unwrap();
        ctx.download(x, bytemuck::cast_slice_mut(&mut out)).unwrap();
        assert_eq!(out, [14.0, 9.0]);
    }

    #[test]
    fn test_poisoned_factory_is_reported() {
        let ctx = AcceleratorContext::emulated();
        let holder = Arc::clone(&ctx);
        let _ = std::thread::spawn(move || {
            let _guard = holder.factory.write().unwrap();
            panic!("factory writer died");
        })
        .join();

        assert!(matches!(
            ctx.is_registered::<SparseMatrix>(),
            Err(DevlaError::Internal(_))
        ));
        assert!(matches!(
            ctx.create_device_matrix(&SparseMatrix::new(2, 2)),
            Err(DevlaError::Internal(_))
        ));
    }
}
