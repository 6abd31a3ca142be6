//! In-process accelerator.
//!
//! Device memory is a private arena addressed only by [`BufferId`]; the host
//! can reach it exclusively through the copy and kernel entry points, exactly
//! like a discrete accelerator. Kernels run synchronously on the calling
//! thread. Useful as a reference backend and for machines without a GPU.

use super::{
    Backend, BufferId, CsrDescriptor, DenseBlas, DenseVecDescriptor, DeviceMemory, SparseBlas,
    Transpose,
};
use crate::error::{DevlaError, Result};
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const WORD: usize = mem::size_of::<u64>();

/// One allocation, stored as 8-byte words so it can be viewed as `f64` or
/// `u32` without alignment trouble.
#[derive(Debug)]
struct Allocation {
    words: Vec<u64>,
    bytes: usize,
}

#[derive(Debug, Default)]
struct Arena {
    buffers: HashMap<u64, Allocation>,
    allocated: usize,
}

impl Arena {
    fn get(&self, id: BufferId) -> Result<&Allocation> {
        self.buffers
            .get(&id.raw())
            .ok_or_else(|| DevlaError::Kernel(format!("unknown device buffer {}", id.raw())))
    }

    fn get_mut(&mut self, id: BufferId) -> Result<&mut Allocation> {
        self.buffers
            .get_mut(&id.raw())
            .ok_or_else(|| DevlaError::Kernel(format!("unknown device buffer {}", id.raw())))
    }

    fn f64s(&self, id: BufferId, n: usize) -> Result<&[f64]> {
        let alloc = self.get(id)?;
        check_extent(id, alloc, n, mem::size_of::<f64>())?;
        Ok(&bytemuck::cast_slice::<u64, f64>(&alloc.words)[..n])
    }

    fn f64s_mut(&mut self, id: BufferId, n: usize) -> Result<&mut [f64]> {
        let alloc = self.get_mut(id)?;
        check_extent(id, alloc, n, mem::size_of::<f64>())?;
        Ok(&mut bytemuck::cast_slice_mut::<u64, f64>(&mut alloc.words)[..n])
    }

    fn u32s(&self, id: BufferId, n: usize) -> Result<&[u32]> {
        let alloc = self.get(id)?;
        check_extent(id, alloc, n, mem::size_of::<u32>())?;
        Ok(&bytemuck::cast_slice::<u64, u32>(&alloc.words)[..n])
    }
}

fn check_extent(id: BufferId, alloc: &Allocation, n: usize, elem: usize) -> Result<()> {
    if n * elem > alloc.bytes {
        return Err(DevlaError::Kernel(format!(
            "device buffer {} holds {} bytes, kernel needs {}",
            id.raw(),
            alloc.bytes,
            n * elem
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct EmulatedDevice {
    arena: Mutex<Arena>,
    next_id: AtomicU64,
    memory_limit: Option<usize>,
    handles_created: AtomicUsize,
}

impl EmulatedDevice {
    fn arena(&self) -> Result<MutexGuard<'_, Arena>> {
        self.arena
            .lock()
            .map_err(|_| DevlaError::Internal("emulated device arena lock poisoned".to_string()))
    }
}

/// The emulated accelerator. Cloning yields another handle to the same device.
#[derive(Debug, Clone)]
pub struct EmulatedBackend {
    device: Arc<EmulatedDevice>,
}

impl Default for EmulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedBackend {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A device with `bytes` of memory; larger requests fail with
    /// [`DevlaError::Allocation`].
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(memory_limit: Option<usize>) -> Self {
        log::info!(
            "Creating emulated accelerator (memory limit: {:?})",
            memory_limit
        );
        Self {
            device: Arc::new(EmulatedDevice {
                arena: Mutex::new(Arena::default()),
                next_id: AtomicU64::new(1),
                memory_limit,
                handles_created: AtomicUsize::new(0),
            }),
        }
    }

    /// Bytes currently allocated on the device.
    pub fn allocated_bytes(&self) -> usize {
        self.device.arena().map(|a| a.allocated).unwrap_or(0)
    }

    /// How many BLAS execution contexts have been created on this device.
    pub fn handles_created(&self) -> usize {
        self.device.handles_created.load(Ordering::SeqCst)
    }
}

impl DeviceMemory for EmulatedBackend {
    fn allocate(&self, bytes: usize) -> Result<BufferId> {
        let mut arena = self.device.arena()?;
        if let Some(limit) = self.device.memory_limit {
            let available = limit.saturating_sub(arena.allocated);
            if bytes > available {
                return Err(DevlaError::Allocation {
                    requested: bytes,
                    reason: format!("out of device memory ({available} of {limit} bytes free)"),
                });
            }
        }
        let id = self.device.next_id.fetch_add(1, Ordering::Relaxed);
        let words = bytes.div_ceil(WORD);
        arena.buffers.insert(
            id,
            Allocation {
                words: vec![0; words],
                bytes,
            },
        );
        arena.allocated += bytes;
        log::trace!("emulated alloc #{id}: {bytes} bytes, {} in use", arena.allocated);
        Ok(BufferId::new(id))
    }

    fn release(&self, id: BufferId) {
        if let Ok(mut arena) = self.device.arena() {
            if let Some(alloc) = arena.buffers.remove(&id.raw()) {
                arena.allocated -= alloc.bytes;
                log::trace!("emulated free #{}: {} bytes", id.raw(), alloc.bytes);
            }
        }
    }

    fn write(&self, dst: BufferId, data: &[u8]) -> Result<()> {
        let mut arena = self.device.arena()?;
        let alloc = arena.get_mut(dst)?;
        if data.len() > alloc.bytes {
            return Err(DevlaError::Internal(format!(
                "Target buffer size ({}) is smaller than data size ({})",
                alloc.bytes,
                data.len()
            )));
        }
        bytemuck::cast_slice_mut::<u64, u8>(&mut alloc.words)[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, src: BufferId, out: &mut [u8]) -> Result<()> {
        let arena = self.device.arena()?;
        let alloc = arena.get(src)?;
        if out.len() > alloc.bytes {
            return Err(DevlaError::Internal(format!(
                "Device buffer size ({}) is smaller than requested read ({})",
                alloc.bytes,
                out.len()
            )));
        }
        out.copy_from_slice(&bytemuck::cast_slice::<u64, u8>(&alloc.words)[..out.len()]);
        Ok(())
    }

    fn copy(&self, src: BufferId, dst: BufferId, bytes: usize) -> Result<()> {
        let mut arena = self.device.arena()?;
        let source = {
            let alloc = arena.get(src)?;
            if bytes > alloc.bytes {
                return Err(DevlaError::Internal(format!(
                    "Copy of {} bytes exceeds source buffer ({} bytes)",
                    bytes, alloc.bytes
                )));
            }
            bytemuck::cast_slice::<u64, u8>(&alloc.words)[..bytes].to_vec()
        };
        let target = arena.get_mut(dst)?;
        if bytes > target.bytes {
            return Err(DevlaError::Internal(format!(
                "Copy of {} bytes exceeds destination buffer ({} bytes)",
                bytes, target.bytes
            )));
        }
        bytemuck::cast_slice_mut::<u64, u8>(&mut target.words)[..bytes].copy_from_slice(&source);
        Ok(())
    }

    fn live_allocations(&self) -> usize {
        self.device.arena().map(|a| a.buffers.len()).unwrap_or(0)
    }
}

impl Backend for EmulatedBackend {
    fn name(&self) -> &str {
        "emulated"
    }

    fn create_dense_blas(&self) -> Result<Arc<dyn DenseBlas>> {
        self.device.handles_created.fetch_add(1, Ordering::SeqCst);
        log::debug!("Creating emulated dense BLAS handle");
        Ok(Arc::new(EmulatedBlas {
            device: Arc::clone(&self.device),
        }))
    }

    fn create_sparse_blas(&self) -> Result<Arc<dyn SparseBlas>> {
        self.device.handles_created.fetch_add(1, Ordering::SeqCst);
        log::debug!("Creating emulated sparse BLAS handle");
        Ok(Arc::new(EmulatedBlas {
            device: Arc::clone(&self.device),
        }))
    }
}

/// Kernel side of the emulated device; serves as both BLAS contexts.
#[derive(Debug)]
struct EmulatedBlas {
    device: Arc<EmulatedDevice>,
}

impl DenseBlas for EmulatedBlas {
    fn fill(&self, n: usize, value: f64, x: BufferId) -> Result<()> {
        let mut arena = self.device.arena()?;
        arena.f64s_mut(x, n)?.fill(value);
        Ok(())
    }

    fn scal(&self, n: usize, alpha: f64, x: BufferId) -> Result<()> {
        let mut arena = self.device.arena()?;
        arena.f64s_mut(x, n)?.iter_mut().for_each(|v| *v *= alpha);
        Ok(())
    }

    fn axpy(&self, n: usize, alpha: f64, x: BufferId, y: BufferId) -> Result<()> {
        let mut arena = self.device.arena()?;
        let xs = arena.f64s(x, n)?.to_vec();
        let ys = arena.f64s_mut(y, n)?;
        for (yi, xi) in ys.iter_mut().zip(xs) {
            *yi += alpha * xi;
        }
        Ok(())
    }

    fn dot(&self, n: usize, x: BufferId, y: BufferId) -> Result<f64> {
        let arena = self.device.arena()?;
        let xs = arena.f64s(x, n)?;
        let ys = arena.f64s(y, n)?;
        Ok(xs.iter().zip(ys).map(|(a, b)| a * b).sum())
    }

    fn gemv(
        &self,
        trans: Transpose,
        m: usize,
        n: usize,
        alpha: f64,
        a: BufferId,
        lda: usize,
        x: BufferId,
        beta: f64,
        y: BufferId,
    ) -> Result<()> {
        if lda < m.max(1) {
            return Err(DevlaError::Kernel(format!(
                "gemv: lda ({lda}) must be at least m ({m})"
            )));
        }
        let (x_len, y_len) = match trans {
            Transpose::NoTrans => (n, m),
            Transpose::Trans => (m, n),
        };
        let a_len = if n == 0 { 0 } else { lda * (n - 1) + m };

        let mut arena = self.device.arena()?;
        let result = {
            let a_vals = arena.f64s(a, a_len)?;
            let xs = arena.f64s(x, x_len)?;
            let ys = arena.f64s(y, y_len)?;
            (0..y_len)
                .map(|out| {
                    let sum: f64 = match trans {
                        Transpose::NoTrans => (0..n).map(|j| a_vals[out + j * lda] * xs[j]).sum(),
                        Transpose::Trans => (0..m).map(|i| a_vals[i + out * lda] * xs[i]).sum(),
                    };
                    if beta == 0.0 {
                        alpha * sum
                    } else {
                        alpha * sum + beta * ys[out]
                    }
                })
                .collect::<Vec<f64>>()
        };
        arena.f64s_mut(y, y_len)?.copy_from_slice(&result);
        Ok(())
    }
}

impl SparseBlas for EmulatedBlas {
    fn spmv(
        &self,
        alpha: f64,
        a: &CsrDescriptor,
        x: &DenseVecDescriptor,
        beta: f64,
        y: &DenseVecDescriptor,
    ) -> Result<()> {
        if x.len != a.cols || y.len != a.rows {
            return Err(DevlaError::Kernel(format!(
                "spmv: {}x{} matrix with x of length {} and y of length {}",
                a.rows, a.cols, x.len, y.len
            )));
        }
        let mut arena = self.device.arena()?;
        let result = {
            let row_offsets = arena.u32s(a.row_offsets, a.rows + 1)?;
            let cols = arena.u32s(a.col_indices, a.nnz)?;
            let vals = arena.f64s(a.values, a.nnz)?;
            let xs = arena.f64s(x.buffer, x.len)?;
            let ys = arena.f64s(y.buffer, y.len)?;
            let mut out = Vec::with_capacity(a.rows);
            for row in 0..a.rows {
                let (start, end) = (row_offsets[row] as usize, row_offsets[row + 1] as usize);
                if start > end || end > a.nnz {
                    return Err(DevlaError::Kernel(format!(
                        "spmv: corrupt row offsets at row {row}"
                    )));
                }
                let mut sum = 0.0;
                for k in start..end {
                    let col = cols[k] as usize;
                    if col >= a.cols {
                        return Err(DevlaError::Kernel(format!(
                            "spmv: column index {col} out of range at row {row}"
                        )));
                    }
                    sum += vals[k] * xs[col];
                }
                out.push(if beta == 0.0 {
                    alpha * sum
                } else {
                    alpha * sum + beta * ys[row]
                });
            }
            out
        };
        arena.f64s_mut(y.buffer, y.len)?.copy_from_slice(&result);
        Ok(())
    }
}
