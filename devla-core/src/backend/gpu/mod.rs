//! wgpu accelerator: device memory is a set of storage buffers, kernels are
//! WGSL compute shaders in double precision.
//!
//! Every entry point blocks (through `pollster`) until the queue has drained,
//! so callers observe the same synchronous semantics as the emulated device.

mod kernels;

use super::{Backend, BufferId, DenseBlas, DeviceMemory, SparseBlas};
use crate::config::PowerPreference;
use crate::error::{DevlaError, Result};
use kernels::{WgpuDenseBlas, WgpuSparseBlas};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use wgpu::PollType;

/// Buffers are padded to this many bytes so zero-length vectors still bind.
const MIN_BUFFER_SIZE: u64 = 8;

#[derive(Debug)]
pub(crate) struct GpuShared {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    buffers: Mutex<HashMap<u64, wgpu::Buffer>>,
    next_id: AtomicU64,
}

impl GpuShared {
    fn buffers(&self) -> Result<MutexGuard<'_, HashMap<u64, wgpu::Buffer>>> {
        self.buffers
            .lock()
            .map_err(|_| DevlaError::Internal("wgpu buffer table lock poisoned".to_string()))
    }

    pub(crate) fn buffer(&self, id: BufferId) -> Result<wgpu::Buffer> {
        self.buffers()?
            .get(&id.raw())
            .cloned()
            .ok_or_else(|| DevlaError::Kernel(format!("unknown device buffer {}", id.raw())))
    }

    pub(crate) fn wait(&self) -> Result<()> {
        self.device
            .poll(PollType::Wait)
            .map(|_| ())
            .map_err(|e| DevlaError::Kernel(format!("device poll failed: {e}")))
    }

    /// Copies the first `bytes` of `buffer` into host memory.
    pub(crate) fn read_bytes(&self, buffer: &wgpu::Buffer, bytes: u64) -> Result<Vec<u8>> {
        log::debug!("Creating staging buffer for readback ({} bytes)", bytes);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("devla readback staging"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("devla readback encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            if let Err(e) = sender.send(result) {
                log::error!("Failed to send map result back: {:?}", e);
            }
        });
        self.wait()?;

        match pollster::block_on(receiver) {
            Ok(Ok(())) => {
                let data = {
                    let view = slice.get_mapped_range();
                    view.to_vec()
                };
                staging.unmap();
                Ok(data)
            }
            Ok(Err(e)) => {
                log::error!("Failed to map buffer: {:?}", e);
                Err(DevlaError::Kernel(format!("Buffer mapping failed: {e}")))
            }
            Err(_) => {
                log::error!("Channel receive error during buffer mapping");
                Err(DevlaError::Internal(
                    "Channel receive error during buffer mapping".to_string(),
                ))
            }
        }
    }
}

/// A wgpu device and queue acting as the accelerator. Requires an adapter with
/// `SHADER_F64`.
#[derive(Debug, Clone)]
pub struct WgpuBackend {
    shared: Arc<GpuShared>,
}

impl WgpuBackend {
    /// Opens a native adapter and device, blocking until both are ready.
    pub fn new(preference: PowerPreference) -> Result<Self> {
        pollster::block_on(Self::new_async(preference))
    }

    async fn new_async(preference: PowerPreference) -> Result<Self> {
        log::info!("Initializing native WGPU context");

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let power_preference = match preference {
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        };
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| DevlaError::BackendInit("No suitable native adapter found".to_string()))?;

        log::info!("Selected Native Adapter: {:?}", adapter.get_info());
        if !adapter.features().contains(wgpu::Features::SHADER_F64) {
            return Err(DevlaError::BackendInit(
                "adapter does not support SHADER_F64".to_string(),
            ));
        }

        let mut limits = wgpu::Limits::default().using_resolution(adapter.limits());
        // spmv binds five storage buffers
        limits.max_storage_buffers_per_shader_stage =
            limits.max_storage_buffers_per_shader_stage.max(5);
        log::debug!("Adjusted limits: {:?}", limits);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("devla device"),
                trace: wgpu::Trace::Off,
                memory_hints: wgpu::MemoryHints::Performance,
                required_features: wgpu::Features::SHADER_F64,
                required_limits: limits,
            })
            .await
            .map_err(|e| DevlaError::BackendInit(format!("Failed to request device: {}", e)))?;

        log::info!("Device and queue obtained successfully");

        Ok(Self {
            shared: Arc::new(GpuShared {
                device,
                queue,
                buffers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }
}

impl DeviceMemory for WgpuBackend {
    fn allocate(&self, bytes: usize) -> Result<BufferId> {
        let size = (bytes as u64).max(MIN_BUFFER_SIZE).next_multiple_of(MIN_BUFFER_SIZE);
        if size > self.shared.device.limits().max_buffer_size {
            return Err(DevlaError::Allocation {
                requested: bytes,
                reason: format!(
                    "exceeds max buffer size {}",
                    self.shared.device.limits().max_buffer_size
                ),
            });
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("Creating empty GPU buffer #{} of size {}", id, size);

        self.shared
            .device
            .push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("devla buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(error) = pollster::block_on(self.shared.device.pop_error_scope()) {
            return Err(DevlaError::Allocation {
                requested: bytes,
                reason: error.to_string(),
            });
        }

        self.shared.buffers()?.insert(id, buffer);
        Ok(BufferId::new(id))
    }

    fn release(&self, id: BufferId) {
        if let Ok(mut buffers) = self.shared.buffers() {
            if let Some(buffer) = buffers.remove(&id.raw()) {
                buffer.destroy();
            }
        }
    }

    fn write(&self, dst: BufferId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            log::debug!("Skipping write for 0 bytes");
            return Ok(());
        }
        let buffer = self.shared.buffer(dst)?;
        if buffer.size() < data.len() as u64 {
            return Err(DevlaError::Internal(format!(
                "Target buffer size ({}) is smaller than data size ({})",
                buffer.size(),
                data.len()
            )));
        }
        log::debug!("Writing {} bytes to buffer", data.len());
        self.shared.queue.write_buffer(&buffer, 0, data);
        self.shared.queue.submit(std::iter::empty());
        self.shared.wait()
    }

    fn read(&self, src: BufferId, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            log::debug!("Skipping readback for 0 bytes");
            return Ok(());
        }
        let buffer = self.shared.buffer(src)?;
        if buffer.size() < out.len() as u64 {
            return Err(DevlaError::Internal(format!(
                "GPU buffer size ({}) is smaller than requested read ({})",
                buffer.size(),
                out.len()
            )));
        }
        let data = self.shared.read_bytes(&buffer, out.len() as u64)?;
        out.copy_from_slice(&data);
        Ok(())
    }

    fn copy(&self, src: BufferId, dst: BufferId, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let source = self.shared.buffer(src)?;
        let target = self.shared.buffer(dst)?;
        let mut encoder =
            self.shared
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("devla copy encoder"),
                });
        encoder.copy_buffer_to_buffer(&source, 0, &target, 0, bytes as u64);
        self.shared.queue.submit(std::iter::once(encoder.finish()));
        self.shared.wait()
    }

    fn live_allocations(&self) -> usize {
        self.shared.buffers().map(|b| b.len()).unwrap_or(0)
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn create_dense_blas(&self) -> Result<Arc<dyn DenseBlas>> {
        Ok(Arc::new(WgpuDenseBlas::new(Arc::clone(&self.shared))))
    }

    fn create_sparse_blas(&self) -> Result<Arc<dyn SparseBlas>> {
        Ok(Arc::new(WgpuSparseBlas::new(Arc::clone(&self.shared))))
    }
}
