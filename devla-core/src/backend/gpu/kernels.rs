use super::GpuShared;
use crate::backend::{
    BufferId, CsrDescriptor, DenseBlas, DenseVecDescriptor, SparseBlas, Transpose,
};
use crate::error::{DevlaError, Result};
use bytemuck::{Pod, Zeroable};
use std::mem;
use std::sync::Arc;

const WORKGROUP_SIZE: u32 = 256;

const FLAG_TRANSPOSE: u32 = 1;
const FLAG_BETA: u32 = 2;

/// Uniform block shared by every shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct KernelParams {
    alpha: f64,
    beta: f64,
    n: u32,
    m: u32,
    lda: u32,
    flags: u32,
}

/// Storage binding access, in binding order after the uniform at 0.
#[derive(Clone, Copy)]
enum Access {
    Read,
    ReadWrite,
}

#[derive(Debug)]
struct Kernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

impl Kernel {
    fn compile(device: &wgpu::Device, name: &str, source: &str, storage: &[Access]) -> Self {
        log::debug!("Compiling {} kernel", name);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(mem::size_of::<KernelParams>() as u64),
            },
            count: None,
        }];
        for (i, access) in storage.iter().enumerate() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i as u32 + 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: matches!(access, Access::Read),
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(name),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: Default::default(),
        });
        Self { pipeline, layout }
    }

    /// Records one compute pass of `workgroups` groups into `encoder`.
    fn record(
        &self,
        shared: &GpuShared,
        encoder: &mut wgpu::CommandEncoder,
        params: &KernelParams,
        buffers: &[&wgpu::Buffer],
        workgroups: u32,
    ) {
        use wgpu::util::DeviceExt;

        let params_buffer = shared
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("devla kernel params"),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params_buffer.as_entire_binding(),
        }];
        for (i, buffer) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = shared.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.layout,
            entries: &entries,
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(workgroups, 1, 1);
    }
}

fn workgroups_for(shared: &GpuShared, threads: usize) -> Result<u32> {
    let groups = threads.div_ceil(WORKGROUP_SIZE as usize);
    let max = shared.device.limits().max_compute_workgroups_per_dimension as usize;
    if groups > max {
        return Err(DevlaError::Kernel(format!(
            "{threads} elements need {groups} workgroups, device allows {max}"
        )));
    }
    Ok(groups as u32)
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| DevlaError::Kernel(format!("{what} ({value}) exceeds the u32 range")))
}

fn submit(shared: &GpuShared, encoder: wgpu::CommandEncoder) -> Result<()> {
    shared.queue.submit(std::iter::once(encoder.finish()));
    shared.wait()
}

fn encoder(shared: &GpuShared, label: &str) -> wgpu::CommandEncoder {
    shared
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
}

/// Dense BLAS execution context: pipelines are compiled once, here.
#[derive(Debug)]
pub(crate) struct WgpuDenseBlas {
    shared: Arc<GpuShared>,
    fill: Kernel,
    scal: Kernel,
    axpy: Kernel,
    dot_pass1: Kernel,
    dot_pass2: Kernel,
    gemv: Kernel,
}

impl WgpuDenseBlas {
    pub(crate) fn new(shared: Arc<GpuShared>) -> Self {
        let device = &shared.device;
        let fill = Kernel::compile(
            device,
            "fill",
            include_str!("./shaders/fill.wgsl"),
            &[Access::ReadWrite],
        );
        let scal = Kernel::compile(
            device,
            "scal",
            include_str!("./shaders/scal.wgsl"),
            &[Access::ReadWrite],
        );
        let axpy = Kernel::compile(
            device,
            "axpy",
            include_str!("./shaders/axpy.wgsl"),
            &[Access::Read, Access::ReadWrite],
        );
        let dot_pass1 = Kernel::compile(
            device,
            "dot pass 1",
            include_str!("./shaders/dot_pass1.wgsl"),
            &[Access::Read, Access::Read, Access::ReadWrite],
        );
        let dot_pass2 = Kernel::compile(
            device,
            "dot pass 2",
            include_str!("./shaders/dot_pass2.wgsl"),
            &[Access::Read, Access::ReadWrite],
        );
        let gemv = Kernel::compile(
            device,
            "gemv",
            include_str!("./shaders/gemv.wgsl"),
            &[Access::Read, Access::Read, Access::ReadWrite],
        );
        Self {
            shared,
            fill,
            scal,
            axpy,
            dot_pass1,
            dot_pass2,
            gemv,
        }
    }

    fn scratch(&self, label: &str, bytes: u64) -> wgpu::Buffer {
        self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes.max(8),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }
}

impl DenseBlas for WgpuDenseBlas {
    fn fill(&self, n: usize, value: f64, x: BufferId) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let params = KernelParams {
            alpha: value,
            n: to_u32(n, "fill length")?,
            ..Default::default()
        };
        let x = self.shared.buffer(x)?;
        let groups = workgroups_for(&self.shared, n)?;
        let mut encoder = encoder(&self.shared, "devla fill");
        self.fill
            .record(&self.shared, &mut encoder, &params, &[&x], groups);
        submit(&self.shared, encoder)
    }

    fn scal(&self, n: usize, alpha: f64, x: BufferId) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let params = KernelParams {
            alpha,
            n: to_u32(n, "scal length")?,
            ..Default::default()
        };
        let x = self.shared.buffer(x)?;
        let groups = workgroups_for(&self.shared, n)?;
        let mut encoder = encoder(&self.shared, "devla scal");
        self.scal
            .record(&self.shared, &mut encoder, &params, &[&x], groups);
        submit(&self.shared, encoder)
    }

    fn axpy(&self, n: usize, alpha: f64, x: BufferId, y: BufferId) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let params = KernelParams {
            alpha,
            n: to_u32(n, "axpy length")?,
            ..Default::default()
        };
        let x = self.shared.buffer(x)?;
        let y = self.shared.buffer(y)?;
        let groups = workgroups_for(&self.shared, n)?;
        let mut encoder = encoder(&self.shared, "devla axpy");
        self.axpy
            .record(&self.shared, &mut encoder, &params, &[&x, &y], groups);
        submit(&self.shared, encoder)
    }

    fn dot(&self, n: usize, x: BufferId, y: BufferId) -> Result<f64> {
        if n == 0 {
            return Ok(0.0);
        }
        let x = self.shared.buffer(x)?;
        let y = self.shared.buffer(y)?;
        let groups = workgroups_for(&self.shared, n)?;
        let partial_sums = self.scratch(
            "devla dot partial sums",
            groups as u64 * mem::size_of::<f64>() as u64,
        );
        let result = self.scratch("devla dot result", mem::size_of::<f64>() as u64);

        let mut encoder = encoder(&self.shared, "devla dot");
        let pass1 = KernelParams {
            n: to_u32(n, "dot length")?,
            ..Default::default()
        };
        self.dot_pass1.record(
            &self.shared,
            &mut encoder,
            &pass1,
            &[&x, &y, &partial_sums],
            groups,
        );
        let pass2 = KernelParams {
            n: groups,
            ..Default::default()
        };
        self.dot_pass2
            .record(&self.shared, &mut encoder, &pass2, &[&partial_sums, &result], 1);
        submit(&self.shared, encoder)?;

        let bytes = self
            .shared
            .read_bytes(&result, mem::size_of::<f64>() as u64)?;
        bytemuck::try_pod_read_unaligned::<f64>(&bytes)
            .map_err(|e| DevlaError::Internal(format!("Dot product readback: {e}")))
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
        let outputs = match trans {
            Transpose::NoTrans => m,
            Transpose::Trans => n,
        };
        if outputs == 0 {
            return Ok(());
        }
        let mut flags = 0;
        if trans == Transpose::Trans {
            flags |= FLAG_TRANSPOSE;
        }
        if beta != 0.0 {
            flags |= FLAG_BETA;
        }
        let params = KernelParams {
            alpha,
            beta,
            n: to_u32(n, "gemv columns")?,
            m: to_u32(m, "gemv rows")?,
            lda: to_u32(lda, "gemv leading dimension")?,
            flags,
        };
        let a = self.shared.buffer(a)?;
        let x = self.shared.buffer(x)?;
        let y = self.shared.buffer(y)?;
        let groups = workgroups_for(&self.shared, outputs)?;
        let mut encoder = encoder(&self.shared, "devla gemv");
        self.gemv
            .record(&self.shared, &mut encoder, &params, &[&a, &x, &y], groups);
        submit(&self.shared, encoder)
    }
}

/// Sparse BLAS execution context.
#[derive(Debug)]
pub(crate) struct WgpuSparseBlas {
    shared: Arc<GpuShared>,
    spmv: Kernel,
}

impl WgpuSparseBlas {
    pub(crate) fn new(shared: Arc<GpuShared>) -> Self {
        let spmv = Kernel::compile(
            &shared.device,
            "spmv csr",
            include_str!("./shaders/spmv_csr.wgsl"),
            &[
                Access::Read,
                Access::Read,
                Access::Read,
                Access::Read,
                Access::ReadWrite,
            ],
        );
        Self { shared, spmv }
    }
}

impl SparseBlas for WgpuSparseBlas {
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
        if a.rows == 0 {
            return Ok(());
        }
        let params = KernelParams {
            alpha,
            beta,
            n: to_u32(a.rows, "spmv rows")?,
            m: to_u32(a.cols, "spmv columns")?,
            lda: 0,
            flags: if beta != 0.0 { FLAG_BETA } else { 0 },
        };
        let row_offsets = self.shared.buffer(a.row_offsets)?;
        let col_indices = self.shared.buffer(a.col_indices)?;
        let values = self.shared.buffer(a.values)?;
        let xb = self.shared.buffer(x.buffer)?;
        let yb = self.shared.buffer(y.buffer)?;
        let groups = workgroups_for(&self.shared, a.rows)?;
        let mut encoder = encoder(&self.shared, "devla spmv");
        self.spmv.record(
            &self.shared,
            &mut encoder,
            &params,
            &[&row_offsets, &col_indices, &values, &xb, &yb],
            groups,
        );
        submit(&self.shared, encoder)
    }
}
