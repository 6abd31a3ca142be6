use crate::backend::BufferId;
use crate::context::AcceleratorContext;
use crate::error::{DevlaError, Result};
use bytemuck::{Pod, Zeroable};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

/// Element types that may live in device memory.
pub trait DeviceScalar: Pod + Zeroable + Debug + Send + Sync + 'static {}

impl DeviceScalar for f64 {}
impl DeviceScalar for u32 {}

/// Exclusive owner of one typed device allocation. The memory is returned to
/// the accelerator when the buffer is dropped.
#[derive(Debug)]
pub struct DeviceBuffer<T: DeviceScalar> {
    id: BufferId,
    len: usize,
    context: Arc<AcceleratorContext>,
    _marker: PhantomData<T>,
}

impl<T: DeviceScalar> DeviceBuffer<T> {
    /// Allocates room for `len` elements. Contents are unspecified.
    pub fn new(context: &Arc<AcceleratorContext>, len: usize) -> Result<Self> {
        let bytes = len * mem::size_of::<T>();
        let id = context.allocate(bytes)?;
        log::debug!(
            "Allocated device buffer #{} ({} x {})",
            id.raw(),
            len,
            std::any::type_name::<T>()
        );
        Ok(Self {
            id,
            len,
            context: Arc::clone(context),
            _marker: PhantomData,
        })
    }

    /// Allocates and uploads `data`.
    pub fn from_slice(context: &Arc<AcceleratorContext>, data: &[T]) -> Result<Self> {
        let buffer = Self::new(context, data.len())?;
        buffer.write(data)?;
        Ok(buffer)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * mem::size_of::<T>()
    }

    pub fn context(&self) -> &Arc<AcceleratorContext> {
        &self.context
    }

    /// Host to device copy of the whole buffer.
    pub fn write(&self, data: &[T]) -> Result<()> {
        if data.len() != self.len {
            return Err(DevlaError::dimension_mismatch(
                "device buffer write",
                self.len,
                data.len(),
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.context.upload(self.id, bytemuck::cast_slice(data))
    }

    /// Device to host copy of the whole buffer.
    pub fn read(&self, out: &mut [T]) -> Result<()> {
        if out.len() != self.len {
            return Err(DevlaError::dimension_mismatch(
                "device buffer read",
                self.len,
                out.len(),
            ));
        }
        if out.is_empty() {
            return Ok(());
        }
        self.context
            .download(self.id, bytemuck::cast_slice_mut(out))
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        self.read(&mut out)?;
        Ok(out)
    }

    /// Device to device copy from a buffer of the same length and context.
    pub fn copy_from(&self, other: &DeviceBuffer<T>) -> Result<()> {
        if !Arc::ptr_eq(&self.context, &other.context) {
            return Err(DevlaError::ContextMismatch);
        }
        if other.len != self.len {
            return Err(DevlaError::dimension_mismatch(
                "device buffer copy",
                self.len,
                other.len,
            ));
        }
        if self.len == 0 {
            return Ok(());
        }
        self.context
            .copy_on_device(other.id, self.id, self.size_bytes())
    }

    /// A new buffer holding a device-side copy of this one.
    pub fn try_clone(&self) -> Result<Self> {
        let copy = Self::new(&self.context, self.len)?;
        copy.copy_from(self)?;
        Ok(copy)
    }
}

impl<T: DeviceScalar> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        log::trace!("Releasing device buffer #{}", self.id.raw());
        self.context.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_release_on_drop() {
        let ctx = AcceleratorContext::emulated();
        {
            let buffer = DeviceBuffer::from_slice(&ctx, &[3u32, 1, 4, 1, 5]).unwrap();
            assert_eq!(buffer.len(), 5);
            assert_eq!(buffer.size_bytes(), 20);
            assert_eq!(buffer.to_vec().unwrap(), vec![3, 1, 4, 1, 5]);
            assert_eq!(ctx.live_allocations(), 1);
        }
        assert_eq!(ctx.live_allocations(), 0);
    }

    #[test]
    fn test_write_rejects_wrong_length() {
        let ctx = AcceleratorContext::emulated();
        let buffer = DeviceBuffer::<f64>::new(&ctx, 3).unwrap();
        assert!(matches!(
            buffer.write(&[1.0, 2.0]),
            Err(DevlaError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_copy_across_contexts_is_rejected() {
        let a = AcceleratorContext::emulated();
        let b = AcceleratorContext::emulated();
        let src = DeviceBuffer::from_slice(&a, &[1.0f64, 2.0]).unwrap();
        let dst = DeviceBuffer::<f64>::new(&b, 2).unwrap();
        assert!(matches!(
            dst.copy_from(&src),
            Err(DevlaError::ContextMismatch)
        ));
    }

    #[test]
    fn test_try_clone_copies_on_device() {
        let ctx = AcceleratorContext::emulated();
        let src = DeviceBuffer::from_slice(&ctx, &[1.5f64, -2.0]).unwrap();
        ctx.reset_transfer_stats();
        let copy = src.try_clone().unwrap();
        let stats = ctx.transfer_stats();
        assert_eq!(stats.device_copies, 1);
        assert_eq!(stats.uploads, 0);
        assert_eq!(copy.to_vec().unwrap(), vec![1.5, -2.0]);
    }
}
