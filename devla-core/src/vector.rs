use crate::backend::DenseVecDescriptor;
use crate::buffer::DeviceBuffer;
use crate::context::AcceleratorContext;
use crate::error::{DevlaError, Result};
use crate::traits::{BaseVector, HostView, HostViewMut, Residency};
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::sync::Arc;

/// Which copies of a [`UnifiedVector`] hold the current values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coherence {
    /// Freshly allocated, neither copy has been written.
    Uninitialized,
    /// Last written on the host.
    HostOwned,
    /// Last written on the device.
    DeviceOwned,
    /// Both copies agree.
    Synchronized,
}

impl Coherence {
    pub fn host_fresh(self) -> bool {
        matches!(self, Coherence::HostOwned | Coherence::Synchronized)
    }

    pub fn device_fresh(self) -> bool {
        matches!(self, Coherence::DeviceOwned | Coherence::Synchronized)
    }
}

impl fmt::Display for Coherence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host {}, device {}",
            if self.host_fresh() { "fresh" } else { "stale" },
            if self.device_fresh() { "fresh" } else { "stale" }
        )
    }
}

/// A vector with a host copy and a device copy of its values.
///
/// Each operation makes sure the copy it needs is current, runs there, and
/// marks the other copy stale. Copies between the two happen lazily and at
/// most once per change. Reading a vector that was never written is an
/// [`DevlaError::UndefinedState`] error.
pub struct UnifiedVector {
    size: usize,
    host: RefCell<Vec<f64>>,
    device: DeviceBuffer<f64>,
    state: Cell<Coherence>,
}

impl UnifiedVector {
    /// Allocates both copies; neither holds defined values yet.
    pub fn new(context: &Arc<AcceleratorContext>, size: usize) -> Result<Self> {
        let device = DeviceBuffer::new(context, size)?;
        Ok(Self {
            size,
            host: RefCell::new(vec![0.0; size]),
            device,
            state: Cell::new(Coherence::Uninitialized),
        })
    }

    pub fn from_slice(context: &Arc<AcceleratorContext>, data: &[f64]) -> Result<Self> {
        let vector = Self::new(context, data.len())?;
        vector.host.borrow_mut().copy_from_slice(data);
        vector.state.set(Coherence::HostOwned);
        Ok(vector)
    }

    /// A new vector holding a copy of `other`, of any kind.
    pub fn from_vector(context: &Arc<AcceleratorContext>, other: &dyn BaseVector) -> Result<Self> {
        let mut vector = Self::new(context, other.len())?;
        vector.assign(other)?;
        Ok(vector)
    }

    pub fn context(&self) -> &Arc<AcceleratorContext> {
        self.device.context()
    }

    pub fn status(&self) -> Coherence {
        self.state.get()
    }

    /// The device copy as seen by the sparse runtime.
    pub fn descriptor(&self) -> DenseVecDescriptor {
        DenseVecDescriptor {
            buffer: self.device.id(),
            len: self.size,
        }
    }

    pub(crate) fn device_buffer(&self) -> &DeviceBuffer<f64> {
        &self.device
    }

    /// Records that a kernel has written the device copy.
    pub(crate) fn mark_device_written(&mut self) {
        self.state.set(Coherence::DeviceOwned);
    }

    fn undefined(&self, operation: &str) -> DevlaError {
        log::error!(
            "{} on a vector of size {} whose host and device copies are both stale",
            operation,
            self.size
        );
        DevlaError::UndefinedState(format!(
            "{operation}: neither host nor device copy is valid"
        ))
    }

    /// Makes the host copy current. Downloads at most once.
    pub fn update_host(&self) -> Result<()> {
        match self.state.get() {
            Coherence::HostOwned | Coherence::Synchronized => Ok(()),
            Coherence::DeviceOwned => {
                let mut host = self.host.try_borrow_mut().map_err(|_| {
                    DevlaError::Internal("host copy is borrowed during update_host".to_string())
                })?;
                self.device.read(&mut host)?;
                self.state.set(Coherence::Synchronized);
                Ok(())
            }
            Coherence::Uninitialized => Err(self.undefined("update_host")),
        }
    }

    /// Makes the device copy current. Uploads at most once.
    pub fn update_device(&self) -> Result<()> {
        match self.state.get() {
            Coherence::DeviceOwned | Coherence::Synchronized => Ok(()),
            Coherence::HostOwned => {
                let host = self.host.try_borrow().map_err(|_| {
                    DevlaError::Internal("host copy is borrowed during update_device".to_string())
                })?;
                self.device.write(&host)?;
                self.state.set(Coherence::Synchronized);
                Ok(())
            }
            Coherence::Uninitialized => Err(self.undefined("update_device")),
        }
    }

    fn check_len(&self, what: &str, other: &dyn BaseVector) -> Result<()> {
        if other.len() != self.size {
            return Err(DevlaError::dimension_mismatch(what, self.size, other.len()));
        }
        Ok(())
    }

    fn check_context(&self, other: &UnifiedVector) -> Result<()> {
        if !Arc::ptr_eq(self.context(), other.context()) {
            return Err(DevlaError::ContextMismatch);
        }
        Ok(())
    }
}

impl BaseVector for UnifiedVector {
    fn len(&self) -> usize {
        self.size
    }

    fn residency(&self) -> Residency {
        Residency::Unified
    }

    fn as_unified(&self) -> Option<&UnifiedVector> {
        Some(self)
    }

    fn as_unified_mut(&mut self) -> Option<&mut UnifiedVector> {
        Some(self)
    }

    fn host_values(&self) -> Result<HostView<'_>> {
        self.update_host()?;
        let host = self.host.try_borrow().map_err(|_| {
            DevlaError::Internal("host copy is mutably borrowed".to_string())
        })?;
        Ok(HostView::Cached(Ref::map(host, |v| v.as_slice())))
    }

    fn host_values_mut(&mut self) -> Result<HostViewMut<'_>> {
        self.update_host()?;
        self.state.set(Coherence::HostOwned);
        Ok(HostViewMut::Borrowed(self.host.get_mut().as_mut_slice()))
    }

    fn host_values_write_only(&mut self) -> Result<HostViewMut<'_>> {
        self.state.set(Coherence::HostOwned);
        Ok(HostViewMut::Borrowed(self.host.get_mut().as_mut_slice()))
    }

    fn get(&self, index: usize) -> Result<f64> {
        if index >= self.size {
            return Err(DevlaError::IndexOutOfBounds {
                index,
                len: self.size,
            });
        }
        self.update_host()?;
        Ok(self.host.borrow()[index])
    }

    fn set(&mut self, index: usize, value: f64) -> Result<()> {
        if index >= self.size {
            return Err(DevlaError::IndexOutOfBounds {
                index,
                len: self.size,
            });
        }
        self.update_host()?;
        self.host.get_mut()[index] = value;
        self.state.set(Coherence::HostOwned);
        Ok(())
    }

    fn assign(&mut self, other: &dyn BaseVector) -> Result<()> {
        self.check_len("assign operand length", other)?;
        if let Some(unified) = other.as_unified() {
            let state = unified.status();
            if state == Coherence::Uninitialized {
                return Err(unified.undefined("assign"));
            }
            if state.device_fresh() && Arc::ptr_eq(self.context(), unified.context()) {
                self.device.copy_from(&unified.device)?;
                self.state.set(Coherence::DeviceOwned);
                return Ok(());
            }
        }
        let values = other.host_values()?;
        self.host.get_mut().copy_from_slice(&values);
        self.state.set(Coherence::HostOwned);
        Ok(())
    }

    fn set_scalar(&mut self, value: f64) -> Result<()> {
        self.context()
            .dense_blas()?
            .fill(self.size, value, self.device.id())?;
        self.state.set(Coherence::DeviceOwned);
        Ok(())
    }

    fn scale(&mut self, factor: f64) -> Result<()> {
        self.update_device()?;
        self.context()
            .dense_blas()?
            .scal(self.size, factor, self.device.id())?;
        self.state.set(Coherence::DeviceOwned);
        Ok(())
    }

    fn add_scaled(&mut self, factor: f64, other: &dyn BaseVector) -> Result<()> {
        self.check_len("add_scaled operand length", other)?;
        match other.as_unified() {
            Some(unified) => {
                self.check_context(unified)?;
                self.update_device()?;
                unified.update_device()?;
                self.context().dense_blas()?.axpy(
                    self.size,
                    factor,
                    unified.device.id(),
                    self.device.id(),
                )?;
                self.state.set(Coherence::DeviceOwned);
            }
            None => {
                let values = other.host_values()?;
                let mut host = self.host_values_mut()?;
                for (h, v) in host.iter_mut().zip(values.iter()) {
                    *h += factor * v;
                }
            }
        }
        Ok(())
    }

    fn inner_product(&self, other: &dyn BaseVector, conjugate: bool) -> Result<f64> {
        if conjugate {
            return Err(DevlaError::not_implemented(
                "conjugated inner product of a unified vector",
            ));
        }
        self.check_len("inner_product operand length", other)?;
        match other.as_unified() {
            Some(unified) => {
                self.check_context(unified)?;
                self.update_device()?;
                unified.update_device()?;
                self.context()
                    .dense_blas()?
                    .dot(self.size, self.device.id(), unified.device.id())
            }
            None => {
                let mine = self.host_values()?;
                let theirs = other.host_values()?;
                Ok(mine.iter().zip(theirs.iter()).map(|(a, b)| a * b).sum())
            }
        }
    }

    fn create_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(UnifiedVector::new(self.context(), self.size)?))
    }
}

impl fmt::Debug for UnifiedVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedVector")
            .field("size", &self.size)
            .field("state", &self.state.get())
            .field("device_buffer", &self.device.id())
            .finish()
    }
}

impl fmt::Display for UnifiedVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.get();
        writeln!(f, "UnifiedVector of size {} ({})", self.size, state)?;
        let values = if state.host_fresh() {
            match self.host.try_borrow() {
                Ok(host) => host.clone(),
                Err(_) => return writeln!(f, "<host copy busy>"),
            }
        } else if state.device_fresh() {
            match self.device.to_vec() {
                Ok(values) => values,
                Err(e) => return writeln!(f, "<device read failed: {e}>"),
            }
        } else {
            return writeln!(f, "undefined vector");
        };
        for (i, v) in values.iter().enumerate() {
            writeln!(f, "{i:>6}: {v}")?;
        }
        Ok(())
    }
}

/// A plain host vector, the counterpart used where no accelerator is involved.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostVector {
    values: Vec<f64>,
}

impl HostVector {
    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
        }
    }

    pub fn from_vec(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.values
    }

    fn check_len(&self, what: &str, other: &dyn BaseVector) -> Result<()> {
        if other.len() != self.values.len() {
            return Err(DevlaError::dimension_mismatch(
                what,
                self.values.len(),
                other.len(),
            ));
        }
        Ok(())
    }
}

impl From<Vec<f64>> for HostVector {
    fn from(values: Vec<f64>) -> Self {
        Self::from_vec(values)
    }
}

impl BaseVector for HostVector {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn residency(&self) -> Residency {
        Residency::Host
    }

    fn host_values(&self) -> Result<HostView<'_>> {
        Ok(HostView::Borrowed(&self.values))
    }

    fn host_values_mut(&mut self) -> Result<HostViewMut<'_>> {
        Ok(HostViewMut::Borrowed(&mut self.values))
    }

    fn get(&self, index: usize) -> Result<f64> {
        self.values
            .get(index)
            .copied()
            .ok_or(DevlaError::IndexOutOfBounds {
                index,
                len: self.values.len(),
            })
    }

    fn set(&mut self, index: usize, value: f64) -> Result<()> {
        let len = self.values.len();
        let slot = self
            .values
            .get_mut(index)
            .ok_or(DevlaError::IndexOutOfBounds { index, len })?;
        *slot = value;
        Ok(())
    }

    fn assign(&mut self, other: &dyn BaseVector) -> Result<()> {
        self.check_len("assign operand length", other)?;
        self.values.copy_from_slice(&other.host_values()?);
        Ok(())
    }

    fn set_scalar(&mut self, value: f64) -> Result<()> {
        self.values.fill(value);
        Ok(())
    }

    fn scale(&mut self, factor: f64) -> Result<()> {
        self.values.iter_mut().for_each(|v| *v *= factor);
        Ok(())
    }

    fn add_scaled(&mut self, factor: f64, other: &dyn BaseVector) -> Result<()> {
        self.check_len("add_scaled operand length", other)?;
        let theirs = other.host_values()?;
        for (v, o) in self.values.iter_mut().zip(theirs.iter()) {
            *v += factor * o;
        }
        Ok(())
    }

    /// Conjugation is the identity on real values, so `conjugate` has no
    /// effect here.
    fn inner_product(&self, other: &dyn BaseVector, _conjugate: bool) -> Result<f64> {
        self.check_len("inner_product operand length", other)?;
        let theirs = other.host_values()?;
        Ok(self.values.iter().zip(theirs.iter()).map(|(a, b)| a * b).sum())
    }

    fn create_vector(&self) -> Result<Box<dyn BaseVector>> {
        Ok(Box::new(HostVector::zeros(self.values.len())))
    }
}

impl fmt::Display for HostVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HostVector of size {}", self.values.len())?;
        for (i, v) in self.values.iter().enumerate() {
            writeln!(f, "{i:>6}: {v}")?;
        }
        Ok(())
    }
}
