//! The abstract vector and matrix contract shared by host and device types.
//!
//! Solvers and other consumers only ever see `&dyn BaseMatrix` and
//! `&mut dyn BaseVector`. Where a device implementation needs to know whether
//! an operand is one of its own kind it asks [`BaseVector::as_unified`]
//! instead of downcasting.

use crate::context::AcceleratorContext;
use crate::dev_matrix::DeviceMatrix;
use crate::error::{DevlaError, Result};
use crate::vector::UnifiedVector;
use std::any::Any;
use std::cell::{Ref, RefMut};
use std::fmt::{self, Debug, Display};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Where the authoritative data of a vector or matrix lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    /// Plain host memory only.
    Host,
    /// Host copy plus accelerator copy, synchronized lazily.
    Unified,
    /// Accelerator memory only.
    Device,
}

impl Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::Host => write!(f, "host"),
            Residency::Unified => write!(f, "unified"),
            Residency::Device => write!(f, "device"),
        }
    }
}

/// Read access to the host values of a vector.
pub enum HostView<'a> {
    Borrowed(&'a [f64]),
    Cached(Ref<'a, [f64]>),
}

impl Deref for HostView<'_> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        match self {
            HostView::Borrowed(values) => values,
            HostView::Cached(values) => values,
        }
    }
}

/// Write access to the host values of a vector.
pub enum HostViewMut<'a> {
    Borrowed(&'a mut [f64]),
    Cached(RefMut<'a, [f64]>),
}

impl Deref for HostViewMut<'_> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        match self {
            HostViewMut::Borrowed(values) => values,
            HostViewMut::Cached(values) => values,
        }
    }
}

impl DerefMut for HostViewMut<'_> {
    fn deref_mut(&mut self) -> &mut [f64] {
        match self {
            HostViewMut::Borrowed(values) => values,
            HostViewMut::Cached(values) => values,
        }
    }
}

/// A real vector of `f64`.
///
/// Every operation that takes another vector checks the lengths first and
/// leaves `self` untouched when they differ.
pub trait BaseVector: Debug + Display {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn residency(&self) -> Residency;

    fn as_unified(&self) -> Option<&UnifiedVector> {
        None
    }

    fn as_unified_mut(&mut self) -> Option<&mut UnifiedVector> {
        None
    }

    /// Up-to-date host values.
    fn host_values(&self) -> Result<HostView<'_>>;

    /// Host values for writing; any other copy of the data becomes stale.
    fn host_values_mut(&mut self) -> Result<HostViewMut<'_>>;

    /// Host storage the caller is about to overwrite completely. The current
    /// contents are unspecified and never read, so an undefined vector is fine.
    fn host_values_write_only(&mut self) -> Result<HostViewMut<'_>> {
        self.host_values_mut()
    }

    fn get(&self, index: usize) -> Result<f64>;

    fn set(&mut self, index: usize, value: f64) -> Result<()>;

    /// `self := other`
    fn assign(&mut self, other: &dyn BaseVector) -> Result<()>;

    /// Every entry becomes `value`.
    fn set_scalar(&mut self, value: f64) -> Result<()>;

    /// `self := factor * self`
    fn scale(&mut self, factor: f64) -> Result<()>;

    /// `self := self + factor * other`
    fn add_scaled(&mut self, factor: f64, other: &dyn BaseVector) -> Result<()>;

    /// `self := factor * other`
    fn set_scaled(&mut self, factor: f64, other: &dyn BaseVector) -> Result<()> {
        if other.len() != self.len() {
            return Err(DevlaError::dimension_mismatch(
                "set_scaled operand length",
                self.len(),
                other.len(),
            ));
        }
        self.set_scalar(0.0)?;
        self.add_scaled(factor, other)
    }

    /// `sum(self[i] * other[i])`. Conjugated products are not supported.
    fn inner_product(&self, other: &dyn BaseVector, conjugate: bool) -> Result<f64>;

    /// A new vector of the same kind and length. Contents are unspecified.
    fn create_vector(&self) -> Result<Box<dyn BaseVector>>;

    fn to_vec(&self) -> Result<Vec<f64>> {
        Ok(self.host_values()?.to_vec())
    }
}

/// A linear operator `y = A x` of `height x width`.
pub trait BaseMatrix: Debug + Any {
    fn height(&self) -> usize;

    fn width(&self) -> usize;

    fn residency(&self) -> Residency;

    /// `y := A x`
    fn mult(&self, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()>;

    /// `y := s * y + A x`
    fn mult_add(&self, s: f64, x: &dyn BaseVector, y: &mut dyn BaseVector) -> Result<()>;

    /// A vector of length `width`, suitable as `x`.
    fn create_row_vector(&self) -> Result<Box<dyn BaseVector>>;

    /// A vector of length `height`, suitable as `y`.
    fn create_col_vector(&self) -> Result<Box<dyn BaseVector>>;

    /// Builds this matrix's own device representation, if it knows how to.
    /// `None` leaves the decision to the context's factory registry.
    fn create_device_matrix(
        &self,
        _ctx: &Arc<AcceleratorContext>,
    ) -> Option<Result<Box<dyn DeviceMatrix>>> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
