//! Device matrix factory: maps a host matrix type to a constructor of its
//! device counterpart.

use crate::context::AcceleratorContext;
use crate::dev_matrix::{DenseDeviceMatrix, DeviceMatrix, EbeDeviceMatrix, SparseDeviceMatrix};
use crate::error::{DevlaError, Result};
use crate::dense_matrix::DenseMatrix;
use crate::ebe_matrix::ConstantElementByElementMatrix;
use crate::sparse_matrix::SparseMatrix;
use crate::traits::BaseMatrix;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Creator = Arc<
    dyn Fn(&dyn BaseMatrix, &Arc<AcceleratorContext>) -> Result<Box<dyn DeviceMatrix>>
        + Send
        + Sync,
>;

struct Entry {
    name: &'static str,
    creator: Creator,
}

/// Registry of device matrix constructors keyed by host matrix type.
pub struct DeviceMatrixFactory {
    entries: HashMap<TypeId, Entry>,
}

impl fmt::Debug for DeviceMatrixFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.values().map(|e| e.name))
            .finish()
    }
}

impl DeviceMatrixFactory {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The registry with the built-in sparse, dense and element-by-element
    /// conversions.
    pub fn with_builtins() -> Self {
        let mut factory = Self::empty();
        factory.register::<SparseMatrix, _>("sparse", |m, ctx| {
            Ok(Box::new(SparseDeviceMatrix::new(ctx, m)?))
        });
        factory.register::<DenseMatrix, _>("dense", |m, ctx| {
            Ok(Box::new(DenseDeviceMatrix::from_host(ctx, m)?))
        });
        factory.register::<ConstantElementByElementMatrix, _>("element-by-element", |m, ctx| {
            Ok(Box::new(EbeDeviceMatrix::new(ctx, m)?))
        });
        factory
    }

    /// Adds a conversion for `M`, replacing any previous one.
    pub fn register<M, F>(&mut self, name: &'static str, creator: F)
    where
        M: BaseMatrix,
        F: Fn(&M, &Arc<AcceleratorContext>) -> Result<Box<dyn DeviceMatrix>>
            + Send
            + Sync
            + 'static,
    {
        let erased: Creator = Arc::new(
            move |matrix: &dyn BaseMatrix, ctx: &Arc<AcceleratorContext>| {
                let typed = matrix.as_any().downcast_ref::<M>().ok_or_else(|| {
                    DevlaError::TypeMismatch {
                        expected: std::any::type_name::<M>(),
                        found: matrix.type_name().to_string(),
                    }
                })?;
                creator(typed, ctx)
            },
        );
        if self
            .entries
            .insert(TypeId::of::<M>(), Entry { name, creator: erased })
            .is_some()
        {
            log::debug!("Replaced device matrix conversion '{}'", name);
        } else {
            log::debug!("Registered device matrix conversion '{}'", name);
        }
    }

    pub fn is_registered<M: BaseMatrix>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<M>())
    }

    pub(crate) fn lookup(&self, matrix: &dyn BaseMatrix) -> Option<(&'static str, Creator)> {
        self.entries
            .get(&matrix.as_any().type_id())
            .map(|e| (e.name, Arc::clone(&e.creator)))
    }
}
