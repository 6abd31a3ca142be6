//! Element to degree-of-freedom tables, the only piece of a finite element
//! space the linear algebra needs.

use crate::error::{DevlaError, Result};

/// Maps each element to the global dofs it touches.
pub trait DofTable {
    /// Number of global degrees of freedom.
    fn ndof(&self) -> usize;

    fn num_elements(&self) -> usize;

    /// Global dof numbers of element `element`, in local order.
    fn element_dofs(&self, element: usize) -> &[usize];
}

/// A dof table stored as one flat array with per-element offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDofs {
    ndof: usize,
    offsets: Vec<usize>,
    dofs: Vec<usize>,
}

impl ElementDofs {
    pub fn new(ndof: usize, elements: &[Vec<usize>]) -> Result<Self> {
        let mut offsets = Vec::with_capacity(elements.len() + 1);
        offsets.push(0);
        let mut dofs = Vec::with_capacity(elements.iter().map(Vec::len).sum());
        for element in elements {
            if let Some(&bad) = element.iter().find(|&&d| d >= ndof) {
                return Err(DevlaError::IndexOutOfBounds {
                    index: bad,
                    len: ndof,
                });
            }
            dofs.extend_from_slice(element);
            offsets.push(dofs.len());
        }
        Ok(Self {
            ndof,
            offsets,
            dofs,
        })
    }

    /// Elements that all have `per_element` dofs, listed back to back.
    pub fn uniform(ndof: usize, per_element: usize, flat: &[usize]) -> Result<Self> {
        if per_element == 0 || flat.len() % per_element != 0 {
            return Err(DevlaError::InvalidDimensions(format!(
                "{} dofs cannot be split into elements of {}",
                flat.len(),
                per_element
            )));
        }
        let elements: Vec<Vec<usize>> = flat.chunks(per_element).map(<[usize]>::to_vec).collect();
        Self::new(ndof, &elements)
    }
}

impl DofTable for ElementDofs {
    fn ndof(&self) -> usize {
        self.ndof
    }

    fn num_elements(&self) -> usize {
        self.offsets.len() - 1
    }

    fn element_dofs(&self, element: usize) -> &[usize] {
        &self.dofs[self.offsets[element]..self.offsets[element + 1]]
    }
}
