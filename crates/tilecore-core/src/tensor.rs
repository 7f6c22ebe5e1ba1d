//! Main-memory tensors.
//!
//! A `DramTensor` is a dense row-major array owned by the caller for the
//! whole kernel invocation. Cores never resize it; the mover reads input
//! tensors and writes output tensors through the transfer engine.

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{checked_product, TileError};
use crate::precision::{Element, Precision};
use crate::Result;

/// A dense tensor resident in main memory.
///
/// Clones share storage, so a caller can hand a clone to a kernel and read
/// the results back through the original.
#[derive(Clone)]
pub struct DramTensor<T: Element> {
    dims: Vec<usize>,
    data: Arc<RwLock<Vec<T>>>,
}

impl<T: Element> DramTensor<T> {
    /// Wrap `data` as a tensor of the given shape.
    pub fn from_vec(dims: &[usize], data: Vec<T>) -> Result<Self> {
        let numel = checked_product("tensor shape", dims)?;
        if numel != data.len() {
            return Err(TileError::InvalidConfig(format!(
                "shape {:?} requires {} elements, got {}",
                dims,
                numel,
                data.len()
            )));
        }
        Ok(Self {
            dims: dims.to_vec(),
            data: Arc::new(RwLock::new(data)),
        })
    }

    /// Tensor of zeros.
    pub fn zeros(dims: &[usize]) -> Self {
        let numel = dims.iter().product();
        Self {
            dims: dims.to_vec(),
            data: Arc::new(RwLock::new(vec![T::default(); numel])),
        }
    }

    /// Convert f32 host data to the element type.
    pub fn from_f32(dims: &[usize], data: &[f32]) -> Result<Self> {
        Self::from_vec(dims, data.iter().map(|&x| T::from_f32(x)).collect())
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn precision(&self) -> Precision {
        T::PRECISION
    }

    /// Size of the tensor in main memory, in bytes.
    pub fn size_bytes(&self) -> usize {
        self.numel() * T::PRECISION.size_bytes()
    }

    /// Fail with [`TileError::ShapeMismatch`] unless the shape is `expected`.
    pub fn expect_dims(&self, name: &'static str, expected: &[usize]) -> Result<()> {
        if self.dims != expected {
            return Err(TileError::ShapeMismatch {
                tensor: name,
                expected: expected.to_vec(),
                got: self.dims.clone(),
            });
        }
        Ok(())
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Vec<T> {
        self.data.read().clone()
    }

    /// Copy the contents out, widened to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.read().iter().map(|&x| x.to_f32()).collect()
    }

    /// Raw little-endian bytes of the contents.
    pub fn to_bytes(&self) -> Vec<u8> {
        let data = self.data.read();
        bytemuck::cast_slice::<T, u8>(data.as_slice()).to_vec()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write()
    }
}

impl<T: Element> fmt::Debug for DramTensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DramTensor")
            .field("dims", &self.dims)
            .field("precision", &T::PRECISION)
            .finish()
    }
}
