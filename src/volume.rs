use anyhow::Result;
use ndarray::{Array3, ArrayBase, ArrayView3, Data, Ix3};
use std::{
    fmt::{self, Debug},
    ops::{Deref, DerefMut},
};

/// Per shape buffer reuse.
pub mod pool;

/// The shape of `array` as `[x, y, z]`.
pub fn dim3<S: Data>(array: &ArrayBase<S, Ix3>) -> [usize; 3] {
    let (x, y, z) = array.dim();
    [x, y, z]
}

/// A dense 3-D volume of `f32` ("cube").
///
/// Buffers come from a process wide [pool] keyed by shape and go back to it when the
/// volume is dropped, so passes that repeatedly create volumes of the same shapes
/// do not hit the allocator.
///
/// Volumes deref to [`Array3<f32>`] for reading and writing.
pub struct Volume {
    array: Array3<f32>,
}

impl Volume {
    /// A volume of `shape` with unspecified contents.
    ///
    /// The buffer may hold stale data from a previous owner, callers must overwrite it.
    ///
    /// **Errors**
    ///
    /// Returns [`Error::OutOfMemory`](crate::Error::OutOfMemory) if the buffer could not be allocated.
    pub fn new(shape: [usize; 3]) -> Result<Self> {
        let data = pool::acquire(shape)?;
        Ok(Self {
            array: Array3::from_shape_vec(shape, data)?,
        })
    }
    /// A volume of `shape` filled with `elem`.
    pub fn from_elem(shape: [usize; 3], elem: f32) -> Result<Self> {
        let mut volume = Self::new(shape)?;
        volume.array.fill(elem);
        Ok(volume)
    }
    /// A volume of `shape` filled with zeros.
    pub fn zeros(shape: [usize; 3]) -> Result<Self> {
        Self::from_elem(shape, 0.)
    }
    /// Copies `array` into a pooled volume.
    pub fn from_array(array: ArrayView3<f32>) -> Result<Self> {
        let mut volume = Self::new(dim3(&array))?;
        volume.array.assign(&array);
        Ok(volume)
    }
    /// Copies the volume.
    pub fn try_clone(&self) -> Result<Self> {
        Self::from_array(self.array.view())
    }
    /// The shape.
    pub fn shape3(&self) -> [usize; 3] {
        dim3(&self.array)
    }
    /// Detaches the buffer from the pool.
    pub fn into_array(mut self) -> Array3<f32> {
        std::mem::take(&mut self.array)
    }
}

impl Deref for Volume {
    type Target = Array3<f32>;
    fn deref(&self) -> &Array3<f32> {
        &self.array
    }
}

impl DerefMut for Volume {
    fn deref_mut(&mut self) -> &mut Array3<f32> {
        &mut self.array
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        let shape = self.shape3();
        let array = std::mem::take(&mut self.array);
        if array.is_standard_layout() {
            pool::release(shape, array.into_raw_vec());
        }
    }
}

impl Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Volume")
            .field("shape", &self.shape3())
            .finish_non_exhaustive()
    }
}
