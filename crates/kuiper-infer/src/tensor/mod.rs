//! Device-resident tensors.
//!
//! A [`Tensor`] is a shape, a dtype and a handle to shared storage on either
//! the host or a wgpu device. Cloning a tensor clones the handle, never the
//! data. A view ([`Tensor::view`]) addresses a contiguous element window of
//! its parent's storage; scratch reuse and KV-cache slot addressing are both
//! expressed with views.
//!
//! ```text
//!   storage:  [ .............................................. ]
//!   parent:   [ offset=0, shape=[seq_len, kv_dim]               ]
//!   slot(p):            [ offset=p*kv_dim, shape=[n, kv_dim] ]
//! ```

use std::sync::Arc;

use anyhow::anyhow;
use ndarray::{ArrayD, IxDyn};

use crate::error::{EngineError, EngineResult};
use crate::gpu_ops::WgpuContext;
use crate::traits::Device;

pub mod cpu;
pub mod gpu;

pub use cpu::{CpuData, CpuStorage};
pub use gpu::GpuStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    U32,
}

impl DType {
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 | DType::U32 => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::U32 => "u32",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Storage {
    Cpu(Arc<CpuStorage>),
    Gpu(Arc<GpuStorage>),
}

#[derive(Debug, Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Vec<usize>,
    dtype: DType,
    offset: usize,
    is_view: bool,
}

fn check_shape(shape: &[usize]) -> EngineResult<usize> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(EngineError::invalid_argument(
            "tensor",
            "shape",
            format!("{shape:?} must be non-empty with positive dimensions"),
        ));
    }
    Ok(shape.iter().product())
}

impl Tensor {
    fn owning(storage: Storage, shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            storage,
            shape,
            dtype,
            offset: 0,
            is_view: false,
        }
    }

    /// Zero-filled tensor on `device`. GPU tensors need a context.
    pub fn zeros(
        shape: &[usize],
        dtype: DType,
        device: Device,
        context: Option<&Arc<WgpuContext>>,
    ) -> EngineResult<Self> {
        let len = check_shape(shape)?;
        let storage = match device {
            Device::Cpu => Storage::Cpu(Arc::new(CpuStorage::new(CpuData::zeros(dtype, len)))),
            Device::Wgpu => {
                let context = context.ok_or_else(|| {
                    EngineError::DeviceUnavailable("gpu tensor requested without a context".into())
                })?;
                Storage::Gpu(Arc::new(GpuStorage::zeros(context, len, "tensor")))
            }
        };
        Ok(Self::owning(storage, shape.to_vec(), dtype))
    }

    pub fn from_vec_f32(shape: &[usize], data: Vec<f32>) -> EngineResult<Self> {
        let len = check_shape(shape)?;
        if data.len() != len {
            return Err(EngineError::invalid_argument(
                "tensor",
                "data",
                format!("has {} elements but shape {shape:?} needs {len}", data.len()),
            ));
        }
        let storage = Storage::Cpu(Arc::new(CpuStorage::new(CpuData::F32(data))));
        Ok(Self::owning(storage, shape.to_vec(), DType::F32))
    }

    pub fn from_vec_u32(shape: &[usize], data: Vec<u32>) -> EngineResult<Self> {
        let len = check_shape(shape)?;
        if data.len() != len {
            return Err(EngineError::invalid_argument(
                "tensor",
                "data",
                format!("has {} elements but shape {shape:?} needs {len}", data.len()),
            ));
        }
        let storage = Storage::Cpu(Arc::new(CpuStorage::new(CpuData::U32(data))));
        Ok(Self::owning(storage, shape.to_vec(), DType::U32))
    }

    pub fn from_ndarray<D: ndarray::Dimension>(
        array: &ndarray::Array<f32, D>,
    ) -> EngineResult<Self> {
        let data = array.as_standard_layout().iter().copied().collect();
        Self::from_vec_f32(array.shape(), data)
    }

    /// Host-resident `u32` scalar, the form of the position tensor.
    pub fn scalar_u32(value: u32) -> Self {
        let storage = Storage::Cpu(Arc::new(CpuStorage::new(CpuData::U32(vec![value]))));
        Self::owning(storage, vec![1], DType::U32)
    }

    /// Copies this tensor into a new owning tensor on `device`.
    pub fn to_device(
        &self,
        device: Device,
        context: Option<&Arc<WgpuContext>>,
    ) -> EngineResult<Self> {
        match device {
            Device::Cpu => {
                let data = match self.dtype {
                    DType::F32 => CpuData::F32(self.to_vec_f32()?),
                    DType::U32 => CpuData::U32(self.to_vec_u32()?),
                };
                let storage = Storage::Cpu(Arc::new(CpuStorage::new(data)));
                Ok(Self::owning(storage, self.shape.clone(), self.dtype))
            }
            Device::Wgpu => {
                let context = context.ok_or_else(|| {
                    EngineError::DeviceUnavailable("gpu transfer requested without a context".into())
                })?;
                let storage = match self.dtype {
                    DType::F32 => GpuStorage::from_slice(context, &self.to_vec_f32()?, "tensor"),
                    DType::U32 => GpuStorage::from_slice(context, &self.to_vec_u32()?, "tensor"),
                };
                Ok(Self::owning(
                    Storage::Gpu(Arc::new(storage)),
                    self.shape.clone(),
                    self.dtype,
                ))
            }
        }
    }

    /// Non-owning view of `shape` starting `offset` elements into this tensor.
    pub fn view(&self, offset: usize, shape: &[usize]) -> EngineResult<Self> {
        let len = check_shape(shape)?;
        if offset + len > self.num_elements() {
            return Err(EngineError::invalid_argument(
                "tensor",
                "view",
                format!(
                    "[{offset}, {}) exceeds parent of {} elements",
                    offset + len,
                    self.num_elements()
                ),
            ));
        }
        Ok(Self {
            storage: self.storage.clone(),
            shape: shape.to_vec(),
            dtype: self.dtype,
            offset: self.offset + offset,
            is_view: true,
        })
    }

    /// View over the first `n` rows along dimension 0.
    pub fn rows(&self, n: usize) -> EngineResult<Self> {
        let mut shape = self.shape.clone();
        shape[0] = n;
        self.view(0, &shape)
    }

    /// Same elements, different shape.
    pub fn reshape(&self, shape: &[usize]) -> EngineResult<Self> {
        let len = check_shape(shape)?;
        if len != self.num_elements() {
            return Err(EngineError::invalid_argument(
                "tensor",
                "reshape",
                format!("cannot view {:?} as {shape:?}", self.shape),
            ));
        }
        self.view(0, shape)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Size of dimension `i`; negative indices count from the end.
    pub fn dim(&self, i: isize) -> usize {
        let idx = if i < 0 { self.rank() as isize + i } else { i };
        self.shape[idx as usize]
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        match self.storage {
            Storage::Cpu(_) => Device::Cpu,
            Storage::Gpu(_) => Device::Wgpu,
        }
    }

    /// Element offset into the shared storage.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_view(&self) -> bool {
        self.is_view
    }

    pub fn shares_storage(&self, other: &Tensor) -> bool {
        match (&self.storage, &other.storage) {
            (Storage::Cpu(a), Storage::Cpu(b)) => Arc::ptr_eq(a, b),
            (Storage::Gpu(a), Storage::Gpu(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Same storage, same element window.
    pub fn same_view(&self, other: &Tensor) -> bool {
        self.shares_storage(other)
            && self.offset == other.offset
            && self.num_elements() == other.num_elements()
    }

    pub fn gpu_storage(&self) -> Option<&Arc<GpuStorage>> {
        match &self.storage {
            Storage::Gpu(s) => Some(s),
            Storage::Cpu(_) => None,
        }
    }

    pub fn cpu_storage(&self) -> Option<&Arc<CpuStorage>> {
        match &self.storage {
            Storage::Cpu(s) => Some(s),
            Storage::Gpu(_) => None,
        }
    }

    /// The wgpu context owning this tensor, if it is GPU-resident.
    pub fn context(&self) -> Option<&Arc<WgpuContext>> {
        self.gpu_storage().map(|s| s.context())
    }

    fn expect_dtype(&self, dtype: DType) -> EngineResult<()> {
        if self.dtype != dtype {
            return Err(EngineError::invalid_argument(
                "tensor",
                "data",
                format!("has dtype {} but {} was requested", self.dtype.as_str(), dtype.as_str()),
            ));
        }
        Ok(())
    }

    /// Host copy of the elements. Synchronises with the GPU queue.
    pub fn to_vec_f32(&self) -> EngineResult<Vec<f32>> {
        self.expect_dtype(DType::F32)?;
        let len = self.num_elements();
        Ok(match &self.storage {
            Storage::Cpu(s) => s.read_f32(self.offset, len)?,
            Storage::Gpu(s) => s.read::<f32>(self.offset, len)?,
        })
    }

    pub fn to_vec_u32(&self) -> EngineResult<Vec<u32>> {
        self.expect_dtype(DType::U32)?;
        let len = self.num_elements();
        Ok(match &self.storage {
            Storage::Cpu(s) => s.read_u32(self.offset, len)?,
            Storage::Gpu(s) => s.read::<u32>(self.offset, len)?,
        })
    }

    pub fn to_ndarray(&self) -> EngineResult<ArrayD<f32>> {
        let data = self.to_vec_f32()?;
        ArrayD::from_shape_vec(IxDyn(&self.shape), data)
            .map_err(|e| EngineError::Internal(anyhow!(e)))
    }

    fn expect_len(&self, len: usize) -> EngineResult<()> {
        if len != self.num_elements() {
            return Err(EngineError::invalid_argument(
                "tensor",
                "data",
                format!("write of {len} elements into {:?}", self.shape),
            ));
        }
        Ok(())
    }

    /// Overwrites every element. Queue-ordered on the GPU.
    pub fn write_f32(&self, data: &[f32]) -> EngineResult<()> {
        self.expect_dtype(DType::F32)?;
        self.expect_len(data.len())?;
        match &self.storage {
            Storage::Cpu(s) => s.write_f32(self.offset, data)?,
            Storage::Gpu(s) => s.write(self.offset, data),
        }
        Ok(())
    }

    pub fn write_u32(&self, data: &[u32]) -> EngineResult<()> {
        self.expect_dtype(DType::U32)?;
        self.expect_len(data.len())?;
        match &self.storage {
            Storage::Cpu(s) => s.write_u32(self.offset, data)?,
            Storage::Gpu(s) => s.write(self.offset, data),
        }
        Ok(())
    }

    pub fn fill_zero(&self) -> EngineResult<()> {
        match self.dtype {
            DType::F32 => self.write_f32(&vec![0.0; self.num_elements()]),
            DType::U32 => self.write_u32(&vec![0; self.num_elements()]),
        }
    }

    /// Runs `f` over the host elements without copying. CPU tensors only.
    pub(crate) fn with_f32<R>(&self, f: impl FnOnce(&[f32]) -> R) -> EngineResult<R> {
        self.expect_dtype(DType::F32)?;
        match &self.storage {
            Storage::Cpu(s) => Ok(s.with_f32(self.offset, self.num_elements(), f)?),
            Storage::Gpu(_) => Err(EngineError::Internal(anyhow!(
                "host access to a gpu tensor; use to_vec_f32"
            ))),
        }
    }
}
