use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};

use crate::tensor::DType;

/// Host element buffer.
#[derive(Debug)]
pub enum CpuData {
    F32(Vec<f32>),
    U32(Vec<u32>),
}

impl CpuData {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => CpuData::F32(vec![0.0; len]),
            DType::U32 => CpuData::U32(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CpuData::F32(v) => v.len(),
            CpuData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            CpuData::F32(_) => DType::F32,
            CpuData::U32(_) => DType::U32,
        }
    }
}

/// Shared host storage behind CPU tensors and their views.
#[derive(Debug)]
pub struct CpuStorage {
    data: RwLock<CpuData>,
}

impl CpuStorage {
    pub fn new(data: CpuData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, CpuData>> {
        self.data
            .read()
            .map_err(|_| anyhow!("cpu tensor storage lock poisoned"))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, CpuData>> {
        self.data
            .write()
            .map_err(|_| anyhow!("cpu tensor storage lock poisoned"))
    }

    pub fn read_f32(&self, offset: usize, len: usize) -> Result<Vec<f32>> {
        match &*self.read()? {
            CpuData::F32(v) => Ok(v[offset..offset + len].to_vec()),
            CpuData::U32(_) => Err(anyhow!("expected f32 storage, found u32")),
        }
    }

    pub fn read_u32(&self, offset: usize, len: usize) -> Result<Vec<u32>> {
        match &*self.read()? {
            CpuData::U32(v) => Ok(v[offset..offset + len].to_vec()),
            CpuData::F32(_) => Err(anyhow!("expected u32 storage, found f32")),
        }
    }

    pub fn write_f32(&self, offset: usize, values: &[f32]) -> Result<()> {
        match &mut *self.write()? {
            CpuData::F32(v) => {
                v[offset..offset + values.len()].copy_from_slice(values);
                Ok(())
            }
            CpuData::U32(_) => Err(anyhow!("expected f32 storage, found u32")),
        }
    }

    pub fn write_u32(&self, offset: usize, values: &[u32]) -> Result<()> {
        match &mut *self.write()? {
            CpuData::U32(v) => {
                v[offset..offset + values.len()].copy_from_slice(values);
                Ok(())
            }
            CpuData::F32(_) => Err(anyhow!("expected u32 storage, found f32")),
        }
    }

    /// Runs `f` over an f32 window while holding the read lock.
    pub fn with_f32<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        match &*self.read()? {
            CpuData::F32(v) => Ok(f(&v[offset..offset + len])),
            CpuData::U32(_) => Err(anyhow!("expected f32 storage, found u32")),
        }
    }
}
