//! Per-block key/value cache.
//!
//! Each block owns a key and a value tensor of shape `[seq_len, kv_dim]`,
//! allocated zero-filled on the model's device. The K/V projections write
//! straight into slot views, so no copy happens between the projection and
//! the cache. The decoder never resets the cache itself; positions are owned
//! by the caller.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::gpu_ops::WgpuContext;
use crate::tensor::{DType, Tensor};
use crate::traits::Device;

pub struct KvCache {
    layers: Vec<(Tensor, Tensor)>,
    seq_len: usize,
    kv_dim: usize,
}

impl KvCache {
    pub fn new(
        layer_num: usize,
        seq_len: usize,
        kv_dim: usize,
        device: Device,
        context: Option<&Arc<WgpuContext>>,
    ) -> EngineResult<Self> {
        let mut layers = Vec::with_capacity(layer_num);
        for _ in 0..layer_num {
            let key = Tensor::zeros(&[seq_len, kv_dim], DType::F32, device, context)?;
            let value = Tensor::zeros(&[seq_len, kv_dim], DType::F32, device, context)?;
            layers.push((key, value));
        }
        log::debug!(
            "kv cache: {layer_num} layers x [{seq_len}, {kv_dim}] on {device:?} ({:.2} MB)",
            (2 * layer_num * seq_len * kv_dim * 4) as f64 / 1_048_576.0
        );
        Ok(Self {
            layers,
            seq_len,
            kv_dim,
        })
    }

    pub fn layer_num(&self) -> usize {
        self.layers.len()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    fn layer(&self, layer: usize) -> EngineResult<&(Tensor, Tensor)> {
        self.layers.get(layer).ok_or_else(|| {
            EngineError::invalid_argument(
                "kv cache",
                "layer",
                format!("index {layer} out of bounds (layer_num={})", self.layers.len()),
            )
        })
    }

    /// Full `[seq_len, kv_dim]` key tensor of `layer`.
    pub fn key(&self, layer: usize) -> EngineResult<&Tensor> {
        Ok(&self.layer(layer)?.0)
    }

    pub fn value(&self, layer: usize) -> EngineResult<&Tensor> {
        Ok(&self.layer(layer)?.1)
    }

    /// Key and value views of positions `pos..pos + n` in `layer`.
    pub fn slot(&self, layer: usize, pos: usize, n: usize) -> EngineResult<(Tensor, Tensor)> {
        if n == 0 || pos + n > self.seq_len {
            return Err(EngineError::CacheOverflow {
                position: pos,
                tokens: n,
                capacity: self.seq_len,
            });
        }
        let (key, value) = self.layer(layer)?;
        let shape = [n, self.kv_dim];
        Ok((
            key.view(pos * self.kv_dim, &shape)?,
            value.view(pos * self.kv_dim, &shape)?,
        ))
    }

    /// Number of key rows in `layer` holding any non-zero element.
    /// Reads the cache back to the host.
    pub fn populated_slots(&self, layer: usize) -> EngineResult<usize> {
        let key = self.key(layer)?.to_vec_f32()?;
        Ok(key
            .chunks_exact(self.kv_dim)
            .filter(|row| row.iter().any(|&v| v != 0.0))
            .count())
    }

    /// Zeroes every slot of every block.
    pub fn clear(&self) -> EngineResult<()> {
        for (key, value) in &self.layers {
            key.fill_zero()?;
            value.fill_zero()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_a_view_of_the_block() {
        let cache = KvCache::new(2, 8, 4, Device::Cpu, None).unwrap();
        let (k, v) = cache.slot(1, 3, 2).unwrap();
        assert!(k.is_view());
        assert_eq!(k.shape(), &[2, 4]);
        assert_eq!(k.offset(), 12);
        assert!(k.shares_storage(cache.key(1).unwrap()));
        assert!(v.shares_storage(cache.value(1).unwrap()));
        assert!(!k.shares_storage(cache.key(0).unwrap()));
    }

    #[test]
    fn test_slot_overflow() {
        let cache = KvCache::new(1, 8, 4, Device::Cpu, None).unwrap();
        assert!(cache.slot(0, 7, 1).is_ok());
        match cache.slot(0, 7, 2) {
            Err(EngineError::CacheOverflow {
                position,
                tokens,
                capacity,
            }) => assert_eq!((position, tokens, capacity), (7, 2, 8)),
            _ => panic!("expected CacheOverflow"),
        }
    }

    #[test]
    fn test_bad_layer_index() {
        let cache = KvCache::new(1, 8, 4, Device::Cpu, None).unwrap();
        assert!(cache.key(1).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_populated_slots_and_clear() {
        let cache = KvCache::new(1, 8, 2, Device::Cpu, None).unwrap();
        assert_eq!(cache.populated_slots(0).unwrap(), 0);

        let (k, _) = cache.slot(0, 2, 2).unwrap();
        k.write_f32(&[1.0, 0.0, 0.0, -2.0]).unwrap();
        assert_eq!(cache.populated_slots(0).unwrap(), 2);

        cache.clear().unwrap();
        assert_eq!(cache.populated_slots(0).unwrap(), 0);
    }
}
