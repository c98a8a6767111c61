//! Causal multi-head attention over a block's KV cache, with grouped-query
//! sharing of key/value heads.
//!
//! Inputs: `[query, pos, key_cache, value_cache]`, outputs `[out, score]`.
//!
//! Query head `h` reads kv head `h / (head_num / kv_head_num)`. Row `i` of a
//! call sits at position `pos + i` and attends to cache slots `0..=pos + i`;
//! slots after that are never read, whatever they hold. `score` is a
//! `[head_num, seq_len]` scratch that is left holding the last row's
//! attention probabilities (zero beyond the visible slots).

use crate::error::EngineResult;
use crate::kernels::{KernelRegistry, OpKind, OpParams};
use crate::layer::{delegate_layer_base, LayerBase};
use crate::tensor::DType;
use crate::traits::{Device, Layer, LayerIo};

pub struct MultiHeadAttention {
    base: LayerBase,
    head_num: usize,
    kv_head_num: usize,
    head_size: usize,
}

impl MultiHeadAttention {
    pub fn new(
        device: Device,
        registry: &KernelRegistry,
        head_num: usize,
        kv_head_num: usize,
        head_size: usize,
    ) -> EngineResult<Self> {
        let base = LayerBase::new("mha", OpKind::Attention, device, registry, Vec::new())?
            .with_arity(4, 2)
            .with_host_inputs(&[1]);
        if kv_head_num == 0 || head_num % kv_head_num != 0 {
            return Err(base.invalid(
                "query",
                format!("{head_num} heads cannot be grouped over {kv_head_num} kv heads"),
            ));
        }
        Ok(Self {
            base,
            head_num,
            kv_head_num,
            head_size,
        })
    }

    pub fn dim(&self) -> usize {
        self.head_num * self.head_size
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_head_num * self.head_size
    }
}

impl Layer for MultiHeadAttention {
    delegate_layer_base!();

    fn check(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.base.check_base(io)?;
        let (query, key_cache, value_cache) = (io.inputs[0], io.inputs[2], io.inputs[3]);
        let (output, score) = (io.outputs[0], io.outputs[1]);

        self.base.check_dtype("query", query, DType::F32)?;
        let rows = match *query.shape() {
            [n, d] if d == self.dim() => n,
            [d] if d == self.dim() => 1,
            _ => {
                return Err(self.base.invalid(
                    "query",
                    format!("has shape {:?}, expected [n, {}]", query.shape(), self.dim()),
                ))
            }
        };

        self.base.check_dtype("key cache", key_cache, DType::F32)?;
        if key_cache.rank() != 2 || key_cache.dim(1) != self.kv_dim() {
            return Err(self.base.invalid(
                "key cache",
                format!("has shape {:?}, expected [seq_len, {}]", key_cache.shape(), self.kv_dim()),
            ));
        }
        let seq_len = key_cache.dim(0);
        self.base
            .check_tensor("value cache", value_cache, DType::F32, key_cache.shape())?;
        self.base.check_tensor("output", output, DType::F32, query.shape())?;
        self.base
            .check_tensor("score", score, DType::F32, &[self.head_num, seq_len])?;

        let pos = self.base.check_position(io.inputs[1])?;
        if pos + rows > seq_len {
            return Err(self.base.invalid(
                "pos",
                format!("{pos} + {rows} rows exceeds the cache length {seq_len}"),
            ));
        }
        Ok(())
    }

    fn forward(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.check(io)?;
        self.base.launch(
            io,
            OpParams::Attention {
                head_num: self.head_num,
                kv_head_num: self.kv_head_num,
                head_size: self.head_size,
            },
        )
    }
}
