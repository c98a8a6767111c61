//! Rotary Position Embeddings (RoPE)
//!
//! Positions are encoded by rotating query and key heads. This runtime uses
//! the rotate-half pairing: element `i < head_size / 2` of each head is
//! rotated together with element `i + head_size / 2` by the angle
//! `pos * theta^(-2i / head_size)`.
//!
//! The sin/cos tables are computed once on the host for every position up to
//! `seq_len` and moved to the layer's device as the layer's weights.

use std::sync::Arc;

use ndarray::{Array1, Array2};

use crate::error::EngineResult;
use crate::gpu_ops::WgpuContext;
use crate::kernels::{KernelRegistry, OpKind, OpParams};
use crate::layer::{delegate_layer_base, LayerBase};
use crate::tensor::{DType, Tensor};
use crate::traits::{Device, Layer, LayerIo};

/// Host sin/cos tables, `[seq_len, head_size / 2]` each.
pub struct RopeTables {
    pub sin: Array2<f32>,
    pub cos: Array2<f32>,
}

impl RopeTables {
    pub fn new(head_size: usize, seq_len: usize, theta: f32) -> Self {
        let inv_freq = Self::inv_freq(head_size, theta);
        let half = head_size / 2;
        let mut sin = Array2::zeros((seq_len, half));
        let mut cos = Array2::zeros((seq_len, half));
        for pos in 0..seq_len {
            for i in 0..half {
                let angle = pos as f32 * inv_freq[i];
                sin[[pos, i]] = angle.sin();
                cos[[pos, i]] = angle.cos();
            }
        }
        Self { sin, cos }
    }

    fn inv_freq(head_size: usize, theta: f32) -> Array1<f32> {
        Array1::from_iter((0..head_size / 2).map(|i| {
            let exponent = (2 * i) as f32 / head_size as f32;
            1.0 / theta.powf(exponent)
        }))
    }
}

/// Rotates `query` `[n, dim]` and `key` `[n, kv_dim]` in place. The third
/// input is the host position scalar of row 0.
pub struct RopeLayer {
    base: LayerBase,
    head_size: usize,
    seq_len: usize,
}

impl RopeLayer {
    pub fn new(
        device: Device,
        registry: &KernelRegistry,
        context: Option<&Arc<WgpuContext>>,
        head_size: usize,
        seq_len: usize,
        theta: f32,
    ) -> EngineResult<Self> {
        let tables = RopeTables::new(head_size, seq_len, theta);
        let sin = Tensor::from_ndarray(&tables.sin)?.to_device(device, context)?;
        let cos = Tensor::from_ndarray(&tables.cos)?.to_device(device, context)?;
        Self::with_tables(device, registry, sin, cos, head_size)
    }

    /// Builds the layer around precomputed `[seq_len, head_size / 2]` tables.
    pub fn with_tables(
        device: Device,
        registry: &KernelRegistry,
        sin: Tensor,
        cos: Tensor,
        head_size: usize,
    ) -> EngineResult<Self> {
        let seq_len = sin.dim(0);
        let base = LayerBase::new("rope", OpKind::Rope, device, registry, vec![sin, cos])?
            .with_arity(3, 0)
            .with_host_inputs(&[2]);
        if head_size == 0 || head_size % 2 != 0 {
            return Err(base.invalid("weight", format!("head size {head_size} must be even")));
        }
        base.check_tensor("sin", base.weight(0), DType::F32, &[seq_len, head_size / 2])?;
        base.check_tensor("cos", base.weight(1), DType::F32, &[seq_len, head_size / 2])?;
        Ok(Self {
            base,
            head_size,
            seq_len,
        })
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    fn check_heads(&self, label: &str, tensor: &Tensor) -> EngineResult<()> {
        self.base.check_dtype(label, tensor, DType::F32)?;
        let width = tensor.dim(-1);
        if tensor.rank() > 2 || width % self.head_size != 0 {
            return Err(self.base.invalid(
                label,
                format!("{:?} is not a row of {}-wide heads", tensor.shape(), self.head_size),
            ));
        }
        Ok(())
    }
}

impl Layer for RopeLayer {
    delegate_layer_base!();

    fn check(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.base.check_base(io)?;
        let (query, key) = (io.inputs[0], io.inputs[1]);
        self.check_heads("query", query)?;
        self.check_heads("key", key)?;

        // Both are written in place, so neither may overlap the other or a table.
        if query.shares_storage(key) {
            return Err(self.base.invalid("key", "shares storage with the query"));
        }
        if self
            .base
            .weights()
            .iter()
            .any(|w| w.shares_storage(query) || w.shares_storage(key))
        {
            return Err(self.base.invalid("query", "shares storage with a rope table"));
        }

        let rows = query.num_elements() / query.dim(-1);
        if key.num_elements() / key.dim(-1) != rows {
            return Err(self.base.invalid(
                "key",
                format!("has {:?} rows but the query has {rows}", key.shape()),
            ));
        }
        let pos = self.base.check_position(io.inputs[2])?;
        if pos + rows > self.seq_len {
            return Err(self.base.invalid(
                "pos",
                format!("{pos} + {rows} rows exceeds the table length {}", self.seq_len),
            ));
        }
        Ok(())
    }

    fn forward(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.check(io)?;
        self.base.launch(
            io,
            OpParams::Rope {
                head_size: self.head_size,
            },
        )
    }
}
