use crate::attention::MultiHeadAttention;
use crate::cache::KvCache;
use crate::config::TransformerConfig;
use crate::decoder::buffers::StepBuffers;
use crate::error::EngineResult;
use crate::feedforward::SwiGluLayer;
use crate::kernels::KernelRegistry;
use crate::linear_layer::LinearLayer;
use crate::normalization::RmsNormLayer;
use crate::ops::AddLayer;
use crate::rope::RopeLayer;
use crate::tensor::Tensor;
use crate::traits::{Device, Layer, LayerIo};
use crate::weights::BlockWeights;

/// Parameter-free layers instantiated once and shared by every block.
pub(crate) struct SharedLayers {
    pub add: AddLayer,
    pub rope: RopeLayer,
    pub swiglu: SwiGluLayer,
    pub mha: MultiHeadAttention,
}

/// Weighted layers of one pre-norm decoder block.
pub struct DecoderBlock {
    index: usize,
    attention_norm: RmsNormLayer,
    wq: LinearLayer,
    wk: LinearLayer,
    wv: LinearLayer,
    wo: LinearLayer,
    ffn_norm: RmsNormLayer,
    w1: LinearLayer,
    w2: LinearLayer,
    w3: LinearLayer,
    q_norm: Option<RmsNormLayer>,
    k_norm: Option<RmsNormLayer>,
    head_num: usize,
    kv_head_num: usize,
    head_size: usize,
}

impl DecoderBlock {
    pub fn new(
        index: usize,
        config: &TransformerConfig,
        weights: BlockWeights,
        device: Device,
        registry: &KernelRegistry,
    ) -> EngineResult<Self> {
        let eps = config.norm_eps;
        let name = |w: &str| format!("blocks.{index}.{w}");
        let norm = |w: &str, t: Tensor| RmsNormLayer::new(name(w), device, registry, t, eps);
        let linear = |w: &str, t: Tensor| LinearLayer::new(name(w), device, registry, t);

        Ok(Self {
            index,
            attention_norm: norm("attention_norm", weights.attention_norm)?,
            wq: linear("wq", weights.wq)?,
            wk: linear("wk", weights.wk)?,
            wv: linear("wv", weights.wv)?,
            wo: linear("wo", weights.wo)?,
            ffn_norm: norm("ffn_norm", weights.ffn_norm)?,
            w1: linear("w1", weights.w1)?,
            w2: linear("w2", weights.w2)?,
            w3: linear("w3", weights.w3)?,
            q_norm: weights.q_norm.map(|t| norm("q_norm", t)).transpose()?,
            k_norm: weights.k_norm.map(|t| norm("k_norm", t)).transpose()?,
            head_num: config.head_num,
            kv_head_num: config.kv_head_num,
            head_size: config.head_size,
        })
    }

    /// Runs the block over the `n` rows of `x`, updating it in place.
    ///
    /// K and V are projected straight into this block's cache slots
    /// `pos..pos + n`.
    pub(crate) fn forward(
        &self,
        x: &Tensor,
        pos: &Tensor,
        start: usize,
        shared: &SharedLayers,
        buf: &StepBuffers,
        cache: &KvCache,
    ) -> EngineResult<()> {
        let n = x.dim(0);
        let (key_slot, value_slot) = cache.slot(self.index, start, n)?;

        // --- Attention ---
        self.attention_norm
            .forward(&LayerIo::new(&[x], &[&buf.norm_out]))?;
        self.project_qk(&buf.norm_out, &key_slot, buf, n)?;
        self.wv
            .forward(&LayerIo::new(&[&buf.norm_out], &[&value_slot]))?;

        shared
            .rope
            .forward(&LayerIo::new(&[&buf.query, &key_slot, pos], &[]))?;

        let key_cache = cache.key(self.index)?;
        let value_cache = cache.value(self.index)?;
        shared.mha.forward(&LayerIo::new(
            &[&buf.query, pos, key_cache, value_cache],
            &[&buf.attn_out, &buf.score],
        ))?;
        self.wo
            .forward(&LayerIo::new(&[&buf.attn_out], &[&buf.attn_proj]))?;
        shared.add.forward(&LayerIo::new(&[x, &buf.attn_proj], &[x]))?;

        // --- Feed-forward ---
        self.ffn_norm
            .forward(&LayerIo::new(&[x], &[&buf.norm_out]))?;
        self.w1
            .forward(&LayerIo::new(&[&buf.norm_out], &[&buf.gate]))?;
        self.w3.forward(&LayerIo::new(&[&buf.norm_out], &[&buf.up]))?;
        shared
            .swiglu
            .forward(&LayerIo::new(&[&buf.gate, &buf.up], &[&buf.gate]))?;
        self.w2
            .forward(&LayerIo::new(&[&buf.gate], &[&buf.ffn_out]))?;
        shared.add.forward(&LayerIo::new(&[x, &buf.ffn_out], &[x]))
    }

    fn project_qk(
        &self,
        input: &Tensor,
        key_slot: &Tensor,
        buf: &StepBuffers,
        n: usize,
    ) -> EngineResult<()> {
        match (&self.q_norm, &self.k_norm, &buf.q_raw, &buf.k_raw) {
            (Some(q_norm), Some(k_norm), Some(q_raw), Some(k_raw)) => {
                self.wq.forward(&LayerIo::new(&[input], &[q_raw]))?;
                self.wk.forward(&LayerIo::new(&[input], &[k_raw]))?;

                // Per-head normalization: batched mode over one row per head.
                let q_heads = [n * self.head_num, self.head_size];
                let k_heads = [n * self.kv_head_num, self.head_size];
                q_norm.forward(&LayerIo::new(
                    &[&q_raw.reshape(&q_heads)?],
                    &[&buf.query.reshape(&q_heads)?],
                ))?;
                k_norm.forward(&LayerIo::new(
                    &[&k_raw.reshape(&k_heads)?],
                    &[&key_slot.reshape(&k_heads)?],
                ))
            }
            _ => {
                self.wq.forward(&LayerIo::new(&[input], &[&buf.query]))?;
                self.wk.forward(&LayerIo::new(&[input], &[key_slot]))
            }
        }
    }
}
