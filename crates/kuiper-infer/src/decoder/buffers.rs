//! Activation scratch, allocated once at `init` for `seq_len` rows and
//! reused by every block. Per-call tensors are views of the first `n` rows.

use std::sync::Arc;

use crate::config::TransformerConfig;
use crate::error::EngineResult;
use crate::gpu_ops::WgpuContext;
use crate::tensor::{DType, Tensor};
use crate::traits::Device;

pub struct ScratchBuffers {
    /// Embedding output; the residual stream when the caller passes it back.
    pub residual: Tensor,
    pub norm_out: Tensor,
    pub query: Tensor,
    /// Pre-normalization projections, only with per-head QK norm.
    pub q_raw: Option<Tensor>,
    pub k_raw: Option<Tensor>,
    pub attn_out: Tensor,
    pub attn_proj: Tensor,
    pub gate: Tensor,
    pub up: Tensor,
    pub ffn_out: Tensor,
    /// `[head_num, seq_len]`
    pub score: Tensor,
    /// `[dim]`, the normalized last row.
    pub final_norm: Tensor,
    /// `[vocab_size]`
    pub logits: Tensor,
}

impl ScratchBuffers {
    pub fn new(
        config: &TransformerConfig,
        device: Device,
        context: Option<&Arc<WgpuContext>>,
    ) -> EngineResult<Self> {
        let rows = config.seq_len;
        let alloc = |shape: &[usize]| Tensor::zeros(shape, DType::F32, device, context);
        let (dim, kv_dim, hidden) = (config.dim, config.kv_dim(), config.hidden_dim);

        let (q_raw, k_raw) = if config.qk_norm {
            (Some(alloc(&[rows, dim])?), Some(alloc(&[rows, kv_dim])?))
        } else {
            (None, None)
        };
        Ok(Self {
            residual: alloc(&[rows, dim])?,
            norm_out: alloc(&[rows, dim])?,
            query: alloc(&[rows, dim])?,
            q_raw,
            k_raw,
            attn_out: alloc(&[rows, dim])?,
            attn_proj: alloc(&[rows, dim])?,
            gate: alloc(&[rows, hidden])?,
            up: alloc(&[rows, hidden])?,
            ffn_out: alloc(&[rows, dim])?,
            score: alloc(&[config.head_num, rows])?,
            final_norm: alloc(&[dim])?,
            logits: alloc(&[config.vocab_size])?,
        })
    }
}

/// Row views of the scratch for one call of `n` rows.
pub(crate) struct StepBuffers {
    pub norm_out: Tensor,
    pub query: Tensor,
    pub q_raw: Option<Tensor>,
    pub k_raw: Option<Tensor>,
    pub attn_out: Tensor,
    pub attn_proj: Tensor,
    pub gate: Tensor,
    pub up: Tensor,
    pub ffn_out: Tensor,
    pub score: Tensor,
}

impl StepBuffers {
    pub fn new(scratch: &ScratchBuffers, n: usize) -> EngineResult<Self> {
        let rows = |t: &Option<Tensor>| t.as_ref().map(|t| t.rows(n)).transpose();
        Ok(Self {
            norm_out: scratch.norm_out.rows(n)?,
            query: scratch.query.rows(n)?,
            q_raw: rows(&scratch.q_raw)?,
            k_raw: rows(&scratch.k_raw)?,
            attn_out: scratch.attn_out.rows(n)?,
            attn_proj: scratch.attn_proj.rows(n)?,
            gate: scratch.gate.rows(n)?,
            up: scratch.up.rows(n)?,
            ffn_out: scratch.ffn_out.rows(n)?,
            score: scratch.score.clone(),
        })
    }
}
