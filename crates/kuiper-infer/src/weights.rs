//! Materialized model weights.
//!
//! Weight files are parsed outside this crate; what arrives here is a set of
//! already-shaped `f32` tensors. All projection weights use the
//! `[out_features, in_features]` layout.

use std::sync::Arc;

use crate::config::TransformerConfig;
use crate::error::{EngineError, EngineResult};
use crate::gpu_ops::WgpuContext;
use crate::tensor::{DType, Tensor};
use crate::traits::Device;

/// Weights of one decoder block.
#[derive(Debug, Clone)]
pub struct BlockWeights {
    /// `[dim]`
    pub attention_norm: Tensor,
    /// `[dim, dim]`
    pub wq: Tensor,
    /// `[kv_dim, dim]`
    pub wk: Tensor,
    /// `[kv_dim, dim]`
    pub wv: Tensor,
    /// `[dim, dim]`
    pub wo: Tensor,
    /// `[dim]`
    pub ffn_norm: Tensor,
    /// `[hidden_dim, dim]`, the gate projection.
    pub w1: Tensor,
    /// `[dim, hidden_dim]`
    pub w2: Tensor,
    /// `[hidden_dim, dim]`, the up projection.
    pub w3: Tensor,
    /// `[head_size]`, present when the config enables per-head QK norm.
    pub q_norm: Option<Tensor>,
    pub k_norm: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct TransformerWeights {
    /// `[vocab_size, dim]`
    pub embedding: Tensor,
    pub blocks: Vec<BlockWeights>,
    /// `[dim]`
    pub final_norm: Tensor,
    /// `[vocab_size, dim]`. `None` ties the classifier to `embedding`.
    pub classifier: Option<Tensor>,
}

fn expect_shape(name: &str, tensor: &Tensor, shape: &[usize]) -> EngineResult<()> {
    if tensor.dtype() != DType::F32 {
        return Err(EngineError::InvalidConfig(format!(
            "weight {name} has dtype {}, expected f32",
            tensor.dtype().as_str()
        )));
    }
    if tensor.shape() != shape {
        return Err(EngineError::InvalidConfig(format!(
            "weight {name} has shape {:?}, expected {shape:?}",
            tensor.shape()
        )));
    }
    Ok(())
}

impl BlockWeights {
    fn validate(&self, i: usize, config: &TransformerConfig) -> EngineResult<()> {
        let (dim, kv_dim, hidden) = (config.dim, config.kv_dim(), config.hidden_dim);
        let name = |w: &str| format!("blocks.{i}.{w}");
        expect_shape(&name("attention_norm"), &self.attention_norm, &[dim])?;
        expect_shape(&name("wq"), &self.wq, &[dim, dim])?;
        expect_shape(&name("wk"), &self.wk, &[kv_dim, dim])?;
        expect_shape(&name("wv"), &self.wv, &[kv_dim, dim])?;
        expect_shape(&name("wo"), &self.wo, &[dim, dim])?;
        expect_shape(&name("ffn_norm"), &self.ffn_norm, &[dim])?;
        expect_shape(&name("w1"), &self.w1, &[hidden, dim])?;
        expect_shape(&name("w2"), &self.w2, &[dim, hidden])?;
        expect_shape(&name("w3"), &self.w3, &[hidden, dim])?;

        match (&self.q_norm, &self.k_norm, config.qk_norm) {
            (Some(q), Some(k), true) => {
                expect_shape(&name("q_norm"), q, &[config.head_size])?;
                expect_shape(&name("k_norm"), k, &[config.head_size])
            }
            (None, None, false) => Ok(()),
            _ => Err(EngineError::InvalidConfig(format!(
                "block {i}: q_norm/k_norm must be present exactly when qk_norm is set"
            ))),
        }
    }

    fn to_device(&self, device: Device, context: Option<&Arc<WgpuContext>>) -> EngineResult<Self> {
        let move_opt = |t: &Option<Tensor>| t.as_ref().map(|t| t.to_device(device, context)).transpose();
        Ok(Self {
            attention_norm: self.attention_norm.to_device(device, context)?,
            wq: self.wq.to_device(device, context)?,
            wk: self.wk.to_device(device, context)?,
            wv: self.wv.to_device(device, context)?,
            wo: self.wo.to_device(device, context)?,
            ffn_norm: self.ffn_norm.to_device(device, context)?,
            w1: self.w1.to_device(device, context)?,
            w2: self.w2.to_device(device, context)?,
            w3: self.w3.to_device(device, context)?,
            q_norm: move_opt(&self.q_norm)?,
            k_norm: move_opt(&self.k_norm)?,
        })
    }
}

impl TransformerWeights {
    /// Checks every tensor against the shapes `config` implies.
    pub fn validate(&self, config: &TransformerConfig) -> EngineResult<()> {
        let (vocab, dim) = (config.vocab_size, config.dim);
        expect_shape("embedding", &self.embedding, &[vocab, dim])?;
        expect_shape("final_norm", &self.final_norm, &[dim])?;
        match &self.classifier {
            Some(classifier) => expect_shape("classifier", classifier, &[vocab, dim])?,
            None if !config.tie_word_embeddings => {
                return Err(EngineError::InvalidConfig(
                    "classifier weight missing and tie_word_embeddings is off".into(),
                ))
            }
            None => {}
        }
        if self.blocks.len() != config.layer_num {
            return Err(EngineError::InvalidConfig(format!(
                "{} blocks supplied for layer_num {}",
                self.blocks.len(),
                config.layer_num
            )));
        }
        for (i, block) in self.blocks.iter().enumerate() {
            block.validate(i, config)?;
        }
        Ok(())
    }

    /// Copies every tensor to `device`. A tied classifier stays tied.
    pub fn to_device(
        &self,
        device: Device,
        context: Option<&Arc<WgpuContext>>,
    ) -> EngineResult<Self> {
        let blocks = self
            .blocks
            .iter()
            .map(|b| b.to_device(device, context))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self {
            embedding: self.embedding.to_device(device, context)?,
            blocks,
            final_norm: self.final_norm.to_device(device, context)?,
            classifier: self
                .classifier
                .as_ref()
                .map(|c| c.to_device(device, context))
                .transpose()?,
        })
    }

    /// The `[vocab, dim]` projection used for the logits.
    pub fn classifier_or_embedding(&self) -> &Tensor {
        self.classifier.as_ref().unwrap_or(&self.embedding)
    }

    pub fn num_parameters(&self) -> usize {
        let block: usize = self
            .blocks
            .iter()
            .map(|b| {
                [&b.attention_norm, &b.wq, &b.wk, &b.wv, &b.wo, &b.ffn_norm, &b.w1, &b.w2, &b.w3]
                    .iter()
                    .map(|t| t.num_elements())
                    .sum::<usize>()
                    + b.q_norm.as_ref().map_or(0, Tensor::num_elements)
                    + b.k_norm.as_ref().map_or(0, Tensor::num_elements)
            })
            .sum();
        self.embedding.num_elements()
            + self.final_norm.num_elements()
            + self.classifier.as_ref().map_or(0, Tensor::num_elements)
            + block
    }
}
