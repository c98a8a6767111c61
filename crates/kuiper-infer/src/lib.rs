//! Kuiper inference core: the execution engine of a decoder-only transformer.
//!
//! Tensors live on the host or on a wgpu device, operators resolve their
//! kernels from an `(op, device)` registry, and [`TransformerModel`] drives the
//! fixed pre-norm forward pass over a per-block KV cache.

pub mod activations;
pub mod attention;
pub mod cache;
pub mod common;
pub mod config;
pub mod decoder;
pub mod embeddings;
pub mod error;
pub mod feedforward;
pub mod gpu_ops;
pub mod kernels;
pub mod layer;
pub mod linear_layer;
pub mod normalization;
pub mod ops;
pub mod rope;
pub mod tensor;
pub mod traits;
pub mod weights;

// Re-export commonly used items
pub use crate::{
    attention::MultiHeadAttention,
    cache::KvCache,
    common::{ArgmaxSampler, Sampler, TemperatureSampler},
    config::TransformerConfig,
    decoder::{EmbeddingOutput, TransformerModel},
    embeddings::EmbeddingLayer,
    error::{EngineError, EngineResult},
    feedforward::SwiGluLayer,
    kernels::{Kernel, KernelRegistry, OpKind},
    linear_layer::LinearLayer,
    normalization::RmsNormLayer,
    ops::AddLayer,
    rope::RopeLayer,
    tensor::{DType, Tensor},
    weights::{BlockWeights, TransformerWeights},
};
pub use gpu_ops::context::WgpuContext;
pub use traits::{Device, Layer, LayerIo, Model};

pub mod prelude {
    pub use crate::decoder::TransformerModel;
    pub use crate::gpu_ops::context::WgpuContext;
    pub use crate::tensor::Tensor;
    pub use crate::traits::{Device, Layer, LayerIo, Model};
}

#[cfg(test)]
pub mod tests;
