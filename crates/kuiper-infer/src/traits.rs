//! Core traits shared by every layer and model in the runtime.

use std::sync::Arc;

use crate::decoder::EmbeddingOutput;
use crate::error::EngineResult;
use crate::gpu_ops::WgpuContext;
use crate::kernels::OpKind;
use crate::tensor::Tensor;

// ============================================================================
//  1. Backend
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Wgpu,
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Wgpu)
    }
}

// ============================================================================
//  2. Operators
// ============================================================================

/// Per-call operand slots of a layer.
///
/// Layers own their weights; inputs and outputs are borrowed from the
/// orchestrator for the duration of one call.
#[derive(Clone, Copy)]
pub struct LayerIo<'a> {
    pub inputs: &'a [&'a Tensor],
    pub outputs: &'a [&'a Tensor],
}

impl<'a> LayerIo<'a> {
    pub fn new(inputs: &'a [&'a Tensor], outputs: &'a [&'a Tensor]) -> Self {
        Self { inputs, outputs }
    }
}

/// A fixed operator in the decoder graph.
///
/// `forward` validates its operands with `check` before launching the kernel
/// it resolved from the registry at construction. A failed check writes
/// nothing.
pub trait Layer: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> OpKind;

    fn device(&self) -> Device;

    fn weights(&self) -> &[Tensor];

    fn check(&self, io: &LayerIo<'_>) -> EngineResult<()>;

    fn forward(&self, io: &LayerIo<'_>) -> EngineResult<()>;
}

// ============================================================================
//  3. Models
// ============================================================================

/// Public surface of a decoder-only model.
///
/// A model is one generation session: its scratch buffers and KV cache are
/// mutated by every call, so it may move between threads but must not be
/// driven from two at once. Implementations are `Send` and not `Sync`.
pub trait Model: Send {
    /// One-time setup: resolves kernels, moves weights, allocates scratch.
    fn init(&mut self, device: Device, context: Option<Arc<WgpuContext>>) -> EngineResult<()>;

    /// Looks up token embeddings into the residual stream.
    fn embedding(&self, tokens: &[u32]) -> EngineResult<EmbeddingOutput>;

    /// Runs every block over `input` starting at the position in `pos`,
    /// leaving the last row's logits in the logits buffer.
    fn forward(&self, input: &Tensor, pos: &Tensor) -> EngineResult<()>;

    /// `forward` followed by `post_processing`.
    fn predict(&self, input: &Tensor, pos: &Tensor, is_prompt: bool) -> EngineResult<u32>;

    /// Turns the current logits into the next token id.
    fn post_processing(&self, pos: &Tensor, is_prompt: bool) -> EngineResult<u32>;
}
