//! Decoder-only transformer orchestration.
//!
//! ```text
//!  tokens ─► embedding ─► x ─┬─► [block 0] ─► ... ─► [block L-1] ─► last row
//!                            │                                        │
//!                            └── residual stream, updated in place    ▼
//!                                                    final norm ─► classifier ─► logits
//! ```

mod block;
pub mod buffers;
pub mod model;

pub use block::DecoderBlock;
pub use buffers::ScratchBuffers;
pub use model::TransformerModel;

use crate::tensor::Tensor;

/// Result of [`Model::embedding`](crate::traits::Model::embedding).
#[derive(Debug, Clone)]
pub struct EmbeddingOutput {
    /// Host `u32` token ids, `[token_num]`.
    pub tokens: Tensor,
    /// `[token_num, dim]` view of the residual scratch on the model's device.
    pub embeddings: Tensor,
    pub token_num: usize,
}
