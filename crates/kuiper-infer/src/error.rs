//! Error types for the inference core.

use thiserror::Error;

use crate::kernels::OpKind;
use crate::traits::Device;

/// Errors surfaced by layers, kernels and the model orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Shape, dimension, device or dtype mismatch on an operand.
    #[error("invalid argument in {layer}: {tensor} tensor {reason}")]
    InvalidArgument {
        layer: String,
        tensor: String,
        reason: String,
    },

    /// No computation registered for an (operation, device) pair.
    #[error("no kernel registered for {op:?} on {device:?}")]
    MissingKernel { op: OpKind, device: Device },

    /// An accelerator context was required but is absent or mismatched.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The model was used before `init` completed.
    #[error("model is not initialized")]
    NotInitialized,

    /// A call would write past the end of the key/value cache.
    #[error("kv cache overflow: position {position} + {tokens} tokens exceeds capacity {capacity}")]
    CacheOverflow {
        position: usize,
        tokens: usize,
        capacity: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend failure (buffer mapping, readback, ndarray shape plumbing).
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn invalid_argument(
        layer: impl Into<String>,
        tensor: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        EngineError::InvalidArgument {
            layer: layer.into(),
            tensor: tensor.into(),
            reason: reason.into(),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, EngineError::InvalidArgument { .. })
    }
}

/// Result type for inference-core operations.
pub type EngineResult<T> = Result<T, EngineError>;
