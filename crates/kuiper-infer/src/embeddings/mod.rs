//! Token embedding lookup.
//!
//! The token ids are read on the host (they are the one operand that is
//! always produced there), the table and output live on the layer's device.

use crate::error::EngineResult;
use crate::kernels::{KernelRegistry, OpKind, OpParams};
use crate::layer::{delegate_layer_base, LayerBase};
use crate::tensor::{DType, Tensor};
use crate::traits::{Device, Layer, LayerIo};

pub struct EmbeddingLayer {
    base: LayerBase,
    vocab_size: usize,
    dim: usize,
}

impl EmbeddingLayer {
    /// `table` is `[vocab_size, dim]`.
    pub fn new(
        device: Device,
        registry: &KernelRegistry,
        table: Tensor,
    ) -> EngineResult<Self> {
        let base = LayerBase::new("embedding", OpKind::Embedding, device, registry, vec![table])?
            .with_host_inputs(&[0]);
        let table = base.weight(0);
        if table.rank() != 2 {
            return Err(base.invalid("weight", format!("must be [vocab, dim], got {:?}", table.shape())));
        }
        let (vocab_size, dim) = (table.dim(0), table.dim(1));
        Ok(Self {
            base,
            vocab_size,
            dim,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The `[vocab, dim]` table, shared with a tied classifier.
    pub fn table(&self) -> &Tensor {
        self.base.weight(0)
    }
}

impl Layer for EmbeddingLayer {
    delegate_layer_base!();

    fn check(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.base.check_base(io)?;
        let (tokens, output) = (io.inputs[0], io.outputs[0]);
        self.base.check_dtype("input", tokens, DType::U32)?;
        if tokens.rank() != 1 {
            return Err(self.base.invalid("input", "token ids must be rank 1"));
        }
        let n = tokens.num_elements();
        self.base.check_tensor("output", output, DType::F32, &[n, self.dim])?;

        if let Some(&bad) = tokens.to_vec_u32()?.iter().find(|&&t| t as usize >= self.vocab_size) {
            return Err(self.base.invalid(
                "input",
                format!("token id {bad} is outside the vocabulary of {}", self.vocab_size),
            ));
        }
        Ok(())
    }

    fn forward(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.check(io)?;
        self.base.launch(io, OpParams::None)
    }
}
