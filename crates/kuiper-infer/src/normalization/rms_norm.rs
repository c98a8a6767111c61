//! Root Mean Square Layer Normalization (RMSNorm)
//!
//! Formula: y = (x / RMS(x)) * weight
//! where RMS(x) = sqrt(mean(x^2) + eps)
//!
//! The mode is picked from the input's rank:
//!
//! - **flat** (rank 1): input, weight and output must all be exactly `[dim]`
//!   and live on the layer's device.
//! - **batched** (rank > 1): only the trailing dimension is checked against
//!   `dim`; every `dim`-wide slice is normalized independently with the same
//!   weight. The output must carry the same element count and trailing dim.

use crate::error::EngineResult;
use crate::kernels::{KernelRegistry, OpKind, OpParams};
use crate::layer::{delegate_layer_base, LayerBase};
use crate::tensor::{DType, Tensor};
use crate::traits::{Device, Layer, LayerIo};

pub struct RmsNormLayer {
    base: LayerBase,
    dim: usize,
    eps: f32,
}

impl RmsNormLayer {
    /// # Arguments
    /// * `weight` - Learnable scale parameter (shape: [dim])
    /// * `eps` - Small constant for numerical stability
    pub fn new(
        name: impl Into<String>,
        device: Device,
        registry: &KernelRegistry,
        weight: Tensor,
        eps: f32,
    ) -> EngineResult<Self> {
        let dim = weight.num_elements();
        let base = LayerBase::new(name, OpKind::RmsNorm, device, registry, vec![weight])?;
        let weight = base.weight(0);
        if weight.rank() != 1 {
            return Err(base.invalid("weight", format!("must be rank 1, got {:?}", weight.shape())));
        }
        base.check_dtype("weight", weight, DType::F32)?;
        Ok(Self { base, dim, eps })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }
}

impl Layer for RmsNormLayer {
    delegate_layer_base!();

    fn check(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.base.check_base(io)?;
        let (input, output) = (io.inputs[0], io.outputs[0]);

        if input.rank() == 1 {
            self.base.check_tensor("input", input, DType::F32, &[self.dim])?;
            self.base
                .check_tensor("weight", self.base.weight(0), DType::F32, &[self.dim])?;
            self.base.check_tensor("output", output, DType::F32, &[self.dim])?;
            return Ok(());
        }

        self.base.check_dtype("input", input, DType::F32)?;
        if input.dim(-1) != self.dim {
            return Err(self.base.invalid(
                "input",
                format!("has a wrong dim in dim -1: {} != {}", input.dim(-1), self.dim),
            ));
        }
        self.base.check_dtype("output", output, DType::F32)?;
        if output.dim(-1) != self.dim || output.num_elements() != input.num_elements() {
            return Err(self.base.invalid(
                "output",
                format!("has shape {:?} for input {:?}", output.shape(), input.shape()),
            ));
        }
        Ok(())
    }

    fn forward(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.check(io)?;
        self.base.launch(
            io,
            OpParams::RmsNorm {
                dim: self.dim,
                eps: self.eps,
            },
        )
    }
}
