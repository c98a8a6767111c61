//! Bias-free projection `y = x W^T`.
//!
//! Weights are stored `[out_features, in_features]`, the layout the
//! checkpoints ship in, so each output feature is one contiguous row. The
//! input may be a single vector `[in]` or a batch of rows `[n, in]`.
//!
//! The decoder uses one instance per projection: `wq`, `wk`, `wv`, `wo`,
//! `w1`, `w2`, `w3`, and the classifier.

use crate::error::EngineResult;
use crate::kernels::{KernelRegistry, OpKind, OpParams};
use crate::layer::{delegate_layer_base, LayerBase};
use crate::tensor::{DType, Tensor};
use crate::traits::{Device, Layer, LayerIo};

pub struct LinearLayer {
    base: LayerBase,
    in_features: usize,
    out_features: usize,
}

impl LinearLayer {
    pub fn new(
        name: impl Into<String>,
        device: Device,
        registry: &KernelRegistry,
        weight: Tensor,
    ) -> EngineResult<Self> {
        let base = LayerBase::new(name, OpKind::Matmul, device, registry, vec![weight])?;
        let weight = base.weight(0);
        if weight.rank() != 2 {
            return Err(base.invalid(
                "weight",
                format!("must be [out, in], got {:?}", weight.shape()),
            ));
        }
        base.check_dtype("weight", weight, DType::F32)?;
        let (out_features, in_features) = (weight.dim(0), weight.dim(1));
        Ok(Self {
            base,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Layer for LinearLayer {
    delegate_layer_base!();

    fn check(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.base.check_base(io)?;
        let (input, output) = (io.inputs[0], io.outputs[0]);
        self.base.check_dtype("input", input, DType::F32)?;
        match *input.shape() {
            [n, k] if k == self.in_features => {
                self.base.check_tensor("output", output, DType::F32, &[n, self.out_features])
            }
            [k] if k == self.in_features => {
                self.base.check_tensor("output", output, DType::F32, &[self.out_features])
            }
            _ => Err(self.base.invalid(
                "input",
                format!(
                    "has shape {:?}, expected [.., {}]",
                    input.shape(),
                    self.in_features
                ),
            )),
        }
    }

    fn forward(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.check(io)?;
        self.base.launch(io, OpParams::None)
    }
}
