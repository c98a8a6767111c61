use crate::error::EngineResult;
use crate::kernels::{KernelRegistry, OpKind, OpParams};
use crate::layer::{delegate_layer_base, LayerBase};
use crate::tensor::DType;
use crate::traits::{Device, Layer, LayerIo};

/// `out = silu(gate) * up`.
///
/// In the decoder `gate` is the `w1` projection and `up` the `w3` projection;
/// `out` overwrites `gate` before `w2` projects back to `dim`.
pub struct SwiGluLayer {
    base: LayerBase,
}

impl SwiGluLayer {
    pub fn new(device: Device, registry: &KernelRegistry) -> EngineResult<Self> {
        let base = LayerBase::new("swiglu", OpKind::SwiGlu, device, registry, Vec::new())?
            .with_arity(2, 1)
            .with_alias(0);
        Ok(Self { base })
    }
}

impl Layer for SwiGluLayer {
    delegate_layer_base!();

    fn check(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.base.check_base(io)?;
        let (gate, up, out) = (io.inputs[0], io.inputs[1], io.outputs[0]);
        self.base.check_dtype("gate", gate, DType::F32)?;
        self.base.check_tensor("up", up, DType::F32, gate.shape())?;
        self.base.check_tensor("output", out, DType::F32, gate.shape())
    }

    fn forward(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.check(io)?;
        self.base.launch(io, OpParams::None)
    }
}
