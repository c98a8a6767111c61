use crate::error::EngineResult;
use crate::kernels::{KernelRegistry, OpKind, OpParams};
use crate::layer::{delegate_layer_base, LayerBase};
use crate::tensor::DType;
use crate::traits::{Device, Layer, LayerIo};

/// `out = a + b`, element-wise. `out` may be the same view as `a`, which is
/// how the residual stream accumulates in place.
pub struct AddLayer {
    base: LayerBase,
}

impl AddLayer {
    pub fn new(device: Device, registry: &KernelRegistry) -> EngineResult<Self> {
        let base = LayerBase::new("add", OpKind::Add, device, registry, Vec::new())?
            .with_arity(2, 1)
            .with_alias(0);
        Ok(Self { base })
    }
}

impl Layer for AddLayer {
    delegate_layer_base!();

    fn check(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.base.check_base(io)?;
        let (a, b, out) = (io.inputs[0], io.inputs[1], io.outputs[0]);
        self.base.check_dtype("input 0", a, DType::F32)?;
        self.base.check_tensor("input 1", b, DType::F32, a.shape())?;
        self.base.check_tensor("output", out, DType::F32, a.shape())
    }

    fn forward(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        self.check(io)?;
        self.base.launch(io, OpParams::None)
    }
}
