//! Shared plumbing behind every [`Layer`](crate::traits::Layer) variant.
//!
//! [`LayerBase`] owns the weights and the kernel resolved from the registry,
//! and performs the checks common to all operators:
//!
//! - slot arity
//! - device placement (host-only slots such as the position scalar excepted)
//! - aliasing: an output may share storage with an input only through the
//!   layer's declared may-alias slot, and then only as the identical view
//!
//! Variant-specific shape checks live with each variant.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::gpu_ops::WgpuContext;
use crate::kernels::{Kernel, KernelCall, KernelRegistry, OpKind, OpParams};
use crate::tensor::{DType, Tensor};
use crate::traits::{Device, LayerIo};

pub struct LayerBase {
    name: String,
    kind: OpKind,
    device: Device,
    kernel: Arc<dyn Kernel>,
    weights: Vec<Tensor>,
    context: Option<Arc<WgpuContext>>,
    input_num: usize,
    output_num: usize,
    host_inputs: &'static [usize],
    may_alias: Option<usize>,
}

impl LayerBase {
    /// Resolves the kernel for `(kind, device)` and takes ownership of `weights`.
    ///
    /// GPU layers bind to the registry's context; its absence is a
    /// construction error.
    pub fn new(
        name: impl Into<String>,
        kind: OpKind,
        device: Device,
        registry: &KernelRegistry,
        weights: Vec<Tensor>,
    ) -> EngineResult<Self> {
        let name = name.into();
        let context = match device {
            Device::Cpu => None,
            Device::Wgpu => Some(registry.context().cloned().ok_or_else(|| {
                EngineError::DeviceUnavailable(format!(
                    "{name} was constructed for the gpu without an execution context"
                ))
            })?),
        };
        let kernel = registry.get(kind, device)?;
        let base = Self {
            name,
            kind,
            device,
            kernel,
            weights,
            context,
            input_num: 1,
            output_num: 1,
            host_inputs: &[],
            may_alias: None,
        };
        for (i, weight) in base.weights.iter().enumerate() {
            base.check_placement(&format!("weight {i}"), weight)?;
        }
        Ok(base)
    }

    pub fn with_arity(mut self, input_num: usize, output_num: usize) -> Self {
        self.input_num = input_num;
        self.output_num = output_num;
        self
    }

    /// Input slots read on the host regardless of the layer's device.
    pub fn with_host_inputs(mut self, slots: &'static [usize]) -> Self {
        self.host_inputs = slots;
        self
    }

    /// Output 0 may be the same view as input `slot`.
    pub fn with_alias(mut self, slot: usize) -> Self {
        self.may_alias = Some(slot);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn weights(&self) -> &[Tensor] {
        &self.weights
    }

    pub fn weight(&self, i: usize) -> &Tensor {
        &self.weights[i]
    }

    pub fn may_alias(&self) -> Option<usize> {
        self.may_alias
    }

    /// Logs and builds an invalid-argument error for `tensor`.
    pub fn invalid(&self, tensor: &str, reason: impl Into<String>) -> EngineError {
        let reason = reason.into();
        log::error!("the {tensor} tensor error in the {} layer: {reason}", self.name);
        EngineError::invalid_argument(&self.name, tensor, reason)
    }

    fn check_placement(&self, label: &str, tensor: &Tensor) -> EngineResult<()> {
        if tensor.device() != self.device {
            return Err(self.invalid(
                label,
                format!("is on {:?} but the layer runs on {:?}", tensor.device(), self.device),
            ));
        }
        if let (Some(expected), Some(actual)) = (&self.context, tensor.context()) {
            if !Arc::ptr_eq(expected, actual) {
                return Err(EngineError::DeviceUnavailable(format!(
                    "{label} tensor of {} belongs to a different gpu context",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Arity, placement and aliasing checks shared by every variant.
    pub fn check_base(&self, io: &LayerIo<'_>) -> EngineResult<()> {
        if self.device.is_gpu() && self.context.is_none() {
            return Err(EngineError::DeviceUnavailable(format!(
                "{} has no gpu execution context",
                self.name
            )));
        }
        if io.inputs.len() != self.input_num {
            return Err(self.invalid(
                "input",
                format!("slots: expected {}, got {}", self.input_num, io.inputs.len()),
            ));
        }
        if io.outputs.len() != self.output_num {
            return Err(self.invalid(
                "output",
                format!("slots: expected {}, got {}", self.output_num, io.outputs.len()),
            ));
        }

        for (i, input) in io.inputs.iter().enumerate() {
            if self.host_inputs.contains(&i) {
                if !input.device().is_cpu() {
                    return Err(self.invalid(&format!("input {i}"), "must be host resident"));
                }
            } else {
                self.check_placement(&format!("input {i}"), input)?;
            }
        }
        for (j, output) in io.outputs.iter().enumerate() {
            self.check_placement(&format!("output {j}"), output)?;

            for (i, input) in io.inputs.iter().enumerate() {
                if !output.shares_storage(input) {
                    continue;
                }
                let declared = j == 0 && self.may_alias == Some(i);
                if !declared || !output.same_view(input) {
                    return Err(self.invalid(
                        &format!("output {j}"),
                        format!("aliases input {i} outside the layer's may-alias slot"),
                    ));
                }
            }
            for other in &io.outputs[j + 1..] {
                if output.shares_storage(other) {
                    return Err(self.invalid(&format!("output {j}"), "aliases another output"));
                }
            }
            if self.weights.iter().any(|w| w.shares_storage(output)) {
                return Err(self.invalid(&format!("output {j}"), "aliases a weight"));
            }
        }
        Ok(())
    }

    /// Device, dtype and exact-shape check for one operand.
    pub fn check_tensor(
        &self,
        label: &str,
        tensor: &Tensor,
        dtype: DType,
        shape: &[usize],
    ) -> EngineResult<()> {
        self.check_dtype(label, tensor, dtype)?;
        if tensor.shape() != shape {
            return Err(self.invalid(
                label,
                format!("has shape {:?}, expected {:?}", tensor.shape(), shape),
            ));
        }
        Ok(())
    }

    pub fn check_dtype(&self, label: &str, tensor: &Tensor, dtype: DType) -> EngineResult<()> {
        if tensor.dtype() != dtype {
            return Err(self.invalid(
                label,
                format!("has dtype {}, expected {}", tensor.dtype().as_str(), dtype.as_str()),
            ));
        }
        Ok(())
    }

    /// Host `u32` scalar holding the start position.
    pub fn check_position(&self, pos: &Tensor) -> EngineResult<usize> {
        if pos.dtype() != DType::U32 || pos.num_elements() != 1 {
            return Err(self.invalid("pos", "must be a single u32 element"));
        }
        crate::kernels::read_position(pos)
    }

    pub fn launch(&self, io: &LayerIo<'_>, params: OpParams) -> EngineResult<()> {
        log::trace!("{}: launching {:?} on {:?}", self.name, self.kind, self.device);
        self.kernel.launch(&KernelCall {
            inputs: io.inputs,
            weights: &self.weights,
            outputs: io.outputs,
            params,
        })
    }
}

/// Forwards the identity accessors of [`Layer`](crate::traits::Layer) to a `base` field.
macro_rules! delegate_layer_base {
    () => {
        fn name(&self) -> &str {
            self.base.name()
        }

        fn kind(&self) -> $crate::kernels::OpKind {
            self.base.kind()
        }

        fn device(&self) -> $crate::traits::Device {
            self.base.device()
        }

        fn weights(&self) -> &[$crate::tensor::Tensor] {
            self.base.weights()
        }
    };
}

pub(crate) use delegate_layer_base;
