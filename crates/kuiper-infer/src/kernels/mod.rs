//! Device-keyed kernel dispatch.
//!
//! The registry maps `(OpKind, Device)` to a concrete [`Kernel`]. It is
//! populated once at model initialization and layers resolve their kernel
//! when they are constructed, so a missing entry surfaces as an
//! initialization error rather than mid-inference.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::gpu_ops::WgpuContext;
use crate::tensor::Tensor;
use crate::traits::Device;

pub mod cpu;
pub mod gpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Embedding,
    RmsNorm,
    Add,
    Matmul,
    Rope,
    Attention,
    SwiGlu,
}

impl OpKind {
    pub const ALL: [OpKind; 7] = [
        OpKind::Embedding,
        OpKind::RmsNorm,
        OpKind::Add,
        OpKind::Matmul,
        OpKind::Rope,
        OpKind::Attention,
        OpKind::SwiGlu,
    ];
}

/// Scalar parameters a kernel cannot derive from operand shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpParams {
    None,
    RmsNorm {
        dim: usize,
        eps: f32,
    },
    Rope {
        head_size: usize,
    },
    Attention {
        head_num: usize,
        kv_head_num: usize,
        head_size: usize,
    },
}

/// Operands of one kernel launch, already validated by the owning layer.
///
/// Operand order per op:
///
/// | op        | inputs                          | weights         | outputs        |
/// |-----------|---------------------------------|-----------------|----------------|
/// | Embedding | tokens (host u32)               | table           | rows           |
/// | RmsNorm   | x                               | weight          | y              |
/// | Add       | a, b                            |                 | out (may be a) |
/// | Matmul    | x                               | w `[out, in]`   | y              |
/// | Rope      | q, k, pos (host u32)            | sin, cos        | (q, k in place)|
/// | Attention | q, pos, key cache, value cache  |                 | out, scores    |
/// | SwiGlu    | gate, up                        |                 | out (may be gate) |
pub struct KernelCall<'a> {
    pub inputs: &'a [&'a Tensor],
    pub weights: &'a [Tensor],
    pub outputs: &'a [&'a Tensor],
    pub params: OpParams,
}

impl<'a> KernelCall<'a> {
    pub fn input(&self, i: usize) -> EngineResult<&'a Tensor> {
        operand(self.inputs, i, "input")
    }

    pub fn weight(&self, i: usize) -> EngineResult<&'a Tensor> {
        self.weights
            .get(i)
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("kernel weight {i} missing")))
    }

    pub fn output(&self, i: usize) -> EngineResult<&'a Tensor> {
        operand(self.outputs, i, "output")
    }
}

fn operand<'a>(slots: &'a [&'a Tensor], i: usize, what: &str) -> EngineResult<&'a Tensor> {
    slots
        .get(i)
        .copied()
        .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("kernel {what} {i} missing")))
}

/// Reads the start position from a host `u32` scalar tensor.
pub fn read_position(pos: &Tensor) -> EngineResult<usize> {
    pos.to_vec_u32()?
        .first()
        .map(|&p| p as usize)
        .ok_or_else(|| EngineError::invalid_argument("position", "pos", "is empty"))
}

/// A computation over tensors of one device.
pub trait Kernel: Send + Sync {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()>;
}

/// Explicit `(OpKind, Device)` lookup table.
#[derive(Default, Clone)]
pub struct KernelRegistry {
    kernels: HashMap<(OpKind, Device), Arc<dyn Kernel>>,
    context: Option<Arc<WgpuContext>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every CPU kernel, and every GPU kernel when a context is given.
    pub fn with_defaults(context: Option<&Arc<WgpuContext>>) -> Self {
        let mut registry = Self::new();
        cpu::register_all(&mut registry);
        if let Some(context) = context {
            gpu::register_all(&mut registry, context);
            registry.context = Some(context.clone());
        }
        log::debug!("kernel registry populated with {} entries", registry.len());
        registry
    }

    pub fn register(&mut self, op: OpKind, device: Device, kernel: Arc<dyn Kernel>) {
        self.kernels.insert((op, device), kernel);
    }

    pub fn get(&self, op: OpKind, device: Device) -> EngineResult<Arc<dyn Kernel>> {
        self.kernels
            .get(&(op, device))
            .cloned()
            .ok_or(EngineError::MissingKernel { op, device })
    }

    pub fn contains(&self, op: OpKind, device: Device) -> bool {
        self.kernels.contains_key(&(op, device))
    }

    /// Context the GPU entries were compiled against.
    pub fn context(&self) -> Option<&Arc<WgpuContext>> {
        self.context.as_ref()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopKernel;

    impl Kernel for NoopKernel {
        fn launch(&self, _call: &KernelCall<'_>) -> EngineResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_defaults_cover_every_cpu_op() {
        let registry = KernelRegistry::with_defaults(None);
        for op in OpKind::ALL {
            assert!(registry.contains(op, Device::Cpu), "missing cpu {op:?}");
            assert!(!registry.contains(op, Device::Wgpu));
        }
        assert_eq!(registry.len(), OpKind::ALL.len());
        assert!(registry.context().is_none());
    }

    #[test]
    fn test_missing_kernel_is_reported() {
        let registry = KernelRegistry::new();
        assert!(registry.is_empty());
        match registry.get(OpKind::Rope, Device::Wgpu) {
            Err(EngineError::MissingKernel { op, device }) => {
                assert_eq!(op, OpKind::Rope);
                assert_eq!(device, Device::Wgpu);
            }
            _ => panic!("expected MissingKernel"),
        }
    }

    #[test]
    fn test_register_overrides_entry() {
        let mut registry = KernelRegistry::with_defaults(None);
        let noop: Arc<dyn Kernel> = Arc::new(NoopKernel);
        registry.register(OpKind::Add, Device::Cpu, noop.clone());
        let resolved = registry.get(OpKind::Add, Device::Cpu).unwrap();
        assert!(Arc::ptr_eq(&resolved, &noop));
    }
}
