use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::EngineResult;
use crate::feedforward::SwiGluLayer;
use crate::kernels::{Kernel, KernelCall, KernelRegistry, OpKind};
use crate::linear_layer::LinearLayer;
use crate::normalization::RmsNormLayer;
use crate::ops::AddLayer;
use crate::tensor::{DType, Tensor};
use crate::tests::common::cpu_registry;
use crate::traits::{Device, Layer, LayerIo};

#[derive(Default)]
struct CountingKernel {
    calls: AtomicUsize,
}

impl Kernel for CountingKernel {
    fn launch(&self, _call: &KernelCall<'_>) -> EngineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_layer_uses_registered_override() {
    let counter = Arc::new(CountingKernel::default());
    let mut registry = cpu_registry();
    registry.register(OpKind::Add, Device::Cpu, counter.clone());

    let add = AddLayer::new(Device::Cpu, &registry).unwrap();
    let a = Tensor::from_vec_f32(&[2], vec![1.0, 2.0]).unwrap();
    let b = Tensor::from_vec_f32(&[2], vec![3.0, 4.0]).unwrap();
    add.forward(&LayerIo::new(&[&a, &b], &[&a])).unwrap();

    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.to_vec_f32().unwrap(), vec![1.0, 2.0]);
}

#[test]
fn test_failed_check_never_launches() {
    let counter = Arc::new(CountingKernel::default());
    let mut registry = KernelRegistry::new();
    registry.register(OpKind::Matmul, Device::Cpu, counter.clone());

    let weight = Tensor::from_vec_f32(&[2, 2], vec![1.0; 4]).unwrap();
    let linear = LinearLayer::new("wq", Device::Cpu, &registry, weight).unwrap();
    let x = Tensor::zeros(&[3], DType::F32, Device::Cpu, None).unwrap();
    let y = Tensor::zeros(&[2], DType::F32, Device::Cpu, None).unwrap();
    assert!(linear.forward(&LayerIo::new(&[&x], &[&y])).is_err());
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_layers_as_trait_objects() {
    let registry = cpu_registry();
    let weight = Tensor::from_vec_f32(&[4], vec![1.0; 4]).unwrap();
    let layers: Vec<Box<dyn Layer>> = vec![
        Box::new(RmsNormLayer::new("attention_norm", Device::Cpu, &registry, weight, 1e-5).unwrap()),
        Box::new(AddLayer::new(Device::Cpu, &registry).unwrap()),
        Box::new(SwiGluLayer::new(Device::Cpu, &registry).unwrap()),
    ];
    let kinds: Vec<OpKind> = layers.iter().map(|l| l.kind()).collect();
    assert_eq!(kinds, vec![OpKind::RmsNorm, OpKind::Add, OpKind::SwiGlu]);
    assert_eq!(layers[0].name(), "attention_norm");
    assert_eq!(layers[0].weights().len(), 1);
    assert!(layers.iter().all(|l| l.device() == Device::Cpu));
}

#[test]
fn test_outputs_may_not_share_storage() {
    let registry = cpu_registry();
    let mha = crate::attention::MultiHeadAttention::new(Device::Cpu, &registry, 1, 1, 4).unwrap();
    let q = Tensor::from_vec_f32(&[1, 4], vec![1.0; 4]).unwrap();
    let key = Tensor::zeros(&[4, 4], DType::F32, Device::Cpu, None).unwrap();
    let value = Tensor::zeros(&[4, 4], DType::F32, Device::Cpu, None).unwrap();
    let scratch = Tensor::zeros(&[8], DType::F32, Device::Cpu, None).unwrap();
    let out = scratch.view(0, &[1, 4]).unwrap();
    let score = scratch.view(4, &[1, 4]).unwrap();
    let pos = Tensor::scalar_u32(0);
    let err = mha
        .check(&LayerIo::new(&[&q, &pos, &key, &value], &[&out, &score]))
        .unwrap_err();
    assert!(err.is_invalid_argument());
}
