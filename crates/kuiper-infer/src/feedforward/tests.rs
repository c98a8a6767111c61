use approx::assert_abs_diff_eq;

use super::*;
use crate::activations::silu_scalar;
use crate::tensor::{DType, Tensor};
use crate::tests::common::cpu_registry;
use crate::traits::{Device, Layer, LayerIo};

#[test]
fn test_swiglu_values() {
    let swiglu = SwiGluLayer::new(Device::Cpu, &cpu_registry()).unwrap();
    let gate = Tensor::from_vec_f32(&[1, 3], vec![0.0, 1.0, -2.0]).unwrap();
    let up = Tensor::from_vec_f32(&[1, 3], vec![5.0, 2.0, 0.5]).unwrap();
    let out = Tensor::zeros(&[1, 3], DType::F32, Device::Cpu, None).unwrap();
    swiglu.forward(&LayerIo::new(&[&gate, &up], &[&out])).unwrap();

    let y = out.to_vec_f32().unwrap();
    assert_abs_diff_eq!(y[0], 0.0);
    assert_abs_diff_eq!(y[1], 2.0 * silu_scalar(1.0), epsilon = 1e-6);
    assert_abs_diff_eq!(y[2], 0.5 * silu_scalar(-2.0), epsilon = 1e-6);
}

#[test]
fn test_swiglu_in_place_on_gate() {
    let swiglu = SwiGluLayer::new(Device::Cpu, &cpu_registry()).unwrap();
    let gate = Tensor::from_vec_f32(&[2], vec![1.0, 1.0]).unwrap();
    let up = Tensor::from_vec_f32(&[2], vec![1.0, 3.0]).unwrap();
    swiglu.forward(&LayerIo::new(&[&gate, &up], &[&gate])).unwrap();
    let y = gate.to_vec_f32().unwrap();
    assert_abs_diff_eq!(y[1], 3.0 * silu_scalar(1.0), epsilon = 1e-6);
}

#[test]
fn test_swiglu_rejects_alias_on_up() {
    let swiglu = SwiGluLayer::new(Device::Cpu, &cpu_registry()).unwrap();
    let gate = Tensor::from_vec_f32(&[2], vec![1.0, 1.0]).unwrap();
    let up = Tensor::from_vec_f32(&[2], vec![1.0, 3.0]).unwrap();
    assert!(swiglu.check(&LayerIo::new(&[&gate, &up], &[&up])).is_err());
}
