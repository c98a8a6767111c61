use approx::assert_abs_diff_eq;

use super::*;
use crate::error::EngineError;
use crate::kernels::KernelRegistry;
use crate::tensor::{DType, Tensor};
use crate::tests::common::{assert_all_close, cpu_registry, random_tensor};
use crate::traits::{Device, Layer, LayerIo};

fn layer(weight: Vec<f32>, eps: f32) -> RmsNormLayer {
    let dim = weight.len();
    let weight = Tensor::from_vec_f32(&[dim], weight).unwrap();
    RmsNormLayer::new("rms", Device::Cpu, &cpu_registry(), weight, eps).unwrap()
}

#[test]
fn test_flat_hand_picked() {
    let norm = layer(vec![1.0, 1.0], 1e-5);
    let input = Tensor::from_vec_f32(&[2], vec![3.0, 4.0]).unwrap();
    let output = Tensor::zeros(&[2], DType::F32, Device::Cpu, None).unwrap();

    norm.forward(&LayerIo::new(&[&input], &[&output])).unwrap();

    let y = output.to_vec_f32().unwrap();
    assert_abs_diff_eq!(y[0], 0.8485, epsilon = 1e-3);
    assert_abs_diff_eq!(y[1], 1.1314, epsilon = 1e-3);
}

#[test]
fn test_weight_scales_output() {
    let norm = layer(vec![2.0, 0.5], 0.0);
    let input = Tensor::from_vec_f32(&[2], vec![3.0, 4.0]).unwrap();
    let output = Tensor::zeros(&[2], DType::F32, Device::Cpu, None).unwrap();
    norm.forward(&LayerIo::new(&[&input], &[&output])).unwrap();

    let rms = (12.5f32).sqrt();
    assert_all_close(
        &output.to_vec_f32().unwrap(),
        &[3.0 / rms * 2.0, 4.0 / rms * 0.5],
        1e-5,
        "scaled rmsnorm",
    );
}

#[test]
fn test_batched_matches_flat_rows() {
    let norm = RmsNormLayer::new(
        "rms",
        Device::Cpu,
        &cpu_registry(),
        random_tensor(&[4], 3),
        1e-5,
    )
    .unwrap();
    let input = random_tensor(&[3, 4], 11);
    let batched = Tensor::zeros(&[3, 4], DType::F32, Device::Cpu, None).unwrap();
    norm.forward(&LayerIo::new(&[&input], &[&batched])).unwrap();

    let flat = Tensor::zeros(&[4], DType::F32, Device::Cpu, None).unwrap();
    for r in 0..3 {
        let row = input.view(r * 4, &[4]).unwrap();
        norm.forward(&LayerIo::new(&[&row], &[&flat])).unwrap();
        assert_all_close(
            &batched.view(r * 4, &[4]).unwrap().to_vec_f32().unwrap(),
            &flat.to_vec_f32().unwrap(),
            1e-6,
            &format!("row {r}"),
        );
    }
}

#[test]
fn test_batched_accepts_any_leading_shape() {
    let norm = layer(vec![1.0; 4], 1e-5);
    let input = random_tensor(&[2, 3, 4], 5);
    let output = Tensor::zeros(&[6, 4], DType::F32, Device::Cpu, None).unwrap();
    assert!(norm.check(&LayerIo::new(&[&input], &[&output])).is_ok());
}

#[test]
fn test_wrong_trailing_dim_writes_nothing() {
    let norm = layer(vec![1.0; 4], 1e-5);
    let input = random_tensor(&[2, 5], 1);
    let output = Tensor::from_vec_f32(&[2, 4], vec![7.0; 8]).unwrap();

    let err = norm
        .forward(&LayerIo::new(&[&input], &[&output]))
        .unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.to_string().contains("dim -1"), "{err}");
    assert_eq!(output.to_vec_f32().unwrap(), vec![7.0; 8]);
}

#[test]
fn test_flat_rejects_short_output() {
    let norm = layer(vec![1.0; 4], 1e-5);
    let input = random_tensor(&[4], 1);
    let output = Tensor::zeros(&[3], DType::F32, Device::Cpu, None).unwrap();
    match norm.check(&LayerIo::new(&[&input], &[&output])) {
        Err(EngineError::InvalidArgument { tensor, .. }) => assert_eq!(tensor, "output"),
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
}

#[test]
fn test_in_place_is_rejected() {
    let norm = layer(vec![1.0; 4], 1e-5);
    let x = random_tensor(&[2, 4], 9);
    let err = norm.check(&LayerIo::new(&[&x], &[&x])).unwrap_err();
    assert!(err.is_invalid_argument());
}

#[test]
fn test_wrong_arity() {
    let norm = layer(vec![1.0; 4], 1e-5);
    let x = random_tensor(&[4], 9);
    assert!(norm.check(&LayerIo::new(&[&x, &x], &[])).is_err());
}

#[test]
fn test_missing_kernel_at_construction() {
    let weight = Tensor::from_vec_f32(&[4], vec![1.0; 4]).unwrap();
    let err = RmsNormLayer::new("rms", Device::Cpu, &KernelRegistry::new(), weight, 1e-5)
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::MissingKernel { .. }));
}

#[test]
fn test_gpu_layer_without_context() {
    let weight = Tensor::from_vec_f32(&[4], vec![1.0; 4]).unwrap();
    let err = RmsNormLayer::new("rms", Device::Wgpu, &cpu_registry(), weight, 1e-5)
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::DeviceUnavailable(_)));
}
