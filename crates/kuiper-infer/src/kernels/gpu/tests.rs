//! GPU kernels against their CPU counterparts, driven through the layers.
//! Every test returns early when no adapter is available.

use std::sync::Arc;

use crate::attention::MultiHeadAttention;
use crate::embeddings::EmbeddingLayer;
use crate::feedforward::SwiGluLayer;
use crate::gpu_ops::WgpuContext;
use crate::kernels::KernelRegistry;
use crate::linear_layer::LinearLayer;
use crate::normalization::RmsNormLayer;
use crate::ops::AddLayer;
use crate::rope::RopeLayer;
use crate::tensor::{DType, Tensor};
use crate::tests::common::{assert_all_close, cpu_registry, gpu_context, random_tensor};
use crate::traits::{Device, Layer, LayerIo};

fn gpu(t: &Tensor, context: &Arc<WgpuContext>) -> Tensor {
    t.to_device(Device::Wgpu, Some(context)).unwrap()
}

fn gpu_zeros(shape: &[usize], context: &Arc<WgpuContext>) -> Tensor {
    Tensor::zeros(shape, DType::F32, Device::Wgpu, Some(context)).unwrap()
}

fn cpu_zeros(shape: &[usize]) -> Tensor {
    Tensor::zeros(shape, DType::F32, Device::Cpu, None).unwrap()
}

#[tokio::test]
async fn test_rms_norm_parity() {
    let Some(context) = gpu_context().await else {
        return;
    };
    let registry = KernelRegistry::with_defaults(Some(&context));
    let weight = random_tensor(&[64], 1);
    let input = random_tensor(&[5, 64], 2);

    let cpu_norm = RmsNormLayer::new("rms", Device::Cpu, &cpu_registry(), weight.clone(), 1e-5).unwrap();
    let gpu_norm =
        RmsNormLayer::new("rms", Device::Wgpu, &registry, gpu(&weight, &context), 1e-5).unwrap();

    let expected = cpu_zeros(&[5, 64]);
    cpu_norm.forward(&LayerIo::new(&[&input], &[&expected])).unwrap();
    let actual = gpu_zeros(&[5, 64], &context);
    gpu_norm
        .forward(&LayerIo::new(&[&gpu(&input, &context)], &[&actual]))
        .unwrap();

    assert_all_close(
        &actual.to_vec_f32().unwrap(),
        &expected.to_vec_f32().unwrap(),
        1e-4,
        "rmsnorm",
    );
}

#[tokio::test]
async fn test_matmul_parity_into_view() {
    let Some(context) = gpu_context().await else {
        return;
    };
    let registry = KernelRegistry::with_defaults(Some(&context));
    let weight = random_tensor(&[24, 32], 3);
    let x = random_tensor(&[3, 32], 4);

    let cpu_linear = LinearLayer::new("wk", Device::Cpu, &cpu_registry(), weight.clone()).unwrap();
    let gpu_linear = LinearLayer::new("wk", Device::Wgpu, &registry, gpu(&weight, &context)).unwrap();

    let expected = cpu_zeros(&[3, 24]);
    cpu_linear.forward(&LayerIo::new(&[&x], &[&expected])).unwrap();

    // write into rows 2..5 of a larger buffer, as the kv cache slots are
    let cache = gpu_zeros(&[8, 24], &context);
    let slot = cache.view(2 * 24, &[3, 24]).unwrap();
    gpu_linear
        .forward(&LayerIo::new(&[&gpu(&x, &context)], &[&slot]))
        .unwrap();

    assert_all_close(
        &slot.to_vec_f32().unwrap(),
        &expected.to_vec_f32().unwrap(),
        1e-4,
        "matmul",
    );
    let all = cache.to_vec_f32().unwrap();
    assert!(all[..48].iter().chain(&all[120..]).all(|&v| v == 0.0));
}

#[tokio::test]
async fn test_matmul_rows_past_grid_limit() {
    let Some(context) = gpu_context().await else {
        return;
    };
    let registry = KernelRegistry::with_defaults(Some(&context));
    let rows = 70_000;
    // y = [x0 + x1, x0 - x1]
    let weight = Tensor::from_vec_f32(&[2, 2], vec![1.0, 1.0, 1.0, -1.0]).unwrap();
    let x_host: Vec<f32> = (0..rows).flat_map(|r| [r as f32, 1.0]).collect();
    let x = Tensor::from_vec_f32(&[rows, 2], x_host).unwrap();

    let linear = LinearLayer::new("wq", Device::Wgpu, &registry, gpu(&weight, &context)).unwrap();
    let y = gpu_zeros(&[rows, 2], &context);
    linear
        .forward(&LayerIo::new(&[&gpu(&x, &context)], &[&y]))
        .unwrap();

    let y = y.to_vec_f32().unwrap();
    for r in [0, 65_534, 65_535, 65_536, rows - 1] {
        assert_eq!(y[2 * r], r as f32 + 1.0, "row {r}");
        assert_eq!(y[2 * r + 1], r as f32 - 1.0, "row {r}");
    }
}

#[tokio::test]
async fn test_add_and_swiglu_parity() {
    let Some(context) = gpu_context().await else {
        return;
    };
    let registry = KernelRegistry::with_defaults(Some(&context));
    let a = random_tensor(&[4, 16], 5);
    let b = random_tensor(&[4, 16], 6);

    let add = AddLayer::new(Device::Wgpu, &registry).unwrap();
    let (ga, gb) = (gpu(&a, &context), gpu(&b, &context));
    let fresh = gpu_zeros(&[4, 16], &context);
    add.forward(&LayerIo::new(&[&ga, &gb], &[&fresh])).unwrap();
    add.forward(&LayerIo::new(&[&ga, &gb], &[&ga])).unwrap();

    let sum: Vec<f32> = a
        .to_vec_f32()
        .unwrap()
        .iter()
        .zip(b.to_vec_f32().unwrap())
        .map(|(x, y)| x + y)
        .collect();
    assert_all_close(&fresh.to_vec_f32().unwrap(), &sum, 1e-6, "add");
    assert_all_close(&ga.to_vec_f32().unwrap(), &sum, 1e-6, "add in place");

    let cpu_swiglu = SwiGluLayer::new(Device::Cpu, &cpu_registry()).unwrap();
    let gpu_swiglu = SwiGluLayer::new(Device::Wgpu, &registry).unwrap();
    let expected = cpu_zeros(&[4, 16]);
    cpu_swiglu.forward(&LayerIo::new(&[&a, &b], &[&expected])).unwrap();
    let gate = gpu(&a, &context);
    gpu_swiglu
        .forward(&LayerIo::new(&[&gate, &gpu(&b, &context)], &[&gate]))
        .unwrap();
    assert_all_close(
        &gate.to_vec_f32().unwrap(),
        &expected.to_vec_f32().unwrap(),
        1e-5,
        "swiglu",
    );
}

#[tokio::test]
async fn test_embedding_parity() {
    let Some(context) = gpu_context().await else {
        return;
    };
    let registry = KernelRegistry::with_defaults(Some(&context));
    let table = random_tensor(&[10, 12], 7);
    let layer = EmbeddingLayer::new(Device::Wgpu, &registry, gpu(&table, &context)).unwrap();

    let tokens = Tensor::from_vec_u32(&[3], vec![9, 0, 4]).unwrap();
    let out = gpu_zeros(&[3, 12], &context);
    layer.forward(&LayerIo::new(&[&tokens], &[&out])).unwrap();

    let rows = table.to_vec_f32().unwrap();
    let expected: Vec<f32> = [9usize, 0, 4]
        .iter()
        .flat_map(|&t| rows[t * 12..(t + 1) * 12].to_vec())
        .collect();
    assert_eq!(out.to_vec_f32().unwrap(), expected);
}

#[tokio::test]
async fn test_rope_parity() {
    let Some(context) = gpu_context().await else {
        return;
    };
    let registry = KernelRegistry::with_defaults(Some(&context));
    let cpu_rope = RopeLayer::new(Device::Cpu, &cpu_registry(), None, 8, 16, 10000.0).unwrap();
    let gpu_rope =
        RopeLayer::new(Device::Wgpu, &registry, Some(&context), 8, 16, 10000.0).unwrap();

    let q = random_tensor(&[2, 32], 8);
    let k = random_tensor(&[2, 16], 9);
    let (gq, gk) = (gpu(&q, &context), gpu(&k, &context));
    let pos = Tensor::scalar_u32(5);

    cpu_rope.forward(&LayerIo::new(&[&q, &k, &pos], &[])).unwrap();
    gpu_rope.forward(&LayerIo::new(&[&gq, &gk, &pos], &[])).unwrap();

    assert_all_close(&gq.to_vec_f32().unwrap(), &q.to_vec_f32().unwrap(), 1e-4, "rope q");
    assert_all_close(&gk.to_vec_f32().unwrap(), &k.to_vec_f32().unwrap(), 1e-4, "rope k");
}

#[tokio::test]
async fn test_attention_parity() {
    let Some(context) = gpu_context().await else {
        return;
    };
    let registry = KernelRegistry::with_defaults(Some(&context));
    let (head_num, kv_head_num, head_size, seq_len) = (4, 2, 8, 12);
    let dim = head_num * head_size;

    let q = random_tensor(&[3, dim], 10);
    let key = random_tensor(&[seq_len, kv_head_num * head_size], 11);
    let value = random_tensor(&[seq_len, kv_head_num * head_size], 12);
    let pos = Tensor::scalar_u32(4);

    let cpu_mha =
        MultiHeadAttention::new(Device::Cpu, &cpu_registry(), head_num, kv_head_num, head_size)
            .unwrap();
    let (out, score) = (cpu_zeros(&[3, dim]), cpu_zeros(&[head_num, seq_len]));
    cpu_mha
        .forward(&LayerIo::new(&[&q, &pos, &key, &value], &[&out, &score]))
        .unwrap();

    let gpu_mha =
        MultiHeadAttention::new(Device::Wgpu, &registry, head_num, kv_head_num, head_size).unwrap();
    let (g_out, g_score) = (gpu_zeros(&[3, dim], &context), gpu_zeros(&[head_num, seq_len], &context));
    gpu_mha
        .forward(&LayerIo::new(
            &[
                &gpu(&q, &context),
                &pos,
                &gpu(&key, &context),
                &gpu(&value, &context),
            ],
            &[&g_out, &g_score],
        ))
        .unwrap();

    assert_all_close(&g_out.to_vec_f32().unwrap(), &out.to_vec_f32().unwrap(), 1e-4, "attention");
    assert_all_close(&g_score.to_vec_f32().unwrap(), &score.to_vec_f32().unwrap(), 1e-5, "scores");
}

#[tokio::test]
async fn test_cpu_operand_on_gpu_layer_is_rejected() {
    let Some(context) = gpu_context().await else {
        return;
    };
    let registry = KernelRegistry::with_defaults(Some(&context));
    let add = AddLayer::new(Device::Wgpu, &registry).unwrap();
    let a = gpu_zeros(&[4], &context);
    let b = cpu_zeros(&[4]);
    let err = add.forward(&LayerIo::new(&[&a, &b], &[&a])).unwrap_err();
    assert!(err.is_invalid_argument());
}
