// Shared by the unit tests of every module; not compiled into the library.
#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TransformerConfig;
use crate::gpu_ops::WgpuContext;
use crate::kernels::KernelRegistry;
use crate::tensor::Tensor;
use crate::weights::{BlockWeights, TransformerWeights};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A wgpu context, or `None` on machines without an adapter.
pub async fn gpu_context() -> Option<Arc<WgpuContext>> {
    init_logger();
    match WgpuContext::new().await {
        Ok(context) => Some(context),
        Err(e) => {
            eprintln!("no gpu adapter, skipping: {e}");
            None
        }
    }
}

pub fn cpu_registry() -> KernelRegistry {
    KernelRegistry::with_defaults(None)
}

pub fn assert_all_close(actual: &[f32], expected: &[f32], tolerance: f32, label: &str) {
    assert_eq!(actual.len(), expected.len(), "{label}: length mismatch");
    let (max_diff, index) = actual
        .iter()
        .zip(expected)
        .map(|(a, b)| (a - b).abs())
        .enumerate()
        .fold((0.0f32, 0), |(m, mi), (i, d)| if d > m { (d, i) } else { (m, mi) });
    if max_diff > tolerance {
        println!("actual:   {actual:?}");
        println!("expected: {expected:?}");
        panic!("{label}: max difference {max_diff} at index {index} exceeds {tolerance}");
    }
}

/// Uniform values in `[-scale, scale]`, reproducible per seed.
pub fn random_vec(len: usize, seed: u64, scale: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-scale..=scale)).collect()
}

pub fn random_tensor(shape: &[usize], seed: u64) -> Tensor {
    let len = shape.iter().product();
    Tensor::from_vec_f32(shape, random_vec(len, seed, 1.0)).unwrap()
}

/// Two blocks, grouped attention (2 query heads over 1 kv head).
pub fn tiny_config() -> TransformerConfig {
    TransformerConfig::new(8, 16, 2, 2, 1, 16, 8)
}

fn norm_weight(len: usize, seed: u64) -> Tensor {
    let data = random_vec(len, seed, 0.1).into_iter().map(|v| 1.0 + v).collect();
    Tensor::from_vec_f32(&[len], data).unwrap()
}

/// Small random weights; norms are close to one so activations stay tame.
pub fn deterministic_weights(config: &TransformerConfig, seed: u64) -> TransformerWeights {
    let (dim, kv_dim, hidden, vocab) = (
        config.dim,
        config.kv_dim(),
        config.hidden_dim,
        config.vocab_size,
    );
    let mut next_seed = seed;
    let mut matrix = |rows: usize, cols: usize| {
        next_seed += 1;
        let scale = 1.0 / (cols as f32).sqrt();
        Tensor::from_vec_f32(&[rows, cols], random_vec(rows * cols, next_seed, scale)).unwrap()
    };

    let embedding = matrix(vocab, dim);
    let classifier = (!config.tie_word_embeddings).then(|| matrix(vocab, dim));
    let blocks = (0..config.layer_num)
        .map(|i| {
            let s = seed + 1000 * (i as u64 + 1);
            BlockWeights {
                attention_norm: norm_weight(dim, s),
                wq: matrix(dim, dim),
                wk: matrix(kv_dim, dim),
                wv: matrix(kv_dim, dim),
                wo: matrix(dim, dim),
                ffn_norm: norm_weight(dim, s + 1),
                w1: matrix(hidden, dim),
                w2: matrix(dim, hidden),
                w3: matrix(hidden, dim),
                q_norm: config.qk_norm.then(|| norm_weight(config.head_size, s + 2)),
                k_norm: config.qk_norm.then(|| norm_weight(config.head_size, s + 3)),
            }
        })
        .collect();

    TransformerWeights {
        embedding,
        blocks,
        final_norm: norm_weight(dim, seed + 7),
        classifier,
    }
}
