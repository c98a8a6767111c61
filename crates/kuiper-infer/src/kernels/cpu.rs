//! Host kernels built on ndarray views and rayon.
//!
//! Activations are copied out of their storage before computing and written
//! back afterwards, so a kernel never holds a read lock and a write lock on
//! the same storage. Weights are read in place.

use std::sync::Arc;

use anyhow::anyhow;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, Zip};
use rayon::prelude::*;

use crate::activations::{silu_scalar, softmax_inplace};
use crate::error::{EngineError, EngineResult};
use crate::kernels::{read_position, Kernel, KernelCall, KernelRegistry, OpKind, OpParams};
use crate::traits::Device;

pub fn register_all(registry: &mut KernelRegistry) {
    registry.register(OpKind::Embedding, Device::Cpu, Arc::new(CpuEmbedding));
    registry.register(OpKind::RmsNorm, Device::Cpu, Arc::new(CpuRmsNorm));
    registry.register(OpKind::Add, Device::Cpu, Arc::new(CpuAdd));
    registry.register(OpKind::Matmul, Device::Cpu, Arc::new(CpuMatmul));
    registry.register(OpKind::Rope, Device::Cpu, Arc::new(CpuRope));
    registry.register(OpKind::Attention, Device::Cpu, Arc::new(CpuAttention));
    registry.register(OpKind::SwiGlu, Device::Cpu, Arc::new(CpuSwiGlu));
}

// ============================================================================
//  Row primitives
// ============================================================================

/// `row[i] = row[i] / sqrt(mean(row^2) + eps) * weight[i]`
#[inline]
pub fn rms_norm_row(row: &mut [f32], weight: &[f32], eps: f32) {
    let sum_sq: f32 = row.iter().map(|v| v * v).sum();
    let scale = 1.0 / (sum_sq / row.len() as f32 + eps).sqrt();
    for (x, w) in row.iter_mut().zip(weight) {
        *x = *x * scale * *w;
    }
}

/// `y[r, o] = sum_i x[r, i] * w[o, i]`, parallel over output features.
pub fn matmul_rows(
    x: &[f32],
    w: &[f32],
    rows: usize,
    in_dim: usize,
    out_dim: usize,
) -> anyhow::Result<Vec<f32>> {
    if x.len() != rows * in_dim {
        return Err(anyhow!("matmul input has {} elements, expected {rows} x {in_dim}", x.len()));
    }
    if w.len() != out_dim * in_dim {
        return Err(anyhow!("matmul weight has {} elements, expected {out_dim} x {in_dim}", w.len()));
    }
    let w = ArrayView2::from_shape((out_dim, in_dim), w)?;
    let x = ArrayView2::from_shape((rows, in_dim), x)?;
    let mut out = vec![0.0f32; rows * out_dim];
    for (out_row, x_row) in out.chunks_mut(out_dim).zip(x.outer_iter()) {
        Zip::from(ArrayViewMut1::from(out_row))
            .and(w.rows())
            .par_for_each(|o, w_row| *o = w_row.dot(&x_row));
    }
    Ok(out)
}

/// Rotate-half RoPE over `rows` rows of `width` features split into heads.
///
/// `sin`/`cos` hold `rows * head_size / 2` angles, one table row per input row.
pub fn rope_rows(x: &mut [f32], width: usize, head_size: usize, sin: &[f32], cos: &[f32]) {
    let half = head_size / 2;
    for (r, row) in x.chunks_mut(width).enumerate() {
        let sin = &sin[r * half..(r + 1) * half];
        let cos = &cos[r * half..(r + 1) * half];
        for head in row.chunks_mut(head_size) {
            for i in 0..half {
                let x1 = head[i];
                let x2 = head[i + half];
                head[i] = x1 * cos[i] - x2 * sin[i];
                head[i + half] = x2 * cos[i] + x1 * sin[i];
            }
        }
    }
}

// ============================================================================
//  Kernels
// ============================================================================

pub struct CpuEmbedding;

impl Kernel for CpuEmbedding {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let tokens = call.input(0)?.to_vec_u32()?;
        let table = call.weight(0)?;
        let (vocab, dim) = (table.dim(0), table.dim(-1));

        let rows = table.with_f32(|w| {
            let mut rows = Vec::with_capacity(tokens.len() * dim);
            for &token in &tokens {
                let t = token as usize;
                if t >= vocab {
                    return Err(anyhow!("token id {token} outside vocabulary of {vocab}"));
                }
                rows.extend_from_slice(&w[t * dim..(t + 1) * dim]);
            }
            Ok(rows)
        })??;
        call.output(0)?.write_f32(&rows)
    }
}

pub struct CpuRmsNorm;

impl Kernel for CpuRmsNorm {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let OpParams::RmsNorm { dim, eps } = call.params else {
            return Err(EngineError::Internal(anyhow!("rmsnorm launched without its params")));
        };
        let mut x = call.input(0)?.to_vec_f32()?;
        let weight = call.weight(0)?.to_vec_f32()?;
        x.par_chunks_mut(dim)
            .for_each(|row| rms_norm_row(row, &weight, eps));
        call.output(0)?.write_f32(&x)
    }
}

pub struct CpuAdd;

impl Kernel for CpuAdd {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let mut a = call.input(0)?.to_vec_f32()?;
        let b = call.input(1)?.to_vec_f32()?;
        a.par_iter_mut().zip(b.par_iter()).for_each(|(a, b)| *a += b);
        call.output(0)?.write_f32(&a)
    }
}

pub struct CpuMatmul;

impl Kernel for CpuMatmul {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let x = call.input(0)?.to_vec_f32()?;
        let weight = call.weight(0)?;
        let (out_dim, in_dim) = (weight.dim(0), weight.dim(1));
        if in_dim == 0 || x.len() % in_dim != 0 {
            return Err(EngineError::Internal(anyhow!(
                "matmul input of {} elements is not a whole number of {in_dim}-wide rows",
                x.len()
            )));
        }
        let rows = x.len() / in_dim;
        let y = weight.with_f32(|w| matmul_rows(&x, w, rows, in_dim, out_dim))??;
        call.output(0)?.write_f32(&y)
    }
}

pub struct CpuRope;

impl Kernel for CpuRope {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let OpParams::Rope { head_size } = call.params else {
            return Err(EngineError::Internal(anyhow!("rope launched without its params")));
        };
        let (query, key) = (call.input(0)?, call.input(1)?);
        let pos = read_position(call.input(2)?)?;
        let (q_width, k_width) = (query.dim(-1), key.dim(-1));
        let rows = query.num_elements() / q_width;

        let half = head_size / 2;
        let sin = call.weight(0)?.view(pos * half, &[rows * half])?.to_vec_f32()?;
        let cos = call.weight(1)?.view(pos * half, &[rows * half])?.to_vec_f32()?;

        let mut q = query.to_vec_f32()?;
        let mut k = key.to_vec_f32()?;
        rope_rows(&mut q, q_width, head_size, &sin, &cos);
        rope_rows(&mut k, k_width, head_size, &sin, &cos);
        query.write_f32(&q)?;
        key.write_f32(&k)
    }
}

pub struct CpuAttention;

impl Kernel for CpuAttention {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let OpParams::Attention {
            head_num,
            kv_head_num,
            head_size,
        } = call.params
        else {
            return Err(EngineError::Internal(anyhow!("attention launched without its params")));
        };
        let query = call.input(0)?;
        let pos = read_position(call.input(1)?)?;
        let key_cache = call.input(2)?;
        let value_cache = call.input(3)?;
        let (out, score) = (call.output(0)?, call.output(1)?);

        let dim = head_num * head_size;
        let kv_dim = kv_head_num * head_size;
        let kv_mul = head_num / kv_head_num;
        let seq_len = key_cache.dim(0);
        let scale = 1.0 / (head_size as f32).sqrt();

        let q = query.to_vec_f32()?;
        let k = key_cache.to_vec_f32()?;
        let v = value_cache.to_vec_f32()?;
        let rows = q.len() / dim;

        let mut o = vec![0.0f32; rows * dim];
        let mut scores = vec![0.0f32; head_num * seq_len];
        for r in 0..rows {
            // Row r sits at absolute position pos + r and sees slots 0..=pos + r.
            let visible = pos + r + 1;
            let q_row = &q[r * dim..(r + 1) * dim];
            o[r * dim..(r + 1) * dim]
                .par_chunks_mut(head_size)
                .zip(scores.par_chunks_mut(seq_len))
                .enumerate()
                .for_each(|(h, (o_head, s))| {
                    let kv_off = (h / kv_mul) * head_size;
                    let q_head = ArrayView1::from(&q_row[h * head_size..(h + 1) * head_size]);
                    for (t, s_t) in s.iter_mut().enumerate().take(visible) {
                        let k_head = ArrayView1::from(
                            &k[t * kv_dim + kv_off..t * kv_dim + kv_off + head_size],
                        );
                        *s_t = q_head.dot(&k_head) * scale;
                    }
                    s[visible..].fill(0.0);
                    softmax_inplace(&mut s[..visible]);

                    o_head.fill(0.0);
                    for (t, &p) in s[..visible].iter().enumerate() {
                        let v_head = &v[t * kv_dim + kv_off..t * kv_dim + kv_off + head_size];
                        for (acc, &val) in o_head.iter_mut().zip(v_head) {
                            *acc += p * val;
                        }
                    }
                });
        }
        score.write_f32(&scores)?;
        out.write_f32(&o)
    }
}

pub struct CpuSwiGlu;

impl Kernel for CpuSwiGlu {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let mut gate = call.input(0)?.to_vec_f32()?;
        let up = call.input(1)?.to_vec_f32()?;
        gate.par_iter_mut()
            .zip(up.par_iter())
            .for_each(|(g, u)| *g = silu_scalar(*g) * u);
        call.output(0)?.write_f32(&gate)
    }
}
