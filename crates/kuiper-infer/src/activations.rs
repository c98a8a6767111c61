//! Scalar activation helpers used by the CPU kernels.

/// Computes SiLU (Swish) activation: x * sigmoid(x)
#[inline(always)]
pub fn silu_scalar(x: f32) -> f32 {
    if x <= -20.0 {
        0.0
    } else if x >= 20.0 {
        x
    } else {
        x / (1.0 + (-x).exp())
    }
}

/// Numerically stable in-place softmax over a slice.
pub fn softmax_inplace(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in values.iter_mut() {
        *v *= inv;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_silu() {
        assert_abs_diff_eq!(silu_scalar(0.0), 0.0);
        assert_abs_diff_eq!(silu_scalar(1.0), 0.731_058_6, epsilon = 1e-6);
        assert_abs_diff_eq!(silu_scalar(-30.0), 0.0);
        assert_abs_diff_eq!(silu_scalar(30.0), 30.0);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut v = vec![1.0, 2.0, 3.0, 1000.0];
        softmax_inplace(&mut v);
        assert_abs_diff_eq!(v.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(v[3], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_softmax_uniform() {
        let mut v = vec![0.5; 4];
        softmax_inplace(&mut v);
        for p in v {
            assert_abs_diff_eq!(p, 0.25, epsilon = 1e-6);
        }
    }
}
