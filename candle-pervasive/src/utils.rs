//! Log-space arithmetic and small activations shared by the controller.
//!
//! Everything here treats `-inf` as log(0): it is the identity of `log_add` and
//! reductions over only `-inf` stay at `-inf` instead of turning into NaN.

use candle::{Result, Tensor, D};

/// `ln(exp(a) + exp(b))`.
pub fn log_add(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        b
    } else if b == f32::NEG_INFINITY {
        a
    } else {
        let max = a.max(b);
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

/// `ln(sum_i exp(xs[i]))` over a slice, `-inf` for an empty or fully masked slice.
pub fn log_sum_exp(xs: &[f32]) -> f32 {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Log-sum-exp over an iterator, for reductions over strided buffers.
pub fn log_sum_exp_iter(xs: impl Iterator<Item = f32> + Clone) -> f32 {
    let max = xs.clone().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = xs.map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

/// `exp(x - norm)` where a masked `x` maps to exactly zero.
///
/// Keeps posteriors of impossible sequences (`norm == -inf`) at 0 rather than NaN.
pub fn exp_normalized(x: f32, norm: f32) -> f32 {
    if x == f32::NEG_INFINITY {
        0.0
    } else {
        (x - norm).exp()
    }
}

/// Numerically stable `ln(sigmoid(x)) = min(x, 0) - ln(1 + exp(-|x|))`.
///
/// Never evaluates `1 - sigmoid(x)`, so `log_sigmoid(x) - x` is an accurate
/// `ln(1 - sigmoid(x))` for large positive logits.
pub fn log_sigmoid(xs: &Tensor) -> Result<Tensor> {
    let head = xs.minimum(0f64)?;
    let tail = xs.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    head.sub(&tail)
}

/// Gated linear unit over the last dimension: `a * sigmoid(b)` with `[a, b] = xs`.
///
/// The gate is `exp(log_sigmoid(b))`, built from differentiable primitives.
pub fn glu(xs: &Tensor) -> Result<Tensor> {
    let dim = xs.dim(D::Minus1)?;
    if dim % 2 != 0 {
        candle::bail!("glu expects an even last dimension, got {dim}")
    }
    let half = dim / 2;
    let a = xs.narrow(D::Minus1, 0, half)?;
    let b = xs.narrow(D::Minus1, half, half)?;
    a.mul(&log_sigmoid(&b)?.exp()?)
}
