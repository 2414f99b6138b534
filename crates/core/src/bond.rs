//! Bonds: weightless operations that glue constrained layers together.
//!
//! Every bond here is 1-sensitive (its output moves no more than its input
//! in the relevant norm), which is what lets [`crate::lipschitz`] compose a
//! network bound from per-layer weight norms alone.
//!
//! | Bond | Forward | Smooth |
//! |------|---------|--------|
//! | ReLU | `max(0, x)` | no |
//! | GeLU | `gelu(x) / 1.1289` | no |
//! | Tanh | `tanh(x)` | yes |
//! | Sigmoid | `σ(x)` | yes |
//! | RmsNorm | `x / √(mean(x²) + ε)` | yes |
//! | LayerNorm | `(x − μ) / √(var + ε)` | yes |
//! | Flatten | `(B, …) → (B, N)` | yes |
//! | MergeHeads | `(B, H, T, d) → (B, T, H·d)` | yes |
//! | CausalMask | upper triangle → large negative | yes |
//! | Softmax | last dimension | yes |
//!
//! Bonds that take more than one tensor (head splitting, attention products,
//! RoPE) are free functions or [`Rope`].

use candle_core::{DType, Device, Result, Tensor, D};
use parking_lot::Mutex;

/// Maximum slope of `gelu`; dividing by it makes the bond 1-Lipschitz.
pub const GELU_MAX_DERIVATIVE: f64 = 1.1289;

const NORM_EPS: f64 = 1e-5;
const MASK_VALUE: f32 = -1e9;
const ROPE_BASE: f32 = 10_000.0;

/// Single-input bonds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bond {
    ReLU,
    GeLU,
    Tanh,
    Sigmoid,
    RmsNorm,
    LayerNorm,
    Flatten,
    MergeHeads,
    CausalMask,
    Softmax,
}

impl Bond {
    /// Output change per unit input change. All bonds here are 1-sensitive.
    pub fn sensitivity(&self) -> f64 {
        1.0
    }

    pub fn is_smooth(&self) -> bool {
        !matches!(self, Self::ReLU | Self::GeLU)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::ReLU => x.relu(),
            Self::GeLU => gelu(x),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => candle_nn::ops::sigmoid(x),
            Self::RmsNorm => rms_norm(x),
            Self::LayerNorm => layer_norm(x),
            Self::Flatten => x.flatten_from(1),
            Self::MergeHeads => merge_heads(x),
            Self::CausalMask => causal_mask(x),
            Self::Softmax => candle_nn::ops::softmax(x, D::Minus1),
        }
    }
}

/// GeLU rescaled by its maximum derivative.
pub fn gelu(x: &Tensor) -> Result<Tensor> {
    x.gelu()?.affine(1.0 / GELU_MAX_DERIVATIVE, 0.0)
}

/// RMS normalisation over the last dimension (no learned gain).
pub fn rms_norm(x: &Tensor) -> Result<Tensor> {
    let var = x.sqr()?.mean_keepdim(D::Minus1)?;
    x.broadcast_div(&(var + NORM_EPS)?.sqrt()?)
}

/// Layer normalisation over the last dimension (no learned affine).
pub fn layer_norm(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    centered.broadcast_div(&(var + NORM_EPS)?.sqrt()?)
}

// ── Attention plumbing ──────────────────────────────────────────────────────

/// `(B, T, D) → (B, H, T, D / H)`.
pub fn split_heads(x: &Tensor, num_heads: usize) -> Result<Tensor> {
    let (b, t, d) = x.dims3()?;
    x.reshape((b, t, num_heads, d / num_heads))?
        .transpose(1, 2)?
        .contiguous()
}

/// Inverse of [`split_heads`]: `(B, H, T, d) → (B, T, H·d)`.
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (b, h, t, d) = x.dims4()?;
    x.transpose(1, 2)?.reshape((b, t, h * d))
}

/// Attention logits `q kᵀ / d_head`, shape `(B, H, T, T)`.
///
/// The `1/d` (rather than `1/√d`) scaling keeps the bond 1-sensitive for
/// unit-norm queries and keys.
pub fn attention_qk(q: &Tensor, k: &Tensor) -> Result<Tensor> {
    let d = q.dim(D::Minus1)?;
    q.matmul(&k.t()?)?.affine(1.0 / d as f64, 0.0)
}

/// Replace scores above the diagonal with a large negative value.
pub fn causal_mask(scores: &Tensor) -> Result<Tensor> {
    let t = scores.dim(D::Minus1)?;
    let device = scores.device();
    let mask = Tensor::tril2(t, DType::U8, device)?.broadcast_as(scores.dims())?;
    let masked = Tensor::full(MASK_VALUE, scores.dims(), device)?.to_dtype(scores.dtype())?;
    mask.where_cond(scores, &masked)
}

/// Attention output `scores · v`.
pub fn apply_attention_scores(v: &Tensor, scores: &Tensor) -> Result<Tensor> {
    scores.matmul(v)
}

// ── RoPE ────────────────────────────────────────────────────────────────────

/// Rotary position embedding on the half-split layout.
///
/// Rotation is orthogonal, so the bond is 1-sensitive. The sin/cos tables are
/// cached for the most recent sequence length.
pub struct Rope {
    rope_dim: usize,
    inv_freq: Vec<f32>,
    cache: Mutex<Option<(usize, Tensor, Tensor)>>,
}

impl Rope {
    pub fn new(head_dim: usize) -> Self {
        let rope_dim = head_dim / 2;
        let inv_freq = (0..rope_dim)
            .map(|i| 1.0 / ROPE_BASE.powf(i as f32 / rope_dim as f32))
            .collect();
        Self {
            rope_dim,
            inv_freq,
            cache: Mutex::new(None),
        }
    }

    /// `(sin, cos)` tables of shape `(1, 1, T, rope_dim)`.
    fn tables(&self, seq_len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let mut guard = self.cache.lock();
        if let Some((len, ref sin, ref cos)) = *guard {
            if len == seq_len && sin.device().same_device(device) {
                return Ok((sin.clone(), cos.clone()));
            }
        }
        let inv_freq = Tensor::from_slice(&self.inv_freq, (1, self.rope_dim), device)?;
        let positions = Tensor::arange(0u32, seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let sin = freqs.sin()?.reshape((1, 1, seq_len, self.rope_dim))?;
        let cos = freqs.cos()?.reshape((1, 1, seq_len, self.rope_dim))?;
        guard.replace((seq_len, sin.clone(), cos.clone()));
        Ok((sin, cos))
    }

    fn rotate(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _h, t, d) = x.dims4()?;
        if d != 2 * self.rope_dim {
            candle_core::bail!("rope expects head dim {}, got {d}", 2 * self.rope_dim);
        }
        let (sin, cos) = self.tables(t, x.device())?;
        let x1 = x.narrow(D::Minus1, self.rope_dim, self.rope_dim)?;
        let x2 = x.narrow(D::Minus1, 0, self.rope_dim)?;
        let y1 = (x1.broadcast_mul(&cos)? + x2.broadcast_mul(&sin)?)?;
        let y2 = (x2.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
        Tensor::cat(&[&y1, &y2], D::Minus1)
    }

    /// Rotate queries and keys, both `(B, H, T, d_head)`.
    pub fn forward(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.rotate(q)?, self.rotate(k)?))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn gelu_is_one_lipschitz() {
        let xs: Vec<f32> = (0..200).map(|i| -5.0 + i as f32 * 0.05).collect();
        let x = Tensor::new(xs.as_slice(), &Device::Cpu).unwrap();
        let y = gelu(&x).unwrap().to_vec1::<f32>().unwrap();
        for i in 1..y.len() {
            let slope = (y[i] - y[i - 1]) / 0.05;
            assert!(slope <= 1.0 + 1e-3, "slope {slope} at {i}");
        }
        assert!(!Bond::GeLU.is_smooth());
        assert!(Bond::Softmax.is_smooth());
    }

    #[test]
    fn rms_norm_gives_unit_rms() {
        let x = Tensor::new(&[[3f32, 4.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0]], &Device::Cpu).unwrap();
        let y = Bond::RmsNorm.forward(&x).unwrap();
        let rms = y
            .sqr()
            .unwrap()
            .mean_keepdim(1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(rms.iter().all(|&r| close(r, 1.0, 1e-3)));
    }

    #[test]
    fn layer_norm_centres_rows() {
        let x = Tensor::new(&[[1f32, 2.0, 3.0, 10.0]], &Device::Cpu).unwrap();
        let y = Bond::LayerNorm.forward(&x).unwrap();
        let mean = y.mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(close(mean, 0.0, 1e-5));
    }

    #[test]
    fn split_then_merge_is_identity() {
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let heads = split_heads(&x, 4).unwrap();
        assert_eq!(heads.dims(), &[2, 4, 5, 2]);
        let back = merge_heads(&heads).unwrap();
        let diff = (back - &x)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn causal_softmax_ignores_future() {
        let scores = Tensor::ones((1, 1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let masked = Bond::CausalMask.forward(&scores).unwrap();
        let probs = Bond::Softmax.forward(&masked).unwrap();
        let p = probs.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // Row 0 attends only to itself; row 1 splits evenly over two keys.
        assert!(close(p[0], 1.0, 1e-6) && close(p[1], 0.0, 1e-6) && close(p[2], 0.0, 1e-6));
        assert!(close(p[3], 0.5, 1e-6) && close(p[4], 0.5, 1e-6) && close(p[5], 0.0, 1e-6));
        assert!(close(p[6], 1.0 / 3.0, 1e-6));
    }

    #[test]
    fn attention_qk_scales_by_head_dim() {
        let q = Tensor::ones((1, 1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let s = attention_qk(&q, &q).unwrap();
        let v = s.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|&x| close(x, 1.0, 1e-6)));
        let out = apply_attention_scores(&q, &s).unwrap();
        assert_eq!(out.dims(), &[1, 1, 2, 4]);
    }

    #[test]
    fn rope_preserves_norm_and_caches() {
        let rope = Rope::new(8);
        let q = Tensor::randn(0f32, 1.0, (1, 2, 6, 8), &Device::Cpu).unwrap();
        let (rq, rk) = rope.forward(&q, &q).unwrap();
        let n_in = q.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let n_out = rq.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(close(n_in, n_out, 1e-3 * n_in));
        assert_eq!(rk.dims(), q.dims());
        assert_eq!(rope.cache.lock().as_ref().map(|c| c.0), Some(6));
    }

    #[test]
    fn rope_rejects_wrong_head_dim() {
        let rope = Rope::new(8);
        let q = Tensor::zeros((1, 1, 2, 6), DType::F32, &Device::Cpu).unwrap();
        assert!(rope.forward(&q, &q).is_err());
    }

    #[test]
    fn flatten_keeps_batch() {
        let x = Tensor::zeros((4, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(Bond::Flatten.forward(&x).unwrap().dims(), &[4, 12]);
        assert_eq!(Bond::ReLU.sensitivity(), 1.0);
    }

    #[test]
    fn tanh_and_sigmoid_are_bounded() {
        let x = Tensor::new(&[-100f32, 0.0, 100.0], &Device::Cpu).unwrap();
        let t = Bond::Tanh.forward(&x).unwrap().to_vec1::<f32>().unwrap();
        let s = Bond::Sigmoid.forward(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!(close(t[0], -1.0, 1e-6) && close(t[2], 1.0, 1e-6));
        assert!(close(s[1], 0.5, 1e-6));
    }
}
