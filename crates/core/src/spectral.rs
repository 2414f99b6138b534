//! Spectral numerics: orthogonalisation, norm estimation, and the weight
//! projections that keep every layer inside its norm budget.
//!
//! All functions operate on a single 2-D weight `(out, in)` and never record
//! gradients; callers pass detached tensors from the optimiser.
//!
//! # Norm convention
//!
//! Layer norms are reported as RMS→RMS operator norms,
//! `‖W‖ = σ_max(W) · √(in/out)`. An orthogonal matrix scaled by `√(out/in)`
//! therefore has norm 1, and [`spectral_normalize`] with budget `w_max`
//! guarantees `‖W‖ ≤ w_max`.

use candle_core::{DType, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Tuned quintic coefficients: drive every singular value towards 1 without
/// overshooting it.
const ORTHO_COEFFS: [(f64, f64, f64); 5] = [
    (4.0848, -6.8946, 2.9270),
    (3.9505, -6.3029, 2.6377),
    (3.7418, -5.5913, 2.3037),
    (2.8769, -3.1427, 1.2046),
    (2.8366, -3.0525, 1.2012),
];

/// Classic Muon coefficients (maximal slope at zero).
const NS5_COEFFS: (f64, f64, f64) = (3.4445, -4.7750, 2.0315);

/// Power-iteration steps used by [`spectral_normalize`].
pub const POWER_ITERS: usize = 26;

const ORTHO_EPS: f64 = 1e-7;
const POWER_EPS: f64 = 1e-8;
const NORMALIZE_EPS: f64 = 1e-12;
/// Grid resolution for the soft-cap coupling root search on `[0, 1]`.
const COUPLING_GRID: usize = 4096;

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Frobenius norm as f64.
pub fn frobenius_norm(m: &Tensor) -> Result<f64> {
    let sq = m.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
    Ok((sq as f64).sqrt())
}

/// `√(out/in)` for a weight of shape `(out, in)`.
pub fn shape_scale(m: &Tensor) -> Result<f64> {
    let (out, inp) = m.dims2()?;
    Ok((out as f64 / inp as f64).sqrt())
}

/// Run `step` on the wide orientation of `m` (rows ≤ cols), transposing in
/// and out when needed.
fn on_wide<F>(m: &Tensor, step: F) -> Result<Tensor>
where
    F: FnOnce(Tensor) -> Result<Tensor>,
{
    let (rows, cols) = m.dims2()?;
    if rows > cols {
        step(m.t()?.contiguous()?)?.t()?.contiguous()
    } else {
        step(m.contiguous()?)
    }
}

fn quintic_step(x: &Tensor, a: f64, b: f64, c: f64) -> Result<Tensor> {
    let gram = x.matmul(&x.t()?)?;
    let poly = (gram.affine(b, 0.0)? + gram.matmul(&gram)?.affine(c, 0.0)?)?;
    x.affine(a, 0.0)? + poly.matmul(x)?
}

// ── Orthogonalisation ───────────────────────────────────────────────────────

/// Approximately replace every singular value of `m` with 1.
///
/// Pre-normalising by the Frobenius norm puts all singular values in
/// `(0, 1]`; five tuned quintic steps then push them up towards 1.
pub fn orthogonalize(m: &Tensor) -> Result<Tensor> {
    let m = m.to_dtype(DType::F32)?;
    on_wide(&m, |x| {
        let norm = frobenius_norm(&x)?;
        let mut x = x.affine(1.0 / (norm + ORTHO_EPS), 0.0)?;
        for (a, b, c) in ORTHO_COEFFS {
            x = quintic_step(&x, a, b, c)?;
        }
        Ok(x)
    })
}

/// Newton–Schulz "zeroth power" with the classic Muon coefficients.
///
/// Converges faster near zero than [`orthogonalize`] but leaves singular
/// values spread roughly over `[0.7, 1.2]`.
pub fn zeropower_via_newtonschulz5(g: &Tensor, steps: usize) -> Result<Tensor> {
    let g = g.to_dtype(DType::F32)?;
    let (a, b, c) = NS5_COEFFS;
    on_wide(&g, |x| {
        let norm = frobenius_norm(&x)?;
        let mut x = x.affine(1.0 / (norm + ORTHO_EPS), 0.0)?;
        for _ in 0..steps {
            x = quintic_step(&x, a, b, c)?;
        }
        Ok(x)
    })
}

// ── Norm estimation ─────────────────────────────────────────────────────────

/// Estimate the largest singular value of `m` by power iteration.
///
/// The start vector is drawn from a `StdRng` seeded with `seed`, so the
/// estimate is deterministic.
pub fn power_iteration(m: &Tensor, iters: usize, seed: u64) -> Result<f64> {
    let m = m.to_dtype(DType::F32)?;
    let (rows, _) = m.dims2()?;
    let mut rng = StdRng::seed_from_u64(seed);
    let init: Vec<f32> = (0..rows).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let mut u = Tensor::from_vec(init, (1, rows), m.device())?;
    let mt = m.t()?;
    for _ in 0..iters {
        let v = u.matmul(&m)?;
        u = v.matmul(&mt)?;
        let n = frobenius_norm(&u)?;
        u = u.affine(1.0 / (n + POWER_EPS), 0.0)?;
    }
    frobenius_norm(&u.matmul(&m)?)
}

/// RMS→RMS operator norm `σ_max · √(in/out)` of a linear weight.
pub fn rms_operator_norm(w: &Tensor) -> Result<f64> {
    let sigma = power_iteration(w, POWER_ITERS, 0)?;
    Ok(sigma / shape_scale(w)?)
}

/// Largest row RMS of an embedding table `(vocab, d)`.
pub fn max_row_rms(w: &Tensor) -> Result<f64> {
    let rms = w
        .to_dtype(DType::F32)?
        .sqr()?
        .mean_keepdim(1)?
        .sqrt()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    Ok(rms as f64)
}

// ── Projections ─────────────────────────────────────────────────────────────

/// Scale `w` down just enough that `σ_max(w) ≤ w_max · √(out/in)`.
///
/// Weights already inside the budget are returned unchanged.
pub fn spectral_normalize(w: &Tensor, w_max: f64) -> Result<Tensor> {
    let sigma = power_iteration(w, POWER_ITERS, 0)?;
    let budget = w_max * shape_scale(w)?;
    let scale_down = (sigma / budget).max(1.0);
    w.affine(1.0 / (scale_down + NORMALIZE_EPS), 0.0)
}

/// Polynomial soft cap: approximately `min(1, σ)` on every singular value.
///
/// Two odd cubic steps, `M ← M − αMMᵀM` then `M ← M + αMMᵀM`. `alpha`
/// should come from [`soft_cap_coupling`].
pub fn soft_cap(m: &Tensor, alpha: f64) -> Result<Tensor> {
    let m = m.to_dtype(DType::F32)?;
    let (rows, cols) = m.dims2()?;
    let step = |x: Tensor| -> Result<Tensor> {
        let mut x = x;
        for b in [-alpha, alpha] {
            let gram = x.matmul(&x.t()?)?;
            x = (&x + gram.matmul(&x)?.affine(b, 0.0)?)?;
        }
        Ok(x)
    };
    // Iterate on the tall orientation.
    if cols > rows {
        step(m.t()?.contiguous()?)?.t()?.contiguous()
    } else {
        step(m)
    }
}

/// Coupling strength for [`soft_cap`] that keeps singular values at or below
/// `w_max` after a weight-decayed update of norm `max_update_norm`.
///
/// With `k = w_max(1 − wd) + max_update_norm` (the largest singular value the
/// update can produce), solves
/// `−k⁹α⁴ + 3k⁷α³ − 3k⁵α² + (k − w_max) = 0` for the smallest root in
/// `[0, 1]`. Returns 1.0 when no such root exists.
pub fn soft_cap_coupling(w_max: f64, wd: f64, max_update_norm: f64) -> f64 {
    let k = w_max * (1.0 - wd) + max_update_norm;
    let p = |a: f64| {
        let a2 = a * a;
        -k.powi(9) * a2 * a2 + 3.0 * k.powi(7) * a2 * a - 3.0 * k.powi(5) * a2 + (k - w_max)
    };

    let mut lo = 0.0;
    let mut p_lo = p(lo);
    if p_lo == 0.0 {
        return 0.0;
    }
    for i in 1..=COUPLING_GRID {
        let hi = i as f64 / COUPLING_GRID as f64;
        let p_hi = p(hi);
        if p_hi == 0.0 {
            return hi;
        }
        if p_lo.signum() != p_hi.signum() {
            return bisect(&p, lo, hi);
        }
        lo = hi;
        p_lo = p_hi;
    }
    1.0
}

fn bisect(f: &impl Fn(f64) -> f64, mut lo: f64, mut hi: f64) -> f64 {
    let lo_sign = f(lo).signum();
    for _ in 0..60 {
        let mid = 0.5 * (lo + hi);
        if f(mid).signum() == lo_sign {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Rescale rows whose RMS exceeds `w_max` back onto it (embedding projection).
pub fn cap_row_rms(w: &Tensor, w_max: f64) -> Result<Tensor> {
    let rms = w.sqr()?.mean_keepdim(1)?.sqrt()?;
    let factor = rms
        .affine(1.0 / w_max, 0.0)?
        .clamp(1.0f32, f32::MAX)?
        .to_dtype(w.dtype())?;
    w.broadcast_div(&factor)
}

/// Rescale every row to RMS exactly `target` (embedding initialisation).
pub fn normalize_rows(w: &Tensor, target: f64) -> Result<Tensor> {
    let rms = (w.sqr()?.mean_keepdim(1)?.sqrt()? + 1e-12)?;
    w.broadcast_div(&rms)?.affine(target, 0.0)
}

/// Row-wise RMS normalisation of a gradient (embedding "dualisation").
pub fn dualize_rows(g: &Tensor) -> Result<Tensor> {
    normalize_rows(g, 1.0)
}

// ── Tests ───────────────────────────────────────────────────────────────────
