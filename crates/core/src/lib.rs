//! # lipschitz-core — models with bounded weight norms
//!
//! Everything that touches tensors but not the training loop:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`bond`] | weightless modules: activations, head split/merge, causal mask, RoPE |
//! | [`spectral`] | orthogonalisation, power iteration, spectral normalise, soft cap |
//! | [`linear`] | `ConstrainedLinear`, `ConstrainedEmbedding`, `LayerSpec` |
//! | [`model`] | `Mlp`, `Gpt`, the `Model` enum and `create_model` |
//! | [`lipschitz`] | Lipschitz bound from per-layer weight norms |
//!
//! ## Conventions
//!
//! 1. **Weights are `(out, in)`** and bias-free; every layer stores one
//!    tensor under `"{layer}.weight"`.
//! 2. **Norms are RMS→RMS.** A linear weight's norm is `σ_max · √(in/out)`,
//!    so an orthogonal init scaled by `√(out/in)` has norm 1.
//! 3. **`Send + Sync`.** The RoPE table cache uses `parking_lot::Mutex`.

pub mod bond;
pub mod linear;
pub mod lipschitz;
pub mod model;
pub mod spectral;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use bond::{Bond, Rope, GELU_MAX_DERIVATIVE};
pub use linear::{ConstrainedEmbedding, ConstrainedLinear, LayerKind, LayerSpec};
pub use lipschitz::calculate_lipschitz_constant;
pub use model::{create_model, layer_specs, Gpt, Mlp, Model};
pub use spectral::{
    orthogonalize, power_iteration, soft_cap, soft_cap_coupling, spectral_normalize,
    zeropower_via_newtonschulz5,
};
