//! External offset priors and their conversion into the operator's layout.
//!
//! Priors arrive in `(x, y)` axis order while the sampling operator consumes
//! tap-major interleaved `(dy, dx)` pairs, so every fusion starts with an
//! explicit reorder. Getting this wrong silently swaps sampling axes, which
//! is why the reorders live here as named, tested operations.

use burn::prelude::*;

/// The kind of external prior fused into the learned offsets.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum PriorKind {
    /// No external prior; the generator's offsets are used as-is.
    None,
    /// A dense flow field, one displacement per pixel, shared by all taps.
    Flow,
    /// Precomputed per-tap offsets, shared by all deformable groups.
    Precomputed,
}

/// An external displacement prior supplied alongside the input features.
#[derive(Debug, Clone)]
pub enum OffsetPrior<B: Backend> {
    /// Dense flow, `[batch, 2, height, width]`, channels in `(x, y)` order.
    Flow(Tensor<B, 4>),
    /// Per-tap offsets, `[batch, kh * kw, height, width, 2]`, last axis in
    /// `(x, y)` order.
    Precomputed(Tensor<B, 5>),
}

impl<B: Backend> OffsetPrior<B> {
    pub(crate) fn kind(&self) -> PriorKind {
        match self {
            Self::Flow(_) => PriorKind::Flow,
            Self::Precomputed(_) => PriorKind::Precomputed,
        }
    }
}

/// Expands a dense flow field into the operator's offset layout.
///
/// The `(x, y)` channels are flipped to `(y, x)` and tiled once per
/// `(group, tap)`, so every tap of every group is displaced by the same
/// per-pixel flow vector.
///
/// # Shapes
/// - flow: `[batch, 2, height, width]`
/// - output: `[batch, 2 * taps, height, width]`
pub fn tile_flow_prior<B: Backend>(flow: Tensor<B, 4>, taps: usize) -> Tensor<B, 4> {
    flow.flip([1]).repeat_dim(1, taps)
}

/// Broadcasts a precomputed per-tap prior across deformable groups and
/// reorders it into interleaved `(dy, dx)` pairs.
///
/// Even output channels receive the y component (last-axis index 1), odd
/// channels the x component (index 0).
///
/// # Shapes
/// - prior: `[batch, taps, height, width, 2]`
/// - output: `[batch, 2 * offset_groups * taps, height, width]`
pub fn reorder_precomputed_prior<B: Backend>(
    prior: Tensor<B, 5>,
    offset_groups: usize,
) -> Tensor<B, 4> {
    let [batch, taps, height, width, _] = prior.dims();
    let channels = offset_groups * taps;

    let prior = prior.repeat_dim(1, offset_groups);
    let x = prior
        .clone()
        .slice(s![.., .., .., .., 0..1])
        .reshape([batch, channels, height, width]);
    let y = prior
        .slice(s![.., .., .., .., 1..2])
        .reshape([batch, channels, height, width]);

    Tensor::stack::<5>(vec![y, x], 2).reshape([batch, 2 * channels, height, width])
}

/// Squashes raw offsets into `(-max_magnitude, max_magnitude)`.
pub fn bound_offsets<B: Backend>(raw: Tensor<B, 4>, max_magnitude: f64) -> Tensor<B, 4> {
    raw.tanh().mul_scalar(max_magnitude)
}
