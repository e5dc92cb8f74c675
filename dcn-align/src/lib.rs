//! Deformable alignment modules for video and image restoration networks.
//!
//! Feature alignment replaces the fixed sampling grid of a convolution with
//! learned, per-location offsets and modulation masks. This crate provides
//! one parametrized alignment module covering the whole family of variants:
//! offsets derived from the input itself or an auxiliary feature tensor,
//! optionally bounded in magnitude, optionally fused with an external prior
//! (a dense flow field or precomputed per-tap offsets), with an optional
//! similarity-weighted modulation mask. The sampling itself is performed by
//! the [`burn-deform-ops`](burn_deform_ops) operator.

mod error;
mod modules;

pub use error::{DcnAlignError, DcnAlignResult};
pub use modules::{
    DeformAlign2d, DeformAlign2dConfig, DeformAlign2dOutput, OffsetHealth, OffsetPrior, PriorKind,
};
