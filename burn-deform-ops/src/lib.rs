//! Modulated deformable convolution operators for the Burn deep learning framework
//!
//! This crate provides a backend-agnostic reference implementation of the
//! modulated deformable convolution operator (DCNv2): every kernel tap samples
//! the input at a learned fractional position via bilinear interpolation, the
//! sampled value is scaled by a learned modulation mask, and the results are
//! accumulated like a standard convolution.
//!
//! The forward pass decomposes into a deformable im2col step followed by a
//! per-group matrix multiplication, the same decomposition Burn's accelerated
//! backends use, so outputs stay numerically compatible with weights trained
//! against those kernels. The backward pass is provided for callers that train
//! end-to-end and is bit-compatible with the forward sampling rule.

mod backward;
mod bilinear;
mod deform_conv;

// Convenient re-exports
pub use backward::{modulated_deform_conv2d_backward, ModulatedDeformConv2dBackward};
pub use deform_conv::modulated_deform_conv2d;

// The geometry record is Burn's own, so configurations move freely between
// this reference operator and backend-provided kernels.
pub use burn::tensor::ops::DeformConvOptions;
