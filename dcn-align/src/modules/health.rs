//! Offset-magnitude health diagnostics.
//!
//! Exploding offsets are the classic failure mode of deformable alignment:
//! the sampling positions wander off the feature map and the module silently
//! degrades to zero-padding noise. The monitor reports the drift through the
//! logging channel and never touches the values themselves.

use burn::{
    prelude::*,
    tensor::{backend::Backend, ElementConversion, Tensor},
};

/// Observes fused offset fields and warns when the learned contribution
/// drifts beyond a configured level.
#[derive(Debug, Clone)]
pub struct OffsetHealth {
    threshold: f64,
}

impl OffsetHealth {
    /// Creates a monitor that warns above the given mean-absolute level.
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Computes the mean absolute value of the offset residue and logs a
    /// warning if it exceeds the threshold.
    ///
    /// The residue is `offset - prior` when a fused prior contribution is
    /// given, otherwise the offset itself, so the statistic always measures
    /// what the generator added on top of any external guidance. Returns the
    /// statistic; the observed tensors are never modified.
    pub fn observe<B: Backend>(
        &self,
        offset: &Tensor<B, 4>,
        prior: Option<&Tensor<B, 4>>,
    ) -> f64 {
        let residue = match prior {
            Some(prior) => offset.clone() - prior.clone(),
            None => offset.clone(),
        };
        let mean = residue.abs().mean().into_scalar().elem::<f64>();
        if mean > self.threshold {
            log::warn!("Offset mean is {mean}, larger than {}", self.threshold);
        }
        mean
    }
}
