//! Deformable alignment with learned offsets, modulation and prior fusion.
//!
//! One module covers the whole family of alignment variants: the stages of
//! the composition pipeline (magnitude bounding, prior fusion, similarity
//! masking, offset export) are independent configuration switches rather
//! than separate types.

use burn::{
    module::{Ignored, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::sigmoid,
};
use burn_deform_ops::{modulated_deform_conv2d, DeformConvOptions};

use super::health::OffsetHealth;
use super::prior::{
    bound_offsets, reorder_precomputed_prior, tile_flow_prior, OffsetPrior, PriorKind,
};
use crate::error::{DcnAlignError, DcnAlignResult};

/// Configuration for the [`DeformAlign2d`] module.
#[derive(Config, Debug)]
pub struct DeformAlign2dConfig {
    /// Number of input feature channels. An auxiliary feature tensor, when
    /// used, must carry the same channel count.
    pub in_channels: usize,
    /// Number of output feature channels.
    pub out_channels: usize,
    /// Kernel size, shared by the sampling operator and the offset/mask
    /// projection.
    #[config(default = "3")]
    pub kernel_size: usize,
    /// Stride of the convolution.
    #[config(default = "1")]
    pub stride: usize,
    /// Spatial padding of the convolution.
    #[config(default = "1")]
    pub padding: usize,
    /// Dilation of the convolution.
    #[config(default = "1")]
    pub dilation: usize,
    /// Number of deformable groups sharing one offset/mask field each.
    #[config(default = "1")]
    pub deformable_groups: usize,
    /// Whether the sampling operator adds a learned bias.
    #[config(default = "true")]
    pub bias: bool,
    /// Derive offsets and mask from a separate auxiliary feature tensor
    /// instead of the tensor being sampled.
    #[config(default = "false")]
    pub aux_source: bool,
    /// External prior fused into the learned offsets.
    #[config(default = "PriorKind::None")]
    pub prior_kind: PriorKind,
    /// When set, the generator contribution is squashed into
    /// `(-max_residue_magnitude, max_residue_magnitude)` before fusion.
    #[config(default = "None")]
    pub max_residue_magnitude: Option<f64>,
    /// Scale the mask logits by a supplied similarity field before the
    /// sigmoid.
    #[config(default = "false")]
    pub use_similarity: bool,
    /// Return the fused offset field alongside the output features.
    #[config(default = "false")]
    pub export_offset: bool,
    /// Mean-absolute-residue level above which a warning is logged.
    #[config(default = "100.0")]
    pub offset_warn_threshold: f64,
}

impl DeformAlign2dConfig {
    /// Checks the configuration for degenerate geometry.
    pub fn validate(&self) -> DcnAlignResult<()> {
        if self.kernel_size == 0 {
            return Err(DcnAlignError::InvalidConfiguration {
                reason: "Kernel size must be non-zero".to_owned(),
            });
        }
        if self.deformable_groups == 0 {
            return Err(DcnAlignError::InvalidConfiguration {
                reason: "Deformable group count must be non-zero".to_owned(),
            });
        }
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(DcnAlignError::InvalidConfiguration {
                reason: "Channel counts must be non-zero".to_owned(),
            });
        }
        if self.in_channels % self.deformable_groups != 0 {
            return Err(DcnAlignError::InvalidConfiguration {
                reason: format!(
                    "Input channels ({}) must be divisible by deformable groups ({})",
                    self.in_channels, self.deformable_groups
                ),
            });
        }
        Ok(())
    }

    /// Initializes a new [`DeformAlign2d`] module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DcnAlignResult<DeformAlign2d<B>> {
        self.validate()?;

        let taps = self.kernel_size * self.kernel_size;
        let projection_channels = 3 * self.deformable_groups * taps;

        let mut conv_offset_mask = Conv2dConfig::new(
            [self.in_channels, projection_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_dilation([self.dilation, self.dilation])
        .init(device);

        // Zero-initialized projection: offsets start at zero and mask logits
        // at zero (mask 0.5 after the sigmoid).
        conv_offset_mask.weight = Param::from_tensor(conv_offset_mask.weight.val().zeros_like());
        conv_offset_mask.bias = Some(Param::from_tensor(
            conv_offset_mask.bias.unwrap().val().zeros_like(),
        ));

        let conv = Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_dilation([self.dilation, self.dilation])
        .with_bias(self.bias)
        .init(device);

        Ok(DeformAlign2d {
            conv_offset_mask,
            conv,
            kernel_size: self.kernel_size,
            stride: self.stride,
            padding: self.padding,
            dilation: self.dilation,
            deformable_groups: self.deformable_groups,
            aux_source: self.aux_source,
            prior_kind: Ignored(self.prior_kind.clone()),
            max_residue_magnitude: self.max_residue_magnitude,
            use_similarity: self.use_similarity,
            export_offset: self.export_offset,
            health: Ignored(OffsetHealth::new(self.offset_warn_threshold)),
        })
    }
}

/// Modulated deformable convolution with learned offset/mask derivation and
/// optional prior fusion.
#[derive(Module, Debug)]
pub struct DeformAlign2d<B: Backend> {
    /// Zero-initialized projection producing raw offsets and mask logits.
    conv_offset_mask: Conv2d<B>,
    /// Holds the weight and bias consumed by the sampling operator.
    conv: Conv2d<B>,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
    deformable_groups: usize,
    aux_source: bool,
    prior_kind: Ignored<PriorKind>,
    max_residue_magnitude: Option<f64>,
    use_similarity: bool,
    export_offset: bool,
    health: Ignored<OffsetHealth>,
}

/// The result of a deformable alignment forward pass.
#[derive(Debug)]
pub struct DeformAlign2dOutput<B: Backend> {
    /// Aligned output features, `[batch, out_channels, out_h, out_w]`.
    pub features: Tensor<B, 4>,
    /// The fused offset field, present when offset export is enabled.
    pub offset: Option<Tensor<B, 4>>,
}

impl<B: Backend> DeformAlign2d<B> {
    /// Runs the composition pipeline and the sampling operator.
    ///
    /// `input` is always the tensor being sampled. `aux` feeds the offset/mask
    /// projection in auxiliary-source mode. `prior` and `similarity` must be
    /// present exactly when the configuration consumes them; any mismatch is
    /// rejected before computation.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        aux: Option<Tensor<B, 4>>,
        prior: Option<OffsetPrior<B>>,
        similarity: Option<Tensor<B, 4>>,
    ) -> DcnAlignResult<DeformAlign2dOutput<B>> {
        let source = match (self.aux_source, aux) {
            (true, Some(aux)) => aux,
            (false, None) => input.clone(),
            (true, None) => {
                return Err(DcnAlignError::MissingInput {
                    input: "auxiliary features".to_owned(),
                })
            }
            (false, Some(_)) => {
                return Err(DcnAlignError::UnexpectedInput {
                    input: "auxiliary features".to_owned(),
                })
            }
        };
        match (&self.prior_kind.0, &prior) {
            (PriorKind::None, None)
            | (PriorKind::Flow, Some(OffsetPrior::Flow(_)))
            | (PriorKind::Precomputed, Some(OffsetPrior::Precomputed(_))) => {}
            (PriorKind::Flow | PriorKind::Precomputed, None) => {
                return Err(DcnAlignError::MissingInput {
                    input: "offset prior".to_owned(),
                })
            }
            (configured, Some(supplied)) => {
                return Err(DcnAlignError::UnexpectedInput {
                    input: format!(
                        "{:?} prior (configured for {configured:?})",
                        supplied.kind()
                    ),
                })
            }
        }
        if self.use_similarity && similarity.is_none() {
            return Err(DcnAlignError::MissingInput {
                input: "similarity field".to_owned(),
            });
        }
        if !self.use_similarity && similarity.is_some() {
            return Err(DcnAlignError::UnexpectedInput {
                input: "similarity field".to_owned(),
            });
        }

        let taps = self.kernel_size * self.kernel_size;
        let group_taps = self.deformable_groups * taps;

        let projected = self.conv_offset_mask.forward(source);
        let raw_offset = projected.clone().slice(s![.., 0..2 * group_taps, .., ..]);
        let logits = projected.slice(s![.., 2 * group_taps..3 * group_taps, .., ..]);

        let offset = match self.max_residue_magnitude {
            Some(magnitude) => bound_offsets(raw_offset, magnitude),
            None => raw_offset,
        };

        let [batch, _, out_h, out_w] = offset.dims();
        let prior_field = match prior {
            Some(OffsetPrior::Flow(flow)) => {
                let expected = [batch, 2, out_h, out_w];
                if flow.dims() != expected {
                    return Err(DcnAlignError::InvalidTensorShape {
                        expected: format!("{expected:?}"),
                        actual: format!("{:?}", flow.dims()),
                    });
                }
                Some(tile_flow_prior(flow, group_taps))
            }
            Some(OffsetPrior::Precomputed(precomputed)) => {
                let expected = [batch, taps, out_h, out_w, 2];
                if precomputed.dims() != expected {
                    return Err(DcnAlignError::InvalidTensorShape {
                        expected: format!("{expected:?}"),
                        actual: format!("{:?}", precomputed.dims()),
                    });
                }
                Some(reorder_precomputed_prior(
                    precomputed,
                    self.deformable_groups,
                ))
            }
            None => None,
        };
        let offset = match &prior_field {
            Some(field) => offset + field.clone(),
            None => offset,
        };

        let mask = match similarity {
            Some(similarity) => sigmoid(logits * similarity),
            None => sigmoid(logits),
        };

        self.health.0.observe(&offset, prior_field.as_ref());

        let features = modulated_deform_conv2d(
            input,
            offset.clone(),
            Some(mask),
            self.conv.weight.val(),
            self.conv.bias.as_ref().map(Param::val),
            DeformConvOptions {
                stride: [self.stride, self.stride],
                padding: [self.padding, self.padding],
                dilation: [self.dilation, self.dilation],
                weight_groups: 1,
                offset_groups: self.deformable_groups,
            },
        );

        Ok(DeformAlign2dOutput {
            features,
            offset: self.export_offset.then_some(offset),
        })
    }
}
