//! Modulated deformable convolution backward pass.
//!
//! Weight and bias gradients follow the standard convolution rules over the
//! sampled column matrix. The input gradient scatters each column gradient
//! back through the four bilinear weights; the offset gradient is the
//! directional derivative of the interpolation, scaled by the modulation; the
//! mask gradient is the sampled value times the column gradient. All of it
//! reuses the forward sampling rule so trained weights round-trip exactly.

use burn::prelude::*;
use burn::tensor::ops::DeformConvOptions;
use burn::tensor::TensorData;
use libm::{fabsf, floorf};

use crate::bilinear::{bilinear_interpolate, coordinate_weight};
use crate::deform_conv::{deform_im2col, into_f32, validate_geometry};

/// Gradients of [`modulated_deform_conv2d`](crate::modulated_deform_conv2d)
/// with respect to each of its tensor arguments.
#[derive(Debug)]
pub struct ModulatedDeformConv2dBackward<B: Backend> {
    pub input_grad: Tensor<B, 4>,
    pub offset_grad: Tensor<B, 4>,
    pub mask_grad: Option<Tensor<B, 4>>,
    pub weight_grad: Tensor<B, 4>,
    pub bias_grad: Option<Tensor<B, 1>>,
}

/// Computes the backward pass of the modulated deformable convolution.
///
/// `mask_grad` is `Some` iff a mask was supplied, `bias_grad` iff a bias was.
/// Shape mismatches panic before any computation, as in the forward pass.
pub fn modulated_deform_conv2d_backward<B: Backend>(
    input: Tensor<B, 4>,
    offset: Tensor<B, 4>,
    mask: Option<Tensor<B, 4>>,
    weight: Tensor<B, 4>,
    bias: Option<Tensor<B, 1>>,
    output_grad: Tensor<B, 4>,
    options: DeformConvOptions<2>,
) -> ModulatedDeformConv2dBackward<B> {
    let (out_h, out_w) = validate_geometry(
        input.dims(),
        offset.dims(),
        mask.as_ref().map(|m| m.dims()),
        weight.dims(),
        bias.as_ref().map(|b| b.dims()[0]),
        &options,
    );

    let device = input.device();
    let [batch_size, in_channels, height, width] = input.dims();
    let [out_channels, in_c_per_group, kernel_h, kernel_w] = weight.dims();
    let taps = kernel_h * kernel_w;
    let groups = options.weight_groups;
    let offset_groups = options.offset_groups;
    let channels_per_offset_group = in_channels / offset_groups;

    let expected = [batch_size, out_channels, out_h, out_w];
    assert!(
        output_grad.dims() == expected,
        "deform_conv2d backward: output gradient shape {:?} does not match expected {expected:?}",
        output_grad.dims()
    );

    let bias_grad = bias.map(|bias| {
        output_grad
            .clone()
            .sum_dim(0)
            .sum_dim(2)
            .sum_dim(3)
            .reshape(bias.dims())
    });

    let col_rows = in_channels * taps;
    let col_cols = batch_size * out_h * out_w;
    let rows_per_group = col_rows / groups;
    let out_c_per_group = out_channels / groups;

    let out_grad_grouped = output_grad
        .swap_dims(0, 1)
        .reshape([groups, out_c_per_group, col_cols]);

    // Gradient flowing into each sampled-and-modulated column entry.
    let columns_grad = weight
        .clone()
        .reshape([groups, out_c_per_group, rows_per_group])
        .swap_dims(1, 2)
        .matmul(out_grad_grouped.clone());
    let columns_grad = into_f32(columns_grad.reshape([col_rows, col_cols]));

    let input_vals = into_f32(input.clone());
    let offset_vals = into_f32(offset.clone());
    let mask_vals = mask.clone().map(into_f32);

    let mut offset_grad = vec![0.0f32; batch_size * 2 * offset_groups * taps * out_h * out_w];
    let mut mask_grad = vec![0.0f32; batch_size * offset_groups * taps * out_h * out_w];
    let mut input_grad = vec![0.0f32; batch_size * in_channels * height * width];

    for b in 0..batch_size {
        for group in 0..offset_groups {
            let offset_base = (b * offset_groups + group) * 2 * taps * out_h * out_w;
            let mask_base = (b * offset_groups + group) * taps * out_h * out_w;

            for kernel_y in 0..kernel_h {
                for kernel_x in 0..kernel_w {
                    let tap = kernel_y * kernel_w + kernel_x;

                    for out_y in 0..out_h {
                        for out_x in 0..out_w {
                            let spatial = out_y * out_w + out_x;
                            let idx_y = offset_base + 2 * tap * out_h * out_w + spatial;
                            let idx_x = offset_base + (2 * tap + 1) * out_h * out_w + spatial;
                            let idx_m = mask_base + tap * out_h * out_w + spatial;

                            let y = (out_y * options.stride[0] + kernel_y * options.dilation[0])
                                as f32
                                - options.padding[0] as f32
                                + offset_vals[idx_y];
                            let x = (out_x * options.stride[1] + kernel_x * options.dilation[1])
                                as f32
                                - options.padding[1] as f32
                                + offset_vals[idx_x];
                            let modulation = mask_vals.as_ref().map_or(1.0, |m| m[idx_m]);

                            let col = (b * out_h + out_y) * out_w + out_x;
                            let mut grad_y = 0.0;
                            let mut grad_x = 0.0;
                            let mut grad_m = 0.0;

                            for local in 0..channels_per_offset_group {
                                let channel = group * channels_per_offset_group + local;
                                let plane = &input_vals
                                    [(b * in_channels + channel) * height * width..]
                                    [..height * width];
                                let col_grad = columns_grad[(channel * taps + tap) * col_cols + col];

                                grad_y +=
                                    coordinate_weight(plane, height, width, y, x, true) * col_grad;
                                grad_x +=
                                    coordinate_weight(plane, height, width, y, x, false) * col_grad;
                                grad_m +=
                                    bilinear_interpolate(plane, height, width, y, x) * col_grad;

                                // Scatter into the four integer neighbors the
                                // forward pass sampled from.
                                let col_grad = modulation * col_grad;
                                let y_low = floorf(y);
                                let x_low = floorf(x);
                                for (corner_y, corner_x) in [
                                    (y_low, x_low),
                                    (y_low, x_low + 1.0),
                                    (y_low + 1.0, x_low),
                                    (y_low + 1.0, x_low + 1.0),
                                ] {
                                    if corner_y < 0.0
                                        || corner_y >= height as f32
                                        || corner_x < 0.0
                                        || corner_x >= width as f32
                                    {
                                        continue;
                                    }
                                    let w_y = 1.0 - fabsf(y - corner_y);
                                    let w_x = 1.0 - fabsf(x - corner_x);
                                    if w_y > 0.0 && w_x > 0.0 {
                                        input_grad[((b * in_channels + channel) * height
                                            + corner_y as usize)
                                            * width
                                            + corner_x as usize] += w_y * w_x * col_grad;
                                    }
                                }
                            }

                            offset_grad[idx_y] = modulation * grad_y;
                            offset_grad[idx_x] = modulation * grad_x;
                            mask_grad[idx_m] = grad_m;
                        }
                    }
                }
            }
        }
    }

    let columns = deform_im2col(
        input,
        offset,
        mask.clone(),
        &options,
        (out_h, out_w),
        (kernel_h, kernel_w),
    )
    .reshape([groups, rows_per_group, col_cols]);
    let weight_grad = out_grad_grouped
        .matmul(columns.swap_dims(1, 2))
        .reshape([out_channels, in_c_per_group, kernel_h, kernel_w]);

    ModulatedDeformConv2dBackward {
        input_grad: Tensor::from_data(
            TensorData::new(input_grad, [batch_size, in_channels, height, width]),
            &device,
        ),
        offset_grad: Tensor::from_data(
            TensorData::new(
                offset_grad,
                [batch_size, 2 * offset_groups * taps, out_h, out_w],
            ),
            &device,
        ),
        mask_grad: mask.map(|_| {
            Tensor::from_data(
                TensorData::new(mask_grad, [batch_size, offset_groups * taps, out_h, out_w]),
                &device,
            )
        }),
        weight_grad,
        bias_grad,
    }
}
