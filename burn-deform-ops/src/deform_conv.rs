//! Modulated deformable convolution forward pass.
//!
//! The operator is realized as a deformable im2col step (bilinear sampling and
//! modulation into a column matrix) followed by a per-group batched matmul,
//! mirroring the decomposition used by Burn's accelerated kernels so the
//! numeric contract stays identical across implementations.

use burn::prelude::*;
use burn::tensor::ops::conv::calculate_conv_output_size;
use burn::tensor::ops::DeformConvOptions;
use burn::tensor::TensorData;

use crate::bilinear::bilinear_interpolate;

/// Applies a 2D modulated deformable convolution.
///
/// # Shapes
/// - input: `[batch_size, in_channels, height, width]`
/// - offset: `[batch_size, 2 * offset_groups * kernel_h * kernel_w, out_h, out_w]`,
///   tap-major interleaved `(dy, dx)` pairs
/// - mask: `[batch_size, offset_groups * kernel_h * kernel_w, out_h, out_w]`,
///   already passed through a sigmoid; `None` applies no modulation
/// - weight: `[out_channels, in_channels / weight_groups, kernel_h, kernel_w]`
/// - bias: `[out_channels]`
/// - output: `[batch_size, out_channels, out_h, out_w]`
///
/// Sampling positions that fall outside the input contribute zero (implicit
/// zero padding). Shape or group mismatches panic before any computation.
pub fn modulated_deform_conv2d<B: Backend>(
    input: Tensor<B, 4>,
    offset: Tensor<B, 4>,
    mask: Option<Tensor<B, 4>>,
    weight: Tensor<B, 4>,
    bias: Option<Tensor<B, 1>>,
    options: DeformConvOptions<2>,
) -> Tensor<B, 4> {
    let (out_h, out_w) = validate_geometry(
        input.dims(),
        offset.dims(),
        mask.as_ref().map(|m| m.dims()),
        weight.dims(),
        bias.as_ref().map(|b| b.dims()[0]),
        &options,
    );

    let [batch_size, _, _, _] = input.dims();
    let [out_channels, _, kernel_h, kernel_w] = weight.dims();
    let groups = options.weight_groups;

    let columns = deform_im2col(
        input,
        offset,
        mask,
        &options,
        (out_h, out_w),
        (kernel_h, kernel_w),
    );

    let [col_rows, col_cols] = columns.dims();
    let rows_per_group = col_rows / groups;
    let out_c_per_group = out_channels / groups;

    let columns = columns.reshape([groups, rows_per_group, col_cols]);
    let weight = weight.reshape([groups, out_c_per_group, rows_per_group]);

    let out = weight
        .matmul(columns)
        .reshape([out_channels, batch_size, out_h, out_w])
        .swap_dims(0, 1);

    match bias {
        Some(bias) => out + bias.reshape([1, out_channels, 1, 1]),
        None => out,
    }
}

/// Samples and modulates the input into a `[in_channels * kernel_h * kernel_w,
/// batch_size * out_h * out_w]` column matrix.
pub(crate) fn deform_im2col<B: Backend>(
    input: Tensor<B, 4>,
    offset: Tensor<B, 4>,
    mask: Option<Tensor<B, 4>>,
    options: &DeformConvOptions<2>,
    out_dims: (usize, usize),
    kernel_dims: (usize, usize),
) -> Tensor<B, 2> {
    let device = input.device();
    let [batch_size, in_channels, height, width] = input.dims();
    let (out_h, out_w) = out_dims;
    let (kernel_h, kernel_w) = kernel_dims;
    let taps = kernel_h * kernel_w;
    let offset_groups = options.offset_groups;
    let channels_per_offset_group = in_channels / offset_groups;

    let input = into_f32(input);
    let offset = into_f32(offset);
    let mask = mask.map(into_f32);

    let col_rows = in_channels * taps;
    let col_cols = batch_size * out_h * out_w;
    let mut columns = vec![0.0f32; col_rows * col_cols];

    for b in 0..batch_size {
        for channel in 0..in_channels {
            let group = channel / channels_per_offset_group;
            let plane = &input[(b * in_channels + channel) * height * width..][..height * width];
            let offset_base = (b * offset_groups + group) * 2 * taps * out_h * out_w;
            let mask_base = (b * offset_groups + group) * taps * out_h * out_w;

            for kernel_y in 0..kernel_h {
                for kernel_x in 0..kernel_w {
                    let tap = kernel_y * kernel_w + kernel_x;
                    let row = channel * taps + tap;

                    for out_y in 0..out_h {
                        for out_x in 0..out_w {
                            let spatial = out_y * out_w + out_x;
                            let offset_y = offset[offset_base + 2 * tap * out_h * out_w + spatial];
                            let offset_x =
                                offset[offset_base + (2 * tap + 1) * out_h * out_w + spatial];
                            let modulation = match &mask {
                                Some(mask) => mask[mask_base + tap * out_h * out_w + spatial],
                                None => 1.0,
                            };

                            let y = (out_y * options.stride[0] + kernel_y * options.dilation[0])
                                as f32
                                - options.padding[0] as f32
                                + offset_y;
                            let x = (out_x * options.stride[1] + kernel_x * options.dilation[1])
                                as f32
                                - options.padding[1] as f32
                                + offset_x;

                            columns[row * col_cols + (b * out_h + out_y) * out_w + out_x] =
                                modulation * bilinear_interpolate(plane, height, width, y, x);
                        }
                    }
                }
            }
        }
    }

    Tensor::from_data(TensorData::new(columns, [col_rows, col_cols]), &device)
}

/// Checks the channel/geometry invariants and returns the output spatial size.
///
/// Every formula here is part of the calling contract; a mismatch is a
/// precondition violation and panics before any sampling arithmetic runs.
pub(crate) fn validate_geometry(
    input_dims: [usize; 4],
    offset_dims: [usize; 4],
    mask_dims: Option<[usize; 4]>,
    weight_dims: [usize; 4],
    bias_len: Option<usize>,
    options: &DeformConvOptions<2>,
) -> (usize, usize) {
    let [batch_size, in_channels, height, width] = input_dims;
    let [out_channels, in_c_per_group, kernel_h, kernel_w] = weight_dims;
    let groups = options.weight_groups;
    let offset_groups = options.offset_groups;
    let taps = kernel_h * kernel_w;

    assert!(
        kernel_h > 0 && kernel_w > 0,
        "deform_conv2d: kernel must be non-empty, got {kernel_h}x{kernel_w}"
    );
    assert!(
        groups > 0 && offset_groups > 0,
        "deform_conv2d: group counts must be non-zero, got weight_groups={groups}, offset_groups={offset_groups}"
    );
    assert!(
        in_channels % groups == 0 && in_c_per_group * groups == in_channels,
        "deform_conv2d: input channels ({in_channels}) must match weight_groups ({groups}) x weight in-channels ({in_c_per_group})"
    );
    assert!(
        out_channels % groups == 0,
        "deform_conv2d: output channels ({out_channels}) must be divisible by weight_groups ({groups})"
    );
    assert!(
        in_channels % offset_groups == 0,
        "deform_conv2d: input channels ({in_channels}) must be divisible by offset_groups ({offset_groups})"
    );

    let out_h = calculate_conv_output_size(
        kernel_h,
        options.stride[0],
        options.padding[0],
        options.dilation[0],
        height,
    );
    let out_w = calculate_conv_output_size(
        kernel_w,
        options.stride[1],
        options.padding[1],
        options.dilation[1],
        width,
    );

    let expected = [batch_size, 2 * offset_groups * taps, out_h, out_w];
    assert!(
        offset_dims == expected,
        "deform_conv2d: offset shape {offset_dims:?} does not match expected {expected:?}"
    );
    if let Some(mask_dims) = mask_dims {
        let expected = [batch_size, offset_groups * taps, out_h, out_w];
        assert!(
            mask_dims == expected,
            "deform_conv2d: mask shape {mask_dims:?} does not match expected {expected:?}"
        );
    }
    if let Some(bias_len) = bias_len {
        assert!(
            bias_len == out_channels,
            "deform_conv2d: bias length ({bias_len}) does not match output channels ({out_channels})"
        );
    }

    (out_h, out_w)
}

pub(crate) fn into_f32<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::module::conv2d;
    use burn::tensor::ops::ConvOptions;

    type TestBackend = NdArray;

    fn unit_options() -> DeformConvOptions<2> {
        DeformConvOptions {
            stride: [1, 1],
            padding: [1, 1],
            dilation: [1, 1],
            weight_groups: 1,
            offset_groups: 1,
        }
    }

    fn arange<const D: usize>(shape: [usize; D], scale: f32) -> Tensor<TestBackend, D> {
        let count: usize = shape.iter().product();
        let values: Vec<f32> = (0..count).map(|i| i as f32 * scale).collect();
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn identity_kernel_reproduces_input() {
        let device = Default::default();
        let mut values = vec![0.0f32; 4 * 8 * 8];
        values[2 * 64 + 3 * 8 + 4] = 1.0;
        let input =
            Tensor::<TestBackend, 4>::from_data(TensorData::new(values, [1, 4, 8, 8]), &device);

        let offset = Tensor::zeros([1, 18, 8, 8], &device);
        let mask = Tensor::ones([1, 9, 8, 8], &device);

        // Center tap of each output channel reads its own input channel.
        let mut w = vec![0.0f32; 4 * 4 * 9];
        for c in 0..4 {
            w[c * 4 * 9 + c * 9 + 4] = 1.0;
        }
        let weight = Tensor::from_data(TensorData::new(w, [4, 4, 3, 3]), &device);

        let output = modulated_deform_conv2d(
            input.clone(),
            offset,
            Some(mask),
            weight,
            None,
            unit_options(),
        );

        let diff = (output - input).abs().sum().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn half_pixel_offset_averages_vertical_neighbors() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [1, 1, 2, 2]),
            &device,
        );

        // dy = 0.5 everywhere, dx = 0.
        let offset = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.5f32, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0], [1, 2, 2, 2]),
            &device,
        );
        let mask = Tensor::ones([1, 1, 2, 2], &device);
        let weight = Tensor::ones([1, 1, 1, 1], &device);

        let output = modulated_deform_conv2d(
            input,
            offset,
            Some(mask),
            weight,
            None,
            DeformConvOptions {
                stride: [1, 1],
                padding: [0, 0],
                dilation: [1, 1],
                weight_groups: 1,
                offset_groups: 1,
            },
        );

        // Bottom row samples at y = 1.5 where the lower neighbor is out of
        // bounds and contributes zero.
        let values = output.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![2.0, 3.0, 1.5, 2.0]);
    }

    #[test]
    fn zero_offsets_match_standard_convolution() {
        let device = Default::default();
        let input = arange([1, 3, 5, 5], 0.1);
        let weight = arange([2, 3, 3, 3], 0.01);
        let bias = Tensor::<TestBackend, 1>::from_data(
            TensorData::new(vec![0.5f32, -0.25], [2]),
            &device,
        );

        let offset = Tensor::zeros([1, 18, 5, 5], &device);
        let mask = Tensor::ones([1, 9, 5, 5], &device);

        let output = modulated_deform_conv2d(
            input.clone(),
            offset,
            Some(mask),
            weight.clone(),
            Some(bias.clone()),
            unit_options(),
        );
        let expected = conv2d(
            input,
            weight,
            Some(bias),
            ConvOptions::new([1, 1], [1, 1], [1, 1], 1),
        );

        let max_diff = (output - expected).abs().max().into_scalar();
        assert!(max_diff < 1e-3, "max deviation {max_diff}");
    }

    #[test]
    fn zero_offsets_match_strided_dilated_convolution() {
        let device = Default::default();
        let input = arange([1, 2, 7, 7], 0.05);
        let weight = arange([2, 2, 3, 3], 0.02);

        let options = DeformConvOptions {
            stride: [2, 2],
            padding: [2, 2],
            dilation: [2, 2],
            weight_groups: 1,
            offset_groups: 1,
        };
        let offset = Tensor::zeros([1, 18, 4, 4], &device);
        let mask = Tensor::ones([1, 9, 4, 4], &device);

        let output =
            modulated_deform_conv2d(input.clone(), offset, Some(mask), weight.clone(), None, options);
        let expected = conv2d(
            input,
            weight,
            None,
            ConvOptions::new([2, 2], [2, 2], [2, 2], 1),
        );

        let max_diff = (output - expected).abs().max().into_scalar();
        assert!(max_diff < 1e-3, "max deviation {max_diff}");
    }

    #[test]
    fn zero_offsets_match_grouped_convolution() {
        let device = Default::default();
        let input = arange([1, 4, 5, 5], 0.1);
        let weight = arange([4, 2, 3, 3], 0.01);

        let options = DeformConvOptions {
            stride: [1, 1],
            padding: [1, 1],
            dilation: [1, 1],
            weight_groups: 2,
            offset_groups: 2,
        };
        let offset = Tensor::zeros([1, 36, 5, 5], &device);
        let mask = Tensor::ones([1, 18, 5, 5], &device);

        let output =
            modulated_deform_conv2d(input.clone(), offset, Some(mask), weight.clone(), None, options);
        let expected = conv2d(
            input,
            weight,
            None,
            ConvOptions::new([1, 1], [1, 1], [1, 1], 2),
        );

        let max_diff = (output - expected).abs().max().into_scalar();
        assert!(max_diff < 1e-3, "max deviation {max_diff}");
    }

    #[test]
    fn missing_mask_is_equivalent_to_ones() {
        let device = Default::default();
        let input = arange([2, 2, 4, 4], 0.1);
        let weight = arange([2, 2, 3, 3], 0.01);
        let offset = arange([2, 18, 4, 4], 0.001);
        let mask = Tensor::ones([2, 9, 4, 4], &device);

        let unmasked = modulated_deform_conv2d(
            input.clone(),
            offset.clone(),
            None,
            weight.clone(),
            None,
            unit_options(),
        );
        let masked =
            modulated_deform_conv2d(input, offset, Some(mask), weight, None, unit_options());

        let diff = (unmasked - masked).abs().sum().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn repeated_invocations_are_bit_identical() {
        let input = arange([2, 3, 6, 6], 0.07);
        let weight = arange([3, 3, 3, 3], 0.013);
        let offset = arange([2, 18, 6, 6], 0.011);
        let mask = arange([2, 9, 6, 6], 0.009);

        let first = modulated_deform_conv2d(
            input.clone(),
            offset.clone(),
            Some(mask.clone()),
            weight.clone(),
            None,
            unit_options(),
        );
        let second =
            modulated_deform_conv2d(input, offset, Some(mask), weight, None, unit_options());

        assert_eq!(
            first.into_data().to_vec::<f32>().unwrap(),
            second.into_data().to_vec::<f32>().unwrap(),
        );
    }

    #[test]
    #[should_panic(expected = "offset shape")]
    fn rejects_offset_channel_mismatch() {
        let device = Default::default();
        let input = arange([1, 3, 5, 5], 0.1);
        let weight = arange([2, 3, 3, 3], 0.01);
        let offset = Tensor::zeros([1, 17, 5, 5], &device);

        modulated_deform_conv2d(input, offset, None, weight, None, unit_options());
    }

    #[test]
    #[should_panic(expected = "mask shape")]
    fn rejects_mask_channel_mismatch() {
        let device = Default::default();
        let input = arange([1, 3, 5, 5], 0.1);
        let weight = arange([2, 3, 3, 3], 0.01);
        let offset = Tensor::zeros([1, 18, 5, 5], &device);
        let mask = Tensor::ones([1, 8, 5, 5], &device);

        modulated_deform_conv2d(input, offset, Some(mask), weight, None, unit_options());
    }

    #[test]
    #[should_panic(expected = "divisible by offset_groups")]
    fn rejects_indivisible_offset_groups() {
        let device = Default::default();
        let input = arange([1, 3, 5, 5], 0.1);
        let weight = arange([2, 3, 3, 3], 0.01);
        let offset = Tensor::zeros([1, 36, 5, 5], &device);

        let options = DeformConvOptions {
            stride: [1, 1],
            padding: [1, 1],
            dilation: [1, 1],
            weight_groups: 1,
            offset_groups: 2,
        };
        modulated_deform_conv2d(input, offset, None, weight, None, options);
    }
}
