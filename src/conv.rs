use crate::{
    error::Error,
    volume::{dim3, Volume},
};
use anyhow::{bail, Result};
use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};

mod direct;
pub(crate) mod fft;

/// Relative cost of one FFT butterfly against one direct multiply-add.
///
/// Covers the three transforms of each FFT correlation. This is a policy knob, the real
/// crossover depends on the machine, see [`calibrate::optimize`](crate::calibrate::optimize).
pub const FFT_COST_FACTOR: f64 = 7.5;

/// The valid output shape of correlating `input` with `filter` at `stride`.
///
/// Returns `None` if the filter does not fit in the input or any extent is zero.
pub fn output_shape(input: [usize; 3], filter: [usize; 3], stride: [usize; 3]) -> Option<[usize; 3]> {
    let mut output = [0; 3];
    for a in 0..3 {
        if filter[a] == 0 || stride[a] == 0 || input[a] < filter[a] {
            return None;
        }
        output[a] = (input[a] - filter[a]) / stride[a] + 1;
    }
    Some(output)
}

/// The input shape needed to produce `output` with `filter` at `stride`.
pub fn input_shape(output: [usize; 3], filter: [usize; 3], stride: [usize; 3]) -> [usize; 3] {
    let mut input = [0; 3];
    for a in 0..3 {
        input[a] = (output[a] - 1) * stride[a] + filter[a];
    }
    input
}

fn volume(shape: [usize; 3]) -> f64 {
    shape.iter().product::<usize>() as f64
}

/// Convolution strategy.
///
/// Both strategies compute the same valid correlation and its two adjoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvStrategy {
    /// Nested loops over filter offsets.
    Direct,
    /// Pointwise products in the frequency domain.
    Fft,
}

impl ConvStrategy {
    /// Estimated multiply-adds of one direct correlation.
    pub fn direct_cost(input: [usize; 3], filter: [usize; 3], stride: [usize; 3]) -> f64 {
        output_shape(input, filter, stride)
            .map(|output| volume(output) * volume(filter))
            .unwrap_or(0.)
    }
    /// Estimated multiply-adds of one FFT correlation.
    pub fn fft_cost(input: [usize; 3]) -> f64 {
        let n = volume(input);
        FFT_COST_FACTOR * n * n.log2().max(1.) + n
    }
    /// Selects the cheaper strategy for correlating `input` with `filter`.
    pub fn select(input: [usize; 3], filter: [usize; 3], stride: [usize; 3]) -> Self {
        if Self::fft_cost(input) < Self::direct_cost(input, filter, stride) {
            Self::Fft
        } else {
            Self::Direct
        }
    }
    /// The other strategy.
    pub fn flip(self) -> Self {
        match self {
            Self::Direct => Self::Fft,
            Self::Fft => Self::Direct,
        }
    }
    /// Correlates `input` with `filter`.
    ///
    /// `output[o] = sum_k input[o * stride + k] * filter[k]`.
    pub fn forward(
        self,
        input: ArrayView3<f32>,
        filter: ArrayView3<f32>,
        stride: [usize; 3],
    ) -> Result<Volume> {
        let output = checked_output_shape(dim3(&input), dim3(&filter), stride)?;
        match self {
            Self::Direct => direct::forward(input, filter, stride, output),
            Self::Fft => fft::forward(input, filter, stride, output),
        }
    }
    /// Gradient with respect to the input of [`.forward()`](Self::forward).
    ///
    /// Full convolution of `grad` (spread out by `stride`) with `filter`. Input voxels that
    /// no output depends on receive zero.
    pub fn backward_input(
        self,
        grad: ArrayView3<f32>,
        filter: ArrayView3<f32>,
        stride: [usize; 3],
        input: [usize; 3],
    ) -> Result<Volume> {
        let filter_shape = dim3(&filter);
        check_grad_shape(input, filter_shape, stride, dim3(&grad))?;
        match self {
            Self::Direct => direct::backward_input(grad, filter, stride, input),
            Self::Fft => fft::backward_input(grad, filter, stride, input),
        }
    }
    /// Gradient with respect to the filter of [`.forward()`](Self::forward).
    ///
    /// Valid correlation of `input` with `grad` (spread out by `stride`), cropped to `filter`.
    pub fn backward_filter(
        self,
        input: ArrayView3<f32>,
        grad: ArrayView3<f32>,
        stride: [usize; 3],
        filter: [usize; 3],
    ) -> Result<Volume> {
        check_grad_shape(dim3(&input), filter, stride, dim3(&grad))?;
        match self {
            Self::Direct => direct::backward_filter(input, grad, stride, filter),
            Self::Fft => fft::backward_filter(input, grad, stride, filter),
        }
    }
}

fn checked_output_shape(
    input: [usize; 3],
    filter: [usize; 3],
    stride: [usize; 3],
) -> Result<[usize; 3]> {
    if let Some(output) = output_shape(input, filter, stride) {
        Ok(output)
    } else {
        bail!("Filter {filter:?} with stride {stride:?} does not fit input {input:?}!")
    }
}

fn check_grad_shape(
    input: [usize; 3],
    filter: [usize; 3],
    stride: [usize; 3],
    grad: [usize; 3],
) -> Result<()> {
    let output = checked_output_shape(input, filter, stride)?;
    if output != grad {
        return Err(Error::ShapeMismatch {
            name: "gradient".into(),
            index: 0,
            expected: output,
            found: grad,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn random(rng: &mut SmallRng, shape: [usize; 3]) -> Array3<f32> {
        Array3::from_shape_simple_fn(shape, || rng.gen_range(-1f32..1.))
    }

    fn max_abs(x: &Array3<f32>) -> f32 {
        x.iter().fold(0f32, |m, x| m.max(x.abs()))
    }

    fn assert_agree(direct: &Array3<f32>, fft: &Array3<f32>) {
        assert_eq!(direct.dim(), fft.dim());
        let tolerance = 1e-4 * max_abs(direct).max(1.);
        for (a, b) in direct.iter().zip(fft.iter()) {
            assert!((a - b).abs() <= tolerance, "{a} != {b}");
        }
    }

    #[test]
    fn output_shapes() {
        assert_eq!(output_shape([11; 3], [5; 3], [1; 3]), Some([7; 3]));
        assert_eq!(output_shape([10, 9, 8], [3, 3, 3], [2, 2, 2]), Some([4, 4, 3]));
        assert_eq!(output_shape([4, 4, 4], [5, 1, 1], [1; 3]), None);
        assert_eq!(input_shape([4, 4, 3], [3; 3], [2; 3]), [9, 9, 7]);
    }

    #[test]
    fn direct_forward_known() -> Result<()> {
        let input = Array3::from_shape_fn([3, 1, 1], |(x, _, _)| x as f32 + 1.);
        let filter = Array3::from_shape_vec([2, 1, 1], vec![1., -1.])?;
        let output = ConvStrategy::Direct.forward(input.view(), filter.view(), [1; 3])?;
        assert_eq!(output.as_slice().unwrap(), &[-1., -1.]);
        Ok(())
    }

    #[test]
    fn strategies_agree() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(11);
        let cases = [
            ([9, 9, 9], [3, 3, 3], [1, 1, 1]),
            ([11, 8, 7], [5, 2, 3], [1, 1, 1]),
            ([10, 9, 11], [3, 3, 2], [2, 2, 3]),
            ([6, 6, 1], [2, 3, 1], [1, 2, 1]),
        ];
        for (input_shape, filter_shape, stride) in cases {
            let input = random(&mut rng, input_shape);
            let filter = random(&mut rng, filter_shape);
            let direct = ConvStrategy::Direct.forward(input.view(), filter.view(), stride)?;
            let fft = ConvStrategy::Fft.forward(input.view(), filter.view(), stride)?;
            assert_agree(&direct, &fft);

            let grad = random(&mut rng, direct.shape3());
            let direct = ConvStrategy::Direct.backward_input(
                grad.view(),
                filter.view(),
                stride,
                input_shape,
            )?;
            let fft =
                ConvStrategy::Fft.backward_input(grad.view(), filter.view(), stride, input_shape)?;
            assert_eq!(direct.shape3(), input_shape);
            assert_agree(&direct, &fft);

            let direct = ConvStrategy::Direct.backward_filter(
                input.view(),
                grad.view(),
                stride,
                filter_shape,
            )?;
            let fft = ConvStrategy::Fft.backward_filter(
                input.view(),
                grad.view(),
                stride,
                filter_shape,
            )?;
            assert_eq!(direct.shape3(), filter_shape);
            assert_agree(&direct, &fft);
        }
        Ok(())
    }

    #[test]
    fn adjoint_identity() -> Result<()> {
        // <forward(x, w), g> == <x, backward_input(g, w)> == <w, backward_filter(x, g)>
        let mut rng = SmallRng::seed_from_u64(3);
        let stride = [2, 1, 3];
        let input = random(&mut rng, [9, 6, 10]);
        let filter = random(&mut rng, [3, 2, 2]);
        for strategy in [ConvStrategy::Direct, ConvStrategy::Fft] {
            let output = strategy.forward(input.view(), filter.view(), stride)?;
            let grad = random(&mut rng, output.shape3());
            let lhs = (&*output * &grad).sum();
            let dx = strategy.backward_input(grad.view(), filter.view(), stride, [9, 6, 10])?;
            let dw = strategy.backward_filter(input.view(), grad.view(), stride, [3, 2, 2])?;
            approx::assert_relative_eq!(lhs, (&*dx * &input).sum(), epsilon = 1e-3, max_relative = 1e-4);
            approx::assert_relative_eq!(lhs, (&*dw * &filter).sum(), epsilon = 1e-3, max_relative = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn select_prefers_fft_for_large_filters() {
        assert_eq!(
            ConvStrategy::select([9, 9, 9], [2, 2, 2], [1; 3]),
            ConvStrategy::Direct
        );
        assert_eq!(
            ConvStrategy::select([40, 40, 40], [11, 11, 11], [1; 3]),
            ConvStrategy::Fft
        );
    }

    #[test]
    fn mismatched_grad_is_rejected() {
        let grad = Array3::<f32>::zeros([2, 2, 2]);
        let filter = Array3::<f32>::zeros([3, 3, 3]);
        let err = ConvStrategy::Direct
            .backward_input(grad.view(), filter.view(), [1; 3], [5, 5, 5])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ShapeMismatch { .. })
        ));
    }
}
