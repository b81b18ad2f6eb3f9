use crate::volume::Volume;
use anyhow::Result;
use ndarray::{s, ArrayView3, Zip};

/// The strided window of `shape` starting at filter offset `k`.
macro_rules! window {
    ($k:expr, $shape:expr, $stride:expr) => {
        s![
            $k.0..$k.0 + ($shape[0] - 1) * $stride[0] + 1;$stride[0] as isize,
            $k.1..$k.1 + ($shape[1] - 1) * $stride[1] + 1;$stride[1] as isize,
            $k.2..$k.2 + ($shape[2] - 1) * $stride[2] + 1;$stride[2] as isize
        ]
    };
}

pub(super) fn forward(
    input: ArrayView3<f32>,
    filter: ArrayView3<f32>,
    stride: [usize; 3],
    output_shape: [usize; 3],
) -> Result<Volume> {
    let mut output = Volume::zeros(output_shape)?;
    for (k, w) in filter.indexed_iter() {
        output.scaled_add(*w, &input.slice(window!(k, output_shape, stride)));
    }
    Ok(output)
}

pub(super) fn backward_input(
    grad: ArrayView3<f32>,
    filter: ArrayView3<f32>,
    stride: [usize; 3],
    input_shape: [usize; 3],
) -> Result<Volume> {
    let (gx, gy, gz) = grad.dim();
    let grad_shape = [gx, gy, gz];
    let mut input_grad = Volume::zeros(input_shape)?;
    for (k, w) in filter.indexed_iter() {
        input_grad
            .slice_mut(window!(k, grad_shape, stride))
            .scaled_add(*w, &grad);
    }
    Ok(input_grad)
}

pub(super) fn backward_filter(
    input: ArrayView3<f32>,
    grad: ArrayView3<f32>,
    stride: [usize; 3],
    filter_shape: [usize; 3],
) -> Result<Volume> {
    let (gx, gy, gz) = grad.dim();
    let grad_shape = [gx, gy, gz];
    let mut filter_grad = Volume::new(filter_shape)?;
    for (k, dw) in filter_grad.indexed_iter_mut() {
        *dw = Zip::from(input.slice(window!(k, grad_shape, stride)))
            .and(&grad)
            .fold(0., |acc, x, g| acc + x * g);
    }
    Ok(filter_grad)
}
