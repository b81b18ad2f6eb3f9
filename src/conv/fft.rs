use crate::volume::{dim3, pool::Pool, Volume};
use anyhow::{bail, Context as _, Result};
use ndarray::{s, Array3, ArrayView3, Axis, Zip};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{num_complex::Complex, Fft, FftDirection, FftPlanner};
use std::{collections::HashMap, hash::Hash, sync::Arc};

static PLANNER: Lazy<Mutex<FftPlanner<f32>>> = Lazy::new(|| Mutex::new(FftPlanner::new()));
static REAL_PLANNER: Lazy<Mutex<RealFftPlanner<f32>>> =
    Lazy::new(|| Mutex::new(RealFftPlanner::new()));
static PLANS: Lazy<RwLock<HashMap<(usize, bool), Arc<dyn Fft<f32>>>>> = Lazy::new(RwLock::default);
static REAL_PLANS: Lazy<RwLock<HashMap<usize, Arc<dyn RealToComplex<f32>>>>> =
    Lazy::new(RwLock::default);
static INVERSE_REAL_PLANS: Lazy<RwLock<HashMap<usize, Arc<dyn ComplexToReal<f32>>>>> =
    Lazy::new(RwLock::default);
static SPECTRA: Lazy<Pool<Complex<f32>>> = Lazy::new(Pool::new);

/// Every `stride`th voxel from the origin, `shape` of them per axis.
macro_rules! strided {
    ($shape:expr, $stride:expr) => {
        s![
            ..($shape[0] - 1) * $stride[0] + 1;$stride[0] as isize,
            ..($shape[1] - 1) * $stride[1] + 1;$stride[1] as isize,
            ..($shape[2] - 1) * $stride[2] + 1;$stride[2] as isize
        ]
    };
}

fn cached<K: Hash + Eq, P: Clone>(
    plans: &RwLock<HashMap<K, P>>,
    key: K,
    make: impl FnOnce() -> P,
) -> P {
    if let Some(plan) = plans.read().get(&key) {
        return plan.clone();
    }
    let plan = make();
    plans.write().entry(key).or_insert(plan).clone()
}

fn plan(len: usize, direction: FftDirection) -> Arc<dyn Fft<f32>> {
    cached(&PLANS, (len, direction == FftDirection::Forward), || {
        PLANNER.lock().plan_fft(len, direction)
    })
}

fn real_plan(len: usize) -> Arc<dyn RealToComplex<f32>> {
    cached(&REAL_PLANS, len, || REAL_PLANNER.lock().plan_fft_forward(len))
}

fn inverse_real_plan(len: usize) -> Arc<dyn ComplexToReal<f32>> {
    cached(&INVERSE_REAL_PLANS, len, || {
        REAL_PLANNER.lock().plan_fft_inverse(len)
    })
}

/// Transforms `bins` in place along the first two axes.
fn fft2(bins: &mut Array3<Complex<f32>>, direction: FftDirection) {
    for axis in 0..2 {
        let len = bins.len_of(Axis(axis));
        if len <= 1 {
            continue;
        }
        let plan = plan(len, direction);
        let mut buffer = vec![Complex::default(); len];
        let mut scratch = vec![Complex::default(); plan.get_inplace_scratch_len()];
        for mut lane in bins.lanes_mut(Axis(axis)) {
            if let Some(lane) = lane.as_slice_mut() {
                plan.process_with_scratch(lane, &mut scratch);
            } else {
                buffer.iter_mut().zip(lane.iter()).for_each(|(b, x)| *b = *x);
                plan.process_with_scratch(&mut buffer, &mut scratch);
                lane.iter_mut().zip(buffer.iter()).for_each(|(x, b)| *x = *b);
            }
        }
    }
}

/// Half spectrum of a real volume of `extent`, `[x, y, z / 2 + 1]` bins.
///
/// Bins come from a pool keyed by shape and go back to it on drop.
pub(crate) struct Spectrum {
    bins: Array3<Complex<f32>>,
    extent: [usize; 3],
}

impl Spectrum {
    fn uninit(extent: [usize; 3]) -> Result<Self> {
        let shape = [extent[0], extent[1], extent[2] / 2 + 1];
        let data = SPECTRA.acquire(shape)?;
        Ok(Self {
            bins: Array3::from_shape_vec(shape, data)?,
            extent,
        })
    }
    /// Places `x[i]` at `i * stride` in a zero volume of `extent` and transforms it.
    pub(crate) fn new(x: ArrayView3<f32>, stride: [usize; 3], extent: [usize; 3]) -> Result<Self> {
        let mut real = Volume::zeros(extent)?;
        real.slice_mut(strided!(dim3(&x), stride)).assign(&x);
        let mut spectrum = Self::uninit(extent)?;
        let len = extent[2];
        if len == 1 {
            Zip::from(&mut spectrum.bins)
                .and(&*real)
                .for_each(|c, x| *c = Complex::new(*x, 0.));
        } else {
            let plan = real_plan(len);
            let mut scratch = plan.make_scratch_vec();
            for (mut x, mut c) in real
                .lanes_mut(Axis(2))
                .into_iter()
                .zip(spectrum.bins.lanes_mut(Axis(2)))
            {
                let x = x.as_slice_mut().context("Expected contiguous lanes!")?;
                let c = c.as_slice_mut().context("Expected contiguous lanes!")?;
                plan.process_with_scratch(x, c, &mut scratch)?;
            }
        }
        fft2(&mut spectrum.bins, FftDirection::Forward);
        Ok(spectrum)
    }
    /// Extent of the real volume.
    pub(crate) fn extent(&self) -> [usize; 3] {
        self.extent
    }
    /// Inverse transform, reading every `stride`th voxel into a volume of `shape`.
    fn inverse(mut self, stride: [usize; 3], shape: [usize; 3]) -> Result<Volume> {
        let extent = self.extent;
        fft2(&mut self.bins, FftDirection::Inverse);
        let mut real = Volume::new(extent)?;
        let len = extent[2];
        if len == 1 {
            Zip::from(&mut *real)
                .and(&self.bins)
                .for_each(|x, c| *x = c.re);
        } else {
            let plan = inverse_real_plan(len);
            let mut scratch = plan.make_scratch_vec();
            for (mut c, mut x) in self
                .bins
                .lanes_mut(Axis(2))
                .into_iter()
                .zip(real.lanes_mut(Axis(2)))
            {
                let c = c.as_slice_mut().context("Expected contiguous lanes!")?;
                // The signal is real, only rounding is left in these.
                c[0].im = 0.;
                if len % 2 == 0 {
                    c[len / 2].im = 0.;
                }
                let x = x.as_slice_mut().context("Expected contiguous lanes!")?;
                plan.process_with_scratch(c, x, &mut scratch)?;
            }
        }
        let scale = 1. / extent.iter().product::<usize>() as f32;
        if stride == [1; 3] && shape == extent {
            real.map_inplace(|x| *x *= scale);
            return Ok(real);
        }
        let mut output = Volume::new(shape)?;
        Zip::from(&mut *output)
            .and(real.slice(strided!(shape, stride)))
            .for_each(|y, x| *y = x * scale);
        Ok(output)
    }
}

impl Drop for Spectrum {
    fn drop(&mut self) {
        let bins = std::mem::take(&mut self.bins);
        let shape = dim3(&bins);
        if bins.is_standard_layout() {
            SPECTRA.release(shape, bins.into_raw_vec());
        }
    }
}

/// `a * b`, or `a * conj(b)` if `conjugate`.
fn product(a: &Spectrum, b: &Spectrum, conjugate: bool) -> Result<Spectrum> {
    if a.extent != b.extent {
        bail!(
            "Expected spectra of equal extent, found {:?} and {:?}!",
            a.extent,
            b.extent
        );
    }
    let mut output = Spectrum::uninit(a.extent)?;
    Zip::from(&mut output.bins)
        .and(&a.bins)
        .and(&b.bins)
        .for_each(|y, a, b| *y = if conjugate { *a * b.conj() } else { *a * *b });
    Ok(output)
}

/// Extent of the full convolution of `grad` spread by `stride` with `filter`.
pub(crate) fn full_extent(grad: [usize; 3], filter: [usize; 3], stride: [usize; 3]) -> [usize; 3] {
    let mut extent = [0; 3];
    for a in 0..3 {
        extent[a] = (grad[a] - 1) * stride[a] + filter[a];
    }
    extent
}

/// Correlation of the volumes behind `x` and `w`, sampled every `stride` into `shape`.
///
/// Circular over the extent, which leaves the valid region untouched.
pub(crate) fn correlate(
    x: &Spectrum,
    w: &Spectrum,
    stride: [usize; 3],
    shape: [usize; 3],
) -> Result<Volume> {
    product(x, w, true)?.inverse(stride, shape)
}

/// Full convolution of the volumes behind `g` and `w`, zero extended to `input_shape`.
pub(crate) fn convolve(g: &Spectrum, w: &Spectrum, input_shape: [usize; 3]) -> Result<Volume> {
    let extent = g.extent();
    let full = product(g, w, false)?.inverse([1; 3], extent)?;
    if extent == input_shape {
        return Ok(full);
    }
    let mut input_grad = Volume::zeros(input_shape)?;
    input_grad
        .slice_mut(s![..extent[0], ..extent[1], ..extent[2]])
        .assign(&*full);
    Ok(input_grad)
}

pub(super) fn forward(
    input: ArrayView3<f32>,
    filter: ArrayView3<f32>,
    stride: [usize; 3],
    output_shape: [usize; 3],
) -> Result<Volume> {
    let n = dim3(&input);
    let x = Spectrum::new(input, [1; 3], n)?;
    let w = Spectrum::new(filter, [1; 3], n)?;
    correlate(&x, &w, stride, output_shape)
}

pub(super) fn backward_input(
    grad: ArrayView3<f32>,
    filter: ArrayView3<f32>,
    stride: [usize; 3],
    input_shape: [usize; 3],
) -> Result<Volume> {
    let n = full_extent(dim3(&grad), dim3(&filter), stride);
    let g = Spectrum::new(grad, stride, n)?;
    let w = Spectrum::new(filter, [1; 3], n)?;
    convolve(&g, &w, input_shape)
}

pub(super) fn backward_filter(
    input: ArrayView3<f32>,
    grad: ArrayView3<f32>,
    stride: [usize; 3],
    filter_shape: [usize; 3],
) -> Result<Volume> {
    let n = dim3(&input);
    let x = Spectrum::new(input, [1; 3], n)?;
    let g = Spectrum::new(grad, stride, n)?;
    correlate(&x, &g, [1; 3], filter_shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn round_trip_transform() -> Result<()> {
        for shape in [[4, 3, 5], [2, 3, 6], [3, 2, 1]] {
            let x = Array3::from_shape_fn(shape, |(a, b, c)| (a * 15 + b * 5 + c) as f32);
            let spectrum = Spectrum::new(x.view(), [1; 3], shape)?;
            assert_eq!(dim3(&spectrum.bins), [shape[0], shape[1], shape[2] / 2 + 1]);
            let y = spectrum.inverse([1; 3], shape)?;
            assert_abs_diff_eq!(x, *y, epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn plans_are_cached() {
        let a = plan(12, FftDirection::Forward);
        let b = plan(12, FftDirection::Forward);
        assert!(Arc::ptr_eq(&a, &b));
        let c = plan(12, FftDirection::Inverse);
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(&real_plan(14), &real_plan(14)));
        assert!(Arc::ptr_eq(&inverse_real_plan(14), &inverse_real_plan(14)));
    }

    #[test]
    fn spectra_are_pooled() -> Result<()> {
        let extent = [13, 5, 7];
        let bins = [13, 5, 4];
        let x = Array3::<f32>::ones(extent);
        drop(Spectrum::new(x.view(), [1; 3], extent)?);
        let allocated = SPECTRA.stats(bins).allocated;
        assert!(allocated >= 1);
        for _ in 0..3 {
            drop(Spectrum::new(x.view(), [1; 3], extent)?);
        }
        assert_eq!(SPECTRA.stats(bins).allocated, allocated);
        Ok(())
    }

    #[test]
    fn shared_spectra_match_one_shot() -> Result<()> {
        let input = Array3::from_shape_fn([6, 5, 4], |(a, b, c)| ((a * 7 + b * 3 + c) % 5) as f32);
        let filter = Array3::from_shape_fn([2, 3, 2], |(a, b, c)| (a + b) as f32 - c as f32);
        let x = Spectrum::new(input.view(), [1; 3], [6, 5, 4])?;
        let w = Spectrum::new(filter.view(), [1; 3], [6, 5, 4])?;
        let shared = correlate(&x, &w, [2, 1, 1], [3, 3, 3])?;
        let one_shot = forward(input.view(), filter.view(), [2, 1, 1], [3, 3, 3])?;
        assert_abs_diff_eq!(*shared, *one_shot, epsilon = 1e-4);
        let other = Spectrum::new(filter.view(), [1; 3], [2, 3, 2])?;
        assert!(correlate(&x, &other, [1; 3], [1; 3]).is_err());
        Ok(())
    }
}
