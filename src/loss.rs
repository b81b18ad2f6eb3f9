//! Voxel-wise losses producing output gradients for [`Network::backward`](crate::Network::backward).
use crate::{error::Error, volume::Volume};
use anyhow::Result;
use ndarray::Zip;

/// A loss evaluated over one volume.
#[derive(Debug)]
pub struct Loss {
    /// Summed loss.
    pub loss: f32,
    /// Number of voxels on the wrong side of 0.5.
    pub class_error: usize,
    /// Gradient of `loss` with respect to the prediction.
    pub gradient: Volume,
}

fn check(prediction: &Volume, label: &Volume) -> Result<()> {
    if prediction.shape3() != label.shape3() {
        return Err(Error::ShapeMismatch {
            name: "label".into(),
            index: 0,
            expected: prediction.shape3(),
            found: label.shape3(),
        }
        .into());
    }
    Ok(())
}

fn misclassified(p: f32, y: f32) -> bool {
    (p > 0.5) != (y > 0.5)
}

/// Sum of squared differences, with gradient `2 (p - y)`.
///
/// **Errors**
/// - [`Error::ShapeMismatch`] if the shapes differ.
pub fn square_loss(prediction: &Volume, label: &Volume) -> Result<Loss> {
    check(prediction, label)?;
    let mut gradient = prediction.try_clone()?;
    let mut loss = 0.;
    let mut class_error = 0;
    Zip::from(&mut *gradient)
        .and(&**label)
        .for_each(|g, &y| {
            if misclassified(*g, y) {
                class_error += 1;
            }
            let d = *g - y;
            loss += d * d;
            *g = 2. * d;
        });
    Ok(Loss {
        loss,
        class_error,
        gradient,
    })
}

/// Binomial cross entropy of probabilities `p` and labels `y` in [0, 1].
///
/// The gradient `p - y` is taken with respect to the logit, pair it with a
/// `forward_logistics` output node.
///
/// **Errors**
/// - [`Error::ShapeMismatch`] if the shapes differ.
pub fn binomial_cross_entropy(prediction: &Volume, label: &Volume) -> Result<Loss> {
    check(prediction, label)?;
    let mut gradient = prediction.try_clone()?;
    let mut loss = 0.;
    let mut class_error = 0;
    Zip::from(&mut *gradient)
        .and(&**label)
        .for_each(|g, &y| {
            let p = *g;
            if misclassified(p, y) {
                class_error += 1;
            }
            let p_clamped = p.clamp(f32::EPSILON, 1. - f32::EPSILON);
            loss -= y * p_clamped.ln() + (1. - y) * (1. - p_clamped).ln();
            *g = p - y;
        });
    Ok(Loss {
        loss,
        class_error,
        gradient,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr3, Array3};

    fn volume(values: [f32; 4]) -> Volume {
        let array = Array3::from_shape_vec([1, 2, 2], values.to_vec()).unwrap();
        Volume::from_array(array.view()).unwrap()
    }

    #[test]
    fn square() {
        let prediction = volume([0.9, 0.2, 0.6, 0.5]);
        let label = volume([1., 0., 0., 1.]);
        let loss = square_loss(&prediction, &label).unwrap();
        assert_relative_eq!(loss.loss, 0.01 + 0.04 + 0.36 + 0.25, epsilon = 1e-6);
        assert_eq!(loss.class_error, 2);
        let expected = arr3(&[[[-0.2, 0.4], [1.2, -1.]]]);
        assert_relative_eq!(*loss.gradient, expected, epsilon = 1e-6);
    }

    #[test]
    fn cross_entropy() {
        let prediction = volume([0.9, 0.2, 0.6, 0.5]);
        let label = volume([1., 0., 0., 1.]);
        let loss = binomial_cross_entropy(&prediction, &label).unwrap();
        let expected = -(0.9f32.ln() + 0.8f32.ln() + 0.4f32.ln() + 0.5f32.ln());
        assert_relative_eq!(loss.loss, expected, epsilon = 1e-5);
        assert_eq!(loss.class_error, 2);
        let expected = arr3(&[[[-0.1, 0.2], [0.6, -0.5]]]);
        assert_relative_eq!(*loss.gradient, expected, epsilon = 1e-6);
    }

    #[test]
    fn shape_mismatch() {
        let prediction = Volume::zeros([2, 2, 2]).unwrap();
        let label = Volume::zeros([1, 2, 2]).unwrap();
        let err = square_loss(&prediction, &label).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ShapeMismatch { .. })
        ));
    }
}
