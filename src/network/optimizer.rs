use ndarray::{Array3, ArrayView3, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Sgd`].
    #[derive(Debug, Clone)]
    pub struct SgdBuilder {
        learning_rate: f32,
        momentum: f32,
        weight_decay: f32,
    }

    impl SgdBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.01,
                momentum: 0.,
                weight_decay: 0.,
            }
        }
        /// Learning rate (eta). Default is 0.01.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Momentum (mu). Default is 0.
        ///
        /// If `momentum` is not 0, a velocity volume is kept per filter.
        pub fn momentum(self, momentum: f32) -> Self {
            Self { momentum, ..self }
        }
        /// L2 weight decay (lambda). Default is 0.
        ///
        /// Biases are not decayed.
        pub fn weight_decay(self, weight_decay: f32) -> Self {
            Self {
                weight_decay,
                ..self
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> Sgd {
            let Self {
                learning_rate,
                momentum,
                weight_decay,
            } = self;
            Sgd {
                learning_rate,
                momentum,
                weight_decay,
            }
        }
    }
}
use builder::*;

/// Stochastic Gradient Descent.
///
/// Per filter, with `g` the gradient summed over the batch:
///
/// `v = momentum * v - learning_rate * (g / batch + weight_decay * w)`
///
/// `w += v`
///
/// With zero momentum and decay this is `w -= learning_rate * g / batch`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
}

impl Default for Sgd {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Sgd {
    /// A builder for creating a [`Sgd`].
    pub fn builder() -> SgdBuilder {
        SgdBuilder::new()
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// The momentum.
    pub fn momentum(&self) -> f32 {
        self.momentum
    }
    /// The weight decay.
    pub fn weight_decay(&self) -> f32 {
        self.weight_decay
    }
    pub(crate) fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
    pub(crate) fn set_momentum(&mut self, momentum: f32) {
        self.momentum = momentum;
    }
    pub(crate) fn set_weight_decay(&mut self, weight_decay: f32) {
        self.weight_decay = weight_decay;
    }
    pub(crate) fn update(
        &self,
        weights: &mut Array3<f32>,
        velocity: &mut Option<Array3<f32>>,
        grad: ArrayView3<f32>,
        batch: usize,
    ) {
        let Self {
            learning_rate,
            momentum,
            weight_decay,
        } = *self;
        let scale = 1. / batch as f32;
        if momentum == 0. && velocity.is_none() {
            Zip::from(weights).and(&grad).for_each(|w, dw| {
                *w -= learning_rate * (dw * scale + weight_decay * *w);
            });
            return;
        }
        let velocity = velocity.get_or_insert_with(|| Array3::zeros(weights.raw_dim()));
        Zip::from(weights)
            .and(velocity)
            .and(&grad)
            .for_each(|w, v, dw| {
                *v = momentum * *v - learning_rate * (dw * scale + weight_decay * *w);
                *w += *v;
            });
    }
    pub(crate) fn update_bias(&self, bias: &mut f32, velocity: &mut f32, grad: f32, batch: usize) {
        *velocity = self.momentum * *velocity - self.learning_rate * grad / batch as f32;
        *bias += *velocity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn plain_step() {
        let sgd = Sgd::builder().learning_rate(0.5).build();
        let mut w = Array3::from_elem([1, 1, 2], 1f32);
        let mut v = None;
        let g = Array3::from_shape_vec([1, 1, 2], vec![2f32, -4.]).unwrap();
        sgd.update(&mut w, &mut v, g.view(), 2);
        assert_eq!(w.as_slice().unwrap(), &[0.5, 2.]);
        assert!(v.is_none());
    }

    #[test]
    fn zero_gradient_is_identity() {
        let sgd = Sgd::default();
        let mut w = Array3::from_shape_fn([2, 2, 2], |(x, y, z)| (x + 2 * y + 4 * z) as f32 - 3.5);
        let expected = w.clone();
        sgd.update(&mut w, &mut None, Array3::zeros([2, 2, 2]).view(), 1);
        assert_eq!(w, expected);
    }

    #[test]
    fn momentum_and_decay() {
        let sgd = Sgd::builder()
            .learning_rate(0.1)
            .momentum(0.9)
            .weight_decay(0.01)
            .build();
        let mut w = Array3::from_elem([1, 1, 1], 2f32);
        let mut v = None;
        let g = Array3::from_elem([1, 1, 1], 1f32);
        sgd.update(&mut w, &mut v, g.view(), 1);
        // v = -0.1 * (1 + 0.02) = -0.102
        assert_relative_eq!(w[[0, 0, 0]], 2. - 0.102);
        sgd.update(&mut w, &mut v, g.view(), 1);
        let v2 = 0.9 * -0.102 - 0.1 * (1. + 0.01 * (2. - 0.102));
        assert_relative_eq!(v.as_ref().unwrap()[[0, 0, 0]], v2, max_relative = 1e-6);
        assert_relative_eq!(w[[0, 0, 0]], 2. - 0.102 + v2, max_relative = 1e-6);

        let mut bias = 0f32;
        let mut bias_velocity = 0f32;
        sgd.update_bias(&mut bias, &mut bias_velocity, 4., 2);
        sgd.update_bias(&mut bias, &mut bias_velocity, 4., 2);
        assert_relative_eq!(bias, -0.2 + (0.9 * -0.2 - 0.2), max_relative = 1e-6);
    }
}
