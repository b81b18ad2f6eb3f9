use crate::error::Error;
use anyhow::Result;
use ndarray::{ArrayBase, DataMut, Ix3, Zip};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Elementwise non-linearity applied by a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferFunction {
    /// `a * x + b`.
    Linear {
        /// Slope.
        a: f32,
        /// Offset.
        b: f32,
    },
    /// `max(x, 0)`.
    RectifyLinear,
    /// `1 / (1 + e^-x)`.
    Logistics,
    /// Logistic forward, the gradient passes through unchanged.
    ///
    /// Pair with [`binomial_cross_entropy`](crate::loss::binomial_cross_entropy), whose
    /// gradient already folds in the derivative of the logistic.
    ForwardLogistics,
    /// `a * tanh(b * x)`.
    Tanh {
        /// Amplitude.
        a: f32,
        /// Slope.
        b: f32,
    },
}

impl Default for TransferFunction {
    fn default() -> Self {
        Self::identity()
    }
}

impl TransferFunction {
    /// `linear(1, 0)`.
    pub fn identity() -> Self {
        Self::Linear { a: 1., b: 0. }
    }
    /// Parses `name` with optional comma separated `args`.
    ///
    /// `linear` takes up to 2 args (default `1,0`), `tanh` takes up to 2 args (default
    /// `1,1`), the rest take none.
    ///
    /// **Errors**
    /// - [`Error::UnknownTransferFunction`] for an unknown name.
    /// - [`Error::InvalidOption`] if the args do not parse or are too many.
    pub fn parse(name: &str, args: Option<&str>) -> Result<Self> {
        let values = parse_args(name, args)?;
        let arg = |index: usize, default: f32| values.get(index).copied().unwrap_or(default);
        let max_args = match name {
            "linear" | "tanh" => 2,
            _ => 0,
        };
        if values.len() > max_args {
            return Err(invalid_args(name, args).into());
        }
        let function = match name {
            "linear" => Self::Linear {
                a: arg(0, 1.),
                b: arg(1, 0.),
            },
            "rectify_linear" | "relu" => Self::RectifyLinear,
            "logistics" | "sigmoid" => Self::Logistics,
            "forward_logistics" => Self::ForwardLogistics,
            "tanh" => Self::Tanh {
                a: arg(0, 1.),
                b: arg(1, 1.),
            },
            _ => return Err(Error::UnknownTransferFunction(name.into()).into()),
        };
        if let Self::Tanh { a, .. } = function {
            if a == 0. {
                return Err(invalid_args(name, args).into());
            }
        }
        Ok(function)
    }
    /// The name accepted by [`.parse()`](Self::parse).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::RectifyLinear => "rectify_linear",
            Self::Logistics => "logistics",
            Self::ForwardLogistics => "forward_logistics",
            Self::Tanh { .. } => "tanh",
        }
    }
    /// `f(x)`.
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            Self::Linear { a, b } => a * x + b,
            Self::RectifyLinear => x.max(0.),
            Self::Logistics | Self::ForwardLogistics => 1. / (1. + (-x).exp()),
            Self::Tanh { a, b } => a * (b * x).tanh(),
        }
    }
    /// The derivative, in terms of the output `f = f(x)`.
    pub fn gradient(&self, f: f32) -> f32 {
        match *self {
            Self::Linear { a, .. } => a,
            Self::RectifyLinear => {
                if f > 0. {
                    1.
                } else {
                    0.
                }
            }
            Self::Logistics => f * (1. - f),
            Self::ForwardLogistics => 1.,
            Self::Tanh { a, b } => (b / a) * (a - f) * (a + f),
        }
    }
    /// Applies the function in place.
    pub fn apply_mut<S: DataMut<Elem = f32>>(&self, x: &mut ArrayBase<S, Ix3>) {
        if *self == Self::identity() {
            return;
        }
        x.map_inplace(|x| *x = self.apply(*x));
    }
    /// Multiplies `grad` by the derivative at the outputs `f`, in place.
    pub fn gradient_mut<S1, S2>(&self, grad: &mut ArrayBase<S1, Ix3>, f: &ArrayBase<S2, Ix3>)
    where
        S1: DataMut<Elem = f32>,
        S2: ndarray::Data<Elem = f32>,
    {
        match self {
            Self::ForwardLogistics => (),
            Self::Linear { a, .. } if *a == 1. => (),
            _ => Zip::from(grad)
                .and(f)
                .for_each(|g, f| *g *= self.gradient(*f)),
        }
    }
}

impl FromStr for TransferFunction {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, None)
    }
}

impl fmt::Display for TransferFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Linear { a, b } | Self::Tanh { a, b } => write!(f, "{}({a}, {b})", self.name()),
            _ => write!(f, "{}", self.name()),
        }
    }
}

fn invalid_args(name: &str, args: Option<&str>) -> Error {
    Error::InvalidOption {
        owner: name.into(),
        key: "function_args".into(),
        value: args.unwrap_or_default().into(),
    }
}

fn parse_args(name: &str, args: Option<&str>) -> Result<Vec<f32>> {
    let Some(args) = args.map(str::trim).filter(|x| !x.is_empty()) else {
        return Ok(Vec::new());
    };
    args.split(',')
        .map(|x| {
            x.trim()
                .parse::<f32>()
                .map_err(|_| anyhow::Error::from(invalid_args(name, Some(args))))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn all() -> [TransferFunction; 5] {
        [
            TransferFunction::Linear { a: 0.5, b: -0.25 },
            TransferFunction::RectifyLinear,
            TransferFunction::Logistics,
            TransferFunction::Tanh { a: 1.7159, b: 0.6666 },
            TransferFunction::identity(),
        ]
    }

    #[test]
    fn parse_names() -> Result<()> {
        assert_eq!(TransferFunction::parse("linear", None)?, TransferFunction::identity());
        assert_eq!(
            TransferFunction::parse("linear", Some("2, 3"))?,
            TransferFunction::Linear { a: 2., b: 3. }
        );
        assert_eq!(
            TransferFunction::parse("tanh", Some("1.5"))?,
            TransferFunction::Tanh { a: 1.5, b: 1. }
        );
        assert_eq!(
            "rectify_linear".parse::<TransferFunction>()?,
            TransferFunction::RectifyLinear
        );
        assert_eq!(
            TransferFunction::parse("forward_logistics", Some(""))?,
            TransferFunction::ForwardLogistics
        );
        Ok(())
    }

    #[test]
    fn parse_errors() {
        let err = TransferFunction::parse("softsign", None).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::UnknownTransferFunction("softsign".into()))
        );
        for (name, args) in [("linear", "1,x"), ("logistics", "1"), ("tanh", "0,1"), ("tanh", "1,2,3")] {
            let err = TransferFunction::parse(name, Some(args)).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<Error>(), Some(Error::InvalidOption { .. })),
                "{name}({args}): {err}"
            );
        }
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let h = 1e-3;
        for function in all() {
            for x in [-2.1f32, -0.7, 0.3, 1.2, 2.5] {
                let numeric = (function.apply(x + h) - function.apply(x - h)) / (2. * h);
                let analytic = function.gradient(function.apply(x));
                assert_relative_eq!(numeric, analytic, epsilon = 1e-2, max_relative = 1e-2);
            }
        }
    }

    #[test]
    fn forward_logistics_passes_gradient() {
        let f = TransferFunction::ForwardLogistics;
        assert_relative_eq!(f.apply(0.), 0.5);
        let mut grad = Array3::from_elem([2, 2, 2], 0.25f32);
        let out = Array3::from_elem([2, 2, 2], 0.9f32);
        f.gradient_mut(&mut grad, &out);
        assert!(grad.iter().all(|g| *g == 0.25));
    }

    #[test]
    fn apply_mut_rectify() {
        let mut x = Array3::from_shape_vec([1, 1, 4], vec![-1f32, 0., 2., -3.]).unwrap();
        TransferFunction::RectifyLinear.apply_mut(&mut x);
        assert_eq!(x.as_slice().unwrap(), &[0., 0., 2., 0.]);
    }

    #[test]
    fn display() {
        assert_eq!(TransferFunction::identity().to_string(), "linear(1, 0)");
        assert_eq!(TransferFunction::Logistics.to_string(), "logistics");
    }
}
