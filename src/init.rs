use crate::error::Error;
use anyhow::Result;
use ndarray::{ArrayBase, DataMut, Ix3};
use rand::{
    distributions::{Distribution, Uniform},
    Rng,
};
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

/// Filter weight initialization.
///
/// `fan_in` is `width(source) * filter_volume` and `fan_out` is
/// `width(destination) * filter_volume`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Init {
    /// All zeros.
    Zero,
    /// All `value`.
    Constant {
        /// The value.
        value: f32,
    },
    /// Uniform in `[low, high)`.
    Uniform {
        /// Lower bound.
        low: f32,
        /// Upper bound.
        high: f32,
    },
    /// Normal with `mean` and standard deviation `sigma`.
    Gaussian {
        /// Mean.
        mean: f32,
        /// Standard deviation.
        sigma: f32,
    },
    /// Uniform in `+-sqrt(6 / (fan_in + fan_out))`.
    Xavier,
    /// Normal with standard deviation `sqrt(2 / fan_in)`.
    Msra,
}

impl Default for Init {
    fn default() -> Self {
        Self::Xavier
    }
}

fn xavier(fan_in: usize, fan_out: usize) -> Uniform<f32> {
    let a = (6. / (fan_in + fan_out).max(1) as f32).sqrt();
    Uniform::new(-a, a)
}

fn msra(fan_in: usize) -> Result<Normal<f32>> {
    let sigma = (2. / fan_in.max(1) as f32).sqrt();
    Ok(Normal::new(0., sigma)?)
}

impl Init {
    /// Parses `name` with optional comma separated `args`.
    ///
    /// - `zero`
    /// - `constant` `value` (default 0)
    /// - `uniform` `low,high` (default `-0.1,0.1`, a single arg `r` means `-r,r`)
    /// - `gaussian` `mean,sigma` (default `0,0.01`)
    /// - `xavier`
    /// - `msra`
    ///
    /// `owner` names the edge in errors.
    pub fn parse(owner: &str, name: &str, args: Option<&str>) -> Result<Self> {
        let invalid = || Error::InvalidOption {
            owner: owner.into(),
            key: "init_args".into(),
            value: args.unwrap_or_default().into(),
        };
        let values = match args.map(str::trim).filter(|x| !x.is_empty()) {
            Some(args) => args
                .split(',')
                .map(|x| x.trim().parse::<f32>().map_err(|_| invalid()))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let max_args = match name {
            "constant" => 1,
            "uniform" | "gaussian" => 2,
            _ => 0,
        };
        if values.len() > max_args {
            return Err(invalid().into());
        }
        let init = match (name, values.as_slice()) {
            ("zero", _) => Self::Zero,
            ("constant", values) => Self::Constant {
                value: values.first().copied().unwrap_or(0.),
            },
            ("uniform", []) => Self::Uniform {
                low: -0.1,
                high: 0.1,
            },
            ("uniform", [r]) => Self::Uniform { low: -r, high: *r },
            ("uniform", [low, high, ..]) => Self::Uniform {
                low: *low,
                high: *high,
            },
            ("gaussian", values) => Self::Gaussian {
                mean: values.first().copied().unwrap_or(0.),
                sigma: values.get(1).copied().unwrap_or(0.01),
            },
            ("xavier", _) => Self::Xavier,
            ("msra", _) => Self::Msra,
            _ => {
                return Err(Error::InvalidOption {
                    owner: owner.into(),
                    key: "init".into(),
                    value: name.into(),
                }
                .into())
            }
        };
        init.validate(owner)?;
        Ok(init)
    }
    /// The name accepted by [`.parse()`](Self::parse).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::Constant { .. } => "constant",
            Self::Uniform { .. } => "uniform",
            Self::Gaussian { .. } => "gaussian",
            Self::Xavier => "xavier",
            Self::Msra => "msra",
        }
    }
    /// The args accepted by [`.parse()`](Self::parse), `None` for schemes without any.
    pub fn args(&self) -> Option<String> {
        match *self {
            Self::Constant { value } => Some(value.to_string()),
            Self::Uniform { low, high } => Some(format!("{low},{high}")),
            Self::Gaussian { mean, sigma } => Some(format!("{mean},{sigma}")),
            Self::Zero | Self::Xavier | Self::Msra => None,
        }
    }
    /// Checks the parameters, values built in code or deserialized skip [`.parse()`](Self::parse).
    ///
    /// **Errors**
    /// - [`Error::InvalidOption`] if a value is not finite, a uniform range is empty, or
    /// sigma is negative.
    pub fn validate(&self, owner: &str) -> Result<()> {
        let valid = match *self {
            Self::Constant { value } => value.is_finite(),
            Self::Uniform { low, high } => low.is_finite() && high.is_finite() && low < high,
            Self::Gaussian { mean, sigma } => mean.is_finite() && sigma.is_finite() && sigma >= 0.,
            Self::Zero | Self::Xavier | Self::Msra => true,
        };
        if !valid {
            return Err(Error::InvalidOption {
                owner: owner.into(),
                key: "init_args".into(),
                value: self.args().unwrap_or_default(),
            }
            .into());
        }
        Ok(())
    }
    /// Fills `weights`.
    ///
    /// **Errors**
    /// - [`Error::InvalidOption`] if [`.validate()`](Self::validate) fails.
    pub fn fill<S, R>(
        &self,
        weights: &mut ArrayBase<S, Ix3>,
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Result<()>
    where
        S: DataMut<Elem = f32>,
        R: Rng,
    {
        self.validate("init")?;
        match *self {
            Self::Zero => weights.fill(0.),
            Self::Constant { value } => weights.fill(value),
            Self::Uniform { low, high } => sample(weights, Uniform::new(low, high), rng),
            Self::Gaussian { mean, sigma } => sample(weights, Normal::new(mean, sigma)?, rng),
            Self::Xavier => sample(weights, xavier(fan_in, fan_out), rng),
            Self::Msra => sample(weights, msra(fan_in)?, rng),
        }
        Ok(())
    }
}

fn sample<S, D, R>(weights: &mut ArrayBase<S, Ix3>, distribution: D, rng: &mut R)
where
    S: DataMut<Elem = f32>,
    D: Distribution<f32>,
    R: Rng,
{
    weights
        .iter_mut()
        .zip(distribution.sample_iter(rng))
        .for_each(|(w, x)| *w = x);
}
