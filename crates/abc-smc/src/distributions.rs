//! Prior and perturbation-kernel distribution families.
//!
//! Each leaf of the calibrated parameter tree is assigned one prior
//! distribution and one perturbation kernel. Kernels describe additive
//! noise: a proposal for leaf value `x` given parent value `p` is
//! `p + kernel.sample()`, and the kernel density of the move is
//! evaluated at `x - p`.

use std::collections::BTreeMap;

use abc_core::errors::ErrorInfo;
use abc_core::{AbcError, ParamPath, ParamValues, RngHandle};
use rand::distributions::Distribution as RandDistribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statrs::distribution::{Beta, Continuous, Discrete, Gamma, Normal, Poisson, Uniform};

/// One parametric distribution family, usable as a prior or a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "kebab-case")]
pub enum DistributionSpec {
    /// Continuous uniform on `[low, high]`.
    Uniform {
        /// Lower bound of the support.
        low: f64,
        /// Upper bound of the support.
        high: f64,
    },
    /// Normal with the given mean and standard deviation.
    Normal {
        /// Location parameter.
        mean: f64,
        /// Scale parameter, strictly positive.
        std_dev: f64,
    },
    /// Gamma parameterized by shape and scale (scipy convention).
    Gamma {
        /// Shape parameter `a`, strictly positive.
        shape: f64,
        /// Scale parameter (inverse rate), strictly positive.
        scale: f64,
    },
    /// Beta on `(0, 1)` with the given shape parameters.
    Beta {
        /// First shape parameter, strictly positive.
        alpha: f64,
        /// Second shape parameter, strictly positive.
        beta: f64,
    },
    /// Poisson with the given mean. Density evaluation rounds the
    /// argument to the nearest non-negative integer.
    Poisson {
        /// Mean parameter, strictly positive.
        lambda: f64,
    },
    /// Empirical table of values with optional weights (uniform when
    /// omitted). Support is exactly the listed values.
    Empirical {
        /// Candidate values.
        values: Vec<f64>,
        /// Relative weights, same length as `values` when present.
        #[serde(default)]
        weights: Option<Vec<f64>>,
    },
}

impl DistributionSpec {
    /// Checks hyperparameters, returning a fatal configuration error for
    /// malformed families.
    pub fn validate(&self) -> Result<(), AbcError> {
        let problem = match self {
            DistributionSpec::Uniform { low, high } => {
                (!(low < high)).then(|| "uniform requires low < high")
            }
            DistributionSpec::Normal { std_dev, .. } => {
                (!(std_dev.is_finite() && *std_dev > 0.0)).then(|| "normal requires std_dev > 0")
            }
            DistributionSpec::Gamma { shape, scale } => {
                (!(*shape > 0.0 && *scale > 0.0)).then(|| "gamma requires shape > 0 and scale > 0")
            }
            DistributionSpec::Beta { alpha, beta } => {
                (!(*alpha > 0.0 && *beta > 0.0)).then(|| "beta requires alpha > 0 and beta > 0")
            }
            DistributionSpec::Poisson { lambda } => {
                (!(*lambda > 0.0)).then(|| "poisson requires lambda > 0")
            }
            DistributionSpec::Empirical { values, weights } => {
                if values.is_empty() {
                    Some("empirical requires at least one value")
                } else if let Some(weights) = weights {
                    if weights.len() != values.len() || weights.iter().any(|w| *w < 0.0) {
                        Some("empirical weights must be non-negative and match values")
                    } else if weights.iter().sum::<f64>() <= 0.0 {
                        Some("empirical weights must not all be zero")
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        };
        match problem {
            Some(message) => Err(AbcError::Config(ErrorInfo::new(
                "distribution-malformed",
                message,
            ))),
            None => Ok(()),
        }
    }

    /// Draws one value.
    pub fn sample(&self, rng: &mut RngHandle) -> Result<f64, AbcError> {
        match self {
            DistributionSpec::Uniform { low, high } => {
                Ok(Uniform::new(*low, *high).map_err(family_error)?.sample(rng))
            }
            DistributionSpec::Normal { mean, std_dev } => Ok(Normal::new(*mean, *std_dev)
                .map_err(family_error)?
                .sample(rng)),
            DistributionSpec::Gamma { shape, scale } => Ok(Gamma::new(*shape, 1.0 / *scale)
                .map_err(family_error)?
                .sample(rng)),
            DistributionSpec::Beta { alpha, beta } => Ok(Beta::new(*alpha, *beta)
                .map_err(family_error)?
                .sample(rng)),
            DistributionSpec::Poisson { lambda } => {
                Ok(Poisson::new(*lambda).map_err(family_error)?.sample(rng))
            }
            DistributionSpec::Empirical { values, weights } => {
                let weights = match weights {
                    Some(weights) => weights.clone(),
                    None => vec![1.0; values.len()],
                };
                let total: f64 = weights.iter().sum();
                let mut draw = rng.gen::<f64>() * total;
                for (value, weight) in values.iter().zip(&weights) {
                    draw -= weight;
                    if draw <= 0.0 {
                        return Ok(*value);
                    }
                }
                Ok(*values.last().ok_or_else(|| {
                    AbcError::Config(ErrorInfo::new(
                        "distribution-malformed",
                        "empirical requires at least one value",
                    ))
                })?)
            }
        }
    }

    /// Density (or probability mass) at `x`; zero outside the support.
    pub fn density(&self, x: f64) -> f64 {
        match self {
            DistributionSpec::Uniform { low, high } => {
                if x < *low || x > *high {
                    0.0
                } else {
                    Uniform::new(*low, *high).map(|d| d.pdf(x)).unwrap_or(0.0)
                }
            }
            DistributionSpec::Normal { mean, std_dev } => Normal::new(*mean, *std_dev)
                .map(|d| d.pdf(x))
                .unwrap_or(0.0),
            DistributionSpec::Gamma { shape, scale } => {
                if x <= 0.0 {
                    0.0
                } else {
                    Gamma::new(*shape, 1.0 / *scale)
                        .map(|d| d.pdf(x))
                        .unwrap_or(0.0)
                }
            }
            DistributionSpec::Beta { alpha, beta } => {
                if x <= 0.0 || x >= 1.0 {
                    0.0
                } else {
                    Beta::new(*alpha, *beta).map(|d| d.pdf(x)).unwrap_or(0.0)
                }
            }
            DistributionSpec::Poisson { lambda } => {
                if x < -0.5 {
                    0.0
                } else {
                    Poisson::new(*lambda)
                        .map(|d| d.pmf(x.round().max(0.0) as u64))
                        .unwrap_or(0.0)
                }
            }
            DistributionSpec::Empirical { values, weights } => {
                let total: f64 = match weights {
                    Some(weights) => weights.iter().sum(),
                    None => values.len() as f64,
                };
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, value)| (*value - x).abs() < 1e-12)
                    .map(|(idx, _)| match weights {
                        Some(weights) => weights[idx] / total,
                        None => 1.0 / total,
                    })
                    .sum()
            }
        }
    }

    /// Whether `x` lies inside the support of the distribution.
    pub fn supports(&self, x: f64) -> bool {
        self.density(x) > 0.0
    }
}

fn family_error(err: statrs::StatsError) -> AbcError {
    AbcError::Config(ErrorInfo::new("distribution-malformed", err.to_string()))
}

/// Leaf-path-addressed priors and perturbation kernels for one run.
///
/// Built from the run configuration and validated against the baseline
/// parameter tree before any job is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    priors: BTreeMap<ParamPath, DistributionSpec>,
    kernels: BTreeMap<ParamPath, DistributionSpec>,
}

impl ParameterSpec {
    /// Builds the parameter spec from dotted-path maps, checking that every path
    /// addresses a numeric leaf of `baseline` and that priors and
    /// kernels cover exactly the same leaves.
    pub fn new(
        priors: &BTreeMap<String, DistributionSpec>,
        kernels: &BTreeMap<String, DistributionSpec>,
        baseline: &Value,
    ) -> Result<Self, AbcError> {
        if priors.is_empty() {
            return Err(AbcError::Config(ErrorInfo::new(
                "priors-empty",
                "at least one prior must be configured",
            )));
        }
        let mut parsed_priors = BTreeMap::new();
        for (raw, dist) in priors {
            let path = ParamPath::parse(raw)?;
            dist.validate()?;
            abc_core::params::get_leaf(baseline, &path)?;
            parsed_priors.insert(path, dist.clone());
        }
        let mut parsed_kernels = BTreeMap::new();
        for (raw, dist) in kernels {
            let path = ParamPath::parse(raw)?;
            dist.validate()?;
            if !parsed_priors.contains_key(&path) {
                return Err(AbcError::Config(
                    ErrorInfo::new("kernel-without-prior", "kernel path has no matching prior")
                        .with_context("path", path.as_str()),
                ));
            }
            parsed_kernels.insert(path, dist.clone());
        }
        for path in parsed_priors.keys() {
            if !parsed_kernels.contains_key(path) {
                return Err(AbcError::Config(
                    ErrorInfo::new("prior-without-kernel", "prior path has no matching kernel")
                        .with_context("path", path.as_str()),
                ));
            }
        }
        Ok(Self {
            priors: parsed_priors,
            kernels: parsed_kernels,
        })
    }

    /// Iterates priors in path order.
    pub fn priors(&self) -> impl Iterator<Item = (&ParamPath, &DistributionSpec)> {
        self.priors.iter()
    }

    /// Returns the kernel for a leaf path.
    pub fn kernel(&self, path: &ParamPath) -> Option<&DistributionSpec> {
        self.kernels.get(path)
    }

    /// Returns the prior for a leaf path.
    pub fn prior(&self, path: &ParamPath) -> Option<&DistributionSpec> {
        self.priors.get(path)
    }

    /// Joint prior density of a full parameter set (leaves independent).
    pub fn prior_density(&self, values: &ParamValues) -> f64 {
        self.priors
            .iter()
            .map(|(path, prior)| values.get(path).map(|x| prior.density(*x)).unwrap_or(0.0))
            .product()
    }

    /// Joint kernel density of moving from `parent` to `child`.
    pub fn kernel_density(&self, child: &ParamValues, parent: &ParamValues) -> f64 {
        self.kernels
            .iter()
            .map(|(path, kernel)| {
                match (child.get(path), parent.get(path)) {
                    (Some(x), Some(p)) => kernel.density(x - p),
                    _ => 0.0,
                }
            })
            .product()
    }
}
