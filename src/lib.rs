//! Sample 1D distributions given functional shape
//!
//! This crate draws samples from any (possibly unnormalised) probability
//! density function by inverse transform sampling. A uniform variate `t` is
//! drawn and the equation `F(x) = t` is solved for `x`, where `F` is the
//! cumulative distribution function of the density.
//!
//! Since `F` is rarely available in closed form it is built numerically with
//! one of two strategies:
//!  - [quadrature::QuadratureCdf] integrates the density on demand. It is slow
//!    but accurate and supports infinite domains.
//!  - [chebyshev::ChebyshevCdf] fits a Chebyshev series to the density once
//!    and integrates it analytically. It is fast to evaluate but needs finite
//!    bounds.
//!
//! ```
//! # use cdf_sampler::{sample, SamplerConfig, SamplerError, Strategy};
//! # use rand::SeedableRng;
//! # fn main() -> Result<(), SamplerError> {
//! let mut rng = rand::rngs::StdRng::seed_from_u64(42);
//! let config = SamplerConfig::new()
//!     .bounds(0.0, 1.0)
//!     .strategy(Strategy::Chebyshev);
//!
//! let samples = sample(&|x: f64| x * (1.0 - x), 100, &config, &mut rng)?;
//! assert_eq!(samples.len(), 100);
//! # Ok(())}
//! ```
//!
use std::time::Duration;
use thiserror::Error;

pub mod chebyshev;
pub mod goodness;
pub mod inversion;
pub mod quadrature;
pub mod sampler;

pub use inversion::InversionError;
pub use quadrature::IntegrationError;
pub use sampler::{sample, Sampler, SamplerConfig, Samples, SamplingWarning, Strategy};

/// Invalid input detected before any numerical work is done
///
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Lower bound {lower} must be smaller than upper bound {upper}")]
    InvalidBounds { lower: f64, upper: f64 },
    #[error("Chebyshev strategy requires finite bounds, got [{lower}, {upper}]")]
    UnboundedChebyshev { lower: f64, upper: f64 },
    #[error("Tolerance must be a positive number, got {0}")]
    InvalidTolerance(f64),
    #[error("Maximum Chebyshev degree must be at least 1")]
    InvalidMaxDegree,
    #[error("Maximum Chebyshev degree {max_degree} exceeds the limit of {limit}")]
    MaxDegreeTooLarge { max_degree: usize, limit: usize },
    #[error("Maximum number of root-finding iterations must be at least 1")]
    InvalidIterations,
    #[error("Number of requested samples must be positive")]
    NoSamples,
}

/// Any failure of the sampling procedure
///
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Failed to integrate the density")]
    Integration(#[from] IntegrationError),
    #[error("Density has non-finite value {value} at x = {x}")]
    NonFiniteDensity { x: f64, value: f64 },
    #[error("Density has negative value {value} at x = {x}")]
    NegativeDensity { x: f64, value: f64 },
    #[error("Density integrates to {mass} over the domain; it must be positive and finite")]
    ZeroMass { mass: f64 },
    #[error("Failed to invert the CDF for sample {index} (t = {t})")]
    RootFinding {
        index: usize,
        t: f64,
        #[source]
        source: InversionError,
    },
    #[error("Sampling exceeded the time limit of {limit:?} at sample {index}")]
    TimedOut { index: usize, limit: Duration },
}

impl SamplerError {
    /// Index of the sample that could not be produced, if the error is tied to one
    ///
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            Self::RootFinding { index, .. } | Self::TimedOut { index, .. } => Some(*index),
            _ => None,
        }
    }
}

///
/// Support of a density
///
/// Either of the bounds may be infinite, but `lower < upper` always holds.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Domain {
    lower: f64,
    upper: f64,
}

impl Domain {
    /// Create a new domain
    ///
    /// Fails if any bound is NaN or if `lower >= upper`.
    ///
    pub fn new(lower: f64, upper: f64) -> Result<Self, ConfigurationError> {
        // Comparison is false for NaNs
        if !(lower < upper) {
            return Err(ConfigurationError::InvalidBounds { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    /// The whole real line
    pub fn real_line() -> Self {
        Self {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    /// True if both bounds are finite
    pub fn is_finite(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite()
    }

    /// Check if `x` lies within the closed domain
    pub fn contains(&self, x: f64) -> bool {
        (self.lower..=self.upper).contains(&x)
    }
}

///
/// Cumulative distribution function that can be inverted by [inversion::RootInverter]
///
/// Implementations must return `0` below the domain, `1` above it, and be
/// non-decreasing in between (up to floating-point noise).
///
pub trait Cdf {
    /// Support of the underlying density
    fn domain(&self) -> Domain;

    /// Value of the CDF at `x`
    fn evaluate(&self, x: f64) -> Result<f64, IntegrationError>;

    /// Values of the CDF at all points of `xs`
    ///
    fn evaluate_many(&self, xs: &[f64]) -> Result<Vec<f64>, IntegrationError> {
        xs.iter().map(|x| self.evaluate(*x)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain() {
        let domain = Domain::new(-1.0, 2.0).unwrap();
        assert!(domain.is_finite());
        assert!(domain.contains(-1.0));
        assert!(domain.contains(2.0));
        assert!(!domain.contains(2.5));

        let half = Domain::new(0.0, f64::INFINITY).unwrap();
        assert!(!half.is_finite());
        assert!(!Domain::real_line().is_finite());
    }

    #[test]
    fn test_domain_errors() {
        assert!(
            Domain::new(1.0, 1.0).is_err(),
            "Failed to detect empty domain"
        );
        assert!(
            Domain::new(2.0, -1.0).is_err(),
            "Failed to detect reversed bounds"
        );
        assert!(
            Domain::new(f64::NAN, 1.0).is_err(),
            "Failed to detect NaN bound"
        );
        assert!(
            Domain::new(f64::INFINITY, f64::INFINITY).is_err(),
            "Failed to detect empty infinite domain"
        );
    }

    #[test]
    fn test_failed_index() {
        let err = SamplerError::RootFinding {
            index: 7,
            t: 0.3,
            source: InversionError::TargetOutOfRange(0.3),
        };
        assert_eq!(Some(7), err.failed_index());

        let err = SamplerError::from(ConfigurationError::NoSamples);
        assert_eq!(None, err.failed_index());
    }
}
