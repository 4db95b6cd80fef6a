//! Checks of the produced samples against a reference distribution
//!
//! Provides the one-sample Kolmogorov-Smirnov test, which checks the null
//! hypothesis that the samples are drawn from the reference distribution.
//! After the test is performed we can compare the p-value against some error
//! threshold e.g. `1%`:
//! ```
//! # use cdf_sampler::goodness::*;
//! # use rand::prelude::*;
//! # fn main() -> Result<(), GoodnessError> {
//! let mut rng = StdRng::seed_from_u64(7);
//! let samples: Vec<f64> = (0..500).map(|_| rng.gen()).collect();
//!
//! let test_result = ks_test_fn(|x| x.clamp(0.0, 1.0), samples)?;
//!
//! // For the test to reject null hypothesis p_value must be below the threshold
//! assert!(test_result.p_value() > 0.01);
//! # Ok(())}
//! ```
//! Note that even for the correct sampling procedure the test wrongly rejects
//! the hypothesis in `1%` of cases (*Type 1* error), so the fixed seed of the
//! random number generator should be used in unit tests.
//!
use crate::{Cdf, IntegrationError};
use std::f64::consts::PI;
use thiserror::Error;

///
/// Error that can be raised by a statistical test
///
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GoodnessError {
    /// Some samples are not in the order sequence (NaNs)
    #[error("Collection contains values that cannot be placed in an order sequence (e.g. NaN)")]
    ContainsNotSortableValues,
    #[error("At least {required} samples are required, got {got}")]
    TooFewSamples { required: usize, got: usize },
    #[error("Evaluation of the reference CDF failed")]
    Integration(#[from] IntegrationError),
}

/// Empirical cumulative distribution function
///
/// The value of ecdf for some `x ∈ [xᵢ, xᵢ₊₁)` is `i/N` where `N` is the total
/// number of samples.
///
/// One can iterate over the ordered samples of ecdf and their associated values
/// as below:
/// ```
/// # use cdf_sampler::goodness::{Ecdf, GoodnessError};
/// # fn main() -> Result<(), GoodnessError> {
/// let ecdf = Ecdf::new(vec![0.1, 0.0, 0.7 ,0.2])?;
///
/// for (ecdf_value, s) in &ecdf {
///     println!("{s} {ecdf_value}")
/// }
/// # Ok(())}
/// ```
///
#[derive(Debug, Clone)]
pub struct Ecdf {
    samples: Vec<f64>,
}

impl Ecdf {
    /// Create a new instance from unordered vector of samples
    ///
    pub fn new(mut samples: Vec<f64>) -> Result<Self, GoodnessError> {
        if samples.iter().any(|x| x.is_nan()) {
            return Err(GoodnessError::ContainsNotSortableValues);
        }
        samples.sort_by(f64::total_cmp);
        Ok(Self { samples })
    }

    /// Get the value of ecdf at `val`
    ///
    pub fn get(&self, val: f64) -> f64 {
        let idx = self.samples.partition_point(|x| *x <= val);
        idx as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Iterator over ecdf
///
/// Iterates over pairs (ecdf_value, sample) obtained from [Ecdf].
///
#[derive(Debug, Clone)]
pub struct EcdfIterator<'a> {
    ecdf: &'a Ecdf,
    idx: usize,
}

impl<'a> Iterator for EcdfIterator<'a> {
    type Item = (f64, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let x = self.ecdf.samples.get(self.idx)?;
        self.idx += 1;
        Some((self.idx as f64 / self.ecdf.len() as f64, *x))
    }
}

impl<'a> IntoIterator for &'a Ecdf {
    type Item = (f64, f64);
    type IntoIter = EcdfIterator<'a>;

    fn into_iter(self) -> Self::IntoIter {
        EcdfIterator { ecdf: self, idx: 0 }
    }
}

/// Represents a result of a statistical test
///
/// Contains the value of the test statistic and the p-value for the statistic
/// and the provided effective population size.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestResult {
    stat: f64,
    p: f64,
    n: f64,
}

impl TestResult {
    /// Compute complement of Kolmogorov-Smirnov Cumulative Distribution Function
    ///
    /// Computes: `Q(z) = 1 - CDF(z)`
    ///
    /// Implementation is based on the power series definitions from
    /// "Numerical Recipes" by Press et al. (2007)
    ///
    /// # Panics
    /// If the value of the statistic is outside the support
    ///
    fn complement_ks_cdf(z: f64) -> f64 {
        if z < 0.0 {
            panic!("Value of test statistic outside the support");
        } else if z == 0.0 {
            1.0
        } else if z < 1.18 {
            let factor = f64::sqrt(2.0 * PI) / z;
            let term = f64::exp(-PI * PI / 8. / (z * z));
            1.0 - factor * (term + term.powi(9) + term.powi(25) + term.powi(49))
        } else {
            let term = f64::exp(-2.0 * z * z);
            2.0 * (term - term.powi(4) + term.powi(9))
        }
    }

    ///
    /// Create a new instance of the KS test result
    ///
    /// # Arguments
    /// - `stat` - Value of the test statistic
    /// - `n` - effective sample size
    ///
    fn new_ks(stat: f64, n: f64) -> Self {
        let sqrt_n = f64::sqrt(n);
        let arg = sqrt_n + 0.12 + 0.11 / sqrt_n;
        let p = Self::complement_ks_cdf(arg * stat);
        Self { stat, n, p }
    }

    /// Get the p-value of the test
    ///
    /// Probability of observing the data under the assumption that null hypothesis holds
    ///
    pub fn p_value(&self) -> f64 {
        self.p
    }

    /// Get the value of the test statistic
    ///
    pub fn stat(&self) -> f64 {
        self.stat
    }

    /// Effective sample size used to compute the p-value
    pub fn population(&self) -> f64 {
        self.n
    }
}

///
/// Perform one sample Kolmogorov-Smirnov test against a CDF given by a closure
///
/// Evaluates the Kolmogorov-Smirnov statistic:
///
/// $$ KS = \max |F_N(x) - F_{ref}(x)| $$
///
/// Where $F_N$ is the empirical cumulative distribution function of the sample
/// and the $F_{ref}$ the reference distribution. The p-value is calculated from
/// the statistic as prescribed in (Press 2007).
///
/// # References
/// - Press W. H. , Teukolsky S. A., Vetterling W. T., Flannery B. P. (2007).
///   Numerical Recipes 3rd Edition: The Art of Scientific Computing (3rd. ed.).
///   Cambridge University Press, USA.
///
pub fn ks_test_fn(cdf: impl Fn(f64) -> f64, samples: Vec<f64>) -> Result<TestResult, GoodnessError> {
    ks_statistic(|x| Ok(cdf(x)), samples)
}

///
/// Perform one sample Kolmogorov-Smirnov test against any [Cdf]
///
/// See [ks_test_fn] for details.
///
pub fn ks_test<C>(cdf: &C, samples: Vec<f64>) -> Result<TestResult, GoodnessError>
where
    C: Cdf + ?Sized,
{
    ks_statistic(|x| cdf.evaluate(x), samples)
}

fn ks_statistic(
    cdf: impl Fn(f64) -> Result<f64, IntegrationError>,
    samples: Vec<f64>,
) -> Result<TestResult, GoodnessError> {
    let n = samples.len();
    if n == 0 {
        return Err(GoodnessError::TooFewSamples {
            required: 1,
            got: 0,
        });
    }
    let ecdf = Ecdf::new(samples)?;
    let step = 1.0 / n as f64;

    let mut stat: f64 = 0.0;
    for (ecdf_value, x) in &ecdf {
        let reference = cdf(x)?;
        // Ecdf jumps at each sample, so check deviation on both sides of the step
        stat = stat
            .max((reference - ecdf_value).abs())
            .max((reference - (ecdf_value - step)).abs());
    }

    Ok(TestResult::new_ks(stat, n as f64))
}

///
/// Sample mean and (unbiased) standard deviation
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub mean: f64,
    pub std_dev: f64,
}

impl Moments {
    pub fn new(samples: &[f64]) -> Result<Self, GoodnessError> {
        let n = samples.len();
        if n < 2 {
            return Err(GoodnessError::TooFewSamples {
                required: 2,
                got: n,
            });
        }
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;

        Ok(Self {
            mean,
            std_dev: var.sqrt(),
        })
    }
}
