//! Draw samples by inverting the CDF of a density
//!
//! The CDF strategy is selected and constructed once per [Sampler], then shared
//! by all draws. Since the CDF is immutable after construction, the
//! inversions are independent of each other and can be run in parallel on the
//! `rayon` thread pool. The uniform variates are always drawn up-front and in
//! order, so given the same seed the sequential and the parallel runs produce
//! identical samples.
//!
//! If any of the samples cannot be produced, the whole batch is aborted and
//! the error carries the index of the first failing sample.
//!
use crate::chebyshev::{ChebyshevCdf, ToleranceNotAchieved, MAX_DEGREE_LIMIT};
use crate::goodness::{GoodnessError, Moments};
use crate::inversion::{BrentRootFinder, RootFinder, RootInverter};
use crate::quadrature::{GaussKronrod, QuadratureCdf};
use crate::{Cdf, ConfigurationError, Domain, SamplerError};
use rand::distributions::Open01;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Method used to construct the CDF of a density
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// [QuadratureCdf]: slow to evaluate, supports infinite domains
    #[default]
    Quadrature,
    /// [ChebyshevCdf]: fast to evaluate, requires finite domain
    Chebyshev,
}

impl Strategy {
    pub fn from_flag(use_chebyshev: bool) -> Self {
        if use_chebyshev {
            Self::Chebyshev
        } else {
            Self::Quadrature
        }
    }

    /// Construct the CDF of a density on the domain given by the configuration
    ///
    /// Returns any non-fatal warnings raised during the construction alongside the CDF.
    ///
    pub fn build<'a, F>(
        &self,
        density: &'a F,
        config: &SamplerConfig,
    ) -> Result<(Box<dyn Cdf + Sync + 'a>, Vec<SamplingWarning>), SamplerError>
    where
        F: Fn(f64) -> f64 + Sync,
    {
        let domain = config.domain(*self)?;

        match self {
            Self::Quadrature => {
                let integrator = GaussKronrod::new(config.tolerance);
                let cdf = QuadratureCdf::with_integrator(density, domain, integrator)?;
                Ok((Box::new(cdf), Vec::new()))
            }
            Self::Chebyshev => {
                let cdf =
                    ChebyshevCdf::fit(density, domain, config.tolerance, config.max_degree)?;
                let warnings = cdf
                    .approximant()
                    .warning()
                    .map(SamplingWarning::ToleranceNotAchieved)
                    .into_iter()
                    .collect();
                Ok((Box::new(cdf), warnings))
            }
        }
    }
}

/// Non-fatal condition observed while preparing the sampling
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingWarning {
    ToleranceNotAchieved(ToleranceNotAchieved),
}

impl fmt::Display for SamplingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToleranceNotAchieved(w) => w.fmt(f),
        }
    }
}

/// Serde representation of a domain bound
///
/// Finite values are plain numbers. Infinities are written as `"inf"` and
/// `"-inf"`, since formats like JSON have no literal for them.
///
mod bound {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if *value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "inf" | "+inf" | "infinity" | "+infinity" => Ok(f64::INFINITY),
                "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                _ => Err(D::Error::custom(format!(
                    "invalid bound `{text}`, expected a number, \"inf\" or \"-inf\""
                ))),
            },
        }
    }
}

///
/// Settings of the sampling procedure
///
/// Can be deserialised from a file; missing fields take their default values.
/// Infinite bounds are given as `"inf"` or `"-inf"`.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Lower bound of the domain (may be `-inf` for quadrature)
    #[serde(with = "bound")]
    pub lower: f64,
    /// Upper bound of the domain (may be `+inf` for quadrature)
    #[serde(with = "bound")]
    pub upper: f64,
    pub strategy: Strategy,
    /// Relative tolerance of the quadrature or of the Chebyshev coefficients
    pub tolerance: f64,
    /// Maximum degree of the Chebyshev series
    pub max_degree: usize,
    /// Iteration limit of the root finder per sample
    pub max_iterations: u64,
    /// Absolute tolerance on the position of the root
    pub root_tolerance: f64,
    /// Largest accepted `|F(x) - t|` for a sample
    pub residual_tolerance: f64,
    /// Invert samples on the `rayon` thread pool
    pub parallel: bool,
    /// Wall-clock limit for drawing a batch of samples
    pub time_limit: Option<Duration>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            strategy: Strategy::Quadrature,
            tolerance: 1e-10,
            max_degree: 1024,
            max_iterations: 100,
            root_tolerance: 1e-12,
            residual_tolerance: 1e-8,
            parallel: false,
            time_limit: None,
        }
    }
}

impl SamplerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn use_chebyshev(self, use_chebyshev: bool) -> Self {
        self.strategy(Strategy::from_flag(use_chebyshev))
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn max_degree(mut self, max_degree: usize) -> Self {
        self.max_degree = max_degree;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn root_tolerance(mut self, root_tolerance: f64) -> Self {
        self.root_tolerance = root_tolerance;
        self
    }

    pub fn residual_tolerance(mut self, residual_tolerance: f64) -> Self {
        self.residual_tolerance = residual_tolerance;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = Some(time_limit);
        self
    }

    /// Check the configuration and get the domain of the density
    ///
    pub fn validate(&self) -> Result<Domain, ConfigurationError> {
        self.domain(self.strategy)
    }

    fn domain(&self, strategy: Strategy) -> Result<Domain, ConfigurationError> {
        let domain = Domain::new(self.lower, self.upper)?;

        if strategy == Strategy::Chebyshev && !domain.is_finite() {
            return Err(ConfigurationError::UnboundedChebyshev {
                lower: self.lower,
                upper: self.upper,
            });
        }
        for tol in [self.tolerance, self.root_tolerance, self.residual_tolerance] {
            if !(tol > 0.0) {
                return Err(ConfigurationError::InvalidTolerance(tol));
            }
        }
        if self.max_degree == 0 {
            return Err(ConfigurationError::InvalidMaxDegree);
        } else if self.max_degree > MAX_DEGREE_LIMIT {
            return Err(ConfigurationError::MaxDegreeTooLarge {
                max_degree: self.max_degree,
                limit: MAX_DEGREE_LIMIT,
            });
        } else if self.max_iterations == 0 {
            return Err(ConfigurationError::InvalidIterations);
        }
        Ok(domain)
    }
}

///
/// Batch of samples in the order of drawing
///
#[derive(Debug, Clone, PartialEq)]
pub struct Samples {
    values: Vec<f64>,
    warnings: Vec<SamplingWarning>,
}

impl Samples {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    /// Warnings raised while building the CDF used to draw the samples
    pub fn warnings(&self) -> &[SamplingWarning] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, f64> {
        self.values.iter()
    }

    pub fn moments(&self) -> Result<Moments, GoodnessError> {
        Moments::new(&self.values)
    }
}

///
/// Draws samples from a density by inverse transform sampling
///
/// The CDF is built once in the constructor and reused for every batch.
///
/// ```
/// # use cdf_sampler::{Sampler, SamplerConfig, SamplerError};
/// # use rand::SeedableRng;
/// # fn main() -> Result<(), SamplerError> {
/// let density = |x: f64| f64::exp(-x.abs());
/// let sampler = Sampler::new(&density, &SamplerConfig::new())?;
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(1);
/// let samples = sampler.sample_n(10, &mut rng)?;
///
/// for s in samples.iter() {
///     println!("{s}");
/// }
/// # Ok(())}
/// ```
///
pub struct Sampler<'a, R = BrentRootFinder> {
    cdf: Box<dyn Cdf + Sync + 'a>,
    inverter: RootInverter<R>,
    warnings: Vec<SamplingWarning>,
    parallel: bool,
    time_limit: Option<Duration>,
}

impl<'a> Sampler<'a> {
    /// Validate the configuration and build the selected CDF
    ///
    /// No evaluation of the density is performed if the configuration is invalid.
    ///
    pub fn new<F>(density: &'a F, config: &SamplerConfig) -> Result<Self, SamplerError>
    where
        F: Fn(f64) -> f64 + Sync,
    {
        config.validate()?;
        let (cdf, warnings) = config.strategy.build(density, config)?;

        let finder = BrentRootFinder::new(config.root_tolerance, config.max_iterations);
        Ok(Self {
            cdf,
            inverter: RootInverter::with_finder(finder, config.residual_tolerance),
            warnings,
            parallel: config.parallel,
            time_limit: config.time_limit,
        })
    }
}

impl<'a, R> Sampler<'a, R>
where
    R: RootFinder + Sync,
{
    /// Sampler for any CDF and inversion scheme
    ///
    pub fn from_cdf(cdf: Box<dyn Cdf + Sync + 'a>, inverter: RootInverter<R>) -> Self {
        Self {
            cdf,
            inverter,
            warnings: Vec::new(),
            parallel: false,
            time_limit: None,
        }
    }

    /// Replace the root finder, keeping the residual tolerance
    ///
    pub fn with_root_finder<S>(self, finder: S) -> Sampler<'a, S>
    where
        S: RootFinder + Sync,
    {
        Sampler {
            inverter: RootInverter::with_finder(finder, self.inverter.residual_tolerance()),
            cdf: self.cdf,
            warnings: self.warnings,
            parallel: self.parallel,
            time_limit: self.time_limit,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn time_limit(mut self, time_limit: Option<Duration>) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn cdf(&self) -> &(dyn Cdf + Sync + 'a) {
        self.cdf.as_ref()
    }

    pub fn warnings(&self) -> &[SamplingWarning] {
        &self.warnings
    }

    /// Draw `n` samples
    ///
    /// Aborts on the first sample (in the order of drawing) that fails.
    ///
    pub fn sample_n<G>(&self, n: usize, rng: &mut G) -> Result<Samples, SamplerError>
    where
        G: Rng + ?Sized,
    {
        if n == 0 {
            return Err(ConfigurationError::NoSamples.into());
        }
        let targets: Vec<f64> = (0..n).map(|_| rng.sample(Open01)).collect();

        log::info!(
            "Drawing {n} samples ({})",
            if self.parallel { "parallel" } else { "sequential" }
        );
        let start = Instant::now();

        let values = if self.parallel {
            targets
                .par_iter()
                .enumerate()
                .map(|(index, &t)| self.draw(index, t, start))
                .collect::<Vec<_>>()
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?
        } else {
            targets
                .iter()
                .enumerate()
                .map(|(index, &t)| self.draw(index, t, start))
                .collect::<Result<Vec<_>, _>>()?
        };

        log::info!("Drew {n} samples in {:?}", start.elapsed());
        Ok(Samples {
            values,
            warnings: self.warnings.clone(),
        })
    }

    fn draw(&self, index: usize, t: f64, start: Instant) -> Result<f64, SamplerError> {
        if let Some(limit) = self.time_limit {
            if start.elapsed() >= limit {
                return Err(SamplerError::TimedOut { index, limit });
            }
        }
        let x = self
            .inverter
            .invert(self.cdf.as_ref(), t)
            .map_err(|source| SamplerError::RootFinding { index, t, source })?;
        log::trace!("Sample {index}: t = {t} -> x = {x}");
        Ok(x)
    }
}

///
/// Draw `n` samples from a density
///
/// Convenience wrapper that builds a [Sampler] for a single batch.
/// The configuration (and `n`) is validated before the density is evaluated.
///
pub fn sample<F, G>(
    density: &F,
    n: usize,
    config: &SamplerConfig,
    rng: &mut G,
) -> Result<Samples, SamplerError>
where
    F: Fn(f64) -> f64 + Sync,
    G: Rng + ?Sized,
{
    if n == 0 {
        return Err(ConfigurationError::NoSamples.into());
    }
    Sampler::new(density, config)?.sample_n(n, rng)
}
