//! Chebyshev series approximation of a density and its analytic CDF
//!
//! The density is sampled at the Chebyshev nodes of the first kind mapped onto
//! the (finite) domain `[a, b]`:
//!
//! $$ x_j = \frac{b - a}{2} \cos \theta_j + \frac{b + a}{2}, \quad \theta_j = \frac{\pi (j + 1/2)}{N} $$
//!
//! and the coefficients of the series $p(x) \approx \sum_k c_k T_k(s)$ follow
//! from the discrete cosine transform of the samples. The number of nodes is
//! doubled until the trailing coefficients become negligible. Since
//! $\int T_k$ is again a combination of $T_{k-1}$ and $T_{k+1}$, the CDF is
//! obtained by integrating the series term by term.
//!
//! Note that the truncation criterion is a heuristic and does not give a
//! guaranteed bound on the approximation error.
//!
use crate::{Cdf, ConfigurationError, Domain, IntegrationError, SamplerError};
use std::f64::consts::PI;
use std::fmt;

/// Number of tail coefficients averaged to judge convergence of a fit
const TAIL_WINDOW: usize = 4;

/// Number of nodes in the first attempted fit
const INITIAL_NODES: usize = 17;

/// Largest accepted degree of a fit (the transform is quadratic in the number of nodes)
pub const MAX_DEGREE_LIMIT: usize = 1 << 14;

/// Non-fatal condition raised when the fit did not reach the requested tolerance
///
/// The approximant of maximum degree is used instead. Sampling can still
/// proceed, but with reduced accuracy.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToleranceNotAchieved {
    /// Requested relative tolerance
    pub tolerance: f64,
    /// Degree of the approximant that was used
    pub max_degree: usize,
    /// Averaged magnitude of the trailing coefficients relative to the largest one
    pub tail: f64,
}

impl fmt::Display for ToleranceNotAchieved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chebyshev fit did not reach tolerance {:e} within degree {} (relative tail {:e})",
            self.tolerance, self.max_degree, self.tail
        )
    }
}

/// Evaluate a Chebyshev series using the Clenshaw recurrence
///
/// Given coefficients `[c_0, c_1, ..., c_n]` and `s` in `[-1, 1]` computes
/// `sum(c_k * T_k(s))`.
///
pub fn clenshaw(coeffs: &[f64], s: f64) -> f64 {
    match coeffs.len() {
        0 => return 0.0,
        1 => return coeffs[0],
        _ => (),
    }

    let mut b_k1 = 0.0;
    let mut b_k2 = 0.0;
    let two_s = 2.0 * s;

    for c in coeffs[1..].iter().rev() {
        let b_k = two_s * b_k1 - b_k2 + c;
        b_k2 = b_k1;
        b_k1 = b_k;
    }
    s * b_k1 - b_k2 + coeffs[0]
}

/// Coefficients of the antiderivative of a Chebyshev series
///
/// For `f = sum(c_k * T_k)` returns `C` such that `sum(C_k * T_k)' = f` and `C_0 = 0`.
/// Uses:
///
/// $$ \int T_0 = T_1, \quad \int T_1 = \frac{T_2}{4}, \quad \int T_k = \frac{T_{k+1}}{2(k+1)} - \frac{T_{k-1}}{2(k-1)} $$
///
pub fn integrate_series(coeffs: &[f64]) -> Vec<f64> {
    let n = coeffs.len();
    let c = |k: usize| coeffs.get(k).copied().unwrap_or(0.0);

    let mut integral = vec![0.0; n + 1];
    for (k, v) in integral.iter_mut().enumerate().skip(1) {
        *v = if k == 1 {
            c(0) - 0.5 * c(2)
        } else {
            (c(k - 1) - c(k + 1)) / (2 * k) as f64
        };
    }
    integral
}

/// Chebyshev nodes of the first kind on `[-1, 1]`
///
/// Returned in descending order.
///
pub fn chebyshev_nodes(n: usize) -> Vec<f64> {
    (0..n)
        .map(|j| f64::cos(PI * (j as f64 + 0.5) / n as f64))
        .collect()
}

/// Get coefficients of the interpolating series from values at the first kind nodes
///
fn chebyshev_coefficients(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;

    let mut coeffs = (0..values.len())
        .map(|k| {
            let sum: f64 = values
                .iter()
                .enumerate()
                .map(|(j, v)| v * f64::cos(PI * k as f64 * (j as f64 + 0.5) / n))
                .sum();
            2.0 * sum / n
        })
        .collect::<Vec<_>>();
    coeffs[0] *= 0.5;
    coeffs
}

/// Average magnitude of the trailing coefficients relative to `scale`
///
fn relative_tail(coeffs: &[f64], scale: f64) -> f64 {
    let window = TAIL_WINDOW.min(coeffs.len());
    let tail: f64 = coeffs[coeffs.len() - window..].iter().map(|c| c.abs()).sum();
    tail / window as f64 / scale
}

///
/// Chebyshev series approximating a density on a finite domain
///
#[derive(Debug, Clone)]
pub struct ChebyshevApproximant {
    domain: Domain,
    coefficients: Vec<f64>,
    nodes: Vec<f64>,
    warning: Option<ToleranceNotAchieved>,
}

impl ChebyshevApproximant {
    /// Fit a density with a series of adaptively selected degree
    ///
    /// # Arguments
    /// - `density` - function to approximate
    /// - `domain` - must be finite
    /// - `tolerance` - magnitude of coefficients relative to the largest one
    ///   below which they are considered negligible
    /// - `max_degree` - maximum degree of the series
    ///
    /// If the tolerance cannot be met, the fit of `max_degree` is returned and
    /// [ChebyshevApproximant::warning] is set.
    ///
    pub fn fit<F>(
        density: &F,
        domain: Domain,
        tolerance: f64,
        max_degree: usize,
    ) -> Result<Self, SamplerError>
    where
        F: Fn(f64) -> f64,
    {
        if !domain.is_finite() {
            return Err(ConfigurationError::UnboundedChebyshev {
                lower: domain.lower(),
                upper: domain.upper(),
            }
            .into());
        } else if !(tolerance > 0.0) {
            return Err(ConfigurationError::InvalidTolerance(tolerance).into());
        } else if max_degree == 0 {
            return Err(ConfigurationError::InvalidMaxDegree.into());
        } else if max_degree > MAX_DEGREE_LIMIT {
            return Err(ConfigurationError::MaxDegreeTooLarge {
                max_degree,
                limit: MAX_DEGREE_LIMIT,
            }
            .into());
        }

        let max_nodes = max_degree + 1;
        let mut n = INITIAL_NODES.min(max_nodes);

        loop {
            let (nodes, values) = sample_at_nodes(density, domain, n)?;
            let mut coefficients = chebyshev_coefficients(&values);

            let scale = coefficients.iter().fold(0.0, |acc: f64, c| acc.max(c.abs()));
            if scale == 0.0 {
                log::debug!("Density vanishes at all {n} Chebyshev nodes");
                return Ok(Self {
                    domain,
                    coefficients: vec![0.0],
                    nodes,
                    warning: None,
                });
            }

            let tail = relative_tail(&coefficients, scale);

            if tail < tolerance {
                let degree = coefficients
                    .iter()
                    .rposition(|c| c.abs() >= tolerance * scale)
                    .unwrap_or(0);
                coefficients.truncate(degree + 1);
                log::debug!("Chebyshev fit of degree {degree} from {n} nodes");
                return Ok(Self {
                    domain,
                    coefficients,
                    nodes,
                    warning: None,
                });
            } else if n == max_nodes {
                let warning = ToleranceNotAchieved {
                    tolerance,
                    max_degree,
                    tail,
                };
                log::warn!("{warning}");
                return Ok(Self {
                    domain,
                    coefficients,
                    nodes,
                    warning: Some(warning),
                });
            }
            n = (2 * n - 1).min(max_nodes);
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Degree of the series after truncation
    pub fn degree(&self) -> usize {
        self.coefficients.len() - 1
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Nodes (in the coordinates of the domain) at which density was sampled for the fit
    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    /// Set if the fit did not reach requested tolerance
    pub fn warning(&self) -> Option<ToleranceNotAchieved> {
        self.warning
    }

    /// Map `x` from the domain into `[-1, 1]`
    fn to_canonical(&self, x: f64) -> f64 {
        let (a, b) = (self.domain.lower(), self.domain.upper());
        (2.0 * x - a - b) / (b - a)
    }

    /// Value of the approximated density at `x` inside the domain
    ///
    pub fn value(&self, x: f64) -> f64 {
        clenshaw(&self.coefficients, self.to_canonical(x))
    }
}

/// Evaluate density at `n` Chebyshev nodes mapped onto the domain
///
fn sample_at_nodes<F>(
    density: &F,
    domain: Domain,
    n: usize,
) -> Result<(Vec<f64>, Vec<f64>), SamplerError>
where
    F: Fn(f64) -> f64,
{
    let half = 0.5 * (domain.upper() - domain.lower());
    let mid = 0.5 * (domain.upper() + domain.lower());

    let nodes = chebyshev_nodes(n)
        .into_iter()
        .map(|s| half * s + mid)
        .collect::<Vec<_>>();

    let values = nodes
        .iter()
        .map(|&x| {
            let value = density(x);
            if !value.is_finite() {
                Err(SamplerError::NonFiniteDensity { x, value })
            } else if value < 0.0 {
                Err(SamplerError::NegativeDensity { x, value })
            } else {
                Ok(value)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((nodes, values))
}

///
/// CDF obtained by analytic integration of a [ChebyshevApproximant]
///
/// Normalised so that `F(lower) = 0` and `F(upper) = 1`. Evaluation is cheap
/// and never fails for non-NaN arguments.
///
#[derive(Debug, Clone)]
pub struct ChebyshevCdf {
    approximant: ChebyshevApproximant,
    antiderivative: Vec<f64>,
    offset: f64,
    mass: f64,
}

impl ChebyshevCdf {
    /// Build the CDF from an approximant
    ///
    /// Fails if the approximated density does not integrate to a positive value.
    ///
    pub fn new(approximant: ChebyshevApproximant) -> Result<Self, SamplerError> {
        let domain = approximant.domain();
        let half = 0.5 * (domain.upper() - domain.lower());

        let antiderivative = integrate_series(approximant.coefficients())
            .into_iter()
            .map(|c| c * half)
            .collect::<Vec<_>>();

        let offset = clenshaw(&antiderivative, -1.0);
        let mass = clenshaw(&antiderivative, 1.0) - offset;

        if !(mass > 0.0 && mass.is_finite()) {
            return Err(SamplerError::ZeroMass { mass });
        }
        log::debug!(
            "Chebyshev CDF of degree {} with total mass {mass:e}",
            antiderivative.len() - 1
        );

        Ok(Self {
            approximant,
            antiderivative,
            offset,
            mass,
        })
    }

    /// Fit the density and build its CDF
    ///
    /// See [ChebyshevApproximant::fit] for the meaning of the arguments.
    ///
    pub fn fit<F>(
        density: &F,
        domain: Domain,
        tolerance: f64,
        max_degree: usize,
    ) -> Result<Self, SamplerError>
    where
        F: Fn(f64) -> f64,
    {
        Self::new(ChebyshevApproximant::fit(
            density, domain, tolerance, max_degree,
        )?)
    }

    pub fn approximant(&self) -> &ChebyshevApproximant {
        &self.approximant
    }

    /// Integral of the approximated density over the domain
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Value of the CDF at `x`
    ///
    pub fn value(&self, x: f64) -> f64 {
        let domain = self.approximant.domain();
        if x <= domain.lower() {
            0.0
        } else if x >= domain.upper() {
            1.0
        } else {
            let s = self.approximant.to_canonical(x);
            ((clenshaw(&self.antiderivative, s) - self.offset) / self.mass).clamp(0.0, 1.0)
        }
    }

    /// Values of the CDF at all points in `xs`
    ///
    pub fn values(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|x| self.value(*x)).collect()
    }
}

impl Cdf for ChebyshevCdf {
    fn domain(&self) -> Domain {
        self.approximant.domain()
    }

    fn evaluate(&self, x: f64) -> Result<f64, IntegrationError> {
        if x.is_nan() {
            return Err(IntegrationError::NanLimit);
        }
        Ok(self.value(x))
    }

    fn evaluate_many(&self, xs: &[f64]) -> Result<Vec<f64>, IntegrationError> {
        if xs.iter().any(|x| x.is_nan()) {
            return Err(IntegrationError::NanLimit);
        }
        Ok(self.values(xs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-14;

    fn unit_domain() -> Domain {
        Domain::new(-1.0, 1.0).unwrap()
    }

    #[test]
    fn test_clenshaw() {
        assert_eq!(0.0, clenshaw(&[], 0.5));
        assert_eq!(7.0, clenshaw(&[7.0], 0.5));

        // 1 + 2 T_1 + 3 T_2
        let s = 0.4;
        let expected = 1.0 + 2.0 * s + 3.0 * (2.0 * s * s - 1.0);
        approx::assert_abs_diff_eq!(expected, clenshaw(&[1.0, 2.0, 3.0], s), epsilon = EPS);

        // T_0 + T_3
        let s = 0.6;
        let expected = 1.0 + 4.0 * s * s * s - 3.0 * s;
        approx::assert_abs_diff_eq!(
            expected,
            clenshaw(&[1.0, 0.0, 0.0, 1.0], s),
            epsilon = EPS
        );

        // T_k(1) = 1, T_k(-1) = (-1)^k
        approx::assert_abs_diff_eq!(10.0, clenshaw(&[2.0, 3.0, 5.0], 1.0), epsilon = EPS);
        approx::assert_abs_diff_eq!(4.0, clenshaw(&[2.0, 3.0, 5.0], -1.0), epsilon = EPS);
    }

    #[test]
    fn test_integrate_series() {
        assert_eq!(vec![0.0, 1.0], integrate_series(&[1.0]));
        assert_eq!(vec![0.0, 0.0, 0.25], integrate_series(&[0.0, 1.0]));

        // ∫T_2 = 2s³/3 - s
        let integral = integrate_series(&[0.0, 0.0, 1.0]);
        for s in [-0.9, -0.3, 0.0, 0.5, 1.0] {
            approx::assert_abs_diff_eq!(
                2.0 * s * s * s / 3.0 - s,
                clenshaw(&integral, s),
                epsilon = EPS
            );
        }
    }

    #[test]
    fn test_coefficients_interpolate() {
        let n = 9;
        let nodes = chebyshev_nodes(n);
        let values = nodes.iter().map(|s| s * s * s - 0.5 * s).collect::<Vec<_>>();
        let coeffs = chebyshev_coefficients(&values);

        // s³ - s/2 = T_3/4 + T_1/4
        let reference = [0.0, 0.25, 0.0, 0.25, 0.0, 0.0, 0.0, 0.0, 0.0];
        for (r, c) in std::iter::zip(reference, coeffs) {
            approx::assert_abs_diff_eq!(r, c, epsilon = EPS);
        }
    }

    #[test]
    fn test_fit_polynomial() {
        let density = |x: f64| 1.0 + x;
        let domain = Domain::new(0.0, 2.0).unwrap();
        let approx = ChebyshevApproximant::fit(&density, domain, 1e-12, 64).unwrap();

        assert_eq!(1, approx.degree());
        assert!(approx.warning().is_none());
        assert_eq!(INITIAL_NODES, approx.nodes().len());
        assert!(approx.nodes().iter().all(|x| domain.contains(*x)));
        approx::assert_relative_eq!(1.5, approx.value(0.5), max_relative = 1e-12);
    }

    #[test]
    fn test_fit_cosine_degree() {
        let max_degree = 1024;
        let density = |x: f64| x.cos();

        let degrees = [1e-14, 1e-12, 1e-10, 1e-8, 1e-6, 1e-3, 1e-1]
            .iter()
            .map(|tol| {
                ChebyshevApproximant::fit(&density, unit_domain(), *tol, max_degree)
                    .unwrap()
                    .degree()
            })
            .collect::<Vec<_>>();

        println!("{degrees:?}");
        assert!(degrees[0] < 32, "Degree is not well below the cap");
        for w in degrees.windows(2) {
            assert!(w[1] <= w[0], "Looser tolerance increased the degree");
        }
    }

    #[test]
    fn test_tolerance_not_achieved() {
        let approx =
            ChebyshevApproximant::fit(&|x: f64| x.abs(), unit_domain(), 1e-14, 32).unwrap();

        let warning = approx.warning().expect("Warning was not raised");
        assert_eq!(32, approx.degree());
        assert_eq!(32, warning.max_degree);
        assert!(warning.tail >= 1e-14);
    }

    #[test]
    fn test_fit_errors() {
        let density = |x: f64| x.cos();
        let half_line = Domain::new(0.0, f64::INFINITY).unwrap();

        assert!(matches!(
            ChebyshevApproximant::fit(&density, half_line, 1e-10, 64),
            Err(SamplerError::Configuration(
                ConfigurationError::UnboundedChebyshev { .. }
            ))
        ));
        assert!(ChebyshevApproximant::fit(&density, unit_domain(), 0.0, 64).is_err());
        assert!(ChebyshevApproximant::fit(&density, unit_domain(), 1e-10, 0).is_err());
        for max_degree in [MAX_DEGREE_LIMIT + 1, usize::MAX] {
            assert!(matches!(
                ChebyshevApproximant::fit(&density, unit_domain(), 1e-10, max_degree),
                Err(SamplerError::Configuration(
                    ConfigurationError::MaxDegreeTooLarge { .. }
                ))
            ));
        }

        let res = ChebyshevApproximant::fit(
            &|x: f64| if x > 0.5 { f64::NAN } else { 1.0 },
            unit_domain(),
            1e-10,
            64,
        );
        assert!(matches!(res, Err(SamplerError::NonFiniteDensity { .. })));

        let res = ChebyshevApproximant::fit(&|x: f64| x, unit_domain(), 1e-10, 64);
        assert!(matches!(res, Err(SamplerError::NegativeDensity { .. })));
    }

    #[test]
    fn test_cdf_linear_density() {
        let density = |x: f64| 1.0 + x;
        let cdf = ChebyshevCdf::fit(&density, Domain::new(0.0, 2.0).unwrap(), 1e-12, 64).unwrap();

        approx::assert_relative_eq!(4.0, cdf.mass(), max_relative = 1e-12);
        assert_eq!(0.0, cdf.value(0.0));
        assert_eq!(1.0, cdf.value(2.0));
        assert_eq!(0.0, cdf.value(-3.0));
        assert_eq!(1.0, cdf.value(3.0));

        for x in [0.1, 0.5, 1.0, 1.7] {
            approx::assert_abs_diff_eq!((x + 0.5 * x * x) / 4.0, cdf.value(x), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cdf_gaussian() {
        let density = |x: f64| f64::exp(-0.5 * x * x);
        let cdf = ChebyshevCdf::fit(&density, Domain::new(-8.0, 8.0).unwrap(), 1e-10, 1024).unwrap();

        assert!(cdf.approximant().warning().is_none());
        approx::assert_abs_diff_eq!(0.5, cdf.value(0.0), epsilon = 1e-9);
        approx::assert_abs_diff_eq!(0.8413447460685429, cdf.value(1.0), epsilon = 1e-8);
        approx::assert_abs_diff_eq!(0.022750131948179195, cdf.value(-2.0), epsilon = 1e-8);

        let grid = (-80..=80).map(|i| i as f64 * 0.1).collect::<Vec<_>>();
        let values = cdf.evaluate_many(&grid).unwrap();
        for w in values.windows(2) {
            assert!(w[0] <= w[1] + 1e-10, "CDF is not monotone: {w:?}");
        }
        assert!(cdf.evaluate(f64::NAN).is_err());
    }

    #[test]
    fn test_cdf_zero_density() {
        let res = ChebyshevCdf::fit(&|_: f64| 0.0, unit_domain(), 1e-10, 64);
        assert!(matches!(res, Err(SamplerError::ZeroMass { .. })));
    }
}
