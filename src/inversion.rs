//! Inversion of a CDF by iterative root finding
//!
//! For a uniform variate `t` the sample is the root of `g(x) = F(x) - t`.
//! [RootInverter] builds a bracket for the root from the domain of the CDF
//! and passes it to a [RootFinder]. By default Brent's method from `argmin`
//! is used ([BrentRootFinder]).
//!
//! If a bound of the domain is infinite, it is replaced by a finite surrogate
//! which moves away from the origin (doubling the distance each time) until
//! the residual changes sign.
//!
use crate::{Cdf, Domain, IntegrationError};
use argmin::core::{CostFunction, Error as ArgminError, Executor, State};
use argmin::solver::brent::BrentRoot;
use thiserror::Error;

/// Failure to invert the CDF for a single target value
///
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InversionError {
    #[error("Target value {0} lies outside [0, 1]")]
    TargetOutOfRange(f64),
    #[error("Root is not bracketed: residual is {f_lower:e} at {lower} and {f_upper:e} at {upper}")]
    InvalidBracket {
        lower: f64,
        upper: f64,
        f_lower: f64,
        f_upper: f64,
    },
    #[error("Root finding did not converge after {iterations} iterations (x = {x}, residual {residual:e})")]
    NotConverged {
        x: f64,
        residual: f64,
        iterations: u64,
    },
    #[error("Evaluation of the CDF failed")]
    Integration(#[from] IntegrationError),
    #[error("Root finder failed: {0}")]
    Solver(String),
}

/// Approximate root returned by a [RootFinder]
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootEstimate {
    pub x: f64,
    pub iterations: u64,
}

///
/// Method to find a root of a scalar function within a bracket
///
/// The function is assumed continuous with `g(a) <= 0 <= g(b)`.
///
pub trait RootFinder {
    fn find_root(
        &self,
        g: &dyn Fn(f64) -> Result<f64, IntegrationError>,
        bracket: (f64, f64),
    ) -> Result<RootEstimate, InversionError>;
}

/// Adapts a fallible residual function to `argmin`
struct Residual<'a> {
    g: &'a dyn Fn(f64) -> Result<f64, IntegrationError>,
}

impl CostFunction for Residual<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, ArgminError> {
        (self.g)(*x).map_err(ArgminError::new)
    }
}

///
/// Brent's method as implemented by [argmin::solver::brent::BrentRoot]
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrentRootFinder {
    /// Absolute tolerance on the position of the root
    pub tolerance: f64,
    pub max_iterations: u64,
}

impl BrentRootFinder {
    pub fn new(tolerance: f64, max_iterations: u64) -> Self {
        Self {
            tolerance,
            max_iterations,
        }
    }
}

impl Default for BrentRootFinder {
    fn default() -> Self {
        Self::new(1e-12, 100)
    }
}

impl RootFinder for BrentRootFinder {
    fn find_root(
        &self,
        g: &dyn Fn(f64) -> Result<f64, IntegrationError>,
        bracket: (f64, f64),
    ) -> Result<RootEstimate, InversionError> {
        let solver = BrentRoot::new(bracket.0, bracket.1, self.tolerance);

        let result = Executor::new(Residual { g }, solver)
            .configure(|state| state.max_iters(self.max_iterations))
            .run()
            .map_err(|err| match err.downcast::<IntegrationError>() {
                Ok(err) => InversionError::Integration(err),
                Err(err) => InversionError::Solver(err.to_string()),
            })?;

        let state = result.state();
        let x = state
            .get_param()
            .copied()
            .ok_or_else(|| InversionError::Solver("Brent solver returned no parameter".into()))?;

        Ok(RootEstimate {
            x,
            iterations: state.get_iter(),
        })
    }
}

///
/// Plain bisection
///
/// Slower than [BrentRootFinder], but it never leaves the bracket and its
/// progress does not depend on the shape of the function.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bisection {
    /// Absolute tolerance on the position of the root
    pub tolerance: f64,
    pub max_iterations: u64,
}

impl Bisection {
    pub fn new(tolerance: f64, max_iterations: u64) -> Self {
        Self {
            tolerance,
            max_iterations,
        }
    }
}

impl RootFinder for Bisection {
    fn find_root(
        &self,
        g: &dyn Fn(f64) -> Result<f64, IntegrationError>,
        bracket: (f64, f64),
    ) -> Result<RootEstimate, InversionError> {
        let (mut a, mut b) = bracket;
        let f_lower = g(a)?;
        let f_upper = g(b)?;

        if f_lower == 0.0 {
            return Ok(RootEstimate { x: a, iterations: 0 });
        } else if f_upper == 0.0 {
            return Ok(RootEstimate { x: b, iterations: 0 });
        } else if f_lower.signum() == f_upper.signum() {
            return Err(InversionError::InvalidBracket {
                lower: a,
                upper: b,
                f_lower,
                f_upper,
            });
        }

        let mut fa = f_lower;
        for i in 1..=self.max_iterations {
            let mid = 0.5 * (a + b);
            let fm = g(mid)?;

            if fm == 0.0 || 0.5 * (b - a) < self.tolerance {
                return Ok(RootEstimate {
                    x: mid,
                    iterations: i,
                });
            } else if fm.signum() == fa.signum() {
                a = mid;
                fa = fm;
            } else {
                b = mid;
            }
        }

        Ok(RootEstimate {
            x: 0.5 * (a + b),
            iterations: self.max_iterations,
        })
    }
}

///
/// Solves `F(x) = t` for any [Cdf]
///
#[derive(Debug, Clone)]
pub struct RootInverter<R = BrentRootFinder> {
    finder: R,
    residual_tolerance: f64,
    initial_span: f64,
    max_expansions: u32,
}

impl RootInverter {
    /// Inverter using [BrentRootFinder]
    ///
    /// # Arguments
    /// - `tolerance` - absolute tolerance on the position of the root
    /// - `max_iterations` - iteration limit of the root finder
    /// - `residual_tolerance` - largest acceptable `|F(x) - t|`
    ///
    pub fn new(tolerance: f64, max_iterations: u64, residual_tolerance: f64) -> Self {
        Self::with_finder(
            BrentRootFinder::new(tolerance, max_iterations),
            residual_tolerance,
        )
    }
}

impl Default for RootInverter {
    fn default() -> Self {
        Self::new(1e-12, 100, 1e-8)
    }
}

impl<R> RootInverter<R>
where
    R: RootFinder,
{
    pub fn with_finder(finder: R, residual_tolerance: f64) -> Self {
        Self {
            finder,
            residual_tolerance,
            initial_span: 1.0,
            max_expansions: 64,
        }
    }

    pub fn finder(&self) -> &R {
        &self.finder
    }

    /// Largest accepted `|F(x) - t|`
    pub fn residual_tolerance(&self) -> f64 {
        self.residual_tolerance
    }

    /// Find `x` such that `|cdf(x) - t| <= residual_tolerance`
    ///
    pub fn invert<C>(&self, cdf: &C, t: f64) -> Result<f64, InversionError>
    where
        C: Cdf + ?Sized,
    {
        if !(0.0..=1.0).contains(&t) {
            return Err(InversionError::TargetOutOfRange(t));
        }
        let g = |x: f64| cdf.evaluate(x).map(|v| v - t);

        let bracket = self.bracket(&g, cdf.domain())?;
        let root = self.finder.find_root(&g, bracket)?;

        let residual = g(root.x)?;
        if !(residual.abs() <= self.residual_tolerance) {
            return Err(InversionError::NotConverged {
                x: root.x,
                residual,
                iterations: root.iterations,
            });
        }
        Ok(root.x)
    }

    /// Get the interval `[a, b]` with `g(a) <= 0 <= g(b)`
    ///
    fn bracket<G>(&self, g: &G, domain: Domain) -> Result<(f64, f64), InversionError>
    where
        G: Fn(f64) -> Result<f64, IntegrationError>,
    {
        let (lower, upper) = (domain.lower(), domain.upper());

        let (a, f_lower) = if lower.is_finite() {
            (lower, g(lower)?)
        } else {
            let anchor = if upper.is_finite() { upper.min(0.0) } else { 0.0 };
            self.expand(g, anchor, -1.0)?
        };

        let (b, f_upper) = if upper.is_finite() {
            (upper, g(upper)?)
        } else {
            let anchor = if lower.is_finite() { lower.max(0.0) } else { 0.0 };
            self.expand(g, anchor, 1.0)?
        };

        if f_lower > 0.0 || f_upper < 0.0 {
            return Err(InversionError::InvalidBracket {
                lower: a,
                upper: b,
                f_lower,
                f_upper,
            });
        }
        Ok((a, b))
    }

    /// Move away from `anchor` in `direction` until the residual has the expected sign
    ///
    /// Returns the last point tried with its residual, even if the sign is wrong.
    ///
    fn expand<G>(&self, g: &G, anchor: f64, direction: f64) -> Result<(f64, f64), InversionError>
    where
        G: Fn(f64) -> Result<f64, IntegrationError>,
    {
        let mut span = self.initial_span;
        let mut x = anchor + direction * span;
        let mut residual = g(x)?;

        for _ in 0..self.max_expansions {
            if residual * direction >= 0.0 {
                break;
            }
            span *= 2.0;
            x = anchor + direction * span;
            residual = g(x)?;
        }
        log::trace!("Surrogate bound {x} with residual {residual:e}");
        Ok((x, residual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chebyshev::ChebyshevCdf;
    use crate::quadrature::QuadratureCdf;

    /// CDF of the uniform distribution on [0, 2]
    struct LinearCdf;

    impl Cdf for LinearCdf {
        fn domain(&self) -> Domain {
            Domain::new(0.0, 2.0).unwrap()
        }

        fn evaluate(&self, x: f64) -> Result<f64, IntegrationError> {
            Ok((0.5 * x).clamp(0.0, 1.0))
        }
    }

    /// CDF which can never be evaluated
    struct BrokenCdf;

    impl Cdf for BrokenCdf {
        fn domain(&self) -> Domain {
            Domain::new(0.0, 1.0).unwrap()
        }

        fn evaluate(&self, x: f64) -> Result<f64, IntegrationError> {
            Err(IntegrationError::NonFinite { x, value: f64::NAN })
        }
    }

    /// Root finder which always returns the midpoint of the bracket
    struct Midpoint;

    impl RootFinder for Midpoint {
        fn find_root(
            &self,
            _g: &dyn Fn(f64) -> Result<f64, IntegrationError>,
            bracket: (f64, f64),
        ) -> Result<RootEstimate, InversionError> {
            Ok(RootEstimate {
                x: 0.5 * (bracket.0 + bracket.1),
                iterations: 1,
            })
        }
    }

    #[test]
    fn test_invert_linear() {
        let inverter = RootInverter::default();

        for (t, x) in [(0.0, 0.0), (0.25, 0.5), (0.5, 1.0), (0.9, 1.8), (1.0, 2.0)] {
            approx::assert_abs_diff_eq!(x, inverter.invert(&LinearCdf, t).unwrap(), epsilon = 1e-8);
        }
    }

    #[test]
    fn test_target_out_of_range() {
        let inverter = RootInverter::default();

        assert_eq!(
            Err(InversionError::TargetOutOfRange(1.5)),
            inverter.invert(&LinearCdf, 1.5)
        );
        assert!(inverter.invert(&LinearCdf, -0.1).is_err());
        assert!(inverter.invert(&LinearCdf, f64::NAN).is_err());
    }

    #[test]
    fn test_round_trip_quadrature() {
        let density = |x: f64| f64::exp(-0.5 * x * x);
        let cdf = QuadratureCdf::new(&density, Domain::real_line(), 1e-10).unwrap();
        let inverter = RootInverter::default();

        for t in [1e-6, 0.01, 0.3, 0.5, 0.77, 0.999] {
            let x = inverter.invert(&cdf, t).unwrap();
            assert!((cdf.evaluate(x).unwrap() - t).abs() < 1e-8);
        }
        approx::assert_abs_diff_eq!(0.0, inverter.invert(&cdf, 0.5).unwrap(), epsilon = 1e-7);
    }

    #[test]
    fn test_round_trip_chebyshev() {
        let density = |x: f64| 2.0 + x.sin();
        let cdf = ChebyshevCdf::fit(&density, Domain::new(-3.0, 4.0).unwrap(), 1e-12, 256).unwrap();
        let inverter = RootInverter::default();

        for t in [0.0, 0.05, 0.3, 0.5, 0.77, 0.95, 1.0] {
            let x = inverter.invert(&cdf, t).unwrap();
            assert!((cdf.value(x) - t).abs() < 1e-8);
        }
    }

    #[test]
    fn test_semi_infinite_bracket() {
        let density = |x: f64| (-x).exp();
        let cdf = QuadratureCdf::new(&density, Domain::new(0.0, f64::INFINITY).unwrap(), 1e-10)
            .unwrap();
        let inverter = RootInverter::default();

        let x = inverter.invert(&cdf, 0.99).unwrap();
        approx::assert_abs_diff_eq!(-f64::ln(0.01), x, epsilon = 1e-6);

        let density = |x: f64| x.exp();
        let cdf = QuadratureCdf::new(&density, Domain::new(f64::NEG_INFINITY, 0.0).unwrap(), 1e-10)
            .unwrap();
        let x = inverter.invert(&cdf, 0.01).unwrap();
        approx::assert_abs_diff_eq!(f64::ln(0.01), x, epsilon = 1e-6);
    }

    #[test]
    fn test_bisection() {
        let density = |x: f64| 1.0 / (1.0 + x * x);
        let cdf = QuadratureCdf::new(&density, Domain::real_line(), 1e-10).unwrap();

        let bisection = RootInverter::with_finder(Bisection::new(1e-12, 200), 1e-8);
        let brent = RootInverter::default();

        for t in [0.1, 0.5, 0.75, 0.9] {
            let x_bisection = bisection.invert(&cdf, t).unwrap();
            let x_brent = brent.invert(&cdf, t).unwrap();
            // Cauchy quantile
            let reference = f64::tan(std::f64::consts::PI * (t - 0.5));
            approx::assert_abs_diff_eq!(reference, x_bisection, epsilon = 1e-6);
            approx::assert_abs_diff_eq!(reference, x_brent, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_heavy_tail_far_quantile() {
        let density = |x: f64| 1.0 / (1.0 + x * x);
        let cdf = QuadratureCdf::new(&density, Domain::real_line(), 1e-10).unwrap();
        let inverter = RootInverter::default();

        // Cauchy quantile for 1 - t is cot(π t) ≈ 1 / (π t)
        let x = inverter.invert(&cdf, 1.0 - 1e-9).unwrap();
        approx::assert_relative_eq!(1.0 / (std::f64::consts::PI * 1e-9), x, max_relative = 1e-3);

        let x = inverter.invert(&cdf, 1e-9).unwrap();
        approx::assert_relative_eq!(-1.0 / (std::f64::consts::PI * 1e-9), x, max_relative = 1e-3);
    }

    #[test]
    fn test_residual_check() {
        let inverter = RootInverter::with_finder(Midpoint, 1e-8);

        assert_eq!(Ok(1.0), inverter.invert(&LinearCdf, 0.5));
        assert!(matches!(
            inverter.invert(&LinearCdf, 0.8),
            Err(InversionError::NotConverged { iterations: 1, .. })
        ));
    }

    #[test]
    fn test_cdf_failure() {
        let inverter = RootInverter::with_finder(Bisection::new(1e-12, 200), 1e-8);
        assert!(matches!(
            inverter.invert(&BrokenCdf, 0.5),
            Err(InversionError::Integration(_))
        ));

        assert!(RootInverter::default().invert(&BrokenCdf, 0.5).is_err());
    }

    #[test]
    fn test_invalid_bracket() {
        let bisection = Bisection::new(1e-12, 100);
        let res = bisection.find_root(
            &|x: f64| Ok::<f64, IntegrationError>(x * x + 1.0),
            (-1.0, 1.0),
        );
        assert!(matches!(res, Err(InversionError::InvalidBracket { .. })));
    }
}
