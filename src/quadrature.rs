//! CDF evaluated on demand by numerical integration of the density
//!
//! The integration is performed by an adaptive Gauss-Kronrod rule
//! ([GaussKronrod]), which handles improper integrals by a change of variables
//! that maps an infinite interval onto a finite one:
//!
//! | Interval          | Substitution          | Range of `t` |
//! |-------------------|-----------------------|--------------|
//! | `[a, +∞)`         | `x = a + t / (1 - t)` | `[0, 1)`     |
//! | `(-∞, b]`         | `x = b - (1 - t) / t` | `(0, 1]`     |
//! | `(-∞, +∞)`        | `x = t / (1 - t²)`    | `(-1, 1)`    |
//!
//! Any other integration scheme can be plugged in by implementing [Integrator].
//!
//! A change of variables alone cannot find mass that sits far from the point
//! the mapping is anchored at. [QuadratureCdf] therefore locates the bulk of
//! the density once, splits the domain there, and evaluates the CDF through
//! the tail on the far side of the query point.
//!
use crate::{Cdf, Domain, SamplerError};
use argmin::core::{CostFunction, Error as ArgminError, Executor, State};
use argmin::solver::goldensectionsearch::GoldenSectionSearch;
use std::cell::Cell;
use thiserror::Error;

/// Failure of a numerical integration
///
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IntegrationError {
    /// Error estimate is still above the tolerance after the maximum number of subdivisions.
    /// Typical for divergent or strongly oscillating integrands.
    #[error("Quadrature on [{lower}, {upper}] did not converge after {subdivisions} subdivisions (estimate {estimate:e}, error {error:e})")]
    NotConverged {
        lower: f64,
        upper: f64,
        estimate: f64,
        error: f64,
        subdivisions: usize,
    },
    /// Integrand returned NaN or an infinity
    #[error("Integrand has non-finite value {value} at x = {x}")]
    NonFinite { x: f64, value: f64 },
    /// Density integrated by [QuadratureCdf] is negative
    #[error("Density has negative value {value} at x = {x}")]
    NegativeDensity { x: f64, value: f64 },
    /// Integration limit is NaN
    #[error("Integration limit is NaN")]
    NanLimit,
}

///
/// Numerical integration scheme for definite integrals of real functions
///
/// Limits may be infinite. If `lower > upper` the integral changes sign.
///
pub trait Integrator {
    fn integrate(
        &self,
        f: &dyn Fn(f64) -> f64,
        lower: f64,
        upper: f64,
    ) -> Result<f64, IntegrationError>;
}

/// Abscissae of the 15-point Kronrod rule on `[0, 1]`
///
/// The odd entries (and the centre) are the nodes of the embedded 7-point Gauss rule.
const XGK: [f64; 8] = [
    0.991455371120812639206854697526329,
    0.949107912342758524526189684047851,
    0.864864423359769072789712788640926,
    0.741531185599394439863864773280788,
    0.586087235467691130294144845693013,
    0.405845151377397166906606412076961,
    0.207784955007898467600689403773245,
    0.000000000000000000000000000000000,
];

/// Weights of the 15-point Kronrod rule
const WGK: [f64; 8] = [
    0.022935322010529224963732008058970,
    0.063092092629978553290700663189204,
    0.104790010322250183839876322541518,
    0.140653259715525918745189590510238,
    0.169004726639267902826583426598550,
    0.190350578064785409913256402421014,
    0.204432940075298892414161999234649,
    0.209482141084727828012999174891714,
];

/// Weights of the 7-point Gauss rule
const WG: [f64; 4] = [
    0.129484966168869693270611432679082,
    0.279705391489276667901467771423780,
    0.381830050505118944950369775488975,
    0.417959183673469387755102040816327,
];

/// Segments required before an integral that vanishes at every node is accepted
const MIN_VANISHING_SEGMENTS: usize = 32;

///
/// Change of variables which maps an integration interval onto a finite one
///
#[derive(Debug, Clone, Copy, PartialEq)]
enum Substitution {
    Identity,
    UpperInfinite { lower: f64 },
    LowerInfinite { upper: f64 },
    BothInfinite,
}

impl Substitution {
    /// Select substitution for `lower < upper`, together with the interval of `t`
    ///
    fn select(lower: f64, upper: f64) -> (Self, f64, f64) {
        match (lower.is_finite(), upper.is_finite()) {
            (true, true) => (Self::Identity, lower, upper),
            (true, false) => (Self::UpperInfinite { lower }, 0.0, 1.0),
            (false, true) => (Self::LowerInfinite { upper }, 0.0, 1.0),
            (false, false) => (Self::BothInfinite, -1.0, 1.0),
        }
    }

    /// Get `(x(t), dx/dt)`
    fn apply(&self, t: f64) -> (f64, f64) {
        match *self {
            Self::Identity => (t, 1.0),
            Self::UpperInfinite { lower } => {
                let u = 1.0 - t;
                (lower + t / u, 1.0 / (u * u))
            }
            Self::LowerInfinite { upper } => (upper - (1.0 - t) / t, 1.0 / (t * t)),
            Self::BothInfinite => {
                let d = 1.0 - t * t;
                (t / d, (1.0 + t * t) / (d * d))
            }
        }
    }
}

///
/// Result of the 15-point rule over a single segment
///
#[derive(Debug, Clone, Copy)]
struct Segment {
    a: f64,
    b: f64,
    estimate: f64,
    error: f64,
}

///
/// Globally adaptive Gauss-Kronrod (G7/K15) quadrature
///
/// The interval is first split into `initial_segments` equal parts. Then the
/// segment with the largest error estimate `|K15 - G7|` is bisected until the
/// total error drops below `max(abs_tolerance, rel_tolerance * |I|)`.
///
/// An estimate that is exactly zero is only trusted after all segments have
/// been refined to at least 32, since a narrow bump can fall between the nodes.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussKronrod {
    pub rel_tolerance: f64,
    pub abs_tolerance: f64,
    pub max_subdivisions: usize,
    pub initial_segments: usize,
}

impl Default for GaussKronrod {
    fn default() -> Self {
        Self::new(1e-10)
    }
}

impl GaussKronrod {
    /// New integrator with a relative tolerance and default limits
    ///
    pub fn new(rel_tolerance: f64) -> Self {
        Self {
            rel_tolerance,
            abs_tolerance: 0.0,
            max_subdivisions: 500,
            initial_segments: 4,
        }
    }

    pub fn abs_tolerance(mut self, abs_tolerance: f64) -> Self {
        self.abs_tolerance = abs_tolerance;
        self
    }

    pub fn max_subdivisions(mut self, max_subdivisions: usize) -> Self {
        self.max_subdivisions = max_subdivisions;
        self
    }

    pub fn initial_segments(mut self, initial_segments: usize) -> Self {
        self.initial_segments = initial_segments.max(1);
        self
    }

    fn kronrod15<G>(&self, g: &G, a: f64, b: f64) -> Result<Segment, IntegrationError>
    where
        G: Fn(f64) -> Result<f64, IntegrationError>,
    {
        let center = 0.5 * (a + b);
        let half = 0.5 * (b - a);

        let fc = g(center)?;
        let mut kronrod = fc * WGK[7];
        let mut gauss = fc * WG[3];

        for j in 0..7 {
            let dx = half * XGK[j];
            let sum = g(center - dx)? + g(center + dx)?;
            kronrod += WGK[j] * sum;
            if j % 2 == 1 {
                gauss += WG[j / 2] * sum;
            }
        }

        Ok(Segment {
            a,
            b,
            estimate: kronrod * half,
            error: ((kronrod - gauss) * half).abs(),
        })
    }

    /// Bisect every segment that can still be split in floating point
    ///
    fn refine<G>(&self, g: &G, segments: &[Segment]) -> Result<Vec<Segment>, IntegrationError>
    where
        G: Fn(f64) -> Result<f64, IntegrationError>,
    {
        let mut refined = Vec::with_capacity(2 * segments.len());
        for seg in segments {
            let mid = 0.5 * (seg.a + seg.b);
            if seg.a < mid && mid < seg.b {
                refined.push(self.kronrod15(g, seg.a, mid)?);
                refined.push(self.kronrod15(g, mid, seg.b)?);
            } else {
                refined.push(*seg);
            }
        }
        Ok(refined)
    }
}

impl Integrator for GaussKronrod {
    fn integrate(
        &self,
        f: &dyn Fn(f64) -> f64,
        lower: f64,
        upper: f64,
    ) -> Result<f64, IntegrationError> {
        if lower.is_nan() || upper.is_nan() {
            return Err(IntegrationError::NanLimit);
        } else if lower == upper {
            return Ok(0.0);
        } else if lower > upper {
            return self.integrate(f, upper, lower).map(|v| -v);
        }

        let (substitution, t_min, t_max) = Substitution::select(lower, upper);

        let g = |t: f64| {
            let (x, jacobian) = substitution.apply(t);
            // Integrable density must vanish at infinity
            if !x.is_finite() || jacobian == 0.0 {
                return Ok(0.0);
            }
            let value = f(x);
            if !value.is_finite() {
                return Err(IntegrationError::NonFinite { x, value });
            }
            let value = value * jacobian;
            if !value.is_finite() {
                return Err(IntegrationError::NonFinite { x, value });
            }
            Ok(value)
        };

        let count = self.initial_segments.max(1);
        let width = (t_max - t_min) / count as f64;
        let mut segments = (0..count)
            .map(|i| {
                let a = t_min + width * i as f64;
                let b = if i + 1 == count { t_max } else { a + width };
                self.kronrod15(&g, a, b)
            })
            .collect::<Result<Vec<_>, _>>()?;

        loop {
            let estimate: f64 = segments.iter().map(|s| s.estimate).sum();
            let error: f64 = segments.iter().map(|s| s.error).sum();

            if estimate == 0.0 && error == 0.0 && segments.len() < MIN_VANISHING_SEGMENTS {
                let refined = self.refine(&g, &segments)?;
                if refined.len() > segments.len() {
                    segments = refined;
                    continue;
                }
            }

            if error <= self.abs_tolerance.max(self.rel_tolerance * estimate.abs()) {
                return Ok(estimate);
            }

            let not_converged = IntegrationError::NotConverged {
                lower,
                upper,
                estimate,
                error,
                subdivisions: segments.len(),
            };

            if segments.len() >= self.max_subdivisions {
                return Err(not_converged);
            }

            // We know segments is never empty
            let worst = segments
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.error.total_cmp(&b.1.error))
                .map(|(i, _)| i)
                .unwrap_or(0);
            let seg = segments.swap_remove(worst);
            let mid = 0.5 * (seg.a + seg.b);

            // Segment cannot be split any further in floating point
            if !(seg.a < mid && mid < seg.b) {
                return Err(not_converged);
            }
            segments.push(self.kronrod15(&g, seg.a, mid)?);
            segments.push(self.kronrod15(&g, mid, seg.b)?);
        }
    }
}

/// Smallest and largest binary exponent of the offsets sampled around the origin
const SCAN_EXPONENTS: std::ops::RangeInclusive<i32> = -20..=60;

/// Number of equal cells scanned on a finite domain
const SCAN_CELLS: usize = 64;

/// Point strictly inside the domain, used when the density vanishes at every scan point
fn reference_point(domain: Domain) -> f64 {
    let (lower, upper) = (domain.lower(), domain.upper());
    match (lower.is_finite(), upper.is_finite()) {
        (true, true) => 0.5 * lower + 0.5 * upper,
        (true, false) => lower + lower.abs().max(1.0),
        (false, true) => upper - upper.abs().max(1.0),
        (false, false) => 0.0,
    }
}

/// Points at which the density is scanned to find its bulk
///
/// Offsets `±2^k` around the origin (clamped to the domain) cover every scale,
/// and a uniform grid covers finite domains. Sorted, interior points only.
///
fn scan_points(domain: Domain) -> Vec<f64> {
    let (lower, upper) = (domain.lower(), domain.upper());
    let origin = 0.0_f64.clamp(lower, upper);

    let mut points = vec![reference_point(domain), origin];
    for k in SCAN_EXPONENTS {
        let offset = 2.0_f64.powi(k);
        points.push(origin - offset);
        points.push(origin + offset);
    }
    if domain.is_finite() {
        let width = upper - lower;
        points.extend((1..SCAN_CELLS).map(|j| lower + width * j as f64 / SCAN_CELLS as f64));
    }

    points.retain(|x| lower < *x && *x < upper);
    points.sort_by(f64::total_cmp);
    points.dedup();
    points
}

/// Negated density, so that its minimum is the mode
struct NegatedDensity<'a, F> {
    density: &'a F,
}

impl<F> CostFunction for NegatedDensity<'_, F>
where
    F: Fn(f64) -> f64,
{
    type Param = f64;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, ArgminError> {
        let value = (self.density)(*x);
        // Invalid values are reported by the integration
        Ok(if value.is_finite() { -value.max(0.0) } else { 0.0 })
    }
}

///
/// Find an interior point where the density is largest
///
/// The best scan point is refined by golden-section search between its neighbours.
/// Fails if a scanned value is negative.
///
fn locate_mass<F>(density: &F, domain: Domain) -> Result<f64, SamplerError>
where
    F: Fn(f64) -> f64,
{
    let points = scan_points(domain);

    let mut best: Option<(usize, f64)> = None;
    for (i, &x) in points.iter().enumerate() {
        let value = density(x);
        if value < 0.0 {
            return Err(SamplerError::NegativeDensity { x, value });
        } else if value.is_finite() && value > best.map_or(0.0, |(_, v)| v) {
            best = Some((i, value));
        }
    }

    let Some((i, value)) = best else {
        log::debug!("Density vanishes at all {} scan points", points.len());
        return Ok(reference_point(domain));
    };
    let x = points[i];

    let left = points[i.saturating_sub(1)];
    let right = points[(i + 1).min(points.len() - 1)];
    if !(left < right) {
        return Ok(x);
    }

    let refined = GoldenSectionSearch::new(left, right)
        .and_then(|solver| solver.with_tolerance(1e-8))
        .and_then(|solver| {
            Executor::new(NegatedDensity { density }, solver)
                .configure(|state| state.param(x).max_iters(100))
                .run()
        });

    match refined {
        Ok(result) => {
            let state = result.state();
            match state.get_best_param().copied() {
                Some(mode) if -state.get_best_cost() > value => Ok(mode),
                _ => Ok(x),
            }
        }
        Err(err) => {
            log::debug!("Refinement of the density mode failed: {err}");
            Ok(x)
        }
    }
}

/// Integrate a density, failing on negative values
///
fn integrate_density<F, I>(
    integrator: &I,
    density: &F,
    lower: f64,
    upper: f64,
) -> Result<f64, IntegrationError>
where
    F: Fn(f64) -> f64,
    I: Integrator,
{
    let negative = Cell::new(None);
    let f = |x: f64| {
        let value = density(x);
        if value < 0.0 {
            if negative.get().is_none() {
                negative.set(Some((x, value)));
            }
            // NaN makes the integrator stop early
            return f64::NAN;
        }
        value
    };
    let result = integrator.integrate(&f, lower, upper);

    match negative.get() {
        Some((x, value)) => Err(IntegrationError::NegativeDensity { x, value }),
        None => result,
    }
}

///
/// CDF computed by numerical integration of the density
///
/// At construction the bulk of the density is located (the *anchor*) and the
/// mass on either side of it is computed. An evaluation below the anchor
/// integrates from the lower bound to `x`, and above it from `x` to the upper
/// bound. So every integral starts or ends at the query point, where the
/// substitutions for infinite bounds place most of their nodes.
///
/// Evaluation is slow, but its accuracy is controlled by the integrator alone.
///
pub struct QuadratureCdf<'a, F, I = GaussKronrod> {
    density: &'a F,
    domain: Domain,
    integrator: I,
    anchor: f64,
    mass_below: f64,
    mass_above: f64,
}

impl<'a, F> QuadratureCdf<'a, F>
where
    F: Fn(f64) -> f64,
{
    /// Create CDF using [GaussKronrod] with a given relative tolerance
    ///
    pub fn new(density: &'a F, domain: Domain, tolerance: f64) -> Result<Self, SamplerError> {
        Self::with_integrator(density, domain, GaussKronrod::new(tolerance))
    }
}

impl<'a, F, I> QuadratureCdf<'a, F, I>
where
    F: Fn(f64) -> f64,
    I: Integrator,
{
    /// Create CDF with a custom integration scheme
    ///
    /// Fails if the density is negative, cannot be integrated over the domain,
    /// or its integral is not positive.
    ///
    pub fn with_integrator(
        density: &'a F,
        domain: Domain,
        integrator: I,
    ) -> Result<Self, SamplerError> {
        let anchor = locate_mass(density, domain)?;

        let integrate = |lower: f64, upper: f64| {
            integrate_density(&integrator, density, lower, upper).map_err(|err| match err {
                IntegrationError::NegativeDensity { x, value } => {
                    SamplerError::NegativeDensity { x, value }
                }
                err => err.into(),
            })
        };
        let mass_below = integrate(domain.lower(), anchor)?;
        let mass_above = integrate(anchor, domain.upper())?;

        let mass = mass_below + mass_above;
        if !(mass > 0.0 && mass.is_finite()) {
            return Err(SamplerError::ZeroMass { mass });
        }
        log::debug!(
            "Quadrature CDF on [{}, {}] anchored at {anchor} with total mass {mass:e}",
            domain.lower(),
            domain.upper()
        );

        Ok(Self {
            density,
            domain,
            integrator,
            anchor,
            mass_below,
            mass_above,
        })
    }

    /// Integral of the density over the whole domain
    pub fn mass(&self) -> f64 {
        self.mass_below + self.mass_above
    }

    /// Point at which the domain is split
    pub fn anchor(&self) -> f64 {
        self.anchor
    }
}

impl<'a, F, I> Cdf for QuadratureCdf<'a, F, I>
where
    F: Fn(f64) -> f64,
    I: Integrator,
{
    fn domain(&self) -> Domain {
        self.domain
    }

    fn evaluate(&self, x: f64) -> Result<f64, IntegrationError> {
        if x.is_nan() {
            return Err(IntegrationError::NanLimit);
        } else if x <= self.domain.lower() {
            return Ok(0.0);
        } else if x >= self.domain.upper() {
            return Ok(1.0);
        }
        let mass = self.mass();

        let value = if x <= self.anchor {
            integrate_density(&self.integrator, self.density, self.domain.lower(), x)? / mass
        } else {
            1.0 - integrate_density(&self.integrator, self.density, x, self.domain.upper())? / mass
        };
        Ok(value.clamp(0.0, 1.0))
    }
}
