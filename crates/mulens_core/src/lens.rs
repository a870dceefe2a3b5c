//! Lens configurations and the forward lens map.
//!
//! `Lens` is a tagged variant over the supported configurations; all
//! time-dependent operations live on the [`LensAt`] view obtained from
//! [`Lens::at`], whose existence proves the time-dependent state was set.

use crate::error::{LensError, SampleStatus};
use crate::finite_source::FiniteSourceSettings;
use crate::frames::{FrameState, Orbit};
use crate::geometry::Point;
use crate::params::{BinaryBinding, MassRatioParam};
use anyhow::{bail, Result};
use nalgebra::Matrix2;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// A point closer than this to a lens position makes the map degenerate.
pub const LENS_PROXIMITY_TOL: f64 = 1e-12;
/// Jacobian determinants below this are treated as on-caustic.
pub const DET_FLOOR: f64 = 1e-14;
/// Per-image magnification cap applied on caustic.
pub const MAG_CAP: f64 = 1e14;
/// Default tolerance for the spurious-root filter of the inverse map.
pub const DEFAULT_MAP_EPS: f64 = 1e-9;
/// Default wide-binary cutoff radius in Einstein units.
pub const DEFAULT_R_WIDE: f64 = 5.0;

/// Single unit point mass at the lens-frame origin; everything is analytic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleLens;

/// A binary point-mass lens in units of the total-mass Einstein radius.
///
/// Mass fractions are `nu = 1/(1+q)` at `(-s/2, 0)` and `1-nu` at
/// `(+s/2, 0)`, putting the centre of mass at `((q/(1+q) - 1/2) s, 0)`.
/// With an orbit attached, `s` doubles as the semimajor axis and the
/// projected separation becomes time dependent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryLens {
    pub q: f64,
    pub s: f64,
    pub phi0: f64,
    pub orbit: Option<Orbit>,
    /// Wide-binary cutoff for the perturbative inversion.
    pub r_wide: f64,
    /// Spurious-root filter tolerance of the inverse map.
    pub map_eps: f64,
    pub mass_ratio_param: MassRatioParam,
    /// Accept the legacy axis labels (`logq`, `s(1+q)`, `logL`).
    pub use_old_labels: bool,
    /// Source radius decoded from the parameter vector (finite source only).
    pub source_radius: Option<f64>,
    pub finite_source: Option<FiniteSourceSettings>,
    #[serde(skip)]
    pub(crate) binding: Option<BinaryBinding>,
}

impl BinaryLens {
    pub fn new(q: f64, s: f64, phi0: f64) -> Result<Self> {
        if !(q > 0.0) || !q.is_finite() {
            bail!("mass ratio q must be positive and finite, got {q}.");
        }
        if !(s > 0.0) || !s.is_finite() {
            bail!("separation s must be positive and finite, got {s}.");
        }
        Ok(Self {
            q,
            s,
            phi0,
            orbit: None,
            r_wide: DEFAULT_R_WIDE,
            map_eps: DEFAULT_MAP_EPS,
            mass_ratio_param: MassRatioParam::Log10,
            use_old_labels: false,
            source_radius: None,
            finite_source: None,
            binding: None,
        })
    }

    pub fn with_orbit(mut self, orbit: Orbit) -> Self {
        self.orbit = Some(orbit);
        // The axis set changed; any earlier binding is stale.
        self.binding = None;
        self
    }

    pub fn with_finite_source(mut self, settings: FiniteSourceSettings, rho: f64) -> Self {
        self.finite_source = Some(settings);
        self.source_radius = Some(rho);
        self.binding = None;
        self
    }

    pub fn nu(&self) -> f64 {
        1.0 / (1.0 + self.q)
    }

    fn frame_at(&self, t: f64) -> FrameState {
        match self.orbit {
            Some(orbit) => FrameState::orbiting(self.q, self.s, self.phi0, orbit, t),
            None => FrameState::fixed(self.q, self.s, self.phi0),
        }
    }
}

/// The supported lens configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Lens {
    Single(SingleLens),
    Binary(BinaryLens),
}

impl Lens {
    /// Time-keyed view carrying the frame transform and instantaneous
    /// geometry. Cheap to construct; build one per sample.
    pub fn at(&self, t: f64) -> LensAt {
        match self {
            Lens::Single(_) => LensAt::Single(SingleAt),
            Lens::Binary(lens) => {
                let frame = lens.frame_at(t);
                LensAt::Binary(BinaryAt {
                    q: lens.q,
                    nu: lens.nu(),
                    frame,
                    map_eps: lens.map_eps,
                    r_wide: lens.r_wide,
                })
            }
        }
    }

    pub fn finite_source(&self) -> Option<(&FiniteSourceSettings, f64)> {
        match self {
            Lens::Single(_) => None,
            Lens::Binary(lens) => match (&lens.finite_source, lens.source_radius) {
                (Some(settings), Some(rho)) => Some((settings, rho)),
                _ => None,
            },
        }
    }
}

/// Single-lens snapshot; the frame transform is the identity.
#[derive(Debug, Clone, Copy)]
pub struct SingleAt;

/// Binary-lens snapshot at a fixed time.
#[derive(Debug, Clone, Copy)]
pub struct BinaryAt {
    pub q: f64,
    pub nu: f64,
    pub frame: FrameState,
    pub map_eps: f64,
    pub r_wide: f64,
}

impl BinaryAt {
    pub fn separation(&self) -> f64 {
        self.frame.s
    }

    /// Lens positions and mass fractions in the lens frame.
    pub fn point_masses(&self) -> [(f64, Point); 2] {
        let a = 0.5 * self.frame.s;
        [
            (self.nu, Point::new(-a, 0.0)),
            (1.0 - self.nu, Point::new(a, 0.0)),
        ]
    }

    /// Conditions under which the perturbative wide-binary inversion is
    /// preferred over the quintic.
    pub fn test_wide(&self, beta: Point, scale: f64) -> bool {
        let rs = self.r_wide * scale;
        if rs <= 0.0 {
            return false;
        }
        self.frame.s > rs
            || beta.norm_sqr() > rs * rs
            || (self.q + 1.0 / self.q) > 2.0 * rs * rs
    }
}

/// Jacobian of the forward map at an image point: determinant plus the
/// 2x2 matrix (or its inverse, from [`LensAt::invjac`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jacobian {
    pub det: f64,
    pub m: Matrix2<f64>,
}

/// Combined point-source magnification over an image set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagResult {
    pub mag: f64,
    pub status: SampleStatus,
}

/// Time-keyed lens view; every time-dependent operation lives here.
#[derive(Debug, Clone, Copy)]
pub enum LensAt {
    Single(SingleAt),
    Binary(BinaryAt),
}

impl LensAt {
    fn masses(&self) -> ([(f64, Point); 2], usize) {
        match self {
            LensAt::Single(_) => ([(1.0, Point::ORIGIN), (0.0, Point::ORIGIN)], 1),
            LensAt::Binary(b) => (b.point_masses(), 2),
        }
    }

    /// Spurious-root filter tolerance of the inverse map.
    pub fn map_eps(&self) -> f64 {
        match self {
            LensAt::Single(_) => DEFAULT_MAP_EPS,
            LensAt::Binary(b) => b.map_eps,
        }
    }

    /// Forward lens map `beta = theta - sum_i m_i (theta - theta_i)/|theta - theta_i|^2`.
    pub fn map(&self, p: Point) -> Result<Point, LensError> {
        let (masses, n) = self.masses();
        let mut out = p;
        for &(m, zi) in &masses[..n] {
            let d = p - zi;
            let r2 = d.norm_sqr();
            if r2 < LENS_PROXIMITY_TOL * LENS_PROXIMITY_TOL {
                return Err(LensError::Degenerate);
            }
            out = out - d * (m / r2);
        }
        Ok(out)
    }

    /// Complex shear `gamma = sum_i m_i/(z - z_i)^2` and its first `nder`
    /// z-derivatives: `gamma^(k) = sum_i m_i (-1)^k (k+1)!/(z - z_i)^(k+2)`.
    pub fn compute_shear(&self, p: Point, nder: usize) -> Result<Vec<Complex<f64>>, LensError> {
        let z: Complex<f64> = p.into();
        let (masses, n) = self.masses();
        let mut out = vec![Complex::new(0.0, 0.0); nder + 1];
        for &(m, zi) in &masses[..n] {
            let d = z - Complex::from(zi);
            if d.norm_sqr() < LENS_PROXIMITY_TOL * LENS_PROXIMITY_TOL {
                return Err(LensError::Degenerate);
            }
            let mut pow = d * d;
            let mut factorial_sign = 1.0;
            for (k, slot) in out.iter_mut().enumerate() {
                // factorial_sign = (-1)^k (k+1)!
                *slot += m * factorial_sign / pow;
                pow *= d;
                factorial_sign *= -((k + 2) as f64);
            }
        }
        Ok(out)
    }

    /// Jacobian determinant and matrix of the forward map.
    pub fn jac(&self, p: Point) -> Result<Jacobian, LensError> {
        let gamma = self.compute_shear(p, 0)?[0];
        let det = 1.0 - gamma.norm_sqr();
        let m = Matrix2::new(1.0 + gamma.re, -gamma.im, -gamma.im, 1.0 - gamma.re);
        Ok(Jacobian { det, m })
    }

    /// Determinant and matrix inverse of the forward-map jacobian.
    pub fn invjac(&self, p: Point) -> Result<Jacobian, LensError> {
        let gamma = self.compute_shear(p, 0)?[0];
        let det = 1.0 - gamma.norm_sqr();
        if det.abs() < DET_FLOOR {
            return Err(LensError::PrecisionLoss);
        }
        let m = Matrix2::new(1.0 - gamma.re, gamma.im, gamma.im, 1.0 + gamma.re) / det;
        Ok(Jacobian { det, m })
    }

    /// Signed magnification `1/det J` of one image; the sign is its parity.
    pub fn signed_image_mag(&self, p: Point) -> Result<f64, LensError> {
        let jac = self.jac(p)?;
        if jac.det.abs() < DET_FLOOR {
            return Err(LensError::PrecisionLoss);
        }
        Ok(1.0 / jac.det)
    }

    /// Combined point-source magnification over an image set, capping
    /// on-caustic images and flagging the loss of precision.
    ///
    /// An empty image set reports unit magnification so that trivial regions
    /// fail gracefully.
    pub fn combined_mag(&self, images: &[Point]) -> MagResult {
        if images.is_empty() {
            return MagResult {
                mag: 1.0,
                status: SampleStatus::Ok,
            };
        }
        let mut mag = 0.0;
        let mut status = SampleStatus::Ok;
        for &p in images {
            match self.jac(p) {
                Ok(jac) if jac.det.abs() >= DET_FLOOR => mag += 1.0 / jac.det.abs(),
                Ok(_) => {
                    mag += MAG_CAP;
                    status.flag(LensError::PrecisionLoss);
                }
                Err(err) => status.flag(err),
            }
        }
        MagResult { mag, status }
    }

    /// Laplacian of the signed image magnification,
    /// `4 |gamma'|^2 mu^2 (1 + 2 mu |gamma|^2)` with `mu = 1/det J`.
    pub fn laplacian_mu(&self, p: Point) -> Result<f64, LensError> {
        let shear = self.compute_shear(p, 1)?;
        let det = 1.0 - shear[0].norm_sqr();
        if det.abs() < DET_FLOOR {
            return Err(LensError::PrecisionLoss);
        }
        let mu = 1.0 / det;
        Ok(4.0 * shear[1].norm_sqr() * mu * mu * (1.0 + 2.0 * mu * shear[0].norm_sqr()))
    }

    pub fn test_wide(&self, beta: Point, scale: f64) -> bool {
        match self {
            LensAt::Single(_) => false,
            LensAt::Binary(b) => b.test_wide(beta, scale),
        }
    }

    pub fn frame(&self) -> FrameState {
        match self {
            LensAt::Single(_) => FrameState {
                s: 0.0,
                cm: Point::ORIGIN,
                cos_phi: 1.0,
                sin_phi: 0.0,
                alpha_rate: (0.0, 0.0),
            },
            LensAt::Binary(b) => b.frame,
        }
    }

    pub fn traj2lens(&self, p: Point) -> Point {
        self.frame().traj2lens(p)
    }

    pub fn lens2traj(&self, p: Point) -> Point {
        self.frame().lens2traj(p)
    }

    pub fn traj2lens_vel(&self, v: Point, p: Point) -> Point {
        self.frame().traj2lens_vel(v, p)
    }

    /// Named lens centres in trajectory-frame coordinates.
    pub fn center(&self, option: CenterOption) -> Point {
        match self {
            LensAt::Single(_) => Point::ORIGIN,
            LensAt::Binary(b) => {
                let a = 0.5 * b.frame.s;
                let lens_frame = match option {
                    CenterOption::CenterOfMass => b.frame.cm,
                    CenterOption::Midpoint => Point::ORIGIN,
                    CenterOption::MinusLens => Point::new(-a, 0.0),
                    CenterOption::PlusLens => Point::new(a, 0.0),
                };
                b.frame.lens2traj(lens_frame)
            }
        }
    }
}

/// Which lens centre [`LensAt::center`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CenterOption {
    CenterOfMass,
    Midpoint,
    MinusLens,
    PlusLens,
}

/// Analytic single-lens point-source magnification at source offset `u`.
pub fn single_lens_mag(u: f64) -> f64 {
    let u2 = u * u;
    (u2 + 2.0) / (u * (u2 + 4.0).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn equal_binary() -> Lens {
        Lens::Binary(BinaryLens::new(1.0, 1.0, 0.0).expect("valid lens"))
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(BinaryLens::new(0.0, 1.0, 0.0).is_err());
        assert!(BinaryLens::new(-1.0, 1.0, 0.0).is_err());
        assert!(BinaryLens::new(1.0, 0.0, 0.0).is_err());
        assert!(BinaryLens::new(f64::NAN, 1.0, 0.0).is_err());
    }

    #[test]
    fn forward_map_equal_binary_center() {
        let view = equal_binary().at(0.0);
        // The midpoint maps to the origin by symmetry.
        let mapped = view.map(Point::ORIGIN).expect("midpoint is regular");
        assert_relative_eq!(mapped.x, 0.0, epsilon = 1e-15);
        assert_relative_eq!(mapped.y, 0.0, epsilon = 1e-15);
    }

    #[test]
    fn map_degenerate_at_lens_position() {
        let view = equal_binary().at(0.0);
        assert_eq!(
            view.map(Point::new(0.5, 0.0)),
            Err(LensError::Degenerate)
        );
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let view = equal_binary().at(0.0);
        let p = Point::new(0.9, 0.4);
        let jac = view.jac(p).expect("regular point");
        let h = 1e-6;
        let fx = |p: Point| view.map(p).expect("regular");
        let dx = (fx(p + Point::new(h, 0.0)) - fx(p - Point::new(h, 0.0))) * (0.5 / h);
        let dy = (fx(p + Point::new(0.0, h)) - fx(p - Point::new(0.0, h))) * (0.5 / h);
        assert_relative_eq!(jac.m[(0, 0)], dx.x, epsilon = 1e-6);
        assert_relative_eq!(jac.m[(1, 0)], dx.y, epsilon = 1e-6);
        assert_relative_eq!(jac.m[(0, 1)], dy.x, epsilon = 1e-6);
        assert_relative_eq!(jac.m[(1, 1)], dy.y, epsilon = 1e-6);
        let num_det = dx.x * dy.y - dy.x * dx.y;
        assert_relative_eq!(jac.det, num_det, epsilon = 1e-5);
    }

    #[test]
    fn invjac_inverts_jac() {
        let view = equal_binary().at(0.0);
        let p = Point::new(1.2, -0.3);
        let jac = view.jac(p).expect("regular");
        let inv = view.invjac(p).expect("regular");
        let product = jac.m * inv.m;
        assert_relative_eq!(product[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(product[(1, 1)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(product[(0, 1)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(product[(1, 0)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn shear_derivatives_match_finite_differences() {
        let view = equal_binary().at(0.0);
        let p = Point::new(0.7, 0.5);
        let shear = view.compute_shear(p, 2).expect("regular");
        let h = 1e-6;
        let g = |p: Point| view.compute_shear(p, 0).expect("regular")[0];
        // d/dz along the real axis equals the partial in x.
        let d1 = (g(p + Point::new(h, 0.0)) - g(p - Point::new(h, 0.0))) / (2.0 * h);
        assert!((shear[1] - d1).norm() < 1e-5);
        let gp = |p: Point| view.compute_shear(p, 1).expect("regular")[1];
        let d2 = (gp(p + Point::new(h, 0.0)) - gp(p - Point::new(h, 0.0))) / (2.0 * h);
        assert!((shear[2] - d2).norm() < 1e-4);
    }

    #[test]
    fn single_lens_image_mags_sum_to_analytic() {
        let view = Lens::Single(SingleLens).at(0.0);
        let u = 1.5_f64;
        // Analytic image radii for a unit point mass.
        let c_plus = 0.5 * (1.0 + (1.0 + 4.0 / (u * u)).sqrt());
        let c_minus = 0.5 * (1.0 - (1.0 + 4.0 / (u * u)).sqrt());
        let images = [Point::new(u * c_plus, 0.0), Point::new(u * c_minus, 0.0)];
        let result = view.combined_mag(&images);
        assert!(result.status.is_ok());
        assert_relative_eq!(result.mag, single_lens_mag(u), epsilon = 1e-12);
    }

    #[test]
    fn combined_mag_empty_is_unit() {
        let view = equal_binary().at(0.0);
        let result = view.combined_mag(&[]);
        assert_relative_eq!(result.mag, 1.0);
        assert!(result.status.is_ok());
    }

    #[test]
    fn combined_mag_caps_on_critical_curve() {
        // For q=1, s=2 the origin lies on the critical curve: gamma(0) = 1.
        let lens = Lens::Binary(BinaryLens::new(1.0, 2.0, 0.0).expect("valid lens"));
        let view = lens.at(0.0);
        let result = view.combined_mag(&[Point::ORIGIN]);
        assert_eq!(result.status, SampleStatus::Flagged(LensError::PrecisionLoss));
        assert_relative_eq!(result.mag, MAG_CAP);
    }

    #[test]
    fn laplacian_mu_positive_outside_caustic() {
        let view = equal_binary().at(0.0);
        let lap = view.laplacian_mu(Point::new(2.0, 0.5)).expect("regular");
        assert!(lap.is_finite());
        assert!(lap > 0.0);
    }

    #[test]
    fn wide_test_triggers_on_separation_and_distance() {
        let mut lens = BinaryLens::new(1.0, 6.0, 0.0).expect("valid lens");
        assert!(Lens::Binary(lens.clone()).at(0.0).test_wide(Point::ORIGIN, 1.0));
        lens.s = 1.0;
        let view = Lens::Binary(lens.clone()).at(0.0);
        assert!(!view.test_wide(Point::new(1.0, 0.0), 1.0));
        assert!(view.test_wide(Point::new(6.0, 0.0), 1.0));
        // Extreme mass ratios also divert to the perturbative path.
        lens.q = 1e-4;
        assert!(Lens::Binary(lens).at(0.0).test_wide(Point::ORIGIN, 1.0));
    }

    #[test]
    fn centers_follow_frame_rotation() {
        let lens = BinaryLens::new(3.0, 1.5, 0.4).expect("valid lens");
        let view = Lens::Binary(lens).at(0.0);
        let com = view.center(CenterOption::CenterOfMass);
        assert_relative_eq!(com.x, 0.0, epsilon = 1e-14);
        assert_relative_eq!(com.y, 0.0, epsilon = 1e-14);
        let plus = view.center(CenterOption::PlusLens);
        let minus = view.center(CenterOption::MinusLens);
        assert_relative_eq!(plus.dist(minus), 1.5, epsilon = 1e-12);
    }
}
