//! Inversion of the lens equation.
//!
//! The generic binary path clears denominators of the conjugated lens
//! equation into a degree-5 complex polynomial (the Witt-Mao construction),
//! solves it, and filters the spurious roots introduced by the conjugation.
//! Wide or extreme-mass-ratio binaries divert to a perturbative two-centre
//! inversion that is stabler when the lenses act nearly independently.

use crate::error::LensError;
use crate::geometry::Point;
use crate::lens::{BinaryAt, LensAt, LENS_PROXIMITY_TOL};
use crate::roots::{self, RootSolveSettings};
use nalgebra::Vector2;
use num_complex::Complex;
use tracing::debug;

/// Image multiplicities of a generic (non-caustic) binary lens.
pub const N_IMAGES_MIN: usize = 3;
pub const N_IMAGES_MAX: usize = 5;

/// Accepted roots closer than this are one image seen twice.
const DEDUPE_TOL: f64 = 1e-10;
const NEWTON_POLISH_ITERS: usize = 24;

impl LensAt {
    /// Images of the source point `beta`, in the lens plane.
    ///
    /// `seed` carries the previous sample's images to keep root identity
    /// through the solver; pass `None` at a trajectory boundary.
    pub fn invmap(&self, beta: Point, seed: Option<&[Point]>) -> Result<Vec<Point>, LensError> {
        match self {
            LensAt::Single(_) => invmap_single(beta),
            LensAt::Binary(b) => {
                if b.test_wide(beta, 1.0) {
                    match invmap_wide_binary(b, beta) {
                        // A non-degenerate binary has an odd image count; an
                        // even count means the perturbative path lost a pair
                        // near a caustic and the quintic must decide.
                        Ok(images) if images.len() % 2 == 1 => return Ok(images),
                        Ok(_) => {
                            debug!("wide-binary inversion lost an image pair, using quintic");
                        }
                        Err(err) => {
                            debug!(?err, "wide-binary inversion failed, falling back to quintic");
                        }
                    }
                }
                match invmap_witt_mao(b, beta, seed) {
                    Ok(images) => Ok(images),
                    Err(err) => {
                        debug!(?err, "quintic inversion failed, trying perturbative retry");
                        if let Ok(images) = invmap_wide_binary(b, beta) {
                            return Ok(images);
                        }
                        if seed.is_some() {
                            invmap_witt_mao(b, beta, None)
                        } else {
                            Err(err)
                        }
                    }
                }
            }
        }
    }
}

/// Sum of image parities `sign(det J)`; a topological invariant of the lens
/// (equal to `-1` for any two-mass configuration).
pub fn parity_sum(view: &LensAt, images: &[Point]) -> Result<i32, LensError> {
    let mut sum = 0;
    for &p in images {
        sum += view.signed_image_mag(p)?.signum() as i32;
    }
    Ok(sum)
}

/// Analytic two-image inversion of the unit point lens.
fn invmap_single(beta: Point) -> Result<Vec<Point>, LensError> {
    let u_sqr = beta.norm_sqr();
    if u_sqr < LENS_PROXIMITY_TOL * LENS_PROXIMITY_TOL {
        // Source behind the lens: the image is the full Einstein ring.
        return Err(LensError::Degenerate);
    }
    let root = (1.0 + 4.0 / u_sqr).sqrt();
    Ok(vec![
        beta * (0.5 * (1.0 + root)),
        beta * (0.5 * (1.0 - root)),
    ])
}

/// Quintic inversion: assemble `(z-w) Q1 Q2 - m1 P Q2 - m2 P Q1` where
/// `P = (z-z1)(z-z2)` and `Qj` clears the conjugate-image denominator of
/// lens `j`, then solve and keep the roots that satisfy the lens equation.
fn invmap_witt_mao(
    b: &BinaryAt,
    beta: Point,
    seed: Option<&[Point]>,
) -> Result<Vec<Point>, LensError> {
    let view = LensAt::Binary(*b);
    let a = 0.5 * b.separation();
    let [(m1, _), (m2, _)] = b.point_masses();
    let w: Complex<f64> = beta.into();
    let wb = w.conj();
    let one = Complex::new(1.0, 0.0);
    let c_delta = Complex::new(a * (m2 - m1), 0.0);
    let a_sqr = Complex::new(a * a, 0.0);

    let p_poly = [-a_sqr, Complex::new(0.0, 0.0), one];
    let q1 = [-a_sqr * (wb + a) + c_delta, one, wb + a];
    let q2 = [-a_sqr * (wb - a) + c_delta, one, wb - a];

    let q1q2 = roots::poly_mul(&q1, &q2);
    let mut poly = roots::poly_mul(&[-w, one], &q1q2);
    roots::poly_add_scaled(&mut poly, Complex::new(-m1, 0.0), &roots::poly_mul(&p_poly, &q2));
    roots::poly_add_scaled(&mut poly, Complex::new(-m2, 0.0), &roots::poly_mul(&p_poly, &q1));

    let seeds: Option<Vec<Complex<f64>>> =
        seed.map(|points| points.iter().map(|&p| p.into()).collect());
    let roots = roots::solve(&poly, seeds.as_deref(), RootSolveSettings::default())
        .map_err(|_| LensError::RootFilterFailure)?;

    let mut images: Vec<Point> = Vec::with_capacity(N_IMAGES_MAX);
    for root in roots {
        let candidate = Point::from(root);
        let mapped = match view.map(candidate) {
            Ok(mapped) => mapped,
            Err(_) => continue,
        };
        if mapped.dist(beta) < b.map_eps && !is_duplicate(&images, candidate) {
            images.push(candidate);
        }
    }
    if images.is_empty() {
        return Err(LensError::RootFilterFailure);
    }
    Ok(images)
}

/// Perturbative inversion for nearly-independent lenses: solve each lens as
/// a single lens with the companion folded into a constant deflection, then
/// polish every candidate against the full map.
fn invmap_wide_binary(b: &BinaryAt, beta: Point) -> Result<Vec<Point>, LensError> {
    let view = LensAt::Binary(*b);
    let masses = b.point_masses();
    let w: Complex<f64> = beta.into();

    let mut images: Vec<Point> = Vec::with_capacity(N_IMAGES_MAX);
    for j in 0..2 {
        let (m, zj) = masses[j];
        let (m_other, z_other) = masses[1 - j];
        let zj_c: Complex<f64> = zj.into();
        let z_other_c: Complex<f64> = z_other.into();
        // Companion deflection frozen at this lens's position.
        let w_eff = w - zj_c + m_other / (zj_c - z_other_c).conj();
        let u_sqr = w_eff.norm_sqr();
        let candidates = if u_sqr < LENS_PROXIMITY_TOL * LENS_PROXIMITY_TOL {
            // Aligned behind this lens: start on its Einstein ring.
            let r = m.sqrt();
            [zj_c + r, zj_c - r]
        } else {
            let root = (1.0 + 4.0 * m / u_sqr).sqrt();
            [
                zj_c + w_eff * (0.5 * (1.0 + root)),
                zj_c + w_eff * (0.5 * (1.0 - root)),
            ]
        };
        for candidate in candidates {
            if let Some(polished) = newton_polish(&view, beta, Point::from(candidate)) {
                if !is_duplicate(&images, polished) {
                    images.push(polished);
                }
            }
        }
    }
    if images.is_empty() {
        return Err(LensError::RootFilterFailure);
    }
    Ok(images)
}

/// Newton iteration of the full lens equation from a candidate image.
/// Returns the converged image, or `None` if the iteration leaves the
/// basin (hits a lens, a critical point, or fails the map tolerance).
fn newton_polish(view: &LensAt, beta: Point, start: Point) -> Option<Point> {
    let mut z = start;
    for _ in 0..NEWTON_POLISH_ITERS {
        let residual = view.map(z).ok()? - beta;
        let inv = view.invjac(z).ok()?;
        let step = inv.m * Vector2::new(residual.x, residual.y);
        z = z - Point::new(step[0], step[1]);
        if step.norm() < 1e-15 {
            break;
        }
    }
    let mapped = view.map(z).ok()?;
    (mapped.dist(beta) < view.map_eps()).then_some(z)
}

fn is_duplicate(images: &[Point], candidate: Point) -> bool {
    images.iter().any(|p| p.dist(candidate) < DEDUPE_TOL)
}
