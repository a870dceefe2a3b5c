//! Complex polynomial root finding for the lens-equation quintic.
//!
//! Durand-Kerner (Weierstrass) simultaneous iteration: cheap per step,
//! degree-agnostic, and easy to seed from the previous sample's roots so
//! that root identity survives along a source trajectory.

use anyhow::{bail, Result};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Relative magnitude below which a leading coefficient is treated as zero
/// and the effective degree reduced.
const LEADING_COEFF_TRIM: f64 = 1e-14;
/// Minimum separation kept between iterates to avoid division blow-up.
const ITERATE_SEPARATION: f64 = 1e-30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RootSolveSettings {
    pub tolerance: f64,
    pub max_iters: usize,
}

impl Default for RootSolveSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-13,
            max_iters: 200,
        }
    }
}

/// Evaluate a polynomial with ascending-degree coefficients by Horner's rule.
pub fn eval_poly(coeffs: &[Complex<f64>], z: Complex<f64>) -> Complex<f64> {
    let mut acc = Complex::new(0.0, 0.0);
    for &c in coeffs.iter().rev() {
        acc = acc * z + c;
    }
    acc
}

/// All complex roots of the polynomial `sum_k coeffs[k] z^k`.
///
/// `seeds` (if given) provide starting iterates; fewer seeds than the degree
/// are padded with the standard geometric seeds. Near-zero leading
/// coefficients are trimmed first, so a degenerated quintic is solved at its
/// effective degree.
pub fn solve(
    coeffs: &[Complex<f64>],
    seeds: Option<&[Complex<f64>]>,
    settings: RootSolveSettings,
) -> Result<Vec<Complex<f64>>> {
    if settings.tolerance <= 0.0 {
        bail!("tolerance must be positive.");
    }
    if settings.max_iters == 0 {
        bail!("max_iters must be greater than zero.");
    }

    let max_mag = coeffs.iter().map(|c| c.norm()).fold(0.0_f64, f64::max);
    if max_mag == 0.0 {
        bail!("Polynomial is identically zero.");
    }
    let mut degree = coeffs.len() - 1;
    while degree > 0 && coeffs[degree].norm() < LEADING_COEFF_TRIM * max_mag {
        degree -= 1;
    }
    if degree == 0 {
        bail!("Polynomial has no roots (degree zero after trimming).");
    }

    // Monic normalization.
    let lead = coeffs[degree];
    let monic: Vec<Complex<f64>> = coeffs[..=degree].iter().map(|c| c / lead).collect();

    // Cauchy bound on root magnitude, used to scale the default seeds.
    let bound = 1.0
        + monic[..degree]
            .iter()
            .map(|c| c.norm())
            .fold(0.0_f64, f64::max);

    let mut roots: Vec<Complex<f64>> = Vec::with_capacity(degree);
    if let Some(seeds) = seeds {
        roots.extend(seeds.iter().take(degree).copied());
    }
    let ring = Complex::new(0.4, 0.9);
    let mut spoke = ring;
    while roots.len() < degree {
        roots.push(spoke * (0.5 * bound));
        spoke *= ring;
    }
    // Coincident seeds stall the iteration; nudge duplicates apart.
    for i in 1..degree {
        for j in 0..i {
            if (roots[i] - roots[j]).norm_sqr() < ITERATE_SEPARATION {
                roots[i] += Complex::new(1e-8 * (i as f64 + 1.0), 1e-8);
            }
        }
    }

    let scale = bound.max(1.0);
    for _ in 0..settings.max_iters {
        let mut max_step = 0.0_f64;
        for i in 0..degree {
            let mut denom = Complex::new(1.0, 0.0);
            for j in 0..degree {
                if i == j {
                    continue;
                }
                let mut diff = roots[i] - roots[j];
                if diff.norm_sqr() < ITERATE_SEPARATION {
                    diff = Complex::new(1e-15, 1e-15);
                }
                denom *= diff;
            }
            let step = eval_poly(&monic, roots[i]) / denom;
            roots[i] -= step;
            max_step = max_step.max(step.norm());
        }
        if max_step < settings.tolerance * scale {
            return Ok(roots);
        }
    }

    bail!(
        "Root iteration failed to converge in {} steps (degree {}).",
        settings.max_iters,
        degree
    );
}

/// Product of two ascending-degree coefficient slices.
pub(crate) fn poly_mul(a: &[Complex<f64>], b: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let mut out = vec![Complex::new(0.0, 0.0); a.len() + b.len() - 1];
    for (i, &ai) in a.iter().enumerate() {
        for (j, &bj) in b.iter().enumerate() {
            out[i + j] += ai * bj;
        }
    }
    out
}

/// In-place `a += s * b` on ascending-degree coefficients.
pub(crate) fn poly_add_scaled(a: &mut Vec<Complex<f64>>, s: Complex<f64>, b: &[Complex<f64>]) {
    if a.len() < b.len() {
        a.resize(b.len(), Complex::new(0.0, 0.0));
    }
    for (ai, &bi) in a.iter_mut().zip(b.iter()) {
        *ai += s * bi;
    }
}
