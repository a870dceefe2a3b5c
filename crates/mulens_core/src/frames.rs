//! Trajectory-frame to lens-frame transforms.
//!
//! The lens frame puts the binary axis on x with the midpoint at the origin;
//! the trajectory frame is centred on the centre of mass with its x axis
//! along the trajectory reference direction at closest approach. For an
//! orbiting binary the rotation between the two is time dependent.

use crate::geometry::Point;
use serde::{Deserialize, Serialize};

/// Circular-orbit parameters of the binary, all in Einstein-scaled units.
///
/// `omega = chi * a^(-3/2)` where `chi` is the velocity ratio of the orbital
/// speed at the Einstein radius to the lens transverse speed, and `a` is the
/// semimajor axis (shared with the lens separation parameter).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orbit {
    /// Orbital velocity ratio `chi` (decoded from the `log_chi` axis).
    pub chi: f64,
    /// Longitude of the ascending node relative to the orbital phase at the
    /// time of closest approach.
    pub lona: f64,
    /// Inclination of the orbital axis relative to the line of sight.
    pub inc: f64,
}

impl Orbit {
    pub fn omega(&self, a: f64) -> f64 {
        self.chi * a.powf(-1.5)
    }
}

/// Snapshot of the frame transform at one instant: rotation, centre-of-mass
/// translation and (for an orbiting binary) the rotation rate terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameState {
    /// Instantaneous projected separation.
    pub s: f64,
    /// Centre of mass in the lens frame.
    pub cm: Point,
    pub cos_phi: f64,
    pub sin_phi: f64,
    /// `(d cos(alpha)/dt, d sin(alpha)/dt)`; zero for a static binary.
    pub alpha_rate: (f64, f64),
}

impl FrameState {
    /// Static binary: `phi(t) = phi0`, constant separation.
    pub fn fixed(q: f64, s: f64, phi0: f64) -> Self {
        Self {
            s,
            cm: center_of_mass(q, s),
            cos_phi: phi0.cos(),
            sin_phi: phi0.sin(),
            alpha_rate: (0.0, 0.0),
        }
    }

    /// Orbiting binary at time `t`. The azimuth `alpha(t)` rotates the
    /// projected separation vector onto the x axis, so the instantaneous
    /// frame angle is `phi(t) = phi0 - alpha(t)`.
    pub fn orbiting(q: f64, a: f64, phi0: f64, orbit: Orbit, t: f64) -> Self {
        let omega = orbit.omega(a);
        let phi_orb = orbit.lona + omega * t;
        let (sin_orb, cos_orb) = phi_orb.sin_cos();
        let (sin_inc, cos_inc) = orbit.inc.sin_cos();
        // Projection of the unit separation vector onto the sky plane.
        let s_unit = (1.0 - sin_inc * sin_inc * sin_orb * sin_orb).sqrt();
        let s = a * s_unit;
        let sin_alpha = cos_inc * sin_orb / s_unit;
        let cos_alpha = cos_orb / s_unit;
        let (sin_phi0, cos_phi0) = phi0.sin_cos();
        // First-order rates of the alpha rotation, applied in the velocity
        // transform.
        let alpha_rate = (-sin_orb * omega, cos_inc * cos_orb * omega);
        Self {
            s,
            cm: center_of_mass(q, s),
            cos_phi: cos_alpha * cos_phi0 + sin_alpha * sin_phi0,
            sin_phi: cos_alpha * sin_phi0 - sin_alpha * cos_phi0,
            alpha_rate,
        }
    }

    /// Trajectory frame to lens frame: `cm + R(phi) p`.
    pub fn traj2lens(&self, p: Point) -> Point {
        Point::new(
            self.cm.x + p.x * self.cos_phi - p.y * self.sin_phi,
            self.cm.y + p.x * self.sin_phi + p.y * self.cos_phi,
        )
    }

    /// Lens frame to trajectory frame: `R(-phi) (p - cm)`.
    pub fn lens2traj(&self, p: Point) -> Point {
        let d = p - self.cm;
        Point::new(
            d.x * self.cos_phi + d.y * self.sin_phi,
            -d.x * self.sin_phi + d.y * self.cos_phi,
        )
    }

    /// Velocity transform: rotation of the velocity plus the rotation-rate
    /// contribution acting on the trajectory-frame position.
    pub fn traj2lens_vel(&self, v: Point, p: Point) -> Point {
        let mut dp = Point::new(
            v.x * self.cos_phi - v.y * self.sin_phi,
            v.x * self.sin_phi + v.y * self.cos_phi,
        );
        let (dcos_alpha, dsin_alpha) = self.alpha_rate;
        if dcos_alpha != 0.0 || dsin_alpha != 0.0 {
            dp = dp
                + Point::new(
                    p.x * dcos_alpha + p.y * dsin_alpha,
                    -p.x * dsin_alpha + p.y * dcos_alpha,
                );
        }
        dp
    }
}

/// Centre of mass of masses `nu = 1/(1+q)` at `-s/2` and `1-nu` at `+s/2`.
pub fn center_of_mass(q: f64, s: f64) -> Point {
    Point::new((q / (1.0 + q) - 0.5) * s, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn round_trip_through_frames() {
        let state = FrameState::fixed(0.4, 1.3, 0.77);
        let p = Point::new(0.3, -1.1);
        let back = state.lens2traj(state.traj2lens(p));
        assert_relative_eq!(back.x, p.x, epsilon = 1e-14);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-14);
    }

    #[test]
    fn center_of_mass_matches_mass_weights() {
        let q = 3.0;
        let s = 1.5;
        let nu = 1.0 / (1.0 + q);
        let expected = nu * (-s / 2.0) + (1.0 - nu) * (s / 2.0);
        assert_relative_eq!(center_of_mass(q, s).x, expected, epsilon = 1e-14);
        assert_eq!(center_of_mass(q, s).y, 0.0);
    }

    #[test]
    fn zero_chi_orbit_is_static() {
        let orbit = Orbit {
            chi: 0.0,
            lona: 0.3,
            inc: 1.0,
        };
        let a = FrameState::orbiting(1.0, 1.0, 0.2, orbit, 0.0);
        let b = FrameState::orbiting(1.0, 1.0, 0.2, orbit, 37.5);
        assert_relative_eq!(a.s, b.s, epsilon = 1e-15);
        assert_relative_eq!(a.cos_phi, b.cos_phi, epsilon = 1e-15);
        assert_relative_eq!(a.sin_phi, b.sin_phi, epsilon = 1e-15);
    }

    #[test]
    fn orbital_separation_closed_form() {
        // chi = 0.1, inc = pi/3, lona = 0, a = 1.
        let orbit = Orbit {
            chi: 0.1,
            lona: 0.0,
            inc: std::f64::consts::FRAC_PI_3,
        };
        let omega = orbit.omega(1.0);
        assert_relative_eq!(omega, 0.1, epsilon = 1e-15);
        let s0 = FrameState::orbiting(0.3, 1.0, 0.0, orbit, 0.0).s;
        assert_relative_eq!(s0, 1.0, epsilon = 1e-10);
        for &t in &[1.0, 2.0, 5.0] {
            let s = FrameState::orbiting(0.3, 1.0, 0.0, orbit, t).s;
            let sin_inc = (std::f64::consts::FRAC_PI_3).sin();
            let expected = (1.0 - sin_inc * sin_inc * (omega * t).sin().powi(2)).sqrt();
            assert_relative_eq!(s, expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn face_on_orbit_keeps_unit_separation() {
        let orbit = Orbit {
            chi: 0.5,
            lona: 0.0,
            inc: 0.0,
        };
        for &t in &[0.0, 0.7, 3.0] {
            let state = FrameState::orbiting(1.0, 1.0, 0.0, orbit, t);
            assert_relative_eq!(state.s, 1.0, epsilon = 1e-14);
            // Rotation stays orthonormal.
            assert_relative_eq!(
                state.cos_phi * state.cos_phi + state.sin_phi * state.sin_phi,
                1.0,
                epsilon = 1e-12
            );
        }
    }
}
