//! Observer-trajectory contract and the sampling drivers.
//!
//! The trajectory is a pure map `t -> (position, velocity)` owned by the
//! caller; the lens never stores it. The drivers walk a monotone time grid,
//! keep the previous image set as the root-solver seed, and isolate
//! per-sample failures: a failed sample is emitted with a sentinel
//! magnification and its status, the seed is cleared, and the sweep
//! continues.

use crate::error::{LensError, SampleStatus};
use crate::finite_source::{extended_source_mag, FiniteSourceSettings};
use crate::geometry::Point;
use crate::lens::Lens;
use crate::tracker::{ImageTracker, TrackerSettings};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Pure observer-trajectory map in the trajectory frame, plus its sample
/// grid and the physical/frame time conversion.
pub trait Trajectory {
    fn times(&self) -> &[f64];
    fn obs_pos(&self, t: f64) -> Point;
    fn obs_vel(&self, t: f64) -> Point;

    fn t_start(&self) -> f64 {
        self.times().first().copied().unwrap_or(0.0)
    }

    fn t_end(&self) -> f64 {
        self.times().last().copied().unwrap_or(0.0)
    }

    fn n_samples(&self) -> usize {
        self.times().len()
    }

    /// Einstein-crossing time used for the physical/frame conversion.
    fn t_einstein(&self) -> f64 {
        1.0
    }

    /// Physical time of closest approach.
    fn t_peak(&self) -> f64 {
        0.0
    }

    fn frame_time(&self, t_phys: f64) -> f64 {
        (t_phys - self.t_peak()) / self.t_einstein()
    }

    fn phys_time(&self, t_frame: f64) -> f64 {
        self.t_peak() + t_frame * self.t_einstein()
    }
}

/// Straight-line trajectory `p(t) = p0 + v t` with `p0` the closest-approach
/// offset, in Einstein units and frame time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearTrajectory {
    pub p0: Point,
    pub v: Point,
    times: Vec<f64>,
    t_einstein: f64,
    t_peak: f64,
}

impl LinearTrajectory {
    pub fn new(p0: Point, v: Point) -> Self {
        Self {
            p0,
            v,
            times: Vec::new(),
            t_einstein: 1.0,
            t_peak: 0.0,
        }
    }

    pub fn with_einstein_time(mut self, t_einstein: f64, t_peak: f64) -> Self {
        self.t_einstein = t_einstein;
        self.t_peak = t_peak;
        self
    }

    /// Install the sample grid, shifting every time by `-t_off`.
    pub fn set_times(&mut self, times: Vec<f64>, t_off: f64) {
        self.times = times.into_iter().map(|t| t - t_off).collect();
    }

    /// Uniform grid of `n` samples over `[t0, t1]`.
    pub fn sampled(p0: Point, v: Point, t0: f64, t1: f64, n: usize) -> Self {
        let mut traj = Self::new(p0, v);
        let times = if n < 2 {
            vec![t0]
        } else {
            (0..n)
                .map(|i| t0 + (t1 - t0) * (i as f64) / ((n - 1) as f64))
                .collect()
        };
        traj.set_times(times, 0.0);
        traj
    }
}

impl Trajectory for LinearTrajectory {
    fn times(&self) -> &[f64] {
        &self.times
    }

    fn obs_pos(&self, t: f64) -> Point {
        self.p0 + self.v * t
    }

    fn obs_vel(&self, _t: f64) -> Point {
        self.v
    }

    fn t_einstein(&self) -> f64 {
        self.t_einstein
    }

    fn t_peak(&self) -> f64 {
        self.t_peak
    }
}

/// One sample of a trajectory sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub t: f64,
    /// Source position in the lens frame.
    pub beta: Point,
    pub images: Vec<Point>,
    /// Canonical identity labels of the images within the tracked set.
    pub labels: Vec<usize>,
    pub mag: f64,
    pub status: SampleStatus,
    /// Filled by decimated finite-source sweeps.
    pub interpolated: bool,
}

/// Image curves of one finite-source sample, for the caller's sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleImageCurves {
    pub sample: usize,
    pub t: f64,
    pub curves: Vec<Vec<Point>>,
}

/// Full sweep output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryResult {
    pub samples: Vec<TrajectorySample>,
    /// Sample indices where image identity restarted.
    pub seams: Vec<usize>,
    /// Sample indices with `Ok` status.
    pub valid: Vec<usize>,
}

fn check_times(times: &[f64]) -> Result<()> {
    if times.is_empty() {
        bail!("Trajectory has no sample times.");
    }
    if times.windows(2).any(|w| w[1] <= w[0]) {
        bail!("Trajectory sample times must be strictly increasing.");
    }
    Ok(())
}

/// Point-source sweep: invert, track and magnify at every sample time.
pub fn compute_trajectory(
    lens: &Lens,
    traj: &impl Trajectory,
    tracker_settings: TrackerSettings,
) -> Result<TrajectoryResult> {
    let times = traj.times().to_vec();
    check_times(&times)?;

    let mut tracker = ImageTracker::new(tracker_settings);
    let mut seed: Option<Vec<Point>> = None;
    let mut samples = Vec::with_capacity(times.len());
    let mut seams = Vec::new();
    let mut valid = Vec::new();

    for (index, &t) in times.iter().enumerate() {
        let view = lens.at(t);
        let beta = view.traj2lens(traj.obs_pos(t));
        let images = match view.invmap(beta, seed.as_deref()) {
            Ok(images) => images,
            Err(err) => {
                warn!(index, t, ?err, "sample inversion failed");
                seed = None;
                tracker.reset();
                samples.push(TrajectorySample {
                    t,
                    beta,
                    images: Vec::new(),
                    labels: Vec::new(),
                    mag: f64::NAN,
                    status: SampleStatus::Flagged(err),
                    interpolated: false,
                });
                continue;
            }
        };
        let tracked = tracker.advance(images);
        let mut status = SampleStatus::Ok;
        if tracked.seam {
            status.flag(LensError::OrderingLost);
            seams.push(index);
        }
        let mag = view.combined_mag(&tracked.images);
        if let SampleStatus::Flagged(err) = mag.status {
            status.flag(err);
        }
        seed = Some(tracked.images.clone());
        if status.is_ok() {
            valid.push(index);
        }
        samples.push(TrajectorySample {
            t,
            beta,
            images: tracked.images,
            labels: tracked.labels,
            mag: mag.mag,
            status,
            interpolated: false,
        });
    }

    Ok(TrajectoryResult {
        samples,
        seams,
        valid,
    })
}

/// Extended-source sweep. Samples closer than `decimate_dtmin` to the last
/// full evaluation are linearly interpolated between full evaluations;
/// image curves of evaluated samples go to the caller's sink.
pub fn finite_source_compute_trajectory(
    lens: &Lens,
    traj: &impl Trajectory,
    tracker_settings: TrackerSettings,
    curves_out: Option<&mut Vec<SampleImageCurves>>,
) -> Result<TrajectoryResult> {
    let (settings, rho): (FiniteSourceSettings, f64) = match lens.finite_source() {
        Some((settings, rho)) => (*settings, rho),
        None => bail!("Lens has no finite-source configuration."),
    };
    let times = traj.times().to_vec();
    check_times(&times)?;

    // Decimation: greedy subset of evaluation times, endpoints always kept.
    let mut evaluate = vec![false; times.len()];
    let mut last_eval = f64::NEG_INFINITY;
    for (i, &t) in times.iter().enumerate() {
        if i == 0 || i == times.len() - 1 || t - last_eval >= settings.decimate_dtmin {
            evaluate[i] = true;
            last_eval = t;
        }
    }

    let mut tracker = ImageTracker::new(tracker_settings);
    let mut seed: Option<Vec<Point>> = None;
    let mut samples: Vec<TrajectorySample> = Vec::with_capacity(times.len());
    let mut seams = Vec::new();
    let mut curve_sink = curves_out;

    for (index, &t) in times.iter().enumerate() {
        let view = lens.at(t);
        let beta = view.traj2lens(traj.obs_pos(t));
        if !evaluate[index] {
            samples.push(TrajectorySample {
                t,
                beta,
                images: Vec::new(),
                labels: Vec::new(),
                mag: f64::NAN,
                status: SampleStatus::Ok,
                interpolated: true,
            });
            continue;
        }
        let mut status = SampleStatus::Ok;
        let (images, labels) = match view.invmap(beta, seed.as_deref()) {
            Ok(images) => {
                let tracked = tracker.advance(images);
                if tracked.seam {
                    status.flag(LensError::OrderingLost);
                    seams.push(index);
                }
                seed = Some(tracked.images.clone());
                (tracked.images, tracked.labels)
            }
            Err(err) => {
                warn!(index, t, ?err, "finite-source sample inversion failed");
                status.flag(err);
                seed = None;
                tracker.reset();
                (Vec::new(), Vec::new())
            }
        };

        let mut curves: Vec<Vec<Point>> = Vec::new();
        let wants_curves = curve_sink.is_some();
        let result = extended_source_mag(
            &view,
            beta,
            rho,
            &settings,
            wants_curves.then_some(&mut curves),
        );
        if let SampleStatus::Flagged(err) = result.status {
            status.flag(err);
        }
        // Curves are written only after the magnification is determined.
        if let Some(sink) = curve_sink.as_deref_mut() {
            if !curves.is_empty() {
                sink.push(SampleImageCurves {
                    sample: index,
                    t,
                    curves,
                });
            }
        }
        samples.push(TrajectorySample {
            t,
            beta,
            images,
            labels,
            mag: result.mag,
            status,
            interpolated: false,
        });
    }

    interpolate_decimated(&mut samples);
    let valid = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.status.is_ok() && s.mag.is_finite())
        .map(|(i, _)| i)
        .collect();
    Ok(TrajectoryResult {
        samples,
        seams,
        valid,
    })
}

/// Fill interpolated samples linearly between the bracketing evaluations.
fn interpolate_decimated(samples: &mut [TrajectorySample]) {
    let n = samples.len();
    let mut i = 0;
    while i < n {
        if !samples[i].interpolated {
            i += 1;
            continue;
        }
        let prev = (0..i).rev().find(|&j| !samples[j].interpolated);
        let next = (i + 1..n).find(|&j| !samples[j].interpolated);
        let mag = match (prev, next) {
            (Some(a), Some(b)) => {
                let (ta, tb) = (samples[a].t, samples[b].t);
                let (ma, mb) = (samples[a].mag, samples[b].mag);
                let w = (samples[i].t - ta) / (tb - ta);
                ma + (mb - ma) * w
            }
            (Some(a), None) => samples[a].mag,
            (None, Some(b)) => samples[b].mag,
            (None, None) => f64::NAN,
        };
        samples[i].mag = mag;
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::{single_lens_mag, BinaryLens, SingleLens};
    use approx::assert_relative_eq;

    #[test]
    fn rejects_unsorted_times() {
        let lens = Lens::Single(SingleLens);
        let mut traj = LinearTrajectory::new(Point::new(0.0, 0.1), Point::new(1.0, 0.0));
        traj.set_times(vec![0.0, 1.0, 0.5], 0.0);
        assert!(compute_trajectory(&lens, &traj, TrackerSettings::default()).is_err());
        traj.set_times(Vec::new(), 0.0);
        assert!(compute_trajectory(&lens, &traj, TrackerSettings::default()).is_err());
    }

    #[test]
    fn single_lens_sweep_matches_analytic_curve() {
        let lens = Lens::Single(SingleLens);
        let traj = LinearTrajectory::sampled(
            Point::new(0.0, 0.3),
            Point::new(1.0, 0.0),
            -2.0,
            2.0,
            101,
        );
        let result = compute_trajectory(&lens, &traj, TrackerSettings::default())
            .expect("sweep completes");
        assert_eq!(result.samples.len(), 101);
        assert!(result.seams.is_empty());
        for sample in &result.samples {
            let u = sample.beta.norm();
            assert!(sample.status.is_ok());
            assert_relative_eq!(sample.mag, single_lens_mag(u), epsilon = 1e-9);
            assert_eq!(sample.images.len(), 2);
        }
    }

    #[test]
    fn failed_sample_does_not_abort_sweep() {
        // The middle sample passes exactly through the lens, where the
        // inverse map is degenerate.
        let lens = Lens::Single(SingleLens);
        let traj =
            LinearTrajectory::sampled(Point::new(0.0, 0.0), Point::new(1.0, 0.0), -1.0, 1.0, 3);
        let result = compute_trajectory(&lens, &traj, TrackerSettings::default())
            .expect("sweep completes");
        assert_eq!(result.samples.len(), 3);
        assert_eq!(
            result.samples[1].status,
            SampleStatus::Flagged(LensError::Degenerate)
        );
        assert!(result.samples[1].mag.is_nan());
        assert!(result.samples[0].status.is_ok());
        assert!(result.samples[2].status.is_ok());
        assert_eq!(result.valid, vec![0, 2]);
    }

    #[test]
    fn tracker_continuity_bounds_image_steps() {
        let lens = Lens::Binary(BinaryLens::new(0.5, 0.8, 0.0).expect("valid lens"));
        let traj = LinearTrajectory::sampled(
            Point::new(0.0, 0.9),
            Point::new(1.0, 0.0),
            -1.5,
            1.5,
            301,
        );
        let result = compute_trajectory(&lens, &traj, TrackerSettings::default())
            .expect("sweep completes");
        assert!(result.seams.is_empty(), "off-caustic sweep has no seams");
        for pair in result.samples.windows(2) {
            let beta_step = pair[1].beta.dist(pair[0].beta);
            for (a, b) in pair[0].images.iter().zip(pair[1].images.iter()) {
                assert!(
                    a.dist(*b) < 20.0 * beta_step,
                    "image step {} vs beta step {}",
                    a.dist(*b),
                    beta_step
                );
            }
        }
    }

    #[test]
    fn decimated_finite_source_interpolates() {
        let mut lens = BinaryLens::new(1.0, 1.0, 0.0).expect("valid lens");
        let mut settings = FiniteSourceSettings::default();
        settings.decimate_dtmin = 0.05;
        lens = lens.with_finite_source(settings, 0.01);
        let lens = Lens::Binary(lens);
        let traj = LinearTrajectory::sampled(
            Point::new(0.0, 0.8),
            Point::new(1.0, 0.0),
            -0.5,
            0.5,
            51,
        );
        let result = finite_source_compute_trajectory(
            &lens,
            &traj,
            TrackerSettings::default(),
            None,
        )
        .expect("sweep completes");
        let n_interp = result.samples.iter().filter(|s| s.interpolated).count();
        assert!(n_interp > 0, "decimation skipped nothing");
        assert!(!result.samples[0].interpolated);
        assert!(!result.samples[50].interpolated);
        for sample in &result.samples {
            assert!(sample.mag.is_finite());
            assert!(sample.mag >= 1.0 - 1e-6);
        }
        // Interpolated values lie between their bracketing evaluations.
        for (i, sample) in result.samples.iter().enumerate() {
            if !sample.interpolated {
                continue;
            }
            let prev = result.samples[..i]
                .iter()
                .rev()
                .find(|s| !s.interpolated)
                .expect("left bracket");
            let next = result.samples[i + 1..]
                .iter()
                .find(|s| !s.interpolated)
                .expect("right bracket");
            let lo = prev.mag.min(next.mag) - 1e-12;
            let hi = prev.mag.max(next.mag) + 1e-12;
            assert!(sample.mag >= lo && sample.mag <= hi);
        }
    }

    #[test]
    fn finite_source_requires_configuration() {
        let lens = Lens::Binary(BinaryLens::new(1.0, 1.0, 0.0).expect("valid lens"));
        let traj =
            LinearTrajectory::sampled(Point::new(0.0, 0.5), Point::new(1.0, 0.0), -1.0, 1.0, 5);
        assert!(finite_source_compute_trajectory(
            &lens,
            &traj,
            TrackerSettings::default(),
            None
        )
        .is_err());
    }

    #[test]
    fn curves_sink_receives_evaluated_samples() {
        let lens = Lens::Binary(
            BinaryLens::new(1.0, 1.0, 0.0)
                .expect("valid lens")
                .with_finite_source(FiniteSourceSettings::default(), 0.01),
        );
        let traj =
            LinearTrajectory::sampled(Point::new(0.0, 0.8), Point::new(1.0, 0.0), -0.2, 0.2, 3);
        let mut curves = Vec::new();
        let result = finite_source_compute_trajectory(
            &lens,
            &traj,
            TrackerSettings::default(),
            Some(&mut curves),
        )
        .expect("sweep completes");
        assert_eq!(result.samples.len(), 3);
        assert_eq!(curves.len(), 3);
        for record in &curves {
            assert!(!record.curves.is_empty());
        }
    }

    #[test]
    fn frame_time_conversion_round_trips() {
        let traj = LinearTrajectory::new(Point::ORIGIN, Point::new(1.0, 0.0))
            .with_einstein_time(25.0, 5000.0);
        let t_phys = 5123.4;
        assert_relative_eq!(
            traj.phys_time(traj.frame_time(t_phys)),
            t_phys,
            epsilon = 1e-9
        );
        assert_relative_eq!(traj.frame_time(5000.0), 0.0);
        assert_relative_eq!(traj.frame_time(5025.0), 1.0);
    }
}
