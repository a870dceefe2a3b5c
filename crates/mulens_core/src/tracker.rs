//! Image identity along a source curve.
//!
//! Adjacent samples of a source trajectory (or of a source-disk boundary)
//! produce image sets that must be matched point-to-point so that each
//! image keeps its identity while it exists. Matching is an exact
//! minimum-cost assignment; with at most five images the full enumeration
//! is cheaper than anything cleverer.

use crate::geometry::Point;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Largest image-plane displacement accepted for one identity step.
    pub delta_max: f64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self { delta_max: 1.0 }
    }
}

/// Minimum total squared displacement injection of `from` into `to`
/// (`from.len() <= to.len()`); `out[i]` is the index in `to` matched to
/// `from[i]`. Ties resolve to the lexicographically smallest assignment.
/// `delta_max` (if finite) constrains every matched pair.
fn best_assignment(from: &[Point], to: &[Point], delta_max: f64) -> Option<Vec<usize>> {
    debug_assert!(from.len() <= to.len());
    let mut used = vec![false; to.len()];
    let mut current = Vec::with_capacity(from.len());
    let mut best: Option<(f64, Vec<usize>)> = None;
    search(from, to, delta_max, 0, 0.0, &mut used, &mut current, &mut best);
    best.map(|(_, assignment)| assignment)
}

#[allow(clippy::too_many_arguments)]
fn search(
    from: &[Point],
    to: &[Point],
    delta_max: f64,
    depth: usize,
    cost: f64,
    used: &mut [bool],
    current: &mut Vec<usize>,
    best: &mut Option<(f64, Vec<usize>)>,
) {
    if let Some((best_cost, _)) = best {
        if cost >= *best_cost {
            return;
        }
    }
    if depth == from.len() {
        *best = Some((cost, current.clone()));
        return;
    }
    for j in 0..to.len() {
        if used[j] {
            continue;
        }
        let d = from[depth].dist(to[j]);
        if d >= delta_max {
            continue;
        }
        used[j] = true;
        current.push(j);
        search(from, to, delta_max, depth + 1, cost + d * d, used, current, best);
        current.pop();
        used[j] = false;
    }
}

/// Equal-size assignment from the previous image set onto the next one.
pub fn match_images(prev: &[Point], next: &[Point], delta_max: f64) -> Option<Vec<usize>> {
    if prev.len() != next.len() {
        return None;
    }
    best_assignment(prev, next, delta_max)
}

/// Unconstrained injection of the smaller image set into the larger one,
/// used for boundary stitching across caustic seams.
pub fn match_into(smaller: &[Point], larger: &[Point]) -> Vec<usize> {
    best_assignment(smaller, larger, f64::INFINITY)
        .expect("unconstrained assignment always exists")
}

/// One tracked sample: the images reordered to preserve identity, their
/// canonical labels within the tracked set, and whether this step is a seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedSample {
    pub images: Vec<Point>,
    pub labels: Vec<usize>,
    pub seam: bool,
}

/// Carries image identity across adjacent samples. Owns nothing but the
/// previous image set and the label counter.
#[derive(Debug, Clone, Default)]
pub struct ImageTracker {
    settings: TrackerSettings,
    prev: Option<Vec<Point>>,
    labels: Vec<usize>,
    next_label: usize,
}

impl ImageTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Forget the previous sample; the next advance starts a fresh identity
    /// block (labels stay globally unique).
    pub fn reset(&mut self) {
        self.prev = None;
        self.labels.clear();
    }

    /// Absorb the next sample's images. On a matched step the images come
    /// back reordered so that index `i` is the same physical image as index
    /// `i` of the previous sample. A size change or an over-tolerance jump
    /// is a seam: identity restarts.
    pub fn advance(&mut self, images: Vec<Point>) -> TrackedSample {
        if let Some(prev) = &self.prev {
            if let Some(assignment) = match_images(prev, &images, self.settings.delta_max) {
                let reordered: Vec<Point> = assignment.iter().map(|&j| images[j]).collect();
                self.prev = Some(reordered.clone());
                return TrackedSample {
                    images: reordered,
                    labels: self.labels.clone(),
                    seam: false,
                };
            }
        }
        let seam = self.prev.is_some();
        self.labels = (self.next_label..self.next_label + images.len()).collect();
        self.next_label += images.len();
        self.prev = Some(images.clone());
        TrackedSample {
            images,
            labels: self.labels.clone(),
            seam,
        }
    }
}
