//! Extended-source magnification.
//!
//! The default strategy traces the source-disk boundary through the inverse
//! map: the boundary polygon inverse-maps to one closed curve per image,
//! and the magnification is the summed image area over the source area.
//! Edges whose endpoint image sets cannot be matched are bisected in source
//! angle; count changes that survive refinement are caustic seams, where
//! the merging image pair is stitched end-to-end. Brute-force grid
//! evaluators remain as fallbacks for degenerate contours.

use crate::error::{LensError, SampleStatus};
use crate::geometry::{signed_area, Point};
use crate::lens::LensAt;
use crate::tracker::{match_images, match_into};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

/// Bisection depth cap per boundary edge.
const MAX_REFINE_DEPTH: usize = 48;
/// Boundary probes used to bound the image region for the map grid.
const BBOX_PROBES: usize = 16;
/// Total cell budget of the lens-plane grid fallback.
const MAP_GRID_CELL_BUDGET: usize = 1 << 22;
/// Source radius below which the quadrupole expansion replaces the contour.
const QUADRUPOLE_RHO_MAX: f64 = 1e-4;

fn default_n_poly_init() -> usize {
    64
}

fn default_n_poly_max() -> usize {
    16_384
}

fn default_tol() -> f64 {
    1e-3
}

fn default_refine_limit() -> f64 {
    1.0
}

/// Which finite-source evaluator runs first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FiniteSourceMethod {
    #[default]
    Contour,
    MapGrid,
    AreaGrid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FiniteSourceSettings {
    #[serde(default)]
    pub method: FiniteSourceMethod,
    /// Initial boundary polygon size.
    #[serde(default = "default_n_poly_init")]
    pub n_poly_init: usize,
    /// Total vertex budget after refinement.
    #[serde(default = "default_n_poly_max")]
    pub n_poly_max: usize,
    /// Relative accuracy target of the grid fallbacks and the small-source
    /// fast path.
    #[serde(default = "default_tol")]
    pub tol: f64,
    /// Edge acceptance threshold in units of the mean boundary-image
    /// spacing.
    #[serde(default = "default_refine_limit")]
    pub refine_limit: f64,
    /// Minimum time between full finite-source evaluations along a
    /// trajectory; closer samples are interpolated.
    #[serde(default)]
    pub decimate_dtmin: f64,
}

impl Default for FiniteSourceSettings {
    fn default() -> Self {
        Self {
            method: FiniteSourceMethod::Contour,
            n_poly_init: default_n_poly_init(),
            n_poly_max: default_n_poly_max(),
            tol: default_tol(),
            refine_limit: default_refine_limit(),
            decimate_dtmin: 0.0,
        }
    }
}

/// Result record of one extended-source evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FiniteSourceMag {
    pub mag: f64,
    /// Second central moment of the pointwise magnification across boundary
    /// (or grid) samples; a stochastic-error estimate.
    pub variance: f64,
    /// Boundary vertices (contour) or grid samples (fallbacks) used.
    pub n_samples: usize,
    pub status: SampleStatus,
}

impl FiniteSourceMag {
    fn failed(error: LensError) -> Self {
        Self {
            mag: f64::NAN,
            variance: 0.0,
            n_samples: 0,
            status: SampleStatus::Flagged(error),
        }
    }
}

/// Extended-source magnification of a uniform disk of radius `rho` centred
/// on `beta`, dispatching on the configured method. A degenerate contour
/// falls back to the brute-force evaluators. Closed image curves are
/// appended to `curves` (when given) after the magnification is determined.
pub fn extended_source_mag(
    view: &LensAt,
    beta: Point,
    rho: f64,
    settings: &FiniteSourceSettings,
    curves: Option<&mut Vec<Vec<Point>>>,
) -> FiniteSourceMag {
    if !(rho > 0.0) || !rho.is_finite() {
        return FiniteSourceMag::failed(LensError::Degenerate);
    }
    match settings.method {
        FiniteSourceMethod::Contour => {
            if rho < QUADRUPOLE_RHO_MAX && curves.is_none() {
                if let Some(result) = quadrupole_mag(view, beta, rho) {
                    return result;
                }
            }
            let result = image_area_mag(view, beta, rho, settings, curves);
            if result.status.is_ok() && result.mag.is_finite() {
                result
            } else {
                debug!(?beta, rho, status = ?result.status, "contour integration degenerate, using grid fallback");
                brute_force_circle_mag(view, beta, rho, settings.tol)
            }
        }
        FiniteSourceMethod::MapGrid => brute_force_map_mag(view, beta, rho, settings.tol),
        FiniteSourceMethod::AreaGrid => brute_force_area_mag(view, beta, rho, settings.tol),
    }
}

/// Small-source expansion: the disk average of the point magnification is
/// `mu + rho^2/8 * lap(mu)` with the Laplacian taken in the source plane
/// (estimated by a five-point stencil of radius `rho`).
fn quadrupole_mag(view: &LensAt, beta: Point, rho: f64) -> Option<FiniteSourceMag> {
    let center = point_mag_at(view, beta)?;
    let probes = [
        Point::new(rho, 0.0),
        Point::new(-rho, 0.0),
        Point::new(0.0, rho),
        Point::new(0.0, -rho),
    ];
    let mut ring = [0.0; 4];
    for (slot, offset) in ring.iter_mut().zip(probes.iter()) {
        *slot = point_mag_at(view, beta + *offset)?;
    }
    let laplacian = (ring.iter().sum::<f64>() - 4.0 * center) / (rho * rho);
    let mean = ring.iter().sum::<f64>() / 4.0;
    let variance = ring.iter().map(|m| (m - mean) * (m - mean)).sum::<f64>() / 4.0;
    Some(FiniteSourceMag {
        mag: center + rho * rho / 8.0 * laplacian,
        variance,
        n_samples: 5,
        status: SampleStatus::Ok,
    })
}

fn point_mag_at(view: &LensAt, beta: Point) -> Option<f64> {
    let images = view.invmap(beta, None).ok()?;
    let result = view.combined_mag(&images);
    result.status.is_ok().then_some(result.mag)
}

/// One boundary vertex: source angle, source point and its image set.
#[derive(Debug, Clone)]
struct BoundaryVertex {
    beta: Point,
    images: Vec<Point>,
    point_mag: f64,
}

/// Contour integration: refine the boundary polygon until adjacent image
/// sets match, stitch image tracks into closed curves and sum their areas.
pub fn image_area_mag(
    view: &LensAt,
    beta: Point,
    rho: f64,
    settings: &FiniteSourceSettings,
    curves: Option<&mut Vec<Vec<Point>>>,
) -> FiniteSourceMag {
    let n_init = settings.n_poly_init.max(8);
    let mut status = SampleStatus::Ok;

    // Initial ring, seeded vertex-to-vertex for root continuity.
    let mut initial: Vec<BoundaryVertex> = Vec::with_capacity(n_init);
    let mut seed: Option<Vec<Point>> = None;
    for k in 0..n_init {
        let angle = 2.0 * PI * (k as f64) / (n_init as f64);
        match make_vertex(view, beta, rho, angle, seed.as_deref()) {
            Some(vertex) => {
                seed = Some(vertex.images.clone());
                initial.push(vertex);
            }
            None => return FiniteSourceMag::failed(LensError::RootFilterFailure),
        }
    }

    // Acceptance threshold from the mean matched image displacement of the
    // initial ring.
    let mut matched_sum = 0.0;
    let mut matched_edges = 0usize;
    for k in 0..n_init {
        let a = &initial[k];
        let b = &initial[(k + 1) % n_init];
        if let Some(assign) = match_images(&a.images, &b.images, f64::INFINITY) {
            let max_disp = a
                .images
                .iter()
                .zip(assign.iter())
                .map(|(p, &j)| p.dist(b.images[j]))
                .fold(0.0_f64, f64::max);
            matched_sum += max_disp;
            matched_edges += 1;
        }
    }
    let mean_spacing = if matched_edges > 0 {
        matched_sum / matched_edges as f64
    } else {
        rho
    };
    let threshold = (settings.refine_limit * mean_spacing).max(1e-12);

    // Refine every edge of the ring (the wrap edge included).
    let mut budget = settings.n_poly_max.saturating_sub(n_init);
    let mut ring: Vec<BoundaryVertex> = Vec::with_capacity(n_init);
    for k in 0..n_init {
        let left = initial[k].clone();
        let right = initial[(k + 1) % n_init].clone();
        ring.push(left.clone());
        subdivide(
            view, beta, rho, &left, &right, threshold, 0, &mut budget, &mut ring, &mut status,
        );
    }

    let n_boundary = ring.len();
    let loops = match stitch_closed_curves(&ring, &mut status) {
        Some(loops) => loops,
        None => return FiniteSourceMag::failed(LensError::OrderingLost),
    };

    // Normalizing by the refined source polygon (rather than pi rho^2)
    // cancels the inscribed-polygon area deficit to first order.
    let source_area = signed_area(&ring.iter().map(|v| v.beta).collect::<Vec<_>>()).abs();
    if source_area <= 0.0 {
        return FiniteSourceMag::failed(LensError::Degenerate);
    }
    let image_area: f64 = loops.iter().map(|poly| signed_area(poly).abs()).sum();
    let mag = image_area / source_area;

    let mean = ring.iter().map(|v| v.point_mag).sum::<f64>() / n_boundary as f64;
    let variance = ring
        .iter()
        .map(|v| (v.point_mag - mean) * (v.point_mag - mean))
        .sum::<f64>()
        / n_boundary as f64;

    if let Some(out) = curves {
        out.extend(loops);
    }
    FiniteSourceMag {
        mag,
        variance,
        n_samples: n_boundary,
        status,
    }
}

fn make_vertex(
    view: &LensAt,
    beta: Point,
    rho: f64,
    angle: f64,
    seed: Option<&[Point]>,
) -> Option<BoundaryVertex> {
    let (sin_a, cos_a) = angle.sin_cos();
    let b = beta + Point::new(rho * cos_a, rho * sin_a);
    let images = match view.invmap(b, seed) {
        Ok(images) => images,
        Err(_) => view.invmap(b, None).ok()?,
    };
    let point_mag = view.combined_mag(&images).mag;
    Some(BoundaryVertex {
        beta: b,
        images,
        point_mag,
    })
}

/// `true` when the two endpoint image sets connect without a seam.
fn edge_matched(a: &BoundaryVertex, b: &BoundaryVertex, threshold: f64) -> bool {
    a.images.len() == b.images.len()
        && match_images(&a.images, &b.images, threshold).is_some()
}

/// Bisect `(left, right)` in source angle until matched or out of budget.
/// `left` is already in `out`; interior vertices are appended in order.
#[allow(clippy::too_many_arguments)]
fn subdivide(
    view: &LensAt,
    beta: Point,
    rho: f64,
    left: &BoundaryVertex,
    right: &BoundaryVertex,
    threshold: f64,
    depth: usize,
    budget: &mut usize,
    out: &mut Vec<BoundaryVertex>,
    status: &mut SampleStatus,
) {
    if edge_matched(left, right, threshold) {
        return;
    }
    if *budget == 0 || depth >= MAX_REFINE_DEPTH {
        // A persistent count change is a caustic seam and handled by the
        // stitcher; equal counts that still do not match are a genuine
        // refinement failure.
        if left.images.len() == right.images.len() {
            status.flag(LensError::Degenerate);
        }
        return;
    }
    let mid_angle = 0.5 * (angle_of(left, beta) + wrapped_angle(left, right, beta));
    let mid = match make_vertex(view, beta, rho, mid_angle, Some(&left.images)) {
        Some(mid) => mid,
        None => {
            status.flag(LensError::RootFilterFailure);
            return;
        }
    };
    *budget -= 1;
    subdivide(view, beta, rho, left, &mid, threshold, depth + 1, budget, out, status);
    out.push(mid.clone());
    subdivide(view, beta, rho, &mid, &right, threshold, depth + 1, budget, out, status);
}

fn angle_of(v: &BoundaryVertex, beta: Point) -> f64 {
    let d = v.beta - beta;
    d.y.atan2(d.x)
}

/// Angle of `right` unwrapped to lie just above `left`'s angle.
fn wrapped_angle(left: &BoundaryVertex, right: &BoundaryVertex, beta: Point) -> f64 {
    let a = angle_of(left, beta);
    let mut b = angle_of(right, beta);
    while b <= a {
        b += 2.0 * PI;
    }
    b
}

/// Endpoint of a track: `(track index, true for the end, false for the start)`.
type Endpoint = (usize, bool);

struct Track {
    points: Vec<Point>,
    start_link: Option<Endpoint>,
    end_link: Option<Endpoint>,
}

/// Build image tracks around the refined ring, pair merging/splitting
/// images at caustic seams, and extract the closed image curves.
fn stitch_closed_curves(
    ring: &[BoundaryVertex],
    status: &mut SampleStatus,
) -> Option<Vec<Vec<Point>>> {
    let n = ring.len();
    if n < 3 {
        return None;
    }
    let mut tracks: Vec<Track> = Vec::new();
    // Track owning each image of vertex 0, for the wrap-around links.
    let mut initial_tracks: Vec<usize> = Vec::new();
    // active[i] is the track whose latest point is the i-th image of the
    // current vertex.
    let mut active: Vec<usize> = Vec::new();
    for &image in &ring[0].images {
        let id = tracks.len();
        tracks.push(Track {
            points: vec![image],
            start_link: None,
            end_link: None,
        });
        initial_tracks.push(id);
        active.push(id);
    }

    for k in 0..n {
        let prev_images: Vec<Point> = active
            .iter()
            .map(|&id| *tracks[id].points.last().expect("track non-empty"))
            .collect();
        let next = &ring[(k + 1) % n];
        let wrap = k + 1 == n;

        if prev_images.len() == next.images.len() {
            let assign = match_images(&prev_images, &next.images, f64::INFINITY)?;
            if wrap {
                for (i, &j) in assign.iter().enumerate() {
                    link(&mut tracks, (active[i], true), (initial_tracks[j], false));
                }
            } else {
                let mut new_active = vec![usize::MAX; next.images.len()];
                for (i, &j) in assign.iter().enumerate() {
                    tracks[active[i]].points.push(next.images[j]);
                    new_active[j] = active[i];
                }
                active = new_active;
            }
        } else if prev_images.len() > next.images.len() {
            // Merge: the unmatched previous images annihilate pairwise.
            let assign = match_into(&next.images, &prev_images);
            let mut survivors = vec![usize::MAX; next.images.len()];
            let mut matched_prev = vec![false; prev_images.len()];
            for (j, &i) in assign.iter().enumerate() {
                matched_prev[i] = true;
                survivors[j] = active[i];
            }
            if wrap {
                for (j, &track) in survivors.iter().enumerate() {
                    link(&mut tracks, (track, true), (initial_tracks[j], false));
                }
            } else {
                for (j, &track) in survivors.iter().enumerate() {
                    tracks[track].points.push(next.images[j]);
                }
            }
            let (orphans, orphan_points): (Vec<usize>, Vec<Point>) = (0..prev_images.len())
                .filter(|&i| !matched_prev[i])
                .map(|i| (active[i], prev_images[i]))
                .unzip();
            pair_by_proximity(&mut tracks, &orphans, &orphan_points, true, status);
            if !wrap {
                active = survivors;
            }
        } else {
            // Split: the unmatched next images are born pairwise.
            let assign = match_into(&prev_images, &next.images);
            let mut matched_next = vec![false; next.images.len()];
            let mut new_active = vec![usize::MAX; next.images.len()];
            for (i, &j) in assign.iter().enumerate() {
                matched_next[j] = true;
                if wrap {
                    link(&mut tracks, (active[i], true), (initial_tracks[j], false));
                } else {
                    tracks[active[i]].points.push(next.images[j]);
                    new_active[j] = active[i];
                }
            }
            let mut born: Vec<usize> = Vec::new();
            for (j, &used) in matched_next.iter().enumerate() {
                if used {
                    continue;
                }
                if wrap {
                    born.push(initial_tracks[j]);
                } else {
                    let id = tracks.len();
                    tracks.push(Track {
                        points: vec![next.images[j]],
                        start_link: None,
                        end_link: None,
                    });
                    new_active[j] = id;
                    born.push(id);
                }
            }
            let born_points: Vec<Point> = born
                .iter()
                .map(|&id| {
                    if wrap {
                        tracks[id].points[0]
                    } else {
                        *tracks[id].points.last().expect("track non-empty")
                    }
                })
                .collect();
            pair_by_proximity(&mut tracks, &born, &born_points, false, status);
            if !wrap {
                active = new_active;
            }
        }
    }

    extract_loops(&tracks, status)
}

fn link(tracks: &mut [Track], a: Endpoint, b: Endpoint) {
    set_link(tracks, a, b);
    set_link(tracks, b, a);
}

fn set_link(tracks: &mut [Track], at: Endpoint, to: Endpoint) {
    let slot = if at.1 {
        &mut tracks[at.0].end_link
    } else {
        &mut tracks[at.0].start_link
    };
    *slot = Some(to);
}

fn pair_by_proximity(
    tracks: &mut [Track],
    ids: &[usize],
    points: &[Point],
    at_end: bool,
    status: &mut SampleStatus,
) {
    let mut remaining: Vec<usize> = (0..ids.len()).collect();
    while remaining.len() >= 2 {
        let first = remaining[0];
        let (pos, _) = remaining[1..]
            .iter()
            .enumerate()
            .map(|(offset, &other)| (offset + 1, points[first].dist(points[other])))
            .fold((1usize, f64::INFINITY), |best, cand| {
                if cand.1 < best.1 {
                    cand
                } else {
                    best
                }
            });
        let partner = remaining[pos];
        link(tracks, (ids[first], at_end), (ids[partner], at_end));
        remaining.remove(pos);
        remaining.remove(0);
    }
    if !remaining.is_empty() {
        // An unpaired seam endpoint: close the track on itself so the loop
        // walk terminates, and report the degeneracy.
        let id = ids[remaining[0]];
        link(tracks, (id, true), (id, false));
        status.flag(LensError::Degenerate);
    }
}

/// Follow the track/link graph into closed polygons. Every endpoint carries
/// exactly one link, so the graph is a disjoint union of cycles.
fn extract_loops(tracks: &[Track], status: &mut SampleStatus) -> Option<Vec<Vec<Point>>> {
    let mut visited = vec![false; tracks.len()];
    let mut loops = Vec::new();
    for start in 0..tracks.len() {
        if visited[start] {
            continue;
        }
        let mut polygon: Vec<Point> = Vec::new();
        // The walk enters `start` at its start endpoint and closes when a
        // link leads back there. Entering a track at its start means
        // walking it forward; entering at its end means walking backward.
        let mut current = start;
        let mut forward = true;
        loop {
            visited[current] = true;
            if forward {
                polygon.extend(tracks[current].points.iter().copied());
            } else {
                polygon.extend(tracks[current].points.iter().rev().copied());
            }
            let exit = if forward {
                tracks[current].end_link
            } else {
                tracks[current].start_link
            };
            let Some((next, at_end)) = exit else {
                status.flag(LensError::OrderingLost);
                break;
            };
            if next == start && !at_end {
                break;
            }
            if visited[next] {
                status.flag(LensError::OrderingLost);
                break;
            }
            current = next;
            forward = !at_end;
        }
        if polygon.len() >= 3 {
            loops.push(polygon);
        }
    }
    Some(loops)
}

/// Lens-plane grid fallback: grid a padded box around each point image,
/// forward-map every cell and count the cells landing inside the source
/// disk.
pub fn brute_force_map_mag(view: &LensAt, beta: Point, rho: f64, tol: f64) -> FiniteSourceMag {
    let center_images = match view.invmap(beta, None) {
        Ok(images) => images,
        Err(err) => return FiniteSourceMag::failed(err),
    };
    let point = view.combined_mag(&center_images);

    // Probe the boundary to size each image's box.
    let mut probe_points: Vec<Point> = center_images.clone();
    for k in 0..BBOX_PROBES {
        let angle = 2.0 * PI * (k as f64) / (BBOX_PROBES as f64);
        let (sin_a, cos_a) = angle.sin_cos();
        let b = beta + Point::new(rho * cos_a, rho * sin_a);
        if let Ok(images) = view.invmap(b, Some(&center_images)) {
            probe_points.extend(images);
        }
    }

    // One padded box per centre image, merged while they intersect.
    let stretch = point.mag.max(1.0).sqrt();
    let pad = 4.0 * rho * stretch;
    let mut boxes: Vec<(Point, Point)> = center_images
        .iter()
        .map(|&image| {
            let mut lo = image - Point::new(pad, pad);
            let mut hi = image + Point::new(pad, pad);
            for p in &probe_points {
                if (*p - image).norm() < 3.0 * pad {
                    lo = Point::new(lo.x.min(p.x - pad), lo.y.min(p.y - pad));
                    hi = Point::new(hi.x.max(p.x + pad), hi.y.max(p.y + pad));
                }
            }
            (lo, hi)
        })
        .collect();
    merge_intersecting_boxes(&mut boxes);

    let total_span: f64 = boxes
        .iter()
        .map(|(lo, hi)| (hi.x - lo.x) * (hi.y - lo.y))
        .sum();
    let mut cell = rho * tol.sqrt();
    if total_span / (cell * cell) > MAP_GRID_CELL_BUDGET as f64 {
        cell = (total_span / MAP_GRID_CELL_BUDGET as f64).sqrt();
    }

    let mut hits = 0usize;
    let mut samples = 0usize;
    let mut status = point.status;
    for (lo, hi) in &boxes {
        let nx = ((hi.x - lo.x) / cell).ceil() as usize;
        let ny = ((hi.y - lo.y) / cell).ceil() as usize;
        for ix in 0..nx {
            for iy in 0..ny {
                let p = Point::new(
                    lo.x + (ix as f64 + 0.5) * cell,
                    lo.y + (iy as f64 + 0.5) * cell,
                );
                samples += 1;
                match view.map(p) {
                    Ok(mapped) => {
                        if mapped.dist(beta) < rho {
                            hits += 1;
                        }
                    }
                    Err(err) => status.flag(err),
                }
            }
        }
    }
    FiniteSourceMag {
        mag: (hits as f64) * cell * cell / (PI * rho * rho),
        variance: 0.0,
        n_samples: samples,
        status,
    }
}

fn merge_intersecting_boxes(boxes: &mut Vec<(Point, Point)>) {
    loop {
        let mut merged = false;
        'outer: for i in 0..boxes.len() {
            for j in (i + 1)..boxes.len() {
                let (alo, ahi) = boxes[i];
                let (blo, bhi) = boxes[j];
                let overlap =
                    alo.x <= bhi.x && blo.x <= ahi.x && alo.y <= bhi.y && blo.y <= ahi.y;
                if overlap {
                    boxes[i] = (
                        Point::new(alo.x.min(blo.x), alo.y.min(blo.y)),
                        Point::new(ahi.x.max(bhi.x), ahi.y.max(bhi.y)),
                    );
                    boxes.swap_remove(j);
                    merged = true;
                    break 'outer;
                }
            }
        }
        if !merged {
            return;
        }
    }
}

/// Source-plane fallback: midpoint polar integration of the point-source
/// magnification over the disk.
pub fn brute_force_area_mag(view: &LensAt, beta: Point, rho: f64, tol: f64) -> FiniteSourceMag {
    let nr = ((2.0 / tol.sqrt()).ceil() as usize).clamp(16, 256);
    let nphi = 4 * nr;
    let dr = rho / nr as f64;
    let dphi = 2.0 * PI / nphi as f64;

    let mut integral = 0.0;
    let mut status = SampleStatus::Ok;
    let mut samples = 0usize;
    let mut seed: Option<Vec<Point>> = None;
    let mut values: Vec<f64> = Vec::with_capacity(nr * nphi);
    for i in 0..nr {
        let r = (i as f64 + 0.5) * dr;
        for j in 0..nphi {
            let phi = (j as f64 + 0.5) * dphi;
            let (sin_p, cos_p) = phi.sin_cos();
            let b = beta + Point::new(r * cos_p, r * sin_p);
            samples += 1;
            let images = match view.invmap(b, seed.as_deref()) {
                Ok(images) => images,
                Err(err) => {
                    status.flag(err);
                    seed = None;
                    continue;
                }
            };
            let result = view.combined_mag(&images);
            if let SampleStatus::Flagged(err) = result.status {
                status.flag(err);
            }
            integral += result.mag * r * dr * dphi;
            values.push(result.mag);
            seed = Some(images);
        }
    }
    let mag = integral / (PI * rho * rho);
    let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
    let variance = values
        .iter()
        .map(|m| (m - mean) * (m - mean))
        .sum::<f64>()
        / values.len().max(1) as f64;
    FiniteSourceMag {
        mag,
        variance,
        n_samples: samples,
        status,
    }
}

/// Fallback driver: the lens-plane grid first, the source-plane integral
/// when the grid itself degenerates.
pub fn brute_force_circle_mag(view: &LensAt, beta: Point, rho: f64, tol: f64) -> FiniteSourceMag {
    let map_result = brute_force_map_mag(view, beta, rho, tol);
    if map_result.mag.is_finite() && map_result.mag > 0.0 {
        return map_result;
    }
    debug!(?beta, rho, "map grid degenerate, integrating in the source plane");
    brute_force_area_mag(view, beta, rho, tol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::{single_lens_mag, BinaryLens, Lens, SingleLens};
    use approx::assert_relative_eq;

    fn single_view() -> LensAt {
        Lens::Single(SingleLens).at(0.0)
    }

    fn binary_view(q: f64, s: f64) -> LensAt {
        Lens::Binary(BinaryLens::new(q, s, 0.0).expect("valid lens")).at(0.0)
    }

    #[test]
    fn contour_approaches_point_source_for_small_disk() {
        let view = single_view();
        let beta = Point::new(1.0, 0.0);
        let settings = FiniteSourceSettings::default();
        let result = image_area_mag(&view, beta, 0.01, &settings, None);
        assert!(result.status.is_ok());
        assert!((result.mag - single_lens_mag(1.0)).abs() < 1e-3);
        assert!(result.variance >= 0.0);
    }

    #[test]
    fn contour_is_monotone_toward_point_limit() {
        let view = single_view();
        let beta = Point::new(1.0, 0.0);
        let settings = FiniteSourceSettings::default();
        let point = single_lens_mag(1.0);
        let mut previous = f64::INFINITY;
        for &rho in &[0.1, 0.05, 0.02] {
            let result = image_area_mag(&view, beta, rho, &settings, None);
            assert!(result.status.is_ok());
            assert!(result.mag > point, "rho={rho}: {} <= {point}", result.mag);
            assert!(result.mag < previous, "not monotone at rho={rho}");
            previous = result.mag;
        }
    }

    #[test]
    fn quadrupole_fast_path_matches_point_mag() {
        let view = single_view();
        let beta = Point::new(0.8, 0.3);
        let settings = FiniteSourceSettings::default();
        let result = extended_source_mag(&view, beta, 1e-5, &settings, None);
        assert!(result.status.is_ok());
        assert_eq!(result.n_samples, 5);
        let point = point_mag_at(&view, beta).expect("regular point");
        assert!((result.mag - point).abs() < 1e-6);
    }

    #[test]
    fn contour_matches_area_grid_off_caustic() {
        let view = binary_view(1.0, 1.0);
        let beta = Point::new(0.8, 0.4);
        let settings = FiniteSourceSettings::default();
        let contour = image_area_mag(&view, beta, 0.02, &settings, None);
        assert!(contour.status.is_ok());
        let grid = brute_force_area_mag(&view, beta, 0.02, 1e-3);
        assert!(grid.status.is_ok());
        assert_relative_eq!(contour.mag, grid.mag, max_relative = 2e-3);
    }

    #[test]
    fn contour_emits_closed_curves() {
        let view = binary_view(1.0, 1.0);
        let beta = Point::new(0.8, 0.4);
        let settings = FiniteSourceSettings::default();
        let mut curves = Vec::new();
        let result = image_area_mag(&view, beta, 0.02, &settings, Some(&mut curves));
        assert!(result.status.is_ok());
        // Three images off caustic, one closed curve each.
        assert_eq!(curves.len(), 3);
        for curve in &curves {
            assert!(curve.len() >= 3);
        }
    }

    #[test]
    fn map_grid_agrees_with_contour_for_single_lens() {
        let view = single_view();
        let beta = Point::new(0.7, 0.0);
        let settings = FiniteSourceSettings::default();
        let contour = image_area_mag(&view, beta, 0.05, &settings, None);
        let grid = brute_force_map_mag(&view, beta, 0.05, 1e-4);
        assert!(grid.status.is_ok());
        assert_relative_eq!(contour.mag, grid.mag, max_relative = 5e-3);
    }

    #[test]
    fn invalid_radius_is_degenerate() {
        let view = single_view();
        let settings = FiniteSourceSettings::default();
        let result = extended_source_mag(&view, Point::new(1.0, 0.0), 0.0, &settings, None);
        assert_eq!(result.status, SampleStatus::Flagged(LensError::Degenerate));
        assert!(result.mag.is_nan());
    }

    #[test]
    fn seam_stitching_across_caustic() {
        // The resonant caustic of the equal s=1 binary has an on-axis cusp
        // near x = 0.3406; a disk there straddles the caustic, so the
        // boundary crosses it and the stitcher must close mixed curves.
        let view = binary_view(1.0, 1.0);
        let beta = Point::new(0.3406, 0.0);
        let settings = FiniteSourceSettings::default();
        let contour = image_area_mag(&view, beta, 0.05, &settings, None);
        assert!(contour.mag.is_finite());
        assert!(contour.mag > 1.0);
        let grid = brute_force_area_mag(&view, beta, 0.05, 1e-4);
        assert_relative_eq!(contour.mag, grid.mag, max_relative = 2e-2);
    }

    #[test]
    fn settings_defaults_deserialize_from_empty_object() {
        let settings: FiniteSourceSettings =
            serde_json::from_str("{}").expect("defaults fill in");
        assert_eq!(settings.method, FiniteSourceMethod::Contour);
        assert_eq!(settings.n_poly_init, 64);
        assert_eq!(settings.n_poly_max, 16_384);
        assert_relative_eq!(settings.tol, 1e-3);
        assert_relative_eq!(settings.refine_limit, 1.0);
    }
}
