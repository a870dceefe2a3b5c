//! Text magnification-map writer.
//!
//! Scans a rectangle of trajectory-frame source positions row by row, each
//! row driven as a straight trajectory through the full inversion pipeline,
//! and writes one `x y magnification` record per line with a blank line
//! between scan rows.

use crate::geometry::Point;
use crate::lens::Lens;
use crate::tracker::TrackerSettings;
use crate::trajectory::{compute_trajectory, LinearTrajectory, Trajectory};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MagMapOptions {
    /// Append image count and image positions to each record.
    pub verbose: bool,
    /// Output precision; magnifications are truncated to `precision - 2`
    /// decimal digits so that map files diff cleanly across runs.
    pub precision: usize,
}

impl Default for MagMapOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            precision: 6,
        }
    }
}

/// Write the magnification over `[ll, ur]` sampled on a `samples x samples`
/// grid of trajectory-frame positions.
pub fn write_mag_map(
    lens: &Lens,
    out: &mut dyn Write,
    ll: Point,
    ur: Point,
    samples: usize,
    options: MagMapOptions,
) -> Result<()> {
    if samples < 2 {
        bail!("Magnification map needs at least 2 samples per side.");
    }
    if !(ur.x > ll.x) || !(ur.y > ll.y) {
        bail!("Magnification map corners must satisfy ll < ur.");
    }
    let dx = (ur.x - ll.x) / (samples - 1) as f64;
    let dy = (ur.y - ll.y) / (samples - 1) as f64;
    let truncate_scale = 10f64.powi(options.precision.saturating_sub(2) as i32);

    writeln!(out, "#x  y  magnification").context("writing map header")?;
    for iy in 0..samples {
        let y = ll.y + dy * iy as f64;
        let mut row = LinearTrajectory::new(Point::new(ll.x, y), Point::new(1.0, 0.0));
        row.set_times((0..samples).map(|i| dx * i as f64).collect(), 0.0);
        let result = compute_trajectory(lens, &row, TrackerSettings::default())?;
        for &i in &result.valid {
            let sample = &result.samples[i];
            let pos = row.obs_pos(sample.t);
            let truncated = (sample.mag * truncate_scale).floor() / truncate_scale;
            write!(out, "{} {} {:e}", pos.x, pos.y, truncated).context("writing map record")?;
            if options.verbose {
                write!(out, " {}", sample.images.len()).context("writing image count")?;
                for image in &sample.images {
                    write!(out, " {} {}", image.x, image.y).context("writing image position")?;
                }
            }
            writeln!(out).context("terminating map record")?;
        }
        writeln!(out).context("terminating scan row")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::{single_lens_mag, BinaryLens, SingleLens};

    #[test]
    fn rejects_bad_grid() {
        let lens = Lens::Single(SingleLens);
        let mut buffer = Vec::new();
        assert!(write_mag_map(
            &lens,
            &mut buffer,
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            1,
            MagMapOptions::default()
        )
        .is_err());
        assert!(write_mag_map(
            &lens,
            &mut buffer,
            Point::new(1.0, 0.0),
            Point::new(0.0, 1.0),
            4,
            MagMapOptions::default()
        )
        .is_err());
    }

    #[test]
    fn single_lens_map_has_expected_shape() {
        let lens = Lens::Single(SingleLens);
        let mut buffer = Vec::new();
        write_mag_map(
            &lens,
            &mut buffer,
            Point::new(1.0, 1.0),
            Point::new(2.0, 2.0),
            3,
            MagMapOptions::default(),
        )
        .expect("map writes");
        let text = String::from_utf8(buffer).expect("utf8 output");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#x  y  magnification");
        // 3 rows of 3 records plus a blank separator per row.
        assert_eq!(lines.len(), 1 + 3 * 4);
        assert_eq!(lines[4], "");

        // Every record matches the analytic single-lens magnification after
        // truncation.
        for line in lines[1..].iter().filter(|l| !l.is_empty()) {
            let fields: Vec<f64> = line
                .split_whitespace()
                .map(|f| f.parse().expect("numeric field"))
                .collect();
            assert_eq!(fields.len(), 3);
            let u = Point::new(fields[0], fields[1]).norm();
            let expected = (single_lens_mag(u) * 1e4).floor() / 1e4;
            assert!((fields[2] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn verbose_map_appends_image_positions() {
        let lens = Lens::Binary(BinaryLens::new(1.0, 1.0, 0.0).expect("valid lens"));
        let mut buffer = Vec::new();
        write_mag_map(
            &lens,
            &mut buffer,
            Point::new(0.6, 0.6),
            Point::new(1.0, 1.0),
            2,
            MagMapOptions {
                verbose: true,
                precision: 6,
            },
        )
        .expect("map writes");
        let text = String::from_utf8(buffer).expect("utf8 output");
        let record = text
            .lines()
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .expect("at least one record");
        let fields: Vec<&str> = record.split_whitespace().collect();
        // x, y, mag, N, then N image coordinate pairs.
        let n_images: usize = fields[3].parse().expect("image count");
        assert!(matches!(n_images, 3 | 5));
        assert_eq!(fields.len(), 4 + 2 * n_images);
    }
}
