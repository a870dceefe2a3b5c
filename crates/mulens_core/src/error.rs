//! Typed status kinds surfaced on individual trajectory samples.
//!
//! These never drive ambient control flow: a failed sample is recorded with
//! its status and the sweep continues. Fallible setup and configuration APIs
//! use `anyhow::Result` instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numerical failure kinds of the lens engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LensError {
    /// A queried point coincides with a lens position, or finite-source
    /// refinement exhausted its polygon budget.
    #[error("degenerate configuration (point at a lens, or refinement budget exhausted)")]
    Degenerate,
    /// The polynomial solver returned roots but none satisfied the lens
    /// equation within tolerance.
    #[error("no polynomial root satisfied the lens equation within tolerance")]
    RootFilterFailure,
    /// The tracker could not carry image identity across a step; identity
    /// was reset and the step marked as a seam.
    #[error("image identity lost across a step")]
    OrderingLost,
    /// A parameter-bound operation was invoked before the binding was set.
    #[error("operation invoked before parameter binding was configured")]
    ConfigMissing,
    /// A jacobian determinant fell below the precision floor; the
    /// magnification was capped.
    #[error("jacobian determinant below precision floor, magnification capped")]
    PrecisionLoss,
}

/// Outcome of one sample (or one finite-source evaluation).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleStatus {
    #[default]
    Ok,
    Flagged(LensError),
}

impl SampleStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, SampleStatus::Ok)
    }

    /// Keep the first flag raised; later flags do not overwrite it.
    pub fn flag(&mut self, error: LensError) {
        if self.is_ok() {
            *self = SampleStatus::Flagged(error);
        }
    }
}
