//! Parameter-vector and prior contracts with the enclosing sampler.
//!
//! The sampler owns the parameter space; the lens binds the indices of its
//! named axes once at setup and thereafter decodes flat parameter vectors
//! without string lookups.

use crate::error::LensError;
use crate::frames::Orbit;
use crate::lens::BinaryLens;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default pivot of the remapped mass-ratio coordinate.
pub const DEFAULT_Q_REF: f64 = 1e7;

/// Ordered, named parameter axes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamSpace {
    names: Vec<String>,
}

impl ParamSpace {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Index of a named axis; listing the known axes on a miss.
    pub fn require_index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .with_context(|| {
                format!(
                    "parameter axis '{name}' not found (known axes: {})",
                    self.names.join(", ")
                )
            })
    }
}

/// How the mass-ratio axis is parameterised.
///
/// The remapped coordinate `f = 1/(1 + (q_ref+1)^2/(q+1)^2)` maps
/// `q in (-1, inf)` onto `f in (0, 1)`, giving finite prior mass on
/// arbitrarily large mass ratios.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MassRatioParam {
    Log10,
    Remapped { q_ref: f64 },
}

impl MassRatioParam {
    pub fn remapped() -> Self {
        MassRatioParam::Remapped { q_ref: DEFAULT_Q_REF }
    }

    /// Decode the axis value into the mass ratio `q`.
    pub fn decode(self, value: f64) -> Result<f64> {
        match self {
            MassRatioParam::Log10 => Ok(10f64.powf(value)),
            MassRatioParam::Remapped { q_ref } => {
                if !(value > 0.0 && value < 1.0) {
                    bail!("remapped mass-ratio coordinate must lie in (0,1), got {value}.");
                }
                Ok(-1.0 + (q_ref + 1.0) / (1.0 / value - 1.0).sqrt())
            }
        }
    }

    /// Encode `q` back onto the axis; inverse of [`MassRatioParam::decode`].
    pub fn encode(self, q: f64) -> f64 {
        match self {
            MassRatioParam::Log10 => q.log10(),
            MassRatioParam::Remapped { q_ref } => {
                let r = (q_ref + 1.0) / (q + 1.0);
                1.0 / (1.0 + r * r)
            }
        }
    }

    /// Axis label under the current or the legacy naming scheme.
    pub fn axis_label(self, old_labels: bool) -> &'static str {
        match (self, old_labels) {
            (MassRatioParam::Log10, false) => "log(q)",
            (MassRatioParam::Log10, true) => "logq",
            (MassRatioParam::Remapped { .. }, false) => "f(1+q)",
            (MassRatioParam::Remapped { .. }, true) => "s(1+q)",
        }
    }
}

fn separation_label(old_labels: bool) -> &'static str {
    if old_labels {
        "logL"
    } else {
        "log(s)"
    }
}

/// Prior shape on one axis, handed to the external sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorKind {
    Uniform,
    Gaussian,
    Polar,
}

/// Per-axis prior specification: kind, centre and half-width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisPrior {
    pub name: String,
    pub kind: PriorKind,
    pub center: f64,
    pub half_width: f64,
}

/// Bound axis indices of a binary lens, resolved once at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryBinding {
    pub idx_s: usize,
    pub idx_q: usize,
    pub idx_phi0: usize,
    pub idx_log_rho_star: Option<usize>,
    pub idx_log_chi: Option<usize>,
    pub idx_lona: Option<usize>,
    pub idx_inc: Option<usize>,
}

impl BinaryLens {
    /// Axis names this lens reads, in binding order.
    pub fn axis_names(&self) -> Vec<String> {
        let mut names = vec![
            separation_label(self.use_old_labels).to_string(),
            self.mass_ratio_param.axis_label(self.use_old_labels).to_string(),
            "phi0".to_string(),
        ];
        if self.finite_source.is_some() {
            names.push("log_rho_star".to_string());
        }
        if self.orbit.is_some() {
            names.extend(["log_chi".to_string(), "lona".to_string(), "inc".to_string()]);
        }
        names
    }

    /// Resolve this lens's axis indices against the sampler's space.
    pub fn bind_params(&mut self, space: &ParamSpace) -> Result<()> {
        let idx_s = space.require_index(separation_label(self.use_old_labels))?;
        let idx_q = space.require_index(self.mass_ratio_param.axis_label(self.use_old_labels))?;
        let idx_phi0 = space.require_index("phi0")?;
        let idx_log_rho_star = if self.finite_source.is_some() {
            Some(space.require_index("log_rho_star")?)
        } else {
            None
        };
        let (idx_log_chi, idx_lona, idx_inc) = if self.orbit.is_some() {
            (
                Some(space.require_index("log_chi")?),
                Some(space.require_index("lona")?),
                Some(space.require_index("inc")?),
            )
        } else {
            (None, None, None)
        };
        self.binding = Some(BinaryBinding {
            idx_s,
            idx_q,
            idx_phi0,
            idx_log_rho_star,
            idx_log_chi,
            idx_lona,
            idx_inc,
        });
        Ok(())
    }

    /// Decode a flat parameter vector into lens state.
    ///
    /// Requires [`BinaryLens::bind_params`] to have run after the lens
    /// configuration was final (the builder methods invalidate an earlier
    /// binding, since they change the axis set); the axes are `log10`
    /// separation, the mass-ratio coordinate, `phi0`, and the optional
    /// finite-source and orbit axes.
    pub fn set_state(&mut self, params: &[f64]) -> Result<()> {
        let binding = match self.binding {
            Some(binding) => binding,
            None => return Err(LensError::ConfigMissing.into()),
        };
        let get = |idx: usize| -> Result<f64> {
            params.get(idx).copied().with_context(|| {
                format!(
                    "parameter vector too short: need index {idx}, got {} values",
                    params.len()
                )
            })
        };
        let s = 10f64.powf(get(binding.idx_s)?);
        let q = self.mass_ratio_param.decode(get(binding.idx_q)?)?;
        self.phi0 = get(binding.idx_phi0)?;
        self.q = q;
        self.s = s;
        if let Some(idx) = binding.idx_log_rho_star {
            self.source_radius = Some(10f64.powf(get(idx)?));
        }
        if self.orbit.is_some() {
            // A binding from before the orbit was attached has no orbit axes.
            let (idx_chi, idx_lona, idx_inc) =
                match (binding.idx_log_chi, binding.idx_lona, binding.idx_inc) {
                    (Some(chi), Some(lona), Some(inc)) => (chi, lona, inc),
                    _ => return Err(LensError::ConfigMissing.into()),
                };
            let chi = 10f64.powf(get(idx_chi)?);
            let lona = get(idx_lona)?;
            let inc = get(idx_inc)?;
            self.orbit = Some(Orbit { chi, lona, inc });
        }
        Ok(())
    }

    /// Default prior specification for this lens's axes.
    pub fn default_priors(&self) -> Vec<AxisPrior> {
        let mut priors = vec![
            AxisPrior {
                name: separation_label(self.use_old_labels).to_string(),
                kind: PriorKind::Uniform,
                center: 0.0,
                half_width: 1.0,
            },
            match self.mass_ratio_param {
                MassRatioParam::Log10 => AxisPrior {
                    name: self.mass_ratio_param.axis_label(self.use_old_labels).to_string(),
                    kind: PriorKind::Uniform,
                    center: 0.0,
                    half_width: 4.0,
                },
                MassRatioParam::Remapped { .. } => AxisPrior {
                    name: self.mass_ratio_param.axis_label(self.use_old_labels).to_string(),
                    kind: PriorKind::Uniform,
                    center: 0.5,
                    half_width: 0.5,
                },
            },
            AxisPrior {
                name: "phi0".to_string(),
                kind: PriorKind::Polar,
                center: std::f64::consts::PI,
                half_width: std::f64::consts::PI,
            },
        ];
        if self.finite_source.is_some() {
            priors.push(AxisPrior {
                name: "log_rho_star".to_string(),
                kind: PriorKind::Uniform,
                center: -2.0,
                half_width: 1.5,
            });
        }
        if self.orbit.is_some() {
            priors.push(AxisPrior {
                name: "log_chi".to_string(),
                kind: PriorKind::Uniform,
                center: -1.0,
                half_width: 1.0,
            });
            priors.push(AxisPrior {
                name: "lona".to_string(),
                kind: PriorKind::Polar,
                center: std::f64::consts::PI,
                half_width: std::f64::consts::PI,
            });
            priors.push(AxisPrior {
                name: "inc".to_string(),
                kind: PriorKind::Uniform,
                center: std::f64::consts::FRAC_PI_2,
                half_width: std::f64::consts::FRAC_PI_2,
            });
        }
        priors
    }
}
