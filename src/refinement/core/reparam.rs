//! refinement::core::reparam — internal ↔ physical parameter maps.
//!
//! Purpose
//! -------
//! The optimizer works on dimensionless internal values `x` that start at
//! `1` when rescaling is on. Each parameter class maps `x` to its physical
//! value `θ` through a [`Reparam`], which also supplies the chain factors
//! `(dθ/dx, d²θ/dx²)` needed to turn simulator derivatives into gradient
//! and curvature contributions.
//!
//! Key behaviors
//! -------------
//! - [`Reparam::physical`] / [`Reparam::internal`] are mutually inverse on
//!   the map's range (the bounded class takes the branch nearest `x = 1`).
//! - [`Reparam::factors`] returns `(f1, f2)` such that, for a pixel model
//!   derivative `dI` and second derivative `d2I` with respect to `θ`,
//!   `d = f1·dI` and `d2 = f1²·d2I + f2·dI`.
//! - [`Reparam::validate`] rejects sigmas, ranges and inits the map cannot
//!   represent.
//!
//! Invariants & assumptions
//! ------------------------
//! - Every rescaled variant reproduces `init` exactly at `x = 1`.
//! - `Identity` and `Exp` are used when rescaling is disabled.
use crate::optimization::numerical_stability::{bounded_sin, bounded_sin_inverse, bounded_sin_phase};
use crate::refinement::errors::{RefineError, RefineResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Offset of the mosaic-size map: block sizes never drop below three cells.
pub const NCELLS_OFFSET: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Reparam {
    /// `θ = σ(x − 1) + init`
    Additive { sigma: f64, init: f64 },
    /// `θ = exp(σ(x − 1))·init`
    Log { sigma: f64, init: f64 },
    /// `θ = exp(σ(x − 1))·(init − offset) + offset`
    LogOffset { sigma: f64, init: f64, offset: f64 },
    /// `θ = (sin(σ(x − 1) + asin(2(init − low)/(high − low) − 1)) + 1)(high − low)/2 + low`
    BoundedSin { sigma: f64, init: f64, low: f64, high: f64 },
    /// `θ = x`
    Identity,
    /// `θ = exp(x) + offset`
    Exp { offset: f64 },
}

impl Reparam {
    pub fn physical(&self, x: f64) -> f64 {
        match *self {
            Reparam::Additive { sigma, init } => sigma * (x - 1.0) + init,
            Reparam::Log { sigma, init } => (sigma * (x - 1.0)).exp() * init,
            Reparam::LogOffset { sigma, init, offset } => {
                (sigma * (x - 1.0)).exp() * (init - offset) + offset
            }
            Reparam::BoundedSin { sigma, init, low, high } => bounded_sin(x, sigma, init, low, high),
            Reparam::Identity => x,
            Reparam::Exp { offset } => x.exp() + offset,
        }
    }

    pub fn internal(&self, theta: f64) -> f64 {
        match *self {
            Reparam::Additive { sigma, init } => (theta - init) / sigma + 1.0,
            Reparam::Log { sigma, init } => (theta / init).ln() / sigma + 1.0,
            Reparam::LogOffset { sigma, init, offset } => {
                ((theta - offset) / (init - offset)).ln() / sigma + 1.0
            }
            Reparam::BoundedSin { sigma, init, low, high } => {
                bounded_sin_inverse(theta, sigma, init, low, high)
            }
            Reparam::Identity => theta,
            Reparam::Exp { offset } => (theta - offset).ln(),
        }
    }

    /// Chain factors `(dθ/dx, d²θ/dx²)` at internal value `x`.
    pub fn factors(&self, x: f64) -> (f64, f64) {
        match *self {
            Reparam::Additive { sigma, .. } => (sigma, 0.0),
            Reparam::Log { sigma, .. } => {
                let theta = self.physical(x);
                (sigma * theta, sigma * sigma * theta)
            }
            Reparam::LogOffset { sigma, offset, .. } => {
                let shifted = self.physical(x) - offset;
                (sigma * shifted, sigma * sigma * shifted)
            }
            Reparam::BoundedSin { sigma, init, low, high } => {
                let phase = bounded_sin_phase(x, sigma, init, low, high);
                let half = (high - low) / 2.0;
                (half * phase.cos() * sigma, -half * phase.sin() * sigma * sigma)
            }
            Reparam::Identity => (1.0, 0.0),
            Reparam::Exp { offset } => {
                let shifted = self.physical(x) - offset;
                (shifted, shifted)
            }
        }
    }

    /// Check that the map is well defined for `class`.
    ///
    /// # Errors
    /// - [`RefineError::InvalidSigma`] for non-positive or non-finite sigma.
    /// - [`RefineError::InvalidRange`] when `low >= high`.
    /// - [`RefineError::InitOutsideRange`] for bounded inits outside the range.
    /// - [`RefineError::InvalidInit`] when a log map would take `ln` of a
    ///   non-positive number.
    pub fn validate(&self, class: ParameterClass) -> RefineResult<()> {
        let label = class.label();
        let check_sigma = |sigma: f64| {
            if sigma.is_finite() && sigma > 0.0 {
                Ok(())
            } else {
                Err(RefineError::InvalidSigma { class: label, value: sigma })
            }
        };
        match *self {
            Reparam::Additive { sigma, .. } => check_sigma(sigma),
            Reparam::Log { sigma, init } => {
                check_sigma(sigma)?;
                if !(init.is_finite() && init > 0.0) {
                    return Err(RefineError::InvalidInit {
                        class: label,
                        value: init,
                        reason: "log parameterization needs a positive initial value",
                    });
                }
                Ok(())
            }
            Reparam::LogOffset { sigma, init, offset } => {
                check_sigma(sigma)?;
                if !(init.is_finite() && init > offset) {
                    return Err(RefineError::InvalidInit {
                        class: label,
                        value: init,
                        reason: "initial value must exceed the parameterization offset",
                    });
                }
                Ok(())
            }
            Reparam::BoundedSin { sigma, init, low, high } => {
                check_sigma(sigma)?;
                if !(low.is_finite() && high.is_finite() && low < high) {
                    return Err(RefineError::InvalidRange { class: label, low, high });
                }
                if init < low || init > high {
                    return Err(RefineError::InitOutsideRange { class: label, init, low, high });
                }
                Ok(())
            }
            Reparam::Identity => Ok(()),
            Reparam::Exp { offset } => {
                if offset.is_finite() {
                    Ok(())
                } else {
                    Err(RefineError::InvalidInit {
                        class: label,
                        value: offset,
                        reason: "offset must be finite",
                    })
                }
            }
        }
    }
}

/// Physical parameter classes of the refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParameterClass {
    Background,
    BackgroundCoefficient,
    Rotation,
    UnitCell,
    Ncells,
    OriginZ,
    Scale,
    Fcell,
    Spectra,
    PanelRotation,
    PanelXY,
    Gain,
}

impl ParameterClass {
    pub fn label(self) -> &'static str {
        match self {
            ParameterClass::Background => "background",
            ParameterClass::BackgroundCoefficient => "background_coefficient",
            ParameterClass::Rotation => "rotation",
            ParameterClass::UnitCell => "unit_cell",
            ParameterClass::Ncells => "ncells",
            ParameterClass::OriginZ => "origin_z",
            ParameterClass::Scale => "scale",
            ParameterClass::Fcell => "fcell",
            ParameterClass::Spectra => "spectra",
            ParameterClass::PanelRotation => "panel_rotation",
            ParameterClass::PanelXY => "panel_xy",
            ParameterClass::Gain => "gain",
        }
    }
}

impl fmt::Display for ParameterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
