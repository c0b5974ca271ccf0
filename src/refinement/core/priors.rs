//! Gaussian restraints on physical parameter values.
//!
//! A prior adds `(θ − μ)²/(2σ²)` to the functional, where `θ` is the
//! physical value of a parameter whose internal value is `x`. Gradient and
//! curvature are taken with respect to `x` via the chain factors of the
//! parameter's [`Reparam`](crate::refinement::core::reparam::Reparam).
use crate::refinement::errors::{RefineError, RefineResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianPrior {
    pub mean: f64,
    pub sigma: f64,
}

/// Contribution of one prior to functional, gradient and curvature.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PriorTerm {
    pub functional: f64,
    pub gradient: f64,
    pub curvature: f64,
}

impl GaussianPrior {
    pub fn new(mean: f64, sigma: f64) -> RefineResult<Self> {
        if !(sigma.is_finite() && sigma > 0.0) || !mean.is_finite() {
            return Err(RefineError::InvalidSigma { class: "prior", value: sigma });
        }
        Ok(Self { mean, sigma })
    }

    /// Evaluate at physical value `theta` with chain factors `(f1, f2)`.
    pub fn term(&self, theta: f64, f1: f64, f2: f64) -> PriorTerm {
        let var = self.sigma * self.sigma;
        let delta = theta - self.mean;
        PriorTerm {
            functional: delta * delta / (2.0 * var),
            gradient: delta / var * f1,
            curvature: f1 * f1 / var + delta / var * f2,
        }
    }
}

/// Restraints applied once per shot.
///
/// - `unit_cell`: one prior per free cell variable, in cell-manager order.
/// - `rotation_sigmas`: zero-mean priors on the three misset angles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PriorOptions {
    pub unit_cell: Option<Vec<GaussianPrior>>,
    pub rotation_sigmas: Option<[f64; 3]>,
}

impl PriorOptions {
    pub fn rotation_priors(&self) -> RefineResult<Option<[GaussianPrior; 3]>> {
        match self.rotation_sigmas {
            None => Ok(None),
            Some([sx, sy, sz]) => Ok(Some([
                GaussianPrior::new(0.0, sx)?,
                GaussianPrior::new(0.0, sy)?,
                GaussianPrior::new(0.0, sz)?,
            ])),
        }
    }

    pub fn validate(&self) -> RefineResult<()> {
        if let Some(priors) = &self.unit_cell {
            for prior in priors {
                GaussianPrior::new(prior.mean, prior.sigma)?;
            }
        }
        self.rotation_priors().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    // Purpose
    // -------
    // The prior term follows the closed form and its chain rule.
    //
    // Given
    // -----
    // - μ = 10, σ = 2, θ = 13, f1 = 0.5, f2 = 0.1.
    //
    // Expect
    // ------
    // - f = 9/8; g = 3/4·0.5; c = 0.25/4 + 3/4·0.1.
    fn term_matches_closed_form() {
        // Arrange
        let prior = GaussianPrior::new(10.0, 2.0).expect("valid prior");

        // Act
        let term = prior.term(13.0, 0.5, 0.1);

        // Assert
        assert!((term.functional - 9.0 / 8.0).abs() < 1e-12);
        assert!((term.gradient - 0.375).abs() < 1e-12);
        assert!((term.curvature - (0.0625 + 0.075)).abs() < 1e-12);
    }

    #[test]
    // Purpose
    // -------
    // Non-positive sigmas are rejected.
    //
    // Given
    // -----
    // - Rotation sigmas [0.1, 0.0, 0.1].
    //
    // Expect
    // ------
    // - `Err(InvalidSigma)`.
    fn rotation_priors_reject_zero_sigma() {
        // Arrange
        let opts = PriorOptions { unit_cell: None, rotation_sigmas: Some([0.1, 0.0, 0.1]) };

        // Act / Assert
        assert!(matches!(opts.validate(), Err(RefineError::InvalidSigma { .. })));
    }
}
