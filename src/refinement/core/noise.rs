//! refinement::core::noise — pixel likelihoods and the expected-count model.
//!
//! Purpose
//! -------
//! Turn the expected photon counts `Λ` of one spot and its observed pixels
//! `I` into the spot's contribution to the negative log-likelihood, plus
//! per-pixel weights that contract derivative images into gradient and
//! curvature entries.
//!
//! Key behaviors
//! -------------
//! - [`NoiseModel::Poisson`]: `f = Σ(Λ − I·ln Λ)`.
//! - [`NoiseModel::Gaussian`]: readout-noise model with variance
//!   `v = Λ + σr²`, `f = ½Σ(ln 2π + ln v + (I − Λ)²/v)`.
//! - Non-positive `Λ` (or `v`) is floored at [`LAMBDA_FLOOR`] wherever it
//!   enters `ln` or a reciprocal, and the spot is flagged as kludged.
//! - [`LambdaAssembly`] fixes how gain, background and Bragg model combine
//!   into `Λ`, and the gain derivative that goes with it.
//!
//! Conventions
//! -----------
//! - For a derivative image `d = ∂Λ/∂x` and second derivative `d2`, the
//!   gradient entry is `Σ w_g·d` and the curvature entry is
//!   `Σ (w_g·d2 + w_c·d²)`; see [`SpotStatistics`].
use crate::optimization::numerical_stability::{LAMBDA_FLOOR, floored};
use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Readout noise (ADU) used by [`NoiseModel::gaussian`].
pub const DEFAULT_SIGMA_READOUT: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseModel {
    #[default]
    Poisson,
    Gaussian { sigma_readout: f64 },
}

impl NoiseModel {
    pub fn gaussian() -> Self {
        NoiseModel::Gaussian { sigma_readout: DEFAULT_SIGMA_READOUT }
    }

    /// Likelihood of one spot.
    ///
    /// `lambda` and `observed` must have equal length.
    pub fn evaluate(&self, lambda: &Array1<f64>, observed: &Array1<f64>) -> SpotStatistics {
        let n = lambda.len();
        let mut functional = 0.0;
        let mut kludged = false;
        let mut grad_weight = Array1::zeros(n);
        let mut curv_weight = Array1::zeros(n);

        match *self {
            NoiseModel::Poisson => {
                Zip::from(&mut grad_weight).and(&mut curv_weight).and(lambda).and(observed).for_each(
                    |wg, wc, &lam, &obs| {
                        let (lam, hit) = floored(lam, LAMBDA_FLOOR);
                        kludged |= hit;
                        functional += lam - obs * lam.ln();
                        *wg = 1.0 - obs / lam;
                        *wc = obs / (lam * lam);
                    },
                );
            }
            NoiseModel::Gaussian { sigma_readout } => {
                let readout_var = sigma_readout * sigma_readout;
                let ln_two_pi = (2.0 * PI).ln();
                Zip::from(&mut grad_weight).and(&mut curv_weight).and(lambda).and(observed).for_each(
                    |wg, wc, &lam, &obs| {
                        let (v, hit) = floored(lam + readout_var, LAMBDA_FLOOR);
                        kludged |= hit;
                        let u = obs - lam;
                        let u_v = u / v;
                        let a = 1.0 - 2.0 * u - u * u_v;
                        functional += 0.5 * (ln_two_pi + v.ln() + u * u_v);
                        *wg = 0.5 * a / v;
                        *wc = -0.5 / v * (a / v - (2.0 + 2.0 * u_v + u_v * u_v));
                    },
                );
            }
        }

        SpotStatistics { functional, grad_weight, curv_weight, kludged }
    }
}

/// Likelihood of one spot with its contraction weights.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotStatistics {
    pub functional: f64,
    grad_weight: Array1<f64>,
    curv_weight: Array1<f64>,
    /// At least one pixel hit the `Λ` floor.
    pub kludged: bool,
}

impl SpotStatistics {
    /// `Σ w_g·d`
    pub fn gradient(&self, d: &Array1<f64>) -> f64 {
        self.grad_weight.dot(d)
    }

    /// `Σ (w_g·d2 + w_c·d²)`
    pub fn curvature(&self, d: &Array1<f64>, d2: &Array1<f64>) -> f64 {
        let squared =
            Zip::from(&self.curv_weight).and(d).fold(0.0, |acc, &w, &di| acc + w * di * di);
        self.grad_weight.dot(d2) + squared
    }
}

/// How gain `G`, background tilt and Bragg model `s·M` combine into `Λ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LambdaAssembly {
    /// `Λ = G²·(tilt + s·M)`
    #[default]
    GainScalesBackground,
    /// `Λ = tilt + G²·s·M`
    GainScalesSpotsOnly,
}

impl LambdaAssembly {
    pub fn lambda(&self, gain: f64, tilt: &Array1<f64>, bragg: &Array1<f64>) -> Array1<f64> {
        let g2 = gain * gain;
        match self {
            LambdaAssembly::GainScalesBackground => (tilt + bragg) * g2,
            LambdaAssembly::GainScalesSpotsOnly => tilt + &(bragg * g2),
        }
    }

    /// Factor multiplying derivatives of the Bragg model.
    pub fn bragg_factor(&self, gain: f64) -> f64 {
        gain * gain
    }

    /// Factor multiplying derivatives of the background tilt.
    pub fn background_factor(&self, gain: f64) -> f64 {
        match self {
            LambdaAssembly::GainScalesBackground => gain * gain,
            LambdaAssembly::GainScalesSpotsOnly => 1.0,
        }
    }

    /// First and second derivative of `Λ` with respect to `G`.
    pub fn gain_derivatives(
        &self, gain: f64, tilt: &Array1<f64>, bragg: &Array1<f64>,
    ) -> (Array1<f64>, Array1<f64>) {
        let scaled = match self {
            LambdaAssembly::GainScalesBackground => tilt + bragg,
            LambdaAssembly::GainScalesSpotsOnly => bragg.clone(),
        };
        let d = &scaled * (2.0 * gain);
        let d2 = scaled * 2.0;
        (d, d2)
    }
}
