//! lbfgs::control — curvature restart protocol.
//!
//! Purpose
//! -------
//! Decide, once per evaluation, whether the refinement target should keep
//! going with the current solver, ask the driver to restart with curvature
//! information, or ask it to restart after freezing parameters whose
//! curvature turned negative.
//!
//! Key behaviors
//! -------------
//! - [`CurvatureController::assess`] consumes the reduced curvature diagonal
//!   of one evaluation and returns a [`CurvatureDecision`]:
//!   - `NotUsingCurvatures`: counts consecutive evaluations whose curvature
//!     is entirely non-negative; any negative entry resets the counter.
//!     Reaching the threshold yields [`StepStatus::RequestCurvatureRestart`].
//!   - `UsingCurvatures`: a curvature with negative entries is either turned
//!     into a freeze request (`fix_params_with_negative_curvature`) or
//!     dropped for this evaluation only.
//! - The status travels back to the solver as a plain value; nothing in
//!   this module unwinds or raises.
//!
//! Invariants & assumptions
//! ------------------------
//! - The counter only grows in `NotUsingCurvatures` mode and is reset by
//!   [`CurvatureController::switch_to_curvatures`].
//! - A returned diagonal is always entirely non-negative.
use crate::optimization::lbfgs::types::Curv;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status attached to every evaluation of a refinement target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Continue,
    RequestCurvatureRestart,
    RequestParameterFreezeRestart,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Continue => write!(f, "continue"),
            StepStatus::RequestCurvatureRestart => write!(f, "restart with curvatures"),
            StepStatus::RequestParameterFreezeRestart => {
                write!(f, "restart after freezing negative-curvature parameters")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurvatureMode {
    NotUsingCurvatures,
    UsingCurvatures,
}

/// Outcome of [`CurvatureController::assess`].
///
/// - `status`: what the solver should do next.
/// - `diag`: curvature diagonal usable as a preconditioner, if any.
/// - `negative`: optimizer indices whose curvature was negative; only
///   populated when `status` is `RequestParameterFreezeRestart`.
#[derive(Debug, Clone, PartialEq)]
pub struct CurvatureDecision {
    pub status: StepStatus,
    pub diag: Option<Curv>,
    pub negative: Vec<usize>,
}

impl CurvatureDecision {
    fn proceed(diag: Option<Curv>) -> Self {
        Self { status: StepStatus::Continue, diag, negative: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurvatureController {
    mode: CurvatureMode,
    threshold: usize,
    consecutive_positive: usize,
    freeze_negative: bool,
}

impl CurvatureController {
    pub fn new(mode: CurvatureMode, threshold: usize, freeze_negative: bool) -> Self {
        Self { mode, threshold, consecutive_positive: 0, freeze_negative }
    }

    pub fn mode(&self) -> CurvatureMode {
        self.mode
    }

    pub fn is_using_curvatures(&self) -> bool {
        self.mode == CurvatureMode::UsingCurvatures
    }

    pub fn consecutive_positive(&self) -> usize {
        self.consecutive_positive
    }

    /// Enter curvature mode after a `RequestCurvatureRestart`.
    pub fn switch_to_curvatures(&mut self) {
        self.mode = CurvatureMode::UsingCurvatures;
        self.consecutive_positive = 0;
    }

    /// Classify the curvature of one evaluation.
    ///
    /// Parameters
    /// ----------
    /// - `curv`: reduced curvature diagonal in optimizer coordinates, or
    ///   `None` when curvatures are not being computed.
    ///
    /// Returns
    /// -------
    /// A [`CurvatureDecision`]. With `curv = None` the status is always
    /// `Continue` and no diagonal is returned.
    pub fn assess(&mut self, curv: Option<Curv>) -> CurvatureDecision {
        let Some(curv) = curv else {
            return CurvatureDecision::proceed(None);
        };
        let negative: Vec<usize> =
            curv.iter().enumerate().filter(|(_, c)| **c < 0.0).map(|(i, _)| i).collect();

        match self.mode {
            CurvatureMode::NotUsingCurvatures => {
                if !negative.is_empty() {
                    self.consecutive_positive = 0;
                    return CurvatureDecision::proceed(None);
                }
                self.consecutive_positive += 1;
                if self.threshold > 0 && self.consecutive_positive >= self.threshold {
                    log::info!(
                        "curvature non-negative for {} consecutive evaluations, requesting restart",
                        self.consecutive_positive
                    );
                    return CurvatureDecision {
                        status: StepStatus::RequestCurvatureRestart,
                        diag: Some(curv),
                        negative: Vec::new(),
                    };
                }
                CurvatureDecision::proceed(Some(curv))
            }
            CurvatureMode::UsingCurvatures => {
                if negative.is_empty() {
                    return CurvatureDecision::proceed(Some(curv));
                }
                if self.freeze_negative {
                    log::warn!(
                        "{} parameters have negative curvature, freezing them",
                        negative.len()
                    );
                    return CurvatureDecision {
                        status: StepStatus::RequestParameterFreezeRestart,
                        diag: None,
                        negative,
                    };
                }
                log::warn!(
                    "{} parameters have negative curvature, dropping curvature for this step",
                    negative.len()
                );
                CurvatureDecision::proceed(None)
            }
        }
    }
}
