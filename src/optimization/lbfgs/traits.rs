//! Public API surface for refinement optimization.
//!
//! - [`RefinementTarget`]: pull-model contract a refiner implements.
//! - [`Evaluation`]: what one evaluation of the target returns.
//! - [`SolverOptions`], [`Tolerances`], [`LineSearchParams`],
//!   [`DropConvergence`]: solver configuration.
//! - [`LineSearcher`]: line search used by the gradient-only backend.
//! - [`RefineOutcome`] and [`Termination`]: normalized result of `minimize`.
//!
//! Convention: the functional is *minimized* as is. Gradients and curvature
//! diagonals are taken with respect to the optimizer vector `x`, never the
//! physical parameters.
use crate::optimization::{
    errors::{OptError, OptResult},
    lbfgs::{
        control::StepStatus,
        types::{Cost, Curv, FnEvalMap, Grad, Theta},
        validation::{
            validate_theta_hat, validate_value, verify_step_bounds, verify_tol_cost,
            verify_trad_conv_eps,
        },
    },
};
use argmin::core::{TerminationReason, TerminationStatus};
use argmin_math::ArgminL2Norm;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Result of one evaluation of a [`RefinementTarget`].
///
/// - `f`: functional at the current `x`.
/// - `g`: gradient with respect to `x`.
/// - `d`: curvature diagonal usable as a preconditioner, when available.
/// - `status`: restart protocol signal for the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub f: Cost,
    pub g: Grad,
    pub d: Option<Curv>,
    pub status: StepStatus,
}

/// Pull-model optimization target.
///
/// The solver positions the target with [`set_x`](RefinementTarget::set_x)
/// and then asks it for the functional and its derivatives at that point.
/// Every evaluation counts as one call.
///
/// Required:
/// - `n`: number of free parameters (length of `x`).
/// - `x`: current optimizer vector.
/// - `set_x`: move the target to a new optimizer vector.
/// - `compute_functional_and_gradients`: `(f, g)` plus status.
/// - `calls`: number of evaluations performed so far.
/// - `functional`: most recent functional value, if any.
///
/// Optional:
/// - `compute_functional_gradients_diag`: `(f, g, d)` plus status. Targets
///   that never produce curvatures can rely on the default.
pub trait RefinementTarget {
    fn n(&self) -> usize;
    fn x(&self) -> &Theta;
    fn set_x(&mut self, x: &Theta) -> OptResult<()>;
    fn compute_functional_and_gradients(&mut self) -> OptResult<Evaluation>;
    fn calls(&self) -> usize;
    fn functional(&self) -> Option<Cost>;

    fn compute_functional_gradients_diag(&mut self) -> OptResult<Evaluation> {
        self.compute_functional_and_gradients()
    }
}

/// Choice of line search used inside the argmin L-BFGS solver.
///
/// Parsing accepts case-insensitive `"MoreThuente"` and `"HagerZhang"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineSearcher {
    MoreThuente,
    HagerZhang,
}

impl FromStr for LineSearcher {
    type Err = OptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "morethuente" => Ok(LineSearcher::MoreThuente),
            "hagerzhang" => Ok(LineSearcher::HagerZhang),
            _ => Err(OptError::InvalidLineSearch {
                name: s.to_string(),
                reason: "Valid options are case insensitive 'MoreThuente' or 'HagerZhang'.",
            }),
        }
    }
}

/// Convergence tolerances and iteration limits.
///
/// - `trad_conv_eps`: converge when `‖g‖ ≤ trad_conv_eps · max(1, ‖x‖)`.
/// - `tol_cost`: optional cost-change tolerance for the argmin backend.
/// - `max_iter`: optional cap on solver iterations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    pub trad_conv_eps: f64,
    pub tol_cost: Option<f64>,
    pub max_iter: Option<usize>,
}

impl Tolerances {
    /// Construct validated tolerances.
    ///
    /// # Errors
    /// - [`OptError::InvalidTradConvEps`] / [`OptError::InvalidTolCost`] for
    ///   non-finite or non-positive tolerances.
    /// - [`OptError::InvalidMaxIter`] if `max_iter == Some(0)`.
    pub fn new(trad_conv_eps: f64, tol_cost: Option<f64>, max_iter: Option<usize>) -> OptResult<Self> {
        verify_trad_conv_eps(trad_conv_eps)?;
        verify_tol_cost(tol_cost)?;
        if let Some(max_iter) = max_iter {
            if max_iter == 0 {
                return Err(OptError::InvalidMaxIter {
                    max_iter,
                    reason: "Maximum iterations must be greater than zero.",
                });
            }
        }
        Ok(Self { trad_conv_eps, tol_cost, max_iter })
    }
}

impl Default for Tolerances {
    fn default() -> Self {
        Self { trad_conv_eps: 0.05, tol_cost: None, max_iter: None }
    }
}

/// Backtracking line-search limits for the curvature-aided backend.
///
/// - `maxfev`: evaluations allowed per line search.
/// - `stpmin`, `stpmax`: step length bounds.
/// - `ftol`: sufficient decrease constant of the Armijo condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineSearchParams {
    pub maxfev: usize,
    pub stpmin: f64,
    pub stpmax: f64,
    pub ftol: f64,
}

impl LineSearchParams {
    pub fn new(maxfev: usize, stpmin: f64, stpmax: f64, ftol: f64) -> OptResult<Self> {
        if maxfev == 0 {
            return Err(OptError::InvalidMaxFev { maxfev });
        }
        verify_step_bounds(stpmin, stpmax)?;
        if !(ftol > 0.0 && ftol < 1.0) {
            return Err(OptError::InvalidFtol { ftol });
        }
        Ok(Self { maxfev, stpmin, stpmax, ftol })
    }
}

impl Default for LineSearchParams {
    fn default() -> Self {
        Self { maxfev: 20, stpmin: 1e-20, stpmax: 1e20, ftol: 1e-4 }
    }
}

/// Stop when the functional stops dropping.
///
/// A least-squares line is fitted through the last `n_test_points`
/// functional values; the run is converged once the relative drop per
/// iteration falls to `max_drop_eps` or below.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropConvergence {
    pub n_test_points: usize,
    pub max_drop_eps: f64,
}

impl DropConvergence {
    pub fn new(n_test_points: usize, max_drop_eps: f64) -> OptResult<Self> {
        if n_test_points < 2 {
            return Err(OptError::InvalidDropConvergence {
                n_test_points,
                max_drop_eps,
                reason: "At least two test points are needed to fit a slope.",
            });
        }
        if !max_drop_eps.is_finite() || max_drop_eps <= 0.0 {
            return Err(OptError::InvalidDropConvergence {
                n_test_points,
                max_drop_eps,
                reason: "max_drop_eps must be positive and finite.",
            });
        }
        Ok(Self { n_test_points, max_drop_eps })
    }

    /// Whether the tail of `history` has flattened out.
    pub fn is_converged(&self, history: &[f64]) -> bool {
        if history.len() < self.n_test_points {
            return false;
        }
        let tail = &history[history.len() - self.n_test_points..];
        let n = tail.len() as f64;
        let mean_t = (n - 1.0) / 2.0;
        let mean_f = tail.iter().sum::<f64>() / n;
        let (mut sxy, mut sxx) = (0.0, 0.0);
        for (i, f) in tail.iter().enumerate() {
            let dt = i as f64 - mean_t;
            sxy += dt * (f - mean_f);
            sxx += dt * dt;
        }
        let slope = sxy / sxx;
        let scale = tail[tail.len() - 1].abs().max(f64::MIN_POSITIVE);
        -slope / scale <= self.max_drop_eps
    }
}

impl Default for DropConvergence {
    fn default() -> Self {
        Self { n_test_points: 5, max_drop_eps: 1e-5 }
    }
}

/// Solver-level configuration.
///
/// - `tols`: convergence tolerances and iteration cap.
/// - `line_searcher`: line search of the gradient-only backend.
/// - `line_search`: backtracking limits of the curvature-aided backend.
/// - `drop_convergence`: optional flattening test (curvature-aided backend).
/// - `lbfgs_mem`: history size; `None` uses [`DEFAULT_LBFGS_MEM`](crate::optimization::lbfgs::types::DEFAULT_LBFGS_MEM).
/// - `max_calls`: hard cap on the target's evaluations, counted across restarts.
/// - `use_curvatures`: select the curvature-aided backend.
/// - `verbose`: attach the slog observer (behind `obs_slog`) and log progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub tols: Tolerances,
    pub line_searcher: LineSearcher,
    pub line_search: LineSearchParams,
    pub drop_convergence: Option<DropConvergence>,
    pub lbfgs_mem: Option<usize>,
    pub max_calls: usize,
    pub use_curvatures: bool,
    pub verbose: bool,
}

impl SolverOptions {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tols: Tolerances, line_searcher: LineSearcher, line_search: LineSearchParams,
        drop_convergence: Option<DropConvergence>, lbfgs_mem: Option<usize>, max_calls: usize,
        use_curvatures: bool, verbose: bool,
    ) -> OptResult<Self> {
        if let Some(m) = lbfgs_mem {
            if m == 0 {
                return Err(OptError::InvalidLBFGSMem {
                    mem: m,
                    reason: "L-BFGS memory must be greater than zero.",
                });
            }
        }
        if max_calls == 0 {
            return Err(OptError::InvalidMaxCalls {
                max_calls,
                reason: "Maximum calls must be greater than zero.",
            });
        }
        Ok(Self {
            tols,
            line_searcher,
            line_search,
            drop_convergence,
            lbfgs_mem,
            max_calls,
            use_curvatures,
            verbose,
        })
    }

    /// Copy of these options with the backend switched.
    pub fn with_curvatures(&self, use_curvatures: bool) -> Self {
        Self { use_curvatures, ..self.clone() }
    }
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tols: Tolerances::default(),
            line_searcher: LineSearcher::MoreThuente,
            line_search: LineSearchParams::default(),
            drop_convergence: Some(DropConvergence::default()),
            lbfgs_mem: None,
            max_calls: 100_000,
            use_curvatures: false,
            verbose: false,
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    NotTerminated,
    Converged,
    DropConverged,
    MaxIterations,
    MaxCalls,
    LineSearchFailed,
    Restart(StepStatus),
    Backend(String),
}

impl Termination {
    pub fn from_argmin(status: &TerminationStatus) -> Self {
        match status {
            TerminationStatus::NotTerminated => Termination::NotTerminated,
            TerminationStatus::Terminated(TerminationReason::MaxItersReached) => {
                Termination::MaxIterations
            }
            TerminationStatus::Terminated(TerminationReason::SolverConverged) => {
                Termination::Converged
            }
            TerminationStatus::Terminated(reason) => Termination::Backend(format!("{reason:?}")),
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Termination::Converged | Termination::DropConverged)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::NotTerminated => write!(f, "Not terminated"),
            Termination::Converged => write!(f, "Converged"),
            Termination::DropConverged => write!(f, "Converged (functional stopped dropping)"),
            Termination::MaxIterations => write!(f, "Maximum iterations reached"),
            Termination::MaxCalls => write!(f, "Maximum calls reached"),
            Termination::LineSearchFailed => write!(f, "Line search failed"),
            Termination::Restart(status) => write!(f, "Interrupted: {status}"),
            Termination::Backend(reason) => write!(f, "{reason}"),
        }
    }
}

/// Canonical result returned by `minimize`.
///
/// - `x_hat`: final optimizer vector (best point, or the point at which a
///   restart was requested).
/// - `value`: functional at `x_hat`.
/// - `converged`: `true` only for genuine convergence.
/// - `termination` / `status`: why the run stopped.
/// - `iterations`: solver iterations performed.
/// - `fn_evals`: evaluation counters.
/// - `grad_norm`: norm of the last available gradient.
/// - `hit_restart`: the target requested a restart; the caller re-invokes
///   the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct RefineOutcome {
    pub x_hat: Theta,
    pub value: f64,
    pub converged: bool,
    pub termination: Termination,
    pub status: String,
    pub iterations: usize,
    pub fn_evals: FnEvalMap,
    pub grad_norm: Option<f64>,
    pub hit_restart: bool,
}

impl RefineOutcome {
    /// Build a validated [`RefineOutcome`].
    ///
    /// # Errors
    /// Propagates validation errors for `x_hat_opt` or `value`.
    pub fn new(
        x_hat_opt: Option<Theta>, value: f64, termination: Termination, iterations: u64,
        fn_evals: FnEvalMap, grad: Option<Grad>,
    ) -> OptResult<Self> {
        let x_hat = validate_theta_hat(x_hat_opt)?;
        validate_value(value)?;
        let converged = termination.is_converged();
        let hit_restart = matches!(termination, Termination::Restart(_));
        let status = termination.to_string();
        let grad_norm = grad.map(|g| g.l2_norm());
        Ok(Self {
            x_hat,
            value,
            converged,
            termination,
            status,
            iterations: iterations as usize,
            fn_evals,
            grad_norm,
            hit_restart,
        })
    }

    /// Restart status carried by this outcome, if any.
    pub fn restart_status(&self) -> Option<StepStatus> {
        match self.termination {
            Termination::Restart(status) => Some(status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // Configuration validation, line searcher parsing, the drop-convergence
    // test and outcome construction.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // `LineSearcher::from_str` is case-insensitive and rejects unknown names.
    //
    // Given
    // -----
    // - "hagerzhang", "MORETHUENTE", "backtracking".
    //
    // Expect
    // ------
    // - The first two parse, the last returns `InvalidLineSearch`.
    fn line_searcher_parses_case_insensitive_names() {
        // Arrange / Act / Assert
        assert_eq!("hagerzhang".parse::<LineSearcher>(), Ok(LineSearcher::HagerZhang));
        assert_eq!("MORETHUENTE".parse::<LineSearcher>(), Ok(LineSearcher::MoreThuente));
        assert!(matches!(
            "backtracking".parse::<LineSearcher>(),
            Err(OptError::InvalidLineSearch { .. })
        ));
    }

    #[test]
    // Purpose
    // -------
    // Defaults carry the documented solver constants.
    //
    // Given
    // -----
    // - `SolverOptions::default()`.
    //
    // Expect
    // ------
    // - maxfev 20, stpmin 1e-20, stpmax 1e20, eps 0.05, max_calls 100000,
    //   drop eps 1e-5.
    fn solver_options_default_matches_documented_constants() {
        // Arrange / Act
        let opts = SolverOptions::default();

        // Assert
        assert_eq!(opts.line_search.maxfev, 20);
        assert_eq!(opts.line_search.stpmin, 1e-20);
        assert_eq!(opts.line_search.stpmax, 1e20);
        assert_eq!(opts.tols.trad_conv_eps, 0.05);
        assert_eq!(opts.max_calls, 100_000);
        assert_eq!(opts.drop_convergence.map(|d| d.max_drop_eps), Some(1e-5));
    }

    #[test]
    // Purpose
    // -------
    // Zero memory and zero max_calls are rejected.
    //
    // Given
    // -----
    // - `lbfgs_mem = Some(0)`, then `max_calls = 0`.
    //
    // Expect
    // ------
    // - `InvalidLBFGSMem` and `InvalidMaxCalls`.
    fn solver_options_new_rejects_zero_memory_and_calls() {
        // Arrange
        let tols = Tolerances::default();
        let ls = LineSearchParams::default();

        // Act
        let zero_mem =
            SolverOptions::new(tols, LineSearcher::MoreThuente, ls, None, Some(0), 10, false, false);
        let zero_calls =
            SolverOptions::new(tols, LineSearcher::MoreThuente, ls, None, None, 0, false, false);

        // Assert
        assert!(matches!(zero_mem, Err(OptError::InvalidLBFGSMem { .. })));
        assert!(matches!(zero_calls, Err(OptError::InvalidMaxCalls { .. })));
    }

    #[test]
    // Purpose
    // -------
    // The drop test fires on a flat tail and not on a steadily falling one.
    //
    // Given
    // -----
    // - Flat history [10, 10, 10, 10, 10] and falling [10, 9, 8, 7, 6].
    //
    // Expect
    // ------
    // - Flat converges, falling does not; short history never converges.
    fn drop_convergence_detects_flat_tail() {
        // Arrange
        let test = DropConvergence::default();

        // Act
        let flat = test.is_converged(&[10.0, 10.0, 10.0, 10.0, 10.0]);
        let falling = test.is_converged(&[10.0, 9.0, 8.0, 7.0, 6.0]);
        let short = test.is_converged(&[1.0, 1.0]);

        // Assert
        assert!(flat);
        assert!(!falling);
        assert!(!short);
    }

    #[test]
    // Purpose
    // -------
    // A restart termination sets `hit_restart` but not `converged`.
    //
    // Given
    // -----
    // - `Termination::Restart(RequestCurvatureRestart)`.
    //
    // Expect
    // ------
    // - `hit_restart == true`, `converged == false`, restart status exposed.
    fn refine_outcome_marks_restart() {
        // Arrange
        let term = Termination::Restart(StepStatus::RequestCurvatureRestart);

        // Act
        let out = RefineOutcome::new(
            Some(array![1.0]),
            2.0,
            term,
            3,
            FnEvalMap::new(),
            Some(array![3.0, 4.0]),
        )
        .expect("outcome should be valid");

        // Assert
        assert!(out.hit_restart);
        assert!(!out.converged);
        assert_eq!(out.restart_status(), Some(StepStatus::RequestCurvatureRestart));
        assert_eq!(out.grad_norm, Some(5.0));
    }
}
