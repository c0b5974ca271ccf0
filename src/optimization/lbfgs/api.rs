//! High-level entry point for minimizing a [`RefinementTarget`].
//!
//! Selects the backend from [`SolverOptions::use_curvatures`]:
//! - gradient-only: argmin L-BFGS with the configured line search, driven
//!   through [`ArgMinAdapter`] and [`run_lbfgs`];
//! - curvature-aided: [`minimize_with_curvatures`].
//!
//! Both backends report restart requests the same way: the returned
//! outcome has `hit_restart` set and the caller re-invokes `minimize`.
use crate::optimization::{
    errors::{OptError, OptResult},
    lbfgs::{
        adapter::{ArgMinAdapter, StopSignal},
        builders::{build_optimizer_hager_zhang, build_optimizer_more_thuente},
        diag::minimize_with_curvatures,
        run::run_lbfgs,
        traits::{LineSearcher, RefineOutcome, RefinementTarget, SolverOptions, Termination},
        types::FnEvalMap,
    },
};

/// Minimize a refinement target.
///
/// # Behavior
/// - Rejects targets without free parameters.
/// - Gradient-only runs: the adapter unwinds argmin on a restart status or
///   an exhausted call budget and records it on a [`StopSignal`]. argmin may
///   report such a run as an ordinary solver exit, so the signal is checked
///   first and both cases become outcomes with the target left at the point
///   where the run stopped. A normal argmin termination moves the target to
///   the best point found.
///
/// # Errors
/// - [`OptError::EmptyTarget`] when `target.n() == 0`.
/// - Builder, runtime and target errors from the selected backend.
pub fn minimize<T: RefinementTarget>(target: &mut T, opts: &SolverOptions) -> OptResult<RefineOutcome> {
    if target.n() == 0 {
        return Err(OptError::EmptyTarget);
    }
    if opts.use_curvatures {
        return minimize_with_curvatures(target, opts);
    }

    let theta0 = target.x().clone();
    let start_calls = target.calls();
    let signal = StopSignal::new();
    let result = {
        let problem = ArgMinAdapter::new(&mut *target, opts.max_calls, &signal);
        match opts.line_searcher {
            LineSearcher::MoreThuente => {
                let solver = build_optimizer_more_thuente(opts, &theta0)?;
                run_lbfgs(theta0.clone(), opts, problem, solver)
            }
            LineSearcher::HagerZhang => {
                let solver = build_optimizer_hager_zhang(opts, &theta0)?;
                run_lbfgs(theta0.clone(), opts, problem, solver)
            }
        }
    };

    if let Some(status) = signal.restart() {
        log::info!("solver interrupted: {status}");
        return stopped_outcome(target, Termination::Restart(status), start_calls);
    }
    if signal.exhausted() {
        log::warn!("stopping after {} target evaluations", opts.max_calls);
        return stopped_outcome(target, Termination::MaxCalls, start_calls);
    }
    match result {
        Ok(outcome) => {
            target.set_x(&outcome.x_hat)?;
            Ok(outcome)
        }
        Err(OptError::RestartRequested { status }) => {
            log::info!("solver interrupted: {status}");
            stopped_outcome(target, Termination::Restart(status), start_calls)
        }
        Err(OptError::MaxCallsExceeded { max_calls }) => {
            log::warn!("stopping after {max_calls} target evaluations");
            stopped_outcome(target, Termination::MaxCalls, start_calls)
        }
        Err(e) => Err(e),
    }
}

fn stopped_outcome<T: RefinementTarget>(
    target: &T, termination: Termination, start_calls: usize,
) -> OptResult<RefineOutcome> {
    let value = target
        .functional()
        .ok_or_else(|| OptError::NotInitialized { text: "target was never evaluated".to_string() })?;
    let calls = (target.calls() - start_calls) as u64;
    let fn_evals =
        FnEvalMap::from([("cost_count".to_string(), calls), ("gradient_count".to_string(), calls)]);
    RefineOutcome::new(Some(target.x().clone()), value, termination, 0, fn_evals, None)
}
