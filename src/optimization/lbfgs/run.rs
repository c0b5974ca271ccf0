//! Execution helper that runs an `argmin` solver on a refinement target and
//! returns a [`RefineOutcome`].
use crate::optimization::{
    errors::OptResult,
    lbfgs::{
        adapter::ArgMinAdapter,
        traits::{RefineOutcome, RefinementTarget, SolverOptions, Termination},
        types::{Grad, Theta},
    },
};
#[cfg(feature = "obs_slog")]
use argmin::core::{CostFunction, Gradient};
use argmin::core::{Executor, State};
#[cfg(feature = "obs_slog")]
use argmin_math::ArgminL2Norm;

/// Run an `argmin` optimization for a refinement target.
///
/// Wires up the adapter, the chosen solver, the initial vector `theta0`,
/// the optional slog observer (feature `obs_slog`, `opts.verbose`) and the
/// optional `max_iters`, then executes and converts the final state.
///
/// # Errors
/// - Propagates any argmin runtime error via `From<argmin::core::Error>`.
///   This includes `OptError::RestartRequested` and
///   `OptError::MaxCallsExceeded` raised by the adapter; the caller is
///   responsible for turning those into outcomes.
/// - Propagates validation errors from [`RefineOutcome::new`].
pub fn run_lbfgs<'a, T, S>(
    theta0: Theta, opts: &SolverOptions, problem: ArgMinAdapter<'a, T>, solver: S,
) -> OptResult<RefineOutcome>
where
    T: RefinementTarget,
    S: argmin::core::Solver<
            ArgMinAdapter<'a, T>,
            argmin::core::IterState<Theta, Grad, (), (), (), f64>,
        > + Send
        + 'static,
{
    #[cfg(feature = "obs_slog")]
    if opts.verbose {
        log_initial_state(&theta0, &problem)?;
    }
    let mut optimizer = Executor::new(problem, solver);
    optimizer = optimizer.configure(|state| state.param(theta0));
    #[cfg(feature = "obs_slog")]
    if opts.verbose {
        let observer = argmin_observer_slog::SlogLogger::term_noblock();
        optimizer = optimizer.add_observer(observer, argmin::core::observers::ObserverMode::Always);
    }
    if let Some(max_iter) = opts.tols.max_iter {
        optimizer = optimizer.configure(|state| state.max_iters(max_iter as u64));
    }

    let mut result = optimizer.run()?.state().clone();
    let iterations = result.get_iter();
    let function_counts = result.get_func_counts().clone();
    let termination = Termination::from_argmin(result.get_termination_status());
    let grad = result.take_gradient();
    RefineOutcome::new(
        result.take_best_param(),
        result.get_best_cost(),
        termination,
        iterations,
        function_counts,
        grad,
    )
}

// ---- Helper Methods ----

#[cfg(feature = "obs_slog")]
fn log_initial_state<T>(theta0: &Theta, problem: &ArgMinAdapter<'_, T>) -> OptResult<()>
where
    T: RefinementTarget,
{
    let f0 = problem.cost(theta0)?;
    let g0n = problem.gradient(theta0).ok().map(|g| g.l2_norm());

    log::info!(
        "init: f(x0) = {:.6}{}",
        f0,
        g0n.map(|n| format!(", ||grad|| = {:.6}", n)).unwrap_or_default()
    );
    Ok(())
}
