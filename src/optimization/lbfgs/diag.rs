//! lbfgs::diag — curvature-aided L-BFGS.
//!
//! Purpose
//! -------
//! Minimize a [`RefinementTarget`] that supplies a diagonal curvature
//! estimate alongside its gradient. argmin's L-BFGS has no hook for a
//! caller-supplied initial inverse Hessian, so this backend carries its own
//! two-loop recursion.
//!
//! Key behaviors
//! -------------
//! - Two-loop recursion with the inverse curvature diagonal as the initial
//!   inverse Hessian. Entries that are not strictly positive fall back to
//!   the usual `sᵀy / yᵀy` scaling, and so does the whole diagonal when the
//!   target supplies none for a step.
//! - Backtracking line search on the Armijo condition, bounded by
//!   `maxfev` evaluations and the `[stpmin, stpmax]` step interval.
//! - Stops on traditional convergence `‖g‖ ≤ eps · max(1, ‖x‖)`, on the
//!   optional drop-convergence test, on `max_iter`, on `max_calls`, on a
//!   failed line search, or as soon as an evaluation carries a status other
//!   than `Continue`.
//!
//! Invariants & assumptions
//! ------------------------
//! - Correction pairs are only stored when `sᵀy > 0`, which keeps the
//!   implied inverse Hessian positive definite.
//! - When the line search fails the target is moved back to the last
//!   accepted point before returning.
//! - On a restart request the target is left where it asked for the
//!   restart; the returned `x_hat` is the target's own vector at that time.
use std::collections::VecDeque;

use crate::optimization::{
    errors::OptResult,
    lbfgs::{
        control::StepStatus,
        traits::{Evaluation, RefineOutcome, RefinementTarget, SolverOptions, Termination},
        types::{Curv, DEFAULT_LBFGS_MEM, FnEvalMap, Grad, Theta},
        validation::{validate_curv, validate_grad, validate_value},
    },
};
use argmin_math::ArgminL2Norm;

#[derive(Debug, Clone)]
struct CorrectionPair {
    s: Theta,
    y: Grad,
    rho: f64,
}

/// Minimize `target` using its curvature diagonal as preconditioner.
///
/// Parameters
/// ----------
/// - `target`: positioned at the starting point.
/// - `opts`: tolerances, line-search limits, history size and call budget.
///
/// Returns
/// -------
/// A [`RefineOutcome`]; `hit_restart` is set when the target requested a
/// restart.
///
/// Errors
/// ------
/// - Propagates target errors and validation failures of the returned
///   functional, gradient or curvature.
pub fn minimize_with_curvatures<T: RefinementTarget>(
    target: &mut T, opts: &SolverOptions,
) -> OptResult<RefineOutcome> {
    let start_calls = target.calls();
    let mem = opts.lbfgs_mem.unwrap_or(DEFAULT_LBFGS_MEM);
    let ls = opts.line_search;
    let eps = opts.tols.trad_conv_eps;

    let mut x = target.x().clone();
    if target.calls() >= opts.max_calls {
        return finish(target, x, f64::NAN, None, Termination::MaxCalls, 0, start_calls);
    }
    let first = evaluate_at(target, &x)?;
    if first.status != StepStatus::Continue {
        return interrupted(target, first.f, first.status, 0, start_calls);
    }
    let (mut f, mut g, mut d) = (first.f, first.g, first.d);
    let mut history: VecDeque<CorrectionPair> = VecDeque::with_capacity(mem);
    let mut f_history = vec![f];
    let mut iterations: u64 = 0;

    if is_traditionally_converged(&g, &x, eps) {
        return finish(target, x, f, Some(g), Termination::Converged, 0, start_calls);
    }

    loop {
        if let Some(max_iter) = opts.tols.max_iter {
            if iterations >= max_iter as u64 {
                return finish(target, x, f, Some(g), Termination::MaxIterations, iterations, start_calls);
            }
        }

        let mut dir = two_loop(&g, &history, d.as_ref()).mapv(|v| -v);
        let mut dg = dir.dot(&g);
        if !(dg < 0.0) {
            log::warn!("search direction is not a descent direction, clearing L-BFGS history");
            history.clear();
            dir = apply_initial_inverse(&g, d.as_ref(), 1.0).mapv(|v| -v);
            dg = dir.dot(&g);
            if !(dg < 0.0) {
                return finish(target, x, f, Some(g), Termination::LineSearchFailed, iterations, start_calls);
            }
        }

        let first_step = if history.is_empty() && d.is_none() { 1.0 / g.l2_norm() } else { 1.0 };
        let mut alpha = first_step.clamp(ls.stpmin, ls.stpmax);
        let mut accepted: Option<(Theta, Evaluation)> = None;
        for _ in 0..ls.maxfev {
            if target.calls() >= opts.max_calls {
                target.set_x(&x)?;
                return finish(target, x, f, Some(g), Termination::MaxCalls, iterations, start_calls);
            }
            let x_trial = &x + &(&dir * alpha);
            let eval = evaluate_at(target, &x_trial)?;
            if eval.status != StepStatus::Continue {
                return interrupted(target, eval.f, eval.status, iterations, start_calls);
            }
            if eval.f <= f + ls.ftol * alpha * dg {
                accepted = Some((x_trial, eval));
                break;
            }
            alpha *= 0.5;
            if alpha < ls.stpmin {
                break;
            }
        }
        let Some((x_new, eval)) = accepted else {
            log::warn!("line search failed after {} evaluations", ls.maxfev);
            target.set_x(&x)?;
            return finish(target, x, f, Some(g), Termination::LineSearchFailed, iterations, start_calls);
        };

        let s = &x_new - &x;
        let y = &eval.g - &g;
        let sy = s.dot(&y);
        if sy > 0.0 {
            if history.len() == mem {
                history.pop_front();
            }
            history.push_back(CorrectionPair { s, y, rho: 1.0 / sy });
        }

        x = x_new;
        f = eval.f;
        g = eval.g;
        d = eval.d;
        f_history.push(f);
        iterations += 1;
        if opts.verbose {
            log::info!("iteration {iterations}: f = {f:.6}, |g| = {:.6}, step = {alpha:.3e}", g.l2_norm());
        }

        if is_traditionally_converged(&g, &x, eps) {
            return finish(target, x, f, Some(g), Termination::Converged, iterations, start_calls);
        }
        if let Some(drop) = &opts.drop_convergence {
            if drop.is_converged(&f_history) {
                return finish(target, x, f, Some(g), Termination::DropConverged, iterations, start_calls);
            }
        }
    }
}

/// `‖g‖ ≤ eps · max(1, ‖x‖)`.
pub fn is_traditionally_converged(g: &Grad, x: &Theta, eps: f64) -> bool {
    g.l2_norm() <= eps * x.l2_norm().max(1.0)
}

/// Two-loop recursion computing `H · g` with a diagonal initial inverse.
fn two_loop(g: &Grad, history: &VecDeque<CorrectionPair>, diag: Option<&Curv>) -> Grad {
    let mut q = g.clone();
    let mut alphas = Vec::with_capacity(history.len());
    for pair in history.iter().rev() {
        let a = pair.rho * pair.s.dot(&q);
        q.scaled_add(-a, &pair.y);
        alphas.push(a);
    }
    let gamma = history.back().map(|p| p.s.dot(&p.y) / p.y.dot(&p.y)).unwrap_or(1.0);
    let mut r = apply_initial_inverse(&q, diag, gamma);
    for (pair, a) in history.iter().zip(alphas.iter().rev()) {
        let b = pair.rho * pair.y.dot(&r);
        r.scaled_add(a - b, &pair.s);
    }
    r
}

/// `H0 · q` where `H0 = diag(1/d)`; non-positive entries use `gamma`.
fn apply_initial_inverse(q: &Grad, diag: Option<&Curv>, gamma: f64) -> Grad {
    match diag {
        Some(d) => q
            .iter()
            .zip(d.iter())
            .map(|(&qi, &di)| if di > 0.0 && di.is_finite() { qi / di } else { gamma * qi })
            .collect(),
        None => q * gamma,
    }
}

fn evaluate_at<T: RefinementTarget>(target: &mut T, x: &Theta) -> OptResult<Evaluation> {
    target.set_x(x)?;
    let eval = target.compute_functional_gradients_diag()?;
    if eval.status != StepStatus::Continue {
        return Ok(eval);
    }
    validate_value(eval.f)?;
    validate_grad(&eval.g, x.len())?;
    if let Some(d) = &eval.d {
        validate_curv(d, x.len())?;
    }
    Ok(eval)
}

fn fn_evals<T: RefinementTarget>(target: &T, start_calls: usize) -> FnEvalMap {
    let calls = (target.calls() - start_calls) as u64;
    FnEvalMap::from([("cost_count".to_string(), calls), ("gradient_count".to_string(), calls)])
}

fn finish<T: RefinementTarget>(
    target: &T, x: Theta, f: f64, g: Option<Grad>, termination: Termination, iterations: u64,
    start_calls: usize,
) -> OptResult<RefineOutcome> {
    let value = if f.is_finite() { f } else { target.functional().unwrap_or(f) };
    RefineOutcome::new(Some(x), value, termination, iterations, fn_evals(target, start_calls), g)
}

fn interrupted<T: RefinementTarget>(
    target: &T, f: f64, status: StepStatus, iterations: u64, start_calls: usize,
) -> OptResult<RefineOutcome> {
    log::info!("solver interrupted: {status}");
    finish(
        target,
        target.x().clone(),
        f,
        None,
        Termination::Restart(status),
        iterations,
        start_calls,
    )
}
