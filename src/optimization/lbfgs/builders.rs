//! lbfgs::builders — argmin L-BFGS construction helpers.
//!
//! Purpose
//! -------
//! Build the gradient-only solvers with the crate's numeric types and apply
//! [`SolverOptions`] so that the driver never touches argmin generics.
//!
//! Key behaviors
//! -------------
//! - Construct L-BFGS with either Hager–Zhang or More–Thuente line search.
//! - Translate the traditional convergence rule
//!   `‖g‖ ≤ trad_conv_eps · max(1, ‖x0‖)` into argmin's absolute gradient
//!   tolerance, evaluated at the starting point of the run.
//! - Apply the optional cost-change tolerance.
//!
//! Conventions
//! -----------
//! - Initial parameters and `max_iters` are runtime concerns handled by
//!   [`run_lbfgs`](crate::optimization::lbfgs::run::run_lbfgs).
//! - argmin errors surface as [`OptError`](crate::optimization::errors::OptError)
//!   via `From<argmin::core::Error>`.
use argmin::solver::quasinewton::LBFGS;
use argmin_math::ArgminL2Norm;

use crate::optimization::{
    errors::OptResult,
    lbfgs::{
        traits::SolverOptions,
        types::{
            Cost, DEFAULT_LBFGS_MEM, Grad, HagerZhangLS, LbfgsHagerZhang, LbfgsMoreThuente,
            MoreThuenteLS, Theta,
        },
    },
};

/// Build L-BFGS with Hager–Zhang line search.
///
/// Parameters
/// ----------
/// - `opts`: solver options (`lbfgs_mem`, `tols`).
/// - `theta0`: starting point, used to scale the gradient tolerance.
///
/// Errors
/// ------
/// - `OptError` (via `From<argmin::core::Error>`) if argmin rejects a
///   tolerance.
pub fn build_optimizer_hager_zhang(opts: &SolverOptions, theta0: &Theta) -> OptResult<LbfgsHagerZhang> {
    let hager_zhang = HagerZhangLS::new();
    let mem = opts.lbfgs_mem.unwrap_or(DEFAULT_LBFGS_MEM);
    let lbfgs = LbfgsHagerZhang::new(hager_zhang, mem);
    configure_lbfgs(lbfgs, opts, theta0)
}

/// Build L-BFGS with More–Thuente line search.
///
/// Same parameters and errors as [`build_optimizer_hager_zhang`].
pub fn build_optimizer_more_thuente(
    opts: &SolverOptions, theta0: &Theta,
) -> OptResult<LbfgsMoreThuente> {
    let more_thuente = MoreThuenteLS::new();
    let mem = opts.lbfgs_mem.unwrap_or(DEFAULT_LBFGS_MEM);
    let lbfgs = LbfgsMoreThuente::new(more_thuente, mem);
    configure_lbfgs(lbfgs, opts, theta0)
}

/// Absolute gradient tolerance equivalent to the traditional convergence
/// rule at `theta0`.
pub fn gradient_tolerance(trad_conv_eps: f64, theta0: &Theta) -> f64 {
    trad_conv_eps * theta0.l2_norm().max(1.0)
}

/// Apply tolerances from `opts` to an L-BFGS solver of any line search.
pub fn configure_lbfgs<L>(
    mut solver: LBFGS<L, Theta, Grad, Cost>, opts: &SolverOptions, theta0: &Theta,
) -> OptResult<LBFGS<L, Theta, Grad, Cost>> {
    solver = solver.with_tolerance_grad(gradient_tolerance(opts.tols.trad_conv_eps, theta0))?;
    if let Some(c) = opts.tols.tol_cost {
        solver = solver.with_tolerance_cost(c)?;
    }
    Ok(solver)
}
