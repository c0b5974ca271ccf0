//! lbfgs::finite_diff — finite-difference gradient check for targets.
//!
//! Purpose
//! -------
//! Compare the analytic gradient of a [`RefinementTarget`] against a
//! central-difference approximation of its functional. This is the
//! standard way to validate new chain-rule code before trusting it in a
//! refinement.
//!
//! Key behaviors
//! -------------
//! - Evaluates the analytic gradient at the target's current `x`.
//! - Central differences via `finitediff`, with error capture inside the
//!   probe closure; a captured error is retried once with forward
//!   differences and then surfaced.
//! - Restores the target to its original `x` before returning.
//!
//! Conventions
//! -----------
//! - Every probe is a full target evaluation and counts as a call. Any
//!   restart status raised during probing is ignored.
use crate::optimization::{
    errors::OptResult,
    lbfgs::{
        traits::RefinementTarget,
        types::{Grad, Theta},
        validation::validate_grad,
    },
};
use argmin::core::Error;
use finitediff::FiniteDiff;
use std::cell::RefCell;

/// Analytic versus numeric gradient at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientCheck {
    pub analytic: Grad,
    pub numeric: Grad,
    pub max_abs_error: f64,
    pub max_rel_error: f64,
}

impl GradientCheck {
    /// Whether every component agrees to `rel_tol` relative or `abs_tol`
    /// absolute error.
    pub fn agrees(&self, rel_tol: f64, abs_tol: f64) -> bool {
        self.analytic.iter().zip(self.numeric.iter()).all(|(a, n)| {
            let err = (a - n).abs();
            err <= abs_tol || err <= rel_tol * a.abs().max(n.abs())
        })
    }
}

/// check_gradient — central-difference check of the target's gradient.
///
/// Parameters
/// ----------
/// - `target`: positioned at the point to check.
///
/// Returns
/// -------
/// A [`GradientCheck`] with both gradients and the largest absolute and
/// relative discrepancies.
///
/// Errors
/// ------
/// - Propagates errors from the analytic evaluation.
/// - Propagates the first error raised by a probe evaluation.
/// - `OptError::InvalidGradient` if the numeric gradient is not finite.
pub fn check_gradient<T: RefinementTarget>(target: &mut T) -> OptResult<GradientCheck> {
    let x0 = target.x().clone();
    let dim = x0.len();
    let analytic = target.compute_functional_and_gradients()?.g;
    validate_grad(&analytic, dim)?;

    let numeric = {
        let cell = RefCell::new(&mut *target);
        let closure_err: RefCell<Option<Error>> = RefCell::new(None);
        let probe = |theta: &Theta| -> f64 {
            let mut target = cell.borrow_mut();
            let res = target.set_x(theta).and_then(|_| target.compute_functional_and_gradients());
            match res {
                Ok(eval) => eval.f,
                Err(e) => {
                    let mut slot = closure_err.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(e.into());
                    }
                    f64::NAN
                }
            }
        };
        let central = x0.central_diff(&probe);
        if closure_err.borrow().is_some() {
            run_fd_diff(&x0, &probe, &closure_err)?
        } else {
            central
        }
    };
    target.set_x(&x0)?;
    validate_grad(&numeric, dim)?;

    let mut max_abs_error: f64 = 0.0;
    let mut max_rel_error: f64 = 0.0;
    for (a, n) in analytic.iter().zip(numeric.iter()) {
        let err = (a - n).abs();
        max_abs_error = max_abs_error.max(err);
        let scale = a.abs().max(n.abs());
        if scale > 0.0 {
            max_rel_error = max_rel_error.max(err / scale);
        }
    }
    Ok(GradientCheck { analytic, numeric, max_abs_error, max_rel_error })
}

/// Forward-difference gradient of `func` at `theta`, with error capture.
///
/// # Errors
/// Returns any error captured during evaluation of `func`, or a validation
/// error for the resulting gradient.
fn run_fd_diff<G: Fn(&Theta) -> f64>(
    theta: &Theta, func: &G, closure_err: &RefCell<Option<Error>>,
) -> Result<Grad, Error> {
    closure_err.replace(None);
    let fd_grad = theta.forward_diff(func);
    if let Some(err) = closure_err.take() {
        return Err(err);
    }
    validate_grad(&fd_grad, theta.len())?;
    Ok(fd_grad)
}
