//! Adapter that exposes a [`RefinementTarget`] as an `argmin` problem.
//!
//! argmin asks for the cost and the gradient separately, while a refinement
//! target always produces both in one (expensive) evaluation. The adapter
//! therefore caches the last evaluation keyed by the exact parameter vector
//! and serves the second request from the cache.
//!
//! The restart protocol is honoured here: any evaluation whose status is not
//! `Continue`, and any evaluation beyond `max_calls`, is turned into an
//! [`OptError`] that unwinds the argmin executor. argmin's line searches
//! swallow errors raised by the problem and report a plain solver exit, so
//! the interruption is also recorded on a [`StopSignal`] owned by the driver,
//! which reads it back after the run whatever argmin returned.
use std::cell::{Cell, RefCell};

use crate::optimization::{
    errors::OptError,
    lbfgs::{
        control::StepStatus,
        traits::RefinementTarget,
        types::{Cost, Grad, Theta},
        validation::{validate_grad, validate_value},
    },
};
use argmin::core::{CostFunction, Error, Gradient};

#[derive(Debug, Clone)]
struct CachedEvaluation {
    theta: Theta,
    f: Cost,
    g: Grad,
}

/// Why an argmin run was cut short by the adapter, if it was.
#[derive(Debug, Default)]
pub struct StopSignal {
    restart: Cell<Option<StepStatus>>,
    exhausted: Cell<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart status requested by the target, first one wins.
    pub fn restart(&self) -> Option<StepStatus> {
        self.restart.get()
    }

    /// Whether the call budget ran out.
    pub fn exhausted(&self) -> bool {
        self.exhausted.get()
    }

    fn pending(&self) -> Option<OptError> {
        self.restart.get().map(|status| OptError::RestartRequested { status })
    }
}

/// Bridges a [`RefinementTarget`] to `argmin`'s `CostFunction` and `Gradient`.
pub struct ArgMinAdapter<'a, T: RefinementTarget> {
    target: RefCell<&'a mut T>,
    cache: RefCell<Option<CachedEvaluation>>,
    max_calls: usize,
    signal: &'a StopSignal,
}

impl<'a, T: RefinementTarget> ArgMinAdapter<'a, T> {
    pub fn new(target: &'a mut T, max_calls: usize, signal: &'a StopSignal) -> Self {
        Self { target: RefCell::new(target), cache: RefCell::new(None), max_calls, signal }
    }

    /// Evaluate the target at `theta`, reusing the cached result when the
    /// point has not changed.
    ///
    /// # Errors
    /// - `OptError::MaxCallsExceeded` once the target has been evaluated
    ///   `max_calls` times.
    /// - `OptError::RestartRequested` when the evaluation carries a status
    ///   other than `Continue`.
    /// - Any error raised by the target or by gradient/value validation.
    ///
    /// Once a restart has been requested, or the budget exhausted, every
    /// later call fails without touching the target.
    fn evaluate(&self, theta: &Theta) -> Result<(Cost, Grad), Error> {
        if let Some(err) = self.signal.pending() {
            return Err(err.into());
        }
        if self.signal.exhausted() {
            return Err(OptError::MaxCallsExceeded { max_calls: self.max_calls }.into());
        }
        if let Some(hit) = self.cache.borrow().as_ref() {
            if hit.theta == *theta {
                return Ok((hit.f, hit.g.clone()));
            }
        }
        let mut target = self.target.borrow_mut();
        if target.calls() >= self.max_calls {
            self.signal.exhausted.set(true);
            return Err(OptError::MaxCallsExceeded { max_calls: self.max_calls }.into());
        }
        target.set_x(theta)?;
        let eval = target.compute_functional_and_gradients()?;
        validate_value(eval.f)?;
        validate_grad(&eval.g, theta.len())?;
        if eval.status != StepStatus::Continue {
            self.signal.restart.set(Some(eval.status));
            return Err(OptError::RestartRequested { status: eval.status }.into());
        }
        self.cache.replace(Some(CachedEvaluation {
            theta: theta.clone(),
            f: eval.f,
            g: eval.g.clone(),
        }));
        Ok((eval.f, eval.g))
    }
}

impl<'a, T: RefinementTarget> CostFunction for ArgMinAdapter<'a, T> {
    type Param = Theta;
    type Output = Cost;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, Error> {
        self.evaluate(theta).map(|(f, _)| f)
    }
}

impl<'a, T: RefinementTarget> Gradient for ArgMinAdapter<'a, T> {
    type Param = Theta;
    type Gradient = Grad;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, Error> {
        self.evaluate(theta).map(|(_, g)| g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::{
        errors::OptResult,
        lbfgs::traits::Evaluation,
    };
    use ndarray::array;

    /// Quadratic bowl that counts evaluations and can be told to request a
    /// restart on a given call.
    struct Bowl {
        x: Theta,
        calls: usize,
        last: Option<f64>,
        restart_on: Option<usize>,
    }

    impl RefinementTarget for Bowl {
        fn n(&self) -> usize {
            self.x.len()
        }
        fn x(&self) -> &Theta {
            &self.x
        }
        fn set_x(&mut self, x: &Theta) -> OptResult<()> {
            self.x = x.clone();
            Ok(())
        }
        fn compute_functional_and_gradients(&mut self) -> OptResult<Evaluation> {
            self.calls += 1;
            let f = self.x.dot(&self.x);
            self.last = Some(f);
            let status = match self.restart_on {
                Some(n) if n == self.calls => StepStatus::RequestCurvatureRestart,
                _ => StepStatus::Continue,
            };
            Ok(Evaluation { f, g: 2.0 * &self.x, d: None, status })
        }
        fn calls(&self) -> usize {
            self.calls
        }
        fn functional(&self) -> Option<f64> {
            self.last
        }
    }

    #[test]
    // Purpose
    // -------
    // Cost followed by gradient at the same point evaluates the target once.
    //
    // Given
    // -----
    // - A bowl at the origin and theta = [1, 2].
    //
    // Expect
    // ------
    // - cost 5, gradient [2, 4], exactly one call.
    fn cost_then_gradient_share_one_evaluation() {
        // Arrange
        let mut bowl = Bowl { x: array![0.0, 0.0], calls: 0, last: None, restart_on: None };
        let theta = array![1.0, 2.0];

        // Act
        let (cost, grad) = {
            let signal = StopSignal::new();
            let adapter = ArgMinAdapter::new(&mut bowl, 10, &signal);
            let cost = adapter.cost(&theta).expect("cost should evaluate");
            let grad = adapter.gradient(&theta).expect("gradient should evaluate");
            (cost, grad)
        };

        // Assert
        assert_eq!(cost, 5.0);
        assert_eq!(grad, array![2.0, 4.0]);
        assert_eq!(bowl.calls, 1);
    }

    #[test]
    // Purpose
    // -------
    // A restart status unwinds as `OptError::RestartRequested`.
    //
    // Given
    // -----
    // - A bowl that requests a curvature restart on its first call.
    //
    // Expect
    // ------
    // - The cost call fails and converts back to `RestartRequested`.
    // - The signal holds the status and later points are refused without
    //   evaluating the target again.
    fn restart_status_becomes_error() {
        // Arrange
        let mut bowl = Bowl { x: array![0.0], calls: 0, last: None, restart_on: Some(1) };
        let signal = StopSignal::new();

        // Act
        let (err, again) = {
            let adapter = ArgMinAdapter::new(&mut bowl, 10, &signal);
            let err = adapter.cost(&array![1.0]).expect_err("restart should unwind");
            let again = adapter.cost(&array![2.0]).expect_err("restart stays pending");
            (err, again)
        };

        // Assert
        let expected = OptError::RestartRequested { status: StepStatus::RequestCurvatureRestart };
        assert_eq!(OptError::from(err), expected);
        assert_eq!(OptError::from(again), expected);
        assert_eq!(signal.restart(), Some(StepStatus::RequestCurvatureRestart));
        assert_eq!(bowl.calls, 1);
    }

    #[test]
    // Purpose
    // -------
    // The call budget is enforced before evaluating.
    //
    // Given
    // -----
    // - `max_calls = 1` and two distinct points.
    //
    // Expect
    // ------
    // - The second point fails with `MaxCallsExceeded` and the signal
    //   records the exhausted budget.
    fn max_calls_is_enforced() {
        // Arrange
        let mut bowl = Bowl { x: array![0.0], calls: 0, last: None, restart_on: None };
        let signal = StopSignal::new();
        let adapter = ArgMinAdapter::new(&mut bowl, 1, &signal);

        // Act
        let first = adapter.cost(&array![1.0]);
        let second = adapter.cost(&array![2.0]).expect_err("budget should be exhausted");

        // Assert
        assert!(first.is_ok());
        assert_eq!(OptError::from(second), OptError::MaxCallsExceeded { max_calls: 1 });
        assert!(signal.exhausted());
    }
}
