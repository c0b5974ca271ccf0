use argmin::core::{ArgminError, Error};

use crate::optimization::lbfgs::control::StepStatus;
use crate::refinement::errors::RefineError;

/// Crate-wide result alias for optimizer operations.
pub type OptResult<T> = Result<T, OptError>;

#[derive(Debug, Clone, PartialEq)]
pub enum OptError {
    // ---- Target ----
    /// The refinement target exposes no free parameters.
    EmptyTarget,

    /// Parameter vector handed to the target has the wrong length.
    ThetaLengthMismatch {
        expected: usize,
        found: usize,
    },

    /// Gradient dimensions do not match parameter dimensions.
    GradientDimMismatch {
        expected: usize,
        found: usize,
    },

    /// Gradient elements need to be finite
    InvalidGradient {
        index: usize,
        value: f64,
        reason: &'static str,
    },

    /// Curvature dimensions do not match parameter dimensions.
    CurvatureDimMismatch {
        expected: usize,
        found: usize,
    },

    /// Curvature elements need to be finite
    InvalidCurvature {
        index: usize,
        value: f64,
    },

    // ---- SolverOptions ----
    /// Traditional convergence epsilon needs to be positive and finite.
    InvalidTradConvEps {
        tol: f64,
        reason: &'static str,
    },
    /// Cost change tolerance needs to be positive and finite.
    InvalidTolCost {
        tol: f64,
        reason: &'static str,
    },
    /// Maximum iterations needs to be positive.
    InvalidMaxIter {
        max_iter: usize,
        reason: &'static str,
    },
    /// Maximum number of target evaluations needs to be positive.
    InvalidMaxCalls {
        max_calls: usize,
        reason: &'static str,
    },

    /// Invalid line searcher name.
    InvalidLineSearch {
        name: String,
        reason: &'static str,
    },

    /// Line-search step bounds must satisfy 0 < stpmin < stpmax.
    InvalidStepBounds {
        stpmin: f64,
        stpmax: f64,
        reason: &'static str,
    },

    /// Line search needs at least one function evaluation per iteration.
    InvalidMaxFev {
        maxfev: usize,
    },

    /// Sufficient decrease constant must lie in (0, 1).
    InvalidFtol {
        ftol: f64,
    },

    /// Drop-convergence test parameters are unusable.
    InvalidDropConvergence {
        n_test_points: usize,
        max_drop_eps: f64,
        reason: &'static str,
    },

    /// lbfgs_mem needs to be at least 1.
    InvalidLBFGSMem {
        mem: usize,
        reason: &'static str,
    },

    // ---- Cost function ----
    /// Cost function returned a non-finite value.
    NonFiniteCost {
        value: f64,
    },

    // ---- Control flow ----
    /// The target asked the driver to restart the solver.
    ///
    /// Only used to unwind the argmin executor; `minimize` turns it into an
    /// outcome with `hit_restart` set.
    RestartRequested {
        status: StepStatus,
    },

    /// The target was evaluated `max_calls` times.
    MaxCallsExceeded {
        max_calls: usize,
    },

    // ---- Optimizer outcome ----
    /// Estimated parameters must be finite.
    InvalidThetaHat {
        index: usize,
        value: f64,
        reason: &'static str,
    },

    /// Theta hat is missing
    MissingThetaHat,

    // ---- Refinement ----
    /// Error raised while evaluating the refinement target.
    Refinement {
        source: RefineError,
    },

    // ---- Argmin ---
    /// Wrapper for argmin::InvalidParameter
    InvalidParameter {
        text: String,
    },
    /// Wrapper for argmin::NotImplemented
    NotImplemented {
        text: String,
    },
    /// Wrapper for argmin::NotInitialized
    NotInitialized {
        text: String,
    },
    /// Wrapper for argmin::ConditionViolated
    ConditionViolated {
        text: String,
    },
    /// Wrapper for argmin::CheckPointNotFound
    CheckPointNotFound {
        text: String,
    },
    /// Wrapper for argmin::PotentialBug
    PotentialBug {
        text: String,
    },
    /// Wrapper for argmin::ImpossibleError
    ImpossibleError {
        text: String,
    },
    /// Wrapper for other argmin::Error types
    BackendError {
        text: String,
    },

    // ---- Fallback ----
    UnknownError,
}

impl std::error::Error for OptError {}

impl std::fmt::Display for OptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // ---- Target ----
            OptError::EmptyTarget => {
                write!(f, "Refinement target has no free parameters")
            }
            OptError::ThetaLengthMismatch { expected, found } => {
                write!(f, "Parameter vector length mismatch: expected {expected}, found {found}")
            }
            OptError::GradientDimMismatch { expected, found } => {
                write!(f, "Gradient dimension mismatch: expected {expected}, found {found}")
            }
            OptError::InvalidGradient { index, value, reason } => {
                write!(f, "Invalid gradient at index {index}: {value}: {reason}")
            }
            OptError::CurvatureDimMismatch { expected, found } => {
                write!(f, "Curvature dimension mismatch: expected {expected}, found {found}")
            }
            OptError::InvalidCurvature { index, value } => {
                write!(f, "Invalid curvature at index {index}: {value}, must be finite")
            }

            // ---- SolverOptions ----
            OptError::InvalidTradConvEps { tol, reason } => {
                write!(f, "Invalid traditional convergence epsilon {tol}: {reason}")
            }
            OptError::InvalidTolCost { tol, reason } => {
                write!(f, "Invalid cost function change tolerance {tol}: {reason}")
            }
            OptError::InvalidMaxIter { max_iter, reason } => {
                write!(f, "Invalid maximum iterations {max_iter}: {reason}")
            }
            OptError::InvalidMaxCalls { max_calls, reason } => {
                write!(f, "Invalid maximum calls {max_calls}: {reason}")
            }
            OptError::InvalidLineSearch { name, reason } => {
                write!(f, "Invalid line searcher '{name}': {reason}")
            }
            OptError::InvalidStepBounds { stpmin, stpmax, reason } => {
                write!(f, "Invalid line-search step bounds [{stpmin}, {stpmax}]: {reason}")
            }
            OptError::InvalidMaxFev { maxfev } => {
                write!(f, "Invalid maxfev {maxfev}: must be greater than zero")
            }
            OptError::InvalidFtol { ftol } => {
                write!(f, "Invalid sufficient decrease constant {ftol}: must lie in (0, 1)")
            }
            OptError::InvalidDropConvergence { n_test_points, max_drop_eps, reason } => {
                write!(
                    f,
                    "Invalid drop convergence test (n_test_points = {n_test_points}, \
                     max_drop_eps = {max_drop_eps}): {reason}"
                )
            }
            OptError::InvalidLBFGSMem { mem, reason } => {
                write!(f, "Invalid L-BFGS memory {mem}: {reason}")
            }

            // ---- Cost function ----
            OptError::NonFiniteCost { value } => {
                write!(f, "Non-finite cost value: {value}")
            }

            // ---- Control flow ----
            OptError::RestartRequested { status } => {
                write!(f, "Solver restart requested: {status}")
            }
            OptError::MaxCallsExceeded { max_calls } => {
                write!(f, "Maximum number of target evaluations ({max_calls}) reached")
            }

            // ---- Optimizer outcome ----
            OptError::InvalidThetaHat { index, value, reason } => {
                write!(f, "Invalid estimated parameter at index {index}: {value}: {reason}")
            }
            OptError::MissingThetaHat => {
                write!(f, "Missing estimated parameters (theta hat)")
            }

            // ---- Refinement ----
            OptError::Refinement { source } => {
                write!(f, "Refinement error: {source}")
            }

            // ---- Argmin ----
            OptError::InvalidParameter { text } => {
                write!(f, "Invalid parameter: {text}")
            }
            OptError::NotImplemented { text } => {
                write!(f, "Not implemented: {text}")
            }
            OptError::NotInitialized { text } => {
                write!(f, "Not initialized: {text}")
            }
            OptError::ConditionViolated { text } => {
                write!(f, "Condition violated: {text}")
            }
            OptError::CheckPointNotFound { text } => {
                write!(f, "Checkpoint not found: {text}")
            }
            OptError::PotentialBug { text } => {
                write!(f, "Potential bug: {text}")
            }
            OptError::ImpossibleError { text } => {
                write!(f, "Impossible error: {text}")
            }
            OptError::BackendError { text } => {
                write!(f, "Backend error: {text}")
            }

            // ---- Fallback ----
            OptError::UnknownError => {
                write!(f, "Unknown error")
            }
        }
    }
}

impl From<Error> for OptError {
    fn from(original_err: Error) -> Self {
        // Errors raised by our own adapter travel through argmin untouched.
        let original_err = match original_err.downcast::<OptError>() {
            Ok(opt_err) => return opt_err,
            Err(err) => err,
        };
        match original_err.downcast() {
            Ok(opt_err) => match opt_err {
                ArgminError::InvalidParameter { text } => OptError::InvalidParameter { text },
                ArgminError::NotImplemented { text } => OptError::NotImplemented { text },
                ArgminError::NotInitialized { text } => OptError::NotInitialized { text },
                ArgminError::ConditionViolated { text } => OptError::ConditionViolated { text },
                ArgminError::CheckpointNotFound { text } => OptError::CheckPointNotFound { text },
                ArgminError::PotentialBug { text } => OptError::PotentialBug { text },
                ArgminError::ImpossibleError { text } => OptError::ImpossibleError { text },
                _ => OptError::UnknownError,
            },
            Err(err) => OptError::BackendError { text: err.to_string() },
        }
    }
}

impl From<RefineError> for OptError {
    fn from(source: RefineError) -> Self {
        OptError::Refinement { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    // Purpose
    // -------
    // An `OptError` boxed into an argmin `Error` must come back out as the
    // same variant, so restart requests survive the executor.
    //
    // Given
    // -----
    // - `OptError::RestartRequested` converted into `argmin::core::Error`.
    //
    // Expect
    // ------
    // - `OptError::from` returns the original variant unchanged.
    fn from_argmin_error_recovers_own_variant() {
        // Arrange
        let original = OptError::RestartRequested { status: StepStatus::RequestCurvatureRestart };
        let wrapped: Error = original.clone().into();

        // Act
        let recovered = OptError::from(wrapped);

        // Assert
        assert_eq!(recovered, original);
    }

    #[test]
    // Purpose
    // -------
    // Argmin's own error kinds are mapped onto the matching wrapper variants.
    //
    // Given
    // -----
    // - `ArgminError::InvalidParameter` wrapped into `argmin::core::Error`.
    //
    // Expect
    // ------
    // - `OptError::InvalidParameter` carrying the same text.
    fn from_argmin_error_maps_invalid_parameter() {
        // Arrange
        let wrapped: Error = ArgminError::InvalidParameter { text: "bad".to_string() }.into();

        // Act
        let mapped = OptError::from(wrapped);

        // Assert
        match mapped {
            OptError::InvalidParameter { text } => assert_eq!(text, "bad"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    // Purpose
    // -------
    // Configuration failures from the refinement layer are wrapped, not lost.
    //
    // Given
    // -----
    // - `RefineError::EmptyFcellMap`.
    //
    // Expect
    // ------
    // - `OptError::Refinement` whose source is the original error.
    fn from_refine_error_wraps_source() {
        // Arrange
        let source = RefineError::EmptyFcellMap;

        // Act
        let mapped = OptError::from(source.clone());

        // Assert
        assert_eq!(mapped, OptError::Refinement { source });
    }
}
