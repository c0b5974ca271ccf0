//! Validation helpers for the refinement optimizer.
//!
//! - **Tolerance checks**: [`verify_trad_conv_eps`], [`verify_tol_cost`],
//!   [`verify_step_bounds`] reject unusable solver settings up front.
//! - **Evaluation checks**: [`validate_grad`] and [`validate_curv`] enforce
//!   dimension and finiteness of what the target returns; [`validate_value`]
//!   does the same for the functional.
//! - **Outcome checks**: [`validate_theta_hat`] ensures a final parameter
//!   vector exists and is finite.
use crate::optimization::{
    errors::{OptError, OptResult},
    lbfgs::types::{Curv, Grad, Theta},
};

/// Validate the traditional convergence epsilon.
///
/// # Errors
/// Returns [`OptError::InvalidTradConvEps`] if the value is non-finite or ≤ 0.0.
pub fn verify_trad_conv_eps(tol: f64) -> OptResult<()> {
    if !tol.is_finite() {
        return Err(OptError::InvalidTradConvEps { tol, reason: "Tolerance must be finite." });
    }
    if tol <= 0.0 {
        return Err(OptError::InvalidTradConvEps { tol, reason: "Tolerance must be positive." });
    }
    Ok(())
}

/// Validate the optional cost-change tolerance.
///
/// # Errors
/// Returns [`OptError::InvalidTolCost`] if the value is non-finite or ≤ 0.0.
pub fn verify_tol_cost(tol: Option<f64>) -> OptResult<()> {
    if let Some(tol) = tol {
        if !tol.is_finite() {
            return Err(OptError::InvalidTolCost { tol, reason: "Tolerance must be finite." });
        }
        if tol <= 0.0 {
            return Err(OptError::InvalidTolCost { tol, reason: "Tolerance must be positive." });
        }
    }
    Ok(())
}

/// Validate line-search step bounds.
///
/// # Errors
/// Returns [`OptError::InvalidStepBounds`] unless `0 < stpmin < stpmax` and
/// both are finite.
pub fn verify_step_bounds(stpmin: f64, stpmax: f64) -> OptResult<()> {
    if !stpmin.is_finite() || !stpmax.is_finite() {
        return Err(OptError::InvalidStepBounds {
            stpmin,
            stpmax,
            reason: "Step bounds must be finite.",
        });
    }
    if stpmin <= 0.0 {
        return Err(OptError::InvalidStepBounds {
            stpmin,
            stpmax,
            reason: "Lower step bound must be positive.",
        });
    }
    if stpmin >= stpmax {
        return Err(OptError::InvalidStepBounds {
            stpmin,
            stpmax,
            reason: "Lower step bound must be smaller than the upper bound.",
        });
    }
    Ok(())
}

/// Validate a gradient vector against dimension and finiteness.
///
/// # Errors
/// - [`OptError::GradientDimMismatch`] if length does not match `dim`.
/// - [`OptError::InvalidGradient`] for the first non-finite element.
pub fn validate_grad(grad: &Grad, dim: usize) -> OptResult<()> {
    if grad.len() != dim {
        return Err(OptError::GradientDimMismatch { expected: dim, found: grad.len() });
    }
    for (index, &value) in grad.iter().enumerate() {
        if !value.is_finite() {
            return Err(OptError::InvalidGradient {
                index,
                value,
                reason: "Gradient elements must be finite.",
            });
        }
    }
    Ok(())
}

/// Validate a curvature diagonal against dimension and finiteness.
///
/// Negative entries are legal here; their handling belongs to the
/// curvature controller and the preconditioner.
///
/// # Errors
/// - [`OptError::CurvatureDimMismatch`] if length does not match `dim`.
/// - [`OptError::InvalidCurvature`] for the first non-finite element.
pub fn validate_curv(curv: &Curv, dim: usize) -> OptResult<()> {
    if curv.len() != dim {
        return Err(OptError::CurvatureDimMismatch { expected: dim, found: curv.len() });
    }
    for (index, &value) in curv.iter().enumerate() {
        if !value.is_finite() {
            return Err(OptError::InvalidCurvature { index, value });
        }
    }
    Ok(())
}

/// Validate and unwrap an estimated parameter vector.
///
/// # Errors
/// - [`OptError::MissingThetaHat`] if no vector was provided.
/// - [`OptError::InvalidThetaHat`] if any element is non-finite.
pub fn validate_theta_hat(theta_hat: Option<Theta>) -> OptResult<Theta> {
    match theta_hat {
        Some(t) => {
            for (index, &value) in t.iter().enumerate() {
                if !value.is_finite() {
                    return Err(OptError::InvalidThetaHat {
                        index,
                        value,
                        reason: "Parameter estimates must be finite.",
                    });
                }
            }
            Ok(t)
        }
        None => Err(OptError::MissingThetaHat),
    }
}

/// Validate that a functional value is finite.
///
/// # Errors
/// Returns [`OptError::NonFiniteCost`] if the value is `NaN` or infinite.
pub fn validate_value(value: f64) -> OptResult<()> {
    if !value.is_finite() {
        return Err(OptError::NonFiniteCost { value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    // Purpose
    // -------
    // `verify_trad_conv_eps` accepts positive finite values only.
    //
    // Given
    // -----
    // - 0.05, 0.0, -1.0 and NaN.
    //
    // Expect
    // ------
    // - Only 0.05 is accepted.
    fn verify_trad_conv_eps_rejects_non_positive_and_non_finite() {
        // Arrange / Act / Assert
        assert!(verify_trad_conv_eps(0.05).is_ok());
        assert!(matches!(verify_trad_conv_eps(0.0), Err(OptError::InvalidTradConvEps { .. })));
        assert!(matches!(verify_trad_conv_eps(-1.0), Err(OptError::InvalidTradConvEps { .. })));
        assert!(matches!(
            verify_trad_conv_eps(f64::NAN),
            Err(OptError::InvalidTradConvEps { .. })
        ));
    }

    #[test]
    // Purpose
    // -------
    // Step bounds must be ordered and strictly positive.
    //
    // Given
    // -----
    // - (1e-20, 1e20), (1.0, 1.0), (0.0, 1.0).
    //
    // Expect
    // ------
    // - Only the first pair is accepted.
    fn verify_step_bounds_requires_ordered_positive_bounds() {
        // Arrange / Act / Assert
        assert!(verify_step_bounds(1e-20, 1e20).is_ok());
        assert!(verify_step_bounds(1.0, 1.0).is_err());
        assert!(verify_step_bounds(0.0, 1.0).is_err());
    }

    #[test]
    // Purpose
    // -------
    // Curvature validation reports the first non-finite entry and accepts
    // negative values.
    //
    // Given
    // -----
    // - [-1, 2] (valid) and [1, inf] (invalid at index 1).
    //
    // Expect
    // ------
    // - Ok for the first, `InvalidCurvature { index: 1 }` for the second.
    fn validate_curv_allows_negative_but_not_infinite() {
        // Arrange
        let ok = array![-1.0, 2.0];
        let bad = array![1.0, f64::INFINITY];

        // Act
        let ok_res = validate_curv(&ok, 2);
        let bad_res = validate_curv(&bad, 2);

        // Assert
        assert!(ok_res.is_ok());
        match bad_res {
            Err(OptError::InvalidCurvature { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    // Purpose
    // -------
    // Gradient dimension mismatches are detected before finiteness.
    //
    // Given
    // -----
    // - Gradient of length 2 checked against dim 3.
    //
    // Expect
    // ------
    // - `GradientDimMismatch { expected: 3, found: 2 }`.
    fn validate_grad_detects_dimension_mismatch() {
        // Arrange
        let grad = array![0.0, f64::NAN];

        // Act
        let res = validate_grad(&grad, 3);

        // Assert
        assert_eq!(res, Err(OptError::GradientDimMismatch { expected: 3, found: 2 }));
    }

    #[test]
    // Purpose
    // -------
    // Missing or non-finite estimates are rejected.
    //
    // Given
    // -----
    // - `None` and `Some([1, NaN])`.
    //
    // Expect
    // ------
    // - `MissingThetaHat` and `InvalidThetaHat { index: 1 }`.
    fn validate_theta_hat_rejects_missing_and_nan() {
        // Arrange / Act
        let missing = validate_theta_hat(None);
        let nan = validate_theta_hat(Some(array![1.0, f64::NAN]));

        // Assert
        assert_eq!(missing, Err(OptError::MissingThetaHat));
        assert!(matches!(nan, Err(OptError::InvalidThetaHat { index: 1, .. })));
    }
}
