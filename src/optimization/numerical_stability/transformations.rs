//! Numerical stability utilities.
//!
//! Guarded versions of the few nonlinear maps the refinement uses on every
//! pixel or parameter, so callers never feed `ln` or `asin` something
//! outside their domain.
//!
//! # Provided items
//! - [`LAMBDA_FLOOR`]: smallest expected photon count used inside `ln` and
//!   reciprocals of the likelihood.
//! - [`floored`]: clamp a value from below, reporting whether it was hit.
//! - [`bounded_sin`], [`bounded_sin_phase`], [`bounded_sin_inverse`]: the
//!   sine map that keeps a parameter inside `[low, high]`.
//! - [`clamped_asin`]: `asin` with its argument clamped to `[-1, 1]`.

/// Floor for the expected photon count `Λ` (and the Gaussian variance)
/// wherever it enters `ln` or a reciprocal.
pub const LAMBDA_FLOOR: f64 = 1e-6;

/// Clamp `value` from below at `floor`.
///
/// # Returns
/// `(clamped_value, was_clamped)`; non-finite or NaN inputs are clamped.
pub fn floored(value: f64, floor: f64) -> (f64, bool) {
    if value > floor { (value, false) } else { (floor, true) }
}

/// `asin` with its argument clamped into `[-1, 1]`.
pub fn clamped_asin(arg: f64) -> f64 {
    arg.clamp(-1.0, 1.0).asin()
}

/// Phase of the bounded sine map at internal value `x`.
///
/// `phase = sigma·(x − 1) + asin(2·(init − low)/(high − low) − 1)`.
pub fn bounded_sin_phase(x: f64, sigma: f64, init: f64, low: f64, high: f64) -> f64 {
    sigma * (x - 1.0) + clamped_asin(2.0 * (init - low) / (high - low) - 1.0)
}

/// Bounded sine map: `θ = (sin(phase) + 1)·(high − low)/2 + low`.
///
/// At `x = 1` this reproduces `init` whenever `init ∈ [low, high]`.
pub fn bounded_sin(x: f64, sigma: f64, init: f64, low: f64, high: f64) -> f64 {
    let phase = bounded_sin_phase(x, sigma, init, low, high);
    (phase.sin() + 1.0) * (high - low) / 2.0 + low
}

/// Internal value `x` that maps to `theta` under [`bounded_sin`], taking
/// the branch closest to `x = 1`.
pub fn bounded_sin_inverse(theta: f64, sigma: f64, init: f64, low: f64, high: f64) -> f64 {
    let phase = clamped_asin(2.0 * (theta - low) / (high - low) - 1.0);
    let phase0 = clamped_asin(2.0 * (init - low) / (high - low) - 1.0);
    (phase - phase0) / sigma + 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    // Purpose
    // -------
    // The floor reports when it is applied.
    //
    // Given
    // -----
    // - 2.0, 0.0, -3.0 and NaN against the default floor.
    //
    // Expect
    // ------
    // - Only 2.0 passes through unclamped.
    fn floored_reports_clamping() {
        // Arrange / Act / Assert
        assert_eq!(floored(2.0, LAMBDA_FLOOR), (2.0, false));
        assert_eq!(floored(0.0, LAMBDA_FLOOR), (LAMBDA_FLOOR, true));
        assert_eq!(floored(-3.0, LAMBDA_FLOOR), (LAMBDA_FLOOR, true));
        assert_eq!(floored(f64::NAN, LAMBDA_FLOOR), (LAMBDA_FLOOR, true));
    }

    #[test]
    // Purpose
    // -------
    // The bounded map reproduces `init` at x = 1 and stays inside its range.
    //
    // Given
    // -----
    // - init 0.3 on [-1, 2], sigma 0.5; x swept over [-50, 50].
    //
    // Expect
    // ------
    // - bounded_sin(1) == init to 1e-12; every value within [low, high].
    fn bounded_sin_round_trips_and_stays_in_range() {
        // Arrange
        let (sigma, init, low, high) = (0.5, 0.3, -1.0, 2.0);

        // Act
        let at_one = bounded_sin(1.0, sigma, init, low, high);
        let swept: Vec<f64> =
            (-50..=50).map(|k| bounded_sin(k as f64, sigma, init, low, high)).collect();

        // Assert
        assert!((at_one - init).abs() < 1e-12);
        assert!(swept.iter().all(|v| *v >= low - 1e-12 && *v <= high + 1e-12));
    }

    #[test]
    // Purpose
    // -------
    // The inverse recovers x near 1.
    //
    // Given
    // -----
    // - x = 1.2, sigma 0.1, init 0.5 on [0, 1].
    //
    // Expect
    // ------
    // - bounded_sin_inverse(bounded_sin(x)) == x to 1e-10.
    fn bounded_sin_inverse_recovers_internal_value() {
        // Arrange
        let (x, sigma, init, low, high) = (1.2, 0.1, 0.5, 0.0, 1.0);

        // Act
        let theta = bounded_sin(x, sigma, init, low, high);
        let back = bounded_sin_inverse(theta, sigma, init, low, high);

        // Assert
        assert!((back - x).abs() < 1e-10);
    }
}
