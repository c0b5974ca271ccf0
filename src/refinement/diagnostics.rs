//! refinement::diagnostics — progress statistics of a refinement.
//!
//! Purpose
//! -------
//! Summaries the refiner logs after each evaluation when verbose: how well
//! model and data overlap, how crystal scales are distributed, how far
//! refined amplitudes sit from a reference set, and how many numerical
//! clamps were hit.
//!
//! Key behaviors
//! -------------
//! - [`pearson`]: sample correlation of two pixel vectors.
//! - [`SummaryStats`]: median, mean, min, max and standard deviation via
//!   `statrs`.
//! - [`r_factor`] / [`least_squares_scale`]: `Σ|F_ref − k·F| / Σ|F_ref|`.
//! - [`correction_misset`]: rotation matrix from the three misset angles.
//! - [`IterationReport`]: one line per evaluation through `log::info!`.
//!
//! Invariants & assumptions
//! ------------------------
//! - Degenerate inputs (too short, zero variance, zero denominators) yield
//!   `None` rather than NaN.
use nalgebra::{Matrix3, Rotation3, Vector3};
use statrs::statistics::{Data, Median, Statistics};

/// Sample Pearson correlation, `None` for fewer than two points, unequal
/// lengths or a constant input.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let cov = Statistics::covariance(a.iter(), b.iter());
    let sa = Statistics::std_dev(a.iter());
    let sb = Statistics::std_dev(b.iter());
    let denom = sa * sb;
    if !(denom.is_finite() && denom > 0.0) {
        return None;
    }
    Some(cov / denom)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryStats {
    pub median: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample standard deviation; zero for a single value.
    pub std: f64,
}

impl SummaryStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let std = if values.len() > 1 { Statistics::std_dev(values.iter()) } else { 0.0 };
        Some(Self {
            median: Data::new(values.to_vec()).median(),
            mean: Statistics::mean(values.iter()),
            min: Statistics::min(values.iter()),
            max: Statistics::max(values.iter()),
            std,
        })
    }
}

/// `k` minimizing `Σ(F_ref − k·F)²`.
pub fn least_squares_scale(refined: &[f64], reference: &[f64]) -> Option<f64> {
    let ff: f64 = refined.iter().map(|f| f * f).sum();
    if refined.len() != reference.len() || ff <= 0.0 {
        return None;
    }
    let fr: f64 = refined.iter().zip(reference).map(|(f, r)| f * r).sum();
    Some(fr / ff)
}

/// `Σ|F_ref − k·F| / Σ|F_ref|`.
pub fn r_factor(refined: &[f64], reference: &[f64], scale: f64) -> Option<f64> {
    let denom: f64 = reference.iter().map(|r| r.abs()).sum();
    if refined.len() != reference.len() || denom <= 0.0 {
        return None;
    }
    let num: f64 = refined.iter().zip(reference).map(|(f, r)| (r - scale * f).abs()).sum();
    Some(num / denom)
}

/// `RX·RY·RZ`, each a rotation about the negative axis by its angle.
pub fn correction_misset(angles: [f64; 3]) -> Matrix3<f64> {
    let rx = Rotation3::from_axis_angle(&-Vector3::x_axis(), angles[0]);
    let ry = Rotation3::from_axis_angle(&-Vector3::y_axis(), angles[1]);
    let rz = Rotation3::from_axis_angle(&-Vector3::z_axis(), angles[2]);
    (rx * ry * rz).into_inner()
}

/// Axis and angle (degrees) of [`correction_misset`]; `None` for the
/// identity.
pub fn misset_axis_angle_deg(angles: [f64; 3]) -> Option<(Vector3<f64>, f64)> {
    let rotation = Rotation3::from_matrix_unchecked(correction_misset(angles));
    rotation.axis_angle().map(|(axis, angle)| (axis.into_inner(), angle.to_degrees()))
}

/// Per-evaluation summary logged by the root worker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IterationReport {
    pub iteration: usize,
    pub functional: f64,
    pub grad_norm: f64,
    pub num_kludge: usize,
    pub num_fcell_kludge: usize,
    /// Mean image/model correlation over the spots of this worker.
    pub overlay_correlation: Option<f64>,
    pub scales: Option<SummaryStats>,
    pub r_factor: Option<f64>,
    pub using_curvatures: bool,
}

impl IterationReport {
    pub fn log(&self) {
        log::info!(
            "iter {:>4} | f = {:.6e} | |g| = {:.3e} | curvatures: {} | kludges: {} Λ, {} F",
            self.iteration,
            self.functional,
            self.grad_norm,
            if self.using_curvatures { "on" } else { "off" },
            self.num_kludge,
            self.num_fcell_kludge,
        );
        if let Some(corr) = self.overlay_correlation {
            log::info!("    overlay correlation {corr:.4}");
        }
        if let Some(s) = &self.scales {
            log::info!(
                "    crystal scale median {:.4e} mean {:.4e} min {:.4e} max {:.4e} std {:.4e}",
                s.median,
                s.mean,
                s.min,
                s.max,
                s.std
            );
        }
        if let Some(r) = self.r_factor {
            log::info!("    R-factor against reference {r:.4}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // Correlation, summary statistics, R-factor scaling and the misset
    // rotation convention.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // Perfectly (anti-)correlated vectors give ±1 and constants give None.
    //
    // Given
    // -----
    // - [1, 2, 3] against [2, 4, 6], [3, 2, 1] and [5, 5, 5].
    //
    // Expect
    // ------
    // - 1, −1, None.
    fn pearson_limits() {
        // Arrange
        let a = [1.0, 2.0, 3.0];

        // Act / Assert
        assert!((pearson(&a, &[2.0, 4.0, 6.0]).expect("defined") - 1.0).abs() < 1e-12);
        assert!((pearson(&a, &[3.0, 2.0, 1.0]).expect("defined") + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&a, &[5.0, 5.0, 5.0]), None);
    }

    #[test]
    // Purpose
    // -------
    // Summary statistics of a small sample.
    //
    // Given
    // -----
    // - [4, 1, 3, 2].
    //
    // Expect
    // ------
    // - median 2.5, mean 2.5, min 1, max 4, sample std sqrt(5/3).
    fn summary_stats_of_sample() {
        // Arrange / Act
        let s = SummaryStats::from_values(&[4.0, 1.0, 3.0, 2.0]).expect("non-empty");

        // Assert
        assert_relative_eq!(s.median, 2.5);
        assert_relative_eq!(s.mean, 2.5);
        assert_eq!((s.min, s.max), (1.0, 4.0));
        assert_relative_eq!(s.std, (5.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_eq!(SummaryStats::from_values(&[]), None);
    }

    #[test]
    // Purpose
    // -------
    // A refined set off by a constant factor has zero R-factor at the
    // least-squares scale.
    //
    // Given
    // -----
    // - refined = reference / 2.
    //
    // Expect
    // ------
    // - scale 2, R 0; R at scale 1 is 0.5.
    fn r_factor_with_scale() {
        // Arrange
        let reference = [10.0, 20.0, 30.0];
        let refined = [5.0, 10.0, 15.0];

        // Act
        let k = least_squares_scale(&refined, &reference).expect("scale");

        // Assert
        assert_relative_eq!(k, 2.0, epsilon = 1e-12);
        assert!(r_factor(&refined, &reference, k).expect("r") < 1e-12);
        assert!((r_factor(&refined, &reference, 1.0).expect("r") - 0.5).abs() < 1e-12);
    }

    #[test]
    // Purpose
    // -------
    // The misset about X rotates about the negative X axis.
    //
    // Given
    // -----
    // - angles (π/2, 0, 0).
    //
    // Expect
    // ------
    // - M·ŷ = −ẑ; zero angles give the identity and no axis.
    fn misset_rotates_about_negative_axes() {
        // Arrange
        let m = correction_misset([std::f64::consts::FRAC_PI_2, 0.0, 0.0]);

        // Act
        let y = m * Vector3::y();

        // Assert
        assert!((y - (-Vector3::z())).norm() < 1e-12);
        assert!((correction_misset([0.0; 3]) - Matrix3::identity()).norm() < 1e-15);
        assert!(misset_axis_angle_deg([0.0; 3]).is_none());
    }
}
