//! numerical_stability — guarded scalar maps shared by the refinement.
//!
//! Purpose
//! -------
//! Keep the small numerical guards of the refinement in one place: the
//! floor applied to expected photon counts before `ln` and reciprocals, and
//! the bounded sine map used by range-restricted parameters.
//!
//! Invariants & assumptions
//! ------------------------
//! - Every function is total on finite `f64` inputs; out-of-domain
//!   arguments are clamped, never propagated as NaN.
//! - This module never logs or performs I/O.
//!
//! Downstream usage
//! ----------------
//! - `refinement::core::noise` floors `Λ` with [`LAMBDA_FLOOR`].
//! - `refinement::core::reparam` builds its bounded class on
//!   [`bounded_sin`].

pub mod transformations;

pub use self::transformations::{
    LAMBDA_FLOOR, bounded_sin, bounded_sin_inverse, bounded_sin_phase, clamped_asin, floored,
};

pub mod prelude {
    pub use super::transformations::{LAMBDA_FLOOR, bounded_sin, floored};
}
