//! optimization — quasi-Newton driver, numerical helpers, and error surface.
//!
//! Purpose
//! -------
//! Provide the optimizer side of the refinement: an L-BFGS driver over a
//! pull-model [`lbfgs::RefinementTarget`], the curvature restart protocol,
//! shared numerical guards, and a single error/result surface.
//!
//! Key behaviors
//! -------------
//! - `lbfgs`: gradient-only argmin L-BFGS, an in-crate curvature-aided
//!   L-BFGS, restart signalling, and a finite-difference gradient check.
//! - `numerical_stability`: floors and bounded maps used in tight loops.
//! - `errors`: [`errors::OptError`] / [`errors::OptResult`], with `From`
//!   conversions for argmin errors and refinement configuration errors.
//!
//! Conventions
//! -----------
//! - The functional is minimized directly.
//! - Public entrypoints that can fail return `OptResult<T>`; callers never
//!   see raw argmin errors.
//!
//! Testing notes
//! -------------
//! - Unit tests in the submodules use analytic targets; the refinement
//!   integration test drives the optimizer end to end.

pub mod errors;
pub mod lbfgs;
pub mod numerical_stability;

pub mod prelude {
    pub use super::errors::{OptError, OptResult};
    pub use super::lbfgs::prelude::*;
    pub use super::numerical_stability::prelude::*;
}
