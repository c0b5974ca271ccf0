//! lbfgs — quasi-Newton driver for refinement targets.
//!
//! Purpose
//! -------
//! Minimize a [`RefinementTarget`] with L-BFGS, with or without a diagonal
//! curvature preconditioner, and carry the curvature restart protocol
//! between the target and its caller.
//!
//! Key behaviors
//! -------------
//! - [`minimize`] picks the backend:
//!   - gradient-only: argmin L-BFGS (More–Thuente or Hager–Zhang) behind
//!     [`adapter::ArgMinAdapter`], built by [`builders`] and executed by
//!     [`run::run_lbfgs`];
//!   - curvature-aided: the in-crate solver in [`diag`].
//! - [`control::CurvatureController`] turns each evaluation's curvature
//!   into a [`StepStatus`]; statuses other than `Continue` stop the solver
//!   and come back as an outcome with `hit_restart` set.
//! - [`finite_diff::check_gradient`] validates analytic gradients.
//!
//! Invariants & assumptions
//! ------------------------
//! - The functional is minimized as is; there are no sign flips.
//! - Targets count their own evaluations; `max_calls` is checked against
//!   that count by both backends.
//! - Configuration types ([`SolverOptions`], [`Tolerances`]) are validated
//!   on construction.
//!
//! Downstream usage
//! ----------------
//! - The refiner implements [`RefinementTarget`] and calls [`minimize`]
//!   repeatedly, switching to curvature mode after a
//!   `RequestCurvatureRestart`.
//!
//! Testing notes
//! -------------
//! - Unit tests in each submodule use small analytic targets (quadratics,
//!   smooth two-parameter functions) with known minima and gradients.

pub mod adapter;
pub mod api;
pub mod builders;
pub mod control;
pub mod diag;
pub mod finite_diff;
pub mod run;
pub mod traits;
pub mod types;
pub mod validation;

// ---- Re-exports (primary public surface) ----------------------------------

pub use self::api::minimize;
pub use self::control::{CurvatureController, CurvatureDecision, CurvatureMode, StepStatus};
pub use self::finite_diff::{GradientCheck, check_gradient};
pub use self::traits::{
    DropConvergence, Evaluation, LineSearchParams, LineSearcher, RefineOutcome, RefinementTarget,
    SolverOptions, Termination, Tolerances,
};
pub use self::types::{Cost, Curv, DEFAULT_LBFGS_MEM, FnEvalMap, Grad, Theta};

pub mod prelude {
    pub use super::api::minimize;
    pub use super::control::StepStatus;
    pub use super::traits::{Evaluation, RefineOutcome, RefinementTarget, SolverOptions, Tolerances};
    pub use super::types::{Cost, Curv, Grad, Theta};
}
