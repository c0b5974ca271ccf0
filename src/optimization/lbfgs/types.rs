//! lbfgs::types — shared numeric aliases and solver wiring.
//!
//! Purpose
//! -------
//! Centralize the numeric types and solver aliases used by the refinement
//! optimizer so the rest of the optimization code stays agnostic to
//! `ndarray` and argmin generics.
//!
//! Key behaviors
//! -------------
//! - Define canonical aliases for parameter vectors, gradients, curvature
//!   diagonals and scalar functionals (`Theta`, `Grad`, `Curv`, `Cost`).
//! - Provide a standard map type for function-evaluation counters
//!   (`FnEvalMap`).
//! - Expose pre-wired argmin L-BFGS aliases for the two line searches used
//!   by the gradient-only backend.
//!
//! Invariants & assumptions
//! ------------------------
//! - All optimizer vectors are `ndarray::Array1<f64>`.
//! - `Cost` is the refinement functional itself (a negative
//!   log-likelihood); no sign flips happen anywhere in the optimizer.
//! - `Curv` holds the diagonal of the Hessian of the functional with
//!   respect to the optimizer vector; it has the same length as `Theta`.
//!
//! Testing notes
//! -------------
//! - Type aliases only; exercised indirectly by the solver modules.
use argmin::solver::{
    linesearch::{HagerZhangLineSearch, MoreThuenteLineSearch},
    quasinewton::LBFGS,
};
use ndarray::Array1;
use std::collections::HashMap;

/// Optimizer vector `x` (the refined subset of the full parameter vector).
pub type Theta = Array1<f64>;

/// Gradient of the functional with respect to `x`.
pub type Grad = Array1<f64>;

/// Diagonal curvature `∂²f/∂x_i²`, same shape as `Theta`.
pub type Curv = Array1<f64>;

/// Scalar refinement functional.
pub type Cost = f64;

/// Function-evaluation counters keyed by counter name (e.g. `"cost_count"`).
pub type FnEvalMap = HashMap<String, u64>;

/// Default history size (`m`) for L-BFGS runs.
pub const DEFAULT_LBFGS_MEM: usize = 5;

/// Hager–Zhang line search specialized to this crate’s numeric types.
pub type HagerZhangLS = HagerZhangLineSearch<Theta, Grad, Cost>;

/// More–Thuente line search specialized to this crate’s numeric types.
pub type MoreThuenteLS = MoreThuenteLineSearch<Theta, Grad, Cost>;

/// L-BFGS solver wired to the Hager–Zhang line search.
pub type LbfgsHagerZhang = LBFGS<HagerZhangLS, Theta, Grad, Cost>;

/// L-BFGS solver wired to the More–Thuente line search.
pub type LbfgsMoreThuente = LBFGS<MoreThuenteLS, Theta, Grad, Cost>;
