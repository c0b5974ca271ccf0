//! reduction — collective sums across refinement workers.
//!
//! Purpose
//! -------
//! Give the refiner one operation, `reduce_broadcast`, that sums a value
//! over every worker and hands the sum back to all of them. Functional,
//! gradient, curvature, multiplicity counts, the refined mask, `Xall` and
//! the structure-factor clamp counter all go through it.
//!
//! Key behaviors
//! -------------
//! - [`Reducible`]: numbers and vectors add, flag vectors or, count maps
//!   add per key.
//! - [`SingleProcess`]: identity backend for one worker.
//! - [`LocalGroup`]: blocking collective across threads of one process;
//!   members are combined in rank order.
//!
//! Invariants & assumptions
//! ------------------------
//! - Collectives are matched in program order: every member issues the
//!   same sequence of `reduce_broadcast` calls with the same value types.
//! - Rank 0 is the root; only the root logs summaries or writes state.

pub mod backend;
pub mod errors;
pub mod reducible;

pub use self::backend::{LocalGroup, ReductionBackend, SingleProcess};
pub use self::errors::{ReductionError, ReductionResult};
pub use self::reducible::Reducible;
