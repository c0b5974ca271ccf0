//! bragg_refine — least-squares refinement of diffraction-pattern models.
//!
//! Purpose
//! -------
//! Serve as the crate root. The crate refines a physical model of Bragg
//! spots (crystal orientation, unit cell, mosaic size, scale, background,
//! structure factors, spectra, detector geometry and gain) against observed
//! pixels from many shots, optionally split across several workers.
//!
//! Key behaviors
//! -------------
//! - [`refinement`]: data model, simulator seam, the [`refinement::Refiner`]
//!   target, diagnostics and state persistence.
//! - [`optimization`]: L-BFGS drivers with the curvature restart protocol
//!   and a finite-difference gradient check.
//! - [`reduction`]: collective sums across workers, single-process or
//!   thread-backed.
//!
//! Invariants & assumptions
//! ------------------------
//! - The diffraction simulator is an external collaborator behind
//!   [`refinement::Simulator`]; the crate ships only a closed-form synthetic
//!   implementation, behind the `synthetic` feature.
//! - Workers run in lockstep; every collective is issued by every member.
//!
//! Conventions
//! -----------
//! - Logging goes through the `log` facade; callers install a logger.
//! - Errors are rich enums per layer: `RefineError`, `ReductionError`,
//!   `OptError`.
//!
//! Downstream usage
//! ----------------
//! - Build a [`refinement::ShotMap`] (directly or from
//!   [`refinement::ShotInputs`]), pick [`refinement::RefinerOptions`],
//!   wrap a simulator in [`refinement::RefinerInputs`], call
//!   `Refiner::setup` with a reduction backend, then `run_until_settled`.
//!
//! Testing notes
//! -------------
//! - Unit tests live next to each module; `tests/` holds the end-to-end
//!   refinement pipeline, including two-worker equivalence.

pub mod optimization;
pub mod reduction;
pub mod refinement;

pub mod prelude {
    pub use crate::optimization::prelude::*;
    pub use crate::reduction::{LocalGroup, ReductionBackend, SingleProcess};
    pub use crate::refinement::prelude::*;
}
