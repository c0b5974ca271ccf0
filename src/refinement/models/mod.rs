//! models — the multi-shot refiner.
//!
//! Purpose
//! -------
//! Tie the data model in `refinement::core`, the simulator seam, the
//! reduction backend and the L-BFGS driver together into one refinement
//! target.
//!
//! Key behaviors
//! -------------
//! - [`RefinerInputs`] bundles shots, simulator, symmetry and optional
//!   overrides (structure-factor map, resolution bins, reference
//!   amplitudes, initial `Xall`).
//! - [`Refiner::setup`] lays out `Xall` across workers and prepares the
//!   simulator; [`Refiner::run`] / [`Refiner::run_until_settled`] drive the
//!   solver through the curvature restart protocol.
//!
//! Invariants & assumptions
//! ------------------------
//! - All members of a reduction group call `setup` and every evaluation in
//!   lockstep.
//!
//! Testing notes
//! -------------
//! - Unit tests in [`refiner`] use the synthetic simulator on one worker;
//!   the integration test covers multi-worker equivalence and convergence.

pub mod refiner;

pub use self::refiner::{Refiner, RefinerInputs};

pub mod prelude {
    pub use super::refiner::{Refiner, RefinerInputs};
}
