//! refinement — diffraction-model refinement over many shots.
//!
//! Purpose
//! -------
//! Fit per-shot crystal, background and detector parameters together with
//! shared structure factors, spectra, panel geometry and gain to observed
//! spot pixels by minimizing a Poisson or Gaussian negative log-likelihood.
//!
//! Key behaviors
//! -------------
//! - [`core`]: shots, options, parameter layout, reparameterizations,
//!   likelihoods, priors, structure-factor bookkeeping, freezing.
//! - [`collaborators`]: the simulator, cell-manager and symmetry seams.
//! - [`evaluator`] / [`accumulator`]: per-spot simulation and chain-rule
//!   accumulation of functional, gradient and curvature.
//! - [`models`]: the [`Refiner`] target.
//! - [`diagnostics`] / [`state`]: progress summaries and the per-trial
//!   state archive.
//! - `synthetic` (feature `synthetic`): closed-form simulator and cubic
//!   cell for tests and demonstrations.
//!
//! Invariants & assumptions
//! ------------------------
//! - `Xall` holds every parameter of every worker; each worker refines only
//!   its own local block plus the shared global block.
//! - The optimizer sees only refined slots when `only_pass_refined_x` is set.
//!
//! Conventions
//! -----------
//! - Errors surface as [`RefineError`]; the optimizer boundary converts them
//!   into `OptError`.
//! - Only the root worker logs summaries and writes state.

pub mod accumulator;
pub mod collaborators;
pub mod core;
pub mod diagnostics;
pub mod errors;
pub mod evaluator;
pub mod models;
pub mod state;
#[cfg(any(test, feature = "synthetic"))]
pub mod synthetic;

// ---- Re-exports (primary public surface) ----------------------------------

pub use self::collaborators::{
    CellManager, FhklTable, MillerIndex, P1Symmetry, PanelGeometry, ParamId, Simulator, SymmetryExpander,
};
pub use self::core::{
    fcell::FcellIndexMap,
    noise::{LambdaAssembly, NoiseModel},
    options::{BackgroundMode, GlobalFlags, RefineFlags, RefinerOptions},
    shots::{BackgroundPlane, CrystalModel, RegionOfInterest, Shot, ShotId, ShotInputs, ShotMap, Spectrum, Spot},
};
pub use self::errors::{RefineError, RefineResult};
pub use self::models::{Refiner, RefinerInputs};
pub use self::state::{RefinerState, StateArchive};

pub mod prelude {
    pub use super::{
        BackgroundMode, BackgroundPlane, CellManager, CrystalModel, FhklTable, MillerIndex, NoiseModel,
        RefineError, RefineFlags, RefineResult, Refiner, RefinerInputs, RefinerOptions, RegionOfInterest,
        Shot, ShotInputs, ShotMap, Simulator, Spectrum, Spot, SymmetryExpander,
    };
}
