//! refinement::core — data model and bookkeeping of a refinement.
//!
//! Purpose
//! -------
//! Everything the refiner needs before it runs a single simulation: shots
//! and their inputs, options, the flat parameter layout, the internal ↔
//! physical parameter maps, structure-factor bookkeeping, likelihoods,
//! priors and the freeze schedule.
//!
//! Key behaviors
//! -------------
//! - `shots`: [`shots::ShotMap`] keyed by explicit shot ids, assembled from
//!   per-shot mappings with key-set checks.
//! - `options`: [`options::RefinerOptions`], serde-loadable and validated.
//! - `layout`: [`layout::ParameterLayout`] and [`layout::RefinedSubset`].
//! - `reparam`: [`reparam::Reparam`] maps and chain factors.
//! - `fcell`: index map, multiplicity gating, resolution sigmas.
//! - `noise`: Poisson and Gaussian likelihoods, `Λ` assembly.
//! - `priors`, `freeze`, `validation`: restraints, round-robin freezing and
//!   setup cross-checks.
//!
//! Invariants & assumptions
//! ------------------------
//! - Nothing in this module talks to a simulator or a reduction backend.

pub mod fcell;
pub mod freeze;
pub mod layout;
pub mod noise;
pub mod options;
pub mod priors;
pub mod reparam;
pub mod shots;
pub mod validation;
