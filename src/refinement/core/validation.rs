//! Cross-checks between shots, structure factors and options.
//!
//! Runs once at setup, after [`RefinerOptions::validate`] and before the
//! layout is built, so evaluation never meets an inconsistent input.
use crate::refinement::{
    core::{
        fcell::FcellIndexMap,
        options::{BackgroundMode, RefinerOptions},
        shots::ShotMap,
    },
    errors::{RefineError, RefineResult},
};

/// Validate `shots` against `fcells` and `options`.
///
/// # Returns
/// The number of free unit-cell variables shared by every crystal.
///
/// # Errors
/// - [`RefineError::EmptyShotSet`] when `shots` is empty.
/// - [`RefineError::CellVariableMismatch`] when cell managers disagree.
/// - [`RefineError::UnknownAsuIndex`] for spots outside the index map.
/// - [`RefineError::MissingShotInput`] for extracted-background mode
///   without a background estimate.
/// - [`RefineError::UnknownPanelGroup`] when panel refinement is on, a
///   group map is given, and a spot's panel is not in it.
pub fn validate_shots(
    shots: &ShotMap, fcells: &FcellIndexMap, options: &RefinerOptions,
) -> RefineResult<usize> {
    let Some(first) = shots.values().next() else {
        return Err(RefineError::EmptyShotSet);
    };
    let n_unit_cell = first.crystal.cell.variables().len();
    let panels_refined = options.refine.panel_rotation || options.refine.panel_xy;

    for (&shot_id, shot) in shots {
        let found = shot.crystal.cell.variables().len();
        if found != n_unit_cell {
            return Err(RefineError::CellVariableMismatch { shot: shot_id, expected: n_unit_cell, found });
        }
        for spot in &shot.spots {
            fcells.dense(&spot.asu)?;
            if options.background_mode == BackgroundMode::Extracted && spot.background_estimate.is_none() {
                return Err(RefineError::MissingShotInput { shot: shot_id, field: "background_estimates" });
            }
            if panels_refined
                && !options.panel_groups.is_empty()
                && !options.panel_groups.contains_key(&spot.panel)
            {
                return Err(RefineError::UnknownPanelGroup { panel: spot.panel });
            }
        }
    }
    Ok(n_unit_cell)
}
