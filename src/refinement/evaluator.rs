//! refinement::evaluator — drives the simulator for one shot and one spot.
//!
//! Purpose
//! -------
//! Translate physical parameter values into simulator calls and collect the
//! model image of each spot together with the derivative images the
//! accumulator needs.
//!
//! Key behaviors
//! -------------
//! - [`prepare_shot`]: spectrum, U matrix, unit cell (B and its
//!   derivative matrices), mosaic size and misset angles.
//! - [`simulate_spot`]: panel geometry, region of interest, simulation,
//!   then raw pixels plus first (and optionally second) derivative images
//!   for every refined identifier.
//! - [`push_structure_factors`]: writes ASU amplitudes into the
//!   simulator's full table through the symmetry expander; equivalents
//!   missing from the table are skipped.
//!
//! Conventions
//! -----------
//! - Images are returned unscaled; crystal scale and gain are applied by
//!   the caller.
use crate::refinement::{
    collaborators::{PanelGeometry, ParamId, Simulator, SymmetryExpander},
    core::{
        fcell::FcellIndexMap,
        shots::{Shot, Spot},
    },
    errors::{RefineError, RefineResult},
};
use ndarray::Array1;
use std::collections::BTreeMap;

/// Physical per-shot values handed to the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct ShotValues {
    pub rotation: [f64; 3],
    pub unit_cell: Vec<f64>,
    pub ncells: Vec<f64>,
}

/// Model image of one spot with its derivative images.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotModel {
    pub raw: Array1<f64>,
    pub first: BTreeMap<ParamId, Array1<f64>>,
    pub second: BTreeMap<ParamId, Array1<f64>>,
}

impl SpotModel {
    pub fn first(&self, id: ParamId) -> Option<&Array1<f64>> {
        self.first.get(&id)
    }

    pub fn second(&self, id: ParamId) -> Option<&Array1<f64>> {
        self.second.get(&id)
    }
}

/// Position the simulator on `shot`.
///
/// The shot's cell manager is updated in place so its B matrix follows
/// `values.unit_cell`.
///
/// # Errors
/// Cell manager failures.
pub fn prepare_shot<S: Simulator>(
    sim: &mut S, shot: &mut Shot, values: &ShotValues, track_curvature: bool,
) -> RefineResult<()> {
    sim.set_spectrum(&shot.spectrum);
    sim.set_umatrix(&shot.crystal.u_matrix);

    shot.crystal.cell.set_variables(&values.unit_cell)?;
    sim.set_bmatrix(&shot.crystal.cell.b_matrix());
    let firsts = shot.crystal.cell.derivative_matrices();
    let seconds = if track_curvature { shot.crystal.cell.second_derivative_matrices() } else { Vec::new() };
    for (i, first) in firsts.iter().enumerate() {
        sim.set_ucell_derivative_matrix(i, first, seconds.get(i));
    }

    sim.set_ncells(&values.ncells);
    for (axis, angle) in values.rotation.iter().enumerate() {
        sim.set_value(ParamId::rotation(axis), *angle);
    }
    Ok(())
}

/// Simulate `spot` under `geometry` and read back the images of `refined`.
///
/// # Errors
/// Simulator failures, or a model image whose size differs from the spot.
pub fn simulate_spot<S: Simulator>(
    sim: &mut S, spot: &Spot, geometry: &PanelGeometry, refined: &[ParamId], track_curvature: bool,
) -> RefineResult<SpotModel> {
    sim.update_geometry(geometry)?;
    sim.set_region_of_interest(&spot.roi);
    sim.add_spots()?;

    let raw = sim.raw_pixels_roi();
    if raw.len() != spot.n_pixels() {
        return Err(RefineError::PixelCountMismatch {
            field: "model",
            expected: spot.n_pixels(),
            found: raw.len(),
        });
    }
    let first = refined.iter().map(|&id| (id, sim.derivative_pixels(id))).collect();
    let second = if track_curvature {
        refined.iter().map(|&id| (id, sim.second_derivative_pixels(id))).collect()
    } else {
        BTreeMap::new()
    };
    Ok(SpotModel { raw, first, second })
}

/// Initial amplitude of every structure factor, read from the simulator.
///
/// # Errors
/// [`RefineError::MissingAmplitude`] for an ASU index absent from the table.
pub fn read_structure_factors<S: Simulator>(sim: &S, map: &FcellIndexMap) -> RefineResult<Vec<f64>> {
    let table = sim.fhkl_table();
    let positions = table.positions();
    map.indices()
        .iter()
        .map(|hkl| {
            positions
                .get(hkl)
                .and_then(|&i| table.amplitudes.get(i))
                .copied()
                .ok_or(RefineError::MissingAmplitude { hkl: *hkl })
        })
        .collect()
}

/// Write `amplitudes` (one per dense index) into the simulator's table.
///
/// # Errors
/// Simulator failures while storing the table.
pub fn push_structure_factors<S: Simulator>(
    sim: &mut S, symmetry: &dyn SymmetryExpander, map: &FcellIndexMap, amplitudes: &[f64],
) -> RefineResult<()> {
    let mut table = sim.fhkl_table();
    let positions = table.positions();
    for (i_fcell, &amplitude) in amplitudes.iter().enumerate() {
        for hkl in symmetry.equivalents(map.asu(i_fcell)) {
            match positions.get(&hkl) {
                Some(&pos) => table.amplitudes[pos] = amplitude,
                None => log::debug!("equivalent {hkl:?} not in amplitude table, skipping"),
            }
        }
    }
    sim.set_fhkl_table(&table)
}
