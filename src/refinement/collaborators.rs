//! Contracts of the external collaborators driven by the refiner.
//!
//! The refiner never computes diffraction itself. It positions a
//! [`Simulator`], asks it for pixel images and their parameter derivatives,
//! uses a [`CellManager`] per crystal to turn free unit-cell variables into
//! a B matrix, and uses a [`SymmetryExpander`] to write asymmetric-unit
//! amplitudes into the simulator's full amplitude table.
//!
//! Pixel images exchanged with the simulator are flattened row-major over
//! the current region of interest (slow index outer, fast index inner).
use crate::refinement::core::shots::{PanelId, RegionOfInterest, Spectrum};
use crate::refinement::errors::{RefineError, RefineResult};
use nalgebra::Matrix3;
use ndarray::Array1;
use std::collections::HashMap;
use std::fmt;

/// Miller index `(h, k, l)`.
pub type MillerIndex = [i32; 3];

/// Parameter identifiers understood by the simulator.
///
/// Each identifier has a fixed numeric code ([`ParamId::code`]) shared with
/// simulator implementations that work on integer ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamId {
    RotX,
    RotY,
    RotZ,
    /// Free unit-cell variable `i`.
    UnitCell(usize),
    /// Mosaic block size along axis `i` (0 for isotropic).
    Ncells(usize),
    OriginZ,
    Fcell,
    Lambda0,
    Lambda1,
    PanelRot,
    PanelX,
    PanelY,
}

impl ParamId {
    pub fn code(self) -> usize {
        match self {
            ParamId::RotX => 0,
            ParamId::RotY => 1,
            ParamId::RotZ => 2,
            ParamId::UnitCell(i) => 3 + i,
            ParamId::Ncells(_) => 9,
            ParamId::OriginZ => 10,
            ParamId::Fcell => 11,
            ParamId::Lambda0 => 12,
            ParamId::Lambda1 => 13,
            ParamId::PanelRot => 14,
            ParamId::PanelX => 15,
            ParamId::PanelY => 16,
        }
    }

    pub fn rotation(axis: usize) -> Self {
        match axis {
            0 => ParamId::RotX,
            1 => ParamId::RotY,
            _ => ParamId::RotZ,
        }
    }
}

/// Full (P1) amplitude table of the simulator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FhklTable {
    pub indices: Vec<MillerIndex>,
    pub amplitudes: Vec<f64>,
}

impl FhklTable {
    pub fn new(indices: Vec<MillerIndex>, amplitudes: Vec<f64>) -> RefineResult<Self> {
        if indices.len() != amplitudes.len() {
            return Err(RefineError::PixelCountMismatch {
                field: "amplitudes",
                expected: indices.len(),
                found: amplitudes.len(),
            });
        }
        Ok(Self { indices, amplitudes })
    }

    /// Position of every index in the table.
    pub fn positions(&self) -> HashMap<MillerIndex, usize> {
        self.indices.iter().enumerate().map(|(i, hkl)| (*hkl, i)).collect()
    }
}

/// Panel placement relative to the nominal detector model.
///
/// - `origin_shift`: offset of the panel origin (x, y, z).
/// - `rotation`: rotation of the panel group about its normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanelGeometry {
    pub panel: PanelId,
    pub origin_shift: [f64; 3],
    pub rotation: f64,
}

/// Pixel simulator with analytic parameter derivatives.
pub trait Simulator {
    /// Enable derivative tracking for `id`.
    fn refine(&mut self, id: ParamId);
    /// Finish setup once every refined id has been declared.
    fn initialize_managers(&mut self) -> RefineResult<()>;

    fn set_value(&mut self, id: ParamId, value: f64);
    fn set_ncells(&mut self, values: &[f64]);
    fn set_umatrix(&mut self, u: &Matrix3<f64>);
    fn set_bmatrix(&mut self, b: &Matrix3<f64>);
    /// Derivative of B with respect to free cell variable `index`, and its
    /// second derivative when curvatures are tracked.
    fn set_ucell_derivative_matrix(
        &mut self, index: usize, first: &Matrix3<f64>, second: Option<&Matrix3<f64>>,
    );
    fn set_spectrum(&mut self, spectrum: &Spectrum);
    fn set_lambda_coefficients(&mut self, coefficients: [f64; 2]);

    fn fhkl_table(&self) -> FhklTable;
    fn set_fhkl_table(&mut self, table: &FhklTable) -> RefineResult<()>;

    fn update_geometry(&mut self, geometry: &PanelGeometry) -> RefineResult<()>;
    fn set_region_of_interest(&mut self, roi: &RegionOfInterest);
    /// Simulate the current region of interest, accumulating into the raw
    /// image until [`zero_raw_pixels`](Simulator::zero_raw_pixels).
    fn add_spots(&mut self) -> RefineResult<()>;

    fn raw_pixels_roi(&self) -> Array1<f64>;
    fn derivative_pixels(&self, id: ParamId) -> Array1<f64>;
    fn second_derivative_pixels(&self, id: ParamId) -> Array1<f64>;
    fn zero_raw_pixels(&mut self);
}

/// Free unit-cell variables of one crystal and the B matrix they imply.
pub trait CellManager: fmt::Debug + Send {
    fn variables(&self) -> Vec<f64>;
    fn set_variables(&mut self, values: &[f64]) -> RefineResult<()>;
    fn variable_names(&self) -> Vec<String>;
    fn b_matrix(&self) -> Matrix3<f64>;
    fn derivative_matrices(&self) -> Vec<Matrix3<f64>>;
    fn second_derivative_matrices(&self) -> Vec<Matrix3<f64>>;
}

/// Expands an asymmetric-unit index into its symmetry equivalents.
pub trait SymmetryExpander: Send {
    fn equivalents(&self, asu: MillerIndex) -> Vec<MillerIndex>;
}

/// Space group P1: every index is its own only equivalent.
#[derive(Debug, Clone, Copy, Default)]
pub struct P1Symmetry;

impl SymmetryExpander for P1Symmetry {
    fn equivalents(&self, asu: MillerIndex) -> Vec<MillerIndex> {
        vec![asu]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    // Purpose
    // -------
    // Parameter codes follow the simulator's numbering.
    //
    // Given
    // -----
    // - Every `ParamId` variant.
    //
    // Expect
    // ------
    // - Rotations 0..2, cell 3+i, mosaic 9, origin 10, fcell 11, lambda
    //   12/13, panel 14..16.
    fn param_codes_follow_simulator_numbering() {
        // Arrange / Act / Assert
        assert_eq!(ParamId::RotX.code(), 0);
        assert_eq!(ParamId::RotZ.code(), 2);
        assert_eq!(ParamId::UnitCell(2).code(), 5);
        assert_eq!(ParamId::Ncells(1).code(), 9);
        assert_eq!(ParamId::OriginZ.code(), 10);
        assert_eq!(ParamId::Fcell.code(), 11);
        assert_eq!(ParamId::Lambda0.code(), 12);
        assert_eq!(ParamId::Lambda1.code(), 13);
        assert_eq!(ParamId::PanelRot.code(), 14);
        assert_eq!(ParamId::PanelX.code(), 15);
        assert_eq!(ParamId::PanelY.code(), 16);
    }

    #[test]
    // Purpose
    // -------
    // Tables with mismatched lengths are rejected.
    //
    // Given
    // -----
    // - Two indices and one amplitude.
    //
    // Expect
    // ------
    // - `Err(PixelCountMismatch)`.
    fn fhkl_table_rejects_length_mismatch() {
        // Arrange / Act
        let res = FhklTable::new(vec![[1, 0, 0], [0, 1, 0]], vec![1.0]);

        // Assert
        assert!(res.is_err());
    }
}
