//! refinement::synthetic — analytic collaborators for tests and demos.
//!
//! Purpose
//! -------
//! Provide a [`Simulator`] and a [`CellManager`] whose pixel model and
//! derivatives are closed-form, so the refiner can be exercised end to end
//! (and its gradients checked by finite differences) without a diffraction
//! engine.
//!
//! Key behaviors
//! -------------
//! - [`CubicCell`]: one free variable `a`, `B = diag(1/a)`.
//! - [`GaussianSpotSimulator`]: every region of interest holds one
//!   Gaussian spot `I = K·F²·exp(−r²/(2s²))`. Misset angles, panel
//!   geometry, the unit cell and the spectral coefficients move the spot
//!   centre linearly; mosaic size sets the width through
//!   `s² = s0² + τ/m̄`; the amplitude `F` is read from the simulator's
//!   table at the Miller index registered for the region.
//!
//! Conventions
//! -----------
//! - Pixel coordinates are relative to the region's corner; the nominal
//!   centre is the middle of the region.
//! - The latest `add_spots` output is what `raw_pixels_roi` and the
//!   derivative accessors return. Photons of all calls since the last
//!   `zero_raw_pixels` are summed in [`GaussianSpotSimulator::accumulated_photons`].
use crate::refinement::{
    collaborators::{CellManager, FhklTable, MillerIndex, PanelGeometry, ParamId, Simulator},
    core::shots::{RegionOfInterest, Spectrum},
    errors::{RefineError, RefineResult},
};
use nalgebra::Matrix3;
use ndarray::Array1;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Cubic cell with edge `a`.
#[derive(Debug, Clone, PartialEq)]
pub struct CubicCell {
    a: f64,
}

impl CubicCell {
    pub fn new(a: f64) -> Self {
        Self { a }
    }
}

impl CellManager for CubicCell {
    fn variables(&self) -> Vec<f64> {
        vec![self.a]
    }

    fn set_variables(&mut self, values: &[f64]) -> RefineResult<()> {
        match values {
            [a] if a.is_finite() && *a > 0.0 => {
                self.a = *a;
                Ok(())
            }
            _ => Err(RefineError::Collaborator {
                text: format!("cubic cell needs one positive edge length, got {values:?}"),
            }),
        }
    }

    fn variable_names(&self) -> Vec<String> {
        vec!["a".to_string()]
    }

    fn b_matrix(&self) -> Matrix3<f64> {
        Matrix3::from_diagonal_element(1.0 / self.a)
    }

    fn derivative_matrices(&self) -> Vec<Matrix3<f64>> {
        vec![Matrix3::from_diagonal_element(-1.0 / (self.a * self.a))]
    }

    fn second_derivative_matrices(&self) -> Vec<Matrix3<f64>> {
        vec![Matrix3::from_diagonal_element(2.0 / (self.a * self.a * self.a))]
    }
}

/// Shape constants of the analytic spot model.
///
/// - `intensity`: `K`, photons per unit `F²` at the spot centre.
/// - `base_width` / `mosaic_broadening`: `s0` and `τ` in `s² = s0² + τ/m̄`.
/// - `rotation_lever`: pixels of centre shift per radian of misset.
/// - `cell_lever`: pixels per unit of `trace(B)`.
/// - `origin_lever`: fast-axis pixels per unit of origin Z offset.
/// - `panel_lever`: pixels per radian of panel rotation.
/// - `spectral_lever`: fast-axis pixels per unit of wavelength shift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotProfile {
    pub intensity: f64,
    pub base_width: f64,
    pub mosaic_broadening: f64,
    pub rotation_lever: f64,
    pub cell_lever: f64,
    pub origin_lever: f64,
    pub panel_lever: f64,
    pub spectral_lever: f64,
}

impl Default for SpotProfile {
    fn default() -> Self {
        Self {
            intensity: 0.05,
            base_width: 1.2,
            mosaic_broadening: 10.0,
            rotation_lever: 500.0,
            cell_lever: 10.0,
            origin_lever: 20.0,
            panel_lever: 100.0,
            spectral_lever: 50.0,
        }
    }
}

/// First and second derivative of the spot centre `(cx, cy)` with respect
/// to one parameter.
#[derive(Debug, Clone, Copy, Default)]
struct CentreShift {
    dx: f64,
    dy: f64,
    d2x: f64,
    d2y: f64,
}

/// Simulator with a closed-form Gaussian spot per region of interest.
#[derive(Debug, Clone)]
pub struct GaussianSpotSimulator {
    profile: SpotProfile,
    table: FhklTable,
    positions: HashMap<MillerIndex, usize>,
    spots: HashMap<RegionOfInterest, MillerIndex>,
    refined: BTreeSet<ParamId>,
    initialized: bool,

    rotation: [f64; 3],
    b_matrix: Matrix3<f64>,
    cell_derivatives: BTreeMap<usize, (Matrix3<f64>, Option<Matrix3<f64>>)>,
    ncells: Vec<f64>,
    mean_wavelength: f64,
    lambda_coefficients: [f64; 2],
    geometry: Option<PanelGeometry>,
    roi: Option<RegionOfInterest>,

    raw: Array1<f64>,
    first: BTreeMap<ParamId, Array1<f64>>,
    second: BTreeMap<ParamId, Array1<f64>>,
    accumulated: f64,
}

impl GaussianSpotSimulator {
    pub fn new(table: FhklTable) -> Self {
        let positions = table.positions();
        Self {
            profile: SpotProfile::default(),
            table,
            positions,
            spots: HashMap::new(),
            refined: BTreeSet::new(),
            initialized: false,
            rotation: [0.0; 3],
            b_matrix: Matrix3::identity(),
            cell_derivatives: BTreeMap::new(),
            ncells: vec![10.0],
            mean_wavelength: 1.0,
            lambda_coefficients: [0.0, 1.0],
            geometry: None,
            roi: None,
            raw: Array1::zeros(0),
            first: BTreeMap::new(),
            second: BTreeMap::new(),
            accumulated: 0.0,
        }
    }

    pub fn with_profile(mut self, profile: SpotProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Declare which Miller index diffracts into `roi`.
    pub fn register_spot(&mut self, roi: RegionOfInterest, hkl: MillerIndex) {
        self.spots.insert(roi, hkl);
    }

    pub fn with_spots(mut self, spots: impl IntoIterator<Item = (RegionOfInterest, MillerIndex)>) -> Self {
        self.spots.extend(spots);
        self
    }

    pub fn refined_ids(&self) -> &BTreeSet<ParamId> {
        &self.refined
    }

    /// Photons simulated since the last `zero_raw_pixels`.
    pub fn accumulated_photons(&self) -> f64 {
        self.accumulated
    }

    fn amplitude(&self, hkl: MillerIndex) -> RefineResult<f64> {
        self.positions
            .get(&hkl)
            .and_then(|&i| self.table.amplitudes.get(i))
            .copied()
            .ok_or(RefineError::MissingAmplitude { hkl })
    }

    fn mean_ncells(&self) -> f64 {
        self.ncells.iter().sum::<f64>() / self.ncells.len().max(1) as f64
    }

    fn centre(&self, roi: &RegionOfInterest, geometry: &PanelGeometry) -> (f64, f64) {
        let p = &self.profile;
        let [rx, ry, rz] = self.rotation;
        let [shift_x, shift_y, shift_z] = geometry.origin_shift;
        let cell = p.cell_lever * self.b_matrix.trace();
        let [c0, c1] = self.lambda_coefficients;
        let spectral = p.spectral_lever * (c0 + c1 * self.mean_wavelength - self.mean_wavelength);
        let cx = (roi.n_fast() as f64 - 1.0) / 2.0
            + p.rotation_lever * (ry + 0.5 * rz)
            + shift_x
            + p.origin_lever * shift_z
            - p.panel_lever * geometry.rotation
            + cell
            + spectral;
        let cy = (roi.n_slow() as f64 - 1.0) / 2.0 + p.rotation_lever * (rx - 0.5 * rz) + shift_y
            + p.panel_lever * geometry.rotation
            + cell;
        (cx, cy)
    }

    fn centre_shift(&self, id: ParamId) -> Option<CentreShift> {
        let p = &self.profile;
        let shift = match id {
            ParamId::RotX => CentreShift { dy: p.rotation_lever, ..Default::default() },
            ParamId::RotY => CentreShift { dx: p.rotation_lever, ..Default::default() },
            ParamId::RotZ => CentreShift {
                dx: 0.5 * p.rotation_lever,
                dy: -0.5 * p.rotation_lever,
                ..Default::default()
            },
            ParamId::PanelX => CentreShift { dx: 1.0, ..Default::default() },
            ParamId::PanelY => CentreShift { dy: 1.0, ..Default::default() },
            ParamId::OriginZ => CentreShift { dx: p.origin_lever, ..Default::default() },
            ParamId::PanelRot => {
                CentreShift { dx: -p.panel_lever, dy: p.panel_lever, ..Default::default() }
            }
            ParamId::UnitCell(i) => {
                let (first, second) = self.cell_derivatives.get(&i)?;
                let d = p.cell_lever * first.trace();
                let d2 = second.map_or(0.0, |m| p.cell_lever * m.trace());
                CentreShift { dx: d, dy: d, d2x: d2, d2y: d2 }
            }
            ParamId::Lambda0 => CentreShift { dx: p.spectral_lever, ..Default::default() },
            ParamId::Lambda1 => {
                CentreShift { dx: p.spectral_lever * self.mean_wavelength, ..Default::default() }
            }
            ParamId::Ncells(_) | ParamId::Fcell => return None,
        };
        Some(shift)
    }
}

impl Simulator for GaussianSpotSimulator {
    fn refine(&mut self, id: ParamId) {
        self.refined.insert(id);
    }

    fn initialize_managers(&mut self) -> RefineResult<()> {
        self.initialized = true;
        Ok(())
    }

    fn set_value(&mut self, id: ParamId, value: f64) {
        match id {
            ParamId::RotX => self.rotation[0] = value,
            ParamId::RotY => self.rotation[1] = value,
            ParamId::RotZ => self.rotation[2] = value,
            _ => log::debug!("ignoring value {value} for parameter {id:?}"),
        }
    }

    fn set_ncells(&mut self, values: &[f64]) {
        self.ncells = values.to_vec();
    }

    fn set_umatrix(&mut self, _u: &Matrix3<f64>) {}

    fn set_bmatrix(&mut self, b: &Matrix3<f64>) {
        self.b_matrix = *b;
    }

    fn set_ucell_derivative_matrix(
        &mut self, index: usize, first: &Matrix3<f64>, second: Option<&Matrix3<f64>>,
    ) {
        self.cell_derivatives.insert(index, (*first, second.copied()));
    }

    fn set_spectrum(&mut self, spectrum: &Spectrum) {
        let total: f64 = spectrum.weights.iter().sum();
        self.mean_wavelength = if total > 0.0 {
            spectrum.wavelengths.iter().zip(&spectrum.weights).map(|(w, p)| w * p).sum::<f64>() / total
        } else {
            spectrum.wavelengths.first().copied().unwrap_or(1.0)
        };
    }

    fn set_lambda_coefficients(&mut self, coefficients: [f64; 2]) {
        self.lambda_coefficients = coefficients;
    }

    fn fhkl_table(&self) -> FhklTable {
        self.table.clone()
    }

    fn set_fhkl_table(&mut self, table: &FhklTable) -> RefineResult<()> {
        if table.indices.len() != table.amplitudes.len() {
            return Err(RefineError::PixelCountMismatch {
                field: "amplitudes",
                expected: table.indices.len(),
                found: table.amplitudes.len(),
            });
        }
        self.table = table.clone();
        self.positions = self.table.positions();
        Ok(())
    }

    fn update_geometry(&mut self, geometry: &PanelGeometry) -> RefineResult<()> {
        if !(geometry.origin_shift.iter().all(|v| v.is_finite()) && geometry.rotation.is_finite()) {
            return Err(RefineError::Collaborator {
                text: format!("non-finite geometry for panel {}", geometry.panel),
            });
        }
        self.geometry = Some(*geometry);
        Ok(())
    }

    fn set_region_of_interest(&mut self, roi: &RegionOfInterest) {
        self.roi = Some(*roi);
    }

    fn add_spots(&mut self) -> RefineResult<()> {
        if !self.initialized {
            return Err(RefineError::Collaborator { text: "simulator managers not initialized".into() });
        }
        let Some(roi) = self.roi else {
            return Err(RefineError::Collaborator { text: "no region of interest set".into() });
        };
        let geometry = self.geometry.unwrap_or(PanelGeometry { panel: 0, origin_shift: [0.0; 3], rotation: 0.0 });
        let hkl = *self.spots.get(&roi).ok_or_else(|| RefineError::Collaborator {
            text: format!("no spot registered for region {roi:?}"),
        })?;
        let amplitude = self.amplitude(hkl)?;

        let p = self.profile;
        let m = self.mean_ncells();
        if !(m.is_finite() && m > 0.0) {
            return Err(RefineError::Collaborator { text: format!("invalid mosaic size {m}") });
        }
        let q = p.base_width * p.base_width + p.mosaic_broadening / m;
        let (cx, cy) = self.centre(&roi, &geometry);
        let (xrel, yrel) = roi.relative_coordinates();
        let u = xrel.mapv(|x| x - cx);
        let v = yrel.mapv(|y| y - cy);
        let r2 = &u * &u + &v * &v;
        let profile = r2.mapv(|r| (-r / (2.0 * q)).exp());
        let peak = p.intensity * amplitude * amplitude;
        let raw = &profile * peak;

        self.first.clear();
        self.second.clear();
        for &id in &self.refined {
            let (d, d2) = match id {
                ParamId::Fcell => {
                    (&profile * (2.0 * p.intensity * amplitude), &profile * (2.0 * p.intensity))
                }
                ParamId::Ncells(axis) => {
                    if axis >= self.ncells.len() {
                        continue;
                    }
                    let k = self.ncells.len() as f64;
                    let dq = -p.mosaic_broadening / (m * m * k);
                    let d2q = 2.0 * p.mosaic_broadening / (m * m * m * k * k);
                    // h = r²/(2q)
                    let dh = r2.mapv(|r| -r / (2.0 * q * q) * dq);
                    let d2h = r2.mapv(|r| r / (q * q * q) * dq * dq - r / (2.0 * q * q) * d2q);
                    let d = -(&raw * &dh);
                    let d2 = &raw * &(&dh * &dh - &d2h);
                    (d, d2)
                }
                other => {
                    let Some(s) = self.centre_shift(other) else {
                        continue;
                    };
                    let dh = -(&u * s.dx + &v * s.dy) / q;
                    let d2h = ((s.dx * s.dx + s.dy * s.dy) - (&u * s.d2x + &v * s.d2y)) / q;
                    let d = -(&raw * &dh);
                    let d2 = &raw * &(&dh * &dh - &d2h);
                    (d, d2)
                }
            };
            self.first.insert(id, d);
            self.second.insert(id, d2);
        }

        self.accumulated += raw.sum();
        self.raw = raw;
        Ok(())
    }

    fn raw_pixels_roi(&self) -> Array1<f64> {
        self.raw.clone()
    }

    fn derivative_pixels(&self, id: ParamId) -> Array1<f64> {
        self.first.get(&id).cloned().unwrap_or_else(|| Array1::zeros(self.raw.len()))
    }

    fn second_derivative_pixels(&self, id: ParamId) -> Array1<f64> {
        self.second.get(&id).cloned().unwrap_or_else(|| Array1::zeros(self.raw.len()))
    }

    fn zero_raw_pixels(&mut self) {
        self.accumulated = 0.0;
    }
}
