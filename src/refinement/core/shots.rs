//! refinement::core::shots — per-shot inputs of a refinement.
//!
//! Purpose
//! -------
//! Hold everything the refiner knows about one shot: its spots (regions of
//! interest with observed pixels), spectrum, crystal model and initial
//! values, keyed by an explicit [`ShotId`] in a sorted map.
//!
//! Key behaviors
//! -------------
//! - [`RegionOfInterest`] uses inclusive pixel bounds; pixel arrays are
//!   flattened row-major (slow outer, fast inner).
//! - [`Spot::new`] derives relative fast/slow coordinates for the
//!   background plane and validates pixel counts.
//! - [`ShotInputs::into_shots`] assembles a [`ShotMap`] from per-shot
//!   mappings and rejects any mapping whose key set differs from the
//!   canonical shot ids (see [`check_keys`]).
//!
//! Invariants & assumptions
//! ------------------------
//! - Every per-pixel array of a spot has `roi.n_pixels()` entries.
//! - Observed pixels are finite.
//! - Shots are always visited in ascending `ShotId` order.
use crate::refinement::{
    collaborators::{CellManager, MillerIndex},
    errors::{RefineError, RefineResult},
};
use nalgebra::Matrix3;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ShotId = usize;
pub type PanelId = usize;

/// Sorted map of shots; iteration order is the canonical processing order.
pub type ShotMap = BTreeMap<ShotId, Shot>;

/// Rectangular pixel region with inclusive bounds `[x1, x2] × [y1, y2]`
/// (x fast, y slow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x1: usize,
    pub x2: usize,
    pub y1: usize,
    pub y2: usize,
}

impl RegionOfInterest {
    pub fn new(x1: usize, x2: usize, y1: usize, y2: usize) -> RefineResult<Self> {
        if x2 < x1 || y2 < y1 {
            return Err(RefineError::InvalidRegion { x1, x2, y1, y2 });
        }
        Ok(Self { x1, x2, y1, y2 })
    }

    pub fn n_fast(&self) -> usize {
        self.x2 - self.x1 + 1
    }

    pub fn n_slow(&self) -> usize {
        self.y2 - self.y1 + 1
    }

    pub fn n_pixels(&self) -> usize {
        self.n_fast() * self.n_slow()
    }

    /// Fast and slow pixel offsets from the region's corner, row-major.
    pub fn relative_coordinates(&self) -> (Array1<f64>, Array1<f64>) {
        let n_fast = self.n_fast();
        let xrel = Array1::from_shape_fn(self.n_pixels(), |i| (i % n_fast) as f64);
        let yrel = Array1::from_shape_fn(self.n_pixels(), |i| (i / n_fast) as f64);
        (xrel, yrel)
    }
}

/// Background plane `tilt = a·xrel + b·yrel + c`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundPlane {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl BackgroundPlane {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }
}

/// Discrete incident spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub wavelengths: Vec<f64>,
    pub weights: Vec<f64>,
}

impl Spectrum {
    pub fn new(wavelengths: Vec<f64>, weights: Vec<f64>) -> RefineResult<Self> {
        if wavelengths.is_empty() {
            return Err(RefineError::InvalidOption {
                name: "spectrum",
                reason: "a spectrum needs at least one wavelength",
            });
        }
        if wavelengths.len() != weights.len() {
            return Err(RefineError::InvalidOption {
                name: "spectrum",
                reason: "wavelengths and weights must have the same length",
            });
        }
        if wavelengths.iter().any(|w| !(w.is_finite() && *w > 0.0))
            || weights.iter().any(|w| !(w.is_finite() && *w >= 0.0))
        {
            return Err(RefineError::InvalidOption {
                name: "spectrum",
                reason: "wavelengths must be positive and weights non-negative",
            });
        }
        Ok(Self { wavelengths, weights })
    }

    pub fn monochromatic(wavelength: f64) -> RefineResult<Self> {
        Self::new(vec![wavelength], vec![1.0])
    }
}

/// One observed Bragg spot.
#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    pub roi: RegionOfInterest,
    pub panel: PanelId,
    pub asu: MillerIndex,
    pub observed: Array1<f64>,
    pub xrel: Array1<f64>,
    pub yrel: Array1<f64>,
    pub background_init: BackgroundPlane,
    /// Precomputed background image, used in extracted-background mode.
    pub background_estimate: Option<Array1<f64>>,
    /// Solid-angle and polarization correction multiplying the background.
    pub pixel_correction: Option<Array1<f64>>,
    pub selected: bool,
}

impl Spot {
    pub fn new(
        roi: RegionOfInterest, panel: PanelId, asu: MillerIndex, observed: Array1<f64>,
        background_init: BackgroundPlane,
    ) -> RefineResult<Self> {
        check_pixels("observed", &roi, &observed)?;
        if let Some((index, value)) =
            observed.iter().enumerate().find(|(_, v)| !v.is_finite()).map(|(i, v)| (i, *v))
        {
            return Err(RefineError::NonFiniteObservation { index, value });
        }
        let (xrel, yrel) = roi.relative_coordinates();
        Ok(Self {
            roi,
            panel,
            asu,
            observed,
            xrel,
            yrel,
            background_init,
            background_estimate: None,
            pixel_correction: None,
            selected: true,
        })
    }

    pub fn with_background_estimate(mut self, estimate: Array1<f64>) -> RefineResult<Self> {
        check_pixels("background_estimate", &self.roi, &estimate)?;
        self.background_estimate = Some(estimate);
        Ok(self)
    }

    pub fn with_pixel_correction(mut self, correction: Array1<f64>) -> RefineResult<Self> {
        check_pixels("pixel_correction", &self.roi, &correction)?;
        self.pixel_correction = Some(correction);
        Ok(self)
    }

    pub fn n_pixels(&self) -> usize {
        self.roi.n_pixels()
    }
}

fn check_pixels(field: &'static str, roi: &RegionOfInterest, pixels: &Array1<f64>) -> RefineResult<()> {
    if pixels.len() != roi.n_pixels() {
        return Err(RefineError::PixelCountMismatch {
            field,
            expected: roi.n_pixels(),
            found: pixels.len(),
        });
    }
    Ok(())
}

/// Orientation matrix plus the unit cell that yields B.
#[derive(Debug)]
pub struct CrystalModel {
    pub u_matrix: Matrix3<f64>,
    pub cell: Box<dyn CellManager>,
}

impl CrystalModel {
    pub fn new(u_matrix: Matrix3<f64>, cell: Box<dyn CellManager>) -> Self {
        Self { u_matrix, cell }
    }
}

/// All inputs of one shot.
///
/// - `scale_init`: initial crystal scale (positive).
/// - `origin_z_init`: initial detector origin Z offset.
/// - `background_coef_init`: initial coefficient of the extracted background.
#[derive(Debug)]
pub struct Shot {
    pub spots: Vec<Spot>,
    pub spectrum: Spectrum,
    pub crystal: CrystalModel,
    pub scale_init: f64,
    pub origin_z_init: f64,
    pub background_coef_init: f64,
}

impl Shot {
    pub fn new(spots: Vec<Spot>, spectrum: Spectrum, crystal: CrystalModel) -> Self {
        Self {
            spots,
            spectrum,
            crystal,
            scale_init: 1.0,
            origin_z_init: 0.0,
            background_coef_init: 1.0,
        }
    }

    pub fn with_scale_init(mut self, scale: f64) -> Self {
        self.scale_init = scale;
        self
    }

    pub fn with_origin_z_init(mut self, origin_z: f64) -> Self {
        self.origin_z_init = origin_z;
        self
    }

    pub fn with_background_coef_init(mut self, coef: f64) -> Self {
        self.background_coef_init = coef;
        self
    }

    pub fn n_spots(&self) -> usize {
        self.spots.len()
    }
}

/// Reject a per-shot mapping whose key set differs from `canonical`.
///
/// # Errors
/// [`RefineError::ShotKeyMismatch`] listing missing and unexpected ids.
pub fn check_keys<V>(
    canonical: &[ShotId], field: &'static str, mapping: &BTreeMap<ShotId, V>,
) -> RefineResult<()> {
    let missing: Vec<ShotId> =
        canonical.iter().copied().filter(|id| !mapping.contains_key(id)).collect();
    let unexpected: Vec<ShotId> =
        mapping.keys().copied().filter(|id| canonical.binary_search(id).is_err()).collect();
    if missing.is_empty() && unexpected.is_empty() {
        return Ok(());
    }
    Err(RefineError::ShotKeyMismatch { field, missing, unexpected })
}

/// Per-shot mappings as handed over by a caller, before assembly.
///
/// The key set of `crystals` is the canonical shot-id set; every other
/// supplied mapping must use exactly the same keys.
#[derive(Debug, Default)]
pub struct ShotInputs {
    pub rois: BTreeMap<ShotId, Vec<RegionOfInterest>>,
    pub images: BTreeMap<ShotId, Vec<Array1<f64>>>,
    pub panels: BTreeMap<ShotId, Vec<PanelId>>,
    pub asu: BTreeMap<ShotId, Vec<MillerIndex>>,
    pub background_inits: BTreeMap<ShotId, Vec<BackgroundPlane>>,
    pub spectra: BTreeMap<ShotId, Spectrum>,
    pub crystals: BTreeMap<ShotId, CrystalModel>,
    pub scale_inits: Option<BTreeMap<ShotId, f64>>,
    pub origin_z_inits: Option<BTreeMap<ShotId, f64>>,
    pub background_coef_inits: Option<BTreeMap<ShotId, f64>>,
    pub selection_flags: Option<BTreeMap<ShotId, Vec<bool>>>,
    pub background_estimates: Option<BTreeMap<ShotId, Vec<Array1<f64>>>>,
    pub pixel_corrections: Option<BTreeMap<ShotId, Vec<Array1<f64>>>>,
}

impl ShotInputs {
    /// Validate key sets and per-spot lengths, then build the [`ShotMap`].
    ///
    /// # Errors
    /// - [`RefineError::EmptyShotSet`] when no crystal is supplied.
    /// - [`RefineError::ShotKeyMismatch`] for any mapping with the wrong keys.
    /// - [`RefineError::SpotCountMismatch`] when per-spot vectors disagree.
    /// - Pixel validation errors from [`Spot`].
    pub fn into_shots(self) -> RefineResult<ShotMap> {
        let canonical: Vec<ShotId> = self.crystals.keys().copied().collect();
        if canonical.is_empty() {
            return Err(RefineError::EmptyShotSet);
        }
        check_keys(&canonical, "rois", &self.rois)?;
        check_keys(&canonical, "images", &self.images)?;
        check_keys(&canonical, "panels", &self.panels)?;
        check_keys(&canonical, "asu", &self.asu)?;
        check_keys(&canonical, "background_inits", &self.background_inits)?;
        check_keys(&canonical, "spectra", &self.spectra)?;
        if let Some(m) = &self.scale_inits {
            check_keys(&canonical, "scale_inits", m)?;
        }
        if let Some(m) = &self.origin_z_inits {
            check_keys(&canonical, "origin_z_inits", m)?;
        }
        if let Some(m) = &self.background_coef_inits {
            check_keys(&canonical, "background_coef_inits", m)?;
        }
        if let Some(m) = &self.selection_flags {
            check_keys(&canonical, "selection_flags", m)?;
        }
        if let Some(m) = &self.background_estimates {
            check_keys(&canonical, "background_estimates", m)?;
        }
        if let Some(m) = &self.pixel_corrections {
            check_keys(&canonical, "pixel_corrections", m)?;
        }

        let ShotInputs {
            mut rois,
            mut images,
            mut panels,
            mut asu,
            mut background_inits,
            mut spectra,
            crystals,
            scale_inits,
            origin_z_inits,
            background_coef_inits,
            mut selection_flags,
            mut background_estimates,
            mut pixel_corrections,
        } = self;

        let mut shots = ShotMap::new();
        for (shot_id, crystal) in crystals {
            let rois = take(&mut rois, shot_id, "rois")?;
            let n = rois.len();
            let images = take_spots(&mut images, shot_id, "images", n)?;
            let panels = take_spots(&mut panels, shot_id, "panels", n)?;
            let asu = take_spots(&mut asu, shot_id, "asu", n)?;
            let bg = take_spots(&mut background_inits, shot_id, "background_inits", n)?;
            let flags = optional_spots(&mut selection_flags, shot_id, "selection_flags", n)?;
            let estimates =
                optional_spots(&mut background_estimates, shot_id, "background_estimates", n)?;
            let corrections =
                optional_spots(&mut pixel_corrections, shot_id, "pixel_corrections", n)?;

            let mut spots = Vec::with_capacity(n);
            for (i_spot, ((((roi, image), panel), hkl), plane)) in
                rois.into_iter().zip(images).zip(panels).zip(asu).zip(bg).enumerate()
            {
                let mut spot = Spot::new(roi, panel, hkl, image, plane)?;
                if let Some(estimates) = &estimates {
                    spot = spot.with_background_estimate(estimates[i_spot].clone())?;
                }
                if let Some(corrections) = &corrections {
                    spot = spot.with_pixel_correction(corrections[i_spot].clone())?;
                }
                if let Some(flags) = &flags {
                    spot.selected = flags[i_spot];
                }
                spots.push(spot);
            }

            let spectrum = take(&mut spectra, shot_id, "spectra")?;
            let mut shot = Shot::new(spots, spectrum, crystal);
            if let Some(v) = scale_inits.as_ref().and_then(|m| m.get(&shot_id)) {
                shot.scale_init = *v;
            }
            if let Some(v) = origin_z_inits.as_ref().and_then(|m| m.get(&shot_id)) {
                shot.origin_z_init = *v;
            }
            if let Some(v) = background_coef_inits.as_ref().and_then(|m| m.get(&shot_id)) {
                shot.background_coef_init = *v;
            }
            shots.insert(shot_id, shot);
        }
        Ok(shots)
    }
}

fn take<V>(map: &mut BTreeMap<ShotId, V>, shot: ShotId, field: &'static str) -> RefineResult<V> {
    map.remove(&shot).ok_or(RefineError::MissingShotInput { shot, field })
}

fn take_spots<V>(
    map: &mut BTreeMap<ShotId, Vec<V>>, shot: ShotId, field: &'static str, expected: usize,
) -> RefineResult<Vec<V>> {
    let values = take(map, shot, field)?;
    if values.len() != expected {
        return Err(RefineError::SpotCountMismatch { shot, field, expected, found: values.len() });
    }
    Ok(values)
}

fn optional_spots<V>(
    map: &mut Option<BTreeMap<ShotId, Vec<V>>>, shot: ShotId, field: &'static str, expected: usize,
) -> RefineResult<Option<Vec<V>>> {
    match map {
        Some(map) => take_spots(map, shot, field, expected).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinement::synthetic::CubicCell;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // Region geometry, spot validation, key-set checks and assembly of a
    // shot map from per-shot mappings.
    // -------------------------------------------------------------------------

    fn crystal() -> CrystalModel {
        CrystalModel::new(Matrix3::identity(), Box::new(CubicCell::new(50.0)))
    }

    fn one_spot_inputs(ids: &[ShotId]) -> ShotInputs {
        let roi = RegionOfInterest::new(0, 1, 0, 0).expect("valid roi");
        let mut inputs = ShotInputs::default();
        for &id in ids {
            inputs.rois.insert(id, vec![roi]);
            inputs.images.insert(id, vec![array![1.0, 2.0]]);
            inputs.panels.insert(id, vec![0]);
            inputs.asu.insert(id, vec![[1, 0, 0]]);
            inputs.background_inits.insert(id, vec![BackgroundPlane::new(0.0, 0.0, 1.0)]);
            inputs.spectra.insert(id, Spectrum::monochromatic(1.0).expect("valid spectrum"));
            inputs.crystals.insert(id, crystal());
        }
        inputs
    }

    #[test]
    // Purpose
    // -------
    // Relative coordinates are row-major with x varying fastest.
    //
    // Given
    // -----
    // - ROI x [10, 12], y [5, 6] (3 × 2 pixels).
    //
    // Expect
    // ------
    // - xrel = [0,1,2,0,1,2], yrel = [0,0,0,1,1,1].
    fn relative_coordinates_are_row_major() {
        // Arrange
        let roi = RegionOfInterest::new(10, 12, 5, 6).expect("valid roi");

        // Act
        let (xrel, yrel) = roi.relative_coordinates();

        // Assert
        assert_eq!(roi.n_pixels(), 6);
        assert_eq!(xrel, array![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
        assert_eq!(yrel, array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    // Purpose
    // -------
    // A mapping missing one shot id and carrying an extra one is rejected
    // with both lists reported.
    //
    // Given
    // -----
    // - Canonical ids [1, 2, 3]; mapping keys {1, 3, 4}.
    //
    // Expect
    // ------
    // - `ShotKeyMismatch { missing: [2], unexpected: [4] }`.
    fn check_keys_reports_missing_and_unexpected_ids() {
        // Arrange
        let mapping: BTreeMap<ShotId, f64> = [(1, 0.0), (3, 0.0), (4, 0.0)].into_iter().collect();

        // Act
        let res = check_keys(&[1, 2, 3], "scale_inits", &mapping);

        // Assert
        assert_eq!(
            res,
            Err(RefineError::ShotKeyMismatch {
                field: "scale_inits",
                missing: vec![2],
                unexpected: vec![4]
            })
        );
    }

    #[test]
    // Purpose
    // -------
    // Assembly fails when an optional per-shot mapping misses a shot.
    //
    // Given
    // -----
    // - Two shots; `scale_inits` only for shot 7.
    //
    // Expect
    // ------
    // - `ShotKeyMismatch` on "scale_inits".
    fn into_shots_rejects_partial_optional_mapping() {
        // Arrange
        let mut inputs = one_spot_inputs(&[7, 9]);
        inputs.scale_inits = Some([(7, 2.0)].into_iter().collect());

        // Act
        let res = inputs.into_shots();

        // Assert
        assert!(matches!(res, Err(RefineError::ShotKeyMismatch { field: "scale_inits", .. })));
    }

    #[test]
    // Purpose
    // -------
    // A well-formed input set assembles into sorted shots with optional
    // scalars applied.
    //
    // Given
    // -----
    // - Shots 9 and 7; scale 2.5 for both.
    //
    // Expect
    // ------
    // - Keys iterate as [7, 9]; one spot each; scale_init 2.5.
    fn into_shots_builds_sorted_map() {
        // Arrange
        let mut inputs = one_spot_inputs(&[9, 7]);
        inputs.scale_inits = Some([(7, 2.5), (9, 2.5)].into_iter().collect());

        // Act
        let shots = inputs.into_shots().expect("inputs should assemble");

        // Assert
        assert_eq!(shots.keys().copied().collect::<Vec<_>>(), vec![7, 9]);
        assert!(shots.values().all(|s| s.n_spots() == 1 && s.scale_init == 2.5));
    }

    #[test]
    // Purpose
    // -------
    // Observed pixel arrays must match the region size.
    //
    // Given
    // -----
    // - 2-pixel ROI with three observed values.
    //
    // Expect
    // ------
    // - `PixelCountMismatch { expected: 2, found: 3 }`.
    fn spot_rejects_wrong_pixel_count() {
        // Arrange
        let roi = RegionOfInterest::new(0, 1, 0, 0).expect("valid roi");

        // Act
        let res = Spot::new(roi, 0, [1, 0, 0], array![1.0, 2.0, 3.0], BackgroundPlane::new(0.0, 0.0, 0.0));

        // Assert
        assert_eq!(
            res,
            Err(RefineError::PixelCountMismatch { field: "observed", expected: 2, found: 3 })
        );
    }
}
