//! refinement::core::options — configuration of a refiner.
//!
//! Purpose
//! -------
//! Collect every switch, sensitivity and range of a refinement in one
//! serde-friendly struct, [`RefinerOptions`], with defaults that match a
//! typical stills refinement and a `validate` step that catches
//! configuration errors before any parameter slot is assigned.
//!
//! Key behaviors
//! -------------
//! - Per-class sensitivities (`sigmas`) scale internal steps: an internal
//!   change of 1 moves a physical value by roughly one sigma.
//! - Background coefficient, spectral coefficients and panel geometry can
//!   only be refined with rescaling on.
//! - Bounded classes (origin Z with a range, spectral coefficients) cannot
//!   be combined with curvature tracking.
//!
//! Conventions
//! -----------
//! - Options are plain data; loading from JSON goes through
//!   [`RefinerOptions::from_json`] and always validates.
use crate::refinement::{
    collaborators::MillerIndex,
    core::{
        noise::{LambdaAssembly, NoiseModel},
        priors::PriorOptions,
        reparam::{NCELLS_OFFSET, ParameterClass},
        shots::{PanelId, ShotId},
    },
    errors::{RefineError, RefineResult},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

/// Which parameter classes are refined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineFlags {
    /// Background planes, or the background coefficient in extracted mode.
    pub background: bool,
    pub rotation: bool,
    pub unit_cell: bool,
    pub ncells: bool,
    pub origin_z: bool,
    pub scale: bool,
    pub fcell: bool,
    pub spectra: bool,
    pub panel_rotation: bool,
    pub panel_xy: bool,
    pub gain: bool,
}

impl Default for RefineFlags {
    fn default() -> Self {
        Self {
            background: true,
            rotation: true,
            unit_cell: true,
            ncells: true,
            origin_z: false,
            scale: true,
            fcell: false,
            spectra: false,
            panel_rotation: false,
            panel_xy: false,
            gain: false,
        }
    }
}

impl RefineFlags {
    pub fn none() -> Self {
        Self {
            background: false,
            rotation: false,
            unit_cell: false,
            ncells: false,
            origin_z: false,
            scale: false,
            fcell: false,
            spectra: false,
            panel_rotation: false,
            panel_xy: false,
            gain: false,
        }
    }

    pub fn is_refined(&self, class: ParameterClass) -> bool {
        match class {
            ParameterClass::Background | ParameterClass::BackgroundCoefficient => self.background,
            ParameterClass::Rotation => self.rotation,
            ParameterClass::UnitCell => self.unit_cell,
            ParameterClass::Ncells => self.ncells,
            ParameterClass::OriginZ => self.origin_z,
            ParameterClass::Scale => self.scale,
            ParameterClass::Fcell => self.fcell,
            ParameterClass::Spectra => self.spectra,
            ParameterClass::PanelRotation => self.panel_rotation,
            ParameterClass::PanelXY => self.panel_xy,
            ParameterClass::Gain => self.gain,
        }
    }
}

/// Classes shared by every shot instead of refined per shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GlobalFlags {
    pub unit_cell: bool,
    pub ncells: bool,
    pub origin_z: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMode {
    /// `tilt = a·xrel + b·yrel + c` per spot.
    #[default]
    Plane,
    /// Only the offset `c` varies; `a` and `b` are pinned at zero.
    OffsetOnly,
    /// `tilt = coef·background_estimate` with one coefficient per shot.
    Extracted,
}

/// Per-class sensitivities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sensitivities {
    pub rotation: [f64; 3],
    pub unit_cell: f64,
    pub ncells: f64,
    pub origin_z: f64,
    pub scale: f64,
    pub background: [f64; 3],
    pub background_coef: f64,
    /// Multiplies the per-resolution-bin sigma of every structure factor.
    pub fcell_scale: f64,
    pub spectra: [f64; 2],
    pub panel_rotation: f64,
    pub panel_xy: f64,
}

impl Default for Sensitivities {
    fn default() -> Self {
        Self {
            rotation: [0.003; 3],
            unit_cell: 0.005,
            ncells: 0.05,
            origin_z: 0.005,
            scale: 0.0001,
            background: [1.0; 3],
            background_coef: 0.1,
            fcell_scale: 0.005,
            spectra: [0.01, 0.01],
            panel_rotation: 0.005,
            panel_xy: 0.005,
        }
    }
}

/// Ranges of bounded classes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ranges {
    pub origin_z: Option<(f64, f64)>,
    pub spectra: [(f64, f64); 2],
}

impl Default for Ranges {
    fn default() -> Self {
        Self { origin_z: None, spectra: [(-0.01, 0.01), (-0.95, 1.05)] }
    }
}

/// Complete configuration of a refiner.
///
/// Fields not documented inline:
/// - `calc_curvatures`: compute diagonal curvatures on every evaluation.
/// - `use_curvatures`: start in curvature mode instead of waiting for
///   `use_curvatures_threshold` consecutive positive-curvature calls.
/// - `min_multiplicity`: structure factors observed fewer times stay fixed.
/// - `freeze_idx`: ASU indices whose amplitudes stay fixed.
/// - `only_pass_refined_x`: the optimizer sees only refined slots.
/// - `panel_groups`: panel → group; unlisted panels fall in group 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinerOptions {
    pub refine: RefineFlags,
    pub global: GlobalFlags,
    pub background_mode: BackgroundMode,
    /// Refine the background offset in log space so it stays positive.
    pub bg_offset_positive: bool,
    pub sigmas: Sensitivities,
    pub ranges: Ranges,
    pub priors: PriorOptions,
    pub noise: NoiseModel,
    pub lambda_assembly: LambdaAssembly,
    pub rescale_params: bool,
    pub log_fcells: bool,
    pub rescale_fcell_by_resolution: bool,
    pub calc_curvatures: bool,
    pub use_curvatures: bool,
    pub use_curvatures_threshold: usize,
    pub fix_params_with_negative_curvature: bool,
    pub min_multiplicity: u64,
    pub freeze_idx: Vec<MillerIndex>,
    pub iteratively_freeze_parameters: bool,
    pub number_of_frozen_iterations: usize,
    pub only_pass_refined_x: bool,
    /// Mosaic block size; one value (isotropic) or three.
    pub ncells_init: Vec<f64>,
    pub spectra_init: [f64; 2],
    pub gain_init: f64,
    pub panel_groups: BTreeMap<PanelId, usize>,
    pub bad_shots: Vec<ShotId>,
    pub verbose: bool,
    /// Seconds to sleep after each evaluation.
    pub pause_after_iteration: Option<f64>,
    /// Directory for the per-evaluation state archive.
    pub output_dir: Option<PathBuf>,
    pub trial_id: usize,
    /// Archive to restart `Xall` from.
    pub restart_file: Option<PathBuf>,
}

impl Default for RefinerOptions {
    fn default() -> Self {
        Self {
            refine: RefineFlags::default(),
            global: GlobalFlags::default(),
            background_mode: BackgroundMode::default(),
            bg_offset_positive: false,
            sigmas: Sensitivities::default(),
            ranges: Ranges::default(),
            priors: PriorOptions::default(),
            noise: NoiseModel::default(),
            lambda_assembly: LambdaAssembly::default(),
            rescale_params: true,
            log_fcells: true,
            rescale_fcell_by_resolution: false,
            calc_curvatures: false,
            use_curvatures: false,
            use_curvatures_threshold: 7,
            fix_params_with_negative_curvature: false,
            min_multiplicity: 1,
            freeze_idx: Vec::new(),
            iteratively_freeze_parameters: false,
            number_of_frozen_iterations: 10,
            only_pass_refined_x: true,
            ncells_init: vec![10.0],
            spectra_init: [0.0, 1.0],
            gain_init: 1.0,
            panel_groups: BTreeMap::new(),
            bad_shots: Vec::new(),
            verbose: false,
            pause_after_iteration: None,
            output_dir: None,
            trial_id: 0,
            restart_file: None,
        }
    }
}

impl RefinerOptions {
    pub fn from_json(text: &str) -> RefineResult<Self> {
        let options: Self = serde_json::from_str(text).map_err(|e| RefineError::InvalidOption {
            name: "options",
            reason: if e.is_syntax() { "malformed JSON" } else { "unexpected field or value" },
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn n_panel_groups(&self) -> usize {
        self.panel_groups.values().copied().max().map_or(1, |m| m + 1)
    }

    pub fn panel_group(&self, panel: PanelId) -> usize {
        self.panel_groups.get(&panel).copied().unwrap_or(0)
    }

    pub fn is_isotropic_ncells(&self) -> bool {
        self.ncells_init.len() == 1
    }

    pub fn is_bad_shot(&self, shot: ShotId) -> bool {
        self.bad_shots.contains(&shot)
    }

    /// Check option combinations that can never produce a valid refiner.
    ///
    /// # Errors
    /// - [`RefineError::RequiresRescaling`] for background coefficient,
    ///   spectral or panel refinement without rescaling.
    /// - [`RefineError::CurvatureUnsupported`] for bounded classes with
    ///   curvature tracking.
    /// - [`RefineError::InvalidSigma`] / [`RefineError::InvalidRange`] /
    ///   [`RefineError::InitOutsideRange`] / [`RefineError::InvalidInit`]
    ///   for unusable values.
    /// - [`RefineError::InvalidOption`] for inconsistent switches.
    pub fn validate(&self) -> RefineResult<()> {
        let r = &self.refine;
        if !self.rescale_params {
            if r.background && self.background_mode == BackgroundMode::Extracted {
                return Err(RefineError::RequiresRescaling { class: "background_coefficient" });
            }
            if r.spectra {
                return Err(RefineError::RequiresRescaling { class: "spectra" });
            }
            if r.panel_rotation {
                return Err(RefineError::RequiresRescaling { class: "panel_rotation" });
            }
            if r.panel_xy {
                return Err(RefineError::RequiresRescaling { class: "panel_xy" });
            }
        }
        if self.calc_curvatures {
            if r.origin_z && self.ranges.origin_z.is_some() {
                return Err(RefineError::CurvatureUnsupported { class: "origin_z" });
            }
            if r.spectra {
                return Err(RefineError::CurvatureUnsupported { class: "spectra" });
            }
        }
        if self.use_curvatures && !self.calc_curvatures {
            return Err(RefineError::InvalidOption {
                name: "use_curvatures",
                reason: "curvature mode requires calc_curvatures",
            });
        }
        if self.fix_params_with_negative_curvature && !self.calc_curvatures {
            return Err(RefineError::InvalidOption {
                name: "fix_params_with_negative_curvature",
                reason: "negative-curvature freezing requires calc_curvatures",
            });
        }

        let s = &self.sigmas;
        let sigmas = [
            ("rotation", s.rotation[0]),
            ("rotation", s.rotation[1]),
            ("rotation", s.rotation[2]),
            ("unit_cell", s.unit_cell),
            ("ncells", s.ncells),
            ("origin_z", s.origin_z),
            ("scale", s.scale),
            ("background", s.background[0]),
            ("background", s.background[1]),
            ("background", s.background[2]),
            ("background_coefficient", s.background_coef),
            ("fcell", s.fcell_scale),
            ("spectra", s.spectra[0]),
            ("spectra", s.spectra[1]),
            ("panel_rotation", s.panel_rotation),
            ("panel_xy", s.panel_xy),
        ];
        for (class, value) in sigmas {
            if !(value.is_finite() && value > 0.0) {
                return Err(RefineError::InvalidSigma { class, value });
            }
        }

        if let Some((low, high)) = self.ranges.origin_z {
            if !(low.is_finite() && high.is_finite() && low < high) {
                return Err(RefineError::InvalidRange { class: "origin_z", low, high });
            }
        }
        for (i, (low, high)) in self.ranges.spectra.iter().copied().enumerate() {
            if !(low.is_finite() && high.is_finite() && low < high) {
                return Err(RefineError::InvalidRange { class: "spectra", low, high });
            }
            let init = self.spectra_init[i];
            if init < low || init > high {
                return Err(RefineError::InitOutsideRange { class: "spectra", init, low, high });
            }
        }

        if !matches!(self.ncells_init.len(), 1 | 3) {
            return Err(RefineError::InvalidOption {
                name: "ncells_init",
                reason: "expected one isotropic or three anisotropic values",
            });
        }
        if let Some(value) = self.ncells_init.iter().copied().find(|v| !(v.is_finite() && *v > NCELLS_OFFSET)) {
            return Err(RefineError::InvalidInit {
                class: "ncells",
                value,
                reason: "mosaic block size must exceed three cells",
            });
        }
        if !(self.gain_init.is_finite() && self.gain_init > 0.0) {
            return Err(RefineError::InvalidInit {
                class: "gain",
                value: self.gain_init,
                reason: "gain must be positive",
            });
        }
        if self.iteratively_freeze_parameters && self.number_of_frozen_iterations == 0 {
            return Err(RefineError::InvalidOption {
                name: "number_of_frozen_iterations",
                reason: "must be positive when freezing is enabled",
            });
        }
        if let Some(pause) = self.pause_after_iteration {
            if !(pause.is_finite() && pause >= 0.0) {
                return Err(RefineError::InvalidOption {
                    name: "pause_after_iteration",
                    reason: "must be a non-negative number of seconds",
                });
            }
        }
        self.priors.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // Defaults, rescaling requirements, curvature restrictions and JSON
    // loading.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // Defaults are a valid configuration.
    //
    // Given
    // -----
    // - `RefinerOptions::default()`.
    //
    // Expect
    // ------
    // - `validate()` succeeds; threshold 7, ncells sigma 0.05.
    fn defaults_validate() {
        // Arrange
        let opts = RefinerOptions::default();

        // Act / Assert
        assert!(opts.validate().is_ok());
        assert_eq!(opts.use_curvatures_threshold, 7);
        assert_eq!(opts.sigmas.ncells, 0.05);
    }

    #[test]
    // Purpose
    // -------
    // Classes that only exist in rescaled form refuse unscaled refinement.
    //
    // Given
    // -----
    // - rescale_params = false with the extracted background coefficient,
    //   then with spectra, then with panel XY.
    //
    // Expect
    // ------
    // - `RequiresRescaling` naming the class each time.
    fn unscaled_refinement_of_rescale_only_classes_is_rejected() {
        // Arrange
        let mut base = RefinerOptions { rescale_params: false, ..Default::default() };
        base.refine = RefineFlags::none();

        let mut bg = base.clone();
        bg.background_mode = BackgroundMode::Extracted;
        bg.refine.background = true;
        let mut spectra = base.clone();
        spectra.refine.spectra = true;
        let mut panel = base.clone();
        panel.refine.panel_xy = true;

        // Act / Assert
        assert_eq!(
            bg.validate(),
            Err(RefineError::RequiresRescaling { class: "background_coefficient" })
        );
        assert_eq!(spectra.validate(), Err(RefineError::RequiresRescaling { class: "spectra" }));
        assert_eq!(panel.validate(), Err(RefineError::RequiresRescaling { class: "panel_xy" }));
    }

    #[test]
    // Purpose
    // -------
    // Bounded origin Z cannot be combined with curvatures.
    //
    // Given
    // -----
    // - origin Z refined with range (-1, 1) and calc_curvatures on.
    //
    // Expect
    // ------
    // - `CurvatureUnsupported { class: "origin_z" }`.
    fn bounded_origin_with_curvatures_is_rejected() {
        // Arrange
        let mut opts = RefinerOptions { calc_curvatures: true, ..Default::default() };
        opts.refine.origin_z = true;
        opts.ranges.origin_z = Some((-1.0, 1.0));

        // Act / Assert
        assert_eq!(opts.validate(), Err(RefineError::CurvatureUnsupported { class: "origin_z" }));
    }

    #[test]
    // Purpose
    // -------
    // Partial JSON fills the rest from defaults and is validated.
    //
    // Given
    // -----
    // - JSON setting Gaussian noise and a two-group panel map.
    //
    // Expect
    // ------
    // - Gaussian noise with σr 2.5; two panel groups; other fields default.
    fn from_json_merges_with_defaults() {
        // Arrange
        let text = r#"{
            "noise": {"kind": "gaussian", "sigma_readout": 2.5},
            "panel_groups": {"0": 0, "1": 1},
            "refine": {"fcell": true}
        }"#;

        // Act
        let opts = RefinerOptions::from_json(text).expect("valid options");

        // Assert
        assert_eq!(opts.noise, NoiseModel::Gaussian { sigma_readout: 2.5 });
        assert_eq!(opts.n_panel_groups(), 2);
        assert!(opts.refine.fcell && opts.refine.rotation);
        assert_eq!(opts.min_multiplicity, 1);
    }
}
