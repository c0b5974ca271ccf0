//! Error surface of the refinement layer.
//!
//! Every variant is a configuration or input problem detected while setting
//! up or evaluating a refiner. Numerical edge cases inside the likelihood
//! (non-positive expected counts, negative amplitudes) are counted and
//! logged instead, and curvature problems travel as step statuses.
use crate::refinement::collaborators::MillerIndex;
use crate::refinement::core::shots::ShotId;

pub type RefineResult<T> = Result<T, RefineError>;

#[derive(Debug, Clone, PartialEq)]
pub enum RefineError {
    // ---- Shots ----
    /// No shots were supplied.
    EmptyShotSet,

    /// A per-shot mapping does not cover exactly the canonical shot ids.
    ShotKeyMismatch {
        field: &'static str,
        missing: Vec<ShotId>,
        unexpected: Vec<ShotId>,
    },

    /// A shot is missing an input that the configuration requires.
    MissingShotInput {
        shot: ShotId,
        field: &'static str,
    },

    /// Per-spot inputs of a shot disagree in length.
    SpotCountMismatch {
        shot: ShotId,
        field: &'static str,
        expected: usize,
        found: usize,
    },

    /// A per-pixel array does not match the size of its region of interest.
    PixelCountMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    /// Region of interest bounds are inverted.
    InvalidRegion {
        x1: usize,
        x2: usize,
        y1: usize,
        y2: usize,
    },

    /// Observed pixels must be finite.
    NonFiniteObservation {
        index: usize,
        value: f64,
    },

    /// Unit-cell managers of different shots expose different variable counts.
    CellVariableMismatch {
        shot: ShotId,
        expected: usize,
        found: usize,
    },

    // ---- Structure factors ----
    /// The dense structure-factor index map is empty.
    EmptyFcellMap,

    /// An ASU index appears twice in the structure-factor index map.
    DuplicateAsuIndex {
        hkl: MillerIndex,
    },

    /// A spot refers to an ASU index absent from the structure-factor map.
    UnknownAsuIndex {
        hkl: MillerIndex,
    },

    /// The simulator's amplitude table has no entry for an ASU index.
    MissingAmplitude {
        hkl: MillerIndex,
    },

    /// Resolution bin assignments do not cover the structure factors.
    ResolutionBinMismatch {
        expected: usize,
        found: usize,
    },

    /// Every resolution bin has zero mean intensity.
    AllResolutionBinsEmpty,

    // ---- Layout ----
    /// Parameter blocks do not fit into the configured vector length.
    LayoutOverflow {
        needed: usize,
        available: usize,
    },

    /// A supplied initial parameter vector has the wrong length.
    RestartVectorLength {
        expected: usize,
        found: usize,
    },

    /// Optimizer vector handed to the refiner has the wrong length.
    OptimizerVectorLength {
        expected: usize,
        found: usize,
    },

    // ---- Options ----
    /// A parameter class needs rescaling to be refined.
    RequiresRescaling {
        class: &'static str,
    },

    /// Curvatures are not available for a bounded parameter class.
    CurvatureUnsupported {
        class: &'static str,
    },

    /// Sensitivities must be positive and finite.
    InvalidSigma {
        class: &'static str,
        value: f64,
    },

    /// A range must satisfy low < high.
    InvalidRange {
        class: &'static str,
        low: f64,
        high: f64,
    },

    /// An initial value lies outside its configured range.
    InitOutsideRange {
        class: &'static str,
        init: f64,
        low: f64,
        high: f64,
    },

    /// An initial value is unusable for its parameterization.
    InvalidInit {
        class: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// Generic option validation failure.
    InvalidOption {
        name: &'static str,
        reason: &'static str,
    },

    /// Panel refinement requested without a panel-group assignment.
    UnknownPanelGroup {
        panel: usize,
    },

    // ---- Collaborators ----
    /// The simulator or cell manager reported a failure.
    Collaborator {
        text: String,
    },

    /// The reduction layer failed.
    Reduction {
        text: String,
    },

    // ---- State ----
    /// Reading or writing a state archive failed.
    StateIo {
        path: String,
        text: String,
    },
}

impl std::error::Error for RefineError {}

impl std::fmt::Display for RefineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // ---- Shots ----
            RefineError::EmptyShotSet => write!(f, "No shots supplied"),
            RefineError::ShotKeyMismatch { field, missing, unexpected } => {
                write!(
                    f,
                    "Shot ids of '{field}' do not match the shot set: missing {missing:?}, \
                     unexpected {unexpected:?}"
                )
            }
            RefineError::MissingShotInput { shot, field } => {
                write!(f, "Shot {shot} is missing required input '{field}'")
            }
            RefineError::SpotCountMismatch { shot, field, expected, found } => {
                write!(f, "Shot {shot}: '{field}' has {found} entries, expected {expected}")
            }
            RefineError::PixelCountMismatch { field, expected, found } => {
                write!(f, "'{field}' has {found} pixels, region of interest has {expected}")
            }
            RefineError::InvalidRegion { x1, x2, y1, y2 } => {
                write!(f, "Invalid region of interest x [{x1}, {x2}], y [{y1}, {y2}]")
            }
            RefineError::NonFiniteObservation { index, value } => {
                write!(f, "Observed pixel {index} is not finite: {value}")
            }
            RefineError::CellVariableMismatch { shot, expected, found } => {
                write!(f, "Shot {shot}: cell manager has {found} variables, expected {expected}")
            }

            // ---- Structure factors ----
            RefineError::EmptyFcellMap => {
                write!(f, "Structure-factor index map is empty")
            }
            RefineError::DuplicateAsuIndex { hkl } => {
                write!(f, "ASU index {hkl:?} appears more than once")
            }
            RefineError::UnknownAsuIndex { hkl } => {
                write!(f, "ASU index {hkl:?} is not in the structure-factor map")
            }
            RefineError::MissingAmplitude { hkl } => {
                write!(f, "No amplitude for ASU index {hkl:?} in the simulator table")
            }
            RefineError::ResolutionBinMismatch { expected, found } => {
                write!(f, "Resolution bins cover {found} structure factors, expected {expected}")
            }
            RefineError::AllResolutionBinsEmpty => {
                write!(f, "Every resolution bin has zero mean intensity")
            }

            // ---- Layout ----
            RefineError::LayoutOverflow { needed, available } => {
                write!(f, "Parameter layout needs {needed} slots, only {available} available")
            }
            RefineError::RestartVectorLength { expected, found } => {
                write!(f, "Restart vector has length {found}, expected {expected}")
            }
            RefineError::OptimizerVectorLength { expected, found } => {
                write!(f, "Optimizer vector has length {found}, expected {expected}")
            }

            // ---- Options ----
            RefineError::RequiresRescaling { class } => {
                write!(f, "Refining '{class}' requires parameter rescaling")
            }
            RefineError::CurvatureUnsupported { class } => {
                write!(f, "Curvatures are not available for bounded parameter class '{class}'")
            }
            RefineError::InvalidSigma { class, value } => {
                write!(f, "Invalid sensitivity {value} for '{class}': must be positive and finite")
            }
            RefineError::InvalidRange { class, low, high } => {
                write!(f, "Invalid range [{low}, {high}] for '{class}'")
            }
            RefineError::InitOutsideRange { class, init, low, high } => {
                write!(f, "Initial value {init} of '{class}' lies outside [{low}, {high}]")
            }
            RefineError::InvalidInit { class, value, reason } => {
                write!(f, "Invalid initial value {value} for '{class}': {reason}")
            }
            RefineError::InvalidOption { name, reason } => {
                write!(f, "Invalid option '{name}': {reason}")
            }
            RefineError::UnknownPanelGroup { panel } => {
                write!(f, "Panel {panel} has no panel-group assignment")
            }

            // ---- Collaborators ----
            RefineError::Collaborator { text } => write!(f, "Collaborator error: {text}"),
            RefineError::Reduction { text } => write!(f, "Reduction error: {text}"),

            // ---- State ----
            RefineError::StateIo { path, text } => {
                write!(f, "State archive error at '{path}': {text}")
            }
        }
    }
}
