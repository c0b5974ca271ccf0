//! refinement::core::layout — flat parameter-vector bookkeeping.
//!
//! Purpose
//! -------
//! Assign every scalar parameter of a refinement a fixed slot in the flat
//! vector `Xall`, and map between `Xall` and the (possibly smaller) vector
//! the optimizer sees.
//!
//! Key behaviors
//! -------------
//! - Local (per-shot) blocks start at `local_idx_start` and follow the
//!   shot order: background (3 per spot, or 1 coefficient in extracted
//!   mode), rotation X/Y/Z, unit cell (if local), mosaic (if local),
//!   origin Z (if local), crystal scale.
//! - Global blocks start at `global_param_idx_start`: unit cell (if
//!   global), mosaic (if global), origin Z (if global), structure factors,
//!   spectral coefficients (2), panel-group rotations, panel-group XY
//!   pairs; gain is the last slot of the vector.
//! - [`RefinedSubset`] holds the `x ↔ Xall` maps for a refined mask.
//!
//! Invariants & assumptions
//! ------------------------
//! - Assignment is deterministic for a given shot map and options.
//! - With several workers, each worker's local blocks occupy a disjoint
//!   range `[local_idx_start, local_idx_start + n_local)` and every worker
//!   shares the same global range; see [`LayoutOffsets::for_workers`].
//!
//! Downstream usage
//! ----------------
//! - The refiner reads slot indices from [`ShotSlots`] and [`GlobalSlots`]
//!   and labels from [`ParameterLayout::describe`].
use crate::refinement::{
    core::{
        options::{BackgroundMode, RefinerOptions},
        reparam::ParameterClass,
        shots::{ShotId, ShotMap},
    },
    errors::{RefineError, RefineResult},
};
use ndarray::Array1;
use std::collections::BTreeMap;

/// Where this worker's blocks start and how long `Xall` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutOffsets {
    pub n_total_params: usize,
    pub local_idx_start: usize,
    pub global_param_idx_start: usize,
}

impl LayoutOffsets {
    /// Offsets for worker `rank` given every worker's local parameter count.
    pub fn for_workers(local_counts: &[usize], rank: usize, n_global: usize) -> Self {
        let local_idx_start = local_counts.iter().take(rank).sum();
        let global_param_idx_start: usize = local_counts.iter().sum();
        Self { n_total_params: global_param_idx_start + n_global, local_idx_start, global_param_idx_start }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundSlots {
    /// `[a, b, c]` slots per spot.
    Planes(Vec<[usize; 3]>),
    /// One coefficient scaling the extracted background of every spot.
    Coefficient(usize),
}

/// Slots used by one shot. Global classes point at the shared slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShotSlots {
    pub background: BackgroundSlots,
    pub rotation: [usize; 3],
    pub unit_cell: Vec<usize>,
    pub ncells: Vec<usize>,
    pub origin_z: usize,
    pub scale: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSlots {
    pub unit_cell: Option<Vec<usize>>,
    pub ncells: Option<Vec<usize>>,
    pub origin_z: Option<usize>,
    pub fcell_start: usize,
    pub n_fcell: usize,
    pub spectra: [usize; 2],
    pub panel_rotation: Vec<usize>,
    pub panel_xy: Vec<[usize; 2]>,
    pub gain: usize,
}

impl GlobalSlots {
    pub fn fcell(&self, i_fcell: usize) -> usize {
        self.fcell_start + i_fcell
    }
}

/// Counts that size the layout before offsets are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutShape {
    pub n_unit_cell: usize,
    pub n_ncells: usize,
    pub n_fcell: usize,
    pub n_panel_groups: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterLayout {
    pub offsets: LayoutOffsets,
    pub shape: LayoutShape,
    pub shots: BTreeMap<ShotId, ShotSlots>,
    pub global: GlobalSlots,
    n_local: usize,
    labels: Vec<Option<String>>,
    classes: Vec<Option<ParameterClass>>,
}

impl ParameterLayout {
    /// Number of local slots needed by `shots`.
    pub fn n_local_params(shots: &ShotMap, shape: &LayoutShape, options: &RefinerOptions) -> usize {
        let per_shot_fixed = 3
            + 1
            + if options.global.unit_cell { 0 } else { shape.n_unit_cell }
            + if options.global.ncells { 0 } else { shape.n_ncells }
            + usize::from(!options.global.origin_z);
        shots
            .values()
            .map(|shot| {
                let background = match options.background_mode {
                    BackgroundMode::Extracted => 1,
                    _ => 3 * shot.n_spots(),
                };
                background + per_shot_fixed
            })
            .sum()
    }

    /// Number of global slots, gain included.
    pub fn n_global_params(shape: &LayoutShape, options: &RefinerOptions) -> usize {
        (if options.global.unit_cell { shape.n_unit_cell } else { 0 })
            + (if options.global.ncells { shape.n_ncells } else { 0 })
            + usize::from(options.global.origin_z)
            + shape.n_fcell
            + 2
            + 3 * shape.n_panel_groups
            + 1
    }

    /// Offsets of a layout owned by a single worker.
    pub fn single_worker(shots: &ShotMap, shape: &LayoutShape, options: &RefinerOptions) -> LayoutOffsets {
        let n_local = Self::n_local_params(shots, shape, options);
        LayoutOffsets::for_workers(&[n_local], 0, Self::n_global_params(shape, options))
    }

    /// Assign slots.
    ///
    /// # Errors
    /// - [`RefineError::EmptyFcellMap`] when `shape.n_fcell == 0`.
    /// - [`RefineError::LayoutOverflow`] when local blocks run into the
    ///   global range or global blocks run past `n_total_params`.
    pub fn build(
        shots: &ShotMap, shape: LayoutShape, options: &RefinerOptions, offsets: LayoutOffsets,
        cell_names: &[String],
    ) -> RefineResult<Self> {
        if shape.n_fcell == 0 {
            return Err(RefineError::EmptyFcellMap);
        }
        let n_local = Self::n_local_params(shots, &shape, options);
        let n_global = Self::n_global_params(&shape, options);
        let local_end = offsets.local_idx_start + n_local;
        if local_end > offsets.global_param_idx_start {
            return Err(RefineError::LayoutOverflow {
                needed: local_end,
                available: offsets.global_param_idx_start,
            });
        }
        if offsets.global_param_idx_start + n_global > offsets.n_total_params {
            return Err(RefineError::LayoutOverflow {
                needed: offsets.global_param_idx_start + n_global,
                available: offsets.n_total_params,
            });
        }

        let mut labels = vec![None; offsets.n_total_params];
        let mut classes = vec![None; offsets.n_total_params];
        let mut cursor = Cursor { next: offsets.global_param_idx_start, labels: &mut labels, classes: &mut classes };

        let ncells_names: Vec<String> = if shape.n_ncells == 1 {
            vec!["m".to_string()]
        } else {
            ["Na", "Nb", "Nc"].iter().map(|s| s.to_string()).collect()
        };

        // Global leading blocks come first so local shots can point at them.
        let global_unit_cell = options.global.unit_cell.then(|| {
            (0..shape.n_unit_cell)
                .map(|i| cursor.take(cell_label(cell_names, i), ParameterClass::UnitCell))
                .collect::<Vec<_>>()
        });
        let global_ncells = options.global.ncells.then(|| {
            ncells_names.iter().map(|n| cursor.take(n.clone(), ParameterClass::Ncells)).collect::<Vec<_>>()
        });
        let global_origin_z =
            options.global.origin_z.then(|| cursor.take("originZ".into(), ParameterClass::OriginZ));
        let fcell_start = cursor.next;
        for _ in 0..shape.n_fcell {
            cursor.take("fcell".into(), ParameterClass::Fcell);
        }
        let spectra = [
            cursor.take("lambda0".into(), ParameterClass::Spectra),
            cursor.take("lambda1".into(), ParameterClass::Spectra),
        ];
        let panel_rotation = (0..shape.n_panel_groups)
            .map(|_| cursor.take("panelRot".into(), ParameterClass::PanelRotation))
            .collect();
        let panel_xy = (0..shape.n_panel_groups)
            .map(|_| {
                [
                    cursor.take("panelX".into(), ParameterClass::PanelXY),
                    cursor.take("panelY".into(), ParameterClass::PanelXY),
                ]
            })
            .collect();
        cursor.next = offsets.n_total_params - 1;
        let gain = cursor.take("gain".into(), ParameterClass::Gain);

        cursor.next = offsets.local_idx_start;
        let mut shot_slots = BTreeMap::new();
        for (&shot_id, shot) in shots {
            let background = match options.background_mode {
                BackgroundMode::Extracted => BackgroundSlots::Coefficient(
                    cursor.take("bg_coef".into(), ParameterClass::BackgroundCoefficient),
                ),
                _ => BackgroundSlots::Planes(
                    (0..shot.n_spots())
                        .map(|_| {
                            [
                                cursor.take("t1".into(), ParameterClass::Background),
                                cursor.take("t2".into(), ParameterClass::Background),
                                cursor.take("t3".into(), ParameterClass::Background),
                            ]
                        })
                        .collect(),
                ),
            };
            let rotation = [
                cursor.take("rX".into(), ParameterClass::Rotation),
                cursor.take("rY".into(), ParameterClass::Rotation),
                cursor.take("rZ".into(), ParameterClass::Rotation),
            ];
            let unit_cell = match &global_unit_cell {
                Some(slots) => slots.clone(),
                None => (0..shape.n_unit_cell)
                    .map(|i| cursor.take(cell_label(cell_names, i), ParameterClass::UnitCell))
                    .collect(),
            };
            let ncells = match &global_ncells {
                Some(slots) => slots.clone(),
                None => ncells_names.iter().map(|n| cursor.take(n.clone(), ParameterClass::Ncells)).collect(),
            };
            let origin_z = match global_origin_z {
                Some(slot) => slot,
                None => cursor.take("originZ".into(), ParameterClass::OriginZ),
            };
            let scale = cursor.take("Gs".into(), ParameterClass::Scale);
            shot_slots.insert(shot_id, ShotSlots { background, rotation, unit_cell, ncells, origin_z, scale });
        }

        Ok(Self {
            offsets,
            shape,
            shots: shot_slots,
            global: GlobalSlots {
                unit_cell: global_unit_cell,
                ncells: global_ncells,
                origin_z: global_origin_z,
                fcell_start,
                n_fcell: shape.n_fcell,
                spectra,
                panel_rotation,
                panel_xy,
                gain,
            },
            n_local,
            labels,
            classes,
        })
    }

    pub fn n_total_params(&self) -> usize {
        self.offsets.n_total_params
    }

    pub fn n_local(&self) -> usize {
        self.n_local
    }

    /// Identifier of slot `index`; slots owned by other workers read "remote".
    pub fn describe(&self, index: usize) -> &str {
        self.labels.get(index).and_then(|l| l.as_deref()).unwrap_or("remote")
    }

    /// Every slot of `class` known to this worker.
    pub fn indices_of(&self, class: ParameterClass) -> Vec<usize> {
        let matches = |c: ParameterClass| match class {
            ParameterClass::Background | ParameterClass::BackgroundCoefficient => {
                matches!(c, ParameterClass::Background | ParameterClass::BackgroundCoefficient)
            }
            other => c == other,
        };
        self.classes
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.filter(|c| matches(*c)).map(|_| i))
            .collect()
    }
}

fn cell_label(names: &[String], i: usize) -> String {
    names.get(i).cloned().unwrap_or_else(|| format!("ucell{i}"))
}

struct Cursor<'a> {
    next: usize,
    labels: &'a mut [Option<String>],
    classes: &'a mut [Option<ParameterClass>],
}

impl Cursor<'_> {
    fn take(&mut self, label: String, class: ParameterClass) -> usize {
        let index = self.next;
        self.labels[index] = Some(label);
        self.classes[index] = Some(class);
        self.next += 1;
        index
    }
}

/// Maps between the optimizer vector `x` and `Xall`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinedSubset {
    x2xall: Vec<usize>,
    xall2x: Vec<Option<usize>>,
}

impl RefinedSubset {
    /// With `only_refined`, `x` holds the refined slots in ascending order;
    /// otherwise `x` is all of `Xall`.
    pub fn from_mask(mask: &[bool], only_refined: bool) -> Self {
        let x2xall: Vec<usize> =
            (0..mask.len()).filter(|&i| !only_refined || mask[i]).collect();
        let mut xall2x = vec![None; mask.len()];
        for (i_x, &i_all) in x2xall.iter().enumerate() {
            xall2x[i_all] = Some(i_x);
        }
        Self { x2xall, xall2x }
    }

    pub fn len(&self) -> usize {
        self.x2xall.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x2xall.is_empty()
    }

    pub fn x2xall(&self) -> &[usize] {
        &self.x2xall
    }

    pub fn xall2x(&self, index: usize) -> Option<usize> {
        self.xall2x.get(index).copied().flatten()
    }

    pub fn gather(&self, xall: &Array1<f64>) -> Array1<f64> {
        Array1::from_iter(self.x2xall.iter().map(|&i| xall[i]))
    }

    pub fn scatter(&self, x: &Array1<f64>, xall: &mut Array1<f64>) {
        for (&i_all, &v) in self.x2xall.iter().zip(x.iter()) {
            xall[i_all] = v;
        }
    }
}
