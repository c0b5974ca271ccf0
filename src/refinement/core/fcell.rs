//! Structure-factor bookkeeping.
//!
//! - [`FcellIndexMap`]: dense `0..n_fcell` ↔ ASU Miller index, fixed at setup.
//! - [`count_multiplicity`]: observations per ASU index over the selected
//!   spots of the good shots; reduced across workers before gating.
//! - [`ResolutionSigmas`]: per-structure-factor sensitivities from
//!   resolution-bin statistics.
use crate::refinement::{
    collaborators::MillerIndex,
    core::{options::RefinerOptions, shots::ShotMap},
    errors::{RefineError, RefineResult},
};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct FcellIndexMap {
    asu: Vec<MillerIndex>,
    dense: HashMap<MillerIndex, usize>,
}

impl FcellIndexMap {
    /// # Errors
    /// [`RefineError::EmptyFcellMap`] or [`RefineError::DuplicateAsuIndex`].
    pub fn new(asu: Vec<MillerIndex>) -> RefineResult<Self> {
        if asu.is_empty() {
            return Err(RefineError::EmptyFcellMap);
        }
        let mut dense = HashMap::with_capacity(asu.len());
        for (i, hkl) in asu.iter().enumerate() {
            if dense.insert(*hkl, i).is_some() {
                return Err(RefineError::DuplicateAsuIndex { hkl: *hkl });
            }
        }
        Ok(Self { asu, dense })
    }

    pub fn len(&self) -> usize {
        self.asu.len()
    }

    pub fn is_empty(&self) -> bool {
        self.asu.is_empty()
    }

    pub fn asu(&self, i_fcell: usize) -> MillerIndex {
        self.asu[i_fcell]
    }

    pub fn indices(&self) -> &[MillerIndex] {
        &self.asu
    }

    pub fn dense(&self, hkl: &MillerIndex) -> RefineResult<usize> {
        self.dense.get(hkl).copied().ok_or(RefineError::UnknownAsuIndex { hkl: *hkl })
    }
}

/// Count observations of each ASU index on this worker.
pub fn count_multiplicity(shots: &ShotMap, options: &RefinerOptions) -> HashMap<MillerIndex, u64> {
    let mut counts = HashMap::new();
    for (shot_id, shot) in shots {
        if options.is_bad_shot(*shot_id) {
            continue;
        }
        for spot in shot.spots.iter().filter(|s| s.selected) {
            *counts.entry(spot.asu).or_insert(0) += 1;
        }
    }
    counts
}

/// Refinable flag per dense index: observed at least `min_multiplicity`
/// times and not listed in `freeze_idx`.
pub fn refinable_fcells(
    map: &FcellIndexMap, counts: &HashMap<MillerIndex, u64>, options: &RefinerOptions,
) -> Vec<bool> {
    map.indices()
        .iter()
        .map(|hkl| {
            let count = counts.get(hkl).copied().unwrap_or(0);
            count >= options.min_multiplicity && !options.freeze_idx.contains(hkl)
        })
        .collect()
}

/// Sensitivity of each structure factor before `fcell_scale` is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionSigmas {
    per_bin: Vec<f64>,
    bin_of: Vec<usize>,
}

impl ResolutionSigmas {
    /// Every structure factor gets sigma 1.
    pub fn uniform(n_fcell: usize) -> Self {
        Self { per_bin: vec![1.0], bin_of: vec![0; n_fcell] }
    }

    /// Bin statistics from reference amplitudes.
    ///
    /// Per bin, `σ_bin = sqrt(mean F²)`; empty or all-zero bins borrow the
    /// nearest non-zero bin. With `rescale`, each bin gets `1/σ_bin`
    /// normalized by the sum over bins; otherwise every bin gets 1.
    ///
    /// # Errors
    /// - [`RefineError::ResolutionBinMismatch`] when `bins` and `amplitudes`
    ///   differ in length.
    /// - [`RefineError::AllResolutionBinsEmpty`] when no bin has intensity.
    pub fn from_bins(amplitudes: &[f64], bins: &[usize], rescale: bool) -> RefineResult<Self> {
        if bins.len() != amplitudes.len() {
            return Err(RefineError::ResolutionBinMismatch {
                expected: amplitudes.len(),
                found: bins.len(),
            });
        }
        let n_bins = bins.iter().copied().max().map_or(0, |m| m + 1);
        let mut sum_sq = vec![0.0; n_bins];
        let mut count = vec![0usize; n_bins];
        for (&bin, &amp) in bins.iter().zip(amplitudes) {
            sum_sq[bin] += amp * amp;
            count[bin] += 1;
        }
        let raw: Vec<f64> = sum_sq
            .iter()
            .zip(&count)
            .map(|(s, &c)| if c == 0 { 0.0 } else { (s / c as f64).sqrt() })
            .collect();

        let mut filled = Vec::with_capacity(n_bins);
        for (i, &value) in raw.iter().enumerate() {
            let sigma = if value > 0.0 { value } else { nearest_non_zero(&raw, i) };
            if !(sigma.is_finite() && sigma > 0.0) {
                return Err(RefineError::AllResolutionBinsEmpty);
            }
            filled.push(sigma);
        }

        let per_bin = if rescale {
            let total: f64 = filled.iter().map(|s| 1.0 / s).sum();
            filled.iter().map(|s| 1.0 / s / total).collect()
        } else {
            vec![1.0; n_bins]
        };
        Ok(Self { per_bin, bin_of: bins.to_vec() })
    }

    pub fn sigma(&self, i_fcell: usize) -> f64 {
        self.bin_of.get(i_fcell).and_then(|b| self.per_bin.get(*b)).copied().unwrap_or(1.0)
    }

    pub fn per_bin(&self) -> &[f64] {
        &self.per_bin
    }
}

/// Value of the closest non-zero entry to `i`, preferring the lower index
/// on ties; zero when every entry is zero.
fn nearest_non_zero(values: &[f64], i: usize) -> f64 {
    (1..values.len())
        .flat_map(|k| [i.checked_sub(k), Some(i + k)])
        .flatten()
        .filter_map(|j| values.get(j).copied())
        .find(|v| *v > 0.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinement::core::shots::{
        BackgroundPlane, CrystalModel, RegionOfInterest, Shot, Spectrum, Spot,
    };
    use crate::refinement::synthetic::CubicCell;
    use nalgebra::Matrix3;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // Index map validation, multiplicity counting and gating, and
    // resolution-bin sigmas.
    // -------------------------------------------------------------------------

    fn shot_with(hkls: &[MillerIndex]) -> Shot {
        let roi = RegionOfInterest::new(0, 0, 0, 0).expect("valid roi");
        let spots = hkls
            .iter()
            .map(|hkl| {
                Spot::new(roi, 0, *hkl, array![1.0], BackgroundPlane::new(0.0, 0.0, 0.0))
                    .expect("valid spot")
            })
            .collect();
        let crystal = CrystalModel::new(Matrix3::identity(), Box::new(CubicCell::new(30.0)));
        Shot::new(spots, Spectrum::monochromatic(1.0).expect("spectrum"), crystal)
    }

    #[test]
    // Purpose
    // -------
    // Duplicate ASU indices are rejected.
    //
    // Given
    // -----
    // - [(1,0,0), (0,1,0), (1,0,0)].
    //
    // Expect
    // ------
    // - `DuplicateAsuIndex { hkl: [1,0,0] }`.
    fn index_map_rejects_duplicates() {
        // Arrange / Act
        let res = FcellIndexMap::new(vec![[1, 0, 0], [0, 1, 0], [1, 0, 0]]);

        // Assert
        assert_eq!(res, Err(RefineError::DuplicateAsuIndex { hkl: [1, 0, 0] }));
    }

    #[test]
    // Purpose
    // -------
    // Multiplicity gating skips bad shots, deselected spots and frozen indices.
    //
    // Given
    // -----
    // - Shot 0: (1,0,0) twice and (0,1,0) once; shot 1 (bad): (0,1,0).
    // - min_multiplicity 2; (0,0,1) listed in freeze_idx.
    //
    // Expect
    // ------
    // - Refinable flags [true, false, false] for [(1,0,0), (0,1,0), (0,0,1)].
    fn multiplicity_gating_respects_filters() {
        // Arrange
        let mut shots = ShotMap::new();
        shots.insert(0, shot_with(&[[1, 0, 0], [1, 0, 0], [0, 1, 0], [0, 0, 1], [0, 0, 1]]));
        shots.insert(1, shot_with(&[[0, 1, 0]]));
        let options = RefinerOptions {
            min_multiplicity: 2,
            bad_shots: vec![1],
            freeze_idx: vec![[0, 0, 1]],
            ..Default::default()
        };
        let map = FcellIndexMap::new(vec![[1, 0, 0], [0, 1, 0], [0, 0, 1]]).expect("map");

        // Act
        let counts = count_multiplicity(&shots, &options);
        let flags = refinable_fcells(&map, &counts, &options);

        // Assert
        assert_eq!(counts[&[0, 1, 0]], 1);
        assert_eq!(flags, vec![true, false, false]);
    }

    #[test]
    // Purpose
    // -------
    // Empty bins borrow their nearest neighbor and rescaled sigmas sum to one.
    //
    // Given
    // -----
    // - Amplitudes [2, 2, 0, 4] in bins [0, 0, 1, 2].
    //
    // Expect
    // ------
    // - Raw sigmas [2, 0→2, 4]; rescaled sigmas ∝ [1/2, 1/2, 1/4] summing to 1.
    fn resolution_sigmas_fill_and_normalize() {
        // Arrange / Act
        let sigmas = ResolutionSigmas::from_bins(&[2.0, 2.0, 0.0, 4.0], &[0, 0, 1, 2], true)
            .expect("bins should resolve");

        // Assert
        let per_bin = sigmas.per_bin();
        assert!((per_bin.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((per_bin[0] - 0.4).abs() < 1e-12);
        assert!((per_bin[1] - 0.4).abs() < 1e-12);
        assert!((per_bin[2] - 0.2).abs() < 1e-12);
        assert!((sigmas.sigma(3) - 0.2).abs() < 1e-12);
    }

    #[test]
    // Purpose
    // -------
    // All-zero amplitudes cannot define sigmas.
    //
    // Given
    // -----
    // - Amplitudes [0, 0] in bins [0, 1].
    //
    // Expect
    // ------
    // - `AllResolutionBinsEmpty`.
    fn resolution_sigmas_reject_all_zero() {
        // Arrange / Act
        let res = ResolutionSigmas::from_bins(&[0.0, 0.0], &[0, 1], true);

        // Assert
        assert_eq!(res, Err(RefineError::AllResolutionBinsEmpty));
    }
}
