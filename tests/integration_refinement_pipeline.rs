//! Integration tests for multi-shot refinement.
//!
//! Purpose
//! -------
//! - Validate the end-to-end refinement pipeline: from per-shot inputs,
//!   through setup on one or several workers, to solver passes that recover
//!   the parameters used to generate noise-free data.
//! - Check that splitting shots across a reduction group does not change
//!   what the optimizer sees.
//!
//! Coverage
//! --------
//! - `refinement::core::shots::ShotInputs`: key-set validation and assembly.
//! - `refinement::models::refiner::Refiner`:
//!   - background recovery with the gradient-only backend,
//!   - the switch to the curvature-aided backend after a restart request,
//!   - extracted-background coefficient recovery,
//!   - Poisson and Gaussian gradients against finite differences with
//!     every parameter class refined.
//! - `reduction::LocalGroup`: two-worker evaluation equals single-process
//!   evaluation; multiplicity gating counts observations across workers.
//!
//! Exclusions
//! ----------
//! - Unit-level behavior of reparameterizations, likelihoods, layout and
//!   the optimizer drivers; those are covered next to their modules.
use approx::assert_relative_eq;
use bragg_refine::{
    optimization::lbfgs::{
        Evaluation, LineSearchParams, LineSearcher, RefinementTarget, SolverOptions, Tolerances,
        check_gradient,
    },
    reduction::{LocalGroup, ReductionBackend, SingleProcess},
    refinement::{
        BackgroundMode, BackgroundPlane, CellManager, CrystalModel, FhklTable, MillerIndex, NoiseModel,
        RefineError, RefineFlags, Refiner, RefinerInputs, RefinerOptions, RegionOfInterest, Shot, ShotId,
        ShotInputs, ShotMap, Simulator, Spectrum, Spot,
        core::layout::BackgroundSlots,
        synthetic::{CubicCell, GaussianSpotSimulator},
    },
};
use nalgebra::Matrix3;
use ndarray::Array1;
use std::thread;

const CELL_A: f64 = 50.0;
const TRUE_AMPLITUDES: [f64; 3] = [40.0, 30.0, 20.0];
const TRUE_BACKGROUND: f64 = 5.0;

fn hkl(k: usize) -> MillerIndex {
    [[1, 0, 0], [0, 1, 0], [0, 0, 1]][k]
}

fn roi(k: usize) -> RegionOfInterest {
    RegionOfInterest::new(12 * k, 12 * k + 8, 0, 8).expect("valid roi")
}

fn simulator() -> GaussianSpotSimulator {
    let table = FhklTable::new((0..3).map(hkl).collect(), TRUE_AMPLITUDES.to_vec()).expect("valid table");
    GaussianSpotSimulator::new(table).with_spots((0..3).map(|k| (roi(k), hkl(k))))
}

/// Noise-free Bragg pixels of spot `k` at the initial geometry and unit
/// crystal scale.
fn bragg_pixels(k: usize) -> Array1<f64> {
    let mut sim = simulator();
    sim.initialize_managers().expect("initialize");
    sim.set_bmatrix(&CubicCell::new(CELL_A).b_matrix());
    sim.set_ncells(&[10.0]);
    sim.set_region_of_interest(&roi(k));
    sim.add_spots().expect("simulate");
    sim.raw_pixels_roi()
}

fn crystal() -> CrystalModel {
    CrystalModel::new(Matrix3::identity(), Box::new(CubicCell::new(CELL_A)))
}

/// Shot observing `spots` over a flat background of `TRUE_BACKGROUND`, with
/// background planes starting at offset `init_c`.
fn shot(spots: &[usize], init_c: f64) -> Shot {
    let spots = spots
        .iter()
        .map(|&k| {
            let observed = bragg_pixels(k) + TRUE_BACKGROUND;
            Spot::new(roi(k), 0, hkl(k), observed, BackgroundPlane::new(0.0, 0.0, init_c))
                .expect("valid spot")
        })
        .collect();
    Shot::new(spots, Spectrum::monochromatic(1.3).expect("valid spectrum"), crystal())
}

fn background_only() -> RefinerOptions {
    RefinerOptions {
        refine: RefineFlags { background: true, ..RefineFlags::none() },
        ..RefinerOptions::default()
    }
}

fn tight_solver() -> SolverOptions {
    SolverOptions::new(
        Tolerances::new(1e-7, None, Some(500)).expect("valid tolerances"),
        LineSearcher::MoreThuente,
        LineSearchParams::default(),
        None,
        None,
        10_000,
        false,
        false,
    )
    .expect("valid solver options")
}

/// Physical background offsets of every spot of `shot`.
fn offsets<S: Simulator, B: ReductionBackend>(refiner: &Refiner<S, B>, shot: ShotId) -> Vec<f64> {
    match &refiner.layout().shots[&shot].background {
        BackgroundSlots::Planes(planes) => planes.iter().map(|p| refiner.physical(p[2])).collect(),
        BackgroundSlots::Coefficient(slot) => vec![refiner.physical(*slot)],
    }
}

#[test]
// Purpose
// -------
// Per-shot mappings with mismatched key sets are rejected before any shot
// is built, and consistent mappings assemble into a usable refiner.
//
// Given
// -----
// - Crystals for shots {3, 8}; ROIs for shot 3 only.
// - The same inputs with ROIs for both shots.
//
// Expect
// ------
// - `ShotKeyMismatch` naming "rois" with shot 8 missing.
// - Assembled shots keep their ids and set up without error.
fn shot_inputs_check_keys_then_assemble() {
    // Arrange
    let build = |roi_ids: &[ShotId]| {
        let ids = [3, 8];
        ShotInputs {
            rois: roi_ids.iter().map(|&i| (i, vec![roi(0)])).collect(),
            images: ids.iter().map(|&i| (i, vec![bragg_pixels(0) + TRUE_BACKGROUND])).collect(),
            panels: ids.iter().map(|&i| (i, vec![0])).collect(),
            asu: ids.iter().map(|&i| (i, vec![hkl(0)])).collect(),
            background_inits: ids.iter().map(|&i| (i, vec![BackgroundPlane::new(0.0, 0.0, 4.0)])).collect(),
            spectra: ids.iter().map(|&i| (i, Spectrum::monochromatic(1.3).expect("spectrum"))).collect(),
            crystals: ids.iter().map(|&i| (i, crystal())).collect(),
            scale_inits: Some(ids.iter().map(|&i| (i, 1.0)).collect()),
            ..ShotInputs::default()
        }
    };

    // Act
    let rejected = build(&[3]).into_shots();
    let shots = build(&[3, 8]).into_shots().expect("consistent inputs");
    let ids: Vec<ShotId> = shots.keys().copied().collect();
    let refiner = Refiner::setup(RefinerInputs::new(shots, simulator(), background_only()), SingleProcess);

    // Assert
    match rejected {
        Err(RefineError::ShotKeyMismatch { field, missing, unexpected }) => {
            assert_eq!(field, "rois");
            assert_eq!(missing, vec![8]);
            assert!(unexpected.is_empty());
        }
        other => panic!("expected ShotKeyMismatch, got {other:?}"),
    }
    assert_eq!(ids, vec![3, 8]);
    assert!(refiner.is_ok());
}

#[test]
// Purpose
// -------
// The gradient-only backend recovers the background of noise-free data.
//
// Given
// -----
// - Two shots with two spots each, true offset 5, planes starting at 2.
// - Background planes refined, Poisson likelihood.
//
// Expect
// ------
// - Every offset within 1e-3 of 5; the functional decreased.
fn background_refinement_recovers_offsets() {
    // Arrange
    let shots: ShotMap = [(0, shot(&[0, 1], 2.0)), (1, shot(&[1, 2], 2.0))].into_iter().collect();
    let mut refiner =
        Refiner::setup(RefinerInputs::new(shots, simulator(), background_only()), SingleProcess).expect("setup");

    // Act
    let outcome = refiner.run_until_settled(&tight_solver(), 2).expect("refinement");

    // Assert
    assert!(!outcome.hit_restart);
    for shot in [0, 1] {
        for c in offsets(&refiner, shot) {
            assert!((c - TRUE_BACKGROUND).abs() < 1e-3, "shot {shot}: offset {c}");
        }
    }
    let f_vals = refiner.f_vals();
    assert!(f_vals.last() < f_vals.first());
}

#[test]
// Purpose
// -------
// With curvatures computed, a run of positive-curvature evaluations
// requests a restart and the refinement finishes on the curvature-aided
// backend.
//
// Given
// -----
// - Background-only refinement (additive maps, strictly positive
//   curvature), threshold of 2 evaluations.
//
// Expect
// ------
// - Curvature mode on after the settled run; offsets recovered to 1e-2.
fn curvature_restart_switches_backend() {
    // Arrange
    let options = RefinerOptions { calc_curvatures: true, use_curvatures_threshold: 2, ..background_only() };
    let shots: ShotMap = [(0, shot(&[0, 2], 3.0))].into_iter().collect();
    let mut refiner =
        Refiner::setup(RefinerInputs::new(shots, simulator(), options), SingleProcess).expect("setup");

    // Act
    refiner.run_until_settled(&tight_solver(), 3).expect("refinement");

    // Assert
    assert!(refiner.is_using_curvatures());
    assert!(refiner.curvatures().is_some_and(|c| c.iter().all(|v| *v >= 0.0)));
    for c in offsets(&refiner, 0) {
        assert!((c - TRUE_BACKGROUND).abs() < 1e-2, "offset {c}");
    }
}

#[test]
// Purpose
// -------
// Extracted-background mode scales a precomputed image by one coefficient
// per shot, and refinement recovers it.
//
// Given
// -----
// - Background estimate of 2.5 per pixel, true coefficient 2, start at 1.
//
// Expect
// ------
// - Coefficient within 1e-3 of 2.
fn extracted_background_coefficient_is_recovered() {
    // Arrange
    let estimate = |k: usize| Array1::from_elem(roi(k).n_pixels(), TRUE_BACKGROUND / 2.0);
    let mut source = shot(&[0, 1], 0.0);
    for (k, spot) in source.spots.iter_mut().enumerate() {
        spot.background_estimate = Some(estimate(k));
    }
    let shots: ShotMap = [(0, source)].into_iter().collect();
    let options = RefinerOptions { background_mode: BackgroundMode::Extracted, ..background_only() };
    let mut refiner =
        Refiner::setup(RefinerInputs::new(shots, simulator(), options), SingleProcess).expect("setup");

    // Act
    refiner.run_until_settled(&tight_solver(), 2).expect("refinement");

    // Assert
    assert_eq!(refiner.n(), 1);
    let coef = offsets(&refiner, 0)[0];
    assert!((coef - 2.0).abs() < 1e-3, "coefficient {coef}");
}

fn all_classes(noise: NoiseModel) -> RefinerOptions {
    RefinerOptions {
        refine: RefineFlags {
            background: true,
            rotation: true,
            unit_cell: true,
            ncells: true,
            origin_z: true,
            scale: true,
            fcell: true,
            spectra: true,
            panel_rotation: true,
            panel_xy: true,
            gain: true,
        },
        noise,
        ..RefinerOptions::default()
    }
}

fn gradient_agrees(noise: NoiseModel) {
    // Arrange
    let shots: ShotMap = [(0, shot(&[0, 1], 4.0)), (1, shot(&[1, 2], 4.5))].into_iter().collect();
    let mut refiner =
        Refiner::setup(RefinerInputs::new(shots, simulator(), all_classes(noise)), SingleProcess).expect("setup");
    let n = refiner.n();
    let moved = refiner.x() + &Array1::from_shape_fn(n, |i| 2e-3 * ((i % 5) as f64 - 2.0));
    refiner.set_x(&moved).expect("set_x");

    // Act
    let check = check_gradient(&mut refiner).expect("gradient check");

    // Assert
    assert!(
        check.agrees(1e-3, 1e-4),
        "max abs {:.3e}, max rel {:.3e}",
        check.max_abs_error,
        check.max_rel_error
    );
}

#[test]
// Purpose
// -------
// Poisson gradients with every class refined match finite differences.
//
// Given
// -----
// - Two shots, three structure factors, all classes refined, internal
//   values moved off their starting point.
//
// Expect
// ------
// - Agreement to 1e-3 relative or 1e-4 absolute.
fn poisson_gradient_matches_finite_differences() {
    gradient_agrees(NoiseModel::Poisson);
}

#[test]
// Purpose
// -------
// Gaussian gradients with every class refined match finite differences.
//
// Given
// -----
// - As the Poisson case, Gaussian likelihood with readout sigma 3.
//
// Expect
// ------
// - Agreement to 1e-3 relative or 1e-4 absolute.
fn gaussian_gradient_matches_finite_differences() {
    gradient_agrees(NoiseModel::gaussian());
}

/// What one worker of a group reports after its first evaluation.
struct WorkerReport {
    evaluation: Evaluation,
    xall: Array1<f64>,
    mask: Vec<bool>,
    n: usize,
    /// `Xall` slot of the amplitude both workers observe.
    shared_fcell_slot: usize,
}

/// Set up one refiner per member of a two-worker group, worker `r` owning
/// shot `r` with spots `[r, 2]`, and evaluate once on each.
fn evaluate_on_two_workers(options: &RefinerOptions) -> Vec<WorkerReport> {
    let members = LocalGroup::new_group(2).expect("group");
    thread::scope(|scope| {
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                let options = options.clone();
                scope.spawn(move || {
                    let rank = member.rank();
                    let shots: ShotMap = [(rank, shot(&[rank, 2], 4.0))].into_iter().collect();
                    let mut refiner = Refiner::setup(RefinerInputs::new(shots, simulator(), options), member)
                        .expect("setup");
                    let evaluation = refiner.compute_functional_and_gradients().expect("evaluation");
                    let dense = refiner.fcell_map().dense(&hkl(2)).expect("shared index");
                    WorkerReport {
                        evaluation,
                        xall: refiner.xall().clone(),
                        mask: refiner.refined_mask().to_vec(),
                        n: refiner.n(),
                        shared_fcell_slot: refiner.layout().global.fcell(dense),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("worker thread")).collect()
    })
}

#[test]
// Purpose
// -------
// Splitting shots across two workers gives the same layout, functional
// and gradient as one worker holding all shots.
//
// Given
// -----
// - Shots 0 and 1 observing spots {0, 2} and {1, 2}; worker r owns shot r.
// - Default refined classes plus structure factors.
//
// Expect
// ------
// - Both workers report identical results.
// - Functional and gradient agree with the single-process run to 1e-10
//   relative; `Xall` agrees exactly.
fn two_workers_match_single_process() {
    // Arrange
    let options = RefinerOptions {
        refine: RefineFlags { fcell: true, ..RefineFlags::default() },
        ..RefinerOptions::default()
    };
    let shots: ShotMap = [(0, shot(&[0, 2], 4.0)), (1, shot(&[1, 2], 4.0))].into_iter().collect();
    let mut single =
        Refiner::setup(RefinerInputs::new(shots, simulator(), options.clone()), SingleProcess).expect("setup");

    // Act
    let expected = single.compute_functional_and_gradients().expect("evaluation");
    let workers = evaluate_on_two_workers(&options);

    // Assert
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0].evaluation, workers[1].evaluation);
    for worker in &workers {
        assert_eq!(&worker.xall, single.xall());
        assert_eq!(worker.mask.as_slice(), single.refined_mask());
        assert_eq!(worker.n, single.n());
        assert_relative_eq!(worker.evaluation.f, expected.f, max_relative = 1e-10);
        for (a, b) in worker.evaluation.g.iter().zip(expected.g.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-10, max_relative = 1e-10);
        }
    }
}

#[test]
// Purpose
// -------
// Structure factors are gated on multiplicity summed over all workers.
//
// Given
// -----
// - min_multiplicity 2; spot 2 observed once on each worker, spots 0 and
//   1 once in total.
//
// Expect
// ------
// - Only the amplitude of hkl(2) is refined, on both workers.
fn multiplicity_gating_counts_all_workers() {
    // Arrange
    let options = RefinerOptions {
        refine: RefineFlags { fcell: true, ..RefineFlags::none() },
        min_multiplicity: 2,
        ..RefinerOptions::default()
    };

    // Act
    let workers = evaluate_on_two_workers(&options);

    // Assert
    for worker in &workers {
        assert_eq!(worker.n, 1);
        let refined: Vec<usize> =
            worker.mask.iter().enumerate().filter(|(_, m)| **m).map(|(i, _)| i).collect();
        assert_eq!(refined, vec![worker.shared_fcell_slot]);
        assert_eq!(worker.xall[worker.shared_fcell_slot], 1.0);
    }
    assert_eq!(workers[0].mask, workers[1].mask);
}
