//! Joint refinement of per-shot and global parameters against many shots.
//!
//! [`Refiner`] owns the shots of one worker, the simulator that models
//! them, the flat parameter vector `Xall` and the refined mask. It
//! implements [`RefinementTarget`]: each evaluation simulates every
//! selected spot, contracts model derivatives with the likelihood weights,
//! adds priors, applies freezes, sums across workers and assesses
//! curvature. [`Refiner::run`] drives one solver pass and
//! [`Refiner::run_until_settled`] repeats passes until no restart is
//! requested.
//!
//! Several workers each build a [`Refiner`] over disjoint shot sets with
//! members of the same reduction group; setup and every evaluation issue
//! the same sequence of collectives on all of them, so every worker holds
//! identical `Xall`, gradients and optimizer state.
use crate::optimization::{
    errors::OptResult,
    lbfgs::{
        api::minimize,
        control::{CurvatureController, CurvatureMode, StepStatus},
        traits::{Evaluation, RefineOutcome, RefinementTarget, SolverOptions},
        types::Theta,
    },
};
use crate::reduction::ReductionBackend;
use crate::refinement::{
    accumulator::Accumulator,
    collaborators::{MillerIndex, P1Symmetry, PanelGeometry, ParamId, Simulator, SymmetryExpander},
    core::{
        fcell::{FcellIndexMap, ResolutionSigmas, count_multiplicity, refinable_fcells},
        freeze::FreezeSchedule,
        layout::{BackgroundSlots, LayoutOffsets, LayoutShape, ParameterLayout, RefinedSubset, ShotSlots},
        noise::SpotStatistics,
        options::{BackgroundMode, RefinerOptions},
        priors::GaussianPrior,
        reparam::{NCELLS_OFFSET, ParameterClass, Reparam},
        shots::{ShotId, ShotMap, Spot},
        validation::validate_shots,
    },
    diagnostics::{IterationReport, SummaryStats, correction_misset, least_squares_scale, pearson, r_factor},
    errors::{RefineError, RefineResult},
    evaluator::{ShotValues, SpotModel, prepare_shot, push_structure_factors, read_structure_factors, simulate_spot},
    state::{RefinerState, StateArchive},
};
use nalgebra::Matrix3;
use ndarray::Array1;
use std::collections::HashMap;
use std::time::Duration;

/// Everything a worker needs to build a [`Refiner`].
///
/// - `fcell_map`: dense structure-factor map. When absent it is built from
///   the union of ASU indices observed by all workers.
/// - `resolution_bins`: bin of each dense structure factor, used with
///   `rescale_fcell_by_resolution`.
/// - `reference_amplitudes`: per dense index, for the R-factor diagnostic.
/// - `x_init`: full initial `Xall`, overriding the computed one.
pub struct RefinerInputs<S> {
    pub shots: ShotMap,
    pub simulator: S,
    pub symmetry: Box<dyn SymmetryExpander>,
    pub fcell_map: Option<FcellIndexMap>,
    pub resolution_bins: Option<Vec<usize>>,
    pub reference_amplitudes: Option<Vec<f64>>,
    pub x_init: Option<Array1<f64>>,
    pub options: RefinerOptions,
}

impl<S: Simulator> RefinerInputs<S> {
    pub fn new(shots: ShotMap, simulator: S, options: RefinerOptions) -> Self {
        Self {
            shots,
            simulator,
            symmetry: Box::new(P1Symmetry),
            fcell_map: None,
            resolution_bins: None,
            reference_amplitudes: None,
            x_init: None,
            options,
        }
    }

    pub fn with_symmetry(mut self, symmetry: Box<dyn SymmetryExpander>) -> Self {
        self.symmetry = symmetry;
        self
    }

    pub fn with_fcell_map(mut self, map: FcellIndexMap) -> Self {
        self.fcell_map = Some(map);
        self
    }

    pub fn with_resolution_bins(mut self, bins: Vec<usize>) -> Self {
        self.resolution_bins = Some(bins);
        self
    }

    pub fn with_reference_amplitudes(mut self, amplitudes: Vec<f64>) -> Self {
        self.reference_amplitudes = Some(amplitudes);
        self
    }

    pub fn with_x_init(mut self, x_init: Array1<f64>) -> Self {
        self.x_init = Some(x_init);
        self
    }
}

/// Physical values and chain factors of `Xall` slots.
#[derive(Clone, Copy)]
struct ParamView<'a> {
    reparams: &'a [Reparam],
    xall: &'a Array1<f64>,
}

impl ParamView<'_> {
    fn value(&self, slot: usize) -> f64 {
        self.reparams[slot].physical(self.xall[slot])
    }

    fn factors(&self, slot: usize) -> (f64, f64) {
        self.reparams[slot].factors(self.xall[slot])
    }
}

/// Counters of one pass over the shots.
#[derive(Debug, Default)]
struct PassTally {
    num_kludge: usize,
    correlations: Vec<f64>,
}

pub struct Refiner<S: Simulator, B: ReductionBackend> {
    sim: S,
    backend: B,
    symmetry: Box<dyn SymmetryExpander>,
    shots: ShotMap,
    options: RefinerOptions,
    layout: ParameterLayout,
    fcells: FcellIndexMap,
    reference_amplitudes: Option<Vec<f64>>,
    reparams: Vec<Reparam>,
    xall: Array1<f64>,
    mask: Vec<bool>,
    subset: RefinedSubset,
    x: Theta,
    refined_ids: Vec<ParamId>,
    controller: CurvatureController,
    freeze: Option<FreezeSchedule>,
    acc: Accumulator,
    unit_cell_priors: Option<Vec<GaussianPrior>>,
    rotation_priors: Option<[GaussianPrior; 3]>,
    archive: Option<StateArchive>,
    iterations: usize,
    f_vals: Vec<f64>,
    last_functional: Option<f64>,
    last_curvature: Option<Array1<f64>>,
    num_kludge: usize,
    num_fcell_kludge: usize,
}

impl<S: Simulator, B: ReductionBackend> std::fmt::Debug for Refiner<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refiner")
            .field("rank", &self.backend.rank())
            .field("n_shots", &self.shots.len())
            .field("n_total_params", &self.layout.n_total_params())
            .field("n_refined", &self.subset.len())
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl<S: Simulator, B: ReductionBackend> Refiner<S, B> {
    /// Validate the inputs, lay out `Xall` across all workers and prepare
    /// the simulator.
    ///
    /// Every member of `backend`'s group must call `setup` concurrently.
    ///
    /// # Errors
    /// Option, shot, layout, collaborator, reduction and restart-state
    /// errors; see [`RefineError`].
    pub fn setup(inputs: RefinerInputs<S>, backend: B) -> RefineResult<Self> {
        let RefinerInputs {
            shots,
            simulator: mut sim,
            symmetry,
            fcell_map,
            resolution_bins,
            reference_amplitudes,
            x_init,
            options,
        } = inputs;
        options.validate()?;

        let fcells = match fcell_map {
            Some(map) => map,
            None => {
                let mut seen: HashMap<MillerIndex, u64> = HashMap::new();
                for spot in shots.values().flat_map(|s| s.spots.iter()) {
                    *seen.entry(spot.asu).or_insert(0) += 1;
                }
                let mut asu: Vec<MillerIndex> = backend.reduce_broadcast(seen)?.into_keys().collect();
                asu.sort_unstable();
                FcellIndexMap::new(asu)?
            }
        };
        let n_unit_cell = validate_shots(&shots, &fcells, &options)?;
        let cell_names =
            shots.values().next().map(|s| s.crystal.cell.variable_names()).unwrap_or_default();
        let shape = LayoutShape {
            n_unit_cell,
            n_ncells: options.ncells_init.len(),
            n_fcell: fcells.len(),
            n_panel_groups: options.n_panel_groups(),
        };

        let mut local_counts = vec![0usize; backend.size()];
        local_counts[backend.rank()] = ParameterLayout::n_local_params(&shots, &shape, &options);
        let local_counts = backend.reduce_broadcast(local_counts)?;
        let offsets = LayoutOffsets::for_workers(
            &local_counts,
            backend.rank(),
            ParameterLayout::n_global_params(&shape, &options),
        );
        let layout = ParameterLayout::build(&shots, shape, &options, offsets, &cell_names)?;

        // Shared initial values come from the root's first shot.
        let is_root = backend.is_root();
        let first_shot = shots.values().next();
        let root_cell = match first_shot {
            Some(shot) if is_root => shot.crystal.cell.variables(),
            _ => vec![0.0; n_unit_cell],
        };
        let global_cell_init = backend.reduce_broadcast(root_cell)?;
        let root_origin_z = match first_shot {
            Some(shot) if is_root => shot.origin_z_init,
            _ => 0.0,
        };
        let global_origin_z_init = backend.reduce_broadcast(root_origin_z)?;

        let fcell_init = read_structure_factors(&sim, &fcells)?;
        let resolution = match &resolution_bins {
            Some(bins) => ResolutionSigmas::from_bins(&fcell_init, bins, options.rescale_fcell_by_resolution)?,
            None => ResolutionSigmas::uniform(fcells.len()),
        };

        let mut reparams = build_reparams(
            &layout,
            &shots,
            &options,
            &global_cell_init,
            global_origin_z_init,
            &fcell_init,
            &resolution,
        )?;
        let inits: Vec<f64> =
            reparams.iter().enumerate().map(|(i, r)| init_of(r, &layout, i, &options)).collect();
        if !options.rescale_params {
            unscale(&mut reparams, &layout);
        }

        // Local slots come from their owner, global slots from the root.
        let mut xall = Array1::zeros(layout.n_total_params());
        for (i, reparam) in reparams.iter().enumerate() {
            let owned = is_local_slot(&layout, i) || (is_root && is_global_slot(&layout, i));
            if owned {
                xall[i] = reparam.internal(inits[i]);
            }
        }
        let mut xall = backend.reduce_broadcast(xall)?;
        let restart = match (&x_init, &options.restart_file) {
            (Some(x), _) => Some(x.clone()),
            (None, Some(path)) => {
                let state = RefinerState::load(path)?;
                log::info!("restarting from {} (iteration {})", path.display(), state.iteration);
                Some(state.xall)
            }
            (None, None) => None,
        };
        if let Some(restart) = restart {
            if restart.len() != xall.len() {
                return Err(RefineError::RestartVectorLength { expected: xall.len(), found: restart.len() });
            }
            xall = restart;
        }

        let counts = backend.reduce_broadcast(count_multiplicity(&shots, &options))?;
        let fcell_refinable = refinable_fcells(&fcells, &counts, &options);
        let mask = backend.reduce_broadcast(build_mask(&layout, &options, &fcell_refinable))?;
        let subset = RefinedSubset::from_mask(&mask, options.only_pass_refined_x);
        let x = subset.gather(&xall);

        let refined_ids = refined_param_ids(&options, n_unit_cell);
        for &id in &refined_ids {
            sim.refine(id);
        }
        sim.initialize_managers()?;
        if !options.refine.spectra {
            sim.set_lambda_coefficients(options.spectra_init);
        }
        push_structure_factors(&mut sim, symmetry.as_ref(), &fcells, &fcell_init)?;

        let mode = if options.use_curvatures {
            CurvatureMode::UsingCurvatures
        } else {
            CurvatureMode::NotUsingCurvatures
        };
        let controller = CurvatureController::new(
            mode,
            options.use_curvatures_threshold,
            options.fix_params_with_negative_curvature,
        );
        let freeze = options.iteratively_freeze_parameters.then(|| {
            FreezeSchedule::new(options.number_of_frozen_iterations, |c| options.refine.is_refined(c))
        });
        let unit_cell_priors = if options.refine.unit_cell { options.priors.unit_cell.clone() } else { None };
        if let Some(priors) = &unit_cell_priors {
            if priors.len() != n_unit_cell {
                return Err(RefineError::InvalidOption {
                    name: "priors.unit_cell",
                    reason: "one prior per free unit-cell variable is required",
                });
            }
        }
        let rotation_priors =
            if options.refine.rotation { options.priors.rotation_priors()? } else { None };
        let archive = match (&options.output_dir, is_root) {
            (Some(dir), true) => Some(StateArchive::new(dir, options.trial_id)),
            _ => None,
        };
        let acc = Accumulator::new(layout.n_total_params(), options.calc_curvatures);

        if is_root {
            log::info!(
                "refiner ready: {} workers, {} parameters, {} refined, {} structure factors ({} refinable)",
                backend.size(),
                layout.n_total_params(),
                mask.iter().filter(|m| **m).count(),
                fcells.len(),
                fcell_refinable.iter().filter(|r| **r).count(),
            );
        }

        Ok(Self {
            sim,
            backend,
            symmetry,
            shots,
            options,
            layout,
            fcells,
            reference_amplitudes,
            reparams,
            xall,
            mask,
            subset,
            x,
            refined_ids,
            controller,
            freeze,
            acc,
            unit_cell_priors,
            rotation_priors,
            archive,
            iterations: 0,
            f_vals: Vec::new(),
            last_functional: None,
            last_curvature: None,
            num_kludge: 0,
            num_fcell_kludge: 0,
        })
    }

    /// One solver pass with the backend matching the curvature mode.
    ///
    /// A curvature restart request switches the refiner into curvature mode
    /// before returning; the caller re-invokes `run` when
    /// `outcome.hit_restart` is set.
    ///
    /// # Errors
    /// Solver and evaluation errors.
    pub fn run(&mut self, solver: &SolverOptions) -> OptResult<RefineOutcome> {
        let opts = solver.with_curvatures(self.controller.is_using_curvatures());
        let outcome = minimize(self, &opts)?;
        if outcome.restart_status() == Some(StepStatus::RequestCurvatureRestart) {
            if self.backend.is_root() {
                log::info!("switching to curvature-aided minimization");
            }
            self.controller.switch_to_curvatures();
        }
        Ok(outcome)
    }

    /// Repeat [`run`](Self::run) until a pass ends without a restart
    /// request or `max_restarts` restarts have been consumed.
    pub fn run_until_settled(&mut self, solver: &SolverOptions, max_restarts: usize) -> OptResult<RefineOutcome> {
        let mut outcome = self.run(solver)?;
        let mut restarts = 0;
        while outcome.hit_restart && restarts < max_restarts {
            restarts += 1;
            outcome = self.run(solver)?;
        }
        Ok(outcome)
    }

    // ---- Accessors ----

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn xall(&self) -> &Array1<f64> {
        &self.xall
    }

    pub fn refined_mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn describe(&self, index: usize) -> &str {
        self.layout.describe(index)
    }

    /// Physical value of slot `index`; remote slots read their internal value.
    pub fn physical(&self, index: usize) -> f64 {
        self.view().value(index)
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn f_vals(&self) -> &[f64] {
        &self.f_vals
    }

    pub fn num_kludge(&self) -> usize {
        self.num_kludge
    }

    pub fn num_fcell_kludge(&self) -> usize {
        self.num_fcell_kludge
    }

    /// Curvature diagonal over `Xall` from the latest evaluation.
    pub fn curvatures(&self) -> Option<&Array1<f64>> {
        self.last_curvature.as_ref()
    }

    pub fn is_using_curvatures(&self) -> bool {
        self.controller.is_using_curvatures()
    }

    pub fn fcell_map(&self) -> &FcellIndexMap {
        &self.fcells
    }

    /// Current amplitudes of every dense structure factor.
    pub fn structure_factors(&self) -> Vec<f64> {
        let view = self.view();
        (0..self.layout.global.n_fcell).map(|i| view.value(self.layout.global.fcell(i))).collect()
    }

    pub fn scale(&self, shot: ShotId) -> Option<f64> {
        self.layout.shots.get(&shot).map(|slots| self.view().value(slots.scale))
    }

    /// B matrix of `shot` at the current unit-cell values.
    ///
    /// # Errors
    /// Cell manager failures for an unusable cell.
    pub fn b_matrix(&mut self, shot: ShotId) -> RefineResult<Option<Matrix3<f64>>> {
        let Some(slots) = self.layout.shots.get(&shot) else {
            return Ok(None);
        };
        let view = ParamView { reparams: &self.reparams, xall: &self.xall };
        let values: Vec<f64> = slots.unit_cell.iter().map(|&s| view.value(s)).collect();
        let Some(shot) = self.shots.get_mut(&shot) else {
            return Ok(None);
        };
        shot.crystal.cell.set_variables(&values)?;
        Ok(Some(shot.crystal.cell.b_matrix()))
    }

    /// Misset rotation of `shot` from its refined angles.
    pub fn misset(&self, shot: ShotId) -> Option<Matrix3<f64>> {
        let slots = self.layout.shots.get(&shot)?;
        let view = self.view();
        Some(correction_misset(slots.rotation.map(|s| view.value(s))))
    }

    pub fn simulator(&self) -> &S {
        &self.sim
    }

    fn view(&self) -> ParamView<'_> {
        ParamView { reparams: &self.reparams, xall: &self.xall }
    }

    // ---- Evaluation ----

    fn evaluate(&mut self) -> RefineResult<Evaluation> {
        self.acc.reset();
        let gain = self.xall[self.layout.global.gain];

        let fcell_clamps = self.update_structure_factors()?;
        if self.options.refine.spectra {
            let coefficients = self.layout.global.spectra.map(|s| self.physical(s));
            self.sim.set_lambda_coefficients(coefficients);
        }

        let tally = self.accumulate_shots(gain)?;

        if let Some(schedule) = self.freeze.as_mut() {
            if let Some(class) = schedule.select(self.iterations) {
                log::debug!("freezing {class} for evaluation {}", self.iterations);
                let indices = self.layout.indices_of(class);
                self.acc.freeze(&indices);
            }
        }
        self.acc.zero_unrefined(&self.mask);
        self.acc.reduce(&self.backend)?;
        let kludges = self.backend.reduce_broadcast(tally.num_kludge)?;
        let fcell_clamps =
            self.backend.reduce_broadcast(if self.backend.is_root() { fcell_clamps } else { 0 })?;
        self.num_kludge += kludges;
        self.num_fcell_kludge += fcell_clamps;
        if kludges > 0 && self.backend.is_root() {
            log::warn!("{kludges} spots had non-positive expected counts and were floored");
        }

        let f = self.acc.functional;
        let g = self.subset.gather(&self.acc.grad);
        let curv_x = self.acc.curv.as_ref().map(|c| self.subset.gather(c));
        self.last_curvature = self.acc.curv.clone();
        let decision = self.controller.assess(curv_x);
        if decision.status == StepStatus::RequestParameterFreezeRestart {
            self.freeze_negative_curvature(&decision.negative);
        }

        self.sim.zero_raw_pixels();
        if self.options.verbose && self.backend.is_root() {
            self.report(f, &g, &tally).log();
        }
        self.f_vals.push(f);
        if let Some(archive) = &self.archive {
            archive.save(&RefinerState {
                trial: self.options.trial_id,
                iteration: self.iterations,
                f_vals: self.f_vals.clone(),
                xall: self.xall.clone(),
            })?;
        }
        self.iterations += 1;
        self.last_functional = Some(f);
        if let Some(pause) = self.options.pause_after_iteration {
            std::thread::sleep(Duration::from_secs_f64(pause));
        }

        Ok(Evaluation { f, g, d: decision.diag, status: decision.status })
    }

    /// Push current amplitudes to the simulator, clamping negative linear
    /// amplitudes at zero. Returns the number of clamps.
    fn update_structure_factors(&mut self) -> RefineResult<usize> {
        if !self.options.refine.fcell {
            return Ok(0);
        }
        let mut clamps = 0;
        let mut amplitudes = Vec::with_capacity(self.layout.global.n_fcell);
        for i in 0..self.layout.global.n_fcell {
            let slot = self.layout.global.fcell(i);
            let reparam = self.reparams[slot];
            let mut amplitude = reparam.physical(self.xall[slot]);
            if amplitude < 0.0 {
                amplitude = 0.0;
                self.xall[slot] = reparam.internal(0.0);
                clamps += 1;
            }
            amplitudes.push(amplitude);
        }
        push_structure_factors(&mut self.sim, self.symmetry.as_ref(), &self.fcells, &amplitudes)?;
        Ok(clamps)
    }

    fn accumulate_shots(&mut self, gain: f64) -> RefineResult<PassTally> {
        let Self {
            sim,
            shots,
            options,
            layout,
            fcells,
            reparams,
            xall,
            mask,
            refined_ids,
            acc,
            unit_cell_priors,
            rotation_priors,
            ..
        } = self;
        let options: &RefinerOptions = options;
        let layout: &ParameterLayout = layout;
        let fcells: &FcellIndexMap = fcells;
        let mask: &[bool] = mask;
        let refined_ids: &[ParamId] = refined_ids;
        let view = ParamView { reparams: reparams.as_slice(), xall: &*xall };
        let track = acc.tracks_curvature();
        let assembly = options.lambda_assembly;
        let mut tally = PassTally::default();

        for (&shot_id, shot) in shots.iter_mut() {
            if options.is_bad_shot(shot_id) {
                continue;
            }
            let Some(slots) = layout.shots.get(&shot_id) else {
                continue;
            };
            let values = ShotValues {
                rotation: slots.rotation.map(|s| view.value(s)),
                unit_cell: slots.unit_cell.iter().map(|&s| view.value(s)).collect(),
                ncells: slots.ncells.iter().map(|&s| view.value(s)).collect(),
            };
            prepare_shot(sim, shot, &values, track)?;
            let scale = view.value(slots.scale);
            let origin_z = view.value(slots.origin_z);
            let sg = scale * assembly.bragg_factor(gain);
            let bf = assembly.background_factor(gain);

            for (i_spot, spot) in shot.spots.iter().enumerate() {
                if !spot.selected {
                    continue;
                }
                let group = options.panel_group(spot.panel);
                let rot_slot = layout.global.panel_rotation[group];
                let [px_slot, py_slot] = layout.global.panel_xy[group];
                let geometry = PanelGeometry {
                    panel: spot.panel,
                    origin_shift: [view.value(px_slot), view.value(py_slot), origin_z],
                    rotation: view.value(rot_slot),
                };
                let model = simulate_spot(sim, spot, &geometry, refined_ids, track)?;

                let background = SpotBackground::new(
                    spot,
                    (shot_id, i_spot),
                    &slots.background,
                    options.background_mode,
                    &view,
                )?;
                let bragg = &model.raw * scale;
                let lambda = assembly.lambda(gain, &background.tilt, &bragg);
                let stats = options.noise.evaluate(&lambda, &spot.observed);
                acc.add_functional(stats.functional);
                if stats.kludged {
                    tally.num_kludge += 1;
                    log::debug!("shot {shot_id} spot {i_spot}: expected counts floored");
                }
                if options.verbose {
                    if let (Some(obs), Some(lam)) = (spot.observed.as_slice(), lambda.as_slice()) {
                        if let Some(c) = pearson(obs, lam) {
                            tally.correlations.push(c);
                        }
                    }
                }

                // Background
                for (slot, basis) in background.derivatives(spot, options.background_mode) {
                    if mask[slot] {
                        acc.add_chain(slot, &stats, &(basis * bf), None, view.factors(slot));
                    }
                }

                // Crystal
                let chain = ModelChain { stats: &stats, model: &model, sg, mask, view };
                for (axis, &slot) in slots.rotation.iter().enumerate() {
                    chain.add(acc, slot, ParamId::rotation(axis));
                }
                for (i, &slot) in slots.unit_cell.iter().enumerate() {
                    chain.add(acc, slot, ParamId::UnitCell(i));
                }
                for (i, &slot) in slots.ncells.iter().enumerate() {
                    chain.add(acc, slot, ParamId::Ncells(i));
                }
                chain.add(acc, slots.origin_z, ParamId::OriginZ);
                if mask[slots.scale] {
                    let d = &model.raw * assembly.bragg_factor(gain);
                    acc.add_chain(slots.scale, &stats, &d, None, view.factors(slots.scale));
                }

                // Global
                chain.add(acc, layout.global.fcell(fcells.dense(&spot.asu)?), ParamId::Fcell);
                chain.add(acc, layout.global.spectra[0], ParamId::Lambda0);
                chain.add(acc, layout.global.spectra[1], ParamId::Lambda1);
                chain.add(acc, rot_slot, ParamId::PanelRot);
                chain.add(acc, px_slot, ParamId::PanelX);
                chain.add(acc, py_slot, ParamId::PanelY);
                let gain_slot = layout.global.gain;
                if mask[gain_slot] {
                    let (d, d2) = assembly.gain_derivatives(gain, &background.tilt, &bragg);
                    acc.add_direct(gain_slot, &stats, &d, Some(&d2));
                }
            }

            let priors =
                PriorSet { unit_cell: unit_cell_priors.as_deref(), rotation: rotation_priors.as_ref() };
            add_priors(acc, &view, slots, priors);
        }
        Ok(tally)
    }

    fn freeze_negative_curvature(&mut self, negative_x: &[usize]) {
        for &i_x in negative_x {
            if let Some(&i_all) = self.subset.x2xall().get(i_x) {
                log::warn!("freezing {} (slot {i_all}) after negative curvature", self.layout.describe(i_all));
                self.mask[i_all] = false;
            }
        }
        self.subset = RefinedSubset::from_mask(&self.mask, self.options.only_pass_refined_x);
        self.x = self.subset.gather(&self.xall);
    }

    fn report(&self, f: f64, g: &Array1<f64>, tally: &PassTally) -> IterationReport {
        let scales: Vec<f64> = self.layout.shots.keys().filter_map(|&id| self.scale(id)).collect();
        let r_factor = self.reference_amplitudes.as_ref().and_then(|reference| {
            let refined = self.structure_factors();
            let k = least_squares_scale(&refined, reference).unwrap_or(1.0);
            r_factor(&refined, reference, k)
        });
        let overlay_correlation = (!tally.correlations.is_empty())
            .then(|| tally.correlations.iter().sum::<f64>() / tally.correlations.len() as f64);
        IterationReport {
            iteration: self.iterations,
            functional: f,
            grad_norm: g.dot(g).sqrt(),
            num_kludge: self.num_kludge,
            num_fcell_kludge: self.num_fcell_kludge,
            overlay_correlation,
            scales: SummaryStats::from_values(&scales),
            r_factor,
            using_curvatures: self.controller.is_using_curvatures(),
        }
    }
}

impl<S: Simulator, B: ReductionBackend> RefinementTarget for Refiner<S, B> {
    fn n(&self) -> usize {
        self.subset.len()
    }

    fn x(&self) -> &Theta {
        &self.x
    }

    fn set_x(&mut self, x: &Theta) -> OptResult<()> {
        if x.len() != self.subset.len() {
            return Err(RefineError::OptimizerVectorLength { expected: self.subset.len(), found: x.len() }.into());
        }
        self.x.assign(x);
        self.subset.scatter(x, &mut self.xall);
        Ok(())
    }

    fn compute_functional_and_gradients(&mut self) -> OptResult<Evaluation> {
        Ok(self.evaluate()?)
    }

    fn calls(&self) -> usize {
        self.iterations
    }

    fn functional(&self) -> Option<f64> {
        self.last_functional
    }

    fn compute_functional_gradients_diag(&mut self) -> OptResult<Evaluation> {
        Ok(self.evaluate()?)
    }
}

// ---- Per-spot helpers ----

/// Background tilt of one spot and the slots it depends on.
struct SpotBackground {
    tilt: Array1<f64>,
    /// Plane slots `[a, b, c]`, or the coefficient slot.
    slots: BackgroundSlotsOf,
    /// Tilt per unit coefficient in extracted mode, correction applied.
    unit: Option<Array1<f64>>,
}

enum BackgroundSlotsOf {
    Plane([usize; 3]),
    Coefficient(usize),
}

impl SpotBackground {
    fn new(
        spot: &Spot, (shot, i_spot): (ShotId, usize), slots: &BackgroundSlots, mode: BackgroundMode,
        view: &ParamView<'_>,
    ) -> RefineResult<Self> {
        let correct = |image: Array1<f64>| match &spot.pixel_correction {
            Some(c) => image * c,
            None => image,
        };
        match slots {
            BackgroundSlots::Planes(planes) => {
                let plane = planes.get(i_spot).copied().ok_or(RefineError::LayoutOverflow {
                    needed: i_spot + 1,
                    available: planes.len(),
                })?;
                let [a, b, c] = plane.map(|s| view.value(s));
                let tilt = match mode {
                    BackgroundMode::OffsetOnly => Array1::from_elem(spot.n_pixels(), c),
                    _ => &spot.xrel * a + &spot.yrel * b + c,
                };
                Ok(Self { tilt: correct(tilt), slots: BackgroundSlotsOf::Plane(plane), unit: None })
            }
            BackgroundSlots::Coefficient(slot) => {
                let estimate = spot.background_estimate.clone().ok_or(RefineError::MissingShotInput {
                    shot,
                    field: "background_estimates",
                })?;
                let unit = correct(estimate);
                let tilt = &unit * view.value(*slot);
                Ok(Self { tilt, slots: BackgroundSlotsOf::Coefficient(*slot), unit: Some(unit) })
            }
        }
    }

    /// `(slot, ∂tilt/∂θ)` for every background parameter of the spot.
    fn derivatives(&self, spot: &Spot, mode: BackgroundMode) -> Vec<(usize, Array1<f64>)> {
        let correct = |image: Array1<f64>| match &spot.pixel_correction {
            Some(c) => image * c,
            None => image,
        };
        match (&self.slots, &self.unit) {
            (BackgroundSlotsOf::Plane([sa, sb, sc]), _) => {
                let offset = (*sc, correct(Array1::ones(spot.n_pixels())));
                match mode {
                    BackgroundMode::OffsetOnly => vec![offset],
                    _ => vec![(*sa, correct(spot.xrel.clone())), (*sb, correct(spot.yrel.clone())), offset],
                }
            }
            (BackgroundSlotsOf::Coefficient(slot), Some(unit)) => vec![(*slot, unit.clone())],
            (BackgroundSlotsOf::Coefficient(_), None) => Vec::new(),
        }
    }
}

/// Chain rule for model derivative images scaled by `scale·G²`.
struct ModelChain<'a> {
    stats: &'a SpotStatistics,
    model: &'a SpotModel,
    sg: f64,
    mask: &'a [bool],
    view: ParamView<'a>,
}

impl ModelChain<'_> {
    fn add(&self, acc: &mut Accumulator, slot: usize, id: ParamId) {
        if !self.mask[slot] {
            return;
        }
        let Some(d) = self.model.first(id) else {
            return;
        };
        let d = d * self.sg;
        let d2 = self.model.second(id).map(|d2| d2 * self.sg);
        acc.add_chain(slot, self.stats, &d, d2.as_ref(), self.view.factors(slot));
    }
}

struct PriorSet<'a> {
    unit_cell: Option<&'a [GaussianPrior]>,
    rotation: Option<&'a [GaussianPrior; 3]>,
}

fn add_priors(
    acc: &mut Accumulator, view: &ParamView<'_>, slots: &ShotSlots,
    priors: PriorSet<'_>,
) {
    if let Some(cell) = priors.unit_cell {
        for (prior, &slot) in cell.iter().zip(&slots.unit_cell) {
            let (f1, f2) = view.factors(slot);
            acc.add_prior(slot, prior.term(view.value(slot), f1, f2));
        }
    }
    if let Some(rotation) = priors.rotation {
        for (prior, &slot) in rotation.iter().zip(&slots.rotation) {
            let (f1, f2) = view.factors(slot);
            acc.add_prior(slot, prior.term(view.value(slot), f1, f2));
        }
    }
}

// ---- Setup helpers ----

fn is_local_slot(layout: &ParameterLayout, index: usize) -> bool {
    let start = layout.offsets.local_idx_start;
    index >= start && index < start + layout.n_local()
}

fn is_global_slot(layout: &ParameterLayout, index: usize) -> bool {
    index >= layout.offsets.global_param_idx_start
}

/// Physical initial value carried by a rescaled map; the gain slot takes
/// `gain_init` and remote slots have none.
fn init_of(reparam: &Reparam, layout: &ParameterLayout, index: usize, options: &RefinerOptions) -> f64 {
    match *reparam {
        Reparam::Additive { init, .. }
        | Reparam::Log { init, .. }
        | Reparam::LogOffset { init, .. }
        | Reparam::BoundedSin { init, .. } => init,
        Reparam::Identity if index == layout.global.gain => options.gain_init,
        Reparam::Identity | Reparam::Exp { .. } => f64::NAN,
    }
}

/// Rescaled maps for every slot this worker knows; remote slots stay
/// `Identity`.
#[allow(clippy::too_many_arguments)]
fn build_reparams(
    layout: &ParameterLayout, shots: &ShotMap, options: &RefinerOptions, cell_init: &[f64],
    origin_z_init: f64, fcell_init: &[f64], resolution: &ResolutionSigmas,
) -> RefineResult<Vec<Reparam>> {
    let mut reparams = vec![Reparam::Identity; layout.n_total_params()];
    let sig = &options.sigmas;
    let mut assign = |slot: usize, reparam: Reparam, class: ParameterClass| -> RefineResult<()> {
        reparam.validate(class)?;
        reparams[slot] = reparam;
        Ok(())
    };
    let additive = |sigma: f64, init: f64| Reparam::Additive { sigma, init };
    let logarithmic = |sigma: f64, init: f64| Reparam::Log { sigma, init };

    for (shot_id, shot) in shots {
        let Some(slots) = layout.shots.get(shot_id) else {
            continue;
        };
        match &slots.background {
            BackgroundSlots::Planes(planes) => {
                for (spot, plane) in shot.spots.iter().zip(planes) {
                    let init = [spot.background_init.a, spot.background_init.b, spot.background_init.c];
                    for (k, ((&slot, &sigma), init)) in plane.iter().zip(&sig.background).zip(init).enumerate() {
                        let reparam = if k == 2 && options.bg_offset_positive {
                            logarithmic(sigma, init)
                        } else {
                            additive(sigma, init)
                        };
                        assign(slot, reparam, ParameterClass::Background)?;
                    }
                }
            }
            BackgroundSlots::Coefficient(slot) => {
                assign(*slot, logarithmic(sig.background_coef, shot.background_coef_init), ParameterClass::BackgroundCoefficient)?;
            }
        }
        for (k, &slot) in slots.rotation.iter().enumerate() {
            assign(slot, additive(sig.rotation[k], 0.0), ParameterClass::Rotation)?;
        }
        if !options.global.unit_cell {
            for (&slot, init) in slots.unit_cell.iter().zip(shot.crystal.cell.variables()) {
                assign(slot, additive(sig.unit_cell, init), ParameterClass::UnitCell)?;
            }
        }
        if !options.global.ncells {
            for (&slot, &init) in slots.ncells.iter().zip(&options.ncells_init) {
                let reparam = Reparam::LogOffset { sigma: sig.ncells, init, offset: NCELLS_OFFSET };
                assign(slot, reparam, ParameterClass::Ncells)?;
            }
        }
        if !options.global.origin_z {
            assign(slots.origin_z, origin_z_reparam(options, shot.origin_z_init), ParameterClass::OriginZ)?;
        }
        assign(slots.scale, logarithmic(sig.scale, shot.scale_init), ParameterClass::Scale)?;
    }

    let global = &layout.global;
    if let Some(cell_slots) = &global.unit_cell {
        for (&slot, &init) in cell_slots.iter().zip(cell_init) {
            assign(slot, additive(sig.unit_cell, init), ParameterClass::UnitCell)?;
        }
    }
    if let Some(ncells_slots) = &global.ncells {
        for (&slot, &init) in ncells_slots.iter().zip(&options.ncells_init) {
            let reparam = Reparam::LogOffset { sigma: sig.ncells, init, offset: NCELLS_OFFSET };
            assign(slot, reparam, ParameterClass::Ncells)?;
        }
    }
    if let Some(slot) = global.origin_z {
        assign(slot, origin_z_reparam(options, origin_z_init), ParameterClass::OriginZ)?;
    }
    for (i, &init) in fcell_init.iter().enumerate() {
        let sigma = resolution.sigma(i) * sig.fcell_scale;
        let reparam = if options.log_fcells { logarithmic(sigma, init) } else { additive(sigma, init) };
        assign(global.fcell(i), reparam, ParameterClass::Fcell)?;
    }
    for (k, &slot) in global.spectra.iter().enumerate() {
        let (low, high) = options.ranges.spectra[k];
        let reparam = Reparam::BoundedSin { sigma: sig.spectra[k], init: options.spectra_init[k], low, high };
        assign(slot, reparam, ParameterClass::Spectra)?;
    }
    for &slot in &global.panel_rotation {
        assign(slot, additive(sig.panel_rotation, 0.0), ParameterClass::PanelRotation)?;
    }
    for pair in &global.panel_xy {
        for &slot in pair {
            assign(slot, additive(sig.panel_xy, 0.0), ParameterClass::PanelXY)?;
        }
    }
    assign(global.gain, Reparam::Identity, ParameterClass::Gain)?;
    Ok(reparams)
}

fn origin_z_reparam(options: &RefinerOptions, init: f64) -> Reparam {
    match options.ranges.origin_z {
        Some((low, high)) => Reparam::BoundedSin { sigma: options.sigmas.origin_z, init, low, high },
        None => Reparam::Additive { sigma: options.sigmas.origin_z, init },
    }
}

/// Replace rescaled maps by their unscaled counterparts: additive classes
/// become `Identity`, log classes `Exp` with the same offset.
fn unscale(reparams: &mut [Reparam], layout: &ParameterLayout) {
    for (i, reparam) in reparams.iter_mut().enumerate() {
        if i == layout.global.gain {
            continue;
        }
        *reparam = match *reparam {
            Reparam::Additive { .. } => Reparam::Identity,
            Reparam::Log { .. } => Reparam::Exp { offset: 0.0 },
            Reparam::LogOffset { offset, .. } => Reparam::Exp { offset },
            other => other,
        };
    }
}

fn build_mask(layout: &ParameterLayout, options: &RefinerOptions, fcell_refinable: &[bool]) -> Vec<bool> {
    let r = &options.refine;
    let mut mask = vec![false; layout.n_total_params()];
    let mut set = |slot: usize, on: bool| {
        if on {
            mask[slot] = true;
        }
    };
    for slots in layout.shots.values() {
        match &slots.background {
            BackgroundSlots::Planes(planes) => {
                for [a, b, c] in planes {
                    let planar = options.background_mode != BackgroundMode::OffsetOnly;
                    set(*a, r.background && planar);
                    set(*b, r.background && planar);
                    set(*c, r.background);
                }
            }
            BackgroundSlots::Coefficient(slot) => set(*slot, r.background),
        }
        slots.rotation.iter().for_each(|&s| set(s, r.rotation));
        slots.unit_cell.iter().for_each(|&s| set(s, r.unit_cell));
        slots.ncells.iter().for_each(|&s| set(s, r.ncells));
        set(slots.origin_z, r.origin_z);
        set(slots.scale, r.scale);
    }
    let global = &layout.global;
    for (i, &refinable) in fcell_refinable.iter().enumerate() {
        set(global.fcell(i), r.fcell && refinable);
    }
    global.spectra.iter().for_each(|&s| set(s, r.spectra));
    global.panel_rotation.iter().for_each(|&s| set(s, r.panel_rotation));
    global.panel_xy.iter().flatten().for_each(|&s| set(s, r.panel_xy));
    set(global.gain, r.gain);
    mask
}

fn refined_param_ids(options: &RefinerOptions, n_unit_cell: usize) -> Vec<ParamId> {
    let r = &options.refine;
    let mut ids = Vec::new();
    if r.rotation {
        ids.extend([ParamId::RotX, ParamId::RotY, ParamId::RotZ]);
    }
    if r.unit_cell {
        ids.extend((0..n_unit_cell).map(ParamId::UnitCell));
    }
    if r.ncells {
        ids.extend((0..options.ncells_init.len()).map(ParamId::Ncells));
    }
    if r.origin_z {
        ids.push(ParamId::OriginZ);
    }
    if r.fcell {
        ids.push(ParamId::Fcell);
    }
    if r.spectra {
        ids.extend([ParamId::Lambda0, ParamId::Lambda1]);
    }
    if r.panel_rotation {
        ids.push(ParamId::PanelRot);
    }
    if r.panel_xy {
        ids.extend([ParamId::PanelX, ParamId::PanelY]);
    }
    ids
}
