//! Functional, gradient and curvature accumulation for one evaluation.
//!
//! Every entry point adds the contribution of one spot (or one prior) to a
//! single flat index of `Xall`. Model derivative images are taken with
//! respect to the physical value and contracted with the spot's likelihood
//! weights after the chain factors of the parameter's map are applied:
//! `d = f1·dI`, `d2 = f1²·d2I + f2·dI`.
use crate::reduction::ReductionBackend;
use crate::refinement::{
    core::{noise::SpotStatistics, priors::PriorTerm},
    errors::RefineResult,
};
use ndarray::Array1;

#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub functional: f64,
    pub grad: Array1<f64>,
    pub curv: Option<Array1<f64>>,
}

impl Accumulator {
    pub fn new(n_total_params: usize, track_curvature: bool) -> Self {
        Self {
            functional: 0.0,
            grad: Array1::zeros(n_total_params),
            curv: track_curvature.then(|| Array1::zeros(n_total_params)),
        }
    }

    pub fn reset(&mut self) {
        self.functional = 0.0;
        self.grad.fill(0.0);
        if let Some(curv) = self.curv.as_mut() {
            curv.fill(0.0);
        }
    }

    pub fn tracks_curvature(&self) -> bool {
        self.curv.is_some()
    }

    pub fn add_functional(&mut self, value: f64) {
        self.functional += value;
    }

    /// Add a model derivative taken with respect to the physical value,
    /// mapped to the internal value through `factors = (f1, f2)`.
    ///
    /// `d2` may be omitted when the second derivative is zero or not tracked.
    pub fn add_chain(
        &mut self, index: usize, stats: &SpotStatistics, d: &Array1<f64>, d2: Option<&Array1<f64>>,
        factors: (f64, f64),
    ) {
        let (f1, f2) = factors;
        let d_chain = d * f1;
        self.grad[index] += stats.gradient(&d_chain);
        if let Some(curv) = self.curv.as_mut() {
            let d2_chain = match d2 {
                Some(d2) => d2 * (f1 * f1) + d * f2,
                None => d * f2,
            };
            curv[index] += stats.curvature(&d_chain, &d2_chain);
        }
    }

    /// Add a derivative already taken with respect to the optimizer value.
    pub fn add_direct(
        &mut self, index: usize, stats: &SpotStatistics, d: &Array1<f64>, d2: Option<&Array1<f64>>,
    ) {
        self.add_chain(index, stats, d, d2, (1.0, 0.0));
    }

    pub fn add_prior(&mut self, index: usize, term: PriorTerm) {
        self.functional += term.functional;
        self.grad[index] += term.gradient;
        if let Some(curv) = self.curv.as_mut() {
            curv[index] += term.curvature;
        }
    }

    /// Zero gradient and curvature at `indices`.
    pub fn freeze(&mut self, indices: &[usize]) {
        for &i in indices {
            self.grad[i] = 0.0;
            if let Some(curv) = self.curv.as_mut() {
                curv[i] = 0.0;
            }
        }
    }

    /// Zero gradient and curvature wherever `mask` is false.
    pub fn zero_unrefined(&mut self, mask: &[bool]) {
        let frozen: Vec<usize> = mask.iter().enumerate().filter(|(_, r)| !**r).map(|(i, _)| i).collect();
        self.freeze(&frozen);
    }

    /// Sum the accumulators of every worker.
    ///
    /// # Errors
    /// Reduction failures.
    pub fn reduce<B: ReductionBackend>(&mut self, backend: &B) -> RefineResult<()> {
        self.functional = backend.reduce_broadcast(self.functional)?;
        self.grad = backend.reduce_broadcast(std::mem::take(&mut self.grad))?;
        if let Some(curv) = self.curv.take() {
            self.curv = Some(backend.reduce_broadcast(curv)?);
        }
        Ok(())
    }
}
