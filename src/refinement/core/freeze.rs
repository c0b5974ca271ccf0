//! Round-robin parameter freezing.
//!
//! When enabled, every `period`-th evaluation zeroes the gradient and
//! curvature of one parameter class, cycling through the refined classes
//! in a fixed order: origin Z, rotation, unit cell, structure factors,
//! mosaic size, crystal scale, background.
use crate::refinement::core::reparam::ParameterClass;

/// Cycle order of the freeze schedule.
pub const FREEZE_ORDER: [ParameterClass; 7] = [
    ParameterClass::OriginZ,
    ParameterClass::Rotation,
    ParameterClass::UnitCell,
    ParameterClass::Fcell,
    ParameterClass::Ncells,
    ParameterClass::Scale,
    ParameterClass::Background,
];

#[derive(Debug, Clone, PartialEq)]
pub struct FreezeSchedule {
    cycle: Vec<ParameterClass>,
    period: usize,
    next: usize,
}

impl FreezeSchedule {
    /// Schedule over the classes of [`FREEZE_ORDER`] accepted by `is_refined`.
    ///
    /// A zero `period` or an empty cycle yields a schedule that never freezes.
    pub fn new(period: usize, is_refined: impl Fn(ParameterClass) -> bool) -> Self {
        let cycle = FREEZE_ORDER.iter().copied().filter(|c| is_refined(*c)).collect();
        Self { cycle, period, next: 0 }
    }

    /// Class to freeze for the evaluation numbered `iteration`, if any.
    ///
    /// Advances the cycle on every evaluation where `iteration % period == 0`.
    pub fn select(&mut self, iteration: usize) -> Option<ParameterClass> {
        if self.cycle.is_empty() || self.period == 0 || iteration % self.period != 0 {
            return None;
        }
        let class = self.cycle[self.next];
        self.next = (self.next + 1) % self.cycle.len();
        Some(class)
    }

    pub fn cycle(&self) -> &[ParameterClass] {
        &self.cycle
    }
}
