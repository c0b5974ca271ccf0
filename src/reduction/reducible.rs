//! Values that can be summed across workers.
//!
//! Numbers and vectors add element-wise, flag vectors combine with logical
//! or, and count maps add per key. Members are always combined in rank
//! order, so floating-point sums are reproducible for a fixed group size.
use crate::reduction::errors::{ReductionError, ReductionResult};
use ndarray::Array1;
use std::collections::HashMap;
use std::hash::Hash;

pub trait Reducible: Clone + Send + 'static {
    /// Fold `other` into `self`.
    fn combine(&mut self, other: &Self) -> ReductionResult<()>;
}

impl Reducible for f64 {
    fn combine(&mut self, other: &Self) -> ReductionResult<()> {
        *self += other;
        Ok(())
    }
}

impl Reducible for u64 {
    fn combine(&mut self, other: &Self) -> ReductionResult<()> {
        *self += other;
        Ok(())
    }
}

impl Reducible for usize {
    fn combine(&mut self, other: &Self) -> ReductionResult<()> {
        *self += other;
        Ok(())
    }
}

fn check_len(expected: usize, found: usize) -> ReductionResult<()> {
    if expected != found {
        return Err(ReductionError::LengthMismatch { expected, found });
    }
    Ok(())
}

impl Reducible for Array1<f64> {
    fn combine(&mut self, other: &Self) -> ReductionResult<()> {
        check_len(self.len(), other.len())?;
        *self += other;
        Ok(())
    }
}

impl Reducible for Vec<f64> {
    fn combine(&mut self, other: &Self) -> ReductionResult<()> {
        check_len(self.len(), other.len())?;
        self.iter_mut().zip(other).for_each(|(a, b)| *a += b);
        Ok(())
    }
}

impl Reducible for Vec<usize> {
    fn combine(&mut self, other: &Self) -> ReductionResult<()> {
        check_len(self.len(), other.len())?;
        self.iter_mut().zip(other).for_each(|(a, b)| *a += b);
        Ok(())
    }
}

impl Reducible for Vec<bool> {
    fn combine(&mut self, other: &Self) -> ReductionResult<()> {
        check_len(self.len(), other.len())?;
        self.iter_mut().zip(other).for_each(|(a, b)| *a |= *b);
        Ok(())
    }
}

impl<K> Reducible for HashMap<K, u64>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn combine(&mut self, other: &Self) -> ReductionResult<()> {
        for (key, count) in other {
            *self.entry(key.clone()).or_insert(0) += count;
        }
        Ok(())
    }
}
