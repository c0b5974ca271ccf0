//! Reduction backends: the collective sum-then-broadcast used by the refiner.
//!
//! - [`SingleProcess`]: one worker; every reduction is the identity.
//! - [`LocalGroup`]: several worker threads of one process. Each call
//!   blocks until every member has contributed, then every member receives
//!   the same rank-ordered sum.
use crate::reduction::{
    errors::{ReductionError, ReductionResult},
    reducible::Reducible,
};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub trait ReductionBackend {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// The member that owns logging and persisted state.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Sum `value` over all members and return the sum to every member.
    ///
    /// Every member must call this the same number of times with the same
    /// value type; calls are matched in program order.
    fn reduce_broadcast<T: Reducible>(&self, value: T) -> ReductionResult<T>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ReductionBackend for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn reduce_broadcast<T: Reducible>(&self, value: T) -> ReductionResult<T> {
        Ok(value)
    }
}

type Slot = Option<Box<dyn Any + Send>>;

#[derive(Default)]
struct GroupInner {
    slots: Vec<Slot>,
    arrived: usize,
    generation: u64,
    /// Members that still have to read the current result.
    remaining: usize,
    result: Slot,
}

struct GroupState {
    inner: Mutex<GroupInner>,
    condvar: Condvar,
}

/// One member of a thread-local reduction group.
#[derive(Clone)]
pub struct LocalGroup {
    group: Arc<GroupState>,
    rank: usize,
    size: usize,
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup").field("rank", &self.rank).field("size", &self.size).finish()
    }
}

impl LocalGroup {
    /// Create the `size` members of a new group, ordered by rank.
    ///
    /// # Errors
    /// [`ReductionError::EmptyGroup`] when `size == 0`.
    pub fn new_group(size: usize) -> ReductionResult<Vec<LocalGroup>> {
        if size == 0 {
            return Err(ReductionError::EmptyGroup);
        }
        let group = Arc::new(GroupState {
            inner: Mutex::new(GroupInner {
                slots: (0..size).map(|_| None).collect(),
                ..Default::default()
            }),
            condvar: Condvar::new(),
        });
        Ok((0..size).map(|rank| LocalGroup { group: Arc::clone(&group), rank, size }).collect())
    }

    fn lock(&self) -> ReductionResult<MutexGuard<'_, GroupInner>> {
        self.group.inner.lock().map_err(|_| ReductionError::Poisoned)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, GroupInner>) -> ReductionResult<MutexGuard<'a, GroupInner>> {
        self.group.condvar.wait(guard).map_err(|_| ReductionError::Poisoned)
    }
}

fn combine_slots<T: Reducible>(slots: &mut [Slot]) -> ReductionResult<T> {
    let mut values = slots.iter_mut().map(|slot| {
        slot.take().and_then(|b| b.downcast::<T>().ok()).ok_or(ReductionError::TypeMismatch)
    });
    let mut total = match values.next() {
        Some(first) => *first?,
        None => return Err(ReductionError::EmptyGroup),
    };
    for value in values {
        total.combine(&*value?)?;
    }
    Ok(total)
}

impl ReductionBackend for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reduce_broadcast<T: Reducible>(&self, value: T) -> ReductionResult<T> {
        let mut state = self.lock()?;
        // A previous result is still being read by slower members.
        while state.remaining > 0 {
            state = self.wait(state)?;
        }

        let generation = state.generation;
        state.slots[self.rank] = Some(Box::new(value));
        state.arrived += 1;
        if state.arrived == self.size {
            let combined: ReductionResult<T> = combine_slots(&mut state.slots);
            state.result = Some(Box::new(combined));
            state.arrived = 0;
            state.remaining = self.size;
            state.generation = state.generation.wrapping_add(1);
            self.group.condvar.notify_all();
        } else {
            while state.generation == generation {
                state = self.wait(state)?;
            }
        }

        let out = state
            .result
            .as_ref()
            .and_then(|r| r.downcast_ref::<ReductionResult<T>>())
            .cloned()
            .unwrap_or(Err(ReductionError::TypeMismatch));
        state.remaining -= 1;
        if state.remaining == 0 {
            state.result = None;
            self.group.condvar.notify_all();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};
    use std::thread;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // Identity reduction of a single process, and sums across a group of
    // threads over several consecutive collectives of different types.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // A single process returns its own value.
    //
    // Given
    // -----
    // - 2.5 and [1, 2].
    //
    // Expect
    // ------
    // - Same values back; rank 0 is root.
    fn single_process_is_identity() {
        // Arrange
        let backend = SingleProcess;

        // Act / Assert
        assert_eq!(backend.reduce_broadcast(2.5), Ok(2.5));
        assert_eq!(backend.reduce_broadcast(array![1.0, 2.0]), Ok(array![1.0, 2.0]));
        assert!(backend.is_root());
    }

    #[test]
    // Purpose
    // -------
    // Every member of a three-thread group receives the identical sum for
    // each of several back-to-back collectives.
    //
    // Given
    // -----
    // - Member r contributes r + 1 (f64), [r, 1] (array), flags with only
    //   position r set, for 20 rounds.
    //
    // Expect
    // ------
    // - 6.0, [3, 3] and [true, true, true] on every member and round.
    fn local_group_sums_across_threads() {
        // Arrange
        let members = LocalGroup::new_group(3).expect("non-empty group");

        // Act
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let r = member.rank();
                    let mut seen = Vec::new();
                    for _ in 0..20 {
                        let total = member.reduce_broadcast((r + 1) as f64).expect("sum");
                        let arr: Array1<f64> =
                            member.reduce_broadcast(array![r as f64, 1.0]).expect("array sum");
                        let mut flags = vec![false; 3];
                        flags[r] = true;
                        let flags = member.reduce_broadcast(flags).expect("flags");
                        seen.push((total, arr, flags));
                    }
                    seen
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().expect("thread")).collect();

        // Assert
        for seen in results {
            for (total, arr, flags) in seen {
                assert_eq!(total, 6.0);
                assert_eq!(arr, array![3.0, 3.0]);
                assert_eq!(flags, vec![true, true, true]);
            }
        }
    }

    #[test]
    // Purpose
    // -------
    // Groups cannot be empty.
    //
    // Given
    // -----
    // - size 0.
    //
    // Expect
    // ------
    // - `EmptyGroup`.
    fn empty_group_is_rejected() {
        // Arrange / Act / Assert
        assert!(matches!(LocalGroup::new_group(0), Err(ReductionError::EmptyGroup)));
    }

    #[test]
    // Purpose
    // -------
    // Contributions are summed in rank order from their boxed slots and a
    // slot holding another type is reported.
    //
    // Given
    // -----
    // - Slots holding 2, 3 and 4 as `u64`; then slots holding `u64` and `f64`.
    //
    // Expect
    // ------
    // - Sum 9 with every slot drained; `TypeMismatch` for the mixed slots.
    fn combine_slots_sums_in_rank_order() {
        // Arrange
        let mut slots: Vec<Slot> = vec![Some(Box::new(2_u64)), Some(Box::new(3_u64)), Some(Box::new(4_u64))];
        let mut mixed: Vec<Slot> = vec![Some(Box::new(1_u64)), Some(Box::new(1.0_f64))];

        // Act
        let total = combine_slots::<u64>(&mut slots);
        let mismatch = combine_slots::<u64>(&mut mixed);

        // Assert
        assert!(matches!(total, Ok(9)));
        assert!(slots.iter().all(Option::is_none));
        assert!(matches!(mismatch, Err(ReductionError::TypeMismatch)));
    }
}
