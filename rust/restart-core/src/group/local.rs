// rust/restart-core/src/group/local.rs

//! In-process groups: one thread per rank.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::ProcessGroup;

struct Shared {
    size: usize,
    barrier: Mutex<BarrierState>,
    released: Condvar,
    // One contribution slot per rank for the current reduction.
    slots: Mutex<Vec<u64>>,
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    // First rank that unwound; its peers panic instead of waiting for it.
    poisoned_by: Option<usize>,
}

impl Shared {
    fn wait(&self) {
        let mut state = self.barrier.lock();
        if let Some(rank) = state.poisoned_by {
            drop(state);
            panic!("rank {rank} of the local group panicked");
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return;
        }

        while state.generation == generation && state.poisoned_by.is_none() {
            self.released.wait(&mut state);
        }
        let poisoned = (state.generation == generation)
            .then_some(state.poisoned_by)
            .flatten();
        drop(state);
        if let Some(rank) = poisoned {
            panic!("rank {rank} of the local group panicked");
        }
    }

    fn poison(&self, rank: usize) {
        self.barrier.lock().poisoned_by.get_or_insert(rank);
        self.released.notify_all();
    }

    fn poisoned_by(&self) -> Option<usize> {
        self.barrier.lock().poisoned_by
    }
}

/// Poisons the group if its rank unwinds.
struct PoisonOnPanic {
    shared: Arc<Shared>,
    rank: usize,
}

impl Drop for PoisonOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared.poison(self.rank);
        }
    }
}

/// A rank of a group whose members are threads of the current process.
///
/// Collective calls block on a shared barrier exactly like their MPI
/// counterparts, so a rank that skips a collective call hangs its peers.
/// A rank that panics inside [`LocalGroup::run`] poisons the barrier, and
/// every peer waiting on it panics in turn.
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates the handles of a `size`-rank group, ordered by rank.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Vec<LocalGroup> {
        assert!(size > 0, "a process group needs at least one rank");

        let shared = Arc::new(Shared {
            size,
            barrier: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            slots: Mutex::new(vec![0; size]),
        });

        (0..size)
            .map(|rank| LocalGroup {
                rank,
                size,
                shared: shared.clone(),
            })
            .collect()
    }

    /// Runs `f` once per rank on its own thread and returns the results in
    /// rank order. A panic on any rank is propagated to the caller; when
    /// one rank's panic brings down its peers, the first one is re-raised.
    pub fn run<F, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(LocalGroup) -> T + Sync,
        T: Send,
    {
        let groups = LocalGroup::new(size);
        let shared = groups[0].shared.clone();

        let f = &f;
        let mut outcomes: Vec<std::thread::Result<T>> = std::thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    let guard = PoisonOnPanic {
                        shared: group.shared.clone(),
                        rank: group.rank,
                    };
                    scope.spawn(move || {
                        let _guard = guard;
                        f(group)
                    })
                })
                .collect();

            handles.into_iter().map(|handle| handle.join()).collect()
        });

        if let Some(rank) = shared.poisoned_by() {
            if outcomes[rank].is_err() {
                if let Err(panic) = outcomes.swap_remove(rank) {
                    std::panic::resume_unwind(panic);
                }
            }
        }

        outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    }

    fn all_reduce(&self, value: u64, op: impl Fn(u64, u64) -> u64) -> u64 {
        self.shared.slots.lock()[self.rank] = value;
        self.shared.wait();

        let reduced = {
            let slots = self.shared.slots.lock();
            slots[1..].iter().fold(slots[0], |acc, &v| op(acc, v))
        };

        // Nobody may overwrite a slot before every rank has read them all.
        self.shared.wait();
        reduced
    }
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.shared.wait();
    }

    fn all_reduce_max(&self, value: u64) -> u64 {
        self.all_reduce(value, u64::max)
    }

    fn all_reduce_sum(&self, value: u64) -> u64 {
        self.all_reduce(value, u64::wrapping_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_assigns_ranks() {
        let groups = LocalGroup::new(3);
        let ranks: Vec<usize> = groups.iter().map(|g| g.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert!(groups.iter().all(|g| g.size() == 3));
    }

    #[test]
    fn test_run_returns_in_rank_order() {
        let ranks = LocalGroup::run(4, |group| group.rank());
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_reductions() {
        let results = LocalGroup::run(4, |group| {
            let value = group.rank() as u64 + 1;
            (group.all_reduce_max(value), group.all_reduce_sum(value))
        });

        assert!(results.iter().all(|&r| r == (4, 10)));
    }

    #[test]
    fn test_repeated_reductions_do_not_interfere() {
        let results = LocalGroup::run(3, |group| {
            (0..50u64)
                .map(|round| group.all_reduce_sum(round * (group.rank() as u64)))
                .collect::<Vec<_>>()
        });

        for per_rank in results {
            for (round, sum) in per_rank.into_iter().enumerate() {
                assert_eq!(sum, round as u64 * 3);
            }
        }
    }

    #[test]
    fn test_panicking_rank_releases_peers() {
        let outcome = std::panic::catch_unwind(|| {
            LocalGroup::run(3, |group| {
                if group.rank() == 1 {
                    panic!("rank one failed");
                }
                group.barrier();
                group.all_reduce_sum(1)
            })
        });

        let panic = outcome.unwrap_err();
        assert_eq!(panic.downcast_ref::<&str>(), Some(&"rank one failed"));
    }

    #[test]
    fn test_barrier_is_reusable() {
        let results = LocalGroup::run(4, |group| {
            for _ in 0..100 {
                group.barrier();
            }
            group.rank()
        });
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_single_rank_group() {
        let results = LocalGroup::run(1, |group| {
            group.barrier();
            group.all_reduce_max(9)
        });
        assert_eq!(results, vec![9]);
    }
}
