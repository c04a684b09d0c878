use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::Partition;

/// Number of partitions a new pool starts with.
pub(crate) const INITIAL_PARTITION_COUNT: usize = 2;

/// Fixed-length array of partition slots, indexed by stripe.
///
/// A table is never resized after it has been published. Growth builds a new table twice
/// as long and publishes it in place of the old one. The only mutation a published table
/// ever sees is an empty slot being filled, which the pool serializes via its busy flag.
pub(crate) struct PartitionTable<S> {
    // Length is always a power of two.
    slots: Box<[ArcSwapOption<Partition<S>>]>,
}

impl<S> PartitionTable<S> {
    /// Creates a table of the given length with every slot empty.
    pub(crate) fn empty(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());

        Self {
            slots: (0..len).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Maps a thread's stripe key to a slot index in this table.
    #[expect(
        clippy::arithmetic_side_effects,
        reason = "table is never empty, so len - 1 cannot underflow"
    )]
    pub(crate) fn stripe_index(&self, stripe_key: usize) -> usize {
        (self.slots.len() - 1) & stripe_key
    }

    /// The partition in the given slot, or `None` if the slot has not been filled yet.
    pub(crate) fn partition(&self, index: usize) -> Option<Arc<Partition<S>>> {
        self.slots.get(index).and_then(ArcSwapOption::load_full)
    }

    /// Fills an empty slot. Returns `false` (leaving the table untouched) if the slot was
    /// already filled or does not exist.
    ///
    /// Callers must hold the pool's busy flag.
    pub(crate) fn fill(&self, index: usize, partition: Arc<Partition<S>>) -> bool {
        let Some(slot) = self.slots.get(index) else {
            return false;
        };

        if slot.load().is_some() {
            return false;
        }

        slot.store(Some(partition));
        true
    }

    /// Builds a table twice as long, carrying over every existing partition to the same index
    /// and leaving all new slots empty.
    pub(crate) fn doubled(&self) -> Self {
        let new_len = self
            .slots
            .len()
            .checked_mul(2)
            .expect("partition ceiling keeps the table far below usize::MAX slots");

        let mut slots = Vec::with_capacity(new_len);

        slots.extend(
            self.slots
                .iter()
                .map(|slot| ArcSwapOption::new(slot.load_full())),
        );
        slots.resize_with(new_len, ArcSwapOption::empty);

        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Visits every filled slot, starting just after `start` and wrapping around,
    /// until `f` returns `Some`.
    #[expect(
        clippy::arithmetic_side_effects,
        reason = "table is never empty, so the modulo divisor is never zero"
    )]
    pub(crate) fn find_map_from<F, R>(&self, start: usize, mut f: F) -> Option<R>
    where
        F: FnMut(&Arc<Partition<S>>) -> Option<R>,
    {
        let len = self.slots.len();

        (1..len)
            .map(|offset| start.wrapping_add(offset) % len)
            .filter_map(|index| self.partition(index))
            .find_map(|partition| f(&partition))
    }

    /// Total idle sessions across all partitions. Racy under concurrent access.
    pub(crate) fn idle_len(&self) -> usize {
        self.slots
            .iter()
            .filter_map(ArcSwapOption::load_full)
            .map(|partition| partition.idle_len())
            .sum()
    }
}

impl<S> fmt::Debug for PartitionTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let filled = self.slots.iter().filter(|slot| slot.load().is_some()).count();

        f.debug_struct("PartitionTable")
            .field("len", &self.slots.len())
            .field("filled", &filled)
            .finish()
    }
}

/// Derives the maximum table length from a requested ceiling.
///
/// The result is the largest power of two not above `requested`, but never below
/// [`INITIAL_PARTITION_COUNT`], so that doubling can never overshoot it.
pub(crate) fn effective_ceiling(requested: usize) -> usize {
    let requested = requested.max(INITIAL_PARTITION_COUNT);

    1_usize
        .checked_shl(requested.ilog2())
        .expect("the base 2 logarithm of a usize is always a valid shift for a usize")
}
