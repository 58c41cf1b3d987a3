//! Dynamic occurrence counters.
//!
//! Per-unit counters give every thread its own cache line. A slot is only
//! ever written by the thread that owns it, so a relaxed load followed by a
//! relaxed store is enough and the hot path takes no lock and no read-modify-write.
//! The shared variant uses one counter updated with `fetch_add`.

use crate::error::FaultError;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterLayout {
    /// One slot per thread, written by its owner only.
    PerUnit,
    /// A single slot shared by every thread.
    Shared,
}

#[derive(Debug)]
pub struct OccurrenceCounters {
    layout: CounterLayout,
    slots: Box<[CachePadded<AtomicU64>]>,
    /// Highest unit seen so far, plus one.
    active: AtomicUsize,
}

impl OccurrenceCounters {
    /// Creates zeroed counters for `capacity` units.
    pub fn new(layout: CounterLayout, capacity: usize) -> Self {
        let slots = match layout {
            CounterLayout::PerUnit => capacity.max(1),
            CounterLayout::Shared => 1,
        };
        Self {
            layout,
            slots: (0..slots)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            active: AtomicUsize::new(0),
        }
    }

    pub fn layout(&self) -> CounterLayout {
        self.layout
    }

    #[inline]
    fn slot(&self, unit: usize) -> Result<&AtomicU64, FaultError> {
        let index = match self.layout {
            CounterLayout::PerUnit => unit,
            CounterLayout::Shared => 0,
        };
        let slot = self.slots.get(index).ok_or(FaultError::UnitOutOfRange {
            unit,
            capacity: self.slots.len(),
        })?;
        if unit >= self.active.load(Ordering::Relaxed) {
            self.active.fetch_max(unit + 1, Ordering::Relaxed);
        }
        Ok(slot)
    }

    /// Adds `amount` events for `unit` and returns the count before the addition.
    #[inline]
    pub fn add(&self, unit: usize, amount: u64) -> Result<u64, FaultError> {
        let slot = self.slot(unit)?;
        match self.layout {
            CounterLayout::PerUnit => {
                let before = slot.load(Ordering::Relaxed);
                slot.store(before + amount, Ordering::Relaxed);
                Ok(before)
            }
            CounterLayout::Shared => Ok(slot.fetch_add(amount, Ordering::Relaxed)),
        }
    }

    /// Counts one event for `unit` and returns the new count.
    #[inline]
    pub fn increment(&self, unit: usize) -> Result<u64, FaultError> {
        Ok(self.add(unit, 1)? + 1)
    }

    /// Current count of `unit`.
    pub fn get(&self, unit: usize) -> Result<u64, FaultError> {
        Ok(self.slot(unit)?.load(Ordering::Relaxed))
    }

    /// Counts of all units seen so far. Call once the units are quiescent.
    pub fn snapshot(&self) -> Vec<u64> {
        let active = match self.layout {
            CounterLayout::PerUnit => self.active.load(Ordering::Acquire).min(self.slots.len()),
            CounterLayout::Shared => 1,
        };
        self.slots[..active]
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect()
    }
}
