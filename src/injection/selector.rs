//! Target selection state machine.
//!
//! `Counting -> Armed -> Injected -> (Detached | Done)`. The armed state is
//! entered through a compare-and-swap, so at most one `(unit, event)` pair of
//! the whole session wins it.

use crate::error::FaultError;
use crate::injection::counter::CounterLayout;
use crate::record::descriptor::TargetDescriptor;
use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Counting = 0,
    Armed = 1,
    Injected = 2,
    Detached = 3,
    Done = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Counting,
            1 => Phase::Armed,
            2 => Phase::Injected,
            3 => Phase::Detached,
            _ => Phase::Done,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Counting => "counting",
            Phase::Armed => "armed",
            Phase::Injected => "injected",
            Phase::Detached => "detached",
            Phase::Done => "done",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
pub struct TargetSelector {
    target: Option<TargetDescriptor>,
    /// Rank of the process running this selector, if any.
    rank: Option<u32>,
    layout: CounterLayout,
    phase: AtomicU8,
}

impl TargetSelector {
    pub fn new(target: Option<TargetDescriptor>, rank: Option<u32>, layout: CounterLayout) -> Self {
        Self {
            target,
            rank,
            layout,
            phase: AtomicU8::new(Phase::Counting as u8),
        }
    }

    pub fn target(&self) -> Option<&TargetDescriptor> {
        self.target.as_ref()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Checks if events of `thread` may arm this selector.
    #[inline]
    pub fn in_scope(&self, thread: usize) -> bool {
        match &self.target {
            Some(target) => target.scope.contains(self.rank, thread),
            None => false,
        }
    }

    /// Target occurrence, if `thread` is in scope and the selector still counts.
    #[inline]
    fn pending_target(&self, thread: usize) -> Option<u64> {
        if self.phase() != Phase::Counting || !self.in_scope(thread) {
            return None;
        }
        self.target.as_ref().map(|target| target.occurrence)
    }

    /// Decides whether a block of `eligible` events must be counted per instruction.
    ///
    /// # Arguments
    ///
    /// * `thread` - Unit executing the block.
    /// * `before` - Count of the unit before the block.
    /// * `eligible` - Static number of eligible instructions in the block.
    ///
    /// # Returns
    ///
    /// * `Result<bool, FaultError>` - `true` if the target lies inside the block.
    pub fn contains_target(
        &self,
        thread: usize,
        before: u64,
        eligible: u64,
    ) -> Result<bool, FaultError> {
        let Some(target) = self.pending_target(thread) else {
            return Ok(false);
        };
        if self.layout == CounterLayout::Shared {
            // Other threads move the shared count between blocks.
            return Ok(true);
        }
        if before >= target {
            return Err(FaultError::TargetPassed {
                unit: thread,
                count: before,
                target,
            });
        }
        let hit = target <= before + eligible;
        if hit {
            debug!(
                "Thread {} refines block ({}, {}] holding target {}",
                thread,
                before,
                before + eligible,
                target
            );
        }
        Ok(hit)
    }

    /// Tries to arm the selector for the event that brought `thread` to `count`.
    ///
    /// Returns `true` for exactly one event of the session.
    #[inline]
    pub fn try_arm(&self, thread: usize, count: u64) -> Result<bool, FaultError> {
        let Some(target) = self.pending_target(thread) else {
            return Ok(false);
        };
        if count == target {
            return Ok(self
                .phase
                .compare_exchange(
                    Phase::Counting as u8,
                    Phase::Armed as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok());
        }
        if count > target && self.layout == CounterLayout::PerUnit {
            return Err(FaultError::TargetPassed {
                unit: thread,
                count,
                target,
            });
        }
        Ok(false)
    }

    /// Final check once the units are quiescent.
    ///
    /// `count` is the final count the target refers to: the scoped thread's
    /// counter, or the shared counter.
    pub fn check_final(&self, count: Option<u64>) -> Result<(), FaultError> {
        match (self.phase(), &self.target, count) {
            (Phase::Counting, Some(target), Some(count)) if count >= target.occurrence => {
                Err(FaultError::TargetPassed {
                    unit: target.scope.thread.unwrap_or_default() as usize,
                    count,
                    target: target.occurrence,
                })
            }
            _ => Ok(()),
        }
    }
}
