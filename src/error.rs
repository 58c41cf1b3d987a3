//! Error taxonomy of a fault injection session.
//!
//! Every variant is fatal for the experiment. Callers never retry: a new
//! random draw is a new experiment, not a retry of the old one.

use std::io;
use std::path::PathBuf;

/// Coarse classification of a [`FaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Broken or missing input: abort before the victim is instrumented.
    Configuration,
    /// The victim did not behave deterministically between recording and replay.
    Invariant,
    /// The instrumentation host refused an operand access.
    Host,
}

/// Errors raised by the injection engine and its persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum FaultError {
    /// Inconsistent configuration values.
    #[error("Configuration error: {0}")]
    Config(String),
    /// A target, injection or profiling file exists but does not parse.
    #[error("Malformed record in {}: {reason}", .file.display())]
    MalformedRecord { file: PathBuf, reason: String },
    /// The entropy source for the random generator cannot be read.
    #[error("Entropy source {} unavailable: {source}", .path.display())]
    Entropy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Reading or writing a session file failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// An instruction reached the injection point without any eligible operand.
    #[error("Instruction at 0x{address:x} has no eligible operands")]
    NoEligibleOperands { address: u64 },
    /// A concurrency unit id exceeds the counter capacity.
    #[error("Unit {unit} exceeds counter capacity {capacity}")]
    UnitOutOfRange { unit: usize, capacity: usize },
    /// Replayed operand size differs from the recorded one.
    #[error("Operand {operand} has size {actual} bytes, recorded size is {recorded} bytes")]
    OperandSizeMismatch {
        operand: usize,
        recorded: u32,
        actual: u32,
    },
    /// Replayed operand index does not exist at the armed instruction.
    #[error("Operand index {index} out of range, instruction has {available} eligible operands")]
    OperandOutOfRange { index: usize, available: usize },
    /// Replayed static instruction index differs from the armed instruction.
    #[error("Armed instruction has static index {actual}, recorded index is {recorded}")]
    StaticIndexMismatch { recorded: u64, actual: u64 },
    /// A second injection was attempted within one session.
    #[error("Double injection attempt, a session injects at most one fault")]
    DoubleInjection,
    /// The occurrence counter moved past the target without arming.
    #[error("Unit {unit} reached occurrence {count} past target {target} without injecting")]
    TargetPassed { unit: usize, count: u64, target: u64 },
    /// Bit position outside of the operand.
    #[error("Bit {bit} outside of {size} byte operand")]
    BitOutOfRange { bit: u64, size: u32 },
    /// Operand access through the host failed.
    #[error("Host error: {0}")]
    Host(String),
}

impl FaultError {
    /// Returns the class of the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            FaultError::Config(_)
            | FaultError::MalformedRecord { .. }
            | FaultError::Entropy { .. }
            | FaultError::Io { .. }
            | FaultError::NoEligibleOperands { .. }
            | FaultError::UnitOutOfRange { .. } => ErrorClass::Configuration,
            FaultError::OperandSizeMismatch { .. }
            | FaultError::OperandOutOfRange { .. }
            | FaultError::StaticIndexMismatch { .. }
            | FaultError::DoubleInjection
            | FaultError::TargetPassed { .. }
            | FaultError::BitOutOfRange { .. } => ErrorClass::Invariant,
            FaultError::Host(_) => ErrorClass::Host,
        }
    }

    /// Wraps an I/O error with the path it occurred on.
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FaultError::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a record parse failure with the file it was read from.
    pub(crate) fn malformed(file: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        FaultError::MalformedRecord {
            file: file.into(),
            reason: reason.into(),
        }
    }
}
