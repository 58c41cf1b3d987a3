//! Seams towards the instrumentation host.
//!
//! The engine never touches registers or memory itself. At the armed event
//! it asks the host for the operand bytes and hands back the corrupted value.

use crate::injection::operand::Operand;

/// Access to operand storage at the point right after an instruction executed.
pub trait OperandAccess {
    /// Reads the current value of `operand`, little endian, `operand.size` bytes.
    fn read(&mut self, operand: &Operand) -> Result<Vec<u8>, String>;

    /// Writes `bytes` back to `operand`.
    fn write(&mut self, operand: &Operand, bytes: &[u8]) -> Result<(), String>;
}

/// Control over the instrumentation itself.
pub trait Instrumentation: Send + Sync {
    /// Stops delivering callbacks. Counting state must not be touched afterwards.
    fn detach(&self) -> Result<(), String>;

    /// Checks if register context mutated inside a callback survives `detach`.
    ///
    /// Hosts that cannot guarantee this lose the injected fault when detached
    /// right after a register write.
    fn preserves_context_on_detach(&self) -> bool {
        false
    }
}

/// Host without detach support. Detaching only disables the callbacks in the engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineHost;

impl Instrumentation for InlineHost {
    fn detach(&self) -> Result<(), String> {
        Err("host does not support detaching".to_string())
    }
}
