//! Eligible operands and the operand chooser.

use crate::error::FaultError;
use crate::record::descriptor::InjectionDescriptor;
use crate::rng::Mt64;
use log::{debug, warn};
use serde::Deserialize;
use std::fmt;

/// Instructions with more eligible operands than this are reported.
pub const PATHOLOGICAL_OPERAND_COUNT: usize = 32;

/// Role of an operand at its instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Source,
    Destination,
    MemoryDestination,
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperandKind::Source => "src",
            OperandKind::Destination => "dst",
            OperandKind::MemoryDestination => "dst-mem",
        };
        write!(f, "{}", name)
    }
}

/// One operand of an instrumented instruction.
///
/// `handle` is opaque to the engine. The host uses it to find the storage
/// behind the operand (register number, memory cell id).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    /// Register name, or a symbolic name for memory operands.
    pub name: String,
    /// Size in bytes.
    pub size: u32,
    pub handle: usize,
}

impl Operand {
    pub fn register(kind: OperandKind, name: &str, size: u32, handle: usize) -> Self {
        Self {
            kind,
            name: name.to_string(),
            size,
            handle,
        }
    }
}

/// Checks if `name` designates the instruction pointer, which is never a fault target.
pub fn is_instruction_pointer(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "rip" | "eip" | "ip" | "pc"
    )
}

/// Operand classes that may receive a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EligibilityFilter {
    pub src_regs: bool,
    pub dst_regs: bool,
    pub dst_mem: bool,
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        Self {
            src_regs: false,
            dst_regs: true,
            dst_mem: false,
        }
    }
}

impl EligibilityFilter {
    /// Checks if `operand` passes the filter.
    pub fn accepts(&self, operand: &Operand) -> bool {
        match operand.kind {
            OperandKind::Source => self.src_regs,
            OperandKind::Destination => self.dst_regs && !is_instruction_pointer(&operand.name),
            // Only memory writes with a statically known size qualify.
            OperandKind::MemoryDestination => self.dst_mem && operand.size > 0,
        }
    }

    /// Returns the eligible operands of an instruction, in operand order.
    ///
    /// All classes share one list, so a random draw is uniform over every
    /// eligible operand and not per class.
    pub fn select(&self, candidates: impl IntoIterator<Item = Operand>) -> Vec<Operand> {
        let eligible: Vec<Operand> = candidates
            .into_iter()
            .filter(|operand| self.accepts(operand))
            .collect();
        if eligible.len() > PATHOLOGICAL_OPERAND_COUNT {
            warn!(
                "Instruction has {} eligible operands, more than {}",
                eligible.len(),
                PATHOLOGICAL_OPERAND_COUNT
            );
        }
        eligible
    }
}

/// Picks the operand to corrupt at the armed instruction.
///
/// # Arguments
///
/// * `operands` - Eligible operands of the armed instruction.
/// * `replay` - Recorded injection in reproduce mode, `None` for a random draw.
/// * `rng` - Generator used for the random draw.
///
/// # Returns
///
/// * `Result<usize, FaultError>` - Index into `operands`.
pub fn choose_operand(
    operands: &[Operand],
    replay: Option<&InjectionDescriptor>,
    rng: Option<&mut Mt64>,
    address: u64,
) -> Result<usize, FaultError> {
    if operands.is_empty() {
        return Err(FaultError::NoEligibleOperands { address });
    }
    let index = match (replay, rng) {
        (Some(recorded), _) => {
            let operand =
                operands
                    .get(recorded.operand_index)
                    .ok_or(FaultError::OperandOutOfRange {
                        index: recorded.operand_index,
                        available: operands.len(),
                    })?;
            if operand.size != recorded.operand_size {
                return Err(FaultError::OperandSizeMismatch {
                    operand: recorded.operand_index,
                    recorded: recorded.operand_size,
                    actual: operand.size,
                });
            }
            recorded.operand_index
        }
        (None, Some(rng)) => rng.below(operands.len() as u64) as usize,
        (None, None) => {
            return Err(FaultError::Config(
                "random operand choice without a generator".to_string(),
            ))
        }
    };
    debug!(
        "Operand {} of {} chosen: {} {} ({} bytes)",
        index,
        operands.len(),
        operands[index].kind,
        operands[index].name,
        operands[index].size
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::descriptor::Scope;

    fn operands() -> Vec<Operand> {
        vec![
            Operand::register(OperandKind::Source, "ebx", 4, 1),
            Operand::register(OperandKind::Destination, "eax", 4, 0),
            Operand::register(OperandKind::Destination, "rip", 8, 16),
            Operand::register(OperandKind::MemoryDestination, "mem", 8, 0),
        ]
    }

    fn recorded(op: usize, size: u32) -> InjectionDescriptor {
        InjectionDescriptor {
            scope: Scope::serial(),
            occurrence: 1,
            operand_index: op,
            operand_size: size,
            bit: 0,
            static_index: None,
            register: None,
            address: None,
        }
    }

    #[test]
    fn default_filter_takes_destination_registers() {
        let eligible = EligibilityFilter::default().select(operands());
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name, "eax");
    }

    #[test]
    fn instruction_pointer_is_never_eligible() {
        let filter = EligibilityFilter {
            src_regs: true,
            dst_regs: true,
            dst_mem: true,
        };
        let eligible = filter.select(operands());
        assert_eq!(eligible.len(), 3);
        assert!(eligible.iter().all(|operand| operand.name != "rip"));
        assert!(is_instruction_pointer("EIP"));
        assert!(!is_instruction_pointer("rax"));
    }

    #[test]
    fn memory_needs_known_size() {
        let filter = EligibilityFilter {
            src_regs: false,
            dst_regs: false,
            dst_mem: true,
        };
        let unknown = Operand::register(OperandKind::MemoryDestination, "mem", 0, 0);
        assert!(!filter.accepts(&unknown));
    }

    #[test]
    fn replay_checks_recorded_operand() {
        let eligible = EligibilityFilter::default().select(operands());
        assert_eq!(choose_operand(&eligible, Some(&recorded(0, 4)), None, 0).unwrap(), 0);
        assert!(matches!(
            choose_operand(&eligible, Some(&recorded(0, 8)), None, 0),
            Err(FaultError::OperandSizeMismatch {
                recorded: 8,
                actual: 4,
                ..
            })
        ));
        assert!(matches!(
            choose_operand(&eligible, Some(&recorded(3, 4)), None, 0),
            Err(FaultError::OperandOutOfRange {
                index: 3,
                available: 1
            })
        ));
    }

    #[test]
    fn random_choice_is_in_range() {
        let all = operands();
        let mut rng = Mt64::new(3);
        for _ in 0..100 {
            assert!(choose_operand(&all, None, Some(&mut rng), 0).unwrap() < all.len());
        }
    }

    #[test]
    fn no_operands_is_an_error() {
        assert!(matches!(
            choose_operand(&[], None, Some(&mut Mt64::new(1)), 0x40),
            Err(FaultError::NoEligibleOperands { address: 0x40 })
        ));
    }
}
