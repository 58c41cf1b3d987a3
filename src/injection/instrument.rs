//! Static instrumentation pass.
//!
//! Decides once per static instruction whether it is a fault site, builds its
//! eligible operand list and counts the sites of every basic block. The
//! dynamic callbacks of the session only ever see instructions accepted here.

use crate::injection::operand::{EligibilityFilter, Operand};
use crate::record::catalogue::{CategorySummary, InstructionCatalogue};
use log::debug;

/// Static view of an instruction as reported by the host.
#[derive(Clone, Debug)]
pub struct StaticInstruction<'a> {
    pub address: u64,
    pub disassembly: &'a str,
    pub category: &'a str,
    /// Every register and memory operand, eligible or not.
    pub operands: Vec<Operand>,
    /// False for branches, calls, returns and anything else without a
    /// deterministic fall-through successor.
    pub has_fall_through: bool,
}

/// A fault site: an instruction accepted by the static pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrumentedInstruction {
    /// 1-based static index (`fi_instr_index`).
    pub static_index: u64,
    pub address: u64,
    pub disassembly: String,
    pub operands: Vec<Operand>,
}

/// Fault sites of one basic block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstrumentedBlock {
    pub sites: Vec<InstrumentedInstruction>,
    /// Position of every site in the original instruction list of the block.
    pub positions: Vec<usize>,
}

impl InstrumentedBlock {
    /// Number of eligible events one execution of the block produces.
    pub fn eligible(&self) -> u64 {
        self.sites.len() as u64
    }

    /// Site at instruction `position` of the block, if it is one.
    pub fn site_at(&self, position: usize) -> Option<&InstrumentedInstruction> {
        self.positions
            .binary_search(&position)
            .ok()
            .map(|index| &self.sites[index])
    }
}

#[derive(Debug, Default)]
pub struct Instrumenter {
    filter: EligibilityFilter,
    next_index: u64,
    catalogue: Option<InstructionCatalogue>,
    categories: Option<CategorySummary>,
}

impl Instrumenter {
    pub fn new(filter: EligibilityFilter) -> Self {
        Self {
            filter,
            next_index: 0,
            catalogue: None,
            categories: None,
        }
    }

    /// Records every accepted instruction in a catalogue.
    pub fn with_catalogue(mut self) -> Self {
        self.catalogue = Some(InstructionCatalogue::default());
        self
    }

    /// Records the mnemonics of every accepted instruction per category.
    pub fn with_categories(mut self) -> Self {
        self.categories = Some(CategorySummary::default());
        self
    }

    /// Runs the static pass on one instruction.
    ///
    /// # Arguments
    ///
    /// * `instruction` - Static description of the instruction.
    ///
    /// # Returns
    ///
    /// * `Option<InstrumentedInstruction>` - The fault site, or `None` if the
    ///   instruction alters control flow or has no eligible operand.
    pub fn instrument(&mut self, instruction: &StaticInstruction) -> Option<InstrumentedInstruction> {
        if !instruction.has_fall_through {
            debug!(
                "Skip 0x{:x} '{}': no fall-through",
                instruction.address, instruction.disassembly
            );
            return None;
        }
        let operands = self.filter.select(instruction.operands.iter().cloned());
        if operands.is_empty() {
            return None;
        }
        self.next_index += 1;
        if let Some(catalogue) = self.catalogue.as_mut() {
            catalogue.push(instruction.address, instruction.disassembly);
        }
        if let Some(categories) = self.categories.as_mut() {
            categories.insert(instruction.category, instruction.disassembly);
        }
        Some(InstrumentedInstruction {
            static_index: self.next_index,
            address: instruction.address,
            disassembly: instruction.disassembly.to_string(),
            operands,
        })
    }

    /// Runs the static pass on every instruction of a basic block.
    pub fn instrument_block<'a>(
        &mut self,
        instructions: impl IntoIterator<Item = StaticInstruction<'a>>,
    ) -> InstrumentedBlock {
        let mut block = InstrumentedBlock::default();
        for (position, instruction) in instructions.into_iter().enumerate() {
            if let Some(site) = self.instrument(&instruction) {
                block.sites.push(site);
                block.positions.push(position);
            }
        }
        block
    }

    /// Number of fault sites found so far.
    pub fn sites(&self) -> u64 {
        self.next_index
    }

    pub fn catalogue(&self) -> Option<&InstructionCatalogue> {
        self.catalogue.as_ref()
    }

    pub fn categories(&self) -> Option<&CategorySummary> {
        self.categories.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injection::operand::OperandKind;

    fn instruction(address: u64, disassembly: &'static str, operands: Vec<Operand>) -> StaticInstruction<'static> {
        StaticInstruction {
            address,
            disassembly,
            category: "BINARY",
            operands,
            has_fall_through: true,
        }
    }

    fn dst(name: &str) -> Operand {
        Operand::register(OperandKind::Destination, name, 8, 0)
    }

    #[test]
    fn static_indices_are_dense_and_one_based() {
        let mut instrumenter = Instrumenter::new(EligibilityFilter::default()).with_catalogue();
        let block = instrumenter.instrument_block(vec![
            instruction(0x10, "add rax, rbx", vec![dst("rax")]),
            instruction(0x14, "cmp rax, rbx", vec![]),
            instruction(0x18, "mov rcx, rax", vec![dst("rcx")]),
        ]);
        assert_eq!(block.eligible(), 2);
        assert_eq!(block.sites[0].static_index, 1);
        assert_eq!(block.sites[1].static_index, 2);
        assert_eq!(block.positions, vec![0, 2]);
        assert!(block.site_at(1).is_none());
        assert_eq!(block.site_at(2).unwrap().address, 0x18);
        assert_eq!(instrumenter.catalogue().unwrap().len(), 2);
    }

    #[test]
    fn control_flow_is_never_instrumented() {
        let mut instrumenter = Instrumenter::new(EligibilityFilter::default());
        let mut call = instruction(0x20, "call 0x400", vec![dst("rsp")]);
        call.has_fall_through = false;
        assert!(instrumenter.instrument(&call).is_none());
        assert_eq!(instrumenter.sites(), 0);
    }

    #[test]
    fn instruction_pointer_alone_is_not_a_site() {
        let mut instrumenter = Instrumenter::new(EligibilityFilter::default()).with_categories();
        assert!(instrumenter
            .instrument(&instruction(0x30, "lea rip, [rip]", vec![dst("rip")]))
            .is_none());
        assert!(instrumenter
            .instrument(&instruction(0x34, "sub rax, 1", vec![dst("rax")]))
            .is_some());
        assert_eq!(instrumenter.categories().unwrap().to_string(), "BINARY\n\tsub\n");
    }
}
