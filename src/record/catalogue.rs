//! Diagnostic listings of the instrumented instructions.
//!
//! Nothing in the engine reads these files back. They exist to audit the
//! eligibility filters.

use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One instrumented instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogueEntry {
    pub address: u64,
    pub disassembly: String,
}

impl fmt::Display for CatalogueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr=0x{:x}, instr=\"{}\"", self.address, self.disassembly)
    }
}

/// Every instruction the static pass accepted, in instrumentation order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstructionCatalogue {
    entries: Vec<CatalogueEntry>,
}

impl InstructionCatalogue {
    pub fn push(&mut self, address: u64, disassembly: &str) {
        self.entries.push(CatalogueEntry {
            address,
            disassembly: disassembly.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for InstructionCatalogue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

/// Mnemonics seen per instruction category, both sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CategorySummary {
    categories: BTreeMap<String, BTreeSet<String>>,
}

impl CategorySummary {
    /// Records the mnemonic (first word) of `disassembly` under `category`.
    pub fn insert(&mut self, category: &str, disassembly: &str) {
        let mnemonic = disassembly.split_whitespace().next().unwrap_or_default();
        self.categories
            .entry(category.to_string())
            .or_default()
            .insert(mnemonic.to_string());
    }
}

impl fmt::Display for CategorySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (category, mnemonics) in &self.categories {
            writeln!(f, "{}", category)?;
            if !mnemonics.is_empty() {
                writeln!(
                    f,
                    "{}",
                    mnemonics.iter().map(|name| format!("\t{}", name)).join("\n")
                )?;
            }
        }
        Ok(())
    }
}
