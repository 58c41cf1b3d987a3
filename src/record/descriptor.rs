//! Target and injection descriptors.
//!
//! A target descriptor names the dynamic occurrence to hit. An injection
//! descriptor is the full replay record written after a random injection:
//! occurrence, operand index, operand size and bit position.

use super::{Record, Schema};
use crate::injection::Variant;
use std::fmt;

const TARGET_SCHEMAS: [Schema; 4] = [
    Schema {
        required: &["fi_index"],
        optional: &[],
        aliases: &[],
    },
    Schema {
        required: &["thread", "fi_index"],
        optional: &[],
        aliases: &[("fi_thread", "thread")],
    },
    Schema {
        required: &["rank", "fi_index"],
        optional: &[],
        aliases: &[],
    },
    Schema {
        required: &["rank", "thread", "fi_index"],
        optional: &[],
        aliases: &[("fi_thread", "thread")],
    },
];

const INJECTION_OPTIONAL: &[&str] = &["fi_instr_index", "reg", "addr"];

const INJECTION_SCHEMAS: [Schema; 4] = [
    Schema {
        required: &["fi_index", "op", "size", "bitflip"],
        optional: INJECTION_OPTIONAL,
        aliases: &[],
    },
    Schema {
        required: &["thread", "fi_index", "op", "size", "bitflip"],
        optional: INJECTION_OPTIONAL,
        aliases: &[("fi_thread", "thread")],
    },
    Schema {
        required: &["rank", "fi_index", "op", "size", "bitflip"],
        optional: INJECTION_OPTIONAL,
        aliases: &[],
    },
    Schema {
        required: &["rank", "thread", "fi_index", "op", "size", "bitflip"],
        optional: INJECTION_OPTIONAL,
        aliases: &[("fi_thread", "thread")],
    },
];

fn schema_index(variant: Variant) -> usize {
    match (variant.has_rank_scope(), variant.has_thread_scope()) {
        (false, false) => 0,
        (false, true) => 1,
        (true, false) => 2,
        (true, true) => 3,
    }
}

/// Concurrency unit a session targets. Absent fields match every unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Scope {
    pub rank: Option<u32>,
    pub thread: Option<u32>,
}

impl Scope {
    pub fn serial() -> Self {
        Self::default()
    }

    pub fn thread(thread: u32) -> Self {
        Self {
            rank: None,
            thread: Some(thread),
        }
    }

    pub fn rank(rank: u32) -> Self {
        Self {
            rank: Some(rank),
            thread: None,
        }
    }

    pub fn rank_thread(rank: u32, thread: u32) -> Self {
        Self {
            rank: Some(rank),
            thread: Some(thread),
        }
    }

    /// Checks if the unit `(rank, thread)` belongs to this scope.
    pub fn contains(&self, rank: Option<u32>, thread: usize) -> bool {
        let rank_matches = match self.rank {
            Some(target) => rank == Some(target),
            None => true,
        };
        let thread_matches = match self.thread {
            Some(target) => target as usize == thread,
            None => true,
        };
        rank_matches && thread_matches
    }

    fn read(record: &Record) -> Result<Self, String> {
        Ok(Self {
            rank: record.get_opt("rank")?,
            thread: record.get_opt("thread")?,
        })
    }

    fn write(&self, record: Record) -> Record {
        record
            .with_opt("rank", self.rank)
            .with_opt("thread", self.thread)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.rank, self.thread) {
            (None, None) => write!(f, "serial"),
            (Some(rank), None) => write!(f, "rank {}", rank),
            (None, Some(thread)) => write!(f, "thread {}", thread),
            (Some(rank), Some(thread)) => write!(f, "rank {} thread {}", rank, thread),
        }
    }
}

/// Content of a target file: which occurrence of which unit to corrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub scope: Scope,
    /// 1-based dynamic occurrence index (`fi_index`).
    pub occurrence: u64,
}

impl TargetDescriptor {
    /// Parses a target record with the scope fields required by `variant`.
    pub fn parse(line: &str, variant: Variant) -> Result<Self, String> {
        let record = TARGET_SCHEMAS[schema_index(variant)].parse(line)?;
        let occurrence: u64 = record.get("fi_index")?;
        if occurrence == 0 {
            return Err("fi_index must be greater than zero".to_string());
        }
        Ok(Self {
            scope: Scope::read(&record)?,
            occurrence,
        })
    }

    pub fn to_record(&self) -> Record {
        self.scope
            .write(Record::new())
            .with("fi_index", self.occurrence)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_record())
    }
}

/// Content of an injection file: everything needed for a bit-exact replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectionDescriptor {
    pub scope: Scope,
    /// 1-based dynamic occurrence index (`fi_index`).
    pub occurrence: u64,
    /// Index into the eligible operand list of the armed instruction (`op`).
    pub operand_index: usize,
    /// Operand size in bytes (`size`).
    pub operand_size: u32,
    /// Flipped bit within the operand (`bitflip`).
    pub bit: u32,
    /// Static index of the armed instruction (`fi_instr_index`).
    pub static_index: Option<u64>,
    /// Register name, diagnostic only (`reg`).
    pub register: Option<String>,
    /// Instruction address, diagnostic only (`addr`).
    pub address: Option<u64>,
}

impl InjectionDescriptor {
    /// Parses an injection record with the scope fields required by `variant`.
    pub fn parse(line: &str, variant: Variant) -> Result<Self, String> {
        let record = INJECTION_SCHEMAS[schema_index(variant)].parse(line)?;
        let descriptor = Self {
            scope: Scope::read(&record)?,
            occurrence: record.get("fi_index")?,
            operand_index: record.get("op")?,
            operand_size: record.get("size")?,
            bit: record.get("bitflip")?,
            static_index: record.get_opt("fi_instr_index")?,
            register: record.get_opt("reg")?,
            address: record.get_hex_opt("addr")?,
        };
        if descriptor.occurrence == 0 {
            return Err("fi_index must be greater than zero".to_string());
        }
        if descriptor.operand_size == 0 {
            return Err("size must be greater than zero".to_string());
        }
        if descriptor.operand_size.checked_mul(8).is_none() {
            return Err(format!(
                "size {} bytes is too wide to address its bits",
                descriptor.operand_size
            ));
        }
        if u64::from(descriptor.bit) >= descriptor.size_bits() {
            return Err(format!(
                "bitflip {} outside of a {} byte operand",
                descriptor.bit, descriptor.operand_size
            ));
        }
        Ok(descriptor)
    }

    /// Operand width in bits.
    pub fn size_bits(&self) -> u64 {
        u64::from(self.operand_size) * 8
    }

    /// The target this injection was recorded for.
    pub fn target(&self) -> TargetDescriptor {
        TargetDescriptor {
            scope: self.scope,
            occurrence: self.occurrence,
        }
    }

    pub fn to_record(&self) -> Record {
        self.scope
            .write(Record::new())
            .with("fi_index", self.occurrence)
            .with("op", self.operand_index)
            .with("size", self.operand_size)
            .with("bitflip", self.bit)
            .with_opt("fi_instr_index", self.static_index)
            .with_opt("reg", self.register.as_deref())
            .with_opt("addr", self.address.map(|address| format!("0x{:x}", address)))
    }
}

impl fmt::Display for InjectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_record())
    }
}
