//! Profiling record: final occurrence count per concurrency unit.
//!
//! Threaded variants write one `thread=<id>, fi_index=<count>` line per
//! thread followed by an aggregate `fi_index=<sum>` line. Single counter
//! variants write the aggregate line only.

use super::{Record, Schema};
use std::fmt;

const THREAD_LINE: Schema = Schema {
    required: &["thread", "fi_index"],
    optional: &[],
    aliases: &[("fi_thread", "thread")],
};

const TOTAL_LINE: Schema = Schema {
    required: &["fi_index"],
    optional: &[],
    aliases: &[],
};

/// Occurrence count observed by one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitCount {
    pub thread: usize,
    pub count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileRecord {
    /// Per-thread counts, empty for single counter variants.
    pub units: Vec<UnitCount>,
    pub total: u64,
}

impl ProfileRecord {
    /// Profile of a variant with a single counter.
    pub fn single(total: u64) -> Self {
        Self {
            units: Vec::new(),
            total,
        }
    }

    /// Profile of a threaded variant. The total is the sum of `counts`.
    pub fn per_thread(counts: &[u64]) -> Self {
        Self {
            units: counts
                .iter()
                .enumerate()
                .map(|(thread, &count)| UnitCount { thread, count })
                .collect(),
            total: counts.iter().sum(),
        }
    }

    /// Count of `thread`, or the total for single counter profiles.
    pub fn count_of(&self, thread: usize) -> Option<u64> {
        if self.units.is_empty() {
            return (thread == 0).then_some(self.total);
        }
        self.units
            .iter()
            .find(|unit| unit.thread == thread)
            .map(|unit| unit.count)
    }

    /// Parses the content of a profiling file.
    ///
    /// # Arguments
    ///
    /// * `content` - Whole file content.
    ///
    /// # Returns
    ///
    /// * `Result<Self, String>` - The profile, or a description of the first bad line.
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut units = Vec::new();
        let mut total = None;
        for (number, line) in content
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
        {
            let failed = |e: String| format!("line {}: {}", number + 1, e);
            if total.is_some() {
                return Err(failed("record after the aggregate line".to_string()));
            }
            let record: Record = line.parse().map_err(failed)?;
            if record.raw("thread").is_some() || record.raw("fi_thread").is_some() {
                let record = THREAD_LINE.parse(line).map_err(failed)?;
                let thread: usize = record.get("thread").map_err(failed)?;
                if units.iter().any(|unit: &UnitCount| unit.thread == thread) {
                    return Err(failed(format!("thread {} listed twice", thread)));
                }
                units.push(UnitCount {
                    thread,
                    count: record.get("fi_index").map_err(failed)?,
                });
            } else {
                let record = TOTAL_LINE.parse(line).map_err(failed)?;
                total = Some(record.get::<u64>("fi_index").map_err(failed)?);
            }
        }
        let sum: u64 = units.iter().map(|unit| unit.count).sum();
        let total = match total {
            Some(total) => total,
            None if !units.is_empty() => sum,
            None => return Err("profile holds no counts".to_string()),
        };
        if !units.is_empty() && total != sum {
            return Err(format!(
                "aggregate fi_index={} differs from the per-thread sum {}",
                total, sum
            ));
        }
        Ok(Self { units, total })
    }
}

impl fmt::Display for ProfileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for unit in &self.units {
            writeln!(
                f,
                "{}",
                Record::new()
                    .with("thread", unit.thread)
                    .with("fi_index", unit.count)
            )?;
        }
        writeln!(f, "{}", Record::new().with("fi_index", self.total))
    }
}
