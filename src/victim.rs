//! Replayable victim programs.
//!
//! A victim is a register file, a list of instructions grouped into basic
//! blocks and a block schedule per rank and thread. The runner executes it
//! on real threads and drives one [`Session`] per rank through the same
//! callbacks an instrumentation host uses: `on_block` at every block entry,
//! `on_instruction` right after every fault site of a refined block.
//!
//! Instruction semantics are synthetic but deterministic: every written
//! location receives a mix of the values read, so a flipped bit propagates
//! into the final state digest of its thread.

use crate::error::FaultError;
use crate::injection::host::{Instrumentation, OperandAccess};
use crate::injection::instrument::{InstrumentedBlock, Instrumenter, StaticInstruction};
use crate::injection::operand::{EligibilityFilter, Operand, OperandKind};
use crate::injection::{BlockAction, FinalReport, Session, SessionConfig};
use crate::persistence::{FileNames, SessionFiles};
use crate::record::parse_hex;
use crossbeam_channel::unbounded;
use log::{debug, error, info};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Accepts `"0x401000"` as well as plain numbers.
fn deserialize_address<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => parse_hex(&s).map_err(de::Error::custom),
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| de::Error::custom("Invalid number for address")),
        _ => Err(de::Error::custom("Address must be a string or number")),
    }
}

fn default_register_size() -> u32 {
    8
}

fn default_category() -> String {
    "UNKNOWN".to_string()
}

fn default_true() -> bool {
    true
}

fn default_iterations() -> usize {
    1
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegisterSpec {
    pub name: String,
    /// Size in bytes, 1 to 8.
    #[serde(default = "default_register_size")]
    pub size: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InstructionSpec {
    #[serde(deserialize_with = "deserialize_address")]
    pub address: u64,
    pub disassembly: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    /// Size in bytes of a memory write, 0 if the size is not known statically.
    #[serde(default)]
    pub memory_write: Option<u32>,
    #[serde(default = "default_true")]
    pub fall_through: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ThreadSpec {
    /// Block ids in execution order.
    pub blocks: Vec<usize>,
    /// Number of times the block list is executed.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RankSpec {
    pub threads: Vec<ThreadSpec>,
}

/// A victim program as described in its JSON5 file.
#[derive(Clone, Debug, Deserialize)]
pub struct VictimProgram {
    pub registers: Vec<RegisterSpec>,
    pub instructions: Vec<InstructionSpec>,
    /// Instruction indices of every basic block.
    pub blocks: Vec<Vec<usize>>,
    pub ranks: Vec<RankSpec>,
}

impl VictimProgram {
    /// Loads and validates a victim description from a JSON5 file.
    pub fn from_file(path: &Path) -> Result<Self, FaultError> {
        let content = std::fs::read_to_string(path).map_err(|e| FaultError::io(path, e))?;
        Self::from_json5(&content)
            .map_err(|e| FaultError::Config(format!("victim {}: {}", path.display(), e)))
    }

    pub fn from_json5(content: &str) -> Result<Self, String> {
        let program: Self =
            json5::from_str(content).map_err(|e| format!("Failed to parse JSON5 victim: {}", e))?;
        program.validate()?;
        Ok(program)
    }

    fn validate(&self) -> Result<(), String> {
        let mut names = HashMap::new();
        for (index, register) in self.registers.iter().enumerate() {
            if !(1..=8).contains(&register.size) {
                return Err(format!(
                    "register {} has size {}, expected 1 to 8 bytes",
                    register.name, register.size
                ));
            }
            if names.insert(register.name.as_str(), index).is_some() {
                return Err(format!("register {} defined twice", register.name));
            }
        }
        for instruction in &self.instructions {
            if let Some(unknown) = instruction
                .reads
                .iter()
                .chain(&instruction.writes)
                .find(|name| !names.contains_key(name.as_str()))
            {
                return Err(format!(
                    "instruction at 0x{:x} uses unknown register {}",
                    instruction.address, unknown
                ));
            }
            if instruction.memory_write.is_some_and(|size| size > 8) {
                return Err(format!(
                    "instruction at 0x{:x} writes more than 8 bytes of memory",
                    instruction.address
                ));
            }
        }
        for (id, block) in self.blocks.iter().enumerate() {
            if let Some(index) = block.iter().find(|index| **index >= self.instructions.len()) {
                return Err(format!("block {} references instruction {}", id, index));
            }
        }
        if self.ranks.is_empty() || self.ranks.iter().any(|rank| rank.threads.is_empty()) {
            return Err("every rank needs at least one thread".to_string());
        }
        for (rank, spec) in self.ranks.iter().enumerate() {
            for (thread, schedule) in spec.threads.iter().enumerate() {
                if let Some(block) = schedule.blocks.iter().find(|block| **block >= self.blocks.len()) {
                    return Err(format!(
                        "rank {} thread {} schedules unknown block {}",
                        rank, thread, block
                    ));
                }
            }
        }
        Ok(())
    }

    fn register_index(&self) -> HashMap<&str, usize> {
        self.registers
            .iter()
            .enumerate()
            .map(|(index, register)| (register.name.as_str(), index))
            .collect()
    }

    /// Static view of instruction `index` with every candidate operand.
    pub fn static_instruction(&self, index: usize) -> StaticInstruction<'_> {
        let registers = self.register_index();
        let instruction = &self.instructions[index];
        let register_operand = |kind, name: &String| {
            let handle = registers[name.as_str()];
            Operand::register(kind, name, self.registers[handle].size, handle)
        };
        let mut operands: Vec<Operand> = instruction
            .reads
            .iter()
            .map(|name| register_operand(OperandKind::Source, name))
            .chain(
                instruction
                    .writes
                    .iter()
                    .map(|name| register_operand(OperandKind::Destination, name)),
            )
            .collect();
        if let Some(size) = instruction.memory_write {
            operands.push(Operand::register(
                OperandKind::MemoryDestination,
                "mem",
                size,
                index,
            ));
        }
        StaticInstruction {
            address: instruction.address,
            disassembly: &instruction.disassembly,
            category: &instruction.category,
            operands,
            has_fall_through: instruction.fall_through,
        }
    }

    /// Runs the static pass over every block.
    pub fn instrument(&self, instrumenter: &mut Instrumenter) -> Vec<InstrumentedBlock> {
        self.blocks
            .iter()
            .map(|block| {
                instrumenter.instrument_block(block.iter().map(|index| self.static_instruction(*index)))
            })
            .collect()
    }
}

fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}

fn mask(value: u64, size: u32) -> u64 {
    if size >= 8 {
        value
    } else {
        value & ((1u64 << (size * 8)) - 1)
    }
}

/// Architectural state of one victim thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadState {
    registers: Vec<u64>,
    sizes: Vec<u32>,
    /// Memory cells keyed by the index of the instruction writing them.
    memory: BTreeMap<usize, u64>,
}

impl ThreadState {
    fn new(program: &VictimProgram, rank: usize, thread: usize) -> Self {
        let seed = ((rank as u64 + 1) << 32) | (thread as u64 + 1);
        let sizes: Vec<u32> = program.registers.iter().map(|register| register.size).collect();
        Self {
            registers: sizes
                .iter()
                .enumerate()
                .map(|(index, size)| mask(mix(seed ^ index as u64), *size))
                .collect(),
            sizes,
            memory: BTreeMap::new(),
        }
    }

    fn execute(&mut self, program: &VictimProgram, registers: &HashMap<&str, usize>, index: usize) {
        let instruction = &program.instructions[index];
        let value = instruction
            .reads
            .iter()
            .fold(mix(instruction.address), |acc, name| {
                mix(acc.rotate_left(7) ^ self.registers[registers[name.as_str()]])
            });
        for name in &instruction.writes {
            let register = registers[name.as_str()];
            self.registers[register] = mask(value, self.sizes[register]);
        }
        if let Some(size) = instruction.memory_write {
            self.memory.insert(index, mask(value, size));
        }
    }

    /// Order dependent hash of the registers and memory.
    pub fn digest(&self) -> u64 {
        self.registers
            .iter()
            .chain(self.memory.values())
            .fold(0xcbf2_9ce4_8422_2325, |acc, value| mix(acc ^ value))
    }

    fn cell(&mut self, operand: &Operand) -> Result<&mut u64, String> {
        match operand.kind {
            OperandKind::Source | OperandKind::Destination => self
                .registers
                .get_mut(operand.handle)
                .ok_or_else(|| format!("no register with handle {}", operand.handle)),
            OperandKind::MemoryDestination => Ok(self.memory.entry(operand.handle).or_insert(0)),
        }
    }
}

impl OperandAccess for ThreadState {
    fn read(&mut self, operand: &Operand) -> Result<Vec<u8>, String> {
        let size = operand.size as usize;
        let value = *self.cell(operand)?;
        Ok(value.to_le_bytes()[..size.min(8)].to_vec())
    }

    fn write(&mut self, operand: &Operand, bytes: &[u8]) -> Result<(), String> {
        if bytes.len() > 8 {
            return Err(format!("{} byte write to {}", bytes.len(), operand.name));
        }
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        *self.cell(operand)? = u64::from_le_bytes(raw);
        Ok(())
    }
}

/// Final state of one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadDigest {
    pub thread: usize,
    pub digest: u64,
}

impl fmt::Display for ThreadDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread={}, digest=0x{:016x}", self.thread, self.digest)
    }
}

/// Result of one rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankOutcome {
    pub rank: Option<u32>,
    pub report: FinalReport,
    pub digests: Vec<ThreadDigest>,
}

/// Runner options shared by all ranks.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Session template. The rank is filled in per rank.
    pub session: SessionConfig,
    pub workdir: PathBuf,
    pub names: FileNames,
}

/// Executes a victim under fault injection sessions.
pub struct Runner<'a> {
    program: &'a VictimProgram,
    options: RunOptions,
    host: Arc<dyn Instrumentation>,
}

impl<'a> Runner<'a> {
    pub fn new(program: &'a VictimProgram, options: RunOptions, host: Arc<dyn Instrumentation>) -> Self {
        Self {
            program,
            options,
            host,
        }
    }

    fn check_shape(&self) -> Result<(), FaultError> {
        let variant = self.options.session.variant;
        if !variant.has_rank_scope() && self.program.ranks.len() > 1 {
            return Err(FaultError::Config(format!(
                "variant {} runs a single process, victim has {} ranks",
                variant,
                self.program.ranks.len()
            )));
        }
        if !variant.is_multithreaded() {
            if let Some(rank) = self.program.ranks.iter().position(|rank| rank.threads.len() > 1) {
                return Err(FaultError::Config(format!(
                    "variant {} is single threaded, rank {} has {} threads",
                    variant,
                    rank,
                    self.program.ranks[rank].threads.len()
                )));
            }
        }
        Ok(())
    }

    /// Opens one session per rank, instruments the victim and runs it.
    ///
    /// All sessions are opened before any thread starts, so every rank sees
    /// the input files as they were before the run.
    ///
    /// # Returns
    ///
    /// * `Result<Vec<RankOutcome>, FaultError>` - One outcome per rank, in rank order.
    pub fn run(&self) -> Result<Vec<RankOutcome>, FaultError> {
        self.check_shape()?;
        let variant = self.options.session.variant;
        let mut prepared = Vec::with_capacity(self.program.ranks.len());
        for rank in 0..self.program.ranks.len() {
            let rank_id = variant.has_rank_scope().then_some(rank as u32);
            let config = SessionConfig {
                rank: rank_id,
                ..self.options.session.clone()
            };
            let files = SessionFiles::new(&self.options.workdir, self.options.names.clone(), rank_id);
            let mut instrumenter = new_instrumenter(config.filter, &self.options.names);
            let session = Session::open(config, files, Arc::clone(&self.host))?;
            let blocks = self.program.instrument(&mut instrumenter);
            session.write_static_reports(&instrumenter)?;
            debug!(
                "Rank {}: {} fault sites in {} blocks",
                rank,
                instrumenter.sites(),
                blocks.len()
            );
            prepared.push((rank, session, blocks));
        }

        let results: Vec<Result<RankOutcome, FaultError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = prepared
                .iter()
                .map(|(rank, session, blocks)| {
                    scope.spawn(move || self.run_rank(*rank, session, blocks))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(FaultError::Host("rank thread panicked".to_string())))
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn run_rank(
        &self,
        rank: usize,
        session: &Session,
        blocks: &[InstrumentedBlock],
    ) -> Result<RankOutcome, FaultError> {
        let threads = &self.program.ranks[rank].threads;
        let stop = AtomicBool::new(false);
        let (sender, receiver) = unbounded();
        std::thread::scope(|scope| {
            for (thread, schedule) in threads.iter().enumerate() {
                let sender = sender.clone();
                let stop = &stop;
                scope.spawn(move || {
                    let result = self.run_thread(rank, thread, schedule, session, blocks, stop);
                    let failed = result.is_err();
                    let _ = sender.send(result);
                    if failed {
                        stop.store(true, Ordering::Release);
                    }
                });
            }
        });
        drop(sender);

        let mut digests = Vec::with_capacity(threads.len());
        let mut failure = None;
        for result in receiver.iter() {
            match result {
                Ok(Some(digest)) => digests.push(digest),
                Ok(None) => {}
                Err(e) => {
                    error!("Rank {}: {}", rank, e);
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        digests.sort_by_key(|digest: &ThreadDigest| digest.thread);
        let report = session.finalize()?;
        info!("Rank {} finished, {} events", rank, report.profile.total);
        Ok(RankOutcome {
            rank: session.config().rank,
            report,
            digests,
        })
    }

    fn run_thread(
        &self,
        rank: usize,
        thread: usize,
        schedule: &ThreadSpec,
        session: &Session,
        blocks: &[InstrumentedBlock],
        stop: &AtomicBool,
    ) -> Result<Option<ThreadDigest>, FaultError> {
        let registers = self.program.register_index();
        let mut state = ThreadState::new(self.program, rank, thread);
        for _ in 0..schedule.iterations {
            for &block in &schedule.blocks {
                if stop.load(Ordering::Acquire) {
                    debug!("Rank {} thread {} stopped after a failure in another thread", rank, thread);
                    return Ok(None);
                }
                let action = session.on_block(thread, blocks[block].eligible())?;
                for (position, &index) in self.program.blocks[block].iter().enumerate() {
                    state.execute(self.program, &registers, index);
                    if action != BlockAction::Refine {
                        continue;
                    }
                    if let Some(site) = blocks[block].site_at(position) {
                        session.on_instruction(thread, site, &mut state)?;
                    }
                }
            }
        }
        Ok(Some(ThreadDigest {
            thread,
            digest: state.digest(),
        }))
    }
}

fn new_instrumenter(filter: EligibilityFilter, names: &FileNames) -> Instrumenter {
    let mut instrumenter = Instrumenter::new(filter);
    if names.catalogue.is_some() {
        instrumenter = instrumenter.with_catalogue();
    }
    if names.categories.is_some() {
        instrumenter = instrumenter.with_categories();
    }
    instrumenter
}
