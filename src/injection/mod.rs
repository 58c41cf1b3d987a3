//! The fault injection session.
//!
//! A [`Session`] owns the occurrence counters, the target selector, the
//! random generator and the write-once injection record of one process. The
//! host calls [`Session::on_block`] at every basic block entry and
//! [`Session::on_instruction`] right after every fault site of a refined
//! block executed. Both callbacks may run concurrently from all threads of
//! the process.

pub mod bitflip;
pub mod counter;
pub mod host;
pub mod instrument;
pub mod operand;
pub mod selector;

use crate::error::FaultError;
use crate::persistence::{write_atomic, Mode, SessionFiles};
use crate::record::descriptor::{InjectionDescriptor, Scope};
use crate::record::profile::ProfileRecord;
use crate::rng::Mt64;
use bitflip::{choose_bit, flip_bit};
use counter::{CounterLayout, OccurrenceCounters};
use host::{Instrumentation, OperandAccess};
use instrument::{InstrumentedInstruction, Instrumenter};
use log::{debug, info, warn};
use operand::{choose_operand, EligibilityFilter};
use selector::{Phase, TargetSelector};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

/// Concurrency model of the victim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Single thread, single counter.
    Serial,
    /// Per-thread counters, targets name a thread.
    Threaded,
    /// One single-threaded process per rank, targets name a rank.
    Mpi,
    /// Per-thread counters in every rank, targets name a rank and a thread.
    MpiThreaded,
    /// One counter shared by all threads.
    SharedAtomic,
}

impl Variant {
    pub fn has_rank_scope(&self) -> bool {
        matches!(self, Variant::Mpi | Variant::MpiThreaded)
    }

    pub fn has_thread_scope(&self) -> bool {
        matches!(self, Variant::Threaded | Variant::MpiThreaded)
    }

    pub fn is_multithreaded(&self) -> bool {
        matches!(
            self,
            Variant::Threaded | Variant::MpiThreaded | Variant::SharedAtomic
        )
    }

    pub fn layout(&self) -> CounterLayout {
        match self {
            Variant::SharedAtomic => CounterLayout::Shared,
            _ => CounterLayout::PerUnit,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variant::Serial => "serial",
            Variant::Threaded => "threaded",
            Variant::Mpi => "mpi",
            Variant::MpiThreaded => "mpi-threaded",
            Variant::SharedAtomic => "shared-atomic",
        };
        write!(f, "{}", name)
    }
}

/// Counting granularity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Granularity {
    /// One callback per block, refined per instruction only around the target.
    #[default]
    Block,
    /// One callback per fault site.
    Instruction,
}

/// What happens to the instrumentation once the fault is injected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DetachPolicy {
    /// Keep counting, ignore further events.
    #[default]
    Off,
    /// Callbacks return immediately, counters freeze.
    Soft,
    /// Soft, plus detaching the host. Only honored by hosts that keep the
    /// mutated register context across the detach.
    Hard,
}

/// Per-block decision returned to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockAction {
    /// The block was counted as a whole.
    Counted,
    /// Report every fault site of this block through `on_instruction`.
    Refine,
    /// Instrumentation is disabled, nothing was counted.
    Detached,
}

/// Outcome of one fault site callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Counted, target not reached.
    Counted,
    /// This event was the target and the fault is in place.
    Injected(InjectionDescriptor),
    /// Counted, but the session already left the counting phase.
    Ignored,
    /// Instrumentation is disabled, nothing was counted.
    Detached,
    /// The instruction has no eligible operand and is not an event.
    Skipped,
}

/// Static parameters of a session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub variant: Variant,
    pub granularity: Granularity,
    pub detach: DetachPolicy,
    pub filter: EligibilityFilter,
    /// Capacity of the per-thread counters.
    pub max_threads: usize,
    /// Rank of this process in ranked variants.
    pub rank: Option<u32>,
    /// Fixed generator seed, replaces the entropy source.
    pub seed: Option<u64>,
    pub entropy: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Serial,
            granularity: Granularity::default(),
            detach: DetachPolicy::default(),
            filter: EligibilityFilter::default(),
            max_threads: 256,
            rank: None,
            seed: None,
            entropy: PathBuf::from("/dev/urandom"),
        }
    }
}

/// Summary returned by [`Session::finalize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalReport {
    pub mode: Mode,
    pub profile: ProfileRecord,
    pub injection: Option<InjectionDescriptor>,
    pub detached: bool,
    /// The target named a unit of this process, which ended before reaching it.
    pub target_missed: bool,
    /// Profiling file written during finalization, if any.
    pub profile_file: Option<PathBuf>,
}

impl FinalReport {
    pub fn injected(&self) -> bool {
        self.injection.is_some()
    }
}

pub struct Session {
    config: SessionConfig,
    mode: Mode,
    detach: DetachPolicy,
    counters: OccurrenceCounters,
    selector: TargetSelector,
    /// Only locked by the single event that wins the armed transition.
    rng: Mutex<Option<Mt64>>,
    injection: OnceLock<InjectionDescriptor>,
    files: SessionFiles,
    host: Arc<dyn Instrumentation>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("variant", &self.config.variant)
            .field("mode", &self.mode)
            .field("phase", &self.selector.phase())
            .finish()
    }
}

impl Session {
    /// Opens a session, choosing its mode from the files present.
    ///
    /// # Arguments
    ///
    /// * `config` - Static session parameters.
    /// * `files` - Location of the session files.
    /// * `host` - Instrumentation host, used for hard detach.
    ///
    /// # Returns
    ///
    /// * `Result<Self, FaultError>` - The session or a configuration error.
    pub fn open(
        config: SessionConfig,
        files: SessionFiles,
        host: Arc<dyn Instrumentation>,
    ) -> Result<Self, FaultError> {
        let mode = files.discover(config.variant)?;
        Self::with_mode(config, mode, files, host)
    }

    /// Creates a session in an explicit mode.
    pub fn with_mode(
        config: SessionConfig,
        mode: Mode,
        files: SessionFiles,
        host: Arc<dyn Instrumentation>,
    ) -> Result<Self, FaultError> {
        let variant = config.variant;
        if variant.has_rank_scope() != config.rank.is_some() {
            return Err(FaultError::Config(format!(
                "variant {} {} a rank",
                variant,
                if variant.has_rank_scope() {
                    "requires"
                } else {
                    "does not take"
                }
            )));
        }
        if config.max_threads == 0 {
            return Err(FaultError::Config(
                "max_threads must be greater than zero".to_string(),
            ));
        }
        let target = mode.target();
        if let Some(thread) = target.and_then(|target| target.scope.thread) {
            if thread as usize >= config.max_threads {
                return Err(FaultError::UnitOutOfRange {
                    unit: thread as usize,
                    capacity: config.max_threads,
                });
            }
        }

        let rng = match &mode {
            Mode::TargetRandom(_) => Some(match config.seed {
                Some(seed) => {
                    warn!("Fixed seed {} replaces the entropy source", seed);
                    Mt64::new(seed)
                }
                None => {
                    let (rng, seed) = Mt64::from_entropy_source(&config.entropy)?;
                    debug!("Generator seeded with {}", seed);
                    rng
                }
            }),
            _ => None,
        };

        let detach = match config.detach {
            DetachPolicy::Hard if !host.preserves_context_on_detach() => {
                warn!("Host may drop the injected register value on detach, using soft detach");
                DetachPolicy::Soft
            }
            DetachPolicy::Hard => {
                warn!("Hard detach enabled");
                DetachPolicy::Hard
            }
            policy => policy,
        };
        if config.filter.dst_mem {
            warn!("Memory destination operands are experimental");
        }

        info!(
            "Session {} ({}, {:?} granularity): {}",
            variant,
            config
                .rank
                .map_or("no rank".to_string(), |rank| format!("rank {}", rank)),
            config.granularity,
            mode
        );

        let layout = variant.layout();
        let capacity = if variant.is_multithreaded() {
            config.max_threads
        } else {
            1
        };
        Ok(Self {
            counters: OccurrenceCounters::new(layout, capacity),
            selector: TargetSelector::new(target, config.rank, layout),
            rng: Mutex::new(rng),
            injection: OnceLock::new(),
            detach,
            mode,
            files,
            host,
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn phase(&self) -> Phase {
        self.selector.phase()
    }

    /// Detach policy in effect after downgrades.
    pub fn detach_policy(&self) -> DetachPolicy {
        self.detach
    }

    /// Current count of `thread`.
    pub fn count(&self, thread: usize) -> Result<u64, FaultError> {
        self.counters.get(thread)
    }

    #[inline]
    fn disabled(&self) -> bool {
        matches!(self.selector.phase(), Phase::Detached | Phase::Done)
    }

    /// Block entry callback.
    ///
    /// # Arguments
    ///
    /// * `thread` - Thread executing the block.
    /// * `eligible` - Number of fault sites in the block.
    ///
    /// # Returns
    ///
    /// * `Result<BlockAction, FaultError>` - Whether the host must report the
    ///   sites of this block one by one.
    #[inline]
    pub fn on_block(&self, thread: usize, eligible: u64) -> Result<BlockAction, FaultError> {
        if self.disabled() {
            return Ok(BlockAction::Detached);
        }
        if eligible == 0 {
            return Ok(BlockAction::Counted);
        }
        if self.config.granularity == Granularity::Instruction {
            return Ok(BlockAction::Refine);
        }
        let before = match self.counters.layout() {
            CounterLayout::PerUnit => self.counters.get(thread)?,
            CounterLayout::Shared => 0,
        };
        if self.selector.contains_target(thread, before, eligible)? {
            return Ok(BlockAction::Refine);
        }
        self.counters.add(thread, eligible)?;
        Ok(BlockAction::Counted)
    }

    /// Fault site callback, invoked right after the site executed.
    ///
    /// # Arguments
    ///
    /// * `thread` - Thread executing the site.
    /// * `site` - Instrumented instruction.
    /// * `access` - Operand storage of the thread, used if this event is the target.
    ///
    /// # Returns
    ///
    /// * `Result<Observation, FaultError>` - What the event amounted to.
    #[inline]
    pub fn on_instruction(
        &self,
        thread: usize,
        site: &InstrumentedInstruction,
        access: &mut dyn OperandAccess,
    ) -> Result<Observation, FaultError> {
        if site.operands.is_empty() {
            return Ok(Observation::Skipped);
        }
        if self.disabled() {
            return Ok(Observation::Detached);
        }
        let count = self.counters.increment(thread)?;
        if self.selector.try_arm(thread, count)? {
            return self.inject(thread, count, site, access);
        }
        match self.selector.phase() {
            Phase::Counting => Ok(Observation::Counted),
            _ => Ok(Observation::Ignored),
        }
    }

    fn scope_of(&self, thread: usize) -> Scope {
        let variant = self.config.variant;
        Scope {
            rank: self.config.rank.filter(|_| variant.has_rank_scope()),
            thread: variant.has_thread_scope().then_some(thread as u32),
        }
    }

    fn inject(
        &self,
        thread: usize,
        count: u64,
        site: &InstrumentedInstruction,
        access: &mut dyn OperandAccess,
    ) -> Result<Observation, FaultError> {
        info!(
            "Target reached: {} occurrence {} at 0x{:x} '{}'",
            self.scope_of(thread),
            count,
            site.address,
            site.disassembly
        );
        debug!("Eligible operands: {:?}", site.operands);
        let replay = match &self.mode {
            Mode::Reproduce(recorded) => Some(recorded),
            _ => None,
        };
        if let Some(recorded) = replay.and_then(|recorded| recorded.static_index) {
            if recorded != site.static_index {
                return Err(FaultError::StaticIndexMismatch {
                    recorded,
                    actual: site.static_index,
                });
            }
        }

        let (operand_index, bit) = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| FaultError::Host("generator lock poisoned".to_string()))?;
            let operand_index = choose_operand(&site.operands, replay, rng.as_mut(), site.address)?;
            let bit = choose_bit(site.operands[operand_index].size, replay, rng.as_mut())?;
            (operand_index, bit)
        };
        let operand = &site.operands[operand_index];

        let descriptor = InjectionDescriptor {
            scope: self.scope_of(thread),
            occurrence: count,
            operand_index,
            operand_size: operand.size,
            bit,
            static_index: Some(site.static_index),
            register: Some(operand.name.clone()),
            address: Some(site.address),
        };
        self.injection
            .set(descriptor.clone())
            .map_err(|_| FaultError::DoubleInjection)?;
        if let Mode::TargetRandom(_) = self.mode {
            write_atomic(&self.files.injection_path(), &format!("{}\n", descriptor))?;
        }

        let mut bytes = access.read(operand).map_err(FaultError::Host)?;
        if bytes.len() != operand.size as usize {
            return Err(FaultError::Host(format!(
                "operand {} read {} bytes, expected {}",
                operand.name,
                bytes.len(),
                operand.size
            )));
        }
        flip_bit(&mut bytes, bit)?;
        access.write(operand, &bytes).map_err(FaultError::Host)?;
        self.selector.set_phase(Phase::Injected);
        info!("Injected fault: {}", descriptor);

        match self.detach {
            DetachPolicy::Off => {}
            DetachPolicy::Soft => {
                self.selector.set_phase(Phase::Detached);
                debug!("Instrumentation disabled");
            }
            DetachPolicy::Hard => {
                self.selector.set_phase(Phase::Detached);
                self.host.detach().map_err(FaultError::Host)?;
                debug!("Host detached");
            }
        }
        Ok(Observation::Injected(descriptor))
    }

    /// Count the target refers to, if this process holds it.
    fn scoped_count(&self, counts: &[u64]) -> Option<u64> {
        let target = self.selector.target()?;
        match self.counters.layout() {
            CounterLayout::Shared => Some(counts.iter().sum()),
            CounterLayout::PerUnit => {
                let thread = target.scope.thread.unwrap_or_default() as usize;
                if !target.scope.contains(self.config.rank, thread) {
                    return None;
                }
                Some(counts.get(thread).copied().unwrap_or_default())
            }
        }
    }

    /// Ends the session once every unit is quiescent.
    ///
    /// Writes the profiling record in profile mode, and in the other modes if
    /// the target was never reached.
    pub fn finalize(&self) -> Result<FinalReport, FaultError> {
        let counts = self.counters.snapshot();
        let profile = if self.config.variant.has_thread_scope() {
            ProfileRecord::per_thread(&counts)
        } else {
            ProfileRecord::single(counts.iter().sum())
        };
        let injection = self.injection.get().cloned();
        let mut target_missed = false;
        if injection.is_none() {
            let scoped = self.scoped_count(&counts);
            self.selector.check_final(scoped)?;
            if let (Some(target), Some(count)) = (self.mode.target(), scoped) {
                warn!(
                    "Target {} not reached after {} events, no fault injected",
                    target, count
                );
                target_missed = true;
            }
        }

        let mut profile_file = None;
        if self.mode == Mode::Profile || injection.is_none() {
            let path = self.files.profile_path();
            write_atomic(&path, &profile.to_string())?;
            info!("Profile written to {}", path.display());
            profile_file = Some(path);
        }
        let detached = self.selector.phase() == Phase::Detached;
        self.selector.set_phase(Phase::Done);
        info!(
            "Session finished: {} events, {}",
            profile.total,
            match &injection {
                Some(descriptor) => format!("fault {}", descriptor),
                None => "no fault".to_string(),
            }
        );
        Ok(FinalReport {
            mode: self.mode.clone(),
            profile,
            injection,
            detached,
            target_missed,
            profile_file,
        })
    }

    /// Writes the instruction catalogue and category summary, if configured.
    pub fn write_static_reports(&self, instrumenter: &Instrumenter) -> Result<(), FaultError> {
        if let (Some(path), Some(catalogue)) =
            (self.files.catalogue_path(), instrumenter.catalogue())
        {
            write_atomic(&path, &catalogue.to_string())?;
            info!("Catalogue of {} sites written to {}", catalogue.len(), path.display());
        }
        if let (Some(path), Some(categories)) =
            (self.files.categories_path(), instrumenter.categories())
        {
            write_atomic(&path, &categories.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injection::host::InlineHost;
    use crate::injection::operand::{Operand, OperandKind};
    use crate::persistence::FileNames;
    use crate::record::descriptor::TargetDescriptor;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Registers(HashMap<String, u64>);

    impl OperandAccess for Registers {
        fn read(&mut self, operand: &Operand) -> Result<Vec<u8>, String> {
            let value = self.0.get(&operand.name).copied().unwrap_or_default();
            Ok(value.to_le_bytes()[..operand.size as usize].to_vec())
        }

        fn write(&mut self, operand: &Operand, bytes: &[u8]) -> Result<(), String> {
            let mut raw = [0u8; 8];
            raw[..bytes.len()].copy_from_slice(bytes);
            self.0.insert(operand.name.clone(), u64::from_le_bytes(raw));
            Ok(())
        }
    }

    /// Host keeping register context across detach, counting the detach calls.
    #[derive(Default)]
    struct CountingHost {
        calls: AtomicUsize,
        refuse: bool,
    }

    impl Instrumentation for CountingHost {
        fn detach(&self) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err("detach refused".to_string());
            }
            Ok(())
        }

        fn preserves_context_on_detach(&self) -> bool {
            true
        }
    }

    fn site(static_index: u64) -> InstrumentedInstruction {
        InstrumentedInstruction {
            static_index,
            address: 0x1000 + static_index * 4,
            disassembly: "add eax, 1".to_string(),
            operands: vec![Operand::register(OperandKind::Destination, "eax", 4, 0)],
        }
    }

    fn session(dir: &Path, config: SessionConfig, mode: Mode) -> Session {
        let files = SessionFiles::new(dir, FileNames::default(), config.rank);
        Session::with_mode(config, mode, files, Arc::new(InlineHost)).unwrap()
    }

    fn serial_target(occurrence: u64) -> Mode {
        Mode::TargetRandom(TargetDescriptor {
            scope: Scope::serial(),
            occurrence,
        })
    }

    fn seeded() -> SessionConfig {
        SessionConfig {
            seed: Some(7),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn profile_counts_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), SessionConfig::default(), Mode::Profile);
        assert_eq!(session.on_block(0, 4).unwrap(), BlockAction::Counted);
        assert_eq!(session.on_block(0, 0).unwrap(), BlockAction::Counted);
        assert_eq!(session.on_block(0, 3).unwrap(), BlockAction::Counted);
        let report = session.finalize().unwrap();
        assert_eq!(report.profile, ProfileRecord::single(7));
        assert!(!report.injected());
        assert_eq!(
            fs::read_to_string(dir.path().join("fi-inscount.txt")).unwrap(),
            "fi_index=7\n"
        );
    }

    #[test]
    fn random_injection_hits_target() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), seeded(), serial_target(6));
        let mut registers = Registers::default();
        assert_eq!(session.on_block(0, 4).unwrap(), BlockAction::Counted);
        assert_eq!(session.on_block(0, 4).unwrap(), BlockAction::Refine);
        let mut injected = None;
        for index in 0..4 {
            match session.on_instruction(0, &site(index + 1), &mut registers).unwrap() {
                Observation::Injected(descriptor) => injected = Some(descriptor),
                Observation::Counted | Observation::Ignored => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        let descriptor = injected.unwrap();
        assert_eq!(descriptor.occurrence, 6);
        assert_eq!(descriptor.operand_index, 0);
        assert_eq!(descriptor.operand_size, 4);
        assert_eq!(descriptor.static_index, Some(2));
        assert_eq!(registers.0["eax"], 1 << descriptor.bit);

        let written = fs::read_to_string(dir.path().join("fi-inject.txt")).unwrap();
        assert_eq!(written, format!("{}\n", descriptor));

        let report = session.finalize().unwrap();
        assert_eq!(report.profile.total, 8);
        assert_eq!(report.profile_file, None);
        assert_eq!(session.phase(), Phase::Done);
    }

    #[test]
    fn soft_detach_freezes_counters() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            granularity: Granularity::Instruction,
            detach: DetachPolicy::Soft,
            ..seeded()
        };
        let session = session(dir.path(), config, serial_target(2));
        let mut registers = Registers::default();
        assert_eq!(session.on_block(0, 1).unwrap(), BlockAction::Refine);
        session.on_instruction(0, &site(1), &mut registers).unwrap();
        assert!(matches!(
            session.on_instruction(0, &site(1), &mut registers).unwrap(),
            Observation::Injected(_)
        ));
        assert_eq!(session.on_block(0, 5).unwrap(), BlockAction::Detached);
        assert_eq!(
            session.on_instruction(0, &site(1), &mut registers).unwrap(),
            Observation::Detached
        );
        let report = session.finalize().unwrap();
        assert!(report.detached);
        assert_eq!(report.profile.total, 2);
    }

    #[test]
    fn hard_detach_needs_a_capable_host() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            detach: DetachPolicy::Hard,
            ..SessionConfig::default()
        };
        let downgraded = session(dir.path(), config.clone(), Mode::Profile);
        assert_eq!(downgraded.detach_policy(), DetachPolicy::Soft);

        let files = SessionFiles::new(dir.path(), FileNames::default(), None);
        let hard = Session::with_mode(config, Mode::Profile, files, Arc::new(CountingHost::default())).unwrap();
        assert_eq!(hard.detach_policy(), DetachPolicy::Hard);
    }

    fn hard_detach_session(dir: &Path, host: Arc<CountingHost>, occurrence: u64) -> Session {
        let config = SessionConfig {
            granularity: Granularity::Instruction,
            detach: DetachPolicy::Hard,
            ..seeded()
        };
        let files = SessionFiles::new(dir, FileNames::default(), None);
        Session::with_mode(config, serial_target(occurrence), files, host).unwrap()
    }

    #[test]
    fn hard_detach_keeps_the_fault() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(CountingHost::default());
        let session = hard_detach_session(dir.path(), Arc::clone(&host), 2);
        let mut registers = Registers::default();
        assert_eq!(
            session.on_instruction(0, &site(1), &mut registers).unwrap(),
            Observation::Counted
        );
        let descriptor = match session.on_instruction(0, &site(2), &mut registers).unwrap() {
            Observation::Injected(descriptor) => descriptor,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.phase(), Phase::Detached);
        assert_eq!(session.on_block(0, 3).unwrap(), BlockAction::Detached);
        assert_eq!(
            session.on_instruction(0, &site(3), &mut registers).unwrap(),
            Observation::Detached
        );
        assert_eq!(registers.0["eax"], 1 << descriptor.bit);

        let report = session.finalize().unwrap();
        assert!(report.detached);
        assert_eq!(report.profile.total, 2);
        assert_eq!(report.injection, Some(descriptor));
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refused_hard_detach_is_a_host_error() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(CountingHost {
            refuse: true,
            ..CountingHost::default()
        });
        let session = hard_detach_session(dir.path(), Arc::clone(&host), 1);
        let mut registers = Registers::default();
        let err = session
            .on_instruction(0, &site(1), &mut registers)
            .unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Host);
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
        // The fault is in place and recorded before the host is asked to detach
        assert_eq!(registers.0["eax"].count_ones(), 1);
        assert!(dir.path().join("fi-inject.txt").exists());
        assert_eq!(
            session.on_instruction(0, &site(2), &mut registers).unwrap(),
            Observation::Detached
        );
    }

    #[test]
    fn detach_off_keeps_counting() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), seeded(), serial_target(1));
        let mut registers = Registers::default();
        assert_eq!(session.on_block(0, 3).unwrap(), BlockAction::Refine);
        for _ in 0..3 {
            session.on_instruction(0, &site(1), &mut registers).unwrap();
        }
        assert_eq!(session.on_block(0, 3).unwrap(), BlockAction::Counted);
        assert_eq!(
            session.on_instruction(0, &site(1), &mut registers).unwrap(),
            Observation::Ignored
        );
        assert_eq!(session.finalize().unwrap().profile.total, 7);
    }

    #[test]
    fn zero_operand_sites_are_not_events() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), seeded(), serial_target(1));
        let mut empty = site(1);
        empty.operands.clear();
        assert_eq!(
            session
                .on_instruction(0, &empty, &mut Registers::default())
                .unwrap(),
            Observation::Skipped
        );
        assert_eq!(session.count(0).unwrap(), 0);
        assert_eq!(session.phase(), Phase::Counting);
    }

    #[test]
    fn replay_rejects_other_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let recorded = InjectionDescriptor {
            scope: Scope::serial(),
            occurrence: 1,
            operand_index: 0,
            operand_size: 4,
            bit: 3,
            static_index: Some(9),
            register: None,
            address: None,
        };
        let session = session(dir.path(), SessionConfig::default(), Mode::Reproduce(recorded));
        let mut registers = Registers::default();
        assert!(matches!(
            session.on_instruction(0, &site(1), &mut registers),
            Err(FaultError::StaticIndexMismatch {
                recorded: 9,
                actual: 1
            })
        ));
        assert!(registers.0.is_empty());
    }

    #[test]
    fn missed_target_is_reported_by_its_unit_only() {
        let config = SessionConfig {
            variant: Variant::Threaded,
            ..seeded()
        };
        let dir = tempfile::tempdir().unwrap();
        let named = session(
            dir.path(),
            config,
            Mode::TargetRandom(TargetDescriptor {
                scope: Scope::thread(1),
                occurrence: 10,
            }),
        );
        named.on_block(0, 4).unwrap();
        named.on_block(1, 3).unwrap();
        let report = named.finalize().unwrap();
        assert!(report.target_missed);
        assert!(report.profile_file.is_some());

        let other_dir = tempfile::tempdir().unwrap();
        let other_rank = SessionConfig {
            variant: Variant::Mpi,
            rank: Some(0),
            ..seeded()
        };
        let unnamed = session(
            other_dir.path(),
            other_rank,
            Mode::TargetRandom(TargetDescriptor {
                scope: Scope::rank(2),
                occurrence: 10,
            }),
        );
        unnamed.on_block(0, 4).unwrap();
        let report = unnamed.finalize().unwrap();
        assert!(!report.target_missed);
        assert!(!report.injected());
        assert!(other_dir.path().join("0.fi-inscount.txt").exists());

        let profile_dir = tempfile::tempdir().unwrap();
        let profile = session(profile_dir.path(), SessionConfig::default(), Mode::Profile);
        profile.on_block(0, 2).unwrap();
        assert!(!profile.finalize().unwrap().target_missed);
    }

    #[test]
    fn rank_is_required_for_ranked_variants() {
        let dir = tempfile::tempdir().unwrap();
        let files = SessionFiles::new(dir.path(), FileNames::default(), None);
        let config = SessionConfig {
            variant: Variant::Mpi,
            ..SessionConfig::default()
        };
        assert!(matches!(
            Session::with_mode(config, Mode::Profile, files, Arc::new(InlineHost)),
            Err(FaultError::Config(_))
        ));
    }

    #[test]
    fn target_thread_beyond_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let files = SessionFiles::new(dir.path(), FileNames::default(), None);
        let config = SessionConfig {
            variant: Variant::Threaded,
            max_threads: 4,
            seed: Some(1),
            ..SessionConfig::default()
        };
        let mode = Mode::TargetRandom(TargetDescriptor {
            scope: Scope::thread(4),
            occurrence: 1,
        });
        assert!(matches!(
            Session::with_mode(config, mode, files, Arc::new(InlineHost)),
            Err(FaultError::UnitOutOfRange { unit: 4, .. })
        ));
    }

    #[test]
    fn missing_entropy_aborts_before_counting() {
        let dir = tempfile::tempdir().unwrap();
        let files = SessionFiles::new(dir.path(), FileNames::default(), None);
        let config = SessionConfig {
            entropy: dir.path().join("no-such-device"),
            ..SessionConfig::default()
        };
        assert!(matches!(
            Session::with_mode(config, serial_target(1), files, Arc::new(InlineHost)),
            Err(FaultError::Entropy { .. })
        ));
    }
}
