use crate::error::FaultError;
use crate::injection::operand::EligibilityFilter;
use crate::injection::{DetachPolicy, Granularity, SessionConfig, Variant};
use crate::persistence::FileNames;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Configuration structure that can be loaded from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_variant")]
    pub variant: Variant,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub detach: DetachPolicy,
    #[serde(default)]
    pub filter: EligibilityFilter,
    #[serde(default)]
    pub files: FileNames,
    #[serde(default = "Config::default_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "Config::default_entropy")]
    pub entropy: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "Config::default_max_threads")]
    pub max_threads: usize,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default = "Config::default_rank_env")]
    pub rank_env: String,
    #[serde(default)]
    pub victim: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            variant: Self::default_variant(),
            granularity: Granularity::default(),
            detach: DetachPolicy::default(),
            filter: EligibilityFilter::default(),
            files: FileNames::default(),
            workdir: Self::default_workdir(),
            entropy: Self::default_entropy(),
            seed: None,
            max_threads: Self::default_max_threads(),
            rank: None,
            rank_env: Self::default_rank_env(),
            victim: None,
        }
    }
}

impl Config {
    // Keep defaults in sync with CLI defaults
    fn default_variant() -> Variant {
        Variant::Serial
    }

    fn default_workdir() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_entropy() -> PathBuf {
        PathBuf::from("/dev/urandom")
    }

    fn default_max_threads() -> usize {
        256
    }

    fn default_rank_env() -> String {
        "OMPI_COMM_WORLD_RANK".to_string()
    }

    /// Load configuration from JSON5 file
    pub fn from_file(path: &PathBuf) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        json5::from_str(&content).map_err(|e| format!("Failed to parse JSON5 config: {}", e))
    }

    /// Create Config from command line arguments
    pub fn from_args(args: &Args) -> Self {
        let mut config = Self::default();
        config.override_with_args(args);
        config
    }

    /// Override config values with command line arguments
    pub fn override_with_args(&mut self, args: &Args) {
        // Enumerations and paths only when given on the command line
        if let Some(variant) = args.variant {
            self.variant = variant;
        }
        if let Some(granularity) = args.granularity {
            self.granularity = granularity;
        }
        if let Some(detach) = args.detach {
            self.detach = detach;
        }
        if let Some(workdir) = &args.workdir {
            self.workdir = workdir.clone();
        }
        if args.victim.is_some() {
            self.victim = args.victim.clone();
        }
        if args.seed.is_some() {
            self.seed = args.seed;
        }
        if args.rank.is_some() {
            self.rank = args.rank;
        }
        if let Some(max_threads) = args.max_threads {
            self.max_threads = max_threads;
        }

        // Only override boolean flags if they're true (explicitly set by user)
        if args.src_regs {
            self.filter.src_regs = true;
        }
        if args.dst_mem {
            self.filter.dst_mem = true;
        }
        if args.no_dst_regs {
            self.filter.dst_regs = false;
        }
        if args.catalogue && self.files.catalogue.is_none() {
            self.files.catalogue = Some("fi-catalogue.txt".to_string());
        }
        if args.categories && self.files.categories.is_none() {
            self.files.categories = Some("fi-categories.txt".to_string());
        }
    }

    /// Rank of this process: the configured one, else the rank environment variable.
    ///
    /// # Returns
    ///
    /// * `Result<Option<u32>, FaultError>` - `None` for variants without ranks.
    pub fn resolve_rank(&self) -> Result<Option<u32>, FaultError> {
        if !self.variant.has_rank_scope() {
            return Ok(None);
        }
        if let Some(rank) = self.rank {
            return Ok(Some(rank));
        }
        let value = std::env::var(&self.rank_env).map_err(|_| {
            FaultError::Config(format!(
                "variant {} needs a rank, {} is not set",
                self.variant, self.rank_env
            ))
        })?;
        value.trim().parse().map(Some).map_err(|_| {
            FaultError::Config(format!("{}={} is not a rank", self.rank_env, value))
        })
    }

    /// Session parameters. The rank is left to the caller.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            variant: self.variant,
            granularity: self.granularity,
            detach: self.detach,
            filter: self.filter,
            max_threads: self.max_threads,
            rank: None,
            seed: self.seed,
            entropy: self.entropy.clone(),
        }
    }
}

/// Command-line arguments structure for the fault injector.
///
/// Two uses: running a victim under a fault injection session (`--victim`),
/// or planning a campaign from a profiling record (`--plan`).
///
/// # Fields
///
/// * `config` - Load configuration from JSON5 file.
/// * `victim` - Victim program description to execute.
/// * `workdir` - Directory holding the session files.
/// * `variant` - Concurrency model of the victim.
/// * `granularity` - Counting granularity.
/// * `detach` - Instrumentation policy after the injection.
/// * `src_regs` - Source registers are fault targets.
/// * `dst_mem` - Memory destinations are fault targets.
/// * `no_dst_regs` - Destination registers are not fault targets.
/// * `seed` - Fixed generator seed instead of the entropy source.
/// * `catalogue` - Write the instruction catalogue.
/// * `categories` - Write the instruction category summary.
/// * `max_threads` - Capacity of the per-thread counters.
/// * `rank` - Rank for planned targets.
/// * `plan` - Number of targets to generate.
/// * `profile` - Profiling record the targets are drawn from.
/// * `outdir` - Directory receiving one sub-directory per trial.
/// * `target_threads` - Threads the planned targets are restricted to.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Load configuration from JSON5 file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Victim program description (JSON5)
    #[arg(short, long)]
    pub victim: Option<PathBuf>,

    /// Directory holding target, injection and profiling files
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Concurrency model of the victim
    #[arg(long, value_enum)]
    pub variant: Option<Variant>,

    /// Counting granularity
    #[arg(short, long, value_enum)]
    pub granularity: Option<Granularity>,

    /// Instrumentation after the injection: off, soft or hard (unsafe for register faults)
    #[arg(short, long, value_enum)]
    pub detach: Option<DetachPolicy>,

    /// Include source registers in the fault targets
    #[arg(long, default_value_t = false)]
    pub src_regs: bool,

    /// Include memory destinations in the fault targets (experimental)
    #[arg(long, default_value_t = false)]
    pub dst_mem: bool,

    /// Exclude destination registers from the fault targets
    #[arg(long, default_value_t = false)]
    pub no_dst_regs: bool,

    /// Fixed seed for the random generator, replaces the entropy source
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Write the catalogue of instrumented instructions
    #[arg(long, default_value_t = false)]
    pub catalogue: bool,

    /// Write the mnemonics of instrumented instructions per category
    #[arg(long, default_value_t = false)]
    pub categories: bool,

    /// Capacity of the per-thread counters
    #[arg(long)]
    pub max_threads: Option<usize>,

    /// Rank written into planned targets
    #[arg(short, long)]
    pub rank: Option<u32>,

    /// Generate this many target files instead of running a victim
    #[arg(long, requires_all = ["profile", "outdir"])]
    pub plan: Option<usize>,

    /// Profiling record the planned targets are drawn from
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Output directory of the plan, one sub-directory per trial
    #[arg(short, long)]
    pub outdir: Option<PathBuf>,

    /// Restrict planned targets to these threads
    ///   --target-threads 0 3
    #[arg(long, num_args = 1.., verbatim_doc_comment)]
    pub target_threads: Vec<usize>,
}
