use clap::Parser;
use colored::Colorize;
use log::error;
use std::path::PathBuf;
use std::sync::Arc;

use fault_injector::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Program to inject single bit faults into replayable victim programs
///
fn main() -> Result<(), String> {
    // Get parameter from command line
    let args = Args::parse();
    env_logger::init(); // Switch on with: RUST_LOG=debug cargo run

    // Load configuration from file if provided, otherwise use CLI args
    let config = match &args.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.override_with_args(&args);
            config
        }
        None => Config::from_args(&args),
    };

    println!("--- Fault injector: {GIT_VERSION} ---\n");

    let result = match args.plan {
        Some(samples) => plan(&config, &args, samples),
        None => run(&config),
    };
    result.map_err(|e| {
        error!("{}", e);
        e.to_string()
    })
}

/// Generates target files from a profiling record.
fn plan(config: &Config, args: &Args, samples: usize) -> Result<(), FaultError> {
    let profile_path = args
        .profile
        .clone()
        .ok_or_else(|| FaultError::Config("--plan needs --profile".to_string()))?;
    let outdir = args
        .outdir
        .clone()
        .ok_or_else(|| FaultError::Config("--plan needs --outdir".to_string()))?;
    let content =
        std::fs::read_to_string(&profile_path).map_err(|e| FaultError::Io {
            path: profile_path.clone(),
            source: e,
        })?;
    let profile = ProfileRecord::parse(&content)
        .map_err(|reason| FaultError::MalformedRecord {
            file: profile_path.clone(),
            reason,
        })?;

    let mut rng = match config.seed {
        Some(seed) => Mt64::new(seed),
        None => Mt64::from_entropy_source(&config.entropy)?.0,
    };
    let targets = plan_targets(
        &profile,
        samples,
        &args.target_threads,
        config.resolve_rank()?,
        &mut rng,
    )?;
    let summary = write_plan(&outdir, &config.files.target, &targets)?;
    println!(
        "{} target files written to {}, {} existing kept",
        summary.written.to_string().green(),
        outdir.display(),
        summary.kept
    );
    Ok(())
}

/// Runs the victim under one session per rank and prints the outcome.
fn run(config: &Config) -> Result<(), FaultError> {
    let victim_path: PathBuf = config
        .victim
        .clone()
        .ok_or_else(|| FaultError::Config("no victim given, use --victim".to_string()))?;
    let program = VictimProgram::from_file(&victim_path)?;
    println!("Victim: {}", victim_path.display());
    std::fs::create_dir_all(&config.workdir).map_err(|e| FaultError::Io {
        path: config.workdir.clone(),
        source: e,
    })?;

    let options = RunOptions {
        session: config.session_config(),
        workdir: config.workdir.clone(),
        names: config.files.clone(),
    };
    let outcomes = Runner::new(&program, options, Arc::new(InlineHost)).run()?;

    for outcome in &outcomes {
        let title = match outcome.rank {
            Some(rank) => format!("Rank {}", rank),
            None => "Process".to_string(),
        };
        println!("\n{} ({})", title.bold(), outcome.report.mode);
        for digest in &outcome.digests {
            println!("  {}", digest);
        }
        match &outcome.report.injection {
            Some(injection) => println!("  {} {}", "Injected:".red(), injection),
            None => println!("  {}", "No fault injected".green()),
        }
        if outcome.report.target_missed {
            println!("  {}", "Target not reached".yellow());
        }
        if outcome.report.detached {
            println!("  Instrumentation detached after injection");
        }
        println!("  Eligible events: {}", outcome.report.profile.total);
        if let Some(path) = &outcome.report.profile_file {
            println!("  Profile: {}", path.display());
        }
    }
    Ok(())
}
