//! Target planning for fault injection campaigns.
//!
//! Draws targets uniformly over all events of a profiling run. Events are
//! ordered thread by thread, so a global draw maps to one `(thread, fi_index)`
//! pair and every event has the same chance of being picked.

use crate::error::FaultError;
use crate::persistence::write_atomic;
use crate::record::descriptor::{Scope, TargetDescriptor};
use crate::record::profile::{ProfileRecord, UnitCount};
use crate::rng::Mt64;
use log::{debug, info};
use std::path::Path;

/// Draws `samples` targets from `profile`.
///
/// # Arguments
///
/// * `profile` - Profiling record of a golden run.
/// * `samples` - Number of targets to draw.
/// * `target_threads` - Threads eligible for targeting, all threads if empty.
/// * `rank` - Rank written into every target, for ranked variants.
/// * `rng` - Generator used for the draws.
///
/// # Returns
///
/// * `Result<Vec<TargetDescriptor>, FaultError>` - One target per trial.
pub fn plan_targets(
    profile: &ProfileRecord,
    samples: usize,
    target_threads: &[usize],
    rank: Option<u32>,
    rng: &mut Mt64,
) -> Result<Vec<TargetDescriptor>, FaultError> {
    if profile.units.is_empty() && !target_threads.is_empty() {
        return Err(FaultError::Config(
            "profile has no per-thread counts to restrict targets to".to_string(),
        ));
    }
    if let Some(missing) = target_threads
        .iter()
        .find(|thread| profile.count_of(**thread).is_none())
    {
        return Err(FaultError::Config(format!(
            "thread {} does not appear in the profile",
            missing
        )));
    }
    let units: Vec<UnitCount> = profile
        .units
        .iter()
        .filter(|unit| target_threads.is_empty() || target_threads.contains(&unit.thread))
        .copied()
        .collect();
    let total: u64 = if profile.units.is_empty() {
        profile.total
    } else {
        units.iter().map(|unit| unit.count).sum()
    };
    if total == 0 {
        return Err(FaultError::Config("no events to target".to_string()));
    }

    let targets = (0..samples)
        .map(|_| {
            let global = rng.below(total) + 1;
            let target = locate(&units, global, rank);
            debug!("Event {} of {} -> {}", global, total, target);
            target
        })
        .collect();
    Ok(targets)
}

/// Maps the 1-based global event `global` to its unit.
fn locate(units: &[UnitCount], global: u64, rank: Option<u32>) -> TargetDescriptor {
    let mut before = 0;
    for unit in units {
        if global <= before + unit.count {
            return TargetDescriptor {
                scope: Scope {
                    rank,
                    thread: Some(unit.thread as u32),
                },
                occurrence: global - before,
            };
        }
        before += unit.count;
    }
    TargetDescriptor {
        scope: Scope { rank, thread: None },
        occurrence: global,
    }
}

/// Trials written by [`write_plan`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub written: usize,
    /// Trials whose target file already existed and was left untouched.
    pub kept: usize,
}

/// Writes `<outdir>/<trial>/<file_name>` for trials numbered from 1.
pub fn write_plan(
    outdir: &Path,
    file_name: &str,
    targets: &[TargetDescriptor],
) -> Result<PlanSummary, FaultError> {
    let mut summary = PlanSummary::default();
    for (trial, target) in (1..).zip(targets) {
        let trial_dir = outdir.join(format!("{}", trial));
        std::fs::create_dir_all(&trial_dir).map_err(|e| FaultError::io(&trial_dir, e))?;
        let path = trial_dir.join(file_name);
        if path.exists() {
            summary.kept += 1;
            continue;
        }
        write_atomic(&path, &format!("{}\n", target))?;
        summary.written += 1;
    }
    info!(
        "Plan in {}: {} target files written, {} kept",
        outdir.display(),
        summary.written,
        summary.kept
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn global_draw_maps_to_threads() {
        let units = ProfileRecord::per_thread(&[3, 0, 2]).units;
        assert_eq!(locate(&units, 1, None).scope, Scope::thread(0));
        assert_eq!(locate(&units, 3, None).occurrence, 3);
        let last = locate(&units, 5, Some(1));
        assert_eq!(last.scope, Scope::rank_thread(1, 2));
        assert_eq!(last.occurrence, 2);
    }

    #[test]
    fn serial_targets_cover_the_run() {
        let profile = ProfileRecord::single(10);
        let targets = plan_targets(&profile, 200, &[], None, &mut Mt64::new(1)).unwrap();
        assert_eq!(targets.len(), 200);
        assert!(targets
            .iter()
            .all(|target| target.scope == Scope::serial() && (1..=10).contains(&target.occurrence)));
    }

    #[test]
    fn restricted_threads() {
        let profile = ProfileRecord::per_thread(&[5, 5, 5]);
        let targets = plan_targets(&profile, 100, &[2], None, &mut Mt64::new(2)).unwrap();
        assert!(targets
            .iter()
            .all(|target| target.scope.thread == Some(2) && target.occurrence <= 5));
        assert!(plan_targets(&profile, 1, &[7], None, &mut Mt64::new(2)).is_err());
        assert!(plan_targets(&ProfileRecord::single(5), 1, &[0], None, &mut Mt64::new(2)).is_err());
    }

    #[test]
    fn empty_profile_cannot_be_targeted() {
        let profile = ProfileRecord::per_thread(&[0, 0]);
        assert!(plan_targets(&profile, 1, &[], None, &mut Mt64::new(3)).is_err());
    }

    #[test]
    fn existing_target_files_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2")).unwrap();
        fs::write(dir.path().join("2/fi-target.txt"), "fi_index=1\n").unwrap();
        let targets = vec![
            TargetDescriptor {
                scope: Scope::serial(),
                occurrence: 4,
            };
            3
        ];
        let summary = write_plan(dir.path(), "fi-target.txt", &targets).unwrap();
        assert_eq!(summary, PlanSummary { written: 2, kept: 1 });
        assert_eq!(
            fs::read_to_string(dir.path().join("3/fi-target.txt")).unwrap(),
            "fi_index=4\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("2/fi-target.txt")).unwrap(),
            "fi_index=1\n"
        );
    }
}
