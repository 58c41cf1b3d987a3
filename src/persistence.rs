//! Session files: mode discovery at startup and atomic writes.

use crate::error::FaultError;
use crate::injection::Variant;
use crate::record::descriptor::{InjectionDescriptor, TargetDescriptor};
use crate::record::single_line;
use log::{debug, info};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Names of the session files inside the working directory.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileNames {
    pub target: String,
    pub injection: String,
    pub profile: String,
    pub catalogue: Option<String>,
    pub categories: Option<String>,
}

impl Default for FileNames {
    fn default() -> Self {
        Self {
            target: "fi-target.txt".to_string(),
            injection: "fi-inject.txt".to_string(),
            profile: "fi-inscount.txt".to_string(),
            catalogue: None,
            categories: None,
        }
    }
}

/// Lifecycle stage of a session, fixed at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// No input file: count only.
    Profile,
    /// A target file names the occurrence, operand and bit are drawn.
    TargetRandom(TargetDescriptor),
    /// An injection file replays a recorded experiment.
    Reproduce(InjectionDescriptor),
}

impl Mode {
    pub fn target(&self) -> Option<TargetDescriptor> {
        match self {
            Mode::Profile => None,
            Mode::TargetRandom(target) => Some(*target),
            Mode::Reproduce(injection) => Some(injection.target()),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Profile => write!(f, "profile"),
            Mode::TargetRandom(target) => write!(f, "target-random ({})", target),
            Mode::Reproduce(injection) => write!(f, "reproduce ({})", injection),
        }
    }
}

/// Paths of the files one process reads and writes.
///
/// Per-process outputs of ranked variants carry a `<rank>.` prefix. Input
/// files are shared by all ranks.
#[derive(Clone, Debug)]
pub struct SessionFiles {
    dir: PathBuf,
    names: FileNames,
    rank: Option<u32>,
}

impl SessionFiles {
    pub fn new(dir: impl Into<PathBuf>, names: FileNames, rank: Option<u32>) -> Self {
        Self {
            dir: dir.into(),
            names,
            rank,
        }
    }

    fn per_process(&self, name: &str) -> PathBuf {
        match self.rank {
            Some(rank) => self.dir.join(format!("{}.{}", rank, name)),
            None => self.dir.join(name),
        }
    }

    pub fn target_path(&self) -> PathBuf {
        self.dir.join(&self.names.target)
    }

    pub fn injection_path(&self) -> PathBuf {
        self.dir.join(&self.names.injection)
    }

    pub fn profile_path(&self) -> PathBuf {
        self.per_process(&self.names.profile)
    }

    pub fn catalogue_path(&self) -> Option<PathBuf> {
        self.names
            .catalogue
            .as_deref()
            .map(|name| self.per_process(name))
    }

    pub fn categories_path(&self) -> Option<PathBuf> {
        self.names
            .categories
            .as_deref()
            .map(|name| self.per_process(name))
    }

    /// Determines the session mode from the files present.
    ///
    /// The injection file wins over the target file. A file that exists but
    /// does not parse is fatal, there is no fallback to another mode.
    ///
    /// # Arguments
    ///
    /// * `variant` - Decides which scope fields the records must carry.
    ///
    /// # Returns
    ///
    /// * `Result<Mode, FaultError>` - The mode or the failing file.
    pub fn discover(&self, variant: Variant) -> Result<Mode, FaultError> {
        let injection_path = self.injection_path();
        if let Some(content) = read_optional(&injection_path)? {
            let injection = single_line(&content)
                .and_then(|line| InjectionDescriptor::parse(line, variant))
                .map_err(|reason| FaultError::malformed(&injection_path, reason))?;
            info!("Reproduce injection: {}", injection);
            return Ok(Mode::Reproduce(injection));
        }
        let target_path = self.target_path();
        if let Some(content) = read_optional(&target_path)? {
            let target = single_line(&content)
                .and_then(|line| TargetDescriptor::parse(line, variant))
                .map_err(|reason| FaultError::malformed(&target_path, reason))?;
            info!("Random injection at target: {}", target);
            return Ok(Mode::TargetRandom(target));
        }
        info!("Profiling run");
        Ok(Mode::Profile)
    }
}

/// Reads `path`, or returns `None` if it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<String>, FaultError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FaultError::io(path, e)),
    }
}

/// Writes `content` to `path` through a temporary file and a rename.
///
/// Readers see either the old file or the complete new one. The data is
/// synced before the rename, so a crash of the victim right after this call
/// still leaves a complete record.
pub fn write_atomic(path: &Path, content: &str) -> Result<(), FaultError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| FaultError::Config(format!("{} is not a file path", path.display())))?;
    let mut temporary = file_name.to_os_string();
    temporary.push(".tmp");
    let temporary = path.with_file_name(temporary);

    let result = fs::File::create(&temporary)
        .and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&temporary, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&temporary);
        return Err(FaultError::io(path, e));
    }
    debug!("Wrote {}", path.display());
    Ok(())
}
