//! The instance registry.
//!
//! One file per running daemon under
//! `<state_dir>/instances/<scheduler_name>`, holding the path to that
//! daemon's config file. Creation is atomic (`create_new`), so two
//! daemons racing to start under the same name always produce exactly
//! one winner; the loser sees [`InstanceError::Conflict`] and must
//! abort before mutating any other state.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors acquiring or releasing an instance registration.
#[derive(Debug)]
pub enum InstanceError {
    /// An instance with this name is already registered.
    Conflict { name: String },
    /// The instance file could not be created or removed.
    Io { reason: String },
}

impl fmt::Display for InstanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { name } => write!(f, "an instance named '{name}' is already running"),
            Self::Io { reason } => write!(f, "instance registry I/O failed: {reason}"),
        }
    }
}

impl std::error::Error for InstanceError {}

/// A held registration for one running scheduler instance.
///
/// Removes its file on `Drop`, covering both clean shutdown and an
/// unwinding panic.
pub struct InstanceGuard {
    path: PathBuf,
}

impl InstanceGuard {
    /// Atomically registers `scheduler_name` under `state_dir`,
    /// recording `config_path` as the file's contents.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Conflict`] if the name is already
    /// registered, or [`InstanceError::Io`] for any other failure.
    pub fn acquire(state_dir: &Path, scheduler_name: &str, config_path: &Path) -> Result<Self, InstanceError> {
        let instances_dir = state_dir.join("instances");
        fs::create_dir_all(&instances_dir).map_err(|e| InstanceError::Io { reason: e.to_string() })?;

        let path = instances_dir.join(scheduler_name);
        let mut file = match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(InstanceError::Conflict { name: scheduler_name.to_string() });
            }
            Err(e) => return Err(InstanceError::Io { reason: e.to_string() }),
        };

        file.write_all(config_path.to_string_lossy().as_bytes())
            .map_err(|e| InstanceError::Io { reason: e.to_string() })?;

        Ok(Self { path })
    }

    /// Removes the registration explicitly, for the startup-failure
    /// unwind path where the daemon never reaches its main
    /// loop and `Drop` alone would still run but later than desired.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %error, "failed to remove instance registry file");
        }
    }
}
