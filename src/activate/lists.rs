/*! The on-disk unit lists under `/run/nixos`.

These files are the engine's only persistence: a write-ahead record of the
`start`/`restart`/`reload` verdicts, so that an activation interrupted
mid-switch is consolidated by the next run instead of being lost. The
activation script communicates back through the `*-by-activation` pair.
*/

use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;

use crate::SwitchError;

pub const START_LIST: &str = "start-list";
pub const RESTART_LIST: &str = "restart-list";
pub const RELOAD_LIST: &str = "reload-list";
pub const ACTIVATION_RESTART_LIST: &str = "activation-restart-list";
pub const ACTIVATION_RELOAD_LIST: &str = "activation-reload-list";
pub const DRY_ACTIVATION_RESTART_LIST: &str = "dry-activation-restart-list";
pub const DRY_ACTIVATION_RELOAD_LIST: &str = "dry-activation-reload-list";

/// Handle on the list-file directory. With `dry_run` set, every mutation
/// of the plan lists is suppressed.
#[derive(Debug, Clone)]
pub struct ListFiles {
    dir: PathBuf,
    dry_run: bool,
}

impl ListFiles {
    pub fn new(dir: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            dir: dir.into(),
            dry_run,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// The unit names recorded in `name`, one per line, blanks skipped.
    pub fn read(&self, name: &str) -> Vec<String> {
        let path = self.path(name);
        match std::fs::read_to_string(&path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Could not read `{}`: {e}", path.display());
                }
                Vec::new()
            },
        }
    }

    /// Append `unit` to `name`, creating the directory (0755) and file
    /// (0644) as needed.
    pub fn append(&self, name: &str, unit: &str) -> Result<(), SwitchError> {
        if self.dry_run {
            return Ok(());
        }
        self.ensure_dir()?;
        let path = self.path(name);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(&path)
            .map_err(|e| SwitchError::Open(path.clone(), e))?;
        writeln!(file, "{unit}").map_err(|e| SwitchError::Write(path.clone(), e))?;
        Ok(())
    }

    /// Drop `unit` from `name` by rewriting the file without it.
    pub fn remove_entry(&self, name: &str, unit: &str) -> Result<(), SwitchError> {
        if self.dry_run {
            return Ok(());
        }
        let path = self.path(name);
        let remaining: Vec<String> = self
            .read(name)
            .into_iter()
            .filter(|line| line != unit)
            .collect();
        if remaining.is_empty() && !path.exists() {
            return Ok(());
        }
        let mut text = remaining.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        std::fs::write(&path, text).map_err(|e| SwitchError::Write(path.clone(), e))?;
        Ok(())
    }

    /// Remove a fully consumed list file.
    pub fn clear(&self, name: &str) -> Result<(), SwitchError> {
        if self.dry_run {
            return Ok(());
        }
        self.remove_file(name)
    }

    /// Remove a file unconditionally; used for the `*-by-activation`
    /// triggers, which are consumed even during a dry activation.
    pub fn remove_file(&self, name: &str) -> Result<(), SwitchError> {
        let path = self.path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SwitchError::Remove(path, e)),
        }
    }

    fn ensure_dir(&self) -> Result<(), SwitchError> {
        if self.dir.exists() {
            return Ok(());
        }
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&self.dir)
            .map_err(|e| SwitchError::CreateDirectory(self.dir.clone(), e))
    }
}
