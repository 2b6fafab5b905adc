/*! Generation profiles: the symlink chain that makes a toplevel the system
configuration, and the rollback that undoes it.
*/

use std::path::{Path, PathBuf};

use crate::process::{run_checked, CommandRunner};
use crate::SwitchError;

/// The default system profile link.
pub const SYSTEM_PROFILE: &str = "/nix/var/nix/profiles/system";

/// The toplevel the host is currently running.
pub const CURRENT_SYSTEM: &str = "/run/current-system";

/// The profile link for a named profile, or the default system profile.
pub fn profile_path(name: Option<&str>) -> PathBuf {
    match name {
        Some(name) => Path::new("/nix/var/nix/profiles/system-profiles").join(name),
        None => PathBuf::from(SYSTEM_PROFILE),
    }
}

/// The generation number encoded in a `<profile>-<N>-link` name.
pub fn generation_number(link: &Path) -> Option<u64> {
    let name = link.file_name()?.to_str()?;
    let stem = name.strip_suffix("-link")?;
    stem.rsplit_once('-')?.1.parse().ok()
}

/// Roll the profile back one generation via the package manager.
#[tracing::instrument(skip_all, fields(profile = %profile.display()))]
pub async fn rollback(runner: &dyn CommandRunner, profile: &Path) -> Result<(), SwitchError> {
    run_checked(
        runner,
        &[
            "nix-env".to_string(),
            "-p".to_string(),
            profile.display().to_string(),
            "--rollback".to_string(),
        ],
    )
    .await
    .map_err(|e| SwitchError::Rollback(Box::new(e)))
}
