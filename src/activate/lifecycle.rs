/*! Preconditions and one-time lifecycle steps around an activation: the
exclusive lock, environment validation, pre-switch checks, bootloader
installation, the store sync, and the init-interface gate.
*/

use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{SigHandler, Signal};

use super::Action;
use crate::process::{run_checked, CommandRunner};
use crate::SwitchError;

pub const SWITCH_LOCK: &str = "switch-to-configuration.lock";

/// The engine's contract with its builder/wrapper, validated out of the
/// process environment.
#[derive(Debug, Clone)]
pub struct SwitchEnv {
    pub out: PathBuf,
    pub toplevel: PathBuf,
    /// Command string, shell-split before use.
    pub pre_switch_check: String,
    /// Command string, shell-split before use.
    pub install_bootloader: String,
    pub locale_archive: PathBuf,
    pub systemd: PathBuf,
    pub no_check: bool,
    pub no_sync: bool,
    pub force_install_bootloader: bool,
    pub display_all_units: bool,
    /// Set when an outer CLI dispatched us inside the activation context,
    /// in which case rollback-on-failure is its responsibility.
    pub attempting_activation: bool,
}

impl SwitchEnv {
    pub fn from_env() -> Result<Self, SwitchError> {
        Ok(Self {
            out: required("OUT")?.into(),
            toplevel: required("TOPLEVEL")?.into(),
            pre_switch_check: required("PRE_SWITCH_CHECK")?,
            install_bootloader: required("INSTALL_BOOTLOADER")?,
            locale_archive: required("LOCALE_ARCHIVE")?.into(),
            systemd: required("SYSTEMD")?.into(),
            no_check: flag("NIXOS_NO_CHECK"),
            no_sync: flag("NIXOS_NO_SYNC"),
            force_install_bootloader: flag("NIXOS_INSTALL_BOOTLOADER"),
            display_all_units: flag("STC_DISPLAY_ALL_UNITS"),
            attempting_activation: std::env::var_os("NIXOS_CLI_ATTEMPTING_ACTIVATION").is_some(),
        })
    }
}

fn required(name: &'static str) -> Result<String, SwitchError> {
    std::env::var(name).map_err(|_| SwitchError::MissingEnv(name))
}

fn flag(name: &str) -> bool {
    std::env::var(name).map(|value| value == "1").unwrap_or(false)
}

/// Refuse to run on anything that is not NixOS: the marker file, or
/// `ID=nixos` (optionally quoted) in os-release.
pub fn assert_nixos(marker: &Path, os_release: &Path) -> Result<(), SwitchError> {
    if marker.exists() {
        return Ok(());
    }
    if let Ok(text) = std::fs::read_to_string(os_release) {
        for line in text.lines() {
            if let Some(id) = line.trim().strip_prefix("ID=") {
                if id.trim_matches('"') == "nixos" {
                    return Ok(());
                }
            }
        }
    }
    Err(SwitchError::NotNixOs)
}

/// Holds `switch-to-configuration.lock` exclusively for the lifetime of
/// one activation. Contention is fatal, never waited out.
#[derive(Debug)]
pub struct ActivationLock {
    _lock: Flock<std::fs::File>,
    pub path: PathBuf,
}

impl ActivationLock {
    #[tracing::instrument(skip_all, fields(run_dir = %run_dir.display()))]
    pub fn acquire(run_dir: &Path) -> Result<Self, SwitchError> {
        if !run_dir.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(run_dir)
                .map_err(|e| SwitchError::CreateDirectory(run_dir.to_path_buf(), e))?;
        }
        let path = run_dir.join(SWITCH_LOCK);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| SwitchError::Open(path.clone(), e))?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Self { _lock: lock, path }),
            Err((_, errno)) if errno == nix::errno::Errno::EWOULDBLOCK => {
                Err(SwitchError::LockContended(path))
            },
            Err((_, errno)) => Err(SwitchError::Lock(path, errno)),
        }
    }
}

/// Terminal tty units may be restarted mid-switch; a HUP must not take the
/// activation down with them.
pub fn ignore_sighup() -> Result<(), SwitchError> {
    unsafe { nix::sys::signal::signal(Signal::SIGHUP, SigHandler::SigIgn) }
        .map(|_| ())
        .map_err(SwitchError::IgnoreSighup)
}

#[tracing::instrument(skip_all)]
pub async fn run_pre_switch_checks(
    runner: &dyn CommandRunner,
    env: &SwitchEnv,
    action: Action,
) -> Result<(), SwitchError> {
    if env.no_check {
        tracing::debug!("Pre-switch checks disabled by NIXOS_NO_CHECK");
        return Ok(());
    }
    let mut argv = shlex::split(&env.pre_switch_check)
        .ok_or_else(|| SwitchError::ShellSplit(env.pre_switch_check.clone()))?;
    if argv.is_empty() {
        return Ok(());
    }
    argv.push(env.toplevel.display().to_string());
    argv.push(action.to_string());
    let status = runner.run(&argv).await?;
    if !status.success() {
        return Err(SwitchError::PreSwitchCheck(env.pre_switch_check.clone()));
    }
    Ok(())
}

#[tracing::instrument(skip_all)]
pub async fn install_bootloader(
    runner: &dyn CommandRunner,
    env: &SwitchEnv,
) -> Result<(), SwitchError> {
    let mut argv = shlex::split(&env.install_bootloader)
        .ok_or_else(|| SwitchError::ShellSplit(env.install_bootloader.clone()))?;
    if argv.is_empty() {
        return Ok(());
    }
    if env.force_install_bootloader {
        crate::set_env("NIXOS_INSTALL_BOOTLOADER", "1");
    }
    argv.push(env.toplevel.display().to_string());
    run_checked(runner, &argv).await
}

/// Make sure the new closure has hit the disk before we bet the boot on it.
#[tracing::instrument(skip_all)]
pub fn sync_store(store_dir: &Path, no_sync: bool) -> Result<(), SwitchError> {
    if no_sync {
        tracing::debug!("Store sync disabled by NIXOS_NO_SYNC");
        return Ok(());
    }
    let store = std::fs::File::open(store_dir)
        .map_err(|e| SwitchError::Open(store_dir.to_path_buf(), e))?;
    nix::unistd::syncfs(std::os::unix::io::AsRawFd::as_raw_fd(&store)).map_err(SwitchError::SyncStore)
}

async fn init_interface_version(toplevel: &Path) -> String {
    tokio::fs::read_to_string(toplevel.join("init-interface-version"))
        .await
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

/// The running init and the new toplevel must speak the same interface;
/// when they do not, only a reboot can activate the new configuration.
#[tracing::instrument(skip_all)]
pub async fn check_init_interface(
    current_toplevel: &Path,
    new_toplevel: &Path,
) -> Result<(), SwitchError> {
    let current = init_interface_version(current_toplevel).await;
    let new = init_interface_version(new_toplevel).await;
    if current != new {
        return Err(SwitchError::InitInterfaceChanged { current, new });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn the_marker_file_identifies_nixos() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let marker = temp_dir.path().join("NIXOS");
        std::fs::write(&marker, "")?;
        assert_nixos(&marker, &temp_dir.path().join("os-release"))?;
        Ok(())
    }

    #[test]
    fn os_release_id_is_accepted_quoted_or_not() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let marker = temp_dir.path().join("NIXOS");
        let os_release = temp_dir.path().join("os-release");

        std::fs::write(&os_release, "NAME=NixOS\nID=nixos\n")?;
        assert_nixos(&marker, &os_release)?;

        std::fs::write(&os_release, "NAME=NixOS\nID=\"nixos\"\n")?;
        assert_nixos(&marker, &os_release)?;

        std::fs::write(&os_release, "NAME=Debian\nID=debian\n")?;
        assert!(matches!(
            assert_nixos(&marker, &os_release),
            Err(SwitchError::NotNixOs)
        ));

        Ok(())
    }

    #[test]
    fn the_lock_is_exclusive() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let run_dir = temp_dir.path().join("nixos");

        let held = ActivationLock::acquire(&run_dir)?;
        assert!(matches!(
            ActivationLock::acquire(&run_dir),
            Err(SwitchError::LockContended(_))
        ));
        drop(held);
        ActivationLock::acquire(&run_dir)?;

        Ok(())
    }

    #[tokio::test]
    async fn matching_init_interfaces_pass() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let cur = temp_dir.path().join("cur");
        let new = temp_dir.path().join("new");
        std::fs::create_dir_all(&cur)?;
        std::fs::create_dir_all(&new)?;
        std::fs::write(cur.join("init-interface-version"), "systemd 2\n")?;
        std::fs::write(new.join("init-interface-version"), "systemd 2\n")?;

        check_init_interface(&cur, &new).await?;

        std::fs::write(new.join("init-interface-version"), "systemd 3\n")?;
        assert!(matches!(
            check_init_interface(&cur, &new).await,
            Err(SwitchError::InitInterfaceChanged { .. })
        ));

        Ok(())
    }
}
