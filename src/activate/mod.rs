/*! The activation engine: given a new toplevel, the current toplevel, and
the live state of systemd, compute and enact the transition plan.
*/

pub mod diff;
pub mod executor;
pub mod fstab;
pub mod lifecycle;
pub mod lists;
pub mod plan;
pub mod supervisor;

use std::path::{Path, PathBuf};

pub use lifecycle::SwitchEnv;
pub use plan::Plan;

use diff::UnitDiffer;
use executor::Executor;
use fstab::Fstab;
use lists::ListFiles;

use crate::process::{CommandRunner, LocalRunner};
use crate::systemd::bus::SystemdBus;
use crate::{profile, SwitchError};

/// What the caller wants done with the new toplevel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, serde::Serialize)]
#[strum(serialize_all = "kebab-case")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Action {
    /// Validate the configuration and stop before touching the system.
    Check,
    /// Activate now and make it the boot default.
    Switch,
    /// Only make it the boot default.
    Boot,
    /// Activate now without touching the bootloader.
    Test,
    /// Log what activation would do, changing nothing.
    DryActivate,
}

impl Action {
    pub fn is_dry_activate(&self) -> bool {
        matches!(self, Action::DryActivate)
    }

    pub fn installs_bootloader(&self) -> bool {
        matches!(self, Action::Switch | Action::Boot)
    }
}

/// The host filesystem surface the engine reads and writes. Injectable so
/// planning can run against a synthesized root in tests.
#[derive(Debug, Clone)]
pub struct SwitchPaths {
    pub nixos_marker: PathBuf,
    pub os_release: PathBuf,
    pub current_units_dir: PathBuf,
    pub current_fstab: PathBuf,
    pub current_system_conf: PathBuf,
    pub proc_pid1_exe: PathBuf,
    pub current_system: PathBuf,
    pub run_dir: PathBuf,
    pub store_dir: PathBuf,
}

impl Default for SwitchPaths {
    fn default() -> Self {
        Self {
            nixos_marker: "/etc/NIXOS".into(),
            os_release: "/etc/os-release".into(),
            current_units_dir: "/etc/systemd/system".into(),
            current_fstab: "/etc/fstab".into(),
            current_system_conf: "/etc/systemd/system.conf".into(),
            proc_pid1_exe: "/proc/1/exe".into(),
            current_system: profile::CURRENT_SYSTEM.into(),
            run_dir: "/run/nixos".into(),
            store_dir: "/nix/store".into(),
        }
    }
}

/// Transition the local host to `env.toplevel`.
pub async fn switch_to_configuration(action: Action, env: &SwitchEnv) -> Result<i32, SwitchError> {
    switch_with_paths(action, env, &SwitchPaths::default(), &LocalRunner).await
}

/// [`switch_to_configuration`] with an explicit filesystem surface and
/// command runner.
#[tracing::instrument(skip_all, fields(action = %action, toplevel = %env.toplevel.display()))]
pub async fn switch_with_paths(
    action: Action,
    env: &SwitchEnv,
    paths: &SwitchPaths,
    runner: &dyn CommandRunner,
) -> Result<i32, SwitchError> {
    lifecycle::assert_nixos(&paths.nixos_marker, &paths.os_release)?;
    let _lock = lifecycle::ActivationLock::acquire(&paths.run_dir)?;
    lifecycle::ignore_sighup()?;

    crate::set_env("NIXOS_ACTION", action.to_string());
    crate::set_env("LOCALE_ARCHIVE", &env.locale_archive);

    lifecycle::run_pre_switch_checks(runner, env, action).await?;
    if action == Action::Check {
        return Ok(0);
    }

    if action.installs_bootloader() {
        lifecycle::install_bootloader(runner, env).await?;
    }
    lifecycle::sync_store(&paths.store_dir, env.no_sync)?;
    if action == Action::Boot {
        return Ok(0);
    }

    let current_toplevel = tokio::fs::read_link(&paths.current_system)
        .await
        .map_err(|e| SwitchError::Read(paths.current_system.clone(), e))?;
    lifecycle::check_init_interface(&current_toplevel, &env.toplevel).await?;

    let bus = SystemdBus::connect().await?;
    let active = bus.active_units().await?;
    let lists = ListFiles::new(&paths.run_dir, action.is_dry_activate());
    let mut differ = UnitDiffer::new(
        &paths.current_units_dir,
        &env.toplevel,
        &active,
        &lists,
        env.display_all_units,
    );
    differ.plan_units().await?;

    let current_fstab = read_or_empty(&paths.current_fstab).await;
    let new_fstab = read_or_empty(&env.toplevel.join("etc/fstab")).await;
    let changes = fstab::reconcile(&Fstab::parse(&current_fstab), &Fstab::parse(&new_fstab));
    differ.apply_mount_changes(&changes)?;

    if let Ok(json) = serde_json::to_string(differ.plan()) {
        tracing::debug!("Computed plan: {json}");
    }

    if action.is_dry_activate() {
        run_dry_activate_script(runner, &env.toplevel).await;
        differ.reclassify_after_activation(true).await?;
        log_dry_plan(differ.plan(), &changes.stale_swaps);
        return Ok(0);
    }

    let executor = Executor::new(&bus, env, paths, runner, &lists);
    match executor.run(&mut differ, &changes.stale_swaps).await {
        Ok(code) => Ok(code),
        Err(e) => {
            tracing::error!("Activation failed: {e}");
            // Under a supervisor the harness owns the rollback; a bare
            // local run has to clean up after itself.
            if !env.attempting_activation {
                roll_back_locally(runner, &current_toplevel, action).await;
            }
            Err(e)
        },
    }
}

async fn read_or_empty(path: &Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

async fn run_dry_activate_script(runner: &dyn CommandRunner, toplevel: &Path) {
    let script = toplevel.join("dry-activate");
    if !script.exists() {
        return;
    }
    tracing::info!("Running the dry activation script");
    if let Err(e) = runner.run(&[script.display().to_string()]).await {
        tracing::warn!("Dry activation script failed: {e}");
    }
}

fn log_dry_plan(plan: &Plan, stale_swaps: &[String]) {
    for device in stale_swaps {
        tracing::info!("would stop swap device {device}");
    }
    for (verb, set) in [
        ("stop", &plan.stop),
        ("reload", &plan.reload),
        ("restart", &plan.restart),
        ("start", &plan.start),
    ] {
        let displayed = plan.displayed(set);
        if !displayed.is_empty() {
            tracing::info!("would {verb} the following units: {}", displayed.join(", "));
        }
    }
    if !plan.skip.is_empty() {
        tracing::info!(
            "would leave the following units alone: {}",
            plan.skip.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
        );
    }
}

async fn roll_back_locally(runner: &dyn CommandRunner, previous_toplevel: &Path, action: Action) {
    tracing::warn!(
        "Rolling the system profile back and reactivating `{}`",
        previous_toplevel.display()
    );
    if let Err(e) = profile::rollback(runner, Path::new(profile::SYSTEM_PROFILE)).await {
        tracing::error!("{e}");
    }
    let previous_switch = previous_toplevel.join("bin/switch-to-configuration");
    let argv = [previous_switch.display().to_string(), action.to_string()];
    if let Err(e) = crate::process::run_checked(runner, &argv).await {
        tracing::error!("Reactivating the previous configuration failed: {e}");
    }
}
