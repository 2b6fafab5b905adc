/*! Enact a computed plan against systemd: serial phases, parallel unit
fan-outs inside each phase.
*/

use std::collections::BTreeSet;
use std::path::Path;

use super::diff::UnitDiffer;
use super::lifecycle::SwitchEnv;
use super::lists::{self, ListFiles};
use super::plan::log_units;
use super::SwitchPaths;
use crate::process::CommandRunner;
use crate::systemd::bus::{JobOutcome, SystemdBus, UnitJob};
use crate::SwitchError;

pub struct Executor<'a> {
    bus: &'a SystemdBus,
    env: &'a SwitchEnv,
    paths: &'a SwitchPaths,
    runner: &'a dyn CommandRunner,
    lists: &'a ListFiles,
}

impl<'a> Executor<'a> {
    pub fn new(
        bus: &'a SystemdBus,
        env: &'a SwitchEnv,
        paths: &'a SwitchPaths,
        runner: &'a dyn CommandRunner,
        lists: &'a ListFiles,
    ) -> Self {
        Self {
            bus,
            env,
            paths,
            runner,
            lists,
        }
    }

    /// Run the eight execution phases and return the process exit code.
    ///
    /// Per-unit job failures do not abort later phases; they are collected
    /// and surfaced in aggregate at the end. A failing activation script
    /// defers exit code 2 the same way.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        differ: &mut UnitDiffer<'_>,
        stale_swaps: &[String],
    ) -> Result<i32, SwitchError> {
        let mut failures: Vec<JobOutcome> = Vec::new();
        let mut deferred_exit_code = 0;

        // Swaps the new configuration no longer knows about. `systemctl
        // stop` on the swap unit is unreliable here (alias swap units may
        // not actually detach), so call swapoff(2) directly.
        for device in stale_swaps {
            tracing::info!("Stopping swap device {device}");
            if let Err(e) = swapoff(device) {
                tracing::error!("{e}");
            }
        }

        let stop = differ.plan().stop.clone();
        log_units("Stopping", differ.plan(), &stop);
        self.run_phase(UnitJob::Stop, &stop, &mut failures).await?;

        self.run_activate_script(&mut deferred_exit_code).await;

        // The activation script may have queued restarts and reloads of
        // its own; fold them into the plan before the remaining phases.
        differ.reclassify_after_activation(false).await?;

        if self.should_reexec_pid1().await {
            tracing::info!("Re-executing systemd");
            self.bus.reexecute().await;
        }
        self.bus.daemon_reload().await?;

        let reload = differ.plan().reload.clone();
        log_units("Reloading", differ.plan(), &reload);
        self.run_phase(UnitJob::Reload, &reload, &mut failures).await?;

        let restart = differ.plan().restart.clone();
        log_units("Restarting", differ.plan(), &restart);
        self.run_phase(UnitJob::Restart, &restart, &mut failures)
            .await?;

        let start = differ.plan().start.clone();
        log_units("Starting", differ.plan(), &start);
        self.run_phase(UnitJob::Start, &start, &mut failures).await?;

        if !failures.is_empty() {
            let summary = failures
                .iter()
                .map(|outcome| format!("{} ({}: {})", outcome.unit, outcome.job, outcome.result))
                .collect::<Vec<_>>()
                .join(", ");
            tracing::error!("The following unit actions failed: {summary}");
        }

        // The verdicts are consumed; the next activation starts clean.
        self.lists.clear(lists::START_LIST)?;
        self.lists.clear(lists::RESTART_LIST)?;
        self.lists.clear(lists::RELOAD_LIST)?;

        let code = if deferred_exit_code != 0 {
            deferred_exit_code
        } else if !failures.is_empty() {
            1
        } else {
            0
        };
        Ok(code)
    }

    async fn run_phase(
        &self,
        job: UnitJob,
        units: &BTreeSet<String>,
        failures: &mut Vec<JobOutcome>,
    ) -> Result<(), SwitchError> {
        let outcomes = self.bus.run_jobs(job, units).await?;
        failures.extend(outcomes.into_iter().filter(JobOutcome::is_failure));
        Ok(())
    }

    /// Run `<toplevel>/activate`. A missing script is benign; a failing
    /// one defers exit code 2 but does not stop the switch.
    async fn run_activate_script(&self, deferred_exit_code: &mut i32) {
        let script = self.env.toplevel.join("activate");
        if !script.exists() {
            tracing::debug!("No activation script at `{}`", script.display());
            return;
        }
        tracing::info!("Activating the configuration");
        match self.runner.run(&[script.display().to_string()]).await {
            Ok(status) if status.success() => (),
            Ok(status) => {
                tracing::error!("The activation script exited with {status}");
                *deferred_exit_code = 2;
            },
            Err(e) => {
                tracing::error!("Running the activation script: {e}");
                *deferred_exit_code = 2;
            },
        }
    }

    /// pid 1 must re-exec when its binary or its configuration changed.
    async fn should_reexec_pid1(&self) -> bool {
        let expected = self.env.systemd.join("lib/systemd/systemd");
        let pid1_exe = tokio::fs::canonicalize(&self.paths.proc_pid1_exe).await.ok();
        let expected = tokio::fs::canonicalize(&expected).await.ok();
        match (pid1_exe, expected) {
            (Some(running), Some(expected)) if running == expected => (),
            _ => return true,
        }

        let current_conf = tokio::fs::read(&self.paths.current_system_conf)
            .await
            .unwrap_or_default();
        let new_conf = tokio::fs::read(
            self.env
                .toplevel
                .join(Path::new("etc/systemd/system.conf")),
        )
        .await
        .unwrap_or_default();
        current_conf != new_conf
    }
}

fn swapoff(device: &str) -> Result<(), SwitchError> {
    let c_device = std::ffi::CString::new(device)
        .map_err(|_| SwitchError::Swapoff(device.to_string(), nix::errno::Errno::EINVAL))?;
    let rc = unsafe { nix::libc::swapoff(c_device.as_ptr()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(SwitchError::Swapoff(
            device.to_string(),
            nix::errno::Errno::last(),
        ))
    }
}
