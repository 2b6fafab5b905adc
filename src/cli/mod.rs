/*! CLI argument structures and utilities

*/

pub mod arg;

use clap::Parser;
use eyre::WrapErr;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use std::{ffi::CString, process::ExitCode};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::activate::supervisor::{self, SupervisorEnv, DEFAULT_ACK_TIMEOUT};
use crate::activate::{switch_to_configuration, Action, SwitchEnv, SwitchPaths};
use crate::process::LocalRunner;
use crate::profile;

#[async_trait::async_trait]
pub trait CommandExecute {
    async fn execute(self) -> eyre::Result<ExitCode>;
}

/**
Transition this NixOS host to a new system configuration

Takes the toplevel named by `TOPLEVEL` and brings the running system in
line with it, restarting, reloading, stopping and starting units only
where the two configurations actually differ.
*/
#[derive(Debug, Parser)]
#[clap(version)]
pub struct NixosSwitchCli {
    /// What to do with the new configuration
    #[clap(value_enum)]
    pub action: Action,

    /// Command used to re-invoke the CLI as root (sudo, doas, ...)
    #[clap(long, env = "NIXOS_SWITCH_ELEVATE", default_value = "sudo")]
    pub elevation_command: String,

    /// Run the switch inside a transient systemd unit that rolls back
    /// unless it is acknowledged in time; survives loss of the terminal
    #[clap(long)]
    pub supervise: bool,

    /// Seconds the supervised switch waits for an acknowledgement
    #[clap(long, env = "ACK_TIMEOUT", default_value_t = DEFAULT_ACK_TIMEOUT.as_secs())]
    pub ack_timeout: u64,

    /// Specialisation of the toplevel to activate
    #[clap(long, env = "SPECIALISATION")]
    pub specialisation: Option<String>,

    /// Roll the system profile back one generation if the supervised
    /// switch fails or times out
    #[clap(long)]
    pub rollback_profile_on_failure: bool,

    #[clap(flatten)]
    pub instrumentation: arg::Instrumentation,
}

#[async_trait::async_trait]
impl CommandExecute for NixosSwitchCli {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn execute(self) -> eyre::Result<ExitCode> {
        ensure_root(&self.elevation_command)?;

        let (_sender, _receiver) = signal_channel().await?;

        let env = SwitchEnv::from_env()?;

        if self.supervise {
            let supervisor_env = SupervisorEnv {
                toplevel: env.toplevel.clone(),
                action: self.action,
                specialisation: self.specialisation.clone(),
                previous_specialisation: std::env::var("PREVIOUS_SPECIALISATION").ok(),
                profile: profile::profile_path(None),
                rollback_profile_on_failure: self.rollback_profile_on_failure,
                locale_archive: env.locale_archive.clone(),
                install_bootloader: env.force_install_bootloader,
                verbose: self.instrumentation.verbose > 0,
                ack_timeout: Duration::from_secs(self.ack_timeout),
            };
            let run_dir = SwitchPaths::default().run_dir;
            return match supervisor::activate_supervised(
                Arc::new(LocalRunner),
                supervisor_env,
                run_dir,
            )
            .await
            {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(e) => {
                    tracing::error!("{e}");
                    Ok(ExitCode::FAILURE)
                },
            };
        }

        match switch_to_configuration(self.action, &env).await {
            Ok(code) => Ok(ExitCode::from(u8::try_from(code).unwrap_or(1))),
            Err(e) => {
                tracing::error!("{e}");
                Ok(ExitCode::FAILURE)
            },
        }
    }
}

pub(crate) async fn signal_channel() -> eyre::Result<(Sender<()>, Receiver<()>)> {
    let (sender, receiver) = tokio::sync::broadcast::channel(100);

    let sender_cloned = sender.clone();
    let _guard = tokio::spawn(async move {
        let mut ctrl_c = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("failed to install signal handler");

        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler");

        loop {
            tokio::select! {
                    Some(()) = ctrl_c.recv() => {
                        tracing::warn!("Got SIGINT signal");
                        sender_cloned.send(()).ok();
                    },
                    Some(()) = terminate.recv() => {
                        tracing::warn!("Got SIGTERM signal");
                        sender_cloned.send(()).ok();
                    },
            }
        }
    });

    Ok((sender, receiver))
}

pub fn is_root() -> bool {
    let euid = nix::unistd::Uid::effective();
    tracing::trace!("Running as EUID {euid}");
    euid.is_root()
}

/// Re-invoke ourselves under the configured elevation command, preserving
/// argv and the environment the engine cares about. Happens at most once:
/// the elevated child passes this check and carries on.
pub fn ensure_root(elevation_command: &str) -> eyre::Result<()> {
    if !is_root() {
        eprintln!(
            "{}",
            format!(
                "`nixos-switch` needs to run as `root`, attempting to escalate now via `{elevation_command}`..."
            )
            .yellow()
            .dimmed()
        );
        let elevate_cstring = CString::new(elevation_command)
            .wrap_err_with(|| format!("Making C string of `{elevation_command}`"))?;

        let args = std::env::args();
        let mut arg_vec_cstring = vec![];
        arg_vec_cstring.push(elevate_cstring.clone());

        let mut env_list = vec![];
        for (key, value) in std::env::vars() {
            let preserve = match key.as_str() {
                // Rust logging/backtrace bits we use
                "RUST_LOG" | "RUST_BACKTRACE" => true,
                // The engine's contract with its wrapper
                "OUT" | "TOPLEVEL" | "PRE_SWITCH_CHECK" | "INSTALL_BOOTLOADER"
                | "LOCALE_ARCHIVE" | "SYSTEMD" => true,
                // Behavior toggles
                "STC_DISPLAY_ALL_UNITS" => true,
                key if key.starts_with("NIXOS_") => true,
                _ => false,
            };
            if preserve {
                env_list.push(format!("{key}={value}"));
            }
        }

        if !env_list.is_empty() {
            arg_vec_cstring.push(CString::new("env").wrap_err("Building a `env` argument")?);
            for env in env_list {
                arg_vec_cstring.push(
                    CString::new(env.clone())
                        .wrap_err_with(|| format!("Building a `{}` argument", env))?,
                );
            }
        }

        for arg in args {
            arg_vec_cstring.push(CString::new(arg).wrap_err("Making arg into C string")?);
        }

        tracing::trace!("Execvp'ing `{elevate_cstring:?}` with args `{arg_vec_cstring:?}`");
        nix::unistd::execvp(&elevate_cstring, &arg_vec_cstring).wrap_err_with(|| {
            format!("Executing `nixos-switch` as `root` via `{elevation_command}`")
        })?;
    }
    Ok(())
}
