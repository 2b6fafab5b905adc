/*! Subprocess execution behind a capability trait, so the engine can be
driven over a transport that is not the local machine.
*/

use std::process::ExitStatus;

use tokio::process::Command;

use crate::SwitchError;

/// Where and how the engine runs external commands.
///
/// The engine only ever needs to run a command to completion and look at
/// the exit status; streaming output goes to the operator's terminal (or
/// journal) directly. A remote implementation is expected to open a fresh
/// transport connection per `run` call, which is what makes the
/// post-switch acknowledgement possible after networking changes tore down
/// the original connection.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion, inheriting stdio.
    async fn run(&self, argv: &[String]) -> Result<ExitStatus, SwitchError>;

    /// Whether commands run somewhere other than this host.
    fn is_remote(&self) -> bool;

    /// Whether `name` resolves to an executable on the target.
    async fn has_command(&self, name: &str) -> bool;
}

/// Runs commands as ordinary child processes of this one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRunner;

#[async_trait::async_trait]
impl CommandRunner for LocalRunner {
    #[tracing::instrument(skip_all, fields(command = %argv.join(" ")))]
    async fn run(&self, argv: &[String]) -> Result<ExitStatus, SwitchError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SwitchError::ShellSplit(String::new()))?;
        tracing::debug!("Running `{}`", argv.join(" "));
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| SwitchError::Command(argv.join(" "), e))?;
        Ok(status)
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn has_command(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }
}

/// Run `argv` and fail unless it exits zero.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    argv: &[String],
) -> Result<(), SwitchError> {
    let status = runner.run(argv).await?;
    if status.success() {
        Ok(())
    } else {
        Err(SwitchError::CommandStatus(argv.join(" "), status))
    }
}
