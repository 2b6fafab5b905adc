/*! The activation supervisor for transports that can die mid-switch.

The switch itself runs inside a transient systemd unit, so it survives the
caller's SSH connection. The harness and the caller coordinate through two
files: `switch-success`, which the harness creates once the core switch has
finished and it holds the switch lock, and the ACK trigger, which the
caller creates over a *fresh* connection to prove the host is still
reachable. No trigger within `ACK_TIMEOUT` means the harness rolls the
profile back and reactivates the previous configuration.

The harness is deliberately a POSIX shell script so the target host needs
nothing beyond systemd and a shell; the engine only composes its
environment.
*/

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::Action;
use crate::process::{run_checked, CommandRunner};
use crate::SwitchError;

pub const SUPERVISOR_UNIT: &str = "nixos-cli-activation-supervisor";
pub const SUPERVISOR_LOCK: &str = "activation-supervisor.lock";
pub const SWITCH_SUCCESS: &str = "switch-success";
pub const TRIGGER_DIR: &str = "trigger";
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

const HARNESS: &str = r#"
set -u

log() { echo "activation-supervisor: $*" >&2; }

mkdir -p -m 0755 /run/nixos
mkdir -p /run/nixos/trigger
chmod 1777 /run/nixos/trigger

exec 8>/run/nixos/activation-supervisor.lock
if ! flock -n 8; then
    log "another supervised activation is already running"
    exit 1
fi

rm -f "$ACK_TRIGGER_PATH" /run/nixos/switch-success
cleanup() {
    rm -f "$ACK_TRIGGER_PATH" /run/nixos/switch-success
}
trap cleanup EXIT INT TERM

prev_toplevel="$(readlink -f /run/current-system)"

switch_bin() {
    if [ -n "$2" ]; then
        echo "$1/specialisation/$2/bin/switch-to-configuration"
    else
        echo "$1/bin/switch-to-configuration"
    fi
}

roll_back() {
    log "rolling back to $prev_toplevel"
    if [ -n "${ROLLBACK_PROFILE_ON_FAILURE:-}" ]; then
        nix-env -p "$PROFILE" --rollback || log "profile rollback failed"
    fi
    "$(switch_bin "$prev_toplevel" "${PREVIOUS_SPECIALISATION:-}")" "$ACTION" || \
        log "reactivating the previous configuration failed"
}

if [ "${VERBOSE:-}" = 1 ]; then
    set -x
fi

if ! "$(switch_bin "$TOPLEVEL" "${SPECIALISATION:-}")" "$ACTION"; then
    roll_back
    exit 1
fi

exec 9>/run/nixos/switch-to-configuration.lock
if ! flock -n 9; then
    log "a concurrent switch-to-configuration holds the lock"
    roll_back
    exit 1
fi

touch /run/nixos/switch-success

waited=0
while [ "$waited" -lt "$ACK_TIMEOUT" ]; do
    if [ -e "$ACK_TRIGGER_PATH" ]; then
        exit 0
    fi
    sleep 1
    waited=$((waited + 1))
done

log "no acknowledgement after ${ACK_TIMEOUT}s, rolling back"
exec 9>&-
roll_back
exit 1
"#;

/// Everything the harness needs, composed into `systemd-run -E` pairs.
#[derive(Debug, Clone)]
pub struct SupervisorEnv {
    pub toplevel: PathBuf,
    pub action: Action,
    pub specialisation: Option<String>,
    pub previous_specialisation: Option<String>,
    pub profile: PathBuf,
    pub rollback_profile_on_failure: bool,
    pub locale_archive: PathBuf,
    pub install_bootloader: bool,
    pub verbose: bool,
    pub ack_timeout: Duration,
}

impl SupervisorEnv {
    fn to_env_vars(&self, ack_trigger: &Path) -> Vec<String> {
        let on_off = |flag: bool| if flag { "1" } else { "" };
        vec![
            format!("TOPLEVEL={}", self.toplevel.display()),
            format!("ACTION={}", self.action),
            format!(
                "SPECIALISATION={}",
                self.specialisation.as_deref().unwrap_or("")
            ),
            format!(
                "PREVIOUS_SPECIALISATION={}",
                self.previous_specialisation.as_deref().unwrap_or("")
            ),
            format!("PROFILE={}", self.profile.display()),
            format!("ACK_TRIGGER_PATH={}", ack_trigger.display()),
            format!(
                "ROLLBACK_PROFILE_ON_FAILURE={}",
                on_off(self.rollback_profile_on_failure)
            ),
            format!("LOCALE_ARCHIVE={}", self.locale_archive.display()),
            format!(
                "NIXOS_INSTALL_BOOTLOADER={}",
                on_off(self.install_bootloader)
            ),
            format!("VERBOSE={}", on_off(self.verbose)),
            format!("ACK_TIMEOUT={}", self.ack_timeout.as_secs()),
            "NIXOS_CLI_ATTEMPTING_ACTIVATION=1".to_string(),
        ]
    }
}

/// Where the caller's acknowledgement lands: `<run>/trigger/<hash>`, where
/// `<hash>` is the first dash-separated component of the toplevel's store
/// basename, or the SHA-256 of the full path when there is none.
pub fn ack_trigger_path(run_dir: &Path, toplevel: &Path) -> PathBuf {
    let basename = toplevel
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match basename.split_once('-') {
        Some((hash, _)) if !hash.is_empty() => hash.to_string(),
        _ => format!("{:x}", Sha256::digest(toplevel.display().to_string())),
    };
    run_dir.join(TRIGGER_DIR).join(name)
}

/// Wrap the harness in a transient unit on the target.
async fn dispatch(
    runner: &dyn CommandRunner,
    env: &SupervisorEnv,
    ack_trigger: &Path,
) -> Result<ExitStatus, SwitchError> {
    let mut argv: Vec<String> = vec![
        "systemd-run".to_string(),
        "--collect".to_string(),
        "--service-type=exec".to_string(),
        format!("--unit={SUPERVISOR_UNIT}"),
        "--wait".to_string(),
    ];
    for var in env.to_env_vars(ack_trigger) {
        argv.push("-E".to_string());
        argv.push(var);
    }
    argv.push("/bin/sh".to_string());
    argv.push("-c".to_string());
    argv.push(HARNESS.to_string());
    runner.run(&argv).await
}

/// Drive one supervised activation: dispatch the harness, watch for
/// `switch-success` every 500 ms, and acknowledge over a fresh connection.
#[tracing::instrument(skip_all, fields(toplevel = %env.toplevel.display()))]
pub async fn activate_supervised(
    runner: Arc<dyn CommandRunner>,
    env: SupervisorEnv,
    run_dir: PathBuf,
) -> Result<(), SwitchError> {
    let success_marker = run_dir.join(SWITCH_SUCCESS);
    let ack_trigger = ack_trigger_path(&run_dir, &env.toplevel);

    // A stale marker from an earlier run must not be mistaken for this
    // run's success in the window before the harness cleans it up.
    if !runner.is_remote() {
        match tokio::fs::remove_file(&success_marker).await {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => {
                tracing::warn!("Could not remove stale `{}`: {e}", success_marker.display())
            },
        }
    }

    let supervisor = tokio::spawn({
        let runner = Arc::clone(&runner);
        let env = env.clone();
        let ack_trigger = ack_trigger.clone();
        async move { dispatch(runner.as_ref(), &env, &ack_trigger).await }
    });

    // The transport may die when networking is reconfigured mid-switch, so
    // the success marker is watched independently of the command itself.
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut acked = false;
    while !supervisor.is_finished() {
        poll.tick().await;
        if !acked && probe(runner.as_ref(), &success_marker).await {
            tracing::info!("Switch succeeded; acknowledging over a fresh connection");
            match deliver_ack(runner.as_ref(), &ack_trigger).await {
                Ok(()) => acked = true,
                Err(e) => tracing::warn!("Could not deliver the acknowledgement yet: {e}"),
            }
        }
    }

    match supervisor.await? {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(SwitchError::SupervisorFailed(status)),
        Err(transport_error) => {
            // A missing exit status after a successful switch deserves one
            // reconnect-and-ack attempt before we surface a failure.
            if probe(runner.as_ref(), &success_marker).await {
                tracing::warn!("Transport lost after a successful switch: {transport_error}");
                deliver_ack(runner.as_ref(), &ack_trigger)
                    .await
                    .map_err(|_| SwitchError::AckNotDelivered)
            } else {
                Err(transport_error)
            }
        },
    }
}

async fn probe(runner: &dyn CommandRunner, path: &Path) -> bool {
    let argv = [
        "test".to_string(),
        "-e".to_string(),
        path.display().to_string(),
    ];
    matches!(runner.run(&argv).await, Ok(status) if status.success())
}

async fn deliver_ack(runner: &dyn CommandRunner, ack_trigger: &Path) -> Result<(), SwitchError> {
    run_checked(
        runner,
        &["touch".to_string(), ack_trigger.display().to_string()],
    )
    .await
}
