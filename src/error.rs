use std::path::PathBuf;

use crate::systemd::bus::BusError;

/// An error occurring while planning or enacting an activation
#[derive(thiserror::Error, Debug, strum::IntoStaticStr)]
pub enum SwitchError {
    #[error("This is not a NixOS system: neither `/etc/NIXOS` nor `ID=nixos` in `/etc/os-release` was found")]
    NotNixOs,
    #[error("Required environment variable `{0}` is not set")]
    MissingEnv(&'static str),
    #[error("Shell-splitting command string `{0}`")]
    ShellSplit(String),
    #[error("Another activation is in progress (could not lock `{0}`)")]
    LockContended(PathBuf),
    #[error("Locking `{0}`")]
    Lock(PathBuf, #[source] nix::errno::Errno),
    #[error("Ignoring SIGHUP")]
    IgnoreSighup(#[source] nix::errno::Errno),
    #[error("Read path `{0}`")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Open path `{0}`")]
    Open(PathBuf, #[source] std::io::Error),
    #[error("Write path `{0}`")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("Creating directory `{0}`")]
    CreateDirectory(PathBuf, #[source] std::io::Error),
    #[error("Remove path `{0}`")]
    Remove(PathBuf, #[source] std::io::Error),
    #[error("Failed to execute command `{0}`")]
    Command(String, #[source] std::io::Error),
    #[error("Command `{0}` exited with {1}")]
    CommandStatus(String, std::process::ExitStatus),
    #[error("Pre-switch check `{0}` failed")]
    PreSwitchCheck(String),
    #[error("Syncing `/nix/store`")]
    SyncStore(#[source] nix::errno::Errno),
    #[error("Stopping swap device `{0}`")]
    Swapoff(String, #[source] nix::errno::Errno),
    #[error(
        "The init interface version changed from `{current}` to `{new}`. \
         The running init cannot activate the new configuration; reboot into it instead"
    )]
    InitInterfaceChanged { current: String, new: String },
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("The activation supervisor exited with {0}")]
    SupervisorFailed(std::process::ExitStatus),
    #[error("The activation finished but the acknowledgement could not be delivered; the host will roll back")]
    AckNotDelivered,
    #[error("Rolling back the system profile")]
    Rollback(#[source] Box<SwitchError>),
    #[error("Joining spawned async task")]
    Join(
        #[source]
        #[from]
        tokio::task::JoinError,
    ),
}
