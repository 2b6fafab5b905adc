/*! An activation engine for [NixOS](https://nixos.org) system configurations.

`nixos-switch` takes a realised system closure (a *toplevel*) and transitions
the running host to it with minimum disruption. It breaks down into a few
main concepts:

* [`Plan`](activate::Plan): the per-unit verdicts (start/stop/restart/reload/skip)
  computed by diffing the current and new unit trees against the live state of
  systemd.
* The executor, which enacts a [`Plan`](activate::Plan) against the systemd
  D-Bus API in parallel phases, collecting per-unit job results.
* The supervisor, a `systemd-run` wrapped harness used for remote
  deployments: it survives the caller's transport and rolls the system
  profile back unless the caller acknowledges reachability in time.

In the simplest case:

```rust,no_run
use nixos_switch::activate::{switch_to_configuration, Action, SwitchEnv};

# async fn switch() -> color_eyre::Result<()> {
let env = SwitchEnv::from_env()?;
let code = switch_to_configuration(Action::Switch, &env).await?;
std::process::exit(code);
# }
```

*/

pub mod activate;
#[cfg(feature = "cli")]
pub mod cli;
mod error;
pub mod process;
pub mod profile;
pub mod systemd;

use std::ffi::OsStr;

pub use error::SwitchError;

#[tracing::instrument(skip_all, fields(
    k = %k.as_ref().to_string_lossy(),
    v = %v.as_ref().to_string_lossy(),
))]
fn set_env(k: impl AsRef<OsStr>, v: impl AsRef<OsStr>) {
    tracing::trace!("Setting env");
    std::env::set_var(k.as_ref(), v.as_ref());
}
