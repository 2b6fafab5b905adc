use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;
use nixos_switch::cli::CommandExecute;

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::config::HookBuilder::default()
        .theme(if !std::io::stderr().is_terminal() {
            color_eyre::config::Theme::new()
        } else {
            color_eyre::config::Theme::dark()
        })
        .install()?;

    let cli = nixos_switch::cli::NixosSwitchCli::parse();

    cli.instrumentation.setup()?;

    cli.execute().await
}
