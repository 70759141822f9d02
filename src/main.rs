//! nestcast - stream desktop audio to Google Cast devices
//!
//! # Usage
//!
//! ```bash
//! nestcast devices
//! nestcast stream "Living Room speaker"
//! nestcast stream "Left Shelf" "Right Shelf" --monitor
//! nestcast volume "Kitchen" 35 --json
//! ```

use clap::Parser;
use tracing_subscriber::EnvFilter;

use nestcast::cli::{Cli, Command, ExitCode, Output};
use nestcast::commands;
use nestcast::config::Config;
use nestcast::stream::monitor::{restore_now, restore_slot, RestoreSlot};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    let restore = restore_slot();
    install_panic_restore(restore.clone());

    run_cli(cli, config, restore).await.into()
}

/// Logs go to stderr; stdout is reserved for command output
fn init_tracing(verbose: bool) {
    let default = if verbose { "nestcast=debug" } else { "nestcast=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Put local audio back the way it was if anything panics mid-stream
fn install_panic_restore(slot: RestoreSlot) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        restore_now(&slot);
        previous(info);
    }));
}

/// Run CLI command and return exit code
async fn run_cli(cli: Cli, config: Config, restore: RestoreSlot) -> ExitCode {
    let output = Output::new(&cli);
    let host_ip = cli.host_ip;

    match cli.command {
        Command::Devices(cmd) => commands::devices_cmd(cmd, &config, &output).await,
        Command::Stream(cmd) => {
            let code = commands::stream_cmd(cmd, &config, host_ip, restore.clone(), &output).await;
            // Normal teardown already cleared it; this covers early-exit paths
            restore_now(&restore);
            code
        }
        Command::Volume(cmd) => commands::volume_cmd(cmd, &config, &output).await,
        Command::Probe(cmd) => commands::probe_cmd(cmd, &config, &output).await,
    }
}
