use std::process::ExitCode;

use chrono_event_cli::{run_cli, Cli, ErrorEnvelope};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let envelope = ErrorEnvelope::from_error(&err);
            match serde_json::to_string(&envelope) {
                Ok(rendered) => eprintln!("{rendered}"),
                Err(_) => eprintln!("{}: {}", envelope.code, envelope.message),
            }
            ExitCode::FAILURE
        }
    }
}
