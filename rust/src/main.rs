mod client;
mod config;
mod endpoints;
mod error;
mod logs;
mod metrics;
mod relay;
mod server;
mod staging;
mod support;
mod validate;

use crate::config::{parse_cli_command, CliCommand};
use crate::support::telemetry::init_telemetry;

const EARLY_FAILURE_EXIT_CODE: i32 = 2;

#[tokio::main]
async fn main() {
    let cli_command = match parse_cli_command() {
        Ok(command) => command,
        Err(err) => {
            eprintln!("[cmdstream] Error: {err}");
            std::process::exit(1);
        }
    };

    match cli_command {
        CliCommand::Serve(config) => {
            init_telemetry(config.log_level, "serve");
            if let Err(err) = server::run(*config).await {
                tracing::error!("Fatal error: {err}");
                std::process::exit(1);
            }
        }
        CliCommand::Invoke(config) => {
            init_telemetry(config.log_level, "invoke");
            match client::run(config).await {
                Ok(code) => std::process::exit(code),
                Err(err) => {
                    eprintln!("[cmdstream] Error: {err}");
                    std::process::exit(EARLY_FAILURE_EXIT_CODE);
                }
            }
        }
        CliCommand::Logs(config) => {
            if let Err(err) = logs::run(config).await {
                eprintln!("[cmdstream] Error: {err}");
                std::process::exit(1);
            }
        }
    }
}
