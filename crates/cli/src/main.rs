use std::process::ExitCode;

use clap::Parser;
use pw_fleet_cli::{cli::Cli, logging, run};
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let code = match run::run(cli).await {
		Ok(code) => code,
		Err(err) => {
			error!(target = "pw.fleet", error = %format!("{err:#}"), "startup failed");
			run::EXIT_STARTUP_FAULT
		}
	};
	ExitCode::from(u8::try_from(code).unwrap_or(1))
}
