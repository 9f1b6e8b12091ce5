use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pw-fleet")]
#[command(about = "Run scheduled browser automation for a fleet of accounts")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug, -vvv trace)
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Fleet configuration file (JSON)
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Account file (JSON); overrides the config's `accounts`
	#[arg(short, long, value_name = "FILE")]
	pub accounts: Option<PathBuf>,

	/// Maximum number of tasks running at once
	#[arg(long, value_name = "N")]
	pub concurrency: Option<usize>,

	/// Chrome/Chromium executable for session hosts and surfaces
	#[arg(long, value_name = "PATH")]
	pub chromium: Option<PathBuf>,

	/// Show session-host browser windows
	#[arg(long)]
	pub headful: bool,

	/// Load configuration and accounts, print the plan, and exit
	#[arg(long)]
	pub check: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_overrides() {
		let cli = Cli::try_parse_from([
			"pw-fleet",
			"-vv",
			"--config",
			"fleet.json",
			"--accounts",
			"accounts.json",
			"--concurrency",
			"8",
			"--headful",
		])
		.unwrap();

		assert_eq!(cli.verbose, 2);
		assert_eq!(cli.config, Some(PathBuf::from("fleet.json")));
		assert_eq!(cli.accounts, Some(PathBuf::from("accounts.json")));
		assert_eq!(cli.concurrency, Some(8));
		assert!(cli.headful);
		assert!(!cli.check);
	}

	#[test]
	fn everything_is_optional() {
		let cli = Cli::try_parse_from(["pw-fleet"]).unwrap();
		assert_eq!(cli.verbose, 0);
		assert!(cli.config.is_none());
		assert!(cli.chromium.is_none());
	}

	#[test]
	fn rejects_non_numeric_concurrency() {
		assert!(Cli::try_parse_from(["pw-fleet", "--concurrency", "many"]).is_err());
	}
}
