use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over `-v`.
pub fn init_logging(verbose: u8) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.with_writer(std::io::stderr)
		.try_init()
		.ok();
}

fn default_directive(verbose: u8) -> &'static str {
	match verbose {
		0 => "warn,pw.fleet=info",
		1 => "info",
		2 => "info,pw.fleet=debug,pw_fleet=debug",
		_ => "trace",
	}
}
