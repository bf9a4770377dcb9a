use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use cpu_powerstat::config::AppConfig;
use cpu_powerstat::monitor::PowerMonitor;
use cpu_powerstat::monitor_cpu_power;
use cpu_powerstat::storage::SysfsReader;
use tracing::{error, info};

fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.init();

	let path = std::env::args_os()
		.nth(1)
		.map_or_else(|| PathBuf::from("cpu-powerstat.toml"), PathBuf::from);

	let mut config = match AppConfig::load(&path) {
		Ok(config) => config,
		Err(err) => {
			error!("{err}");
			return ExitCode::FAILURE;
		},
	};

	// The storage reader resolves relative paths against the filesystem root
	if let Some(events) = config.powerstat.event_definitions.as_mut() {
		if let Ok(absolute) = std::path::absolute(&*events) {
			*events = absolute;
		}
	}

	let mut monitor = match PowerMonitor::new(&config.powerstat, Arc::new(SysfsReader::default())) {
		Ok(monitor) => monitor,
		Err(err) => {
			error!("failed to start monitor: {err}");
			return ExitCode::FAILURE;
		},
	};

	info!(
		vendor = ?monitor.topology.features.vendor,
		model = format_args!("{:#x}", monitor.topology.features.model),
		interval_ms = config.interval_ms,
		"monitoring cpu power"
	);

	match monitor_cpu_power(&mut monitor, config.interval(), std::io::stdout().lock()) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!("failed to write metrics: {err}");
			ExitCode::FAILURE
		},
	}
}
