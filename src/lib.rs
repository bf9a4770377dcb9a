pub mod capability;
pub mod config;
pub mod constants;
pub mod cpu_type;
pub mod dispatch;
pub mod display;
pub mod energy;
pub mod error;
pub mod frequency;
pub mod monitor;
pub mod msr;
pub mod perf;
pub mod storage;
pub mod topology;
pub mod util;

use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::dispatch::LogOnce;
use crate::display::LineProtocolWriter;
use crate::monitor::PowerMonitor;

/// Gathers metrics every `interval` and writes them as line protocol to `out`
///
/// Runs until writing to `out` fails.
pub fn monitor_cpu_power<W: Write>(monitor: &mut PowerMonitor, interval: Duration, out: W) -> io::Result<()> {
	let log_once = LogOnce::new();
	let mut writer = LineProtocolWriter::new(out);

	loop {
		let started = Instant::now();
		monitor.gather(&mut writer, &log_once);
		writer.flush()?;
		debug!(elapsed = ?started.elapsed(), errors = writer.error_count(), "gather cycle finished");

		thread::sleep(interval.saturating_sub(started.elapsed()));
	}
}
