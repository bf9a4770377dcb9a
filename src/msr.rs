use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::constants::*;
use crate::error::AcquisitionError;
use crate::storage::StorageReader;
use crate::util::cycles_to_megahertz;
use crate::util::msr::RegisterSource;

/// Register offsets read by one snapshot update
///
/// The first six are cumulative counters tracked as deltas, the last two are
/// temperature registers.
pub const SNAPSHOT_OFFSETS: [u64; 8] = [
	MSR_C3_RESIDENCY,
	MSR_C6_RESIDENCY,
	MSR_C7_RESIDENCY,
	MSR_MPERF,
	MSR_APERF,
	MSR_TIMESTAMP_COUNTER,
	MSR_TEMPERATURE_TARGET,
	MSR_THERM_STATUS,
];

/// Cumulative counters of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
	C3,
	C6,
	C7,
	Mperf,
	Aperf,
	Timestamp,
}

impl Counter {
	const fn slot(self) -> usize {
		self as usize
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Counter::C3 => "c3 residency",
			Counter::C6 => "c6 residency",
			Counter::C7 => "c7 residency",
			Counter::Mperf => "mperf",
			Counter::Aperf => "aperf",
			Counter::Timestamp => "timestamp counter",
		}
	}
}

const COUNTERS: usize = 6;

/// Latest register values of one CPU
#[derive(Debug, Clone, Default)]
pub struct MsrSnapshot {
	raw: [u64; COUNTERS],
	deltas: [u64; COUNTERS],

	/// Throttle temperature (TjMax) in Celsius
	pub throttle_temperature: u64,

	/// Thermal readout, in degrees Celsius below the throttle temperature
	pub temperature: u64,

	samples: u64,
	read_at: Option<Instant>,
	interval: Option<Duration>,
}

impl MsrSnapshot {
	fn apply(&mut self, values: [u64; 8], now: Instant) {
		for slot in 0..COUNTERS {
			// Counters are 64 bits wide; a wrap yields the modular difference
			self.deltas[slot] = values[slot].wrapping_sub(self.raw[slot]);
			self.raw[slot] = values[slot];
		}
		self.throttle_temperature = (values[6] & THROTTLE_TEMPERATURE_MASK) >> TEMPERATURE_SHIFT;
		self.temperature = (values[7] & CURRENT_TEMPERATURE_MASK) >> TEMPERATURE_SHIFT;
		self.interval = self.read_at.map(|last| now.duration_since(last));
		self.read_at = Some(now);
		self.samples += 1;
	}

	#[cfg(test)]
	fn raw(&self, counter: Counter) -> u64 {
		self.raw[counter.slot()]
	}

	pub fn delta(&self, counter: Counter) -> u64 {
		self.deltas[counter.slot()]
	}

	/// Deltas are meaningful once two updates have succeeded
	pub fn has_deltas(&self) -> bool {
		self.samples >= 2
	}

	/// Percentage of `counter` cycles relative to the timestamp counter
	pub fn residency(&self, cpu: usize, counter: Counter) -> Result<f64, AcquisitionError> {
		let tsc = self.nonzero_delta(cpu, Counter::Timestamp)?;
		Ok(PERCENTAGE_MULTIPLIER * self.delta(counter) as f64 / tsc as f64)
	}

	/// C1 residency is whatever the timestamp counter covers beyond C0, C3, C6 and C7
	///
	/// Counters are not read atomically, so their sum may exceed the timestamp
	/// delta; C1 is 0 in that case.
	pub fn c1_residency(&self, cpu: usize) -> Result<f64, AcquisitionError> {
		let tsc = self.nonzero_delta(cpu, Counter::Timestamp)?;
		let others = [Counter::Mperf, Counter::C3, Counter::C6, Counter::C7]
			.iter()
			.fold(0u64, |sum, &counter| sum.saturating_add(self.delta(counter)));

		if tsc <= others {
			return Ok(0.0);
		}
		Ok(PERCENTAGE_MULTIPLIER * (tsc - others) as f64 / tsc as f64)
	}

	/// Average frequency while not halted, in MHz
	pub fn busy_frequency(&self, cpu: usize) -> Result<f64, AcquisitionError> {
		let mperf = self.nonzero_delta(cpu, Counter::Mperf)?;
		let interval = self
			.interval
			.map(|interval| interval.as_secs_f64())
			.filter(|&secs| secs > 0.0)
			.ok_or(AcquisitionError::ZeroDelta {
				cpu,
				counter: "read interval",
			})?;

		let aperf_mperf = self.delta(Counter::Aperf) as f64 / mperf as f64;
		Ok(cycles_to_megahertz(self.delta(Counter::Timestamp)) * aperf_mperf / interval)
	}

	fn nonzero_delta(&self, cpu: usize, counter: Counter) -> Result<u64, AcquisitionError> {
		match self.delta(counter) {
			0 => Err(AcquisitionError::ZeroDelta {
				cpu,
				counter: counter.as_str(),
			}),
			delta => Ok(delta),
		}
	}
}

/// Register telemetry engine, owning one snapshot per CPU
///
/// An update reads eight registers of one CPU concurrently and commits them
/// only when all eight reads succeed.
#[derive(Debug)]
pub struct MsrEngine {
	reader: Arc<dyn StorageReader>,
	timeout: Option<Duration>,
	snapshots: HashMap<usize, MsrSnapshot>,
}

impl MsrEngine {
	pub fn new(reader: Arc<dyn StorageReader>, timeout: Option<Duration>) -> Self {
		Self {
			reader,
			timeout,
			snapshots: HashMap::new(),
		}
	}

	/// Verifies the register device of a CPU can be opened
	pub fn probe(&self, cpu: usize) -> Result<(), AcquisitionError> {
		let path = device_path(cpu);
		self.reader
			.open(&path)
			.map(drop)
			.map_err(|source| AcquisitionError::io(path, source))
	}

	/// Reads all snapshot registers of a CPU and updates its deltas
	///
	/// Either all eight registers are committed or the snapshot is left untouched.
	pub fn update_snapshot(&mut self, cpu: usize) -> Result<(), AcquisitionError> {
		let path = device_path(cpu);
		let device = self
			.reader
			.open(&path)
			.map_err(|source| AcquisitionError::io(&path, source))?;

		let values = read_offsets(&device, &SNAPSHOT_OFFSETS, self.timeout)
			.map_err(|failures| AcquisitionError::RegisterBatch { cpu, failures })?;

		let snapshot = self.snapshots.entry(cpu).or_default();
		snapshot.apply(values, Instant::now());
		debug!(cpu, samples = snapshot.samples, "updated msr snapshot");
		Ok(())
	}

	pub fn snapshot(&self, cpu: usize) -> Result<&MsrSnapshot, AcquisitionError> {
		self.snapshots.get(&cpu).ok_or(AcquisitionError::MissingSnapshot(cpu))
	}

	/// Current temperature of a CPU in Celsius
	///
	/// Reads the thermal status register on its own; the throttle temperature
	/// comes from the latest snapshot, or from one extra read without one.
	pub fn get_temperature(&self, cpu: usize) -> Result<u64, AcquisitionError> {
		let readout = (self.read_single(cpu, MSR_THERM_STATUS)? & CURRENT_TEMPERATURE_MASK) >> TEMPERATURE_SHIFT;
		let throttle = match self.snapshots.get(&cpu) {
			Some(snapshot) if snapshot.samples > 0 => snapshot.throttle_temperature,
			_ => (self.read_single(cpu, MSR_TEMPERATURE_TARGET)? & THROTTLE_TEMPERATURE_MASK) >> TEMPERATURE_SHIFT,
		};
		Ok(throttle.saturating_sub(readout))
	}

	/// Reads one register of a CPU synchronously
	pub fn read_single(&self, cpu: usize, offset: u64) -> Result<u64, AcquisitionError> {
		let path = device_path(cpu);
		let device = self
			.reader
			.open(&path)
			.map_err(|source| AcquisitionError::io(&path, source))?;
		device
			.read_register(offset)
			.map_err(|source| AcquisitionError::io(path, source))
	}
}

/// Reads `offsets` concurrently, one scoped thread per offset
///
/// Readers deliver results over a channel. After the first failure the
/// remaining readers drop their results instead of sending them, and the
/// function returns only once every reader has finished.
pub fn read_offsets(
	source: &dyn RegisterSource,
	offsets: &[u64; 8],
	timeout: Option<Duration>,
) -> Result<[u64; 8], Vec<(u64, io::Error)>> {
	let cancelled = AtomicBool::new(false);
	let (tx, rx) = mpsc::channel();

	thread::scope(|scope| {
		for (slot, &offset) in offsets.iter().enumerate() {
			let tx = tx.clone();
			let cancelled = &cancelled;
			scope.spawn(move || {
				if cancelled.load(Ordering::Acquire) {
					return;
				}
				let result = read_with_timeout(source, offset, timeout);
				if cancelled.load(Ordering::Acquire) {
					return;
				}
				// The receiver outlives every reader inside the scope
				let _ = tx.send((slot, offset, result));
			});
		}
		// Only reader-owned senders remain, so the loop ends when all readers are done
		drop(tx);

		let mut values = [0u64; 8];
		let mut failures = Vec::new();
		for (slot, offset, result) in rx {
			match result {
				Ok(value) => values[slot] = value,
				Err(err) => {
					cancelled.store(true, Ordering::Release);
					failures.push((offset, err));
				},
			}
		}

		if failures.is_empty() {
			Ok(values)
		} else {
			Err(failures)
		}
	})
}

fn read_with_timeout(source: &dyn RegisterSource, offset: u64, timeout: Option<Duration>) -> io::Result<u64> {
	let started = Instant::now();
	let value = source.read_register(offset)?;
	match timeout {
		Some(timeout) if started.elapsed() > timeout => Err(io::Error::new(
			io::ErrorKind::TimedOut,
			format!("read took longer than {timeout:?}"),
		)),
		_ => Ok(value),
	}
}

fn device_path(cpu: usize) -> PathBuf {
	Path::new(MSR_DEVICE_PATH).join(format!("{cpu}/msr"))
}
