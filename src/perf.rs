use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::{PERCENTAGE_MULTIPLIER, PERF_EVENT_C0_WAIT, PERF_EVENT_C01, PERF_EVENT_C02, PERF_EVENT_THREAD};
use crate::error::AcquisitionError;
use crate::storage::StorageReader;

/// One event of a perfmon event-definition file
#[derive(Debug, Clone, Deserialize)]
struct EventDefinition {
	#[serde(rename = "EventName")]
	name: String,
	#[serde(rename = "EventCode")]
	code: String,
	#[serde(rename = "UMask", default)]
	umask: Option<String>,
	#[serde(rename = "CounterMask", default)]
	counter_mask: Option<String>,
	#[serde(rename = "Invert", default)]
	invert: Option<String>,
	#[serde(rename = "EdgeDetect", default)]
	edge_detect: Option<String>,
	#[serde(rename = "AnyThread", default)]
	any_thread: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventFile {
	Wrapped {
		#[serde(rename = "Events")]
		events: Vec<EventDefinition>,
	},
	Plain(Vec<EventDefinition>),
}

/// Event encoded for a `PERF_TYPE_RAW` counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
	pub name: String,
	pub config: u64,
}

impl EventDefinition {
	fn encode(&self) -> Option<RawEvent> {
		// Events valid on several codes list them comma separated; the first one is used
		let code = parse_number(self.code.split(',').next()?)?;
		let field = |value: &Option<String>| value.as_deref().map_or(Some(0), parse_number);

		let config = (code & 0xFF)
			| (field(&self.umask)? & 0xFF) << 8
			| (field(&self.edge_detect)? & 0x1) << 18
			| (field(&self.any_thread)? & 0x1) << 21
			| (field(&self.invert)? & 0x1) << 23
			| (field(&self.counter_mask)? & 0xFF) << 24;

		Some(RawEvent {
			name: self.name.clone(),
			config,
		})
	}
}

fn parse_number(value: &str) -> Option<u64> {
	let value = value.trim();
	match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
		Some(hex) => u64::from_str_radix(hex, 16).ok(),
		None => value.parse().ok(),
	}
}

/// Loads and encodes every event of an event-definition file, keyed by event name
pub fn load_event_definitions(
	reader: &dyn StorageReader,
	path: &Path,
) -> Result<HashMap<String, RawEvent>, AcquisitionError> {
	let content = reader
		.read_to_string(path)
		.map_err(|source| AcquisitionError::io(path, source))?;
	let file: EventFile = serde_json::from_str(&content).map_err(|err| AcquisitionError::Parse {
		path: path.to_path_buf(),
		value: err.to_string(),
	})?;

	let definitions = match file {
		EventFile::Wrapped { events } | EventFile::Plain(events) => events,
	};

	Ok(definitions
		.iter()
		.filter_map(|definition| {
			let encoded = definition.encode();
			if encoded.is_none() {
				debug!(event = %definition.name, "skipping event with unparsable encoding");
			}
			encoded
		})
		.map(|event| (event.name.clone(), event))
		.collect())
}

/// An open hardware counter
pub trait Counter: Debug + Send {
	/// Reads the cumulative count
	fn read(&mut self) -> io::Result<u64>;
}

/// Opens counters for raw events on a CPU
pub trait CounterOpener: Debug + Send + Sync {
	fn open(&self, cpu: usize, event: &RawEvent) -> io::Result<Box<dyn Counter>>;
}

const PERF_TYPE_RAW: u32 = 4;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 8;

/// Leading fields of `struct perf_event_attr` (PERF_ATTR_SIZE_VER1)
#[repr(C)]
#[derive(Debug, Default)]
struct PerfEventAttr {
	kind: u32,
	size: u32,
	config: u64,
	sample_period: u64,
	sample_type: u64,
	read_format: u64,
	flags: u64,
	wakeup_events: u32,
	bp_type: u32,
	config1: u64,
	config2: u64,
}

/// [`CounterOpener`] backed by `perf_event_open(2)`, counting on every process of a CPU
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfEventOpener;

impl CounterOpener for PerfEventOpener {
	fn open(&self, cpu: usize, event: &RawEvent) -> io::Result<Box<dyn Counter>> {
		let attr = PerfEventAttr {
			kind: PERF_TYPE_RAW,
			size: std::mem::size_of::<PerfEventAttr>() as u32,
			config: event.config,
			..PerfEventAttr::default()
		};
		let cpu = libc::c_int::try_from(cpu).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

		// SAFETY: attr is a valid, fully initialised perf_event_attr prefix whose size field matches
		let fd = unsafe {
			libc::syscall(
				libc::SYS_perf_event_open,
				&attr as *const PerfEventAttr,
				-1 as libc::pid_t,
				cpu,
				-1 as libc::c_int,
				PERF_FLAG_FD_CLOEXEC,
			)
		};
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}

		// SAFETY: the kernel returned a fresh descriptor owned by nobody else
		let file = unsafe { File::from_raw_fd(fd as RawFd) };
		Ok(Box::new(PerfCounter { file }))
	}
}

#[derive(Debug)]
struct PerfCounter {
	file: File,
}

impl Counter for PerfCounter {
	fn read(&mut self) -> io::Result<u64> {
		let mut buf = [0u8; 8];
		self.file.read_exact(&mut buf)?;
		Ok(u64::from_ne_bytes(buf))
	}
}

/// C0 substates reported as a share of unhalted thread cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Substate {
	C01,
	C02,
	C0Wait,
}

impl Substate {
	const fn slot(self) -> usize {
		self as usize
	}
}

const EVENT_NAMES: [&str; 4] = [PERF_EVENT_C01, PERF_EVENT_C02, PERF_EVENT_C0_WAIT, PERF_EVENT_THREAD];
const THREAD_SLOT: usize = 3;

#[derive(Debug)]
struct CpuCounters {
	counters: Vec<Box<dyn Counter>>,
	raw: [u64; 4],
	deltas: [u64; 4],
	samples: u64,
}

/// Perf-event engine with one counter group per CPU
///
/// Counters are opened with `perf_event_open(2)` from raw encodings read out
/// of an Intel perfmon event-definition file.
#[derive(Debug)]
pub struct PerfEngine {
	opener: Box<dyn CounterOpener>,
	events: Vec<RawEvent>,
	cpus: HashMap<usize, CpuCounters>,
}

impl PerfEngine {
	/// Picks the substate events out of the loaded definitions
	pub fn new(
		definitions: &HashMap<String, RawEvent>,
		opener: Box<dyn CounterOpener>,
	) -> Result<Self, AcquisitionError> {
		let events = EVENT_NAMES
			.iter()
			.map(|&name| {
				definitions
					.get(name)
					.cloned()
					.ok_or_else(|| AcquisitionError::UnknownEvent(name.to_string()))
			})
			.collect::<Result<Vec<_>, _>>()?;

		Ok(Self {
			opener,
			events,
			cpus: HashMap::new(),
		})
	}

	/// Opens counters on every CPU; CPUs whose counters fail to open are skipped
	///
	/// Returns the number of CPUs with open counters.
	pub fn activate(&mut self, cpus: &[usize]) -> usize {
		for &cpu in cpus {
			let counters = self
				.events
				.iter()
				.map(|event| self.opener.open(cpu, event))
				.collect::<io::Result<Vec<_>>>();

			match counters {
				Ok(counters) => {
					self.cpus.insert(
						cpu,
						CpuCounters {
							counters,
							raw: [0; 4],
							deltas: [0; 4],
							samples: 0,
						},
					);
				},
				Err(err) => warn!(cpu, "failed to open perf counters: {err}"),
			}
		}
		self.cpus.len()
	}

	/// Reads the counters of a CPU and updates their deltas
	pub fn update(&mut self, cpu: usize) -> Result<(), AcquisitionError> {
		let state = self.cpus.get_mut(&cpu).ok_or(AcquisitionError::UnknownCpu(cpu))?;

		let mut values = [0u64; 4];
		for (slot, counter) in state.counters.iter_mut().enumerate() {
			values[slot] = counter
				.read()
				.map_err(|source| AcquisitionError::io(format!("perf:{}@cpu{cpu}", EVENT_NAMES[slot]), source))?;
		}

		for (slot, value) in values.into_iter().enumerate() {
			state.deltas[slot] = value.wrapping_sub(state.raw[slot]);
			state.raw[slot] = value;
		}
		state.samples += 1;
		Ok(())
	}

	pub fn has_deltas(&self, cpu: usize) -> bool {
		self.cpus.get(&cpu).is_some_and(|state| state.samples >= 2)
	}

	/// Share of unhalted thread cycles spent in a substate, in percent
	pub fn residency(&self, cpu: usize, substate: Substate) -> Result<f64, AcquisitionError> {
		let state = self.cpus.get(&cpu).ok_or(AcquisitionError::UnknownCpu(cpu))?;
		let thread = state.deltas[THREAD_SLOT];
		if thread == 0 {
			return Err(AcquisitionError::ZeroDelta {
				cpu,
				counter: PERF_EVENT_THREAD,
			});
		}
		Ok(PERCENTAGE_MULTIPLIER * state.deltas[substate.slot()] as f64 / thread as f64)
	}
}
