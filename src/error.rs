use std::io;
use std::path::PathBuf;

/// Errors that prevent the monitor from starting.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("invalid {domain} metric {name:?}")]
	UnknownMetric { domain: &'static str, name: String },

	#[error("{domain} metric {name:?} is listed more than once")]
	DuplicateMetric { domain: &'static str, name: String },

	#[error("invalid core range {0:?}")]
	InvalidRange(String),

	#[error("invalid core id {0:?}")]
	InvalidCoreId(String),

	#[error("core {0} is selected more than once")]
	DuplicateCore(usize),

	#[error("included_cpus and excluded_cpus are mutually exclusive")]
	ConflictingCpuSelectors,

	#[error("cpu {0} is not available on this system")]
	UnknownCpu(usize),

	#[error("event_definitions must be set when C0 substate metrics are enabled")]
	MissingEventDefinitions,

	#[error("event definitions file {path} is not accessible: {source}")]
	EventDefinitionsNotFound {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("event definitions file {0} must not be a symbolic link")]
	EventDefinitionsSymlink(PathBuf),

	#[error("msr_read_timeout must not be negative, got {0} ms")]
	NegativeTimeout(i64),

	#[error("no cpu or package metrics are enabled")]
	NoMetricsEnabled,

	#[error("failed to detect cpu information: {0}")]
	CpuInfo(#[source] AcquisitionError),

	#[error("failed to read configuration file {path}: {source}")]
	ReadFile {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("failed to parse configuration file {path}: {source}")]
	ParseFile {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
}

/// Errors raised while acquiring a single metric; they never abort a cycle.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
	#[error("module {module} is not initialized")]
	ModuleNotInitialized { module: &'static str },

	#[error("failed to read {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("failed to parse {value:?} from {path}")]
	Parse { path: PathBuf, value: String },

	#[error("{} of 8 register reads failed on cpu {cpu}: {}", .failures.len(), describe_failures(.failures))]
	RegisterBatch { cpu: usize, failures: Vec<(u64, io::Error)> },

	#[error("zero interval between energy reads on package {0}")]
	ZeroInterval(usize),

	#[error("{counter} delta is zero on cpu {cpu}")]
	ZeroDelta { cpu: usize, counter: &'static str },

	#[error("no register snapshot for cpu {0}")]
	MissingSnapshot(usize),

	#[error("energy {energy} J exceeds max energy range {max_range} J on package {package}")]
	InvalidEnergyRange { package: usize, energy: f64, max_range: f64 },

	#[error("perf event {0} is not defined")]
	UnknownEvent(String),

	#[error("cpu {0} is not part of the topology")]
	UnknownCpu(usize),

	#[error("no rapl domain for package {0}")]
	UnknownPackage(usize),

	#[error("no dram rapl domain for package {0}")]
	MissingDramDomain(usize),
}

impl AcquisitionError {
	pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
		Self::Io { path: path.into(), source }
	}
}

fn describe_failures(failures: &[(u64, io::Error)]) -> String {
	failures
		.iter()
		.map(|(offset, err)| format!("offset {offset:#x}: {err}"))
		.collect::<Vec<_>>()
		.join(", ")
}
