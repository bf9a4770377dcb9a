use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::constants::{DEFAULT_INTERVAL_MS, MAX_CPU_ID};
use crate::error::ConfigError;

/// Configuration file of the `cpu-powerstat` binary
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
	/// Milliseconds between gather cycles
	pub interval_ms: u64,
	pub powerstat: Config,
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			interval_ms: DEFAULT_INTERVAL_MS,
			powerstat: Config::default(),
		}
	}
}

impl AppConfig {
	/// Loads the configuration file, falling back to defaults when it does not exist
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		if !path.exists() {
			info!("{} not found, using default configuration", path.display());
			return Ok(Self::default());
		}

		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
			path: path.to_path_buf(),
			source,
		})?;
		let config = toml::from_str(&content).map_err(|source| ConfigError::ParseFile {
			path: path.to_path_buf(),
			source,
		})?;
		info!("loaded configuration from {}", path.display());
		Ok(config)
	}

	pub fn interval(&self) -> Duration {
		Duration::from_millis(self.interval_ms)
	}
}

/// Monitor configuration as handed over by the harness.
///
/// `package_metrics` distinguishes an absent value (`None`, the default set)
/// from an explicitly empty list (no package metrics).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
	pub cpu_metrics: Vec<String>,
	pub package_metrics: Option<Vec<String>>,
	pub included_cpus: Vec<String>,
	pub excluded_cpus: Vec<String>,
	pub event_definitions: Option<PathBuf>,
	/// Milliseconds; 0 disables the timeout
	pub msr_read_timeout: i64,
}

impl Config {
	pub fn cpu_metric_selection(&self) -> Result<Vec<CpuMetric>, ConfigError> {
		validate_metric_selection(self.cpu_metrics.as_slice())
	}

	pub fn package_metric_selection(&self) -> Result<Vec<PackageMetric>, ConfigError> {
		match &self.package_metrics {
			Some(requested) => validate_metric_selection(requested.as_slice()),
			None => Ok(PackageMetric::DEFAULT.to_vec()),
		}
	}

	pub fn msr_timeout(&self) -> Result<Option<Duration>, ConfigError> {
		match self.msr_read_timeout {
			ms if ms < 0 => Err(ConfigError::NegativeTimeout(ms)),
			0 => Ok(None),
			ms => Ok(Some(Duration::from_millis(ms.unsigned_abs()))),
		}
	}
}

/// Closed set of metric identifiers belonging to one class
pub trait MetricName: Copy + Eq + fmt::Debug + 'static {
	/// Class name used in error messages
	const DOMAIN: &'static str;
	const ALL: &'static [Self];

	fn name(self) -> &'static str;
	fn unit(self) -> &'static str;

	fn from_name(name: &str) -> Option<Self> {
		Self::ALL.iter().copied().find(|metric| metric.name() == name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMetric {
	Frequency,
	Temperature,
	C0StateResidency,
	C1StateResidency,
	C3StateResidency,
	C6StateResidency,
	C7StateResidency,
	BusyFrequency,
	C0SubstateC01,
	C0SubstateC02,
	C0SubstateC0Wait,
}

impl CpuMetric {
	/// Metrics computed from the per-CPU MSR snapshot
	pub fn is_msr_backed(self) -> bool {
		!matches!(
			self,
			CpuMetric::Frequency | CpuMetric::C0SubstateC01 | CpuMetric::C0SubstateC02 | CpuMetric::C0SubstateC0Wait
		)
	}

	/// Metrics computed from perf-event counters
	pub fn is_perf_backed(self) -> bool {
		matches!(
			self,
			CpuMetric::C0SubstateC01 | CpuMetric::C0SubstateC02 | CpuMetric::C0SubstateC0Wait
		)
	}
}

impl MetricName for CpuMetric {
	const DOMAIN: &'static str = "cpu";
	const ALL: &'static [Self] = &[
		CpuMetric::Frequency,
		CpuMetric::Temperature,
		CpuMetric::C0StateResidency,
		CpuMetric::C1StateResidency,
		CpuMetric::C3StateResidency,
		CpuMetric::C6StateResidency,
		CpuMetric::C7StateResidency,
		CpuMetric::BusyFrequency,
		CpuMetric::C0SubstateC01,
		CpuMetric::C0SubstateC02,
		CpuMetric::C0SubstateC0Wait,
	];

	fn name(self) -> &'static str {
		match self {
			CpuMetric::Frequency => "cpu_frequency",
			CpuMetric::Temperature => "cpu_temperature",
			CpuMetric::C0StateResidency => "cpu_c0_state_residency",
			CpuMetric::C1StateResidency => "cpu_c1_state_residency",
			CpuMetric::C3StateResidency => "cpu_c3_state_residency",
			CpuMetric::C6StateResidency => "cpu_c6_state_residency",
			CpuMetric::C7StateResidency => "cpu_c7_state_residency",
			CpuMetric::BusyFrequency => "cpu_busy_frequency",
			CpuMetric::C0SubstateC01 => "cpu_c0_substate_c01",
			CpuMetric::C0SubstateC02 => "cpu_c0_substate_c02",
			CpuMetric::C0SubstateC0Wait => "cpu_c0_substate_c0_wait",
		}
	}

	fn unit(self) -> &'static str {
		match self {
			CpuMetric::Frequency | CpuMetric::BusyFrequency => "mhz",
			CpuMetric::Temperature => "celsius",
			_ => "percent",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageMetric {
	CurrentPowerConsumption,
	CurrentDramPowerConsumption,
	ThermalDesignPower,
	CpuBaseFrequency,
	UncoreFrequency,
	MaxTurboFrequency,
}

impl PackageMetric {
	pub const DEFAULT: [PackageMetric; 3] = [
		PackageMetric::CurrentPowerConsumption,
		PackageMetric::CurrentDramPowerConsumption,
		PackageMetric::ThermalDesignPower,
	];

	pub fn is_rapl_backed(self) -> bool {
		matches!(
			self,
			PackageMetric::CurrentPowerConsumption
				| PackageMetric::CurrentDramPowerConsumption
				| PackageMetric::ThermalDesignPower
		)
	}

	pub fn is_msr_backed(self) -> bool {
		matches!(self, PackageMetric::CpuBaseFrequency | PackageMetric::MaxTurboFrequency)
	}
}

impl MetricName for PackageMetric {
	const DOMAIN: &'static str = "package";
	const ALL: &'static [Self] = &[
		PackageMetric::CurrentPowerConsumption,
		PackageMetric::CurrentDramPowerConsumption,
		PackageMetric::ThermalDesignPower,
		PackageMetric::CpuBaseFrequency,
		PackageMetric::UncoreFrequency,
		PackageMetric::MaxTurboFrequency,
	];

	fn name(self) -> &'static str {
		match self {
			PackageMetric::CurrentPowerConsumption => "current_power_consumption",
			PackageMetric::CurrentDramPowerConsumption => "current_dram_power_consumption",
			PackageMetric::ThermalDesignPower => "thermal_design_power",
			PackageMetric::CpuBaseFrequency => "cpu_base_frequency",
			PackageMetric::UncoreFrequency => "uncore_frequency",
			PackageMetric::MaxTurboFrequency => "max_turbo_frequency",
		}
	}

	fn unit(self) -> &'static str {
		match self {
			PackageMetric::CurrentPowerConsumption
			| PackageMetric::CurrentDramPowerConsumption
			| PackageMetric::ThermalDesignPower => "watts",
			PackageMetric::CpuBaseFrequency | PackageMetric::UncoreFrequency | PackageMetric::MaxTurboFrequency => "mhz",
		}
	}
}

macro_rules! metric_string_conversions {
	($($metric:ty),*) => {$(
		impl fmt::Display for $metric {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(self.name())
			}
		}

		impl FromStr for $metric {
			type Err = ConfigError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::from_name(s).ok_or_else(|| ConfigError::UnknownMetric {
					domain: Self::DOMAIN,
					name: s.to_string(),
				})
			}
		}
	)*};
}

metric_string_conversions!(CpuMetric, PackageMetric);

/// Converts requested metric names into identifiers, rejecting unknown names and duplicates
pub fn validate_metric_selection<M>(requested: &[impl AsRef<str>]) -> Result<Vec<M>, ConfigError>
where
	M: MetricName + FromStr<Err = ConfigError>,
{
	let mut selected = Vec::with_capacity(requested.len());
	for name in requested {
		let name = name.as_ref();
		let metric: M = name.parse()?;
		if selected.contains(&metric) {
			return Err(ConfigError::DuplicateMetric {
				domain: M::DOMAIN,
				name: name.to_string(),
			});
		}
		selected.push(metric);
	}
	Ok(selected)
}

/// Parses core selectors such as `["1-4,6", "8"]` into CPU IDs
///
/// Every token is a single ID or an inclusive `lo-hi` range. An ID may only
/// be selected once across all expressions, and none may exceed `MAX_CPU_ID`.
pub fn parse_core_selector(expressions: &[impl AsRef<str>]) -> Result<Vec<usize>, ConfigError> {
	let mut seen = HashSet::new();
	let mut cores = Vec::new();

	for expression in expressions {
		for token in expression.as_ref().split(',') {
			let token = token.trim();
			let (low, high) = match token.split_once('-') {
				Some((low, high)) => {
					let low = parse_core_id(low, token)?;
					let high = parse_core_id(high, token)?;
					if low > high || high > MAX_CPU_ID {
						return Err(ConfigError::InvalidRange(token.to_string()));
					}
					(low, high)
				},
				None => {
					let id = token
						.parse::<usize>()
						.ok()
						.filter(|&id| id <= MAX_CPU_ID)
						.ok_or_else(|| ConfigError::InvalidCoreId(token.to_string()))?;
					(id, id)
				},
			};

			for core in low..=high {
				if !seen.insert(core) {
					return Err(ConfigError::DuplicateCore(core));
				}
				cores.push(core);
			}
		}
	}

	Ok(cores)
}

fn parse_core_id(value: &str, token: &str) -> Result<usize, ConfigError> {
	value
		.trim()
		.parse()
		.map_err(|_| ConfigError::InvalidRange(token.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_single_range() {
		assert_eq!(parse_core_selector(&["5-10"]).unwrap(), vec![5, 6, 7, 8, 9, 10]);
	}

	#[test]
	fn parses_mixed_expressions() {
		let cores = parse_core_selector(&["1-4,6", "8", "10-12", "15,20"]).unwrap();
		assert_eq!(cores, vec![1, 2, 3, 4, 6, 8, 10, 11, 12, 15, 20]);
	}

	#[test]
	fn rejects_reversed_range() {
		assert!(matches!(
			parse_core_selector(&["10-1"]),
			Err(ConfigError::InvalidRange(range)) if range == "10-1"
		));
	}

	#[test]
	fn rejects_ids_beyond_cpu_limit() {
		assert!(matches!(
			parse_core_selector(&["0-4000000000"]),
			Err(ConfigError::InvalidRange(range)) if range == "0-4000000000"
		));
		assert!(matches!(parse_core_selector(&["8192"]), Err(ConfigError::InvalidCoreId(_))));
		assert_eq!(parse_core_selector(&["8190-8191"]).unwrap(), vec![8_190, 8_191]);
	}

	#[test]
	fn rejects_duplicates_across_expressions() {
		assert!(matches!(
			parse_core_selector(&["1-4,11", "10-12"]),
			Err(ConfigError::DuplicateCore(11))
		));
	}

	#[test]
	fn rejects_malformed_tokens() {
		assert!(matches!(parse_core_selector(&["a"]), Err(ConfigError::InvalidCoreId(_))));
		assert!(matches!(parse_core_selector(&["1,,2"]), Err(ConfigError::InvalidCoreId(_))));
		assert!(matches!(parse_core_selector(&["-1"]), Err(ConfigError::InvalidRange(_))));
		assert!(matches!(parse_core_selector(&["1-2-3"]), Err(ConfigError::InvalidRange(_))));
		assert!(parse_core_selector(&[] as &[&str]).unwrap().is_empty());
	}

	#[test]
	fn validates_metric_names() {
		let metrics: Vec<CpuMetric> = validate_metric_selection(&["cpu_frequency", "cpu_c0_substate_c0_wait"]).unwrap();
		assert_eq!(metrics, vec![CpuMetric::Frequency, CpuMetric::C0SubstateC0Wait]);

		assert!(matches!(
			validate_metric_selection::<CpuMetric>(&["cpu_frequency", "cpu_frequency"]),
			Err(ConfigError::DuplicateMetric { .. })
		));
		assert!(matches!(
			validate_metric_selection::<PackageMetric>(&["cpu_frequency"]),
			Err(ConfigError::UnknownMetric { domain: "package", .. })
		));
	}

	#[test]
	fn metric_validation_is_idempotent() {
		let first: Vec<PackageMetric> =
			validate_metric_selection(&["uncore_frequency", "thermal_design_power", "max_turbo_frequency"]).unwrap();
		let names: Vec<String> = first.iter().map(ToString::to_string).collect();
		let second: Vec<PackageMetric> = validate_metric_selection(names.as_slice()).unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn names_round_trip_through_strings() {
		for metric in CpuMetric::ALL {
			assert_eq!(metric.name().parse::<CpuMetric>().unwrap(), *metric);
		}
		for metric in PackageMetric::ALL {
			assert_eq!(metric.to_string().parse::<PackageMetric>().unwrap(), *metric);
		}
	}

	#[test]
	fn package_metrics_distinguish_absent_from_empty() {
		let absent = Config::default();
		assert_eq!(absent.package_metric_selection().unwrap(), PackageMetric::DEFAULT.to_vec());

		let empty = Config {
			package_metrics: Some(Vec::new()),
			..Config::default()
		};
		assert!(empty.package_metric_selection().unwrap().is_empty());
	}

	#[test]
	fn deserializes_from_toml() {
		let config: Config = toml::from_str(
			r#"
			cpu_metrics = ["cpu_frequency"]
			package_metrics = []
			excluded_cpus = ["0-1"]
			msr_read_timeout = 20
			"#,
		)
		.unwrap();
		assert_eq!(config.cpu_metrics, vec!["cpu_frequency"]);
		assert_eq!(config.package_metrics, Some(Vec::new()));
		assert_eq!(config.msr_timeout().unwrap(), Some(Duration::from_millis(20)));

		let defaults: Config = toml::from_str("").unwrap();
		assert!(defaults.package_metrics.is_none());
		assert_eq!(defaults.msr_timeout().unwrap(), None);
	}

	#[test]
	fn loads_application_config() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("powerstat.toml");
		std::fs::write(
			&path,
			r#"
			interval_ms = 500

			[powerstat]
			cpu_metrics = ["cpu_temperature", "cpu_busy_frequency"]
			included_cpus = ["0-3"]
			"#,
		)
		.unwrap();

		let config = AppConfig::load(&path).unwrap();
		assert_eq!(config.interval(), Duration::from_millis(500));
		assert_eq!(config.powerstat.cpu_metrics.len(), 2);
		assert!(config.powerstat.package_metrics.is_none());

		let defaults = AppConfig::load(&dir.path().join("missing.toml")).unwrap();
		assert_eq!(defaults.interval_ms, DEFAULT_INTERVAL_MS);

		std::fs::write(&path, "interval_ms = \"fast\"").unwrap();
		assert!(matches!(AppConfig::load(&path), Err(ConfigError::ParseFile { .. })));
	}

	#[test]
	fn rejects_negative_timeout() {
		let config = Config {
			msr_read_timeout: -1,
			..Config::default()
		};
		assert!(matches!(config.msr_timeout(), Err(ConfigError::NegativeTimeout(-1))));
	}
}
