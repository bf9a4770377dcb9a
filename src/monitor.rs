use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::capability::disable_unsupported_metrics;
use crate::config::{Config, CpuMetric, PackageMetric, parse_core_selector};
use crate::constants::{SYS_CPU_PATH, UNCORE_FREQUENCY_PATH};
use crate::dispatch::{Accumulator, Dispatcher, LogOnce, MetricValue, Sample, Scope};
use crate::energy::{PackagePower, RaplEngine};
use crate::error::{AcquisitionError, ConfigError};
use crate::frequency::{base_frequency, cpu_frequency, turbo_limits, uncore_frequency};
use crate::msr::{Counter, MsrEngine, MsrSnapshot};
use crate::perf::{CounterOpener, PerfEngine, PerfEventOpener, Substate, load_event_definitions};
use crate::storage::StorageReader;
use crate::topology::CpuTopology;

const MSR_MODULE: &str = "msr";
const RAPL_MODULE: &str = "rapl";
const PERF_MODULE: &str = "perf";
const CPUFREQ_MODULE: &str = "cpufreq";
const UNCORE_MODULE: &str = "uncore_frequency";

/// Gathers CPU and package telemetry according to a validated configuration
///
/// Modules that fail to start leave their slot empty; metrics depending on
/// them report [`AcquisitionError::ModuleNotInitialized`].
#[derive(Debug)]
pub struct PowerMonitor {
	reader: Arc<dyn StorageReader>,
	pub topology: CpuTopology,
	cpu_metrics: Vec<CpuMetric>,
	package_metrics: Vec<PackageMetric>,
	msr: Option<MsrEngine>,
	rapl: Option<RaplEngine>,
	perf: Option<PerfEngine>,
	cpufreq: bool,
	uncore: bool,
}

impl PowerMonitor {
	/// Creates a monitor reading hardware through `reader`
	pub fn new(config: &Config, reader: Arc<dyn StorageReader>) -> Result<Self, ConfigError> {
		Self::with_counter_opener(config, reader, Box::new(PerfEventOpener))
	}

	/// Creates a monitor opening perf counters through `opener`
	pub fn with_counter_opener(
		config: &Config,
		reader: Arc<dyn StorageReader>,
		opener: Box<dyn CounterOpener>,
	) -> Result<Self, ConfigError> {
		let timeout = config.msr_timeout()?;
		let mut cpu_metrics = config.cpu_metric_selection()?;
		let mut package_metrics = config.package_metric_selection()?;
		let included = parse_core_selector(config.included_cpus.as_slice())?;
		let excluded = parse_core_selector(config.excluded_cpus.as_slice())?;

		let mut topology = CpuTopology::detect(Arc::clone(&reader)).map_err(ConfigError::CpuInfo)?;
		topology.select_cpus(&included, &excluded)?;

		disable_unsupported_metrics(&topology.features, &mut cpu_metrics, &mut package_metrics);
		if cpu_metrics.is_empty() && package_metrics.is_empty() {
			return Err(ConfigError::NoMetricsEnabled);
		}

		let event_definitions = if cpu_metrics.iter().any(|metric| metric.is_perf_backed()) {
			let path = config.event_definitions.as_deref().ok_or(ConfigError::MissingEventDefinitions)?;
			check_event_definitions(reader.as_ref(), path)?;
			Some(path)
		} else {
			None
		};

		let mut monitor = Self {
			reader,
			topology,
			cpu_metrics,
			package_metrics,
			msr: None,
			rapl: None,
			perf: None,
			cpufreq: false,
			uncore: false,
		};
		monitor.start_modules(timeout, event_definitions, opener);

		info!(
			cpus = monitor.topology.active_cpu_ids().len(),
			cpu_metrics = ?monitor.cpu_metrics,
			package_metrics = ?monitor.package_metrics,
			"power monitor ready"
		);
		Ok(monitor)
	}

	/// Starts every module an enabled metric depends on
	fn start_modules(
		&mut self,
		timeout: Option<Duration>,
		event_definitions: Option<&Path>,
		opener: Box<dyn CounterOpener>,
	) {
		let first_cpu = self.topology.available_cpu_ids().first().copied().unwrap_or_default();

		if self.cpu_metrics.iter().any(|metric| metric.is_msr_backed())
			|| self.package_metrics.iter().any(|metric| metric.is_msr_backed())
		{
			let msr = MsrEngine::new(Arc::clone(&self.reader), timeout);
			match msr.probe(first_cpu) {
				Ok(()) => self.msr = Some(msr),
				Err(err) => warn!("failed to start {MSR_MODULE} module: {err}"),
			}
		}

		if self.package_metrics.iter().any(|metric| metric.is_rapl_backed()) {
			let mut rapl = RaplEngine::new(Arc::clone(&self.reader));
			match rapl.refresh_domains() {
				Ok(()) if !rapl.package_ids().is_empty() => self.rapl = Some(rapl),
				Ok(()) => warn!("failed to start {RAPL_MODULE} module: no package domains found"),
				Err(err) => warn!("failed to start {RAPL_MODULE} module: {err}"),
			}
		}

		if let Some(path) = event_definitions {
			match self.start_perf(path, opener) {
				Ok(perf) => self.perf = Some(perf),
				Err(err) => warn!("failed to start {PERF_MODULE} module: {err}"),
			}
		}

		if self.cpu_metrics.contains(&CpuMetric::Frequency) {
			let cpufreq = Path::new(SYS_CPU_PATH).join(format!("cpu{first_cpu}/cpufreq"));
			match self.reader.list_dir(&cpufreq) {
				Ok(_) => self.cpufreq = true,
				Err(err) => warn!("failed to start {CPUFREQ_MODULE} module: {}: {err}", cpufreq.display()),
			}
		}

		if self.package_metrics.contains(&PackageMetric::UncoreFrequency) {
			match self.reader.list_dir(Path::new(UNCORE_FREQUENCY_PATH)) {
				Ok(_) => self.uncore = true,
				Err(err) => warn!("failed to start {UNCORE_MODULE} module: {UNCORE_FREQUENCY_PATH}: {err}"),
			}
		}
	}

	fn start_perf(&self, path: &Path, opener: Box<dyn CounterOpener>) -> Result<PerfEngine, AcquisitionError> {
		let definitions = load_event_definitions(self.reader.as_ref(), path)?;
		let mut perf = PerfEngine::new(&definitions, opener)?;
		match perf.activate(self.topology.active_cpu_ids()) {
			0 => Err(AcquisitionError::ModuleNotInitialized { module: PERF_MODULE }),
			cpus => {
				debug!(cpus, "opened perf counters");
				Ok(perf)
			},
		}
	}

	pub fn cpu_metrics(&self) -> &[CpuMetric] {
		&self.cpu_metrics
	}

	pub fn package_metrics(&self) -> &[PackageMetric] {
		&self.package_metrics
	}

	/// Runs one gather cycle, reporting package metrics first and CPU metrics second
	///
	/// Failures only affect the metric and ID they occur on.
	pub fn gather(&mut self, acc: &mut dyn Accumulator, log_once: &LogOnce) {
		let mut dispatcher = Dispatcher::new(acc, log_once);

		if !self.package_metrics.is_empty() {
			if let Some(rapl) = self.rapl.as_mut() {
				if let Err(err) = rapl.refresh_domains() {
					dispatcher.error(err);
				}
			}
			for package_id in self.topology.package_ids() {
				self.gather_package(package_id, &mut dispatcher);
			}
		}

		if !self.cpu_metrics.is_empty() {
			for cpu_id in self.topology.active_cpu_ids().to_vec() {
				self.gather_cpu(cpu_id, &mut dispatcher);
			}
		}
	}

	fn gather_package(&mut self, package_id: usize, dispatcher: &mut Dispatcher<'_>) {
		let wants_power = self.package_metrics.iter().any(|metric| {
			matches!(
				metric,
				PackageMetric::CurrentPowerConsumption | PackageMetric::CurrentDramPowerConsumption
			)
		});
		let power = match (wants_power, self.rapl.as_mut()) {
			(true, Some(rapl)) => rapl.retrieve_and_compute(package_id).unwrap_or_else(|err| {
				dispatcher.error(err);
				None
			}),
			_ => None,
		};

		let scope = Scope::Package(package_id);
		for &metric in &self.package_metrics {
			match metric {
				PackageMetric::CurrentPowerConsumption | PackageMetric::CurrentDramPowerConsumption => {
					self.report_power(metric, scope, power, dispatcher);
				},
				PackageMetric::ThermalDesignPower => {
					let result = started(&self.rapl, RAPL_MODULE).and_then(|rapl| rapl.constraint_max_power_watts(package_id));
					dispatcher.value(metric, scope, result);
				},
				PackageMetric::CpuBaseFrequency => {
					let result = self
						.package_cpu(package_id)
						.and_then(|cpu| base_frequency(started(&self.msr, MSR_MODULE)?, cpu));
					dispatcher.value(metric, scope, result);
				},
				PackageMetric::MaxTurboFrequency => dispatcher.samples(metric, scope, self.turbo_samples(package_id)),
				PackageMetric::UncoreFrequency => dispatcher.samples(metric, scope, self.uncore_samples(package_id)),
			}
		}
	}

	fn report_power(
		&self,
		metric: PackageMetric,
		scope: Scope,
		power: Option<PackagePower>,
		dispatcher: &mut Dispatcher<'_>,
	) {
		if self.rapl.is_none() {
			dispatcher.failure(metric, AcquisitionError::ModuleNotInitialized { module: RAPL_MODULE });
			return;
		}
		// No power yet while the energy counters are primed, or after a failed read
		let Some(power) = power else {
			return;
		};

		match (metric, power.dram, scope) {
			(PackageMetric::CurrentDramPowerConsumption, Some(dram), _) => {
				dispatcher.value(metric, scope, Ok::<_, AcquisitionError>(dram));
			},
			(PackageMetric::CurrentDramPowerConsumption, None, Scope::Package(package_id)) => {
				dispatcher.failure(metric, AcquisitionError::MissingDramDomain(package_id));
			},
			_ => dispatcher.value(metric, scope, Ok::<_, AcquisitionError>(power.socket)),
		}
	}

	fn turbo_samples(&self, package_id: usize) -> Result<Vec<Sample>, AcquisitionError> {
		let msr = started(&self.msr, MSR_MODULE)?;
		let cpu = self.package_cpu(package_id)?;
		let limits = turbo_limits(msr, &self.topology.features, cpu)?;

		Ok(limits
			.into_iter()
			.map(|limit| {
				let sample = Sample::default()
					.field("max_turbo_frequency_mhz", limit.frequency_mhz)
					.tag("active_cores", limit.active_cores);
				match limit.hybrid {
					Some(core_type) => sample.tag("hybrid", core_type),
					None => sample,
				}
			})
			.collect())
	}

	fn uncore_samples(&self, package_id: usize) -> Result<Vec<Sample>, AcquisitionError> {
		if !self.uncore {
			return Err(AcquisitionError::ModuleNotInitialized { module: UNCORE_MODULE });
		}
		let cpu = self.package_cpu(package_id)?;

		let mut samples = Vec::new();
		for die in self.topology.die_ids(package_id) {
			let uncore = uncore_frequency(self.reader.as_ref(), self.msr.as_ref(), package_id, die, cpu)?;
			samples.push(
				Sample::default()
					.field("uncore_frequency_limit_mhz_min", uncore.initial_min)
					.field("uncore_frequency_limit_mhz_max", uncore.initial_max)
					.tag("die", die)
					.tag("type", "initial"),
			);
			samples.push(
				Sample::default()
					.field("uncore_frequency_limit_mhz_min", uncore.min)
					.field("uncore_frequency_limit_mhz_max", uncore.max)
					.field("uncore_frequency_mhz_cur", uncore.current)
					.tag("die", die)
					.tag("type", "current"),
			);
		}
		Ok(samples)
	}

	/// First CPU of a package, used for package-wide register reads
	fn package_cpu(&self, package_id: usize) -> Result<usize, AcquisitionError> {
		self.topology
			.cpus_in_package(package_id)
			.first()
			.copied()
			.ok_or(AcquisitionError::UnknownPackage(package_id))
	}

	fn gather_cpu(&mut self, cpu_id: usize, dispatcher: &mut Dispatcher<'_>) {
		let descriptor = match self.topology.resolve(cpu_id) {
			Ok(descriptor) => descriptor,
			Err(err) => {
				dispatcher.error(err);
				return;
			},
		};

		let mut snapshot_failed = false;
		if self.cpu_metrics.iter().any(|&metric| needs_snapshot(metric)) {
			if let Some(msr) = self.msr.as_mut() {
				if let Err(err) = msr.update_snapshot(cpu_id) {
					dispatcher.error(err);
					snapshot_failed = true;
				}
			}
		}

		let mut perf_failed = false;
		if self.cpu_metrics.iter().any(|metric| metric.is_perf_backed()) {
			if let Some(perf) = self.perf.as_mut() {
				if let Err(err) = perf.update(cpu_id) {
					dispatcher.error(err);
					perf_failed = true;
				}
			}
		}

		let scope = Scope::Cpu(descriptor);
		for &metric in &self.cpu_metrics {
			if (snapshot_failed && needs_snapshot(metric)) || (perf_failed && metric.is_perf_backed()) {
				continue;
			}
			match self.cpu_metric_value(metric, cpu_id) {
				Ok(Some(value)) => dispatcher.value(metric, scope, Ok::<_, AcquisitionError>(value)),
				Ok(None) => {},
				Err(err) => dispatcher.failure(metric, err),
			}
		}
	}

	/// Computes one CPU metric; `None` while its counters have fewer than two samples
	fn cpu_metric_value(&self, metric: CpuMetric, cpu: usize) -> Result<Option<MetricValue>, AcquisitionError> {
		match metric {
			CpuMetric::Frequency => {
				if !self.cpufreq {
					return Err(AcquisitionError::ModuleNotInitialized { module: CPUFREQ_MODULE });
				}
				cpu_frequency(self.reader.as_ref(), cpu).map(|mhz| Some(mhz.into()))
			},
			CpuMetric::Temperature => started(&self.msr, MSR_MODULE)?
				.get_temperature(cpu)
				.map(|celsius| Some(celsius.into())),
			CpuMetric::C0StateResidency => self.from_snapshot(cpu, |snapshot| snapshot.residency(cpu, Counter::Mperf)),
			CpuMetric::C1StateResidency => self.from_snapshot(cpu, |snapshot| snapshot.c1_residency(cpu)),
			CpuMetric::C3StateResidency => self.from_snapshot(cpu, |snapshot| snapshot.residency(cpu, Counter::C3)),
			CpuMetric::C6StateResidency => self.from_snapshot(cpu, |snapshot| snapshot.residency(cpu, Counter::C6)),
			CpuMetric::C7StateResidency => self.from_snapshot(cpu, |snapshot| snapshot.residency(cpu, Counter::C7)),
			CpuMetric::BusyFrequency => self.from_snapshot(cpu, |snapshot| snapshot.busy_frequency(cpu)),
			CpuMetric::C0SubstateC01 => self.from_perf(cpu, Substate::C01),
			CpuMetric::C0SubstateC02 => self.from_perf(cpu, Substate::C02),
			CpuMetric::C0SubstateC0Wait => self.from_perf(cpu, Substate::C0Wait),
		}
	}

	fn from_snapshot(
		&self,
		cpu: usize,
		compute: impl FnOnce(&MsrSnapshot) -> Result<f64, AcquisitionError>,
	) -> Result<Option<MetricValue>, AcquisitionError> {
		let snapshot = started(&self.msr, MSR_MODULE)?.snapshot(cpu)?;
		if !snapshot.has_deltas() {
			return Ok(None);
		}
		compute(snapshot).map(|value| Some(value.into()))
	}

	fn from_perf(&self, cpu: usize, substate: Substate) -> Result<Option<MetricValue>, AcquisitionError> {
		let perf = started(&self.perf, PERF_MODULE)?;
		if !perf.has_deltas(cpu) {
			return Ok(None);
		}
		perf.residency(cpu, substate).map(|value| Some(value.into()))
	}
}

/// Metrics derived from the per-CPU register snapshot
fn needs_snapshot(metric: CpuMetric) -> bool {
	metric.is_msr_backed() && metric != CpuMetric::Temperature
}

fn started<'a, T>(module: &'a Option<T>, name: &'static str) -> Result<&'a T, AcquisitionError> {
	module
		.as_ref()
		.ok_or(AcquisitionError::ModuleNotInitialized { module: name })
}

fn check_event_definitions(reader: &dyn StorageReader, path: &Path) -> Result<(), ConfigError> {
	match reader.is_symlink(path) {
		Ok(false) => Ok(()),
		Ok(true) => Err(ConfigError::EventDefinitionsSymlink(path.to_path_buf())),
		Err(source) => Err(ConfigError::EventDefinitionsNotFound {
			path: path.to_path_buf(),
			source,
		}),
	}
}
