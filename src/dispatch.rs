use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::error;

use crate::config::MetricName;
use crate::error::AcquisitionError;
use crate::topology::CpuDescriptor;
use crate::util::round_to_two_decimals;

pub const CORE_MEASUREMENT: &str = "powerstat_core";
pub const PACKAGE_MEASUREMENT: &str = "powerstat_package";

/// Value of a single metric field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
	Integer(u64),
	Float(f64),
}

impl MetricValue {
	/// Floats are reported with at most two decimals
	pub fn rounded(self) -> Self {
		match self {
			MetricValue::Float(value) => MetricValue::Float(round_to_two_decimals(value)),
			integer => integer,
		}
	}
}

impl From<u64> for MetricValue {
	fn from(value: u64) -> Self {
		MetricValue::Integer(value)
	}
}

impl From<f64> for MetricValue {
	fn from(value: f64) -> Self {
		MetricValue::Float(value)
	}
}

impl fmt::Display for MetricValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			MetricValue::Integer(value) => write!(f, "{value}i"),
			MetricValue::Float(value) => write!(f, "{value}"),
		}
	}
}

pub type Fields = BTreeMap<String, MetricValue>;
pub type Tags = BTreeMap<String, String>;

/// Sink receiving gathered metrics
pub trait Accumulator {
	fn add_gauge(&mut self, measurement: &str, fields: Fields, tags: Tags);
	fn add_error(&mut self, err: AcquisitionError);
}

/// Identity a metric is reported for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
	Cpu(CpuDescriptor),
	Package(usize),
}

impl Scope {
	fn measurement(self) -> &'static str {
		match self {
			Scope::Cpu(_) => CORE_MEASUREMENT,
			Scope::Package(_) => PACKAGE_MEASUREMENT,
		}
	}

	fn tags(self) -> Tags {
		match self {
			Scope::Cpu(cpu) => Tags::from([
				("cpu_id".to_string(), cpu.cpu_id.to_string()),
				("core_id".to_string(), cpu.core_id.to_string()),
				("package_id".to_string(), cpu.package_id.to_string()),
			]),
			Scope::Package(package_id) => Tags::from([("package_id".to_string(), package_id.to_string())]),
		}
	}
}

/// Record of a metric with several fields or extra tags
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
	pub fields: Fields,
	pub tags: Tags,
}

impl Sample {
	pub fn field(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
		self.fields.insert(name.into(), value.into());
		self
	}

	pub fn tag(mut self, name: impl Into<String>, value: impl ToString) -> Self {
		self.tags.insert(name.into(), value.to_string());
		self
	}
}

/// Remembers which (module, metric) pairs have already been reported
#[derive(Debug, Default)]
pub struct LogOnce {
	seen: Mutex<HashSet<(String, String)>>,
}

impl LogOnce {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns true the first time a pair is seen
	pub fn first_occurrence(&self, module: &str, metric: &str) -> bool {
		self.seen
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert((module.to_string(), metric.to_string()))
	}
}

/// Routes metric results of one gather cycle to an [`Accumulator`]
pub struct Dispatcher<'a> {
	acc: &'a mut dyn Accumulator,
	log_once: &'a LogOnce,
}

impl<'a> Dispatcher<'a> {
	pub fn new(acc: &'a mut dyn Accumulator, log_once: &'a LogOnce) -> Self {
		Self { acc, log_once }
	}

	/// Reports a single-valued metric as field `{name}_{unit}`
	pub fn value<M: MetricName>(
		&mut self,
		metric: M,
		scope: Scope,
		result: Result<impl Into<MetricValue>, AcquisitionError>,
	) {
		match result {
			Ok(value) => {
				let fields = Fields::from([(field_name(metric), value.into().rounded())]);
				self.acc.add_gauge(scope.measurement(), fields, scope.tags());
			},
			Err(err) => self.failure(metric, err),
		}
	}

	/// Reports a metric producing several records, each with its own fields and extra tags
	pub fn samples<M: MetricName>(&mut self, metric: M, scope: Scope, result: Result<Vec<Sample>, AcquisitionError>) {
		match result {
			Ok(samples) => {
				for sample in samples {
					let fields = sample
						.fields
						.into_iter()
						.map(|(name, value)| (name, value.rounded()))
						.collect();
					let mut tags = scope.tags();
					tags.extend(sample.tags);
					self.acc.add_gauge(scope.measurement(), fields, tags);
				}
			},
			Err(err) => self.failure(metric, err),
		}
	}

	/// Reports a failure not tied to a single metric
	pub fn error(&mut self, err: AcquisitionError) {
		self.acc.add_error(err);
	}

	/// Reports an acquisition failure of a metric
	///
	/// Uninitialized modules are logged once per metric; every other failure
	/// goes to the accumulator.
	pub fn failure<M: MetricName>(&mut self, metric: M, err: AcquisitionError) {
		match err {
			AcquisitionError::ModuleNotInitialized { module } => {
				if self.log_once.first_occurrence(module, metric.name()) {
					error!(module, metric = metric.name(), "module is not initialized, metric will not be reported");
				}
			},
			err => self.acc.add_error(err),
		}
	}
}

pub fn field_name<M: MetricName>(metric: M) -> String {
	format!("{}_{}", metric.name(), metric.unit())
}
