use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, warn};

use crate::dispatch::{Accumulator, Fields, Tags};
use crate::error::AcquisitionError;

/// Writes gathered metrics as influx line protocol
///
/// Acquisition errors are logged rather than written.
#[derive(Debug)]
pub struct LineProtocolWriter<W: Write> {
	out: W,
	timestamp: Option<u128>,
	errors: usize,
}

impl<W: Write> LineProtocolWriter<W> {
	pub fn new(out: W) -> Self {
		Self {
			out,
			timestamp: None,
			errors: 0,
		}
	}

	/// Uses a fixed timestamp (ns since the epoch) instead of the current time
	pub fn with_timestamp(mut self, timestamp: u128) -> Self {
		self.timestamp = Some(timestamp);
		self
	}

	/// Acquisition errors seen since the writer was created
	pub fn error_count(&self) -> usize {
		self.errors
	}

	pub fn flush(&mut self) -> io::Result<()> {
		self.out.flush()
	}

	pub fn into_inner(self) -> W {
		self.out
	}

	fn write_line(&mut self, measurement: &str, fields: &Fields, tags: &Tags) -> io::Result<()> {
		let timestamp = match self.timestamp {
			Some(timestamp) => timestamp,
			None => SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map(|elapsed| elapsed.as_nanos())
				.unwrap_or_default(),
		};

		let mut line = escape(measurement, &[',', ' ']);
		for (key, value) in tags {
			line.push(',');
			line.push_str(&escape(key, &[',', '=', ' ']));
			line.push('=');
			line.push_str(&escape(value, &[',', '=', ' ']));
		}
		let fields: Vec<String> = fields
			.iter()
			.map(|(key, value)| format!("{}={value}", escape(key, &[',', '=', ' '])))
			.collect();

		writeln!(self.out, "{line} {} {timestamp}", fields.join(","))
	}
}

impl<W: Write> Accumulator for LineProtocolWriter<W> {
	fn add_gauge(&mut self, measurement: &str, fields: Fields, tags: Tags) {
		if fields.is_empty() {
			return;
		}
		if let Err(err) = self.write_line(measurement, &fields, &tags) {
			error!("failed to write {measurement} record: {err}");
		}
	}

	fn add_error(&mut self, err: AcquisitionError) {
		self.errors += 1;
		warn!("{err}");
	}
}

fn escape(value: &str, special: &[char]) -> String {
	let mut escaped = String::with_capacity(value.len());
	for c in value.chars() {
		if special.contains(&c) {
			escaped.push('\\');
		}
		escaped.push(c);
	}
	escaped
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dispatch::MetricValue;

	fn tags(pairs: &[(&str, &str)]) -> Tags {
		pairs.iter().map(|&(key, value)| (key.to_string(), value.to_string())).collect()
	}

	#[test]
	fn writes_sorted_tags_and_fields() {
		let mut writer = LineProtocolWriter::new(Vec::new()).with_timestamp(42);
		let fields = Fields::from([
			("cpu_frequency_mhz".to_string(), MetricValue::Float(1_800.5)),
			("active".to_string(), MetricValue::Integer(3)),
		]);
		writer.add_gauge(
			"powerstat_core",
			fields,
			tags(&[("package_id", "0"), ("cpu_id", "1"), ("core_id", "1")]),
		);

		let output = String::from_utf8(writer.into_inner()).unwrap();
		assert_eq!(
			output,
			"powerstat_core,core_id=1,cpu_id=1,package_id=0 active=3i,cpu_frequency_mhz=1800.5 42\n"
		);
	}

	#[test]
	fn escapes_special_characters() {
		let mut writer = LineProtocolWriter::new(Vec::new()).with_timestamp(1);
		writer.add_gauge(
			"powerstat_package",
			Fields::from([("x".to_string(), MetricValue::Integer(1))]),
			tags(&[("type", "a b,c=d")]),
		);
		let output = String::from_utf8(writer.into_inner()).unwrap();
		assert_eq!(output, "powerstat_package,type=a\\ b\\,c\\=d x=1i 1\n");
	}

	#[test]
	fn logs_errors_instead_of_writing_them() {
		let mut writer = LineProtocolWriter::new(Vec::new());
		writer.add_error(AcquisitionError::UnknownCpu(3));
		writer.add_gauge("powerstat_core", Fields::new(), Tags::new());
		assert_eq!(writer.error_count(), 1);
		assert!(writer.into_inner().is_empty());
	}
}
