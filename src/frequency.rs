use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::cpu_type::CpuFeatures;
use crate::error::AcquisitionError;
use crate::msr::MsrEngine;
use crate::storage::{StorageReader, read_value};
use crate::util::{kilohertz_to_megahertz, ratio_to_megahertz};

/// Current frequency of a CPU as reported by cpufreq, in MHz
pub fn cpu_frequency(reader: &dyn StorageReader, cpu: usize) -> Result<f64, AcquisitionError> {
	read_value(reader, &scaling_frequency_path(cpu)).map(kilohertz_to_megahertz)
}

pub(crate) fn scaling_frequency_path(cpu: usize) -> PathBuf {
	Path::new(SYS_CPU_PATH).join(format!("cpu{cpu}/cpufreq/scaling_cur_freq"))
}

/// Maximum non-turbo frequency from MSR_PLATFORM_INFO, in MHz
pub fn base_frequency(msr: &MsrEngine, cpu: usize) -> Result<u64, AcquisitionError> {
	let value = msr.read_single(cpu, MSR_PLATFORM_INFO)?;
	Ok(ratio_to_megahertz((value >> PLATFORM_INFO_RATIO_SHIFT) & 0xFF))
}

/// One turbo ratio limit group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurboLimit {
	pub frequency_mhz: u64,
	/// Highest number of active cores the limit applies to
	pub active_cores: u64,
	/// `primary` or `secondary` core type on hybrid processors
	pub hybrid: Option<&'static str>,
}

/// Reads the turbo ratio limits of the package `cpu` belongs to
///
/// Groups with a zero ratio are not populated and are skipped.
pub fn turbo_limits(msr: &MsrEngine, features: &CpuFeatures, cpu: usize) -> Result<Vec<TurboLimit>, AcquisitionError> {
	let core_counts = if features.model_in(TURBO_CORE_COUNT_GROUP_MODELS) {
		msr.read_single(cpu, MSR_TURBO_RATIO_LIMIT1)?.to_le_bytes().map(u64::from)
	} else {
		std::array::from_fn(|group| group as u64 + 1)
	};

	let primary = msr.read_single(cpu, MSR_TURBO_RATIO_LIMIT)?;
	if !features.is_hybrid() {
		return Ok(decode_turbo_limits(primary, core_counts, None));
	}

	let secondary = msr.read_single(cpu, MSR_SECONDARY_TURBO_RATIO_LIMIT)?;
	let mut limits = decode_turbo_limits(primary, core_counts, Some("primary"));
	limits.extend(decode_turbo_limits(secondary, core_counts, Some("secondary")));
	Ok(limits)
}

fn decode_turbo_limits(ratios: u64, core_counts: [u64; 8], hybrid: Option<&'static str>) -> Vec<TurboLimit> {
	ratios
		.to_le_bytes()
		.into_iter()
		.zip(core_counts)
		.filter(|&(ratio, cores)| ratio != 0 && cores != 0)
		.map(|(ratio, active_cores)| TurboLimit {
			frequency_mhz: ratio_to_megahertz(u64::from(ratio)),
			active_cores,
			hybrid,
		})
		.collect()
}

/// Uncore frequency limits and current value of one die, in MHz
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UncoreFrequency {
	pub initial_min: f64,
	pub initial_max: f64,
	pub min: f64,
	pub max: f64,
	pub current: f64,
}

/// Reads the uncore frequency of a die from the `intel_uncore_frequency` driver
///
/// The driver may not expose the current frequency; it then falls back to
/// MSR_UNCORE_PERF_STATUS read on `cpu`, which must belong to the package.
pub fn uncore_frequency(
	reader: &dyn StorageReader,
	msr: Option<&MsrEngine>,
	package_id: usize,
	die_id: usize,
	cpu: usize,
) -> Result<UncoreFrequency, AcquisitionError> {
	let dir = uncore_die_path(package_id, die_id);
	let read_mhz = |file: &str| read_value::<f64>(reader, &dir.join(file)).map(kilohertz_to_megahertz);

	let current = match (read_mhz("current_freq_khz"), msr) {
		(Ok(current), _) => current,
		(Err(_), Some(msr)) => {
			let status = msr.read_single(cpu, MSR_UNCORE_PERF_STATUS)?;
			ratio_to_megahertz(status & UNCORE_RATIO_MASK) as f64
		},
		(Err(err), None) => return Err(err),
	};

	Ok(UncoreFrequency {
		initial_min: read_mhz("initial_min_freq_khz")?,
		initial_max: read_mhz("initial_max_freq_khz")?,
		min: read_mhz("min_freq_khz")?,
		max: read_mhz("max_freq_khz")?,
		current,
	})
}

pub(crate) fn uncore_die_path(package_id: usize, die_id: usize) -> PathBuf {
	Path::new(UNCORE_FREQUENCY_PATH).join(format!("package_{package_id:02}_die_{die_id:02}"))
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::cpu_type::CpuVendor;
	use crate::msr::tests::write_registers;
	use crate::storage::SysfsReader;
	use std::fs;
	use std::sync::Arc;

	pub(crate) fn write_uncore_die(root: &Path, package: usize, die: usize, current_khz: Option<u64>) {
		let dir = root.join(uncore_die_path(package, die));
		fs::create_dir_all(&dir).unwrap();
		fs::write(dir.join("initial_min_freq_khz"), "800000\n").unwrap();
		fs::write(dir.join("initial_max_freq_khz"), "2400000\n").unwrap();
		fs::write(dir.join("min_freq_khz"), "1200000\n").unwrap();
		fs::write(dir.join("max_freq_khz"), "2000000\n").unwrap();
		if let Some(current) = current_khz {
			fs::write(dir.join("current_freq_khz"), format!("{current}\n")).unwrap();
		}
	}

	fn features(model: u32, flags: &[&str]) -> CpuFeatures {
		CpuFeatures {
			vendor: CpuVendor::Intel,
			family: 6,
			model,
			flags: flags.iter().map(|flag| flag.to_string()).collect(),
		}
	}

	#[test]
	fn reads_scaling_frequency() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(scaling_frequency_path(3));
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(&path, "2400123\n").unwrap();

		let reader = SysfsReader::new(dir.path());
		assert_eq!(cpu_frequency(&reader, 3).unwrap(), 2_400.123);
		assert!(cpu_frequency(&reader, 4).is_err());
	}

	#[test]
	fn reads_base_frequency() {
		let dir = tempfile::tempdir().unwrap();
		write_registers(dir.path(), 0, &[(MSR_PLATFORM_INFO, 0x8000_1A00)]);
		let msr = MsrEngine::new(Arc::new(SysfsReader::new(dir.path())), None);
		assert_eq!(base_frequency(&msr, 0).unwrap(), 2_600);
	}

	#[test]
	fn decodes_turbo_limits_with_default_core_counts() {
		let dir = tempfile::tempdir().unwrap();
		write_registers(dir.path(), 0, &[(MSR_TURBO_RATIO_LIMIT, 0x0000_0000_1F20_2224)]);
		let msr = MsrEngine::new(Arc::new(SysfsReader::new(dir.path())), None);

		let limits = turbo_limits(&msr, &features(0x9E, &[]), 0).unwrap();
		let decoded: Vec<(u64, u64)> = limits.iter().map(|limit| (limit.frequency_mhz, limit.active_cores)).collect();
		assert_eq!(decoded, vec![(3_600, 1), (3_400, 2), (3_200, 3), (3_100, 4)]);
		assert!(limits.iter().all(|limit| limit.hybrid.is_none()));
	}

	#[test]
	fn reads_core_count_groups() {
		let dir = tempfile::tempdir().unwrap();
		write_registers(
			dir.path(),
			0,
			&[(MSR_TURBO_RATIO_LIMIT, 0x1C1E_2022), (MSR_TURBO_RATIO_LIMIT1, 0x1C10_0804)],
		);
		let msr = MsrEngine::new(Arc::new(SysfsReader::new(dir.path())), None);

		let limits = turbo_limits(&msr, &features(0x55, &[]), 0).unwrap();
		let decoded: Vec<(u64, u64)> = limits.iter().map(|limit| (limit.frequency_mhz, limit.active_cores)).collect();
		assert_eq!(decoded, vec![(3_400, 4), (3_200, 8), (3_000, 16), (2_800, 28)]);
	}

	#[test]
	fn tags_hybrid_core_types() {
		let dir = tempfile::tempdir().unwrap();
		write_registers(
			dir.path(),
			0,
			&[(MSR_TURBO_RATIO_LIMIT, 0x3030), (MSR_SECONDARY_TURBO_RATIO_LIMIT, 0x26)],
		);
		let msr = MsrEngine::new(Arc::new(SysfsReader::new(dir.path())), None);

		let limits = turbo_limits(&msr, &features(0x97, &["hybrid_cpu"]), 0).unwrap();
		assert_eq!(
			limits,
			vec![
				TurboLimit {
					frequency_mhz: 4_800,
					active_cores: 1,
					hybrid: Some("primary"),
				},
				TurboLimit {
					frequency_mhz: 4_800,
					active_cores: 2,
					hybrid: Some("primary"),
				},
				TurboLimit {
					frequency_mhz: 3_800,
					active_cores: 1,
					hybrid: Some("secondary"),
				},
			]
		);
	}

	#[test]
	fn reads_uncore_frequency() {
		let dir = tempfile::tempdir().unwrap();
		write_uncore_die(dir.path(), 0, 1, Some(1_800_000));
		let reader = SysfsReader::new(dir.path());

		let uncore = uncore_frequency(&reader, None, 0, 1, 0).unwrap();
		assert_eq!(
			uncore,
			UncoreFrequency {
				initial_min: 800.0,
				initial_max: 2_400.0,
				min: 1_200.0,
				max: 2_000.0,
				current: 1_800.0,
			}
		);
	}

	#[test]
	fn falls_back_to_uncore_status_register() {
		let dir = tempfile::tempdir().unwrap();
		write_uncore_die(dir.path(), 1, 0, None);
		write_registers(dir.path(), 4, &[(MSR_UNCORE_PERF_STATUS, 0x80 | 0x13)]);
		let reader = Arc::new(SysfsReader::new(dir.path()));
		let msr = MsrEngine::new(reader.clone(), None);

		assert_eq!(uncore_frequency(reader.as_ref(), Some(&msr), 1, 0, 4).unwrap().current, 1_900.0);
		assert!(uncore_frequency(reader.as_ref(), None, 1, 0, 4).is_err());
	}
}
