use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::{CPUINFO_PATH, SYS_CPU_PATH};
use crate::cpu_type::CpuFeatures;
use crate::error::{AcquisitionError, ConfigError};
use crate::storage::{StorageReader, read_value};
use crate::util::cpu::{CpuInfo, parse_cpuinfo};

/// Identity of one logical CPU, resolved on demand every cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDescriptor {
	pub cpu_id: usize,
	pub core_id: usize,
	pub package_id: usize,
	pub die_id: usize,
}

/// Represents the CPU topology: logical CPUs, packages and dies
#[derive(Debug, Clone)]
pub struct CpuTopology {
	reader: Arc<dyn StorageReader>,

	/// Features of the first processor
	pub features: CpuFeatures,

	/// Processor entries of /proc/cpuinfo, sorted by CPU ID
	cpus: Vec<CpuInfo>,

	/// CPUs selected for per-CPU metrics
	active_cpus: Vec<usize>,
}

impl CpuTopology {
	/// Detects the CPU configuration from /proc/cpuinfo
	pub fn detect(reader: Arc<dyn StorageReader>) -> Result<Self, AcquisitionError> {
		let path = Path::new(CPUINFO_PATH);
		let content = reader
			.read_to_string(path)
			.map_err(|source| AcquisitionError::io(path, source))?;

		let mut cpus = parse_cpuinfo(&content);
		cpus.sort_by_key(|cpu| cpu.processor);

		let Some(first) = cpus.first() else {
			return Err(AcquisitionError::Parse {
				path: path.to_path_buf(),
				value: "no processor entries".to_string(),
			});
		};
		let features = CpuFeatures::from_cpu_info(first);
		let active_cpus = cpus.iter().map(|cpu| cpu.processor).collect();

		Ok(Self {
			reader,
			features,
			cpus,
			active_cpus,
		})
	}

	/// Restricts per-CPU metrics to `included` CPUs, or to every CPU except `excluded`
	pub fn select_cpus(&mut self, included: &[usize], excluded: &[usize]) -> Result<(), ConfigError> {
		if !included.is_empty() && !excluded.is_empty() {
			return Err(ConfigError::ConflictingCpuSelectors);
		}

		let available = self.available_cpu_ids();
		if let Some(&unknown) = included.iter().chain(excluded).find(|id| !available.contains(id)) {
			return Err(ConfigError::UnknownCpu(unknown));
		}

		self.active_cpus = if included.is_empty() {
			available.into_iter().filter(|id| !excluded.contains(id)).collect()
		} else {
			let mut selected = included.to_vec();
			selected.sort_unstable();
			selected
		};

		Ok(())
	}

	pub fn available_cpu_ids(&self) -> Vec<usize> {
		self.cpus.iter().map(|cpu| cpu.processor).collect()
	}

	pub fn active_cpu_ids(&self) -> &[usize] {
		&self.active_cpus
	}

	/// Returns the sorted physical package IDs of all available CPUs
	pub fn package_ids(&self) -> Vec<usize> {
		self.cpus
			.iter()
			.map(|cpu| cpu.physical_id.unwrap_or_default())
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect()
	}

	pub fn cpus_in_package(&self, package_id: usize) -> Vec<usize> {
		self.cpus
			.iter()
			.filter(|cpu| cpu.physical_id.unwrap_or_default() == package_id)
			.map(|cpu| cpu.processor)
			.collect()
	}

	/// Returns the die IDs of a package; CPUs without die information count as die 0
	pub fn die_ids(&self, package_id: usize) -> Vec<usize> {
		self.cpus_in_package(package_id)
			.into_iter()
			.map(|cpu_id| read_value::<usize>(self.reader.as_ref(), &topology_path(cpu_id, "die_id")).unwrap_or_default())
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect()
	}

	/// Resolves the core, package and die of a CPU from sysfs
	///
	/// Fails for CPUs that went offline, since their topology directory disappears.
	/// Kernels without die information report die 0.
	pub fn resolve(&self, cpu_id: usize) -> Result<CpuDescriptor, AcquisitionError> {
		let reader = self.reader.as_ref();
		let core_id = read_value(reader, &topology_path(cpu_id, "core_id"))?;
		let package_id = read_value(reader, &topology_path(cpu_id, "physical_package_id"))?;
		let die_id = read_value::<usize>(reader, &topology_path(cpu_id, "die_id")).unwrap_or_default();

		Ok(CpuDescriptor {
			cpu_id,
			core_id,
			package_id,
			die_id,
		})
	}
}

fn topology_path(cpu_id: usize, file: &str) -> PathBuf {
	Path::new(SYS_CPU_PATH).join(format!("cpu{cpu_id}/topology/{file}"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::SysfsReader;
	use std::fs;
	use tempfile::TempDir;

	fn fake_system(cpus: &[(usize, usize, usize)]) -> TempDir {
		let dir = tempfile::tempdir().unwrap();
		let mut cpuinfo = String::new();
		for &(cpu, core, package) in cpus {
			cpuinfo.push_str(&format!(
				"processor\t: {cpu}\nvendor_id\t: GenuineIntel\ncpu family\t: 6\nmodel\t\t: 85\nphysical id\t: {package}\ncore id\t\t: {core}\nflags\t\t: msr\n\n"
			));
			let topology = dir.path().join(format!("sys/devices/system/cpu/cpu{cpu}/topology"));
			fs::create_dir_all(&topology).unwrap();
			fs::write(topology.join("core_id"), format!("{core}\n")).unwrap();
			fs::write(topology.join("physical_package_id"), format!("{package}\n")).unwrap();
		}
		fs::create_dir_all(dir.path().join("proc")).unwrap();
		fs::write(dir.path().join("proc/cpuinfo"), cpuinfo).unwrap();
		dir
	}

	fn topology(dir: &TempDir) -> CpuTopology {
		CpuTopology::detect(Arc::new(SysfsReader::new(dir.path()))).unwrap()
	}

	#[test]
	fn detects_cpus_and_packages() {
		let dir = fake_system(&[(0, 0, 0), (1, 1, 0), (2, 0, 1), (3, 1, 1)]);
		let topology = topology(&dir);

		assert_eq!(topology.available_cpu_ids(), vec![0, 1, 2, 3]);
		assert_eq!(topology.active_cpu_ids(), &[0, 1, 2, 3]);
		assert_eq!(topology.package_ids(), vec![0, 1]);
		assert_eq!(topology.cpus_in_package(1), vec![2, 3]);
		assert_eq!(topology.features.model, 85);
	}

	#[test]
	fn resolves_cpu_on_demand() {
		let dir = fake_system(&[(0, 1, 0), (1, 0, 0)]);
		let topology = topology(&dir);

		let cpu = topology.resolve(0).unwrap();
		assert_eq!(
			cpu,
			CpuDescriptor {
				cpu_id: 0,
				core_id: 1,
				package_id: 0,
				die_id: 0,
			}
		);

		// CPU taken offline after start-up
		fs::remove_dir_all(dir.path().join("sys/devices/system/cpu/cpu1/topology")).unwrap();
		assert!(matches!(topology.resolve(1), Err(AcquisitionError::Io { .. })));
	}

	#[test]
	fn reads_die_ids() {
		let dir = fake_system(&[(0, 0, 0), (1, 1, 0)]);
		fs::write(dir.path().join("sys/devices/system/cpu/cpu1/topology/die_id"), "1\n").unwrap();
		let topology = topology(&dir);
		assert_eq!(topology.die_ids(0), vec![0, 1]);
		assert_eq!(topology.resolve(1).unwrap().die_id, 1);
	}

	#[test]
	fn selects_included_or_excluded_cpus() {
		let dir = fake_system(&[(0, 0, 0), (1, 1, 0), (2, 2, 0)]);
		let mut topology = topology(&dir);

		topology.select_cpus(&[], &[1]).unwrap();
		assert_eq!(topology.active_cpu_ids(), &[0, 2]);

		topology.select_cpus(&[2, 0], &[]).unwrap();
		assert_eq!(topology.active_cpu_ids(), &[0, 2]);

		assert!(matches!(
			topology.select_cpus(&[0], &[1]),
			Err(ConfigError::ConflictingCpuSelectors)
		));
		assert!(matches!(topology.select_cpus(&[7], &[]), Err(ConfigError::UnknownCpu(7))));
	}

	#[test]
	fn fails_without_processors() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("proc")).unwrap();
		fs::write(dir.path().join("proc/cpuinfo"), "").unwrap();
		assert!(CpuTopology::detect(Arc::new(SysfsReader::new(dir.path()))).is_err());
	}
}
