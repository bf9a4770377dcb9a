use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::constants::{RAPL_DOMAIN_PREFIX, RAPL_DRAM_NAME, RAPL_PATH};
use crate::error::AcquisitionError;
use crate::storage::{StorageReader, read_value};
use crate::util::{microjoules_to_joules, microwatts_to_watts};

/// Point-in-time energy reading of one domain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergySample {
	/// Cumulative energy in joules
	pub energy: f64,
	pub read_at: Instant,
}

/// Average power of a package between its last two reads, in watts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackagePower {
	pub socket: f64,
	pub dram: Option<f64>,
}

#[derive(Debug, Clone)]
struct RaplDomain {
	path: PathBuf,
	dram: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct RaplSnapshot {
	socket: Option<EnergySample>,
	dram: Option<EnergySample>,
}

/// Energy telemetry engine, tracking one snapshot per package
///
/// Package domains are `intel-rapl:N` powercap directories; the DRAM
/// sub-domain is the child `intel-rapl:N:M` whose `name` is `dram`.
#[derive(Debug)]
pub struct RaplEngine {
	reader: Arc<dyn StorageReader>,
	domains: BTreeMap<usize, RaplDomain>,
	domain_names: Vec<String>,
	snapshots: HashMap<usize, RaplSnapshot>,
}

impl RaplEngine {
	pub fn new(reader: Arc<dyn StorageReader>) -> Self {
		Self {
			reader,
			domains: BTreeMap::new(),
			domain_names: Vec::new(),
			snapshots: HashMap::new(),
		}
	}

	/// Rescans package domains; the DRAM association is rebuilt only when they changed
	pub fn refresh_domains(&mut self) -> Result<(), AcquisitionError> {
		let root = Path::new(RAPL_PATH);
		let names: Vec<String> = self
			.reader
			.list_dir(root)
			.map_err(|source| AcquisitionError::io(root, source))?
			.into_iter()
			.filter(|name| package_index(name).is_some())
			.collect();

		if names == self.domain_names {
			return Ok(());
		}

		let mut domains = BTreeMap::new();
		for name in &names {
			let Some(package_id) = package_index(name) else {
				continue;
			};
			let path = root.join(name);
			let dram = self.find_dram_domain(&path, name);
			domains.insert(package_id, RaplDomain { path, dram });
		}

		debug!(packages = domains.len(), "rebuilt rapl domains");
		self.snapshots.retain(|package_id, _| domains.contains_key(package_id));
		self.domains = domains;
		self.domain_names = names;
		Ok(())
	}

	/// Searches the sub-domains of a package for the one named "dram"
	fn find_dram_domain(&self, package_path: &Path, package_name: &str) -> Option<PathBuf> {
		let prefix = format!("{package_name}:");
		self.reader
			.list_dir(package_path)
			.ok()?
			.into_iter()
			.filter(|name| name.starts_with(&prefix))
			.map(|name| package_path.join(name))
			.find(|path| {
				self.reader
					.read_to_string(&path.join("name"))
					.is_ok_and(|name| name.trim() == RAPL_DRAM_NAME)
			})
	}

	pub fn package_ids(&self) -> Vec<usize> {
		self.domains.keys().copied().collect()
	}

	/// Reads package energy and computes power since the previous read
	///
	/// The first read of a package only primes its snapshot and returns `None`.
	pub fn retrieve_and_compute(&mut self, package_id: usize) -> Result<Option<PackagePower>, AcquisitionError> {
		self.retrieve_and_compute_at(package_id, Instant::now())
	}

	pub(crate) fn retrieve_and_compute_at(
		&mut self,
		package_id: usize,
		now: Instant,
	) -> Result<Option<PackagePower>, AcquisitionError> {
		let domain = self
			.domains
			.get(&package_id)
			.ok_or(AcquisitionError::UnknownPackage(package_id))?;
		let reader = self.reader.as_ref();

		let socket = EnergySample {
			energy: read_energy(reader, &domain.path)?,
			read_at: now,
		};
		let dram = match &domain.dram {
			Some(path) => Some(EnergySample {
				energy: read_energy(reader, path)?,
				read_at: now,
			}),
			None => None,
		};

		let snapshot = self.snapshots.entry(package_id).or_default();
		let power = match snapshot.socket {
			Some(previous) => {
				let socket_power = compute_power(package_id, previous, socket, || read_max_energy(reader, &domain.path))?;
				let dram_power = match (snapshot.dram, dram, &domain.dram) {
					(Some(previous), Some(current), Some(path)) => {
						Some(compute_power(package_id, previous, current, || read_max_energy(reader, path))?)
					},
					_ => None,
				};
				Some(PackagePower {
					socket: socket_power,
					dram: dram_power,
				})
			},
			None => None,
		};

		snapshot.socket = Some(socket);
		snapshot.dram = dram;
		Ok(power)
	}

	/// Thermal design power of a package in watts
	pub fn constraint_max_power_watts(&self, package_id: usize) -> Result<f64, AcquisitionError> {
		let domain = self
			.domains
			.get(&package_id)
			.ok_or(AcquisitionError::UnknownPackage(package_id))?;
		let max_power: f64 = read_value(self.reader.as_ref(), &domain.path.join("constraint_0_max_power_uw"))?;
		Ok(microwatts_to_watts(max_power))
	}

	#[cfg(test)]
	fn has_dram_domain(&self, package_id: usize) -> bool {
		self.domains
			.get(&package_id)
			.is_some_and(|domain| domain.dram.is_some())
	}
}

/// Average power between two energy samples of one domain
///
/// When the counter did not increase it wrapped at the domain's maximum
/// energy range, which is only read in that case.
pub fn compute_power(
	package_id: usize,
	previous: EnergySample,
	current: EnergySample,
	max_energy_range: impl FnOnce() -> Result<f64, AcquisitionError>,
) -> Result<f64, AcquisitionError> {
	let interval = current.read_at.saturating_duration_since(previous.read_at).as_secs_f64();
	if interval == 0.0 {
		return Err(AcquisitionError::ZeroInterval(package_id));
	}

	if current.energy > previous.energy {
		return Ok((current.energy - previous.energy) / interval);
	}

	let max_range = max_energy_range()?;
	if max_range < previous.energy {
		return Err(AcquisitionError::InvalidEnergyRange {
			package: package_id,
			energy: previous.energy,
			max_range,
		});
	}
	Ok((max_range - previous.energy + current.energy) / interval)
}

fn read_energy(reader: &dyn StorageReader, domain: &Path) -> Result<f64, AcquisitionError> {
	read_value(reader, &domain.join("energy_uj")).map(microjoules_to_joules)
}

fn read_max_energy(reader: &dyn StorageReader, domain: &Path) -> Result<f64, AcquisitionError> {
	read_value(reader, &domain.join("max_energy_range_uj")).map(microjoules_to_joules)
}

/// Returns N for a package domain named `intel-rapl:N`
fn package_index(name: &str) -> Option<usize> {
	name.strip_prefix(RAPL_DOMAIN_PREFIX)?.parse().ok()
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::storage::SysfsReader;
	use std::fs;
	use std::time::Duration;

	/// Creates `intel-rapl:N` with an optional DRAM sub-domain under `root`
	pub(crate) fn write_rapl_domain(root: &Path, package: usize, energy_uj: u64, dram_energy_uj: Option<u64>) {
		let domain = root.join(RAPL_PATH).join(format!("intel-rapl:{package}"));
		fs::create_dir_all(&domain).unwrap();
		fs::write(domain.join("name"), format!("package-{package}\n")).unwrap();
		fs::write(domain.join("energy_uj"), format!("{energy_uj}\n")).unwrap();
		fs::write(domain.join("max_energy_range_uj"), "262143328850\n").unwrap();
		fs::write(domain.join("constraint_0_max_power_uw"), "150000000\n").unwrap();

		// A core sub-domain precedes the DRAM one
		let core = domain.join(format!("intel-rapl:{package}:0"));
		fs::create_dir_all(&core).unwrap();
		fs::write(core.join("name"), "core\n").unwrap();
		fs::write(core.join("energy_uj"), "1\n").unwrap();

		if let Some(dram_energy_uj) = dram_energy_uj {
			let dram = domain.join(format!("intel-rapl:{package}:1"));
			fs::create_dir_all(&dram).unwrap();
			fs::write(dram.join("name"), "dram\n").unwrap();
			fs::write(dram.join("energy_uj"), format!("{dram_energy_uj}\n")).unwrap();
			fs::write(dram.join("max_energy_range_uj"), "65712999613\n").unwrap();
		}
	}

	fn sample(energy: f64, read_at: Instant) -> EnergySample {
		EnergySample { energy, read_at }
	}

	#[test]
	fn computes_power_from_increasing_energy() {
		let t0 = Instant::now();
		let t1 = t0 + Duration::from_secs(2);
		let power = compute_power(0, sample(100.0, t0), sample(130.0, t1), || panic!("max range not needed")).unwrap();
		assert_eq!(power, 15.0);
	}

	#[test]
	fn computes_power_across_wrap() {
		let t0 = Instant::now();
		let t1 = t0 + Duration::from_secs(4);
		let power = compute_power(0, sample(990.0, t0), sample(10.0, t1), || Ok(1_000.0)).unwrap();
		assert_eq!(power, 5.0);
	}

	#[test]
	fn rejects_zero_interval() {
		let t0 = Instant::now();
		assert!(matches!(
			compute_power(1, sample(1.0, t0), sample(2.0, t0), || Ok(10.0)),
			Err(AcquisitionError::ZeroInterval(1))
		));
	}

	#[test]
	fn never_reports_negative_power() {
		let t0 = Instant::now();
		let t1 = t0 + Duration::from_secs(1);
		assert!(matches!(
			compute_power(0, sample(50.0, t0), sample(10.0, t1), || Ok(20.0)),
			Err(AcquisitionError::InvalidEnergyRange { .. })
		));
	}

	#[test]
	fn primes_then_computes_package_power() {
		let dir = tempfile::tempdir().unwrap();
		write_rapl_domain(dir.path(), 0, 10_000_000, Some(2_000_000));

		let mut engine = RaplEngine::new(Arc::new(SysfsReader::new(dir.path())));
		engine.refresh_domains().unwrap();
		assert_eq!(engine.package_ids(), vec![0]);
		assert!(engine.has_dram_domain(0));

		let t0 = Instant::now();
		assert_eq!(engine.retrieve_and_compute_at(0, t0).unwrap(), None);

		write_rapl_domain(dir.path(), 0, 30_000_000, Some(3_000_000));
		let power = engine
			.retrieve_and_compute_at(0, t0 + Duration::from_secs(2))
			.unwrap()
			.unwrap();
		assert_eq!(power.socket, 10.0);
		assert_eq!(power.dram, Some(0.5));

		assert_eq!(engine.constraint_max_power_watts(0).unwrap(), 150.0);
	}

	#[test]
	fn rebuilds_domains_when_they_change() {
		let dir = tempfile::tempdir().unwrap();
		write_rapl_domain(dir.path(), 0, 1_000_000, None);

		let mut engine = RaplEngine::new(Arc::new(SysfsReader::new(dir.path())));
		engine.refresh_domains().unwrap();
		assert!(!engine.has_dram_domain(0));

		write_rapl_domain(dir.path(), 1, 1_000_000, Some(1_000));
		engine.refresh_domains().unwrap();
		assert_eq!(engine.package_ids(), vec![0, 1]);
		assert!(engine.has_dram_domain(1));

		fs::remove_dir_all(dir.path().join(RAPL_PATH).join("intel-rapl:0")).unwrap();
		engine.refresh_domains().unwrap();
		assert_eq!(engine.package_ids(), vec![1]);
		assert!(matches!(
			engine.retrieve_and_compute(0),
			Err(AcquisitionError::UnknownPackage(0))
		));
	}

	#[test]
	fn read_failure_keeps_previous_sample() {
		let dir = tempfile::tempdir().unwrap();
		write_rapl_domain(dir.path(), 0, 1_000_000, None);
		let mut engine = RaplEngine::new(Arc::new(SysfsReader::new(dir.path())));
		engine.refresh_domains().unwrap();

		let t0 = Instant::now();
		engine.retrieve_and_compute_at(0, t0).unwrap();

		let energy = dir.path().join(RAPL_PATH).join("intel-rapl:0/energy_uj");
		fs::write(&energy, "garbage").unwrap();
		assert!(engine.retrieve_and_compute_at(0, t0 + Duration::from_secs(1)).is_err());

		fs::write(&energy, "5000000").unwrap();
		let power = engine
			.retrieve_and_compute_at(0, t0 + Duration::from_secs(2))
			.unwrap()
			.unwrap();
		assert_eq!(power.socket, 2.0);
	}

	#[test]
	fn parses_package_index() {
		assert_eq!(package_index("intel-rapl:3"), Some(3));
		assert_eq!(package_index("intel-rapl:0:1"), None);
		assert_eq!(package_index("intel-rapl-mmio:0"), None);
	}
}
