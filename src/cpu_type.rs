use std::collections::HashSet;

use crate::constants::{HYBRID_CPU_FLAG, INTEL_CORE_FAMILY, INTEL_VENDOR_ID};
use crate::util::cpu::CpuInfo;

/// Represents CPU manufacturer types that can be detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
	/// Intel CPU architecture
	Intel,
	/// AMD CPU architecture
	Amd,
	/// Any other CPU architecture
	Unsupported,
}

impl CpuVendor {
	pub fn from_vendor_id(vendor_id: &str) -> Self {
		match vendor_id {
			INTEL_VENDOR_ID => CpuVendor::Intel,
			"AuthenticAMD" => CpuVendor::Amd,
			_ => CpuVendor::Unsupported,
		}
	}
}

/// Features of the first processor, read once at start-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuFeatures {
	pub vendor: CpuVendor,
	pub family: u32,
	pub model: u32,
	pub flags: HashSet<String>,
}

impl CpuFeatures {
	pub fn from_cpu_info(cpu: &CpuInfo) -> Self {
		Self {
			vendor: CpuVendor::from_vendor_id(&cpu.vendor_id),
			family: cpu.family.parse().unwrap_or_default(),
			model: cpu.model.parse().unwrap_or_default(),
			flags: cpu.flags.iter().cloned().collect(),
		}
	}

	pub fn has_flag(&self, flag: &str) -> bool {
		self.flags.contains(flag)
	}

	/// Intel Core/Xeon family 6, the only family whose MSR layout is decoded
	pub fn is_intel_family_6(&self) -> bool {
		self.vendor == CpuVendor::Intel && self.family == INTEL_CORE_FAMILY
	}

	pub fn model_in(&self, models: &[u32]) -> bool {
		models.contains(&self.model)
	}

	/// Hybrid parts (P-cores and E-cores) expose a secondary turbo ratio limit
	pub fn is_hybrid(&self) -> bool {
		self.has_flag(HYBRID_CPU_FLAG)
	}
}
