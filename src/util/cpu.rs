/// One `processor` block of `/proc/cpuinfo`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuInfo {
	pub processor: usize,
	pub vendor_id: String,
	pub family: String,
	pub model: String,
	pub physical_id: Option<usize>,
	pub core_id: Option<usize>,
	pub flags: Vec<String>,
}

/// Parses the contents of `/proc/cpuinfo` into one entry per logical processor
///
/// Blocks without a parsable `processor` line are skipped.
pub fn parse_cpuinfo(content: &str) -> Vec<CpuInfo> {
	let mut cpus = Vec::new();
	let mut current: Option<CpuInfo> = None;

	for line in content.lines() {
		let Some((key, value)) = line.split_once(':') else {
			// Blank lines separate processor blocks
			if line.trim().is_empty() {
				cpus.extend(current.take());
			}
			continue;
		};
		let value = value.trim();

		match key.trim() {
			"processor" => {
				cpus.extend(current.take());
				current = value.parse().ok().map(|processor| CpuInfo {
					processor,
					..CpuInfo::default()
				});
			},
			"vendor_id" => set_field(&mut current, |cpu| cpu.vendor_id = value.to_string()),
			"cpu family" => set_field(&mut current, |cpu| cpu.family = value.to_string()),
			"model" => set_field(&mut current, |cpu| cpu.model = value.to_string()),
			"physical id" => set_field(&mut current, |cpu| cpu.physical_id = value.parse().ok()),
			"core id" => set_field(&mut current, |cpu| cpu.core_id = value.parse().ok()),
			"flags" => set_field(&mut current, |cpu| {
				cpu.flags = value.split_whitespace().map(str::to_string).collect();
			}),
			_ => {},
		}
	}

	cpus.extend(current);
	cpus
}

fn set_field(current: &mut Option<CpuInfo>, apply: impl FnOnce(&mut CpuInfo)) {
	if let Some(cpu) = current.as_mut() {
		apply(cpu);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const CPUINFO: &str = "processor\t: 0
vendor_id\t: GenuineIntel
cpu family\t: 6
model\t\t: 143
model name\t: Intel(R) Xeon(R) Platinum 8480+
physical id\t: 0
core id\t\t: 1
flags\t\t: fpu msr aperfmperf dts

processor\t: 1
vendor_id\t: GenuineIntel
cpu family\t: 6
model\t\t: 143
physical id\t: 1
core id\t\t: 0
flags\t\t: fpu msr
";

	#[test]
	fn parses_processor_blocks() {
		let cpus = parse_cpuinfo(CPUINFO);
		assert_eq!(cpus.len(), 2);
		assert_eq!(cpus[0].processor, 0);
		assert_eq!(cpus[0].vendor_id, "GenuineIntel");
		assert_eq!(cpus[0].family, "6");
		assert_eq!(cpus[0].model, "143");
		assert_eq!(cpus[0].core_id, Some(1));
		assert_eq!(cpus[0].flags, vec!["fpu", "msr", "aperfmperf", "dts"]);
		assert_eq!(cpus[1].physical_id, Some(1));
	}

	#[test]
	fn skips_blocks_without_processor_number() {
		let cpus = parse_cpuinfo("processor : x\nvendor_id : GenuineIntel\n\nprocessor : 3\n");
		assert_eq!(cpus.len(), 1);
		assert_eq!(cpus[0].processor, 3);
		assert!(cpus[0].vendor_id.is_empty());
	}
}
