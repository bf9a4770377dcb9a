pub mod cpu;
pub mod msr;

/// Rounds a value to the nearest two decimal places
pub fn round_to_two_decimals(value: f64) -> f64 {
	(value * 100.0).round() / 100.0
}

pub fn kilohertz_to_megahertz(value: f64) -> f64 {
	value / 1_000.0
}

pub fn microwatts_to_watts(value: f64) -> f64 {
	value / 1_000_000.0
}

pub fn microjoules_to_joules(value: f64) -> f64 {
	value / 1_000_000.0
}

/// Converts a processor cycle count to millions of cycles
pub fn cycles_to_megahertz(cycles: u64) -> f64 {
	cycles as f64 / 1_000_000.0
}

/// Converts a bus ratio to its frequency in MHz
pub const fn ratio_to_megahertz(ratio: u64) -> u64 {
	ratio * crate::constants::BUS_CLOCK_MHZ
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rounds_to_two_decimals() {
		assert_eq!(round_to_two_decimals(800.001), 800.0);
		assert_eq!(round_to_two_decimals(10.1199), 10.12);
		assert_eq!(round_to_two_decimals(0.995), 1.0);
		assert_eq!(round_to_two_decimals(-3.14159), -3.14);
	}

	#[test]
	fn converts_units() {
		assert_eq!(kilohertz_to_megahertz(1_200_000.0), 1_200.0);
		assert_eq!(microwatts_to_watts(150_000_000.0), 150.0);
		assert_eq!(microjoules_to_joules(2_500_000.0), 2.5);
		assert_eq!(cycles_to_megahertz(3_000_000_000), 3_000.0);
		assert_eq!(ratio_to_megahertz(24), 2_400);
	}
}
