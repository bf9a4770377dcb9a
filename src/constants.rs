// Intel core MSR offsets read as one snapshot per CPU
pub const MSR_C3_RESIDENCY: u64 = 0x3FC;
pub const MSR_C6_RESIDENCY: u64 = 0x3FD;
pub const MSR_C7_RESIDENCY: u64 = 0x3FE;
pub const MSR_MPERF: u64 = 0xE7;
pub const MSR_APERF: u64 = 0xE8;
pub const MSR_TIMESTAMP_COUNTER: u64 = 0x10;
pub const MSR_TEMPERATURE_TARGET: u64 = 0x1A2;
pub const MSR_THERM_STATUS: u64 = 0x19C;

// Intel frequency MSRs
pub const MSR_PLATFORM_INFO: u64 = 0xCE;
pub const MSR_TURBO_RATIO_LIMIT: u64 = 0x1AD;
pub const MSR_TURBO_RATIO_LIMIT1: u64 = 0x1AE;
pub const MSR_SECONDARY_TURBO_RATIO_LIMIT: u64 = 0x650;
pub const MSR_UNCORE_PERF_STATUS: u64 = 0x621;

// Bit fields
pub const THROTTLE_TEMPERATURE_MASK: u64 = 0xFF << 16;
pub const CURRENT_TEMPERATURE_MASK: u64 = 0x7F << 16;
pub const TEMPERATURE_SHIFT: u32 = 16;
pub const PLATFORM_INFO_RATIO_SHIFT: u32 = 8;
pub const UNCORE_RATIO_MASK: u64 = 0x7F;

/// Multiplier between a bus ratio and its frequency in MHz.
pub const BUS_CLOCK_MHZ: u64 = 100;
pub const PERCENTAGE_MULTIPLIER: f64 = 100.0;

// Filesystem locations, relative to the storage root
pub const CPUINFO_PATH: &str = "proc/cpuinfo";
pub const SYS_CPU_PATH: &str = "sys/devices/system/cpu";
pub const MSR_DEVICE_PATH: &str = "dev/cpu";
pub const RAPL_PATH: &str = "sys/devices/virtual/powercap/intel-rapl";
pub const RAPL_DOMAIN_PREFIX: &str = "intel-rapl:";
pub const RAPL_DRAM_NAME: &str = "dram";
pub const UNCORE_FREQUENCY_PATH: &str = "sys/devices/system/cpu/intel_uncore_frequency";

pub const INTEL_VENDOR_ID: &str = "GenuineIntel";
pub const INTEL_CORE_FAMILY: u32 = 6;
/// `/proc/cpuinfo` spelling of X86_FEATURE_HYBRID_CPU
pub const HYBRID_CPU_FLAG: &str = "hybrid_cpu";

/// Largest CPU ID a core selector may name (the kernel's NR_CPUS ceiling)
pub const MAX_CPU_ID: usize = 8_191;

// Intel model numbers (family 6) gating model-specific metrics
pub const C1_RESIDENCY_MODELS: &[u32] = &[
	0x37, 0x4D, 0x5C, 0x5F, 0x7A, 0x4C, 0x86, 0x96, 0x9C, 0x1A, 0x1E, 0x1F, 0x2E, 0x25, 0x2C, 0x2F, 0x2A, 0x2D, 0x3A,
	0x3E, 0x4E, 0x5E, 0x55, 0x8E, 0x9E, 0x6A, 0x6C, 0x7D, 0x7E, 0x9D, 0x3C, 0x3F, 0x45, 0x46, 0x3D, 0x47, 0x4F, 0x56,
	0x66, 0x57, 0x85, 0xA5, 0xA6, 0x8F, 0x8C, 0x8D, 0xCF, 0x97, 0x9A, 0xB7, 0xBA, 0xBF, 0xAA, 0xAC,
];

pub const C3_RESIDENCY_MODELS: &[u32] = &[
	0x37, 0x4D, 0x5C, 0x7A, 0x4C, 0x1A, 0x1E, 0x1F, 0x2E, 0x25, 0x2C, 0x2F, 0x2A, 0x2D, 0x3A, 0x3E, 0x4E, 0x5E, 0x8E,
	0x9E, 0x3C, 0x3F, 0x45, 0x46, 0x3D, 0x47, 0x4F, 0x56, 0x66, 0xA5, 0xA6, 0x8C, 0x8D, 0x7D, 0x7E,
];

pub const C6_RESIDENCY_MODELS: &[u32] = C1_RESIDENCY_MODELS;

pub const C7_RESIDENCY_MODELS: &[u32] = &[
	0x1A, 0x1E, 0x1F, 0x25, 0x2A, 0x3A, 0x3C, 0x45, 0x46, 0x3D, 0x47, 0x4E, 0x5E, 0x8E, 0x9E, 0x66, 0x7D, 0x7E, 0xA5,
	0xA6, 0x8C, 0x8D, 0x97, 0x9A, 0xB7, 0xBA, 0xBF, 0xAA, 0xAC,
];

/// Models without MSR_PLATFORM_INFO / turbo ratio limits.
pub const NO_TURBO_RATIO_MODELS: &[u32] = &[0x1C, 0x26, 0x27, 0x35, 0x36, 0x57, 0x85];

/// Models that store active core counts per group in MSR_TURBO_RATIO_LIMIT1.
pub const TURBO_CORE_COUNT_GROUP_MODELS: &[u32] = &[0x55, 0x5C, 0x7A, 0x86, 0x6A, 0x6C, 0x8F, 0xCF];

/// Models with perf-event C0 substate counters.
pub const C0_SUBSTATE_MODELS: &[u32] = &[0x8F, 0xCF];

// Perf events backing C0 substate metrics
pub const PERF_EVENT_C01: &str = "CPU_CLK_UNHALTED.C01";
pub const PERF_EVENT_C02: &str = "CPU_CLK_UNHALTED.C02";
pub const PERF_EVENT_C0_WAIT: &str = "CPU_CLK_UNHALTED.C0_WAIT";
pub const PERF_EVENT_THREAD: &str = "CPU_CLK_UNHALTED.THREAD_P";

// Polling settings for the binary
pub const DEFAULT_INTERVAL_MS: u64 = 10_000;
