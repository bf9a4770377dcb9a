use tracing::warn;

use crate::config::{CpuMetric, MetricName, PackageMetric};
use crate::constants::*;
use crate::cpu_type::CpuFeatures;

/// Drops every requested metric the processor does not support
///
/// Gating only ever removes metrics; each removal is logged once here.
pub fn disable_unsupported_metrics(
	features: &CpuFeatures,
	cpu_metrics: &mut Vec<CpuMetric>,
	package_metrics: &mut Vec<PackageMetric>,
) {
	cpu_metrics.retain(|&metric| retain_supported(metric, cpu_metric_unsupported(features, metric)));
	package_metrics.retain(|&metric| retain_supported(metric, package_metric_unsupported(features, metric)));
}

fn retain_supported<M: MetricName>(metric: M, reason: Option<&'static str>) -> bool {
	match reason {
		Some(reason) => {
			warn!("{} metric {:?} is not supported: {}", M::DOMAIN, metric.name(), reason);
			false
		},
		None => true,
	}
}

/// Returns why a CPU metric is unsupported, if it is
pub fn cpu_metric_unsupported(features: &CpuFeatures, metric: CpuMetric) -> Option<&'static str> {
	if metric == CpuMetric::Frequency {
		return None;
	}
	if !features.is_intel_family_6() {
		return Some("processor is not an Intel family 6 model");
	}
	if metric.is_perf_backed() {
		return (!features.model_in(C0_SUBSTATE_MODELS)).then_some("processor model has no C0 substate counters");
	}
	if !features.has_flag("msr") {
		return Some("cpu flag \"msr\" is missing");
	}

	let needs_aperfmperf = matches!(
		metric,
		CpuMetric::C0StateResidency | CpuMetric::C1StateResidency | CpuMetric::BusyFrequency
	);
	if needs_aperfmperf && !features.has_flag("aperfmperf") {
		return Some("cpu flag \"aperfmperf\" is missing");
	}

	match metric {
		CpuMetric::Temperature if !features.has_flag("dts") => Some("cpu flag \"dts\" is missing"),
		CpuMetric::C1StateResidency if !features.model_in(C1_RESIDENCY_MODELS) => Some(UNSUPPORTED_MODEL),
		CpuMetric::C3StateResidency if !features.model_in(C3_RESIDENCY_MODELS) => Some(UNSUPPORTED_MODEL),
		CpuMetric::C6StateResidency if !features.model_in(C6_RESIDENCY_MODELS) => Some(UNSUPPORTED_MODEL),
		CpuMetric::C7StateResidency if !features.model_in(C7_RESIDENCY_MODELS) => Some(UNSUPPORTED_MODEL),
		_ => None,
	}
}

/// Returns why a package metric is unsupported, if it is
pub fn package_metric_unsupported(features: &CpuFeatures, metric: PackageMetric) -> Option<&'static str> {
	if metric.is_rapl_backed() {
		return None;
	}
	if !features.is_intel_family_6() {
		return Some("processor is not an Intel family 6 model");
	}
	if metric.is_msr_backed() {
		if !features.has_flag("msr") {
			return Some("cpu flag \"msr\" is missing");
		}
		if features.model_in(NO_TURBO_RATIO_MODELS) {
			return Some(UNSUPPORTED_MODEL);
		}
	}
	None
}

const UNSUPPORTED_MODEL: &str = "processor model is not supported";
