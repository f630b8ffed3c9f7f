//! Ambient emission of this crate's own operational counters into the
//! process-wide `metrics` crate, orthogonal to [`crate::metrics::MetricRegistry`]
//! (which is the in-crate C1 component applications use for their own metrics).
//!
//! Feature-gated exactly as the teacher crate gates its Prometheus export: off
//! by default, opt in with `metrics`/`prometheus`.

#![cfg(feature = "metrics")]

// std
use std::sync::OnceLock;
// crates.io
use metrics::Label;
use metrics_exporter_prometheus::PrometheusHandle;
use smallvec::SmallVec;
// self
use crate::_prelude::*;

type LabelSet = SmallVec<[Label; 4]>;

const METRIC_LOCK_ACQUIRED: &str = "opstack_cache_lock_acquired_total";
const METRIC_LOCK_CONTENDED: &str = "opstack_cache_lock_contended_total";
const METRIC_DLQ_SWEEP_RUNS: &str = "opstack_dlq_sweep_runs_total";
const METRIC_DLQ_SWEPT: &str = "opstack_dlq_entries_swept_total";
const METRIC_OPTIMIZER_CYCLE: &str = "opstack_optimizer_cycles_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	use metrics_exporter_prometheus::PrometheusBuilder;

	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle =
		PrometheusBuilder::new().install_recorder().map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a lock acquisition attempt for `key`, tagging whether it contended.
pub fn record_lock_attempt(key: &str, contended: bool) {
	let labels = key_labels(key);

	if contended {
		metrics::counter!(METRIC_LOCK_CONTENDED, labels.iter()).increment(1);
	} else {
		metrics::counter!(METRIC_LOCK_ACQUIRED, labels.iter()).increment(1);
	}
}

/// Record one DLQ cleanup sweep along with how many entries it removed.
pub fn record_dlq_sweep(removed: u64) {
	metrics::counter!(METRIC_DLQ_SWEEP_RUNS).increment(1);
	metrics::counter!(METRIC_DLQ_SWEPT).increment(removed);
}

/// Record one optimizer analyze/optimize/verify cycle for `optimizer`.
pub fn record_optimizer_cycle(optimizer: &str, succeeded: bool) {
	let mut labels = LabelSet::with_capacity(2);

	labels.push(Label::new("optimizer", optimizer.to_owned()));
	labels.push(Label::new("outcome", if succeeded { "success" } else { "error" }));

	metrics::counter!(METRIC_OPTIMIZER_CYCLE, labels.iter()).increment(1);
}

fn key_labels(key: &str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(1);

	labels.push(Label::new("key", key.to_owned()));

	labels
}

#[cfg(test)]
mod tests {
	// crates.io
	use metrics_util::debugging::{DebugValue, DebuggingRecorder};
	// self
	use super::*;

	#[test]
	#[cfg_attr(miri, ignore)]
	fn records_lock_contention_counters() {
		let recorder = DebuggingRecorder::new();
		let snapshotter = recorder.snapshotter();

		metrics::with_local_recorder(&recorder, || {
			record_lock_attempt("rdp:user:profile:1:v1", false);
			record_lock_attempt("rdp:user:profile:1:v1", true);
		});

		let snapshot = snapshotter.snapshot().into_vec();
		let contended = snapshot
			.iter()
			.find(|(key, _, _, _)| key.key().name() == METRIC_LOCK_CONTENDED)
			.map(|(_, _, _, value)| match value {
				DebugValue::Counter(value) => *value,
				_ => 0,
			})
			.unwrap_or(0);

		assert_eq!(contended, 1);
	}
}
