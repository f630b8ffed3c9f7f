//! In-process metric registry: typed counters, gauges, and histograms with a
//! Prometheus-compatible text exposition renderer.

// std
use std::collections::HashMap;
// crates.io
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
// self
use crate::_prelude::*;

/// Fixed histogram bucket ladder shared by every registered histogram.
pub const BUCKETS: &[f64] =
	&[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0];

/// Kind of a registered metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
	/// Monotonically non-decreasing accumulator.
	Counter,
	/// Point-in-time value that may move in either direction.
	Gauge,
	/// Cumulative distribution of observed values.
	Histogram,
}
impl MetricKind {
	fn exposition_name(self) -> &'static str {
		match self {
			MetricKind::Counter => "counter",
			MetricKind::Gauge => "gauge",
			MetricKind::Histogram => "histogram",
		}
	}
}

#[derive(Clone, Debug, Default)]
struct Histogram {
	sum: f64,
	count: u64,
	buckets: Vec<u64>,
}
impl Histogram {
	fn new() -> Self {
		Self { sum: 0.0, count: 0, buckets: vec![0; BUCKETS.len()] }
	}

	fn observe(&mut self, value: f64) {
		self.sum += value;
		self.count += 1;

		for (boundary, bucket) in BUCKETS.iter().zip(self.buckets.iter_mut()) {
			if value <= *boundary {
				*bucket += 1;
			}
		}
	}
}

#[derive(Clone, Debug)]
enum Cell {
	Counter(f64),
	Gauge(f64),
	Histogram(Histogram),
}

/// A single labelled value captured by [`MetricRegistry::snapshot`].
#[derive(Clone, Debug)]
pub struct MetricSample {
	/// Ordered label values matching the metric's registered label names.
	pub labels: Vec<(String, String)>,
	/// Counter/gauge value, or the histogram sum when `kind == Histogram`.
	pub value: f64,
	/// Populated only for histograms: `(sum, count, per-bucket cumulative counts)`.
	pub histogram: Option<(f64, u64, Vec<u64>)>,
}

/// Read-only view of one registered metric and its current samples.
#[derive(Clone, Debug)]
pub struct MetricSnapshot {
	/// Registered metric name, without the exposition prefix.
	pub name: String,
	/// Declared kind.
	pub kind: MetricKind,
	/// Help text supplied at registration.
	pub help: String,
	/// One sample per observed label tuple (a single entry for label-less metrics).
	pub samples: Vec<MetricSample>,
}

struct Descriptor {
	kind: MetricKind,
	help: String,
	label_names: Vec<String>,
	cells: RwLock<HashMap<Vec<String>, Cell>>,
}

/// Central registry of typed, optionally labelled metrics.
///
/// Locking is per-metric: each [`Descriptor`] owns its own `RwLock` over its
/// label-tuple map, so contention on one metric never blocks updates to
/// another, mirroring the narrow-locking discipline the rest of this crate
/// follows for shared mutable state.
pub struct MetricRegistry {
	prefix: String,
	metrics: RwLock<HashMap<String, Arc<Descriptor>>>,
}
impl MetricRegistry {
	/// Build a registry using the default `app_` exposition prefix.
	pub fn new() -> Self {
		Self::with_prefix("app_")
	}

	/// Build a registry using a custom exposition prefix.
	pub fn with_prefix(prefix: impl Into<String>) -> Self {
		Self { prefix: prefix.into(), metrics: RwLock::new(HashMap::new()) }
	}

	/// Register a metric, or return the existing descriptor if already registered.
	pub async fn register(
		&self,
		name: impl Into<String>,
		kind: MetricKind,
		help: impl Into<String>,
		label_names: impl IntoIterator<Item = impl Into<String>>,
	) -> Result<()> {
		let name = name.into();

		if self.metrics.read().await.contains_key(&name) {
			return Ok(());
		}

		let label_names = label_names.into_iter().map(Into::into).collect();
		let descriptor = Arc::new(Descriptor {
			kind,
			help: help.into(),
			label_names,
			cells: RwLock::new(HashMap::new()),
		});

		self.metrics.write().await.entry(name).or_insert(descriptor);

		Ok(())
	}

	/// Set a gauge (or counter) to an absolute value.
	pub async fn set(&self, name: &str, value: f64, labels: &[(&str, &str)]) -> Result<()> {
		let Some(descriptor) = self.descriptor(name).await else {
			tracing::warn!(metric = name, "set() on unregistered metric");

			return Ok(());
		};
		let key = self.label_key(&descriptor, labels);
		let mut cells = descriptor.cells.write().await;

		cells.insert(key, Cell::Gauge(value));

		Ok(())
	}

	/// Increment a counter by `delta`. Negative deltas are rejected and logged.
	pub async fn increment_counter(
		&self,
		name: &str,
		delta: f64,
		labels: &[(&str, &str)],
	) -> Result<()> {
		if delta < 0.0 {
			tracing::warn!(metric = name, delta, "rejected negative counter delta");

			return Ok(());
		}

		let Some(descriptor) = self.descriptor(name).await else {
			tracing::warn!(metric = name, "increment_counter() on unregistered metric");

			return Ok(());
		};
		let key = self.label_key(&descriptor, labels);
		let mut cells = descriptor.cells.write().await;

		match cells.entry(key).or_insert(Cell::Counter(0.0)) {
			Cell::Counter(current) => *current += delta,
			_ => tracing::warn!(metric = name, "increment_counter() on non-counter metric"),
		}

		Ok(())
	}

	/// Record a histogram observation.
	pub async fn observe_histogram(
		&self,
		name: &str,
		value: f64,
		labels: &[(&str, &str)],
	) -> Result<()> {
		let Some(descriptor) = self.descriptor(name).await else {
			tracing::warn!(metric = name, "observe_histogram() on unregistered metric");

			return Ok(());
		};
		let key = self.label_key(&descriptor, labels);
		let mut cells = descriptor.cells.write().await;

		match cells.entry(key).or_insert_with(|| Cell::Histogram(Histogram::new())) {
			Cell::Histogram(histogram) => histogram.observe(value),
			_ => tracing::warn!(metric = name, "observe_histogram() on non-histogram metric"),
		}

		Ok(())
	}

	/// Read back the current value for a label tuple, if the metric exists.
	pub async fn get(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
		let descriptor = self.descriptor(name).await?;
		let key = self.label_key(&descriptor, labels);
		let cells = descriptor.cells.read().await;

		match cells.get(&key)? {
			Cell::Counter(value) | Cell::Gauge(value) => Some(*value),
			Cell::Histogram(histogram) => Some(histogram.sum),
		}
	}

	/// Snapshot every registered metric and its current samples.
	pub async fn snapshot(&self) -> Vec<MetricSnapshot> {
		let metrics = self.metrics.read().await;
		let mut out = Vec::with_capacity(metrics.len());

		for (name, descriptor) in metrics.iter() {
			let cells = descriptor.cells.read().await;
			let mut samples = Vec::with_capacity(cells.len());

			for (key, cell) in cells.iter() {
				let labels =
					descriptor.label_names.iter().cloned().zip(key.iter().cloned()).collect();

				samples.push(match cell {
					Cell::Counter(value) | Cell::Gauge(value) =>
						MetricSample { labels, value: *value, histogram: None },
					Cell::Histogram(histogram) => MetricSample {
						labels,
						value: histogram.sum,
						histogram: Some((histogram.sum, histogram.count, histogram.buckets.clone())),
					},
				});
			}

			out.push(MetricSnapshot {
				name: name.clone(),
				kind: descriptor.kind,
				help: descriptor.help.clone(),
				samples,
			});
		}

		out
	}

	/// Render every metric in Prometheus text-exposition format.
	pub async fn render_text_exposition(&self) -> String {
		let mut snapshots = self.snapshot().await;

		snapshots.sort_by(|a, b| a.name.cmp(&b.name));

		let mut out = String::new();

		for metric in snapshots {
			let full_name = format!("{}{}", self.prefix, metric.name);

			out.push_str(&format!("# HELP {full_name} {}\n", metric.help));
			out.push_str(&format!("# TYPE {full_name} {}\n", metric.kind.exposition_name()));

			for sample in &metric.samples {
				let label_str = render_labels(&sample.labels);

				match &sample.histogram {
					None =>
						if label_str.is_empty() {
							out.push_str(&format!("{full_name} {}\n", sample.value));
						} else {
							out.push_str(&format!("{full_name}{label_str} {}\n", sample.value));
						},
					Some((sum, count, buckets)) => {
						out.push_str(&format!("{full_name}_sum{label_str} {sum}\n"));
						out.push_str(&format!("{full_name}_count{label_str} {count}\n"));

						for (boundary, cumulative) in BUCKETS.iter().zip(buckets.iter()) {
							let le_labels = push_label(&sample.labels, "le", &boundary.to_string());

							out.push_str(&format!(
								"{full_name}_bucket{} {cumulative}\n",
								render_labels(&le_labels)
							));
						}

						let inf_labels = push_label(&sample.labels, "le", "+Inf");

						out.push_str(&format!(
							"{full_name}_bucket{} {count}\n",
							render_labels(&inf_labels)
						));
					},
				}
			}
		}

		out
	}

	async fn descriptor(&self, name: &str) -> Option<Arc<Descriptor>> {
		self.metrics.read().await.get(name).cloned()
	}

	fn label_key(&self, descriptor: &Descriptor, labels: &[(&str, &str)]) -> Vec<String> {
		descriptor
			.label_names
			.iter()
			.map(|name| {
				labels
					.iter()
					.find(|(key, _)| key == name)
					.map(|(_, value)| value.to_string())
					.unwrap_or_default()
			})
			.collect()
	}
}
impl Default for MetricRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Handle controlling the background loop started by
/// [`MetricRegistry::start_system_collector`].
pub struct SystemCollectorHandle {
	stop: Arc<tokio::sync::Notify>,
}
impl SystemCollectorHandle {
	/// Stop sampling.
	pub fn stop(&self) {
		self.stop.notify_waiters();
	}
}

impl MetricRegistry {
	/// Register and start a background loop sampling process CPU usage, memory
	/// total/free/used-percent, 1-minute load average, and process uptime into
	/// gauges, at `interval`.
	pub async fn start_system_collector(
		self: &Arc<Self>,
		interval: Duration,
		started_at: std::time::SystemTime,
	) -> SystemCollectorHandle {
		for (name, help) in [
			("system_cpu_usage_percent", "Process CPU usage percent"),
			("system_memory_total_bytes", "Total system memory in bytes"),
			("system_memory_free_bytes", "Free system memory in bytes"),
			("system_memory_used_percent", "System memory used percent"),
			("system_load_average_1m", "1-minute system load average"),
			("process_uptime_seconds", "Process uptime in seconds"),
		] {
			let _ = self.register(name, MetricKind::Gauge, help, Vec::<String>::new()).await;
		}

		let stop = Arc::new(tokio::sync::Notify::new());
		let stop_for_task = stop.clone();
		let registry = self.clone();

		tokio::spawn(async move {
			let mut system = sysinfo::System::new_all();
			let mut ticker = tokio::time::interval(interval);

			loop {
				tokio::select! {
					_ = ticker.tick() => {
						system.refresh_cpu();
						system.refresh_memory();

						let cpu = system.global_cpu_info().cpu_usage() as f64;
						let total = system.total_memory() as f64;
						let free = system.free_memory() as f64;
						let used_percent = if total > 0.0 { (total - free) / total * 100.0 } else { 0.0 };
						let load_average = sysinfo::System::load_average().one;
						let uptime = started_at.elapsed().unwrap_or_default().as_secs_f64();

						let _ = registry.set("system_cpu_usage_percent", cpu, &[]).await;
						let _ = registry.set("system_memory_total_bytes", total, &[]).await;
						let _ = registry.set("system_memory_free_bytes", free, &[]).await;
						let _ = registry.set("system_memory_used_percent", used_percent, &[]).await;
						let _ = registry.set("system_load_average_1m", load_average, &[]).await;
						let _ = registry.set("process_uptime_seconds", uptime, &[]).await;
					},
					_ = stop_for_task.notified() => break,
				}
			}
		});

		SystemCollectorHandle { stop }
	}
}

fn render_labels(labels: &[(String, String)]) -> String {
	if labels.is_empty() {
		return String::new();
	}

	let pairs: Vec<String> =
		labels.iter().map(|(key, value)| format!("{key}=\"{value}\"")).collect();

	format!("{{{}}}", pairs.join(","))
}

fn push_label(labels: &[(String, String)], key: &str, value: &str) -> Vec<(String, String)> {
	let mut out = labels.to_vec();

	out.push((key.to_owned(), value.to_owned()));

	out
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn labelled_counter_accumulates_per_tuple() {
		let registry = MetricRegistry::new();

		registry
			.register("http_requests", MetricKind::Counter, "requests", ["method", "status"])
			.await
			.unwrap();
		registry
			.increment_counter("http_requests", 1.0, &[("method", "GET"), ("status", "200")])
			.await
			.unwrap();
		registry
			.increment_counter("http_requests", 1.0, &[("method", "GET"), ("status", "200")])
			.await
			.unwrap();
		registry
			.increment_counter("http_requests", 1.0, &[("method", "POST"), ("status", "201")])
			.await
			.unwrap();

		let snapshot = registry.snapshot().await;
		let metric = snapshot.iter().find(|m| m.name == "http_requests").unwrap();

		assert_eq!(metric.samples.len(), 2);

		let get_200 = metric
			.samples
			.iter()
			.find(|s| s.labels.contains(&("method".to_string(), "GET".to_string())))
			.unwrap();

		assert_eq!(get_200.value, 2.0);
	}

	#[tokio::test]
	async fn negative_counter_delta_is_rejected() {
		let registry = MetricRegistry::new();

		registry.register("c", MetricKind::Counter, "c", Vec::<String>::new()).await.unwrap();
		registry.increment_counter("c", 3.0, &[]).await.unwrap();
		registry.increment_counter("c", -1.0, &[]).await.unwrap();

		assert_eq!(registry.get("c", &[]).await, Some(3.0));
	}

	#[tokio::test]
	async fn histogram_count_matches_observations() {
		let registry = MetricRegistry::new();

		registry.register("h", MetricKind::Histogram, "h", Vec::<String>::new()).await.unwrap();

		for value in [2.0, 30.0, 3000.0] {
			registry.observe_histogram("h", value, &[]).await.unwrap();
		}

		let snapshot = registry.snapshot().await;
		let sample = &snapshot.iter().find(|m| m.name == "h").unwrap().samples[0];
		let (sum, count, buckets) = sample.histogram.clone().unwrap();

		assert_eq!(count, 3);
		assert_eq!(sum, 3032.0);
		assert_eq!(*buckets.last().unwrap(), 3);
	}

	#[tokio::test]
	async fn text_exposition_contains_help_type_and_inf_bucket() {
		let registry = MetricRegistry::new();

		registry.register("requests", MetricKind::Counter, "total requests", Vec::<String>::new())
			.await
			.unwrap();
		registry.increment_counter("requests", 4.0, &[]).await.unwrap();

		let body = registry.render_text_exposition().await;

		assert!(body.contains("# HELP app_requests total requests"));
		assert!(body.contains("# TYPE app_requests counter"));
		assert!(body.contains("app_requests 4"));
	}

	#[tokio::test]
	async fn register_is_idempotent() {
		let registry = MetricRegistry::new();

		registry.register("c", MetricKind::Counter, "first", Vec::<String>::new()).await.unwrap();
		registry.register("c", MetricKind::Counter, "second", Vec::<String>::new()).await.unwrap();

		let snapshot = registry.snapshot().await;

		assert_eq!(snapshot.iter().find(|m| m.name == "c").unwrap().help, "first");
	}
}
