//! Monitoring façade (C12): owns the metric registry, health registry, alert
//! engine, and optimization loop, wiring standard rules between them and
//! exposing one read/control surface.

// std
use std::{future::Future, time::SystemTime};
// self
use crate::{
	_prelude::*,
	alert::{AlertEngine, Alert, Comparison, Severity},
	health::{Check, CheckOutcome, HealthRegistry, Status as HealthStatus},
	metrics::{MetricKind, MetricRegistry, MetricSnapshot, SystemCollectorHandle},
	optimize::{Optimizer, OptimizationLoop, OptimizerReport},
};

/// Everything an embedding application needs to report per-request telemetry through
/// [`Monitoring::http_interceptor_start`]/[`Monitoring::http_interceptor_finish`].
pub struct RequestContext {
	started_at: Instant,
	method: String,
	route: String,
}

/// Aggregated view returned by [`Monitoring::status`].
pub struct StatusSummary {
	/// Overall health verdict.
	pub health: HealthStatus,
	/// Count of currently active alerts.
	pub active_alerts: usize,
	/// Names of every registered optimizer.
	pub optimizer_names: Vec<String>,
	/// Current global optimization phase, shared across every registered optimizer.
	pub optimizer_phase: crate::optimize::Phase,
}

/// Owns C1 through C5 and wires the standard cross-component rules a service expects out of
/// the box: resource-pressure metric alerts and a health-check-driven alert feed.
pub struct Monitoring {
	/// In-process metric registry (C1).
	pub metrics: Arc<MetricRegistry>,
	/// Health check registry (C2).
	pub health: Arc<HealthRegistry>,
	/// Alert engine (C4), wired to `metrics` and `health`.
	pub alerts: Arc<AlertEngine>,
	/// Optimization loop (C5).
	pub optimizer: Arc<OptimizationLoop>,
	system_collector: SystemCollectorHandle,
}
impl Monitoring {
	/// Build the façade, register the standard resource-pressure alert rules, and start the
	/// health-check evaluation timer, health-to-alert bridge, and system metric sampler.
	pub async fn new() -> Arc<Self> {
		let metrics = Arc::new(MetricRegistry::new());
		let health = HealthRegistry::new();
		let alerts = AlertEngine::new();
		let optimizer = OptimizationLoop::new();
		let system_collector =
			metrics.start_system_collector(Duration::from_secs(10), SystemTime::now()).await;

		let facade = Arc::new(Self { metrics, health, alerts, optimizer, system_collector });

		facade.register_standard_metrics().await;
		facade.register_standard_rules().await;
		facade.health.start(Duration::from_secs(30));
		facade.alerts.add_health_check_rule(facade.health.clone(), Duration::from_secs(15));

		facade
	}

	async fn register_standard_metrics(&self) {
		let _ = self.metrics.register("cpu_usage_percent", MetricKind::Gauge, "CPU utilization percent", Vec::<String>::new()).await;
		let _ = self.metrics.register("memory_usage_percent", MetricKind::Gauge, "Memory utilization percent", Vec::<String>::new()).await;
		let _ = self.metrics.register("error_rate_percent", MetricKind::Gauge, "Request error rate percent", Vec::<String>::new()).await;
		let _ = self.metrics.register("cache_hit_rate_percent", MetricKind::Gauge, "Cache hit rate percent", Vec::<String>::new()).await;
		let _ = self.metrics.register("queue_backlog_total", MetricKind::Gauge, "Total jobs waiting across all queues", Vec::<String>::new()).await;
		let _ = self.metrics.register("requests_total", MetricKind::Counter, "Total HTTP requests", ["method", "route", "status"]).await;
		let _ = self.metrics.register("requests_active", MetricKind::Gauge, "In-flight HTTP requests", Vec::<String>::new()).await;
		let _ = self.metrics.register("requests_errors_total", MetricKind::Counter, "HTTP requests completed with 4xx/5xx", ["method", "route", "status"]).await;
		let _ = self.metrics.register("request_duration_ms", MetricKind::Histogram, "HTTP request duration in milliseconds", ["method", "route", "status"]).await;
	}

	async fn register_standard_rules(self: &Arc<Self>) {
		let interval = Duration::from_secs(30);

		self.alerts
			.add_metric_rule("cpu_pressure", self.metrics.clone(), "cpu_usage_percent", vec![], Comparison::GreaterThan, 90.0, "CPU usage above 90%", Severity::Warning, interval)
			.await;
		self.alerts
			.add_metric_rule("memory_pressure", self.metrics.clone(), "memory_usage_percent", vec![], Comparison::GreaterThan, 90.0, "Memory usage above 90%", Severity::Warning, interval)
			.await;
		self.alerts
			.add_metric_rule("error_rate", self.metrics.clone(), "error_rate_percent", vec![], Comparison::GreaterThan, 5.0, "Error rate above 5%", Severity::Error, interval)
			.await;
		self.alerts
			.add_metric_rule("cache_hit_rate", self.metrics.clone(), "cache_hit_rate_percent", vec![], Comparison::LessThan, 50.0, "Cache hit rate below 50%", Severity::Warning, interval)
			.await;
		self.alerts
			.add_metric_rule("queue_backlog", self.metrics.clone(), "queue_backlog_total", vec![], Comparison::GreaterThan, 10_000.0, "Queue backlog above 10000", Severity::Critical, interval)
			.await;
	}

	/// Register a health probe for a database-like dependency and an associated periodic
	/// latency collector into `db_ping_ms`.
	pub async fn register_database(&self, name: impl Into<String>, probe: impl Check + 'static) {
		self.health.register(name, probe, Some(Duration::from_secs(3)), true).await;
	}

	/// Register a health probe for a key-value store dependency.
	pub async fn register_key_value_store(&self, name: impl Into<String>, probe: impl Check + 'static) {
		self.health.register(name, probe, Some(Duration::from_secs(3)), true).await;
	}

	/// Register a health probe for a queue system dependency.
	pub async fn register_queue_system(&self, name: impl Into<String>, probe: impl Check + 'static) {
		self.health.register(name, probe, Some(Duration::from_secs(3)), false).await;
	}

	/// Register a health probe for a cache service dependency.
	pub async fn register_cache_service(&self, name: impl Into<String>, probe: impl Check + 'static) {
		self.health.register(name, probe, Some(Duration::from_secs(3)), false).await;
	}

	/// Register an [`Optimizer`], settling for `settle_delay` after `optimize` before this
	/// loop calls `verify`. Use [`crate::optimize::DATABASE_SETTLE_DELAY`],
	/// [`crate::optimize::CACHE_SETTLE_DELAY`], [`crate::optimize::QUEUE_SETTLE_DELAY`], or a
	/// custom duration.
	pub async fn register_optimizer(&self, optimizer: Arc<dyn Optimizer>, settle_delay: Duration) {
		self.optimizer.register(optimizer, settle_delay).await;
	}

	/// Mark the start of an HTTP request for later completion via
	/// [`Monitoring::http_interceptor_finish`].
	pub async fn http_interceptor_start(&self, method: &str, route: &str) -> RequestContext {
		let _ = self
			.metrics
			.increment_counter("requests_total", 1.0, &[("method", method), ("route", route), ("status", "pending")])
			.await;
		let active = self.metrics.get("requests_active", &[]).await.unwrap_or(0.0);
		let _ = self.metrics.set("requests_active", active + 1.0, &[]).await;

		RequestContext { started_at: Instant::now(), method: method.to_string(), route: route.to_string() }
	}

	/// Complete an HTTP request: observes duration, decrements the in-flight gauge, and counts
	/// 4xx/5xx responses as errors.
	pub async fn http_interceptor_finish(&self, ctx: RequestContext, status: u16) {
		let status_label = status.to_string();
		let labels = [("method", ctx.method.as_str()), ("route", ctx.route.as_str()), ("status", status_label.as_str())];
		let elapsed_ms = ctx.started_at.elapsed().as_secs_f64() * 1000.0;

		let _ = self.metrics.observe_histogram("request_duration_ms", elapsed_ms, &labels).await;

		let active = self.metrics.get("requests_active", &[]).await.unwrap_or(1.0);

		let _ = self.metrics.set("requests_active", (active - 1.0).max(0.0), &[]).await;

		if status >= 400 {
			let _ = self.metrics.increment_counter("requests_errors_total", 1.0, &labels).await;
		}
	}

	/// Snapshot status summary: overall health, active alert count, and the global optimizer
	/// phase.
	pub async fn status(&self) -> StatusSummary {
		StatusSummary {
			health: self.health.overall().await,
			active_alerts: self.alerts.active().await.len(),
			optimizer_names: self.optimizer.names().await,
			optimizer_phase: self.optimizer.phase().await,
		}
	}

	/// Recent analyze/optimize/verify reports for a registered optimizer, newest first.
	pub async fn optimizer_reports(&self, name: &str) -> Vec<OptimizerReport> {
		self.optimizer.reports(name).await
	}

	/// Active and historical alerts.
	pub async fn alerts_snapshot(&self, history_limit: usize) -> (Vec<Alert>, Vec<Alert>) {
		(self.alerts.active().await, self.alerts.history(history_limit).await)
	}

	/// Render the metric registry in Prometheus text-exposition format.
	pub async fn text_exposition(&self) -> String {
		self.metrics.render_text_exposition().await
	}

	/// Raw metric snapshots, for callers that want structured access instead of text exposition.
	pub async fn metrics_snapshot(&self) -> Vec<MetricSnapshot> {
		self.metrics.snapshot().await
	}

	/// Trigger one global analyze/optimize/verify cycle across every registered optimizer, out
	/// of band. Rejected if a cycle is already in flight.
	pub async fn trigger_optimize(&self) -> Result<Vec<OptimizerReport>> {
		self.optimizer.run_cycle().await
	}

	/// Start automatic analysis on `interval` across every registered optimizer.
	pub async fn enable_automatic_optimization(&self, interval: Duration) {
		self.optimizer.enable_automatic(interval).await;
	}

	/// Stop automatic analysis.
	pub async fn disable_automatic_optimization(&self) {
		self.optimizer.disable_automatic().await;
	}

	/// Acknowledge an active alert.
	pub async fn acknowledge_alert(&self, name: &str, by: &str) -> Result<()> {
		self.alerts.acknowledge(name, by, None).await
	}

	/// Resolve an active alert.
	pub async fn resolve_alert(&self, name: &str, message: &str) -> Result<()> {
		self.alerts.resolve(name, message).await
	}

	/// Silence future raises matching `name`/`labels`.
	pub async fn silence_alert(
		&self,
		name: &str,
		duration: Option<Duration>,
		labels: Vec<(String, String)>,
		by: &str,
	) -> Result<String> {
		self.alerts.silence(name, duration, labels, by, None).await
	}

	/// Remove a silence.
	pub async fn unsilence_alert(&self, id: &str) -> Result<()> {
		self.alerts.unsilence(id).await
	}

	/// Stop every owned timer: health checks, alert rule evaluation, optimizer auto-runs, and
	/// the system metric sampler.
	pub async fn shutdown(&self) {
		self.health.shutdown();
		self.alerts.shutdown().await;
		self.optimizer.shutdown().await;
		self.system_collector.stop();
	}
}

/// Basic process-uptime health check, useful as a default always-healthy probe.
pub fn uptime_check(started_at: SystemTime) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = CheckOutcome> + Send>> + Clone {
	move || {
		let uptime = started_at.elapsed().unwrap_or_default();

		Box::pin(async move { CheckOutcome::healthy().with_details(serde_json::json!({ "uptime_secs": uptime.as_secs() })) })
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn status_reflects_unknown_before_any_check_runs() {
		let monitoring = Monitoring::new().await;

		monitoring.health.shutdown();

		let status = monitoring.status().await;

		assert_eq!(status.active_alerts, 0);
	}

	#[tokio::test]
	async fn http_interceptor_counts_errors_for_5xx() {
		let monitoring = Monitoring::new().await;

		let ctx = monitoring.http_interceptor_start("GET", "/users").await;

		monitoring.http_interceptor_finish(ctx, 500).await;

		let errors = monitoring
			.metrics
			.get("requests_errors_total", &[("method", "GET"), ("route", "/users"), ("status", "500")])
			.await;

		assert_eq!(errors, Some(1.0));

		monitoring.shutdown().await;
	}
}
