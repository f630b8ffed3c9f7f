//! Alert rule evaluation, active-alert lifecycle, silencing, and history.

pub mod notifier;

// std
use std::{collections::HashMap, future::Future};
// crates.io
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
// self
use crate::{_prelude::*, health::HealthRegistry, metrics::MetricRegistry};
pub use notifier::{DeliveryRecord, Notifier};

/// Alert severity, ordered lowest to highest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
	/// Informational; no action required.
	Info,
	/// Worth a human's attention.
	Warning,
	/// Something is broken.
	Error,
	/// Something is broken and urgent.
	Critical,
}

/// Alert lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
	/// Currently firing, unacknowledged, unsilenced.
	Active,
	/// Currently firing, acknowledged by an operator.
	Acknowledged,
	/// Currently firing but suppressed by a matching [`Silence`].
	Silenced,
	/// No longer firing.
	Resolved,
}

/// Comparison operator for metric-threshold rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
	/// `>`
	GreaterThan,
	/// `<`
	LessThan,
	/// `>=`
	GreaterOrEqual,
	/// `<=`
	LessOrEqual,
	/// `==`
	Equal,
	/// `!=`
	NotEqual,
}
impl Comparison {
	fn holds(self, value: f64, threshold: f64) -> bool {
		match self {
			Comparison::GreaterThan => value > threshold,
			Comparison::LessThan => value < threshold,
			Comparison::GreaterOrEqual => value >= threshold,
			Comparison::LessOrEqual => value <= threshold,
			Comparison::Equal => (value - threshold).abs() < f64::EPSILON,
			Comparison::NotEqual => (value - threshold).abs() >= f64::EPSILON,
		}
	}
}

/// An alert instance, active or historical.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Alert {
	/// Unique identifier: `name` plus creation timestamp.
	pub id: String,
	/// Active-alert identity; at most one active alert exists per name.
	pub name: String,
	/// Human-readable message.
	pub message: String,
	/// Severity.
	pub severity: Severity,
	/// Labels attached at raise time.
	pub labels: Vec<(String, String)>,
	/// Current status.
	pub status: Status,
	/// Creation timestamp.
	pub created_at: DateTime<Utc>,
	/// Last mutation timestamp.
	pub last_updated: DateTime<Utc>,
	/// Acknowledgement timestamp, if acknowledged.
	pub acknowledged_at: Option<DateTime<Utc>>,
	/// Resolution timestamp, if resolved.
	pub resolved_at: Option<DateTime<Utc>>,
	/// Arbitrary structured evidence attached at raise time.
	pub data: Option<serde_json::Value>,
	/// Per-notifier delivery attempts.
	pub deliveries: Vec<DeliveryRecord>,
}

/// Declarative suppression of raises matching a name/label predicate.
#[derive(Clone, Debug)]
pub struct Silence {
	/// Unique identifier.
	pub id: String,
	/// Exact alert name, or `"*"` to match any name.
	pub name: String,
	/// Every entry must appear in the alert's labels for the silence to match.
	pub labels: Vec<(String, String)>,
	/// Creation timestamp.
	pub created_at: DateTime<Utc>,
	/// Expiry timestamp; `None` means permanent until explicitly unsilenced.
	pub expire_at: Option<DateTime<Utc>>,
	/// Operator who created the silence.
	pub silenced_by: String,
	/// Optional human-readable reason.
	pub reason: Option<String>,
}
impl Silence {
	fn matches(&self, name: &str, labels: &[(String, String)]) -> bool {
		let name_matches = self.name == "*" || self.name == name;

		name_matches
			&& self
				.labels
				.iter()
				.all(|(key, value)| labels.iter().any(|(k, v)| k == key && v == value))
	}

	fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expire_at.is_some_and(|expiry| now >= expiry)
	}
}

/// Pluggable rule predicate, evaluated once per `check_interval`.
#[async_trait::async_trait]
pub trait RuleCondition: Send + Sync {
	/// Evaluate the rule; `true` means the alert should be (or remain) active.
	async fn evaluate(&self) -> bool;
}

#[async_trait::async_trait]
impl<F, Fut> RuleCondition for F
where
	F: Fn() -> Fut + Send + Sync,
	Fut: Future<Output = bool> + Send,
{
	async fn evaluate(&self) -> bool {
		(self)().await
	}
}

/// Condition backing a metric-threshold rule (the common case per the data model).
pub struct MetricCondition {
	registry: Arc<MetricRegistry>,
	metric: String,
	labels: Vec<(String, String)>,
	comparison: Comparison,
	threshold: f64,
}
#[async_trait::async_trait]
impl RuleCondition for MetricCondition {
	async fn evaluate(&self) -> bool {
		let labels: Vec<(&str, &str)> =
			self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
		let value = self.registry.get(&self.metric, &labels).await.unwrap_or(0.0);

		self.comparison.holds(value, self.threshold)
	}
}

struct RuleState {
	enabled: bool,
	stop: Arc<tokio::sync::Notify>,
}

struct EngineState {
	active: HashMap<String, Alert>,
	history: std::collections::VecDeque<Alert>,
	silences: HashMap<String, Silence>,
}

/// Evaluates rules on independent timers, raises/resolves alerts, and fans out via [`Notifier`]s.
pub struct AlertEngine {
	state: RwLock<EngineState>,
	notifiers: RwLock<Vec<Arc<dyn Notifier>>>,
	rules: RwLock<HashMap<String, RuleState>>,
	max_history_size: usize,
}
impl AlertEngine {
	/// Build an engine with the default 1000-entry history bound.
	pub fn new() -> Arc<Self> {
		Self::with_history_size(1000)
	}

	/// Build an engine with a custom history bound.
	pub fn with_history_size(max_history_size: usize) -> Arc<Self> {
		Arc::new(Self {
			state: RwLock::new(EngineState {
				active: HashMap::new(),
				history: std::collections::VecDeque::new(),
				silences: HashMap::new(),
			}),
			notifiers: RwLock::new(vec![Arc::new(notifier::LoggerNotifier)]),
			rules: RwLock::new(HashMap::new()),
			max_history_size,
		})
	}

	/// Register an additional notifier sink.
	pub async fn add_notifier(&self, notifier: Arc<dyn Notifier>) {
		self.notifiers.write().await.push(notifier);
	}

	/// Register a rule with an arbitrary condition, starting its evaluation timer immediately.
	#[allow(clippy::too_many_arguments)]
	pub async fn add_rule(
		self: &Arc<Self>,
		name: impl Into<String>,
		condition: Arc<dyn RuleCondition>,
		message: impl Into<String>,
		severity: Severity,
		labels: Vec<(String, String)>,
		check_interval: Duration,
		auto_resolve_after: Option<Duration>,
	) {
		let name = name.into();
		let message = message.into();
		let stop = Arc::new(tokio::sync::Notify::new());

		self.rules.write().await.insert(name.clone(), RuleState { enabled: true, stop: stop.clone() });

		let engine = self.clone();
		let rule_name = name.clone();

		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(check_interval);

			loop {
				tokio::select! {
					_ = ticker.tick() => {
						if !engine.rule_enabled(&rule_name).await {
							continue;
						}

						let truthy = condition.evaluate().await;

						if truthy {
							if !engine.is_active(&rule_name).await {
								let _ = engine
									.raise(&rule_name, &message, severity, labels.clone(), None)
									.await;
							}
						} else if engine.is_active(&rule_name).await {
							let _ = engine.resolve(&rule_name, "Condition no longer met").await;
						}

						if let Some(after) = auto_resolve_after {
							engine.auto_resolve_if_stale(&rule_name, after).await;
						}
					},
					_ = stop.notified() => break,
				}
			}
		});
	}

	/// Convenience constructor for a metric-threshold rule.
	#[allow(clippy::too_many_arguments)]
	pub async fn add_metric_rule(
		self: &Arc<Self>,
		name: impl Into<String>,
		registry: Arc<MetricRegistry>,
		metric: impl Into<String>,
		metric_labels: Vec<(String, String)>,
		comparison: Comparison,
		threshold: f64,
		message: impl Into<String>,
		severity: Severity,
		check_interval: Duration,
	) {
		let condition = Arc::new(MetricCondition {
			registry,
			metric: metric.into(),
			labels: metric_labels,
			comparison,
			threshold,
		});

		self.add_rule(name, condition, message, severity, vec![], check_interval, None).await;
	}

	/// Subscribe to a health registry: raise `health_check_<name>` per unhealthy check and a
	/// composite `system_health` alert that tracks the overall verdict.
	pub fn add_health_check_rule(self: &Arc<Self>, health: Arc<HealthRegistry>, interval: Duration) {
		let engine = self.clone();

		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);

			loop {
				ticker.tick().await;

				let records = health.records().await;

				for (name, record) in &records {
					let alert_name = format!("health_check_{name}");
					let unhealthy = matches!(
						record.status,
						crate::health::Status::Unhealthy | crate::health::Status::Degraded
					);

					if unhealthy && !engine.is_active(&alert_name).await {
						let severity = if record.critical { Severity::Critical } else { Severity::Warning };
						let message =
							record.error.clone().unwrap_or_else(|| "check failing".to_string());

						let _ = engine.raise(&alert_name, &message, severity, vec![], None).await;
					} else if !unhealthy && engine.is_active(&alert_name).await {
						let _ = engine.resolve(&alert_name, "Check recovered").await;
					}
				}

				let overall = health.overall().await;
				let degraded = matches!(
					overall,
					crate::health::Status::Degraded | crate::health::Status::Unhealthy
				);

				if degraded && !engine.is_active("system_health").await {
					let severity = if matches!(overall, crate::health::Status::Unhealthy) {
						Severity::Critical
					} else {
						Severity::Warning
					};

					let _ = engine
						.raise("system_health", "Overall health degraded", severity, vec![], None)
						.await;
				} else if !degraded && engine.is_active("system_health").await {
					let _ = engine.resolve("system_health", "Overall health recovered").await;
				}
			}
		});
	}

	/// Raise an alert. A no-op (beyond touching `last_updated`) if already active and unsilenced.
	pub async fn raise(
		&self,
		name: &str,
		message: &str,
		severity: Severity,
		labels: Vec<(String, String)>,
		data: Option<serde_json::Value>,
	) -> Result<Alert> {
		let now = Utc::now();
		let mut state = self.state.write().await;

		prune_expired_silences(&mut state.silences, now);

		let silenced_by = state
			.silences
			.values()
			.find(|silence| silence.matches(name, &labels))
			.map(|silence| silence.id.clone());

		if let Some(existing) = state.active.get_mut(name) {
			existing.last_updated = now;

			return Ok(existing.clone());
		}

		let alert = Alert {
			id: format!("{name}-{}", now.timestamp_nanos_opt().unwrap_or_default()),
			name: name.to_string(),
			message: message.to_string(),
			severity,
			labels,
			status: if silenced_by.is_some() { Status::Silenced } else { Status::Active },
			created_at: now,
			last_updated: now,
			acknowledged_at: None,
			resolved_at: None,
			data,
			deliveries: Vec::new(),
		};

		if silenced_by.is_none() {
			state.active.insert(name.to_string(), alert.clone());
		}

		push_history(&mut state.history, alert.clone(), self.max_history_size);

		drop(state);

		if silenced_by.is_none() {
			self.fan_out(&alert).await;
		}

		Ok(alert)
	}

	/// Resolve an active alert by name.
	pub async fn resolve(&self, name: &str, message: &str) -> Result<()> {
		let now = Utc::now();
		let mut state = self.state.write().await;

		let Some(mut alert) = state.active.remove(name) else {
			return Err(Error::NotFound(format!("alert '{name}'")));
		};

		alert.status = Status::Resolved;
		alert.resolved_at = Some(now);
		alert.last_updated = now;
		alert.message = message.to_string();

		update_history(&mut state.history, &alert);

		Ok(())
	}

	/// Acknowledge an active alert, keeping it in the active set.
	pub async fn acknowledge(&self, name: &str, acknowledged_by: &str, message: Option<&str>) -> Result<()> {
		if acknowledged_by.is_empty() {
			return Err(Error::Validation {
				field: "acknowledged_by",
				reason: "must not be empty".into(),
			});
		}

		let now = Utc::now();
		let mut state = self.state.write().await;
		let alert = state
			.active
			.get_mut(name)
			.ok_or_else(|| Error::NotFound(format!("alert '{name}'")))?;

		alert.status = Status::Acknowledged;
		alert.acknowledged_at = Some(now);
		alert.last_updated = now;

		if let Some(message) = message {
			alert.message = message.to_string();
		}

		let snapshot = alert.clone();

		update_history(&mut state.history, &snapshot);

		Ok(())
	}

	/// Create a silence; immediately transitions any matching active alert to `silenced`.
	pub async fn silence(
		&self,
		name: impl Into<String>,
		duration: Option<Duration>,
		labels: Vec<(String, String)>,
		silenced_by: impl Into<String>,
		reason: Option<String>,
	) -> Result<String> {
		let silenced_by = silenced_by.into();

		if silenced_by.is_empty() {
			return Err(Error::Validation { field: "silenced_by", reason: "must not be empty".into() });
		}

		let now = Utc::now();
		let id = format!("silence-{}", now.timestamp_nanos_opt().unwrap_or_default());
		let silence = Silence {
			id: id.clone(),
			name: name.into(),
			labels,
			created_at: now,
			expire_at: duration.map(|d| now + TimeDelta::from_std(d).unwrap_or_default()),
			silenced_by,
			reason,
		};
		let mut state = self.state.write().await;

		for alert in state.active.values_mut() {
			if silence.matches(&alert.name, &alert.labels) {
				alert.status = Status::Silenced;
				alert.last_updated = now;
			}
		}

		state.silences.insert(id.clone(), silence);

		Ok(id)
	}

	/// Remove a silence, restoring any alert it was suppressing back to `active`.
	pub async fn unsilence(&self, id: &str) -> Result<()> {
		let mut state = self.state.write().await;

		if state.silences.remove(id).is_none() {
			return Err(Error::NotFound(format!("silence '{id}'")));
		}

		let now = Utc::now();
		let remaining: Vec<Silence> = state.silences.values().cloned().collect();

		for alert in state.active.values_mut() {
			if alert.status == Status::Silenced
				&& !remaining.iter().any(|s| s.matches(&alert.name, &alert.labels))
			{
				alert.status = Status::Active;
				alert.last_updated = now;
			}
		}

		Ok(())
	}

	/// Currently active alerts (any status other than resolved).
	pub async fn active(&self) -> Vec<Alert> {
		self.state.read().await.active.values().cloned().collect()
	}

	/// Most recent history entries, newest first, bounded by `limit`.
	pub async fn history(&self, limit: usize) -> Vec<Alert> {
		self.state.read().await.history.iter().take(limit).cloned().collect()
	}

	/// Disable a rule's evaluation without removing its timer task.
	pub async fn disable_rule(&self, name: &str) {
		if let Some(rule) = self.rules.write().await.get_mut(name) {
			rule.enabled = false;
		}
	}

	/// Re-enable a previously disabled rule.
	pub async fn enable_rule(&self, name: &str) {
		if let Some(rule) = self.rules.write().await.get_mut(name) {
			rule.enabled = true;
		}
	}

	/// Stop every rule's evaluation timer.
	pub async fn shutdown(&self) {
		for rule in self.rules.read().await.values() {
			rule.stop.notify_waiters();
		}
	}

	async fn is_active(&self, name: &str) -> bool {
		self.state.read().await.active.contains_key(name)
	}

	async fn rule_enabled(&self, name: &str) -> bool {
		self.rules.read().await.get(name).is_some_and(|rule| rule.enabled)
	}

	async fn auto_resolve_if_stale(&self, name: &str, after: Duration) {
		let now = Utc::now();
		let should_resolve = {
			let state = self.state.read().await;

			state.active.get(name).is_some_and(|alert| {
				(now - alert.created_at).to_std().map(|elapsed| elapsed >= after).unwrap_or(false)
			})
		};

		if should_resolve {
			let _ = self.resolve(name, "Auto-resolved after timeout").await;
		}
	}

	async fn fan_out(&self, alert: &Alert) {
		let notifiers: Vec<Arc<dyn Notifier>> = self.notifiers.read().await.clone();
		let mut records = Vec::with_capacity(notifiers.len());

		for notifier in notifiers {
			if !notifier.filter(alert) {
				continue;
			}

			let result = notifier.notify(alert).await;
			let record = DeliveryRecord {
				notifier: notifier.name().to_string(),
				at: Utc::now(),
				success: result.is_ok(),
				error: result.err().map(|err| err.to_string()),
			};

			records.push(record);
		}

		let mut state = self.state.write().await;

		if let Some(active) = state.active.get_mut(&alert.name) {
			active.deliveries.extend(records);
		}
	}
}
impl Default for AlertEngine {
	fn default() -> Self {
		unreachable!("use AlertEngine::new(), which returns an Arc")
	}
}

fn push_history(history: &mut std::collections::VecDeque<Alert>, alert: Alert, max: usize) {
	history.push_front(alert);

	while history.len() > max {
		history.pop_back();
	}
}

fn update_history(history: &mut std::collections::VecDeque<Alert>, alert: &Alert) {
	if let Some(entry) = history.iter_mut().find(|entry| entry.id == alert.id) {
		*entry = alert.clone();
	}
}

fn prune_expired_silences(silences: &mut HashMap<String, Silence>, now: DateTime<Utc>) {
	silences.retain(|_, silence| !silence.is_expired(now));
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn active_alert_uniqueness_per_name() {
		let engine = AlertEngine::new();

		let first = engine.raise("disk_full", "full", Severity::Error, vec![], None).await.unwrap();
		let second = engine.raise("disk_full", "full again", Severity::Error, vec![], None).await.unwrap();

		assert_eq!(first.id, second.id);
		assert_eq!(engine.active().await.len(), 1);
	}

	#[tokio::test]
	async fn silence_blocks_raise_and_notifier() {
		let engine = AlertEngine::new();

		engine.silence("disk_full", Some(Duration::from_secs(3600)), vec![], "alice", None).await.unwrap();

		let alert = engine.raise("disk_full", "full", Severity::Error, vec![], None).await.unwrap();

		assert_eq!(alert.status, Status::Silenced);
		assert!(alert.deliveries.is_empty());
		assert!(!engine.active().await.iter().any(|a| a.name == "disk_full"));
	}

	#[tokio::test]
	async fn unsilence_restores_active_status() {
		let engine = AlertEngine::new();

		let id =
			engine.silence("disk_full", None, vec![], "alice", None).await.unwrap();

		engine.raise("disk_full", "full", Severity::Error, vec![], None).await.unwrap();
		engine.unsilence(&id).await.unwrap();

		let active = engine.active().await;
		let alert = active.iter().find(|a| a.name == "disk_full").unwrap();

		assert_eq!(alert.status, Status::Active);
	}

	#[tokio::test]
	async fn history_is_bounded() {
		let engine = AlertEngine::with_history_size(2);

		for i in 0..5 {
			engine.raise(&format!("a{i}"), "m", Severity::Info, vec![], None).await.unwrap();
		}

		assert_eq!(engine.history(10).await.len(), 2);
	}

	#[tokio::test]
	async fn resolve_unknown_alert_errors() {
		let engine = AlertEngine::new();

		assert!(engine.resolve("missing", "n/a").await.is_err());
	}
}
