//! Scheduled health checks with per-check timeouts and a tri-state overall verdict.

// std
use std::{collections::HashMap, future::Future};
// crates.io
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
// self
use crate::_prelude::*;

/// Tri-state health verdict, plus `unknown` for checks that have never run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
	/// No check has completed yet.
	Unknown,
	/// Check is passing.
	Healthy,
	/// Check is failing but the registry can still serve degraded.
	Degraded,
	/// Check is failing and the owning system should be considered down.
	Unhealthy,
}

/// A single check's most recent outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthRecord {
	/// Current status for this check.
	pub status: Status,
	/// Whether this check's failure makes the overall verdict `unhealthy` rather than `degraded`.
	pub critical: bool,
	/// Timestamp of the most recent run, regardless of outcome.
	pub last_check: Option<DateTime<Utc>>,
	/// Timestamp of the most recent passing run.
	pub last_success: Option<DateTime<Utc>>,
	/// Timestamp of the most recent failing run.
	pub last_failure: Option<DateTime<Utc>>,
	/// Structured details attached by the check function.
	pub details: Option<serde_json::Value>,
	/// Error message from the most recent failure.
	pub error: Option<String>,
}
impl HealthRecord {
	fn unknown(critical: bool) -> Self {
		Self {
			status: Status::Unknown,
			critical,
			last_check: None,
			last_success: None,
			last_failure: None,
			details: None,
			error: None,
		}
	}
}

/// Outcome a check function reports for a single run.
pub struct CheckOutcome {
	/// Whether the check passed.
	pub healthy: bool,
	/// Optional structured evidence to surface alongside the verdict.
	pub details: Option<serde_json::Value>,
	/// Error message when `healthy` is false.
	pub error: Option<String>,
}
impl CheckOutcome {
	/// Build a passing outcome.
	pub fn healthy() -> Self {
		Self { healthy: true, details: None, error: None }
	}

	/// Build a failing outcome with an error message.
	pub fn unhealthy(error: impl Into<String>) -> Self {
		Self { healthy: false, details: None, error: Some(error.into()) }
	}

	/// Attach structured details to this outcome.
	pub fn with_details(mut self, details: serde_json::Value) -> Self {
		self.details = Some(details);

		self
	}
}

/// A named, pluggable health check.
#[async_trait]
pub trait Check: Send + Sync {
	/// Run the check once.
	async fn run(&self) -> CheckOutcome;
}

#[async_trait]
impl<F, Fut> Check for F
where
	F: Fn() -> Fut + Send + Sync,
	Fut: Future<Output = CheckOutcome> + Send,
{
	async fn run(&self) -> CheckOutcome {
		(self)().await
	}
}

struct Registration {
	check: Arc<dyn Check>,
	timeout: Duration,
	critical: bool,
	on_unhealthy: Option<Arc<dyn Fn(&HealthRecord) + Send + Sync>>,
}

/// Registers named checks, runs them on a schedule, and aggregates overall status.
pub struct HealthRegistry {
	registrations: RwLock<HashMap<String, Registration>>,
	records: RwLock<HashMap<String, HealthRecord>>,
	stop: tokio::sync::Notify,
}
impl HealthRegistry {
	/// Build an empty registry.
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			registrations: RwLock::new(HashMap::new()),
			records: RwLock::new(HashMap::new()),
			stop: tokio::sync::Notify::new(),
		})
	}

	/// Register a check. `timeout` defaults to 5s, `critical` to `true`.
	pub async fn register(
		&self,
		name: impl Into<String>,
		check: impl Check + 'static,
		timeout: Option<Duration>,
		critical: bool,
	) {
		self.register_with_callback(name, check, timeout, critical, None).await;
	}

	/// Register a check with a best-effort `on_unhealthy` callback, invoked with the
	/// just-updated record each time this check's run comes back unhealthy. Runs after the
	/// record is already committed, so a callback that errors has no effect on the status.
	pub async fn register_with_callback(
		&self,
		name: impl Into<String>,
		check: impl Check + 'static,
		timeout: Option<Duration>,
		critical: bool,
		on_unhealthy: Option<Arc<dyn Fn(&HealthRecord) + Send + Sync>>,
	) {
		let name = name.into();

		self.registrations.write().await.insert(
			name.clone(),
			Registration {
				check: Arc::new(check),
				timeout: timeout.unwrap_or(Duration::from_secs(5)),
				critical,
				on_unhealthy,
			},
		);
		self.records.write().await.insert(name, HealthRecord::unknown(critical));
	}

	/// Run every registered check independently and return the aggregated overall status.
	pub async fn check_all(&self) -> Status {
		type Callback = Option<Arc<dyn Fn(&HealthRecord) + Send + Sync>>;

		let snapshot: Vec<(String, Arc<dyn Check>, Duration, bool, Callback)> = {
			let registrations = self.registrations.read().await;

			registrations
				.iter()
				.map(|(name, reg)| {
					(name.clone(), reg.check.clone(), reg.timeout, reg.critical, reg.on_unhealthy.clone())
				})
				.collect()
		};

		for (name, check, timeout, critical, on_unhealthy) in snapshot {
			let outcome = match tokio::time::timeout(timeout, check.run()).await {
				Ok(outcome) => outcome,
				Err(_) => CheckOutcome::unhealthy(format!("check timeout after {timeout:?}")),
			};
			let now = Utc::now();
			let callback_record = {
				let mut records = self.records.write().await;
				let record = records.entry(name).or_insert_with(|| HealthRecord::unknown(critical));

				record.last_check = Some(now);
				record.details = outcome.details;

				if outcome.healthy {
					record.status = Status::Healthy;
					record.last_success = Some(now);
					record.error = None;

					None
				} else {
					record.status = if critical { Status::Unhealthy } else { Status::Degraded };
					record.last_failure = Some(now);
					record.error = outcome.error;

					Some(record.clone())
				}
			};

			if let (Some(callback), Some(record)) = (on_unhealthy, callback_record) {
				callback(&record);
			}
		}

		self.overall().await
	}

	/// Current per-check records.
	pub async fn records(&self) -> HashMap<String, HealthRecord> {
		self.records.read().await.clone()
	}

	/// Aggregate status per the truth table: unhealthy > degraded > healthy > unknown.
	pub async fn overall(&self) -> Status {
		let records = self.records.read().await;

		if records.is_empty() {
			return Status::Unknown;
		}

		let mut any_ran = false;
		let mut unhealthy = false;
		let mut degraded = false;

		for record in records.values() {
			match record.status {
				Status::Unhealthy if record.critical => {
					unhealthy = true;
					any_ran = true;
				},
				Status::Unhealthy | Status::Degraded => {
					degraded = true;
					any_ran = true;
				},
				Status::Healthy => any_ran = true,
				Status::Unknown => {},
			}
		}

		if !any_ran {
			Status::Unknown
		} else if unhealthy {
			Status::Unhealthy
		} else if degraded {
			Status::Degraded
		} else {
			Status::Healthy
		}
	}

	/// Whether the registry considers the system able to serve traffic (not `unhealthy`).
	pub async fn is_available(&self) -> bool {
		!matches!(self.overall().await, Status::Unhealthy)
	}

	/// Whether every check is currently passing.
	pub async fn is_healthy(&self) -> bool {
		matches!(self.overall().await, Status::Healthy)
	}

	/// Start a periodic evaluation loop; returns immediately, runs until [`HealthRegistry::shutdown`].
	pub fn start(self: &Arc<Self>, interval: Duration) {
		let registry = self.clone();

		tokio::spawn(async move {
			registry.check_all().await;

			let mut ticker = tokio::time::interval(interval);

			ticker.tick().await;

			loop {
				tokio::select! {
					_ = ticker.tick() => { registry.check_all().await; },
					_ = registry.stop.notified() => break,
				}
			}
		});
	}

	/// Stop the periodic evaluation loop started by [`HealthRegistry::start`].
	pub fn shutdown(&self) {
		self.stop.notify_waiters();
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn degraded_vs_unhealthy_truth_table() {
		let registry = HealthRegistry::new();

		registry.register("c", || async { CheckOutcome::healthy() }, None, true).await;
		registry.register("n", || async { CheckOutcome::unhealthy("boom") }, None, false).await;

		assert_eq!(registry.check_all().await, Status::Degraded);
		assert!(registry.is_available().await);
		assert!(!registry.is_healthy().await);

		registry.register("k", || async { CheckOutcome::unhealthy("down") }, None, true).await;

		assert_eq!(registry.check_all().await, Status::Unhealthy);
		assert!(!registry.is_available().await);
	}

	#[tokio::test]
	async fn slow_check_is_classified_as_timeout() {
		let registry = HealthRegistry::new();

		registry
			.register(
				"slow",
				|| async {
					tokio::time::sleep(Duration::from_millis(50)).await;
					CheckOutcome::healthy()
				},
				Some(Duration::from_millis(5)),
				true,
			)
			.await;

		registry.check_all().await;

		let records = registry.records().await;
		let record = &records["slow"];

		assert_eq!(record.status, Status::Unhealthy);
		assert!(record.error.as_deref().unwrap().contains("timeout"));
	}

	#[tokio::test]
	async fn unknown_before_any_check_runs() {
		let registry = HealthRegistry::new();

		registry.register("c", || async { CheckOutcome::healthy() }, None, true).await;

		assert_eq!(registry.overall().await, Status::Unknown);
	}

	#[tokio::test]
	async fn on_unhealthy_callback_fires_with_committed_record() {
		let registry = HealthRegistry::new();
		let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
		let seen_in_callback = seen.clone();

		registry
			.register_with_callback(
				"disk",
				|| async { CheckOutcome::unhealthy("full") },
				None,
				true,
				Some(Arc::new(move |record: &HealthRecord| {
					seen_in_callback.lock().unwrap().push(record.status);
				})),
			)
			.await;

		registry.check_all().await;

		assert_eq!(seen.lock().unwrap().as_slice(), [Status::Unhealthy]);
	}
}
