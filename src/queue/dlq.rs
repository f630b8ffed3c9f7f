//! Dead-letter queue (C11): records failed messages for inspection and
//! replay back onto their original queue.

// std
use std::collections::HashMap;
// crates.io
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
// self
use super::{job::JobOptions, registry::QueueRegistry};
use crate::_prelude::*;

/// Default retry ceiling before a record is considered permanently dead.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default age at which the sweeper removes a record.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
/// Default interval between sweeper runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// The error captured at failure time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqError {
	/// Display-formatted error message.
	pub message: String,
	/// Optional extended detail (this crate does not capture backtraces; `None` unless supplied).
	pub stack: Option<String>,
}

/// Where and how the original message failed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqContext {
	/// When the message was moved to the dead-letter queue.
	pub failed_at: DateTime<Utc>,
	/// Queue the message originated from, and will be retried onto.
	pub original_queue: String,
	/// Attempts made on the original queue before giving up.
	pub attempts: u32,
}

/// Dead-letter-specific bookkeeping, independent of the original message's own attempt count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqMeta {
	/// When this record was added.
	pub added_at: DateTime<Utc>,
	/// Number of times this record itself has been retried.
	pub retry_count: u32,
	/// Timestamp of the most recent retry, if any.
	pub last_retry_at: Option<DateTime<Utc>>,
	/// Earliest time the next retry should be attempted.
	pub next_retry_at: Option<DateTime<Utc>>,
}

/// One dead-lettered message, keyed by `"dlq:{original_id}"`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqRecord {
	/// Original message payload, ready to be re-enqueued verbatim.
	pub original_message: serde_json::Value,
	/// Original message id.
	pub original_id: String,
	/// Captured error.
	pub error: DlqError,
	/// Failure context.
	pub context: DlqContext,
	/// Dead-letter bookkeeping.
	pub meta: DlqMeta,
}

/// Selection criteria for [`DeadLetterQueue::retry_batch`].
#[derive(Clone, Debug, Default)]
pub struct RetryFilters {
	/// Only records at least this old.
	pub min_age: Option<Duration>,
	/// Only records whose retry_count is still below this ceiling.
	pub max_retries: Option<u32>,
	/// Only records whose original queue matches.
	pub queue_name: Option<String>,
}

/// Outcome of a [`DeadLetterQueue::retry_batch`] call.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryBatchReport {
	/// Records considered.
	pub total: usize,
	/// Records successfully re-enqueued.
	pub succeeded: usize,
	/// Records whose retry attempt errored.
	pub failed: usize,
	/// Records excluded by a filter.
	pub skipped: usize,
}

/// Dead-letter store with manual and batch retry, plus a background TTL sweeper.
pub struct DeadLetterQueue {
	registry: Arc<QueueRegistry>,
	records: RwLock<HashMap<String, DlqRecord>>,
	max_retries: u32,
	retry_interval: Duration,
	ttl: Duration,
	stop: tokio::sync::Notify,
}
impl DeadLetterQueue {
	/// Build a dead-letter queue backed by `registry` for re-enqueueing.
	pub fn new(registry: Arc<QueueRegistry>) -> Arc<Self> {
		Arc::new(Self {
			registry,
			records: RwLock::new(HashMap::new()),
			max_retries: DEFAULT_MAX_RETRIES,
			retry_interval: Duration::from_secs(60),
			ttl: DEFAULT_TTL,
			stop: tokio::sync::Notify::new(),
		})
	}

	/// Dead-letter id for an original message id.
	pub fn record_id(original_id: &str) -> String {
		format!("dlq:{original_id}")
	}

	/// Compose and store a [`DlqRecord`] for a message that exhausted its retries.
	pub async fn add_failed_message(
		&self,
		original_id: &str,
		original_queue: &str,
		original_message: serde_json::Value,
		error: &Error,
		attempts: u32,
	) -> String {
		let id = Self::record_id(original_id);
		let now = Utc::now();
		let record = DlqRecord {
			original_message,
			original_id: original_id.to_string(),
			error: DlqError { message: error.to_string(), stack: None },
			context: DlqContext { failed_at: now, original_queue: original_queue.to_string(), attempts },
			meta: DlqMeta { added_at: now, retry_count: 0, last_retry_at: None, next_retry_at: None },
		};

		self.records.write().await.insert(id.clone(), record);

		id
	}

	/// Fetch a record by its dead-letter id.
	pub async fn get(&self, id: &str) -> Option<DlqRecord> {
		self.records.read().await.get(id).cloned()
	}

	/// Re-enqueue the original message onto its original queue with `attempts:1`, bumping retry
	/// bookkeeping. Rejects once `meta.retry_count` has reached the configured ceiling.
	pub async fn retry_message(&self, id: &str) -> Result<()> {
		let mut records = self.records.write().await;
		let record = records.get_mut(id).ok_or_else(|| Error::NotFound(format!("dlq record '{id}'")))?;

		if record.meta.retry_count >= self.max_retries {
			return Err(Error::Validation {
				field: "retry_count",
				reason: format!("record '{id}' has exhausted its {} retries", self.max_retries),
			});
		}

		let queue = self.registry.get_or_create(&record.context.original_queue).await;
		let mut opts = JobOptions::default();

		opts.attempts = 1;

		queue.add(record.original_message.clone(), opts).await;

		let now = Utc::now();

		record.meta.retry_count += 1;
		record.meta.last_retry_at = Some(now);
		record.meta.next_retry_at = Some(
			now + TimeDelta::from_std(
				self.retry_interval * 2u32.saturating_pow(record.meta.retry_count),
			)
			.unwrap_or_default(),
		);

		Ok(())
	}

	/// Retry every record matching `filters`, skipping the rest.
	pub async fn retry_batch(&self, filters: RetryFilters) -> RetryBatchReport {
		let ids: Vec<String> = self.records.read().await.keys().cloned().collect();
		let mut report = RetryBatchReport { total: ids.len(), ..Default::default() };
		let now = Utc::now();

		for id in ids {
			let excluded = {
				let records = self.records.read().await;
				let Some(record) = records.get(&id) else { continue };

				let age_excluded = filters
					.min_age
					.is_some_and(|min_age| (now - record.meta.added_at).to_std().unwrap_or_default() < min_age);
				let retries_excluded =
					filters.max_retries.is_some_and(|limit| record.meta.retry_count >= limit);
				let queue_excluded = filters
					.queue_name
					.as_ref()
					.is_some_and(|name| &record.context.original_queue != name);

				age_excluded || retries_excluded || queue_excluded
			};

			if excluded {
				report.skipped += 1;

				continue;
			}

			match self.retry_message(&id).await {
				Ok(()) => report.succeeded += 1,
				Err(_) => report.failed += 1,
			}
		}

		report
	}

	/// Total records currently held.
	pub async fn len(&self) -> usize {
		self.records.read().await.len()
	}

	/// Whether no records are currently held.
	pub async fn is_empty(&self) -> bool {
		self.records.read().await.is_empty()
	}

	/// Start the background sweeper that removes records older than `ttl`. A no-op when
	/// `enabled` is false, matching the teacher's pattern of disabling background timers in
	/// test builds.
	pub fn start_sweeper(self: &Arc<Self>, enabled: bool) {
		if !enabled {
			return;
		}

		let dlq = self.clone();

		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(DEFAULT_SWEEP_INTERVAL);

			loop {
				tokio::select! {
					_ = ticker.tick() => dlq.sweep().await,
					_ = dlq.stop.notified() => break,
				}
			}
		});
	}

	async fn sweep(&self) {
		let now = Utc::now();
		let ttl = self.ttl;
		let mut records = self.records.write().await;
		let before = records.len();

		records.retain(|_, record| {
			(now - record.meta.added_at).to_std().map(|age| age < ttl).unwrap_or(true)
		});

		let _removed = (before - records.len()) as u64;

		drop(records);

		#[cfg(feature = "metrics")]
		crate::telemetry::record_dlq_sweep(_removed);
	}

	/// Stop the background sweeper.
	pub fn shutdown(&self) {
		self.stop.notify_waiters();
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn add_then_retry_reenqueues_on_original_queue() {
		let registry = QueueRegistry::new();
		let dlq = DeadLetterQueue::new(registry.clone());

		let id = dlq
			.add_failed_message("m1", "emails", serde_json::json!({ "to": "a@example.com" }), &Error::Fatal("boom".into()), 3)
			.await;

		assert_eq!(id, "dlq:m1");

		dlq.retry_message(&id).await.unwrap();

		let queue = registry.get_or_create("emails").await;
		let status = queue.status().await;

		assert_eq!(status.waiting, 1);

		let record = dlq.get(&id).await.unwrap();

		assert_eq!(record.meta.retry_count, 1);
	}

	#[tokio::test]
	async fn retry_rejected_once_ceiling_reached() {
		let registry = QueueRegistry::new();
		let dlq = DeadLetterQueue::new(registry);

		let id = dlq
			.add_failed_message("m2", "emails", serde_json::json!({}), &Error::Fatal("boom".into()), 3)
			.await;

		for _ in 0..DEFAULT_MAX_RETRIES {
			dlq.retry_message(&id).await.unwrap();
		}

		assert!(dlq.retry_message(&id).await.is_err());
	}

	#[tokio::test]
	async fn retry_batch_skips_filtered_queue_name() {
		let registry = QueueRegistry::new();
		let dlq = DeadLetterQueue::new(registry);

		dlq.add_failed_message("m3", "emails", serde_json::json!({}), &Error::Fatal("x".into()), 1).await;
		dlq.add_failed_message("m4", "sms", serde_json::json!({}), &Error::Fatal("x".into()), 1).await;

		let report = dlq
			.retry_batch(RetryFilters { queue_name: Some("emails".to_string()), ..Default::default() })
			.await;

		assert_eq!(report.total, 2);
		assert_eq!(report.succeeded, 1);
		assert_eq!(report.skipped, 1);
	}
}
