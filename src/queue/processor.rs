//! Message processor (C9): typed handlers with a duplicate in-flight guard,
//! a per-message timeout, and bounded exponential-backoff retries.

// std
use std::{collections::HashMap, future::Future};
// crates.io
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
// self
use crate::_prelude::*;

const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Inbound unit of work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
	/// Deduplication identity; only one in-flight `process` call per `id` is allowed.
	pub id: String,
	/// Handler lookup key.
	#[serde(rename = "type")]
	pub kind: String,
	/// Opaque payload handed to the handler.
	pub data: serde_json::Value,
	/// Attempts already made before this call (0 for a fresh message).
	#[serde(default)]
	pub attempts: u32,
}

/// Typed handler registered under a message `kind`.
#[async_trait]
pub trait Handler: Send + Sync {
	/// Process one message's payload, returning the result to report back.
	async fn handle(&self, data: &serde_json::Value) -> Result<serde_json::Value>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
	F: Fn(&serde_json::Value) -> Fut + Send + Sync,
	Fut: Future<Output = Result<serde_json::Value>> + Send,
{
	async fn handle(&self, data: &serde_json::Value) -> Result<serde_json::Value> {
		(self)(data).await
	}
}

/// Per-message outcome from [`MessageProcessor::process_batch`].
#[derive(Clone, Debug)]
pub struct MessageOutcome {
	/// Originating message id.
	pub id: String,
	/// Whether processing ultimately succeeded.
	pub succeeded: bool,
	/// Handler result on success.
	pub result: Option<serde_json::Value>,
	/// Final error message on failure.
	pub error: Option<String>,
}

/// Aggregate counts returned alongside [`MessageProcessor::process_batch`]'s per-message results.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchCounts {
	/// Messages that ultimately succeeded.
	pub processed: usize,
	/// Messages that exhausted their retries.
	pub failed: usize,
}

/// Dispatches [`Message`]s to registered [`Handler`]s with retry and dedup semantics.
pub struct MessageProcessor {
	handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
	in_flight: RwLock<HashMap<String, Instant>>,
	timeout: Duration,
	max_retries: u32,
	retry_delay: Duration,
}
impl MessageProcessor {
	/// Build a processor with a 30s timeout, 3 max retries, and a 1s base retry delay.
	pub fn new() -> Self {
		Self {
			handlers: RwLock::new(HashMap::new()),
			in_flight: RwLock::new(HashMap::new()),
			timeout: Duration::from_secs(30),
			max_retries: 3,
			retry_delay: Duration::from_secs(1),
		}
	}

	/// Override the per-message timeout, retry ceiling, and base retry delay.
	pub fn with_policy(mut self, timeout: Duration, max_retries: u32, retry_delay: Duration) -> Self {
		self.timeout = timeout;
		self.max_retries = max_retries;
		self.retry_delay = retry_delay;

		self
	}

	/// Register a handler for `kind`, replacing any previous registration.
	pub async fn register(&self, kind: impl Into<String>, handler: impl Handler + 'static) {
		self.handlers.write().await.insert(kind.into(), Arc::new(handler));
	}

	/// Process one message: duplicate in-flight ids are rejected immediately, otherwise the
	/// handler races a timeout and retries on failure with bounded exponential backoff.
	pub async fn process(&self, mut message: Message) -> Result<serde_json::Value> {
		{
			let mut in_flight = self.in_flight.write().await;

			if in_flight.contains_key(&message.id) {
				return Err(Error::Validation {
					field: "id",
					reason: format!("message '{}' is already in flight", message.id),
				});
			}

			in_flight.insert(message.id.clone(), Instant::now());
		}

		let handler = self.handlers.read().await.get(&message.kind).cloned();

		let Some(handler) = handler else {
			self.in_flight.write().await.remove(&message.id);

			return Err(Error::NotFound(format!("handler for message kind '{}'", message.kind)));
		};

		loop {
			let outcome = tokio::time::timeout(self.timeout, handler.handle(&message.data)).await;

			match outcome {
				Ok(Ok(value)) => {
					self.in_flight.write().await.remove(&message.id);

					return Ok(value);
				},
				Ok(Err(err)) =>
					if message.attempts < self.max_retries {
						self.sleep_backoff(message.attempts).await;
						message.attempts += 1;
					} else {
						self.in_flight.write().await.remove(&message.id);

						return Err(err);
					},
				Err(_) =>
					if message.attempts < self.max_retries {
						self.sleep_backoff(message.attempts).await;
						message.attempts += 1;
					} else {
						self.in_flight.write().await.remove(&message.id);

						return Err(Error::Timeout(self.timeout));
					},
			}
		}
	}

	async fn sleep_backoff(&self, attempts: u32) {
		let exponent = attempts.max(1) - 1;
		let delay = self.retry_delay.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX)).min(MAX_BACKOFF);

		tokio::time::sleep(delay).await;
	}

	/// Compute the backoff delay for the given attempt count without sleeping; exposed for tests
	/// and callers that want to surface the schedule.
	pub fn backoff_for(&self, attempts: u32) -> Duration {
		let exponent = attempts.max(1) - 1;

		self.retry_delay.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX)).min(MAX_BACKOFF)
	}

	/// Process every message concurrently, returning per-message outcomes and aggregate counts.
	pub async fn process_batch(self: &Arc<Self>, messages: Vec<Message>) -> (Vec<MessageOutcome>, BatchCounts) {
		let mut handles = Vec::with_capacity(messages.len());

		for message in messages {
			let processor = self.clone();

			handles.push(tokio::spawn(async move { processor.process_one(message).await }));
		}

		let results = futures_join_all(handles).await.into_iter().filter_map(Result::ok).collect::<Vec<_>>();
		let mut counts = BatchCounts::default();

		for outcome in &results {
			if outcome.succeeded {
				counts.processed += 1;
			} else {
				counts.failed += 1;
			}
		}

		(results, counts)
	}

	async fn process_one(&self, message: Message) -> MessageOutcome {
		let id = message.id.clone();

		match self.process(message).await {
			Ok(result) => MessageOutcome { id, succeeded: true, result: Some(result), error: None },
			Err(err) => MessageOutcome { id, succeeded: false, result: None, error: Some(err.to_string()) },
		}
	}

	/// Evict in-flight entries older than the configured timeout. Defensive: the timeout race in
	/// [`MessageProcessor::process`] normally clears these on its own.
	pub async fn cleanup_timed_out(&self) -> usize {
		let now = Instant::now();
		let mut in_flight = self.in_flight.write().await;
		let before = in_flight.len();

		in_flight.retain(|_, started| now.duration_since(*started) <= self.timeout);

		before - in_flight.len()
	}

	/// Number of messages currently in flight.
	pub async fn in_flight_count(&self) -> usize {
		self.in_flight.read().await.len()
	}
}
impl Default for MessageProcessor {
	fn default() -> Self {
		Self::new()
	}
}

async fn futures_join_all<T>(futures: Vec<impl Future<Output = T>>) -> Vec<T> {
	let mut out = Vec::with_capacity(futures.len());

	for future in futures {
		out.push(future.await);
	}

	out
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use super::*;

	#[tokio::test]
	async fn duplicate_in_flight_message_is_rejected() {
		let processor = Arc::new(
			MessageProcessor::new().with_policy(Duration::from_millis(200), 3, Duration::from_millis(5)),
		);

		processor
			.register("slow", |_: &serde_json::Value| async {
				tokio::time::sleep(Duration::from_millis(100)).await;

				Ok(serde_json::json!("done"))
			})
			.await;

		let processor_clone = processor.clone();
		let first = tokio::spawn(async move {
			processor_clone
				.process(Message { id: "m1".into(), kind: "slow".into(), data: serde_json::json!({}), attempts: 0 })
				.await
		});

		tokio::time::sleep(Duration::from_millis(10)).await;

		let second = processor
			.process(Message { id: "m1".into(), kind: "slow".into(), data: serde_json::json!({}), attempts: 0 })
			.await;

		assert!(second.is_err());
		assert!(first.await.unwrap().is_ok());
	}

	#[tokio::test]
	async fn backoff_doubles_per_attempt_and_caps_at_30s() {
		let processor = MessageProcessor::new().with_policy(Duration::from_secs(30), 10, Duration::from_millis(100));

		assert_eq!(processor.backoff_for(1), Duration::from_millis(100));
		assert_eq!(processor.backoff_for(2), Duration::from_millis(200));
		assert_eq!(processor.backoff_for(3), Duration::from_millis(400));
	}

	#[tokio::test]
	async fn failing_handler_retries_then_gives_up() {
		let processor = MessageProcessor::new().with_policy(Duration::from_secs(5), 2, Duration::from_millis(1));
		let calls = Arc::new(AtomicUsize::new(0));
		let calls_clone = calls.clone();

		processor
			.register("fail", move |_: &serde_json::Value| {
				let calls = calls_clone.clone();

				async move {
					calls.fetch_add(1, Ordering::SeqCst);

					Err(Error::Transient("nope".into()))
				}
			})
			.await;

		let result = processor
			.process(Message { id: "m2".into(), kind: "fail".into(), data: serde_json::json!({}), attempts: 0 })
			.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn process_batch_reports_per_message_outcomes() {
		let processor = Arc::new(MessageProcessor::new());

		processor.register("ok", |_: &serde_json::Value| async { Ok(serde_json::json!("ok")) }).await;

		let (outcomes, counts) = processor
			.process_batch(vec![
				Message { id: "a".into(), kind: "ok".into(), data: serde_json::json!({}), attempts: 0 },
				Message { id: "b".into(), kind: "missing".into(), data: serde_json::json!({}), attempts: 0 },
			])
			.await;

		assert_eq!(counts.processed, 1);
		assert_eq!(counts.failed, 1);
		assert_eq!(outcomes.len(), 2);
	}

	#[tokio::test]
	async fn process_batch_runs_messages_concurrently() {
		let processor = Arc::new(MessageProcessor::new());

		processor
			.register("slow", |_: &serde_json::Value| async {
				tokio::time::sleep(Duration::from_millis(100)).await;

				Ok(serde_json::json!("done"))
			})
			.await;

		let messages = (0..5)
			.map(|i| Message { id: i.to_string(), kind: "slow".into(), data: serde_json::json!({}), attempts: 0 })
			.collect();

		let started = Instant::now();
		let (_, counts) = processor.process_batch(messages).await;

		assert_eq!(counts.processed, 5);
		assert!(started.elapsed() < Duration::from_millis(400), "batch did not run concurrently");
	}
}
