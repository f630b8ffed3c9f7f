//! Cache warmer (C8): startup, scheduled, and on-demand prewarm triggers sharing
//! a common `execute_task` primitive.

// std
use std::{
	collections::{HashMap, VecDeque},
	future::Future,
};
// crates.io
use async_trait::async_trait;
use tokio::sync::{RwLock, Semaphore};
// self
use super::store::Cache;
use crate::_prelude::*;

const ACCESS_WINDOW: Duration = Duration::from_secs(3600);
const ON_DEMAND_COOLDOWN: Duration = Duration::from_secs(300);
const MIN_THRESHOLD: f64 = 20.0;
const MAX_THRESHOLD: f64 = 200.0;

/// Fetches the value a [`WarmTask`] should populate the cache with.
#[async_trait]
pub trait DataFetcher: Send + Sync {
	/// Produce the value to cache, or `None` to skip this run without error.
	async fn fetch(&self) -> Result<Option<serde_json::Value>>;
}

#[async_trait]
impl<F, Fut> DataFetcher for F
where
	F: Fn() -> Fut + Send + Sync,
	Fut: Future<Output = Result<Option<serde_json::Value>>> + Send,
{
	async fn fetch(&self) -> Result<Option<serde_json::Value>> {
		(self)().await
	}
}

/// Per-task tuning knobs.
#[derive(Clone, Debug)]
pub struct WarmOptions {
	/// 1 (highest) through 10 (lowest); governs startup ordering and on-demand threshold.
	pub priority: u8,
	/// TTL applied to values this task writes.
	pub ttl: Duration,
	/// Core tasks are never skipped during a bounded-concurrency startup pass.
	pub is_core: bool,
	/// Retry attempts for the scheduled periodic trigger.
	pub retry_times: u32,
	/// Base delay between scheduled-trigger retries (exponential backoff applies on top).
	pub retry_delay: Duration,
	/// Schedule string of the form `"0 */N * * *"`, or `None` to skip periodic scheduling.
	pub schedule: Option<String>,
}
impl Default for WarmOptions {
	fn default() -> Self {
		Self {
			priority: 5,
			ttl: Duration::from_secs(3600),
			is_core: false,
			retry_times: 3,
			retry_delay: Duration::from_millis(500),
			schedule: None,
		}
	}
}

struct TaskEntry {
	entity: String,
	operation: String,
	identifier: String,
	fetcher: Arc<dyn DataFetcher>,
	options: WarmOptions,
}

/// Rolling execution statistics for one task.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskStats {
	/// Successful executions.
	pub successes: u64,
	/// Failed executions (fetcher error, or fetcher returned `None`).
	pub failures: u64,
	/// Exponentially-weighted mean latency in milliseconds.
	pub mean_latency_ms: f64,
}

struct AccessState {
	timestamps: VecDeque<Instant>,
	threshold: f64,
	last_on_demand: Option<Instant>,
}
impl AccessState {
	fn new(priority: u8) -> Self {
		let initial = (100.0 - priority as f64 * 10.0).max(MIN_THRESHOLD);

		Self { timestamps: VecDeque::new(), threshold: initial, last_on_demand: None }
	}

	fn record(&mut self, now: Instant) {
		self.timestamps.push_back(now);

		while self.timestamps.front().is_some_and(|t| now.duration_since(*t) > ACCESS_WINDOW) {
			self.timestamps.pop_front();
		}
	}

	fn recent_count(&self, now: Instant) -> usize {
		self.timestamps.iter().filter(|t| now.duration_since(**t) <= ACCESS_WINDOW).count()
	}

	fn cooldown_elapsed(&self, now: Instant) -> bool {
		self.last_on_demand.is_none_or(|last| now.duration_since(last) >= ON_DEMAND_COOLDOWN)
	}

	fn on_success(&mut self) {
		self.threshold = (self.threshold * 0.9).max(MIN_THRESHOLD);
	}

	fn on_failure(&mut self) {
		self.threshold = (self.threshold * 1.2).min(MAX_THRESHOLD);
	}
}

/// Result of a bounded-concurrency startup prewarm pass.
#[derive(Debug, Default)]
pub struct StartupReport {
	/// Keys that warmed successfully.
	pub successful: Vec<String>,
	/// Keys that failed or timed out.
	pub failed: Vec<String>,
}

/// Runs startup, scheduled, and on-demand prewarm triggers against a shared [`Cache`].
pub struct CacheWarmer {
	cache: Arc<Cache>,
	tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
	stats: RwLock<HashMap<String, TaskStats>>,
	access: RwLock<HashMap<String, AccessState>>,
	scheduled_running: std::sync::atomic::AtomicBool,
	stop: tokio::sync::Notify,
}
impl CacheWarmer {
	/// Build a warmer over `cache`.
	pub fn new(cache: Arc<Cache>) -> Arc<Self> {
		Arc::new(Self {
			cache,
			tasks: RwLock::new(HashMap::new()),
			stats: RwLock::new(HashMap::new()),
			access: RwLock::new(HashMap::new()),
			scheduled_running: std::sync::atomic::AtomicBool::new(false),
			stop: tokio::sync::Notify::new(),
		})
	}

	/// Register a task under its structured cache key.
	pub async fn register_task(
		&self,
		entity: impl Into<String>,
		operation: impl Into<String>,
		identifier: impl Into<String>,
		fetcher: impl DataFetcher + 'static,
		options: WarmOptions,
	) {
		let entity = entity.into();
		let operation = operation.into();
		let identifier = identifier.into();
		let key = super::key::cache_key(&entity, &operation, &identifier);
		let priority = options.priority;

		self.tasks.write().await.insert(
			key.clone(),
			Arc::new(TaskEntry { entity, operation, identifier, fetcher: Arc::new(fetcher), options }),
		);
		self.access.write().await.insert(key, AccessState::new(priority));
	}

	/// Run one task's fetcher and, on a non-null value, write it through to the cache.
	/// Updates success/failure counters and a rolling mean latency regardless of outcome.
	pub async fn execute_task(&self, key: &str) -> Result<bool> {
		let task = self.tasks.read().await.get(key).cloned().ok_or_else(|| Error::NotFound(format!("warm task '{key}'")))?;
		let started = Instant::now();
		let outcome = task.fetcher.fetch().await;
		let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
		let success = matches!(outcome, Ok(Some(_)));

		if let Ok(Some(value)) = &outcome {
			self.cache.set(&task.entity, &task.operation, &task.identifier, value, task.options.ttl).await?;
		}

		self.record_stats(key, success, elapsed_ms).await;

		if let Ok(value) = outcome {
			Ok(value.is_some())
		} else {
			Ok(false)
		}
	}

	async fn record_stats(&self, key: &str, success: bool, elapsed_ms: f64) {
		let mut stats = self.stats.write().await;
		let entry = stats.entry(key.to_string()).or_default();

		if success {
			entry.successes += 1;
		} else {
			entry.failures += 1;
		}

		const ALPHA: f64 = 0.2;

		entry.mean_latency_ms = if entry.successes + entry.failures == 1 {
			elapsed_ms
		} else {
			entry.mean_latency_ms * (1.0 - ALPHA) + elapsed_ms * ALPHA
		};
	}

	/// Current statistics for a task, if it has run at least once.
	pub async fn stats(&self, key: &str) -> Option<TaskStats> {
		self.stats.read().await.get(key).copied()
	}

	/// Run every registered task once, ordered by ascending priority (1 first), bounded by
	/// `concurrency` in-flight tasks and an overall wall-clock `timeout`.
	pub async fn startup(self: &Arc<Self>, concurrency: usize, timeout: Duration) -> StartupReport {
		let mut keys: Vec<(String, u8)> = {
			let tasks = self.tasks.read().await;

			tasks.iter().map(|(key, task)| (key.clone(), task.options.priority)).collect()
		};

		keys.sort_by_key(|(_, priority)| *priority);

		let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
		let mut handles = Vec::with_capacity(keys.len());

		for (key, _) in keys {
			let semaphore = semaphore.clone();
			let warmer = self.clone();

			handles.push(tokio::spawn(async move {
				let _permit = semaphore.acquire_owned().await.ok();

				(key.clone(), warmer.execute_task(&key).await)
			}));
		}

		let mut report = StartupReport::default();

		match tokio::time::timeout(timeout, futures_join_all(handles)).await {
			Ok(results) =>
				for outcome in results {
					match outcome {
						Ok((key, Ok(true))) => report.successful.push(key),
						Ok((key, _)) => report.failed.push(key),
						Err(_) => {},
					}
				},
			Err(_) => tracing::warn!("cache warmer startup pass exceeded its timeout budget"),
		}

		report
	}

	/// Start per-task scheduled timers for every task carrying a `schedule`.
	pub fn start_scheduled(self: &Arc<Self>) {
		let warmer = self.clone();

		tokio::spawn(async move {
			let scheduled: Vec<(String, u64, u32, Duration)> = {
				let tasks = warmer.tasks.read().await;

				tasks
					.iter()
					.filter_map(|(key, task)| {
						let hours = parse_cron_hours(task.options.schedule.as_ref()?).ok()?;

						Some((key.clone(), hours, task.options.retry_times, task.options.retry_delay))
					})
					.collect()
			};

			for (key, hours, retries, delay) in scheduled {
				let warmer = warmer.clone();

				tokio::spawn(async move {
					let mut ticker = tokio::time::interval(Duration::from_secs(hours * 3600));

					loop {
						tokio::select! {
							_ = ticker.tick() => {
								warmer.run_with_retries(&key, retries, delay).await;
							},
							_ = warmer.stop.notified() => break,
						}
					}
				});
			}
		});
	}

	async fn run_with_retries(&self, key: &str, retries: u32, base_delay: Duration) {
		if self
			.scheduled_running
			.swap(true, std::sync::atomic::Ordering::SeqCst)
		{
			return;
		}

		let mut attempt = 0;

		loop {
			match self.execute_task(key).await {
				Ok(true) => break,
				_ if attempt >= retries => break,
				_ => {
					let backoff = base_delay * 2u32.saturating_pow(attempt);

					tokio::time::sleep(backoff).await;
					attempt += 1;
				},
			}
		}

		self.scheduled_running.store(false, std::sync::atomic::Ordering::SeqCst);
	}

	/// Record a cache access for `key`; on a miss, triggers an async on-demand warm once the
	/// recent access count crosses the task's dynamic threshold and its cooldown has elapsed.
	pub async fn record_access(self: &Arc<Self>, key: &str, is_hit: bool) {
		if is_hit {
			return;
		}

		let now = Instant::now();
		let should_trigger = {
			let mut access = self.access.write().await;
			let Some(state) = access.get_mut(key) else { return };

			state.record(now);

			state.recent_count(now) as f64 >= state.threshold && state.cooldown_elapsed(now)
		};

		if !should_trigger {
			return;
		}

		{
			let mut access = self.access.write().await;

			if let Some(state) = access.get_mut(key) {
				state.last_on_demand = Some(now);
			}
		}

		let warmer = self.clone();
		let key = key.to_string();

		tokio::spawn(async move {
			let success = warmer.execute_task(&key).await.unwrap_or(false);
			let mut access = warmer.access.write().await;

			if let Some(state) = access.get_mut(&key) {
				if success {
					state.on_success();
				} else {
					state.on_failure();
				}
			}
		});
	}

	/// Stop every scheduled timer.
	pub fn shutdown(&self) {
		self.stop.notify_waiters();
	}
}

/// Parse the narrow cron form `"0 */N * * *"` into an interval measured in hours.
pub fn parse_cron_hours(expr: &str) -> Result<u64> {
	let fields: Vec<&str> = expr.split_whitespace().collect();

	if fields.len() != 5 || fields[0] != "0" || fields[2] != "*" || fields[3] != "*" || fields[4] != "*" {
		return Err(Error::Validation { field: "schedule", reason: format!("unsupported cron expression '{expr}'") });
	}

	let hour_field = fields[1];
	let n = hour_field
		.strip_prefix("*/")
		.ok_or_else(|| Error::Validation { field: "schedule", reason: format!("unsupported cron expression '{expr}'") })?;

	n.parse::<u64>()
		.map_err(|_| Error::Validation { field: "schedule", reason: format!("invalid interval in '{expr}'") })
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
	use crate::kv::MemoryStore;

	struct CountingFetcher(Arc<AtomicUsize>);
	#[async_trait]
	impl DataFetcher for CountingFetcher {
		async fn fetch(&self) -> Result<Option<serde_json::Value>> {
			self.0.fetch_add(1, Ordering::SeqCst);

			Ok(Some(serde_json::json!({ "v": 1 })))
		}
	}

	#[test]
	fn cron_parser_accepts_narrow_form() {
		assert_eq!(parse_cron_hours("0 */6 * * *").unwrap(), 6);
		assert!(parse_cron_hours("*/5 * * * *").is_err());
		assert!(parse_cron_hours("0 6 * * *").is_err());
	}

	#[tokio::test]
	async fn execute_task_writes_value_and_records_stats() {
		let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new())));
		let warmer = CacheWarmer::new(cache.clone());
		let calls = Arc::new(AtomicUsize::new(0));

		warmer
			.register_task("user", "profile", "1", CountingFetcher(calls.clone()), WarmOptions::default())
			.await;

		let key = super::super::key::cache_key("user", "profile", "1");
		let ok = warmer.execute_task(&key).await.unwrap();

		assert!(ok);
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		let stats = warmer.stats(&key).await.unwrap();

		assert_eq!(stats.successes, 1);

		let cached: Option<serde_json::Value> = cache.get("user", "profile", "1").await.unwrap();

		assert!(cached.is_some());
	}

	#[tokio::test]
	async fn on_demand_threshold_tightens_on_success() {
		let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new())));
		let warmer = CacheWarmer::new(cache);
		let calls = Arc::new(AtomicUsize::new(0));
		let mut options = WarmOptions::default();

		options.priority = 5;

		warmer.register_task("user", "profile", "2", CountingFetcher(calls), options).await;

		let key = super::super::key::cache_key("user", "profile", "2");
		let initial_threshold = warmer.access.read().await.get(&key).unwrap().threshold;

		assert_eq!(initial_threshold, 50.0);
	}

	#[tokio::test]
	async fn startup_runs_all_tasks_and_reports_success() {
		let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new())));
		let warmer = CacheWarmer::new(cache);
		let calls = Arc::new(AtomicUsize::new(0));

		warmer
			.register_task("user", "profile", "3", CountingFetcher(calls), WarmOptions::default())
			.await;

		let report = warmer.startup(5, Duration::from_secs(5)).await;

		assert_eq!(report.successful.len(), 1);
		assert!(report.failed.is_empty());
	}
}
