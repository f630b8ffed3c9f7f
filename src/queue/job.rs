//! Job queue (C10): a named, pluggable-store queue with bounded-concurrency
//! processing, retry/backoff, and lifecycle event fan-out.

// std
use std::collections::{HashMap, VecDeque};
// crates.io
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
// self
use super::processor::Handler;
use crate::_prelude::*;

/// Job lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	/// Queued, not yet picked up.
	Waiting,
	/// Currently executing.
	Active,
	/// Finished successfully.
	Completed,
	/// Exhausted its retries.
	Failed,
	/// Scheduled for later; not yet visible to the dispatcher.
	Delayed,
}

/// Per-add tuning knobs.
#[derive(Clone, Debug)]
pub struct JobOptions {
	/// Maximum attempts, including the first.
	pub attempts: u32,
	/// Base backoff between attempts; doubles per retry.
	pub backoff_base: Duration,
	/// Whether to evict the job from the store immediately after it completes.
	pub remove_on_complete: bool,
	/// Delay before the job becomes visible to the dispatcher.
	pub delay: Option<Duration>,
}
impl Default for JobOptions {
	fn default() -> Self {
		Self {
			attempts: 3,
			backoff_base: Duration::from_secs(1),
			remove_on_complete: true,
			delay: None,
		}
	}
}

/// A unit of queued work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
	/// Unique identifier.
	pub id: String,
	/// Opaque payload.
	pub data: serde_json::Value,
	/// Attempts made so far.
	pub attempts: u32,
	/// Configured attempt ceiling.
	pub max_attempts: u32,
	/// Current lifecycle status.
	pub status: JobStatus,
	/// Creation timestamp.
	pub created_at: DateTime<Utc>,
	/// Completion or failure timestamp.
	pub finished_at: Option<DateTime<Utc>>,
	/// Error from the most recent failed attempt.
	pub failed_reason: Option<String>,
}

/// Lifecycle event emitted onto a [`JobQueue`]'s broadcast channel.
#[derive(Clone, Debug)]
pub enum JobEvent {
	/// A job became visible to the dispatcher.
	Waiting(String),
	/// A job started executing.
	Active(String),
	/// A job finished successfully.
	Completed(String, serde_json::Value),
	/// A job exhausted its retries.
	Failed(String, String),
	/// A job's worker appears to have stalled (reserved for store-backed implementations).
	Stalled(String),
}

/// Waiting/active/completed/failed/delayed counts.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStatus {
	/// Jobs waiting to be picked up.
	pub waiting: usize,
	/// Jobs currently executing.
	pub active: usize,
	/// Jobs that finished successfully and are still retained.
	pub completed: usize,
	/// Jobs that exhausted their retries.
	pub failed: usize,
	/// Jobs scheduled for later.
	pub delayed: usize,
}

struct Inner {
	jobs: RwLock<HashMap<String, Job>>,
	order: RwLock<VecDeque<String>>,
	remove_on_complete: RwLock<HashMap<String, bool>>,
	backoff: RwLock<HashMap<String, Duration>>,
	processor: RwLock<Option<Arc<dyn Handler>>>,
	concurrency: RwLock<usize>,
	paused: std::sync::atomic::AtomicBool,
	events: broadcast::Sender<JobEvent>,
	stop: tokio::sync::Notify,
	next_id: std::sync::atomic::AtomicU64,
}

/// Named queue. Construct via [`crate::queue::QueueRegistry`] to get deduplication by name.
pub struct JobQueue {
	name: String,
	inner: Arc<Inner>,
}
impl JobQueue {
	/// Build an empty, unnamed-store queue.
	pub fn new(name: impl Into<String>) -> Arc<Self> {
		let (events, _) = broadcast::channel(256);

		Arc::new(Self {
			name: name.into(),
			inner: Arc::new(Inner {
				jobs: RwLock::new(HashMap::new()),
				order: RwLock::new(VecDeque::new()),
				remove_on_complete: RwLock::new(HashMap::new()),
				backoff: RwLock::new(HashMap::new()),
				processor: RwLock::new(None),
				concurrency: RwLock::new(1),
				paused: std::sync::atomic::AtomicBool::new(false),
				events,
				stop: tokio::sync::Notify::new(),
				next_id: std::sync::atomic::AtomicU64::new(1),
			}),
		})
	}

	/// Queue name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Subscribe to lifecycle events.
	pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
		self.inner.events.subscribe()
	}

	/// Enqueue one job.
	pub async fn add(self: &Arc<Self>, data: serde_json::Value, opts: JobOptions) -> Job {
		let id = format!("{}-{}", self.name, self.inner.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst));
		let now = Utc::now();
		let delayed = opts.delay.is_some();
		let job = Job {
			id: id.clone(),
			data,
			attempts: 0,
			max_attempts: opts.attempts,
			status: if delayed { JobStatus::Delayed } else { JobStatus::Waiting },
			created_at: now,
			finished_at: None,
			failed_reason: None,
		};

		self.inner.jobs.write().await.insert(id.clone(), job.clone());
		self.inner.remove_on_complete.write().await.insert(id.clone(), opts.remove_on_complete);
		self.inner.backoff.write().await.insert(id.clone(), opts.backoff_base);

		if let Some(delay) = opts.delay {
			let queue = self.clone();
			let id_clone = id.clone();

			tokio::spawn(async move {
				tokio::time::sleep(delay).await;
				queue.make_waiting(&id_clone).await;
			});
		} else {
			self.make_waiting(&id).await;
		}

		job
	}

	async fn make_waiting(self: &Arc<Self>, id: &str) {
		if let Some(job) = self.inner.jobs.write().await.get_mut(id) {
			job.status = JobStatus::Waiting;
		}

		self.inner.order.write().await.push_back(id.to_string());
		let _ = self.inner.events.send(JobEvent::Waiting(id.to_string()));
		self.dispatch();
	}

	/// Enqueue several jobs at once.
	pub async fn add_bulk(self: &Arc<Self>, items: Vec<(serde_json::Value, JobOptions)>) -> Vec<Job> {
		let mut jobs = Vec::with_capacity(items.len());

		for (data, opts) in items {
			jobs.push(self.add(data, opts).await);
		}

		jobs
	}

	/// Register the handler that processes waiting jobs, with a given concurrency.
	pub async fn set_processor(self: &Arc<Self>, handler: impl Handler + 'static, concurrency: usize) {
		*self.inner.processor.write().await = Some(Arc::new(handler));
		*self.inner.concurrency.write().await = concurrency.max(1);
		self.dispatch();
	}

	fn dispatch(self: &Arc<Self>) {
		let queue = self.clone();

		tokio::spawn(async move {
			queue.drain_once().await;
		});
	}

	async fn drain_once(self: &Arc<Self>) {
		if self.inner.paused.load(std::sync::atomic::Ordering::SeqCst) {
			return;
		}

		let Some(handler) = self.inner.processor.read().await.clone() else { return };
		let concurrency = *self.inner.concurrency.read().await;
		let active = self.count_by(JobStatus::Active).await;
		let slots = concurrency.saturating_sub(active);

		for _ in 0..slots {
			let Some(id) = self.inner.order.write().await.pop_front() else { break };
			let queue = self.clone();
			let handler = handler.clone();

			tokio::spawn(async move {
				queue.run_job(&id, handler).await;
			});
		}
	}

	async fn run_job(self: &Arc<Self>, id: &str, handler: Arc<dyn Handler>) {
		let Some(mut job) = self.inner.jobs.write().await.get(id).cloned() else { return };

		job.status = JobStatus::Active;
		self.inner.jobs.write().await.insert(id.to_string(), job.clone());
		let _ = self.inner.events.send(JobEvent::Active(id.to_string()));

		let result = handler.handle(&job.data).await;

		match result {
			Ok(value) => {
				let mut jobs = self.inner.jobs.write().await;

				if let Some(job) = jobs.get_mut(id) {
					job.status = JobStatus::Completed;
					job.finished_at = Some(Utc::now());
				}

				let remove = self.inner.remove_on_complete.read().await.get(id).copied().unwrap_or(true);

				drop(jobs);

				let _ = self.inner.events.send(JobEvent::Completed(id.to_string(), value));

				if remove {
					self.inner.jobs.write().await.remove(id);
				}
			},
			Err(err) => {
				let backoff = self.inner.backoff.read().await.get(id).copied().unwrap_or(Duration::from_secs(1));
				let should_retry = {
					let mut jobs = self.inner.jobs.write().await;
					let Some(job) = jobs.get_mut(id) else { return };

					job.attempts += 1;

					if job.attempts < job.max_attempts {
						job.status = JobStatus::Waiting;

						true
					} else {
						job.status = JobStatus::Failed;
						job.finished_at = Some(Utc::now());
						job.failed_reason = Some(err.to_string());

						false
					}
				};

				if should_retry {
					let queue = self.clone();
					let id = id.to_string();
					let delay = backoff.saturating_mul(2u32.saturating_pow(self.attempts_of(&id).await.saturating_sub(1)));

					tokio::spawn(async move {
						tokio::time::sleep(delay).await;
						queue.inner.order.write().await.push_back(id.clone());
						let _ = queue.inner.events.send(JobEvent::Waiting(id));
						queue.dispatch();
					});
				} else {
					let _ = self.inner.events.send(JobEvent::Failed(id.to_string(), err.to_string()));
				}
			},
		}

		self.dispatch();
	}

	async fn attempts_of(&self, id: &str) -> u32 {
		self.inner.jobs.read().await.get(id).map(|job| job.attempts).unwrap_or(1)
	}

	async fn count_by(&self, status: JobStatus) -> usize {
		self.inner.jobs.read().await.values().filter(|job| job.status == status).count()
	}

	/// Fetch a job by id.
	pub async fn get_job(&self, id: &str) -> Option<Job> {
		self.inner.jobs.read().await.get(id).cloned()
	}

	/// Remove a job, regardless of its status.
	pub async fn remove(&self, id: &str) -> bool {
		self.inner.jobs.write().await.remove(id).is_some()
	}

	/// Stop dispatching new jobs without disturbing jobs already active.
	pub fn pause(&self) {
		self.inner.paused.store(true, std::sync::atomic::Ordering::SeqCst);
	}

	/// Resume dispatching.
	pub fn resume(self: &Arc<Self>) {
		self.inner.paused.store(false, std::sync::atomic::Ordering::SeqCst);
		self.dispatch();
	}

	/// Current counts per lifecycle state.
	pub async fn status(&self) -> QueueStatus {
		let jobs = self.inner.jobs.read().await;
		let mut status = QueueStatus::default();

		for job in jobs.values() {
			match job.status {
				JobStatus::Waiting => status.waiting += 1,
				JobStatus::Active => status.active += 1,
				JobStatus::Completed => status.completed += 1,
				JobStatus::Failed => status.failed += 1,
				JobStatus::Delayed => status.delayed += 1,
			}
		}

		status
	}

	/// Remove every job from the store.
	pub async fn clear(&self) {
		self.inner.jobs.write().await.clear();
		self.inner.order.write().await.clear();
	}

	/// Pause dispatch and drop all state; the queue instance remains usable but empty.
	pub async fn close(&self) {
		self.pause();
		self.inner.stop.notify_waiters();
		self.clear().await;
	}
}
