//! End-to-end coverage spanning the stampede-protected cache, a job queue,
//! and the dead-letter lane's retry path back onto that same queue.

// std
use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};
// crates.io
use opstack::{
	cache::Cache,
	kv::MemoryStore,
	queue::{DeadLetterQueue, JobOptions, JobStatus, QueueRegistry},
	Error,
};

#[tokio::test]
async fn cache_fallback_runs_once_and_serves_from_store_after() {
	let cache = Cache::new(Arc::new(MemoryStore::new()));
	let calls = Arc::new(AtomicUsize::new(0));

	let first = cache
		.get_or_compute("tenants", "lookup", "acme", {
			let calls = calls.clone();

			move || {
				let calls = calls.clone();

				async move {
					calls.fetch_add(1, Ordering::SeqCst);

					Ok(serde_json::json!({ "plan": "enterprise" }))
				}
			}
		}, Duration::from_secs(60))
		.await
		.unwrap();
	let second = cache
		.get_or_compute::<serde_json::Value, _, _>("tenants", "lookup", "acme", || async {
			panic!("fallback should not run on a cache hit")
		}, Duration::from_secs(60))
		.await
		.unwrap();

	assert_eq!(first, second);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_job_lands_in_dlq_and_retry_reenqueues_it() {
	let registry = QueueRegistry::new();
	let dlq = DeadLetterQueue::new(registry.clone());
	let attempts = Arc::new(AtomicUsize::new(0));

	let emails = registry.get_or_create("emails").await;

	emails
		.set_processor(
			{
				let attempts = attempts.clone();

				move |_data: &serde_json::Value| {
					let attempts = attempts.clone();

					async move {
						attempts.fetch_add(1, Ordering::SeqCst);

						Err(Error::Transient("smtp unavailable".into()))
					}
				}
			},
			1,
		)
		.await;

	let mut opts = JobOptions::default();

	opts.attempts = 1;
	opts.backoff_base = Duration::from_millis(5);

	let job = emails.add(serde_json::json!({ "to": "a@example.com" }), opts).await;

	tokio::time::sleep(Duration::from_millis(60)).await;

	let failed = emails.get_job(&job.id).await.unwrap();

	assert_eq!(failed.status, JobStatus::Failed);

	let dlq_id = dlq
		.add_failed_message(&job.id, "emails", serde_json::json!({ "to": "a@example.com" }), &Error::Transient("smtp unavailable".into()), failed.attempts)
		.await;

	emails.pause();
	dlq.retry_message(&dlq_id).await.unwrap();

	let status = emails.status().await;

	assert_eq!(status.waiting, 1);

	let record = dlq.get(&dlq_id).await.unwrap();

	assert_eq!(record.meta.retry_count, 1);
}
