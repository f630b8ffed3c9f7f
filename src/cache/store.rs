//! Stampede-protected cache (C7): JSON-encoded values over a [`KvStore`], with
//! `getOrCompute` providing single-flight protection for missing keys.

// std
use std::future::Future;
// crates.io
use serde::{de::DeserializeOwned, Serialize};
// self
use super::{key::cache_key, lock::CacheLock};
use crate::{_prelude::*, kv::KvStore};

/// Default TTL applied by [`Cache::get_or_compute`] when none is supplied.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

const RETRY_SLEEP: Duration = Duration::from_millis(100);

/// High-level cache operating on structured keys and JSON-encoded values.
pub struct Cache {
	store: Arc<dyn KvStore>,
	lock: CacheLock,
}
impl Cache {
	/// Wrap a [`KvStore`] for structured, stampede-protected access.
	pub fn new(store: Arc<dyn KvStore>) -> Self {
		let lock = CacheLock::new(store.clone());

		Self { store, lock }
	}

	/// Fetch and decode a value by structured key.
	pub async fn get<T: DeserializeOwned>(&self, entity: &str, operation: &str, identifier: &str) -> Result<Option<T>> {
		let key = cache_key(entity, operation, identifier);

		self.get_raw(&key).await
	}

	/// Encode and store a value by structured key.
	pub async fn set<T: Serialize>(
		&self,
		entity: &str,
		operation: &str,
		identifier: &str,
		value: &T,
		ttl: Duration,
	) -> Result<()> {
		let key = cache_key(entity, operation, identifier);

		self.set_raw(&key, value, Some(ttl)).await
	}

	/// Remove a value by structured key.
	pub async fn del(&self, entity: &str, operation: &str, identifier: &str) -> Result<bool> {
		self.store.del(&cache_key(entity, operation, identifier)).await
	}

	/// Check for presence by structured key.
	pub async fn exists(&self, entity: &str, operation: &str, identifier: &str) -> Result<bool> {
		self.store.exists(&cache_key(entity, operation, identifier)).await
	}

	/// Remaining TTL by structured key.
	pub async fn ttl(&self, entity: &str, operation: &str, identifier: &str) -> Result<Option<Duration>> {
		self.store.ttl(&cache_key(entity, operation, identifier)).await
	}

	/// Fetch and decode several structured keys at once.
	pub async fn mget<T: DeserializeOwned>(
		&self,
		keys: &[(&str, &str, &str)],
	) -> Result<Vec<Option<T>>> {
		let mut out = Vec::with_capacity(keys.len());

		for (entity, operation, identifier) in keys {
			out.push(self.get(entity, operation, identifier).await?);
		}

		Ok(out)
	}

	/// Return the cached value for `(entity, operation, identifier)`, computing and storing it
	/// via `fallback` on a miss with single-flight protection against concurrent stampedes.
	///
	/// Under concurrent demand for the same missing key, `fallback` runs at most once per
	/// lock-holder epoch: losers of the lock race sleep and retry rather than recompute.
	pub async fn get_or_compute<T, F, Fut>(
		&self,
		entity: &str,
		operation: &str,
		identifier: &str,
		fallback: F,
		ttl: Duration,
	) -> Result<T>
	where
		T: Serialize + DeserializeOwned,
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let key = cache_key(entity, operation, identifier);

		loop {
			if let Some(value) = self.get_raw(&key).await? {
				return Ok(value);
			}

			if !self.lock.acquire(&key).await? {
				tokio::time::sleep(RETRY_SLEEP).await;

				continue;
			}

			let result = self.fill_locked(&key, &fallback, ttl).await;

			self.lock.release(&key).await?;

			return result;
		}
	}

	async fn fill_locked<T, F, Fut>(&self, key: &str, fallback: &F, ttl: Duration) -> Result<T>
	where
		T: Serialize + DeserializeOwned,
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		if let Some(value) = self.get_raw(key).await? {
			return Ok(value);
		}

		let value = fallback().await?;

		self.set_raw(key, &value, Some(ttl)).await?;

		Ok(value)
	}

	async fn get_raw<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
		match self.store.get(key).await? {
			Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
			None => Ok(None),
		}
	}

	async fn set_raw<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
		let raw = serde_json::to_string(value)?;

		self.store.set(key, raw, ttl).await
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use super::*;
	use crate::kv::MemoryStore;

	#[tokio::test]
	async fn miss_then_hit_round_trips_json() {
		let cache = Cache::new(Arc::new(MemoryStore::new()));

		cache.set("user", "profile", "1", &"alice".to_string(), Duration::from_secs(60)).await.unwrap();

		let value: Option<String> = cache.get("user", "profile", "1").await.unwrap();

		assert_eq!(value.as_deref(), Some("alice"));
	}

	#[tokio::test]
	async fn get_or_compute_calls_fallback_once_per_key() {
		let cache = Cache::new(Arc::new(MemoryStore::new()));
		let calls = Arc::new(AtomicUsize::new(0));
		let calls_clone = calls.clone();

		let value: String = cache
			.get_or_compute("user", "profile", "1", || {
				let calls = calls_clone.clone();

				async move {
					calls.fetch_add(1, Ordering::SeqCst);

					Ok("computed".to_string())
				}
			}, Duration::from_secs(60))
			.await
			.unwrap();

		assert_eq!(value, "computed");
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		let second: String = cache
			.get_or_compute("user", "profile", "1", || {
				let calls = calls.clone();

				async move {
					calls.fetch_add(1, Ordering::SeqCst);

					Ok("computed-again".to_string())
				}
			}, Duration::from_secs(60))
			.await
			.unwrap();

		assert_eq!(second, "computed");
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn concurrent_misses_compute_fallback_at_most_once() {
		let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new())));
		let calls = Arc::new(AtomicUsize::new(0));
		let mut handles = Vec::new();

		for _ in 0..8 {
			let cache = cache.clone();
			let calls = calls.clone();

			handles.push(tokio::spawn(async move {
				cache
					.get_or_compute::<String, _, _>("user", "profile", "stampede", move || {
						let calls = calls.clone();

						async move {
							calls.fetch_add(1, Ordering::SeqCst);
							tokio::time::sleep(Duration::from_millis(20)).await;

							Ok("value".to_string())
						}
					}, Duration::from_secs(60))
					.await
					.unwrap()
			}));
		}

		for handle in handles {
			assert_eq!(handle.await.unwrap(), "value");
		}

		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
