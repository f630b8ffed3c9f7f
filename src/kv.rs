//! Minimal key-value store abstraction shared by the cache and queue layers.
//!
//! The crate never assumes a specific wire client. [`KvStore`] models the two
//! primitives every backing store used here actually needs: atomic
//! set-if-absent with a TTL (for locks) and plain get/set/del (for cached
//! values and queue bookkeeping). [`MemoryStore`] is a reference
//! implementation good enough for tests and single-process deployments; the
//! optional `redis` feature adds [`RedisStore`] for a real deployment target.

// std
use std::collections::HashMap;
// crates.io
use async_trait::async_trait;
use tokio::sync::Mutex;
// self
use crate::_prelude::*;

/// Storage contract used by the cache and queue components.
#[async_trait]
pub trait KvStore: Send + Sync {
	/// Fetch a raw value.
	async fn get(&self, key: &str) -> Result<Option<String>>;

	/// Store a raw value with an optional TTL.
	async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

	/// Remove a value; returns whether anything was removed.
	async fn del(&self, key: &str) -> Result<bool>;

	/// Check for the presence of a key without fetching its value.
	async fn exists(&self, key: &str) -> Result<bool>;

	/// Remaining time-to-live for `key`, or `None` if absent or set without expiry.
	async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

	/// Atomically create `key` with `value` only if absent, bounding its lifetime by `ttl`.
	///
	/// Returns `true` when this call won the race and created the key.
	async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
}

/// In-process reference [`KvStore`] backed by a single mutex-guarded map.
///
/// Expiry is checked lazily on access rather than via a background sweeper,
/// matching the teacher's preference for narrow, on-demand locking over a
/// standing cleanup task.
#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: Mutex<HashMap<String, Entry>>,
}
impl MemoryStore {
	/// Build an empty store.
	pub fn new() -> Self {
		Self::default()
	}
}
#[async_trait]
impl KvStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		let mut entries = self.entries.lock().await;

		Ok(live_value(&mut entries, key))
	}

	async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
		let deadline = ttl.map(|ttl| Instant::now() + ttl);

		self.entries.lock().await.insert(key.to_owned(), Entry { value, deadline });

		Ok(())
	}

	async fn del(&self, key: &str) -> Result<bool> {
		Ok(self.entries.lock().await.remove(key).is_some())
	}

	async fn exists(&self, key: &str) -> Result<bool> {
		let mut entries = self.entries.lock().await;

		Ok(live_value(&mut entries, key).is_some())
	}

	async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
		let mut entries = self.entries.lock().await;

		if live_value(&mut entries, key).is_none() {
			return Ok(None);
		}

		Ok(entries.get(key).and_then(|entry| entry.deadline).map(|deadline| {
			deadline.saturating_duration_since(Instant::now())
		}))
	}

	async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
		let mut entries = self.entries.lock().await;

		if live_value(&mut entries, key).is_some() {
			return Ok(false);
		}

		entries
			.insert(key.to_owned(), Entry { value: value.to_owned(), deadline: Some(Instant::now() + ttl) });

		Ok(true)
	}
}

#[derive(Clone, Debug)]
struct Entry {
	value: String,
	deadline: Option<Instant>,
}

fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
	match entries.get(key) {
		Some(entry) if entry.deadline.is_some_and(|deadline| Instant::now() >= deadline) => {
			entries.remove(key);

			None
		},
		Some(entry) => Some(entry.value.clone()),
		None => None,
	}
}

#[cfg(feature = "redis")]
mod redis_store {
	// crates.io
	use redis::AsyncCommands;
	// self
	use super::*;

	/// [`KvStore`] backed by a real Redis deployment.
	#[derive(Clone)]
	pub struct RedisStore {
		client: redis::Client,
	}
	impl RedisStore {
		/// Wrap an existing Redis client.
		pub fn new(client: redis::Client) -> Self {
			Self { client }
		}

		async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
			Ok(self.client.get_multiplexed_async_connection().await?)
		}
	}
	#[async_trait]
	impl KvStore for RedisStore {
		async fn get(&self, key: &str) -> Result<Option<String>> {
			Ok(self.connection().await?.get(key).await?)
		}

		async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
			let mut conn = self.connection().await?;

			match ttl {
				Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?,
				None => conn.set::<_, _, ()>(key, value).await?,
			}

			Ok(())
		}

		async fn del(&self, key: &str) -> Result<bool> {
			let removed: i64 = self.connection().await?.del(key).await?;

			Ok(removed > 0)
		}

		async fn exists(&self, key: &str) -> Result<bool> {
			Ok(self.connection().await?.exists(key).await?)
		}

		async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
			let seconds: i64 = self.connection().await?.ttl(key).await?;

			Ok(if seconds > 0 { Some(Duration::from_secs(seconds as u64)) } else { None })
		}

		async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
			let opts = redis::SetOptions::default()
				.conditional_set(redis::ExistenceCheck::NX)
				.with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1) as usize));
			let result: Option<String> =
				self.connection().await?.set_options(key, value, opts).await?;

			Ok(result.is_some())
		}
	}
}
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn set_get_del_round_trip() {
		let store = MemoryStore::new();

		store.set("k", "v".into(), None).await.unwrap();
		assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
		assert!(store.del("k").await.unwrap());
		assert!(!store.exists("k").await.unwrap());
	}

	#[tokio::test]
	async fn set_if_absent_only_wins_once() {
		let store = MemoryStore::new();

		assert!(store.set_if_absent("lock:a", "1", Duration::from_secs(5)).await.unwrap());
		assert!(!store.set_if_absent("lock:a", "2", Duration::from_secs(5)).await.unwrap());
	}

	#[tokio::test]
	async fn ttl_reflects_remaining_lifetime() {
		let store = MemoryStore::new();

		store.set("k", "v".into(), Some(Duration::from_secs(5))).await.unwrap();

		let remaining = store.ttl("k").await.unwrap();

		assert!(remaining.is_some_and(|d| d <= Duration::from_secs(5)));
		assert_eq!(store.ttl("missing").await.unwrap(), None);
	}

	#[tokio::test]
	async fn expired_entry_is_treated_as_absent() {
		let store = MemoryStore::new();

		store.set("k", "v".into(), Some(Duration::from_millis(10))).await.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;

		assert_eq!(store.get("k").await.unwrap(), None);
	}
}
