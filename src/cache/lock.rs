//! Distributed advisory lock (C6) backed by [`KvStore::set_if_absent`].

// self
use super::key::lock_key;
use crate::{_prelude::*, kv::KvStore};

/// Default lock TTL: the sole safety net against a holder dying mid-critical-section.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Thin wrapper over a [`KvStore`] implementing cache-key locking.
///
/// No fencing token is issued; callers must tolerate spurious contention and
/// either back off or fall through, matching the crate's general policy of
/// preferring a bounded retry loop over stronger coordination primitives.
pub struct CacheLock {
	store: Arc<dyn KvStore>,
}
impl CacheLock {
	/// Wrap a store for lock use.
	pub fn new(store: Arc<dyn KvStore>) -> Self {
		Self { store }
	}

	/// Attempt to acquire the lock guarding `key`. Returns whether this call won it.
	pub async fn acquire(&self, key: &str) -> Result<bool> {
		self.acquire_with_ttl(key, DEFAULT_TTL).await
	}

	/// Attempt to acquire the lock guarding `key` with a custom TTL.
	pub async fn acquire_with_ttl(&self, key: &str, ttl: Duration) -> Result<bool> {
		let lock = lock_key(key);
		let acquired = self.store.set_if_absent(&lock, "1", ttl).await?;

		#[cfg(feature = "metrics")]
		crate::telemetry::record_lock_attempt(key, !acquired);

		Ok(acquired)
	}

	/// Release the lock guarding `key`, unconditionally.
	pub async fn release(&self, key: &str) -> Result<()> {
		self.store.del(&lock_key(key)).await?;

		Ok(())
	}
}
