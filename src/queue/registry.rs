//! Top-level registry deduplicating [`JobQueue`]s by name.

// std
use std::collections::HashMap;
// crates.io
use tokio::sync::RwLock;
// self
use super::job::JobQueue;
use crate::_prelude::*;

/// Hands out a single shared [`JobQueue`] per name.
pub struct QueueRegistry {
	queues: RwLock<HashMap<String, Arc<JobQueue>>>,
}
impl QueueRegistry {
	/// Build an empty registry.
	pub fn new() -> Arc<Self> {
		Arc::new(Self { queues: RwLock::new(HashMap::new()) })
	}

	/// Return the queue named `name`, creating it if this is the first reference.
	pub async fn get_or_create(&self, name: &str) -> Arc<JobQueue> {
		if let Some(queue) = self.queues.read().await.get(name) {
			return queue.clone();
		}

		let mut queues = self.queues.write().await;

		queues.entry(name.to_string()).or_insert_with(|| JobQueue::new(name)).clone()
	}

	/// Currently registered queue names.
	pub async fn names(&self) -> Vec<String> {
		self.queues.read().await.keys().cloned().collect()
	}

	/// Remove a queue from the registry entirely.
	pub async fn remove(&self, name: &str) -> Option<Arc<JobQueue>> {
		self.queues.write().await.remove(name)
	}
}
impl Default for QueueRegistry {
	fn default() -> Self {
		unreachable!("use QueueRegistry::new(), which returns an Arc")
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn get_or_create_deduplicates_by_name() {
		let registry = QueueRegistry::new();

		let a = registry.get_or_create("emails").await;
		let b = registry.get_or_create("emails").await;

		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(registry.names().await, vec!["emails".to_string()]);
	}
}
