//! Structured cache key construction.

/// Default key prefix when none is supplied.
pub const DEFAULT_PREFIX: &str = "rdp";
/// Default version segment when none is supplied.
pub const DEFAULT_VERSION: &str = "v1";

/// Build a structured cache key: `"{prefix}:{entity}:{operation}:{identifier}:{version}"`.
pub fn cache_key(entity: &str, operation: &str, identifier: &str) -> String {
	build(DEFAULT_PREFIX, entity, operation, identifier, DEFAULT_VERSION)
}

/// Build a structured cache key with an explicit prefix and version.
pub fn cache_key_with(
	prefix: &str,
	entity: &str,
	operation: &str,
	identifier: &str,
	version: &str,
) -> String {
	build(prefix, entity, operation, identifier, version)
}

/// Build the lock key guarding a cache key.
pub fn lock_key(cache_key: &str) -> String {
	format!("lock:{cache_key}")
}

fn build(prefix: &str, entity: &str, operation: &str, identifier: &str, version: &str) -> String {
	format!("{prefix}:{entity}:{operation}:{identifier}:{version}")
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn default_key_uses_rdp_prefix_and_v1_version() {
		assert_eq!(cache_key("user", "profile", "42"), "rdp:user:profile:42:v1");
	}

	#[test]
	fn lock_key_wraps_cache_key() {
		let key = cache_key("user", "profile", "42");

		assert_eq!(lock_key(&key), "lock:rdp:user:profile:42:v1");
	}

	#[test]
	fn custom_prefix_and_version_are_honoured() {
		assert_eq!(
			cache_key_with("app", "order", "detail", "7", "v2"),
			"app:order:detail:7:v2"
		);
	}
}
