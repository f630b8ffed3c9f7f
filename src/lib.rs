//! Operational substrate for long-running services: metrics, health checks,
//! alerting, self-tuning optimization, stampede-protected caching, and
//! durable job queues with a dead-letter lane.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod alert;
pub mod cache;
pub mod health;
pub mod kv;
pub mod metrics;
pub mod monitoring;
pub mod optimize;
pub mod pipeline;
pub mod queue;
#[cfg(feature = "metrics")] pub mod telemetry;

mod error;
mod _prelude {
	pub use std::{
		future::Future,
		sync::Arc,
		time::Duration,
	};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}
#[cfg(feature = "prometheus")] pub use crate::telemetry::install_default_exporter;
pub use crate::error::{Error, Result};

#[cfg(test)]
mod _test {
	use metrics_util as _;
	use tracing_subscriber as _;
	use wiremock as _;
}
