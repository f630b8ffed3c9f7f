//! Notifier fan-out: delivers alert events to registered sinks with per-sink filters.

// crates.io
use async_trait::async_trait;
// self
use super::{Alert, Severity};
use crate::_prelude::*;

/// One delivery attempt recorded against an [`Alert`].
#[derive(Clone, Debug)]
pub struct DeliveryRecord {
	/// Notifier name that attempted delivery.
	pub notifier: String,
	/// Wall-clock time of the attempt.
	pub at: DateTime<Utc>,
	/// Whether delivery succeeded.
	pub success: bool,
	/// Error message when delivery failed.
	pub error: Option<String>,
}

/// A registered alert sink.
///
/// `notify` failures are contained by the caller: one sink's error never
/// blocks delivery to its siblings or the raise itself.
#[async_trait]
pub trait Notifier: Send + Sync {
	/// Stable name used in delivery logs.
	fn name(&self) -> &str;

	/// Whether this sink wants to receive the given alert. Defaults to always.
	fn filter(&self, _alert: &Alert) -> bool {
		true
	}

	/// Attempt delivery.
	async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Built-in notifier that logs via `tracing`, mapping severity to log level.
pub struct LoggerNotifier;
#[async_trait]
impl Notifier for LoggerNotifier {
	fn name(&self) -> &str {
		"logger"
	}

	async fn notify(&self, alert: &Alert) -> Result<()> {
		match alert.severity {
			Severity::Info => tracing::info!(alert = %alert.name, "{}", alert.message),
			Severity::Warning => tracing::warn!(alert = %alert.name, "{}", alert.message),
			Severity::Error | Severity::Critical =>
				tracing::error!(alert = %alert.name, "{}", alert.message),
		}

		Ok(())
	}
}

/// Notifier stub for email delivery; filters to error/critical by default.
///
/// A real SMTP transport is out of scope; this models the registration and
/// filtering contract so embedding applications can swap in their own sender.
pub struct EmailNotifier<F> {
	send: F,
}
impl<F> EmailNotifier<F>
where
	F: Fn(&Alert) -> Result<()> + Send + Sync,
{
	/// Wrap a synchronous send function.
	pub fn new(send: F) -> Self {
		Self { send }
	}
}
#[async_trait]
impl<F> Notifier for EmailNotifier<F>
where
	F: Fn(&Alert) -> Result<()> + Send + Sync,
{
	fn name(&self) -> &str {
		"email"
	}

	fn filter(&self, alert: &Alert) -> bool {
		matches!(alert.severity, Severity::Error | Severity::Critical)
	}

	async fn notify(&self, alert: &Alert) -> Result<()> {
		(self.send)(alert)
	}
}

/// Notifier stub for chat-webhook delivery; filters to warning-and-above by default.
pub struct WebhookNotifier<F> {
	send: F,
}
impl<F> WebhookNotifier<F>
where
	F: Fn(&Alert) -> Result<()> + Send + Sync,
{
	/// Wrap a synchronous send function.
	pub fn new(send: F) -> Self {
		Self { send }
	}
}
#[async_trait]
impl<F> Notifier for WebhookNotifier<F>
where
	F: Fn(&Alert) -> Result<()> + Send + Sync,
{
	fn name(&self) -> &str {
		"webhook"
	}

	fn filter(&self, alert: &Alert) -> bool {
		!matches!(alert.severity, Severity::Info)
	}

	async fn notify(&self, alert: &Alert) -> Result<()> {
		(self.send)(alert)
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::alert::Status;

	fn sample_alert(severity: Severity) -> Alert {
		Alert {
			id: "a1".into(),
			name: "disk_full".into(),
			message: "disk at 95%".into(),
			severity,
			labels: vec![],
			status: Status::Active,
			created_at: Utc::now(),
			last_updated: Utc::now(),
			acknowledged_at: None,
			resolved_at: None,
			data: None,
			deliveries: vec![],
		}
	}

	#[tokio::test]
	async fn email_notifier_filters_below_error() {
		let notifier = EmailNotifier::new(|_| Ok(()));

		assert!(!notifier.filter(&sample_alert(Severity::Warning)));
		assert!(notifier.filter(&sample_alert(Severity::Critical)));
	}

	#[tokio::test]
	async fn logger_notifier_never_fails() {
		let notifier = LoggerNotifier;

		assert!(notifier.notify(&sample_alert(Severity::Info)).await.is_ok());
	}
}
