//! End-to-end coverage of the monitoring façade: health feeds alerts, and the
//! HTTP interceptor feeds metrics, without any module having to know about
//! the others directly.

// std
use std::time::Duration;
// crates.io
use opstack::{
	alert::Severity,
	health::{CheckOutcome, Status as HealthStatus},
	monitoring::Monitoring,
};

#[tokio::test]
async fn unhealthy_dependency_raises_a_composite_alert() {
	let monitoring = Monitoring::new().await;

	monitoring
		.register_database("primary_db", || async { CheckOutcome::unhealthy("connection refused") })
		.await;
	monitoring.health.check_all().await;
	monitoring
		.alerts
		.add_health_check_rule(monitoring.health.clone(), Duration::from_millis(20));

	tokio::time::sleep(Duration::from_millis(80)).await;

	let overall = monitoring.health.overall().await;

	assert_eq!(overall, HealthStatus::Unhealthy);

	let active = monitoring.alerts.active().await;

	assert!(active.iter().any(|alert| alert.name == "health_check_primary_db"));
	assert!(active.iter().any(|alert| alert.name == "system_health"));
	assert!(active.iter().all(|alert| alert.severity >= Severity::Warning));

	monitoring.shutdown().await;
}

#[tokio::test]
async fn request_interceptor_drives_error_rate_metric() {
	let monitoring = Monitoring::new().await;

	let ok_ctx = monitoring.http_interceptor_start("GET", "/healthz").await;

	monitoring.http_interceptor_finish(ok_ctx, 200).await;

	let err_ctx = monitoring.http_interceptor_start("POST", "/widgets").await;

	monitoring.http_interceptor_finish(err_ctx, 503).await;

	let total_ok = monitoring
		.metrics
		.get("requests_total", &[("method", "GET"), ("route", "/healthz"), ("status", "pending")])
		.await;
	let errors = monitoring
		.metrics
		.get("requests_errors_total", &[("method", "POST"), ("route", "/widgets"), ("status", "503")])
		.await;

	assert_eq!(total_ok, Some(1.0));
	assert_eq!(errors, Some(1.0));

	let exposition = monitoring.text_exposition().await;

	assert!(exposition.contains("app_requests_total"));

	monitoring.shutdown().await;
}
