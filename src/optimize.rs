//! Self-tuning optimization loop: one global `analyze -> optimize -> verify` cycle running
//! across every applicable registered optimizer, single-flight.

// std
use std::collections::HashMap;
// crates.io
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
// self
use crate::_prelude::*;

/// Phase the whole loop is currently in. One cycle runs for every applicable optimizer at once;
/// there is no per-optimizer phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
	/// Waiting for the next scheduled cycle.
	Idle,
	/// Gathering evidence that a change is warranted, across every applicable optimizer.
	Analyzing,
	/// Applying changes for the optimizers whose analysis called for one.
	Optimizing,
	/// Confirming the applied changes improved things, after each optimizer's settle delay.
	Verifying,
}

/// Default settle delay for a database-tuning optimizer.
pub const DATABASE_SETTLE_DELAY: Duration = Duration::from_secs(10);
/// Default settle delay for a cache-tuning optimizer.
pub const CACHE_SETTLE_DELAY: Duration = Duration::from_secs(10);
/// Default settle delay for a queue-tuning optimizer.
pub const QUEUE_SETTLE_DELAY: Duration = Duration::from_secs(15);

/// Evidence produced by [`Optimizer::analyze`].
pub struct Analysis {
	/// Whether optimization should proceed this cycle.
	pub should_optimize: bool,
	/// Human-readable rationale, surfaced in [`OptimizerReport`].
	pub reason: String,
	/// Arbitrary structured evidence carried into `optimize`.
	pub data: Option<serde_json::Value>,
}
impl Analysis {
	/// No action needed this cycle.
	pub fn skip(reason: impl Into<String>) -> Self {
		Self { should_optimize: false, reason: reason.into(), data: None }
	}

	/// Proceed to optimize this cycle.
	pub fn proceed(reason: impl Into<String>, data: Option<serde_json::Value>) -> Self {
		Self { should_optimize: true, reason: reason.into(), data }
	}
}

/// Outcome of [`Optimizer::verify`] confirming whether the change should stick.
pub struct Verification {
	/// Whether the applied change is an improvement worth keeping.
	pub improved: bool,
	/// Human-readable rationale.
	pub reason: String,
}
impl Verification {
	/// The change improved the measured condition.
	pub fn improved(reason: impl Into<String>) -> Self {
		Self { improved: true, reason: reason.into() }
	}

	/// The change did not help, or made things worse.
	pub fn regressed(reason: impl Into<String>) -> Self {
		Self { improved: false, reason: reason.into() }
	}
}

/// A pluggable tuning strategy evaluated on each cycle of an [`OptimizationLoop`].
#[async_trait]
pub trait Optimizer: Send + Sync {
	/// Stable name used in reports and metrics.
	fn name(&self) -> &str;

	/// Whether this optimizer should be considered this cycle. Defaults to always applicable.
	async fn is_applicable(&self) -> bool {
		true
	}

	/// Decide whether a change is warranted this cycle.
	async fn analyze(&self) -> Analysis;

	/// Apply a change informed by the analysis data.
	async fn optimize(&self, data: Option<&serde_json::Value>) -> Result<()>;

	/// Confirm whether the applied change improved the measured condition.
	async fn verify(&self) -> Verification;

	/// Undo the most recent change. Called when [`Optimizer::verify`] reports a regression.
	async fn rollback(&self) -> Result<()> {
		Ok(())
	}
}

/// Record of one completed analyze/optimize/verify cycle for a single optimizer.
#[derive(Clone, Debug)]
pub struct OptimizerReport {
	/// Optimizer that produced this report.
	pub optimizer: String,
	/// Whether a change was applied this cycle.
	pub optimized: bool,
	/// Whether the change (if any) was kept.
	pub kept: bool,
	/// Rationale from whichever stage produced the final verdict.
	pub reason: String,
	/// When the cycle finished.
	pub at: DateTime<Utc>,
}

struct Entry {
	optimizer: Arc<dyn Optimizer>,
	settle_delay: Duration,
}

/// Shared evidence gathered by one `analyze` pass across every applicable optimizer.
struct Benchmark {
	at: DateTime<Utc>,
	analysis: HashMap<String, Analysis>,
}

/// Owns every registered [`Optimizer`] and drives one global, single-flight
/// `Idle -> Analyzing -> (Optimizing -> Verifying)? -> Idle` cycle across all of them.
pub struct OptimizationLoop {
	entries: RwLock<HashMap<String, Entry>>,
	reports: RwLock<HashMap<String, Vec<OptimizerReport>>>,
	max_reports: usize,
	phase: RwLock<Phase>,
	benchmark: RwLock<Option<Benchmark>>,
	automatic: RwLock<bool>,
	timer_started: RwLock<bool>,
	stop: Arc<tokio::sync::Notify>,
}
impl OptimizationLoop {
	/// Build an empty loop, retaining the last 100 reports per optimizer.
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			entries: RwLock::new(HashMap::new()),
			reports: RwLock::new(HashMap::new()),
			max_reports: 100,
			phase: RwLock::new(Phase::Idle),
			benchmark: RwLock::new(None),
			automatic: RwLock::new(false),
			timer_started: RwLock::new(false),
			stop: Arc::new(tokio::sync::Notify::new()),
		})
	}

	/// Register an optimizer, with the settle delay [`Optimizer::verify`] should be given after
	/// [`Optimizer::optimize`] before this loop calls it. Use [`DATABASE_SETTLE_DELAY`],
	/// [`CACHE_SETTLE_DELAY`], [`QUEUE_SETTLE_DELAY`], or a custom duration.
	pub async fn register(&self, optimizer: Arc<dyn Optimizer>, settle_delay: Duration) {
		let name = optimizer.name().to_string();

		self.entries.write().await.insert(name.clone(), Entry { optimizer, settle_delay });
		self.reports.write().await.entry(name).or_default();
	}

	/// Begin automatic analysis on `interval`. Starts the shared timer on first call; later
	/// calls just flip the flag the timer checks each tick, so re-enabling after
	/// [`OptimizationLoop::disable_automatic`] does not spawn a second timer.
	pub async fn enable_automatic(self: &Arc<Self>, interval: Duration) {
		*self.automatic.write().await = true;

		let mut started = self.timer_started.write().await;

		if *started {
			return;
		}

		*started = true;

		let loop_ref = self.clone();
		let stop = self.stop.clone();

		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);

			loop {
				tokio::select! {
					_ = ticker.tick() => {
						if *loop_ref.automatic.read().await {
							let _ = loop_ref.run_cycle().await;
						}
					},
					_ = stop.notified() => break,
				}
			}
		});
	}

	/// Stop automatic analysis. The shared timer keeps ticking but skips running a cycle.
	pub async fn disable_automatic(&self) {
		*self.automatic.write().await = false;
	}

	/// Run one global cycle: analyze every applicable optimizer into a shared benchmark, batch
	/// `optimize` over whichever ones called for a change, then verify each after its settle
	/// delay. Rejected with [`Error::Transient`] if a cycle is already in flight.
	pub async fn run_cycle(&self) -> Result<Vec<OptimizerReport>> {
		self.begin_cycle().await?;

		let entries: Vec<(String, Arc<dyn Optimizer>, Duration)> = {
			let entries = self.entries.read().await;

			entries
				.iter()
				.map(|(name, entry)| (name.clone(), entry.optimizer.clone(), entry.settle_delay))
				.collect()
		};

		let mut analysis = HashMap::new();
		let mut to_optimize = Vec::new();

		for (name, optimizer, _) in &entries {
			if !optimizer.is_applicable().await {
				continue;
			}

			let outcome = optimizer.analyze().await;

			if outcome.should_optimize {
				to_optimize.push(name.clone());
			}

			analysis.insert(name.clone(), outcome);
		}

		*self.benchmark.write().await = Some(Benchmark { at: Utc::now(), analysis });

		if to_optimize.is_empty() {
			*self.phase.write().await = Phase::Idle;

			return Ok(Vec::new());
		}

		self.set_phase(Phase::Optimizing).await;

		let mut optimized = Vec::new();
		let mut reports = Vec::new();

		{
			let benchmark = self.benchmark.read().await;
			let analysis = &benchmark.as_ref().expect("just populated above").analysis;

			for (name, optimizer, _) in &entries {
				if !to_optimize.contains(name) {
					continue;
				}

				let data = analysis.get(name).and_then(|a| a.data.as_ref());

				match optimizer.optimize(data).await {
					Ok(()) => optimized.push(name.clone()),
					Err(err) => reports.push(OptimizerReport {
						optimizer: name.clone(),
						optimized: false,
						kept: false,
						reason: format!("optimize failed: {err}"),
						at: Utc::now(),
					}),
				}
			}
		}

		self.set_phase(Phase::Verifying).await;

		for (name, optimizer, settle_delay) in &entries {
			if !optimized.contains(name) {
				continue;
			}

			tokio::time::sleep(*settle_delay).await;

			let verification = optimizer.verify().await;

			if !verification.improved {
				let _ = optimizer.rollback().await;
			}

			#[cfg(feature = "metrics")]
			crate::telemetry::record_optimizer_cycle(name, verification.improved);

			reports.push(OptimizerReport {
				optimizer: name.clone(),
				optimized: true,
				kept: verification.improved,
				reason: verification.reason,
				at: Utc::now(),
			});
		}

		for report in &reports {
			self.push_report(&report.optimizer, report.clone()).await;
		}

		*self.phase.write().await = Phase::Idle;

		Ok(reports)
	}

	/// Most recent reports for `name`, newest first.
	pub async fn reports(&self, name: &str) -> Vec<OptimizerReport> {
		self.reports.read().await.get(name).cloned().unwrap_or_default()
	}

	/// Current global phase.
	pub async fn phase(&self) -> Phase {
		*self.phase.read().await
	}

	/// Every registered optimizer's name.
	pub async fn names(&self) -> Vec<String> {
		self.entries.read().await.keys().cloned().collect()
	}

	/// Stop the automatic-analysis timer for good.
	pub async fn shutdown(&self) {
		self.stop.notify_waiters();
	}

	async fn begin_cycle(&self) -> Result<()> {
		let mut phase = self.phase.write().await;

		if *phase != Phase::Idle {
			return Err(Error::Transient("an optimization cycle is already in progress".into()));
		}

		*phase = Phase::Analyzing;

		Ok(())
	}

	async fn set_phase(&self, phase: Phase) {
		*self.phase.write().await = phase;
	}

	async fn push_report(&self, name: &str, report: OptimizerReport) {
		let mut reports = self.reports.write().await;
		let entries = reports.entry(name.to_string()).or_default();

		entries.insert(0, report);
		entries.truncate(self.max_reports);
	}
}
impl Default for OptimizationLoop {
	fn default() -> Self {
		unreachable!("use OptimizationLoop::new(), which returns an Arc")
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use super::*;

	struct CountingOptimizer {
		calls: AtomicUsize,
		keep: bool,
	}
	#[async_trait]
	impl Optimizer for CountingOptimizer {
		fn name(&self) -> &str {
			"counter"
		}

		async fn analyze(&self) -> Analysis {
			Analysis::proceed("always", None)
		}

		async fn optimize(&self, _data: Option<&serde_json::Value>) -> Result<()> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			Ok(())
		}

		async fn verify(&self) -> Verification {
			if self.keep {
				Verification::improved("better")
			} else {
				Verification::regressed("worse")
			}
		}
	}

	#[tokio::test]
	async fn cycle_runs_all_phases_and_keeps_improvement() {
		let opt_loop = OptimizationLoop::new();
		let optimizer = Arc::new(CountingOptimizer { calls: AtomicUsize::new(0), keep: true });

		opt_loop.register(optimizer.clone(), Duration::from_millis(0)).await;

		let reports = opt_loop.run_cycle().await.unwrap();

		assert_eq!(reports.len(), 1);
		assert!(reports[0].optimized);
		assert!(reports[0].kept);
		assert_eq!(optimizer.calls.load(Ordering::SeqCst), 1);
		assert_eq!(opt_loop.phase().await, Phase::Idle);
	}

	#[tokio::test]
	async fn regression_triggers_rollback_and_unkept_report() {
		let opt_loop = OptimizationLoop::new();
		let optimizer = Arc::new(CountingOptimizer { calls: AtomicUsize::new(0), keep: false });

		opt_loop.register(optimizer, Duration::from_millis(0)).await;

		let reports = opt_loop.run_cycle().await.unwrap();

		assert!(reports[0].optimized);
		assert!(!reports[0].kept);
	}

	struct SkippingOptimizer;
	#[async_trait]
	impl Optimizer for SkippingOptimizer {
		fn name(&self) -> &str {
			"skipper"
		}

		async fn analyze(&self) -> Analysis {
			Analysis::skip("nothing to do")
		}

		async fn optimize(&self, _data: Option<&serde_json::Value>) -> Result<()> {
			unreachable!("should never be called when analysis skips")
		}

		async fn verify(&self) -> Verification {
			unreachable!("should never be called when analysis skips")
		}
	}

	#[tokio::test]
	async fn skip_never_reaches_optimize() {
		let opt_loop = OptimizationLoop::new();

		opt_loop.register(Arc::new(SkippingOptimizer), Duration::from_millis(0)).await;

		let reports = opt_loop.run_cycle().await.unwrap();

		assert!(reports.is_empty());
	}

	struct NotApplicableOptimizer;
	#[async_trait]
	impl Optimizer for NotApplicableOptimizer {
		fn name(&self) -> &str {
			"not_applicable"
		}

		async fn is_applicable(&self) -> bool {
			false
		}

		async fn analyze(&self) -> Analysis {
			unreachable!("should never be called when not applicable")
		}

		async fn optimize(&self, _data: Option<&serde_json::Value>) -> Result<()> {
			unreachable!("should never be called when not applicable")
		}

		async fn verify(&self) -> Verification {
			unreachable!("should never be called when not applicable")
		}
	}

	#[tokio::test]
	async fn not_applicable_optimizer_is_skipped_entirely() {
		let opt_loop = OptimizationLoop::new();

		opt_loop.register(Arc::new(NotApplicableOptimizer), Duration::from_millis(0)).await;

		let reports = opt_loop.run_cycle().await.unwrap();

		assert!(reports.is_empty());
	}

	#[tokio::test]
	async fn concurrent_cycle_is_rejected_while_one_is_in_flight() {
		let opt_loop = OptimizationLoop::new();

		opt_loop.begin_cycle().await.unwrap();

		assert!(opt_loop.run_cycle().await.is_err());
	}

	#[tokio::test]
	async fn batched_optimize_runs_every_optimizable_entry_in_one_cycle() {
		struct Named {
			label: &'static str,
			calls: Arc<AtomicUsize>,
		}
		#[async_trait]
		impl Optimizer for Named {
			fn name(&self) -> &str {
				self.label
			}

			async fn analyze(&self) -> Analysis {
				Analysis::proceed("always", None)
			}

			async fn optimize(&self, _data: Option<&serde_json::Value>) -> Result<()> {
				self.calls.fetch_add(1, Ordering::SeqCst);

				Ok(())
			}

			async fn verify(&self) -> Verification {
				Verification::improved("fine")
			}
		}

		let opt_loop = OptimizationLoop::new();
		let calls = Arc::new(AtomicUsize::new(0));

		opt_loop
			.register(Arc::new(Named { label: "a", calls: calls.clone() }), Duration::from_millis(0))
			.await;
		opt_loop
			.register(Arc::new(Named { label: "b", calls: calls.clone() }), Duration::from_millis(0))
			.await;

		let reports = opt_loop.run_cycle().await.unwrap();

		assert_eq!(reports.len(), 2);
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}
}
