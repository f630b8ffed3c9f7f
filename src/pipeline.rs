//! Pipeline harness (C13): chainable transformers and processors over typed
//! items, with bounded-concurrency batch execution.

// std
use std::collections::HashMap;
// crates.io
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
// self
use crate::_prelude::*;

/// Opaque envelope flowing through a [`Pipeline`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineItem {
	/// Item identity, carried through every stage.
	pub id: String,
	/// Stage-mutable payload.
	pub payload: serde_json::Value,
	/// Stage-mutable side-channel annotations (e.g. anomaly flags).
	pub metadata: serde_json::Value,
}
impl PipelineItem {
	/// Build an item with empty metadata.
	pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
		Self { id: id.into(), payload, metadata: serde_json::json!({}) }
	}
}

/// Maps one item to one item.
#[async_trait]
pub trait Transformer: Send + Sync {
	/// Transform `item`, returning the replacement.
	async fn transform(&self, item: PipelineItem) -> Result<PipelineItem>;
}

/// Consumes one item and emits zero or more derived items.
#[async_trait]
pub trait Processor: Send + Sync {
	/// Process `item`, returning any derived items (e.g. the original plus annotations).
	async fn process(&self, item: PipelineItem) -> Result<Vec<PipelineItem>>;
}

/// How [`Pipeline::run_batch`] handles a per-item error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
	/// The first error aborts the batch; its error is returned and no further items are started.
	FailFast,
	/// Every item runs to completion; successes and per-item errors are both reported.
	CollectErrors,
}

/// Per-item outcome from a [`ErrorPolicy::CollectErrors`] batch run.
pub struct ItemOutcome {
	/// Original item id.
	pub id: String,
	/// Items produced, if the run succeeded.
	pub items: Option<Vec<PipelineItem>>,
	/// Error message, if the run failed.
	pub error: Option<String>,
}

/// An ordered chain of transformers followed by an optional terminal processor.
pub struct Pipeline {
	transformers: Vec<Arc<dyn Transformer>>,
	processor: Option<Arc<dyn Processor>>,
}
impl Pipeline {
	/// Build an empty pipeline.
	pub fn new() -> Self {
		Self { transformers: Vec::new(), processor: None }
	}

	/// Append a transformer to the chain.
	pub fn then_transform(mut self, transformer: impl Transformer + 'static) -> Self {
		self.transformers.push(Arc::new(transformer));

		self
	}

	/// Terminate the chain with a processor.
	pub fn finally_process(mut self, processor: impl Processor + 'static) -> Self {
		self.processor = Some(Arc::new(processor));

		self
	}

	/// Run the chain once over a single item.
	pub async fn run_one(&self, item: PipelineItem) -> Result<Vec<PipelineItem>> {
		let mut current = item;

		for transformer in &self.transformers {
			current = transformer.transform(current).await?;
		}

		match &self.processor {
			Some(processor) => processor.process(current).await,
			None => Ok(vec![current]),
		}
	}

	/// Run the chain over every item with bounded concurrency, actually dispatched onto the
	/// runtime (not just polled cooperatively) so a slow item cannot stall its siblings.
	pub async fn run_batch(
		self: &Arc<Self>,
		items: Vec<PipelineItem>,
		concurrency: usize,
		error_policy: ErrorPolicy,
	) -> Result<Vec<ItemOutcome>> {
		let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
		let mut handles = Vec::with_capacity(items.len());

		for item in items {
			let semaphore = semaphore.clone();
			let pipeline = self.clone();
			let id = item.id.clone();

			handles.push(tokio::spawn(async move {
				let _permit = semaphore.acquire_owned().await.ok();

				(id, pipeline.run_one(item).await)
			}));
		}

		let mut outcomes = Vec::with_capacity(handles.len());

		for handle in handles {
			let (id, result) = handle.await.map_err(|err| Error::Fatal(err.to_string()))?;

			match (result, error_policy) {
				(Ok(items), _) => outcomes.push(ItemOutcome { id, items: Some(items), error: None }),
				(Err(err), ErrorPolicy::FailFast) => return Err(err),
				(Err(err), ErrorPolicy::CollectErrors) =>
					outcomes.push(ItemOutcome { id, items: None, error: Some(err.to_string()) }),
			}
		}

		Ok(outcomes)
	}
}
impl Default for Pipeline {
	fn default() -> Self {
		Self::new()
	}
}

/// Renames a top-level JSON object key, erroring when the source field is absent.
pub struct RenameFieldTransformer {
	from: String,
	to: String,
}
impl RenameFieldTransformer {
	/// Rename `from` to `to` on the item's payload object.
	pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
		Self { from: from.into(), to: to.into() }
	}
}
#[async_trait]
impl Transformer for RenameFieldTransformer {
	async fn transform(&self, mut item: PipelineItem) -> Result<PipelineItem> {
		let object = item.payload.as_object_mut().ok_or_else(|| Error::Validation {
			field: "payload",
			reason: "expected a JSON object".into(),
		})?;

		let value = object.remove(&self.from).ok_or_else(|| Error::Validation {
			field: "payload",
			reason: format!("missing field '{}'", self.from),
		})?;

		object.insert(self.to.clone(), value);

		Ok(item)
	}
}

struct RollingStat {
	count: u64,
	mean: f64,
	m2: f64,
}
impl RollingStat {
	fn new() -> Self {
		Self { count: 0, mean: 0.0, m2: 0.0 }
	}

	fn observe(&mut self, value: f64) -> (f64, f64) {
		self.count += 1;

		let delta = value - self.mean;

		self.mean += delta / self.count as f64;

		let delta2 = value - self.mean;

		self.m2 += delta * delta2;

		let stddev = if self.count > 1 { (self.m2 / (self.count - 1) as f64).sqrt() } else { 0.0 };

		(self.mean, stddev)
	}
}

/// Flags numeric observations more than `threshold` standard deviations from a rolling mean,
/// maintained independently per metadata key.
pub struct ZScoreAnomalyProcessor {
	field: String,
	group_by: String,
	threshold: f64,
	stats: Mutex<HashMap<String, RollingStat>>,
}
impl ZScoreAnomalyProcessor {
	/// Watch `field` on the payload, grouping rolling statistics by the `group_by` metadata key.
	pub fn new(field: impl Into<String>, group_by: impl Into<String>, threshold: f64) -> Self {
		Self { field: field.into(), group_by: group_by.into(), threshold, stats: Mutex::new(HashMap::new()) }
	}
}
#[async_trait]
impl Processor for ZScoreAnomalyProcessor {
	async fn process(&self, mut item: PipelineItem) -> Result<Vec<PipelineItem>> {
		let Some(value) = item.payload.get(&self.field).and_then(|v| v.as_f64()) else {
			return Ok(vec![item]);
		};
		let group = item.metadata.get(&self.group_by).and_then(|v| v.as_str()).unwrap_or("default").to_string();

		let (mean, stddev) = {
			let mut stats = self.stats.lock().await;
			let stat = stats.entry(group).or_insert_with(RollingStat::new);

			stat.observe(value)
		};

		if stddev > 0.0 {
			let z = (value - mean).abs() / stddev;

			if z > self.threshold {
				if let Some(object) = item.metadata.as_object_mut() {
					object.insert("anomaly".to_string(), serde_json::json!(true));
					object.insert("z_score".to_string(), serde_json::json!(z));
				}
			}
		}

		Ok(vec![item])
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn rename_field_transformer_renames_present_key() {
		let pipeline = Pipeline::new().then_transform(RenameFieldTransformer::new("old", "new"));
		let item = PipelineItem::new("1", serde_json::json!({ "old": 42 }));

		let out = pipeline.run_one(item).await.unwrap();

		assert_eq!(out[0].payload.get("new"), Some(&serde_json::json!(42)));
		assert!(out[0].payload.get("old").is_none());
	}

	#[tokio::test]
	async fn rename_field_transformer_errors_on_missing_field() {
		let pipeline = Pipeline::new().then_transform(RenameFieldTransformer::new("missing", "new"));
		let item = PipelineItem::new("1", serde_json::json!({ "other": 1 }));

		assert!(pipeline.run_one(item).await.is_err());
	}

	#[tokio::test]
	async fn zscore_processor_flags_outlier() {
		let pipeline = Pipeline::new().finally_process(ZScoreAnomalyProcessor::new("value", "sensor", 2.0));

		for value in [10.0, 11.0, 9.0, 10.0, 11.0] {
			let item = PipelineItem::new("n", serde_json::json!({ "value": value }));

			pipeline.run_one(item).await.unwrap();
		}

		let outlier = PipelineItem::new("n", serde_json::json!({ "value": 1000.0 }));
		let out = pipeline.run_one(outlier).await.unwrap();

		assert_eq!(out[0].metadata.get("anomaly"), Some(&serde_json::json!(true)));
	}

	#[tokio::test]
	async fn run_batch_collect_errors_reports_both() {
		let pipeline = Arc::new(Pipeline::new().then_transform(RenameFieldTransformer::new("old", "new")));
		let items = vec![
			PipelineItem::new("ok", serde_json::json!({ "old": 1 })),
			PipelineItem::new("bad", serde_json::json!({})),
		];

		let outcomes = pipeline.run_batch(items, 2, ErrorPolicy::CollectErrors).await.unwrap();

		assert_eq!(outcomes.len(), 2);
		assert!(outcomes.iter().any(|o| o.error.is_some()));
		assert!(outcomes.iter().any(|o| o.items.is_some()));
	}

	#[tokio::test]
	async fn run_batch_fail_fast_propagates_first_error() {
		let pipeline = Arc::new(Pipeline::new().then_transform(RenameFieldTransformer::new("old", "new")));
		let items = vec![PipelineItem::new("bad", serde_json::json!({}))];

		assert!(pipeline.run_batch(items, 2, ErrorPolicy::FailFast).await.is_err());
	}
}
