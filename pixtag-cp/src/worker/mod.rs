//! Classification Worker
//!
//! Processes one [`ClassificationTask`]: fetch every image, derive content
//! metadata, ask the model for one record per image, validate the records
//! against the compiled schema and append one row per image to the Results
//! Store.
//!
//! Image fetch failures skip that image only. Everything else fails the task
//! and is retried by the queue.

pub mod state;

pub use state::{TaskRun, TaskState};

use chrono::Utc;
use futures::future::join_all;
use pixtag_common::results::{LabeledImageRow, ResultsStore};
use pixtag_common::schema::validate_response;
use pixtag_common::{ClassificationTask, ImageMetadata};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::TaskError;
use crate::fetch::ImageFetcher;
use crate::hashing;
use crate::model::{compose_prompt, InlineImage, ModelInvoker, ModelRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedImage {
    pub image_link: String,
    pub reason: String,
}

/// Outcome of a successful task
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub offer_id: String,
    pub images_requested: usize,
    pub rows_written: usize,
    pub images_skipped: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedImage>,
    pub elapsed_ms: u64,
}

pub struct ClassificationWorker {
    fetcher: Arc<dyn ImageFetcher>,
    invoker: Arc<dyn ModelInvoker>,
    store: ResultsStore,
    prompt_text: String,
    response_schema: Value,
    task_timeout: Duration,
}

impl ClassificationWorker {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        invoker: Arc<dyn ModelInvoker>,
        store: ResultsStore,
        prompt_text: String,
        task_timeout: Duration,
    ) -> Self {
        let response_schema = store.schema().response_schema();
        Self {
            fetcher,
            invoker,
            store,
            prompt_text,
            response_schema,
            task_timeout,
        }
    }

    pub fn store(&self) -> &ResultsStore {
        &self.store
    }

    pub fn model_name(&self) -> &str {
        self.invoker.model_name()
    }

    /// Run one task to completion, bounded by the task timeout
    pub async fn process(&self, task: &ClassificationTask) -> Result<TaskSummary, TaskError> {
        let mut run = TaskRun::new(task.offer_id());

        let outcome = match tokio::time::timeout(self.task_timeout, self.execute(task, &mut run)).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout(self.task_timeout)),
        };

        match &outcome {
            Ok(summary) => info!(
                offer_id = %summary.offer_id,
                rows_written = summary.rows_written,
                images_skipped = summary.images_skipped,
                elapsed_ms = summary.elapsed_ms,
                "[COMPLETED] Finished processing product"
            ),
            Err(e) => {
                let failed_in = run.state();
                run.advance(TaskState::Failed);
                error!(
                    offer_id = %task.offer_id(),
                    state = %failed_in,
                    elapsed_ms = run.elapsed_ms(),
                    error = %e,
                    "[FAILED] Error processing product"
                );
            }
        }

        outcome
    }

    async fn execute(&self, task: &ClassificationTask, run: &mut TaskRun) -> Result<TaskSummary, TaskError> {
        let refs = task.image_refs();
        let mut summary = TaskSummary {
            offer_id: task.offer_id().to_string(),
            images_requested: refs.len(),
            rows_written: 0,
            images_skipped: 0,
            skipped: Vec::new(),
            elapsed_ms: 0,
        };

        if refs.is_empty() {
            run.advance(TaskState::Done);
            summary.elapsed_ms = run.elapsed_ms();
            return Ok(summary);
        }

        run.advance(TaskState::Fetching);
        let fetches = join_all(refs.iter().map(|r| self.fetcher.fetch(&r.image_link))).await;

        let mut fetched = Vec::with_capacity(refs.len());
        for (image_ref, result) in refs.iter().zip(fetches) {
            match result {
                Ok(image) => fetched.push((image_ref.image_link.clone(), image)),
                Err(e) => {
                    warn!(
                        offer_id = %task.offer_id(),
                        image_link = %image_ref.image_link,
                        error = %e,
                        "Skipping image that could not be fetched"
                    );
                    summary.skipped.push(SkippedImage {
                        image_link: image_ref.image_link.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        summary.images_skipped = summary.skipped.len();

        if fetched.is_empty() {
            return Err(TaskError::AllFetchesFailed {
                attempted: refs.len(),
            });
        }

        run.advance(TaskState::Hashing);
        let mut described: Vec<(String, ImageMetadata)> = Vec::with_capacity(fetched.len());
        let mut images = Vec::with_capacity(fetched.len());
        for (image_link, image) in fetched {
            let metadata = hashing::describe(&image.bytes, image.content_type.as_deref());
            images.push(InlineImage {
                mime_type: metadata.mime_type.clone(),
                bytes: image.bytes,
            });
            described.push((image_link, metadata));
        }

        run.advance(TaskState::InvokingModel);
        let request = ModelRequest {
            prompt: compose_prompt(&self.prompt_text, task, images.len()),
            images,
            response_schema: self.response_schema.clone(),
        };
        let response = self.invoker.invoke(&request).await?;

        run.advance(TaskState::Validating);
        let records = validate_response(self.store.schema(), &response, described.len())?;

        run.advance(TaskState::Persisting);
        let timestamp = Utc::now();
        let product = &task.product;
        let rows: Vec<LabeledImageRow> = described
            .into_iter()
            .zip(records)
            .map(|((image_link, metadata), fields)| LabeledImageRow {
                offer_id: product.offer_id.clone(),
                merchant_id: product.merchant_id,
                aggregator_id: product.aggregator_id,
                image_link,
                metadata,
                fields,
                timestamp,
            })
            .collect();

        summary.rows_written = self.store.append(&rows).await.map_err(TaskError::Persist)?;

        run.advance(TaskState::Done);
        summary.elapsed_ms = run.elapsed_ms();
        Ok(summary)
    }
}
