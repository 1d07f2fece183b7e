//! Dispatcher: selected products to queue messages
//!
//! One message per product. The queue must be empty first: a second cycle
//! started while tasks of the first are still pending or in flight could
//! select the same image links again, since those have no results yet.

use pixtag_common::queue::{EnqueueRequest, TaskQueue};
use pixtag_common::selector::SelectedProduct;
use pixtag_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    /// Deadline attached to every task; the delivery runner uses it as the
    /// request timeout
    task_deadline: Duration,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, task_deadline: Duration) -> Self {
        Self {
            queue,
            task_deadline,
        }
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Enqueue one task per product for delivery to `endpoint`.
    ///
    /// Fails with [`Error::QueueBusy`] without enqueuing anything if the queue
    /// still has pending or in-flight tasks, including tasks added by a
    /// concurrent dispatch. Does not wait for delivery.
    pub async fn dispatch(&self, products: &[SelectedProduct], endpoint: &str) -> Result<usize> {
        let mut requests = Vec::with_capacity(products.len());
        for selected in products {
            requests.push(EnqueueRequest {
                target_url: endpoint.to_string(),
                payload: selected.to_task().to_json()?,
                deadline: self.task_deadline,
            });
        }

        let task_ids = match self.queue.enqueue_batch_if_idle(requests).await {
            Ok(ids) => ids,
            Err(Error::QueueBusy { pending, in_flight }) => {
                warn!(
                    queue = self.queue.queue_id(),
                    pending,
                    in_flight,
                    "Queue busy, refusing to dispatch"
                );
                return Err(Error::QueueBusy { pending, in_flight });
            }
            Err(e) => return Err(e),
        };

        for (task_id, selected) in task_ids.iter().zip(products) {
            debug!(
                task_id = %task_id,
                offer_id = %selected.product.offer_id,
                images = selected.images.len(),
                "Enqueued classification task"
            );
        }

        info!(
            queue = self.queue.queue_id(),
            endpoint,
            dispatched = task_ids.len(),
            "Dispatched classification tasks"
        );
        Ok(task_ids.len())
    }
}
