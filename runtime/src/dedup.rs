//! Consumer-side de-duplication on correlation id.
//!
//! Delivery is at-least-once: the sweeper may re-publish a message whose confirmation
//! was lost, and the broker may redeliver after a consumer crash. Wrapping a handler in
//! [`Deduplicated`] makes it see each correlation id once per window.

use courier_core::{CorrelationId, Delivery, HandlerOutcome, MessageHandler};
use futures::future::BoxFuture;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Seen {
    ids: HashSet<CorrelationId>,
    order: VecDeque<CorrelationId>,
}

/// Skips deliveries whose correlation id was already acknowledged.
///
/// Remembers the most recent `capacity` acknowledged ids in memory. Only `Ack`
/// outcomes are remembered, so a delivery that failed is processed again on redelivery.
pub struct Deduplicated {
    inner: Arc<dyn MessageHandler>,
    capacity: usize,
    seen: Mutex<Seen>,
}

impl Deduplicated {
    /// Wrap `inner`, remembering up to `capacity` correlation ids.
    #[must_use]
    pub fn new(inner: Arc<dyn MessageHandler>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            seen: Mutex::new(Seen::default()),
        }
    }
}

impl MessageHandler for Deduplicated {
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, HandlerOutcome> {
        Box::pin(async move {
            let correlation_id = delivery.envelope.correlation_id;
            if self.seen.lock().await.ids.contains(&correlation_id) {
                tracing::debug!(
                    %correlation_id,
                    message_id = %delivery.envelope.message_id,
                    "Duplicate delivery skipped"
                );
                return HandlerOutcome::Ack;
            }

            let outcome = self.inner.handle(delivery).await;
            if outcome == HandlerOutcome::Ack {
                let mut seen = self.seen.lock().await;
                if seen.ids.insert(correlation_id) {
                    seen.order.push_back(correlation_id);
                    while seen.order.len() > self.capacity {
                        if let Some(evicted) = seen.order.pop_front() {
                            seen.ids.remove(&evicted);
                        }
                    }
                }
            }
            outcome
        })
    }
}
