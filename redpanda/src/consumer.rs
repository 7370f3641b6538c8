//! Consumer tasks: one consumer group per [`QueueBinding`], settled per record.

use crate::broker::Inner;
use crate::headers;
use courier_core::broker::{Settlement, dead_letter_exchange, settle};
use courier_core::{BrokerError, ConsumerHandle, Delivery, Envelope, MessageHandler, QueueBinding};
use courier_runtime::retry::{retry_with_backoff, retry_with_predicate};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Pause after a receive error before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

/// Subscribe (with backoff) and spawn the consume loop.
pub(crate) async fn spawn(
    inner: Arc<Inner>,
    binding: QueueBinding,
    handler: Arc<dyn MessageHandler>,
) -> Result<ConsumerHandle, BrokerError> {
    let consumer = retry_with_backoff(&inner.settings.retry_policy, || async {
        subscribe(&inner, &binding)
    })
    .await?;

    tracing::info!(
        queue = %binding.queue,
        exchanges = ?binding.exchanges,
        routing_keys = ?binding.routing_keys,
        max_deliveries = binding.max_deliveries,
        "Consumer subscribed"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let queue = binding.queue.clone();
    let task = tokio::spawn(run(inner, consumer, binding, handler, stop_rx));
    Ok(ConsumerHandle::new(queue, stop_tx, task))
}

fn subscribe(inner: &Inner, binding: &QueueBinding) -> Result<StreamConsumer, BrokerError> {
    let failed = |reason: String| BrokerError::SubscriptionFailed {
        queue: binding.queue.clone(),
        reason,
    };

    let consumer: StreamConsumer = inner
        .settings
        .client_config()
        .set("group.id", &binding.queue)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", &inner.settings.auto_offset_reset)
        .set("session.timeout.ms", "6000")
        .set("enable.partition.eof", "false")
        .create()
        .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;

    let topics: Vec<&str> = binding.exchanges.iter().map(String::as_str).collect();
    consumer
        .subscribe(&topics)
        .map_err(|e| failed(format!("Failed to subscribe: {e}")))?;
    Ok(consumer)
}

async fn run(
    inner: Arc<Inner>,
    consumer: StreamConsumer,
    binding: QueueBinding,
    handler: Arc<dyn MessageHandler>,
    mut stop: watch::Receiver<bool>,
) {
    let mut broker_shutdown = inner.shutdown_signal();

    loop {
        if *stop.borrow() || *broker_shutdown.borrow() {
            break;
        }

        let message = tokio::select! {
            Ok(()) = stop.changed() => break,
            Ok(()) = broker_shutdown.changed() => break,
            received = consumer.recv() => received,
        };

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(queue = %binding.queue, error = %e, "Failed to receive record");
                tokio::time::sleep(RECEIVE_BACKOFF).await;
                continue;
            }
        };

        match process(&inner, &binding, handler.as_ref(), &message).await {
            Ok(()) => {
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        error = %e,
                        "Failed to commit offset (record may be redelivered)"
                    );
                }
            }
            Err(e) => {
                // Uncommitted; the group redelivers it after the consumer restarts.
                tracing::error!(
                    queue = %binding.queue,
                    topic = message.topic(),
                    offset = message.offset(),
                    error = %e,
                    "Could not settle record; stopping consumer"
                );
                break;
            }
        }
    }

    tracing::debug!(queue = %binding.queue, "Consumer task exiting");
}

/// Hand one record to the handler and carry out the settlement.
async fn process(
    inner: &Inner,
    binding: &QueueBinding,
    handler: &dyn MessageHandler,
    message: &BorrowedMessage<'_>,
) -> Result<(), BrokerError> {
    let exchange = message.topic().to_string();
    let record_headers = message.headers();
    let delivery_count = headers::delivery_count(record_headers);
    let routing_key = record_headers
        .and_then(|h| headers::header_str(h, headers::ROUTING_KEY))
        .or_else(|| message.key().and_then(|k| std::str::from_utf8(k).ok()))
        .unwrap_or_default()
        .to_string();

    if !binding.matches(&routing_key) {
        tracing::trace!(queue = %binding.queue, routing_key = %routing_key, "Skipping unbound routing key");
        return Ok(());
    }

    let payload = message.payload().unwrap_or_default();
    let envelope = match Envelope::from_bytes(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(queue = %binding.queue, topic = %exchange, error = %e, "Dead-lettering undecodable record");
            return dead_letter(inner, &exchange, &routing_key, delivery_count, payload, None, &e.to_string()).await;
        }
    };

    let delivery = Delivery {
        exchange,
        routing_key,
        envelope,
        delivery_count,
    };
    let outcome = handler.handle(&delivery).await;

    match settle(&outcome, delivery.delivery_count, binding.max_deliveries) {
        Settlement::Ack => Ok(()),
        Settlement::Requeue => {
            tracing::debug!(
                queue = %binding.queue,
                message_id = %delivery.envelope.message_id,
                delivery_count = delivery.delivery_count,
                "Requeueing delivery"
            );
            let next = delivery.delivery_count.saturating_add(1);
            retry_with_predicate(
                &inner.settings.retry_policy,
                || {
                    inner.send(
                        &delivery.exchange,
                        &delivery.routing_key,
                        payload,
                        headers::envelope_headers(&delivery.envelope, &delivery.routing_key, next),
                    )
                },
                worth_retrying,
            )
            .await
        }
        Settlement::DeadLetter(reason) => {
            tracing::warn!(
                queue = %binding.queue,
                message_id = %delivery.envelope.message_id,
                reason = %reason,
                "Dead-lettering delivery"
            );
            dead_letter(
                inner,
                &delivery.exchange,
                &delivery.routing_key,
                delivery.delivery_count,
                payload,
                Some(&delivery.envelope),
                &reason,
            )
            .await
        }
    }
}

async fn dead_letter(
    inner: &Inner,
    exchange: &str,
    routing_key: &str,
    delivery_count: u32,
    payload: &[u8],
    envelope: Option<&Envelope>,
    reason: &str,
) -> Result<(), BrokerError> {
    let destination = dead_letter_exchange(exchange);
    retry_with_predicate(
        &inner.settings.retry_policy,
        || {
            inner.send(
                &destination,
                routing_key,
                payload,
                headers::dead_letter_headers(routing_key, delivery_count, exchange, reason, envelope),
            )
        },
        worth_retrying,
    )
    .await
}

/// Settlement publishes stop retrying once the client is closed.
fn worth_retrying(error: &BrokerError) -> bool {
    error.is_retryable() && !matches!(error, BrokerError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_gives_up_on_closed_or_invalid() {
        assert!(worth_retrying(&BrokerError::Transport("reset".to_string())));
        assert!(!worth_retrying(&BrokerError::Closed));
        assert!(!worth_retrying(&BrokerError::InvalidMessage("too large".to_string())));
    }
}
