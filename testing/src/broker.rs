//! Scriptable in-process broker. TEST ONLY.

use courier_core::broker::{Settlement, dead_letter_exchange, settle};
use courier_core::{
    BrokerError, ConsumerHandle, Delivery, Envelope, HandlerOutcome, MessageBroker,
    MessageHandler, QueueBinding, Topology,
};
use futures::future::BoxFuture;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

/// A message the broker confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Exchange published to
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// The envelope as handed over
    pub envelope: Envelope,
}

struct Subscriber {
    binding: QueueBinding,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct State {
    published: Mutex<Vec<PublishedMessage>>,
    dead_letters: Mutex<Vec<(PublishedMessage, String)>>,
    failures: Mutex<VecDeque<BrokerError>>,
    fail_always: Mutex<Option<BrokerError>>,
    declared: Mutex<HashSet<String>>,
    subscribers: Mutex<Vec<Subscriber>>,
    publish_delay: Mutex<Option<Duration>>,
    connected: AtomicBool,
    closed: AtomicBool,
    publish_attempts: AtomicUsize,
}

/// In-process broker that confirms, fails or delays publishes on command and routes
/// confirmed messages to in-process consumers.
///
/// Clones share state, so a test can keep one handle for assertions while the code
/// under test owns another as `Arc<dyn MessageBroker>`.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<State>,
}

impl MockBroker {
    /// A connected broker that confirms everything.
    #[must_use]
    pub fn new() -> Self {
        let broker = Self::default();
        broker.state.connected.store(true, Ordering::SeqCst);
        broker
    }

    /// Fail the next publish with `error`. Queued failures are consumed in order.
    pub async fn fail_next(&self, error: BrokerError) {
        self.state.failures.lock().await.push_back(error);
    }

    /// Fail every publish with `error` until cleared with `None`.
    pub async fn fail_always(&self, error: Option<BrokerError>) {
        *self.state.fail_always.lock().await = error;
    }

    /// Delay every confirmation.
    pub async fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.state.publish_delay.lock().await = delay;
    }

    /// Confirmed publishes, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().await.clone()
    }

    /// Messages consumers sent to a dead-letter exchange, with the reason.
    pub async fn dead_letters(&self) -> Vec<(PublishedMessage, String)> {
        self.state.dead_letters.lock().await.clone()
    }

    /// Exchanges declared so far, including dead-letter exchanges.
    pub async fn declared_exchanges(&self) -> HashSet<String> {
        self.state.declared.lock().await.clone()
    }

    /// Publish calls made, successful or not.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    /// Hand `envelope` straight to matching consumers as a fresh delivery, bypassing
    /// publish. Used to simulate broker-side redelivery of the same message.
    pub async fn deliver(&self, exchange: &str, routing_key: &str, envelope: Envelope) {
        route(&self.state, exchange, routing_key, &envelope, 1).await;
    }

    async fn next_failure(&self) -> Option<BrokerError> {
        if let Some(error) = self.state.failures.lock().await.pop_front() {
            return Some(error);
        }
        self.state.fail_always.lock().await.clone()
    }
}

async fn route(state: &State, exchange: &str, routing_key: &str, envelope: &Envelope, count: u32) {
    let subscribers = state.subscribers.lock().await;
    for subscriber in subscribers.iter() {
        if subscriber.binding.exchanges.iter().any(|e| e == exchange)
            && subscriber.binding.matches(routing_key)
        {
            let _ = subscriber.sender.send(Delivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                envelope: envelope.clone(),
                delivery_count: count,
            });
        }
    }
}

impl MessageBroker for MockBroker {
    fn connect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.state.connected.store(true, Ordering::SeqCst);
            self.state.closed.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn declare_topology(&self, topology: &Topology) -> BoxFuture<'_, Result<(), BrokerError>> {
        let names: Vec<String> = topology
            .destinations()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        Box::pin(async move {
            if self.state.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
            self.state.declared.lock().await.extend(names);
            Ok(())
        })
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        };
        Box::pin(async move {
            self.state.publish_attempts.fetch_add(1, Ordering::SeqCst);
            if self.state.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
            if !self.state.connected.load(Ordering::SeqCst) {
                return Err(BrokerError::ConnectionFailed("not connected".to_string()));
            }
            let delay = *self.state.publish_delay.lock().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
                // closed while waiting for the confirm
                if self.state.closed.load(Ordering::SeqCst) {
                    return Err(BrokerError::Closed);
                }
            }
            if let Some(error) = self.next_failure().await {
                return Err(error);
            }

            route(
                &self.state,
                &message.exchange,
                &message.routing_key,
                &message.envelope,
                1,
            )
            .await;
            self.state.published.lock().await.push(message);
            Ok(())
        })
    }

    fn consume(
        &self,
        binding: QueueBinding,
        handler: Arc<dyn MessageHandler>,
    ) -> BoxFuture<'_, Result<ConsumerHandle, BrokerError>> {
        Box::pin(async move {
            if self.state.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
            let (sender, mut receiver) = mpsc::unbounded_channel();
            let (shutdown, mut stop) = watch::channel(false);
            self.state.subscribers.lock().await.push(Subscriber {
                binding: binding.clone(),
                sender: sender.clone(),
            });

            let state = Arc::clone(&self.state);
            let queue = binding.queue.clone();
            let task = tokio::spawn(async move {
                loop {
                    let delivery = tokio::select! {
                        Ok(()) = stop.changed() => break,
                        delivery = receiver.recv() => match delivery {
                            Some(delivery) => delivery,
                            None => break,
                        },
                    };

                    let outcome = handler.handle(&delivery).await;
                    match settle(&outcome, delivery.delivery_count, binding.max_deliveries) {
                        Settlement::Ack => {}
                        Settlement::Requeue => {
                            let _ = sender.send(Delivery {
                                delivery_count: delivery.delivery_count + 1,
                                ..delivery
                            });
                        }
                        Settlement::DeadLetter(reason) => {
                            state.dead_letters.lock().await.push((
                                PublishedMessage {
                                    exchange: dead_letter_exchange(&delivery.exchange),
                                    routing_key: delivery.routing_key,
                                    envelope: delivery.envelope,
                                },
                                reason,
                            ));
                        }
                    }
                }
            });

            Ok(ConsumerHandle::new(queue, shutdown, task))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.state.closed.store(true, Ordering::SeqCst);
            self.state.connected.store(false, Ordering::SeqCst);
            self.state.subscribers.lock().await.clear();
            Ok(())
        })
    }
}

/// Handler that returns scripted outcomes and records what it saw.
///
/// Once the script runs out every delivery is acknowledged.
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    outcomes: Arc<Mutex<VecDeque<HandlerOutcome>>>,
    seen: Arc<Mutex<Vec<Delivery>>>,
}

impl ScriptedHandler {
    /// Handler that acknowledges everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that returns `outcomes` in order, then acknowledges.
    #[must_use]
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = HandlerOutcome>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            seen: Arc::default(),
        }
    }

    /// Every delivery handled so far.
    pub async fn seen(&self) -> Vec<Delivery> {
        self.seen.lock().await.clone()
    }
}

impl MessageHandler for ScriptedHandler {
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, HandlerOutcome> {
        Box::pin(async move {
            self.seen.lock().await.push(delivery.clone());
            self.outcomes
                .lock()
                .await
                .pop_front()
                .unwrap_or(HandlerOutcome::Ack)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_core::{CorrelationId, MessageId};

    fn envelope() -> Envelope {
        Envelope {
            message_id: MessageId::new(),
            correlation_id: CorrelationId::new(),
            message_type: "ticket.sale.completed".to_string(),
            payload: serde_json::json!({}),
            published_at: chrono::Utc::now(),
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn scripted_failure_is_consumed_once() {
        let broker = MockBroker::new();
        broker
            .fail_next(BrokerError::Transport("reset by peer".into()))
            .await;

        assert!(broker.publish("x", "k", &envelope()).await.is_err());
        assert!(broker.publish("x", "k", &envelope()).await.is_ok());
        assert_eq!(broker.published().await.len(), 1);
        assert_eq!(broker.publish_attempts(), 2);
    }

    #[tokio::test]
    async fn closed_broker_refuses_publish() {
        let broker = MockBroker::new();
        broker.close().await.unwrap();
        assert!(matches!(
            broker.publish("x", "k", &envelope()).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn failing_handler_is_dead_lettered_after_budget() {
        let broker = MockBroker::new();
        let handler = ScriptedHandler::with_outcomes([
            HandlerOutcome::Retry("db down".into()),
            HandlerOutcome::Retry("db down".into()),
            HandlerOutcome::Retry("db down".into()),
        ]);
        let consumer = broker
            .consume(
                QueueBinding::new("notifier", "ticket.sales").max_deliveries(3),
                Arc::new(handler.clone()),
            )
            .await
            .unwrap();

        broker
            .publish("ticket.sales", "ticket.sale.completed", &envelope())
            .await
            .unwrap();

        let watcher = broker.clone();
        wait_for(|| {
            let watcher = watcher.clone();
            async move { !watcher.dead_letters().await.is_empty() }
        })
        .await;

        let dead = broker.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0.exchange, "ticket.sales.dead-letter");
        let counts: Vec<u32> = handler.seen().await.iter().map(|d| d.delivery_count).collect();
        assert_eq!(counts, vec![1, 2, 3]);

        consumer.stop().await.unwrap();
    }
}
