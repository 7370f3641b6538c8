//! In-memory outbox store. TEST ONLY.

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;
use courier_core::{
    Inserted, MessageId, NewOutboxMessage, OutboxError, OutboxMessage, OutboxStatus, OutboxStore,
};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Outbox store backed by a `HashMap` under one lock.
///
/// Every transition runs its status check and its write under the same write guard,
/// which gives the same compare-and-swap semantics as the conditional `UPDATE`s of
/// the Postgres store.
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    messages: Arc<RwLock<HashMap<MessageId, OutboxMessage>>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOutboxStore {
    /// Create an empty store stamping records with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate the database going away: every call fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every stored message.
    pub async fn all(&self) -> Vec<OutboxMessage> {
        let mut all: Vec<_> = self.messages.read().await.values().cloned().collect();
        all.sort_by_key(|m| m.created_at);
        all
    }

    /// Number of stored messages.
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), OutboxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(OutboxError::DatabaseError(
                "connection refused (simulated)".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn transition(
        &self,
        message_id: MessageId,
        next: OutboxStatus,
        error: Option<&str>,
    ) -> Result<bool, OutboxError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut messages = self.messages.write().await;
        let Some(message) = messages.get_mut(&message_id) else {
            return Ok(false);
        };
        if !message.status.can_transition_to(next) {
            return Ok(false);
        }

        message.status = next;
        match next {
            OutboxStatus::Sent => message.sent_at = Some(now),
            OutboxStatus::Failed => {
                message.attempts = message.attempts.saturating_add(1);
                message.last_attempt_at = Some(now);
            }
            OutboxStatus::Pending | OutboxStatus::Dead => {}
        }
        if let Some(error) = error {
            message.error = Some(error.to_string());
        }
        Ok(true)
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn create_outbox_message(
        &self,
        message: NewOutboxMessage,
    ) -> BoxFuture<'_, Result<Inserted, OutboxError>> {
        Box::pin(async move {
            self.check_available()?;
            let mut messages = self.messages.write().await;

            if let Some(key) = message.idempotency_key.as_deref() {
                if let Some(existing) = messages
                    .values()
                    .find(|m| m.idempotency_key.as_deref() == Some(key))
                {
                    return Ok(Inserted::Existing(existing.clone()));
                }
            }
            if messages.contains_key(&message.message_id) {
                return Err(OutboxError::DatabaseError(format!(
                    "duplicate key value violates unique constraint: message_id {}",
                    message.message_id
                )));
            }

            let stored = message.into_pending(self.clock.now());
            messages.insert(stored.message_id, stored.clone());
            Ok(Inserted::New(stored))
        })
    }

    fn mark_message_as_sent(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, Result<bool, OutboxError>> {
        Box::pin(self.transition(message_id, OutboxStatus::Sent, None))
    }

    fn mark_message_as_failed(
        &self,
        message_id: MessageId,
        error: &str,
    ) -> BoxFuture<'_, Result<bool, OutboxError>> {
        let error = error.to_string();
        Box::pin(async move {
            self.transition(message_id, OutboxStatus::Failed, Some(&error))
                .await
        })
    }

    fn mark_message_as_dead(
        &self,
        message_id: MessageId,
        reason: &str,
    ) -> BoxFuture<'_, Result<bool, OutboxError>> {
        let reason = reason.to_string();
        Box::pin(async move {
            self.transition(message_id, OutboxStatus::Dead, Some(&reason))
                .await
        })
    }

    fn get_retry_candidates(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>> {
        Box::pin(async move {
            self.check_available()?;
            let messages = self.messages.read().await;
            let mut candidates: Vec<OutboxMessage> = messages
                .values()
                .filter(|m| matches!(m.status, OutboxStatus::Pending | OutboxStatus::Failed))
                .filter(|m| m.attempts < max_attempts)
                .filter(|m| m.last_activity_at() <= older_than)
                .cloned()
                .collect();
            candidates.sort_by_key(|m| (m.last_activity_at(), m.created_at));
            candidates.truncate(limit);
            Ok(candidates)
        })
    }

    fn dead_letter_exhausted(
        &self,
        max_attempts: u32,
    ) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>> {
        Box::pin(async move {
            self.check_available()?;
            let mut messages = self.messages.write().await;
            let mut moved = Vec::new();
            for message in messages.values_mut() {
                if matches!(message.status, OutboxStatus::Pending | OutboxStatus::Failed)
                    && message.attempts >= max_attempts
                {
                    message.status = OutboxStatus::Dead;
                    if message.error.is_none() {
                        message.error = Some(format!("retry budget of {max_attempts} exhausted"));
                    }
                    moved.push(message.clone());
                }
            }
            moved.sort_by_key(|m| m.created_at);
            Ok(moved)
        })
    }

    fn get(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, Result<Option<OutboxMessage>, OutboxError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.messages.read().await.get(&message_id).cloned())
        })
    }

    fn list_dead(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>> {
        Box::pin(async move {
            self.check_available()?;
            let messages = self.messages.read().await;
            let mut dead: Vec<OutboxMessage> = messages
                .values()
                .filter(|m| m.status == OutboxStatus::Dead)
                .cloned()
                .collect();
            dead.sort_by(|a, b| b.last_activity_at().cmp(&a.last_activity_at()));
            dead.truncate(limit);
            Ok(dead)
        })
    }

    fn purge_sent(&self, older_than: DateTime<Utc>) -> BoxFuture<'_, Result<u64, OutboxError>> {
        Box::pin(async move {
            self.check_available()?;
            let mut messages = self.messages.write().await;
            let before = messages.len();
            messages.retain(|_, m| {
                !(m.status == OutboxStatus::Sent && m.sent_at.is_some_and(|at| at < older_than))
            });
            Ok((before - messages.len()) as u64)
        })
    }
}
