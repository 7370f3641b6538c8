//! PostgreSQL outbox store.

use crate::limit_param;
use chrono::{DateTime, Utc};
use courier_core::{
    CorrelationId, Inserted, MessageId, NewOutboxMessage, OutboxError, OutboxMessage,
    OutboxStatus, OutboxStore,
};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

macro_rules! outbox_columns {
    () => {
        "message_id, correlation_id, exchange, routing_key, payload, status, attempts, \
         idempotency_key, created_at, last_attempt_at, sent_at, error"
    };
}

/// `pending|failed` guard shared by every transition.
macro_rules! undelivered {
    () => {
        "status IN ('pending', 'failed')"
    };
}

/// PostgreSQL-backed [`OutboxStore`].
///
/// Timestamps are taken from the database clock. Inserts that collide on
/// `idempotency_key` return the stored row instead of writing a second one.
///
/// # Example
///
/// ```no_run
/// use courier_core::{NewOutboxMessage, OutboxStore};
/// use courier_postgres::PostgresOutboxStore;
/// use serde_json::json;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresOutboxStore::new(pool);
/// let inserted = store
///     .create_outbox_message(NewOutboxMessage::new(
///         "ticket.sales",
///         "ticket.sale.completed",
///         json!({ "eventId": "E1" }),
///     ))
///     .await?;
/// println!("stored {}", inserted.message().message_id);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Record a publish intent inside a caller-owned transaction.
    ///
    /// Use this to commit the intent atomically with the domain write that
    /// motivates it. The message becomes visible to the sweeper only once the
    /// transaction commits; publishing it immediately is the caller's choice.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the insert fails.
    pub async fn create_outbox_message_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: NewOutboxMessage,
    ) -> Result<Inserted, OutboxError> {
        insert_message(&mut **tx, &message).await
    }

    async fn transition(
        &self,
        sql: &'static str,
        message_id: MessageId,
        error: Option<&str>,
    ) -> Result<bool, OutboxError> {
        let mut query = sqlx::query(sql).bind(message_id.as_uuid());
        if let Some(error) = error {
            query = query.bind(error);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

async fn insert_message(
    conn: &mut PgConnection,
    message: &NewOutboxMessage,
) -> Result<Inserted, OutboxError> {
    let inserted = sqlx::query(concat!(
        "INSERT INTO outbox_messages \
         (message_id, correlation_id, exchange, routing_key, payload, idempotency_key) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (idempotency_key) DO NOTHING \
         RETURNING ",
        outbox_columns!()
    ))
    .bind(message.message_id.as_uuid())
    .bind(message.correlation_id.as_uuid())
    .bind(&message.exchange)
    .bind(&message.routing_key)
    .bind(&message.payload)
    .bind(message.idempotency_key.as_deref())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

    if let Some(row) = inserted {
        return Ok(Inserted::New(row_to_message(&row)?));
    }

    // Only an idempotency key collision skips the insert.
    let existing = sqlx::query(concat!(
        "SELECT ",
        outbox_columns!(),
        " FROM outbox_messages WHERE idempotency_key = $1"
    ))
    .bind(message.idempotency_key.as_deref())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

    tracing::debug!(
        idempotency_key = ?message.idempotency_key,
        "Outbox insert collided with existing idempotency key"
    );
    Ok(Inserted::Existing(row_to_message(&existing)?))
}

fn corrupt(row: &PgRow, reason: impl ToString) -> OutboxError {
    let message_id = row
        .try_get::<uuid::Uuid, _>("message_id")
        .map_or_else(|_| "<unknown>".to_string(), |id| id.to_string());
    OutboxError::CorruptRecord {
        message_id,
        reason: reason.to_string(),
    }
}

fn row_to_message(row: &PgRow) -> Result<OutboxMessage, OutboxError> {
    let status: String = row.try_get("status").map_err(|e| corrupt(row, e))?;
    let attempts: i32 = row.try_get("attempts").map_err(|e| corrupt(row, e))?;

    Ok(OutboxMessage {
        message_id: MessageId::from_uuid(row.try_get("message_id").map_err(|e| corrupt(row, e))?),
        correlation_id: CorrelationId::from_uuid(
            row.try_get("correlation_id").map_err(|e| corrupt(row, e))?,
        ),
        exchange: row.try_get("exchange").map_err(|e| corrupt(row, e))?,
        routing_key: row.try_get("routing_key").map_err(|e| corrupt(row, e))?,
        payload: row.try_get("payload").map_err(|e| corrupt(row, e))?,
        status: OutboxStatus::parse(&status).map_err(|e| corrupt(row, e))?,
        attempts: u32::try_from(attempts).map_err(|e| corrupt(row, e))?,
        idempotency_key: row.try_get("idempotency_key").map_err(|e| corrupt(row, e))?,
        created_at: row.try_get("created_at").map_err(|e| corrupt(row, e))?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(|e| corrupt(row, e))?,
        sent_at: row.try_get("sent_at").map_err(|e| corrupt(row, e))?,
        error: row.try_get("error").map_err(|e| corrupt(row, e))?,
    })
}

fn rows_to_messages(rows: &[PgRow]) -> Result<Vec<OutboxMessage>, OutboxError> {
    rows.iter().map(row_to_message).collect()
}

impl OutboxStore for PostgresOutboxStore {
    fn create_outbox_message(
        &self,
        message: NewOutboxMessage,
    ) -> BoxFuture<'_, Result<Inserted, OutboxError>> {
        Box::pin(async move {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;
            insert_message(&mut *conn, &message).await
        })
    }

    fn mark_message_as_sent(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, Result<bool, OutboxError>> {
        Box::pin(async move {
            self.transition(
                concat!(
                    "UPDATE outbox_messages SET status = 'sent', sent_at = NOW() \
                     WHERE message_id = $1 AND ",
                    undelivered!()
                ),
                message_id,
                None,
            )
            .await
        })
    }

    fn mark_message_as_failed(
        &self,
        message_id: MessageId,
        error: &str,
    ) -> BoxFuture<'_, Result<bool, OutboxError>> {
        let error = error.to_string();
        Box::pin(async move {
            self.transition(
                concat!(
                    "UPDATE outbox_messages \
                     SET status = 'failed', attempts = attempts + 1, error = $2, \
                         last_attempt_at = NOW() \
                     WHERE message_id = $1 AND ",
                    undelivered!()
                ),
                message_id,
                Some(&error),
            )
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
            self.transition(
                concat!(
                    "UPDATE outbox_messages SET status = 'dead', error = $2 \
                     WHERE message_id = $1 AND ",
                    undelivered!()
                ),
                message_id,
                Some(&reason),
            )
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
            let rows = sqlx::query(concat!(
                "SELECT ",
                outbox_columns!(),
                " FROM outbox_messages \
                 WHERE ",
                undelivered!(),
                " AND attempts < $2 \
                   AND COALESCE(last_attempt_at, created_at) <= $1 \
                 ORDER BY COALESCE(last_attempt_at, created_at), created_at \
                 LIMIT $3"
            ))
            .bind(older_than)
            .bind(i64::from(max_attempts))
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

            rows_to_messages(&rows)
        })
    }

    fn dead_letter_exhausted(
        &self,
        max_attempts: u32,
    ) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "UPDATE outbox_messages \
                 SET status = 'dead', \
                     error = COALESCE(error, format('retry budget of %s exhausted', $1::bigint)) \
                 WHERE ",
                undelivered!(),
                " AND attempts >= $1 \
                 RETURNING ",
                outbox_columns!()
            ))
            .bind(i64::from(max_attempts))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

            rows_to_messages(&rows)
        })
    }

    fn get(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, Result<Option<OutboxMessage>, OutboxError>> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                outbox_columns!(),
                " FROM outbox_messages WHERE message_id = $1"
            ))
            .bind(message_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

            row.as_ref().map(row_to_message).transpose()
        })
    }

    fn list_dead(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                outbox_columns!(),
                " FROM outbox_messages WHERE status = 'dead' \
                 ORDER BY COALESCE(last_attempt_at, created_at) DESC \
                 LIMIT $1"
            ))
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

            rows_to_messages(&rows)
        })
    }

    fn purge_sent(&self, older_than: DateTime<Utc>) -> BoxFuture<'_, Result<u64, OutboxError>> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM outbox_messages WHERE status = 'sent' AND sent_at < $1",
            )
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

            Ok(result.rows_affected())
        })
    }
}
