use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::{debug, error, warn};

use courier_core::broker::{Broker, EnvelopeStream};
use courier_core::envelope::Envelope;
use courier_core::errors::BrokerError;
use courier_core::ids::InstanceId;

use crate::database::Database;
use crate::error::StoreError;

/// Direct exchange backed by the shared database.
///
/// The routing key of a publish is the target instance id, which is also
/// the queue name. Each instance consumes only its own queue. Messages stay
/// in the table until popped, so a consumer that reconnects picks up where
/// the previous one stopped.
#[derive(Clone)]
pub struct SqliteBroker {
    db: Database,
    exchange: String,
    queue: InstanceId,
    poll_interval: Duration,
}

impl SqliteBroker {
    pub fn new(db: Database, exchange: impl Into<String>, queue: InstanceId, poll_interval: Duration) -> Self {
        Self {
            db,
            exchange: exchange.into(),
            queue,
            poll_interval,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn enqueue(&self, target: &InstanceId, body: &str) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO broker_messages (exchange, queue, body, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![self.exchange, target.as_str(), body, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Remove and return the oldest message on this instance's queue.
    pub fn pop(&self) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let body = conn
                .query_row(
                    "DELETE FROM broker_messages WHERE id = (
                         SELECT id FROM broker_messages
                         WHERE exchange = ?1 AND queue = ?2
                         ORDER BY id LIMIT 1
                     ) RETURNING body",
                    rusqlite::params![self.exchange, self.queue.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(body)
        })
    }

    /// Messages waiting on `queue`.
    pub fn depth(&self, queue: &InstanceId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM broker_messages WHERE exchange = ?1 AND queue = ?2",
                rusqlite::params![self.exchange, queue.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    async fn next_envelope(&self) -> Option<Envelope> {
        loop {
            match self.pop() {
                Ok(Some(body)) => match Envelope::from_json(&body) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => {
                        warn!(queue = %self.queue, error = %e, "dropping undecodable broker message");
                    }
                },
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "broker queue unreadable, ending stream");
                    return None;
                }
            }
        }
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn publish(&self, target: &InstanceId, envelope: &Envelope) -> Result<(), BrokerError> {
        let body = envelope
            .to_json()
            .map_err(|e| BrokerError::PublishFailure(format!("encode: {e}")))?;
        let id = self
            .enqueue(target, &body)
            .map_err(|e| BrokerError::PublishFailure(e.to_string()))?;
        debug!(exchange = %self.exchange, queue = %target, message_id = id, "published");
        Ok(())
    }

    async fn consume(&self) -> Result<EnvelopeStream, BrokerError> {
        // Touch the queue once so an unusable store fails here, not later.
        self.depth(&self.queue)
            .map_err(|e| BrokerError::ConsumeFailure(e.to_string()))?;

        let broker = self.clone();
        let stream = futures::stream::unfold(broker, |broker| async move {
            let envelope = broker.next_envelope().await?;
            Some((envelope, broker))
        });
        Ok(Box::pin(stream))
    }
}
