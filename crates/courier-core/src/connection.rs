use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::errors::ConnectionError;
use crate::ids::ClientId;

/// One ordered, bidirectional envelope stream bound to a single client.
///
/// `receive` and `send` may run concurrently: the ingestion pipeline reads
/// while the dispatch pipeline writes.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Wait for the next envelope. `StreamClosed` on clean end of stream.
    async fn receive(&self) -> Result<Envelope, ConnectionError>;

    async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError>;

    /// Release the transport. Safe to call more than once.
    async fn close(&self);
}

/// A client identity together with the connection it arrived on.
#[derive(Clone)]
pub struct Client {
    pub id: ClientId,
    pub conn: Arc<dyn Connection>,
}

impl Client {
    pub fn new(id: ClientId, conn: Arc<dyn Connection>) -> Self {
        Self { id, conn }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("id", &self.id).finish_non_exhaustive()
    }
}
