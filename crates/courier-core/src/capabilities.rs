use async_trait::async_trait;

use crate::envelope::{payload_preview, Envelope};

/// Sink for envelopes whose recipient is not connected anywhere.
///
/// Implementations record and return; they never fail the delivery.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn persist(&self, envelope: &Envelope);
}

/// Records undeliverable envelopes in the log only.
#[derive(Clone, Debug, Default)]
pub struct LogPersistence;

#[async_trait]
impl Persistence for LogPersistence {
    async fn persist(&self, envelope: &Envelope) {
        tracing::info!(
            kind = %envelope.kind,
            from = %envelope.from,
            to = %envelope.to,
            payload = %payload_preview(&envelope.payload, 64),
            "recipient offline, saving message"
        );
    }
}

/// Fan-out for the Group and Channel kinds.
#[async_trait]
pub trait GroupDelivery: Send + Sync {
    async fn deliver_group(&self, envelope: &Envelope) -> Result<(), String>;
    async fn deliver_channel(&self, envelope: &Envelope) -> Result<(), String>;
}

/// Accepts group and channel envelopes without delivering them.
#[derive(Clone, Debug, Default)]
pub struct UnsupportedGroups;

#[async_trait]
impl GroupDelivery for UnsupportedGroups {
    async fn deliver_group(&self, envelope: &Envelope) -> Result<(), String> {
        tracing::debug!(from = %envelope.from, to = %envelope.to, "group delivery not supported, dropping");
        Ok(())
    }

    async fn deliver_channel(&self, envelope: &Envelope) -> Result<(), String> {
        tracing::debug!(from = %envelope.from, to = %envelope.to, "channel delivery not supported, dropping");
        Ok(())
    }
}
