use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::envelope::Envelope;
use crate::errors::BrokerError;
use crate::ids::InstanceId;

/// Envelopes addressed to one instance's queue. Ends when the broker
/// connection is lost for good.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// Inter-instance transport: one direct exchange shared by every instance,
/// one durable queue per instance keyed by its id.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Route `envelope` to the queue of `target`.
    async fn publish(&self, target: &InstanceId, envelope: &Envelope) -> Result<(), BrokerError>;

    /// Open a stream over this instance's own queue. May be called again
    /// after a previous stream ended.
    async fn consume(&self) -> Result<EnvelopeStream, BrokerError>;
}
