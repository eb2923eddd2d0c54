use courier_core::envelope::EnvelopeKind;
use courier_core::errors::{BrokerError, ConnectionError, RoutingError};
use courier_core::ids::ClientId;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Ownership could not be advertised; the client is not managed.
    #[error("registration of {client} failed: {source}")]
    Registration { client: ClientId, source: RoutingError },

    #[error("write to {client} failed: {source}")]
    Connection { client: ClientId, source: ConnectionError },

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Some broadcast writes failed; the others went through.
    #[error("broadcast reached {delivered} clients, {} failed", .failed.len())]
    Broadcast {
        delivered: usize,
        failed: Vec<(ClientId, ConnectionError)>,
    },

    #[error("{kind} delivery failed: {reason}")]
    Capability { kind: EnvelopeKind, reason: String },

    #[error("dispatch queue closed")]
    QueueClosed,
}

impl ManagerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Registration { .. } => "registration",
            Self::Connection { .. } => "connection",
            Self::Routing(_) => "routing",
            Self::Broker(_) => "broker",
            Self::Broadcast { .. } => "broadcast",
            Self::Capability { .. } => "capability",
            Self::QueueClosed => "queue_closed",
        }
    }
}
