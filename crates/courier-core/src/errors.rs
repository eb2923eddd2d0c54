use crate::ids::ClientId;

/// Failures on a single client's connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Clean end of stream. Expected; ends ingestion silently.
    #[error("stream closed")]
    StreamClosed,
    #[error("read failed: {0}")]
    ReadFailure(String),
    #[error("write failed: {0}")]
    WriteFailure(String),
}

impl ConnectionError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::StreamClosed)
    }
}

/// Failures of the shared client → instance lookup table.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// No entry for the identity. Callers treat this as "deliver later".
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),
    #[error("routing store error: {0}")]
    Store(String),
}

impl RoutingError {
    pub fn is_unknown_client(&self) -> bool {
        matches!(self, Self::UnknownClient(_))
    }
}

/// Failures of the inter-instance transport.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("publish failed: {0}")]
    PublishFailure(String),
    #[error("consume failed: {0}")]
    ConsumeFailure(String),
}

impl BrokerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::PublishFailure(_) => "publish_failure",
            Self::ConsumeFailure(_) => "consume_failure",
        }
    }
}
