pub mod broker;
pub mod capabilities;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod routing;
pub mod testing;

pub use broker::{Broker, EnvelopeStream};
pub use capabilities::{GroupDelivery, LogPersistence, Persistence, UnsupportedGroups};
pub use connection::{Client, Connection};
pub use envelope::{Envelope, EnvelopeKind};
pub use errors::{BrokerError, ConnectionError, RoutingError};
pub use ids::{ChannelId, ClientId, InstanceId};
pub use routing::RoutingTable;
