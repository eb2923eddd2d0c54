mod dispatch;
mod error;
mod manager;
mod pipeline;
mod stats;

pub use dispatch::{plan, Plan};
pub use error::ManagerError;
pub use manager::{Delivery, Ingestion, Manager, ManagerConfig};
pub use pipeline::ManagerHandle;
pub use stats::{ManagerStats, StatsSnapshot};
