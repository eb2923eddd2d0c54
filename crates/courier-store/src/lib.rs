pub mod broker;
pub mod database;
pub mod error;
pub mod routes;
pub mod schema;

pub use broker::SqliteBroker;
pub use database::Database;
pub use error::StoreError;
pub use routes::SqliteRoutingTable;
