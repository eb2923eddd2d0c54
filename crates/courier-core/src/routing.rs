use async_trait::async_trait;

use crate::errors::RoutingError;
use crate::ids::{ClientId, InstanceId};

/// Shared map from client identity to the instance holding its connection.
///
/// Every instance sees the same table. There is no local cache; atomicity
/// of each call comes from the backing store.
#[async_trait]
pub trait RoutingTable: Send + Sync {
    /// Record `instance` as the owner of `client`, replacing any prior owner.
    async fn set(&self, client: &ClientId, instance: &InstanceId) -> Result<(), RoutingError>;

    /// Fails with [`RoutingError::UnknownClient`] when no entry exists.
    async fn get(&self, client: &ClientId) -> Result<InstanceId, RoutingError>;

    /// Remove the entry. Deleting a missing entry succeeds.
    async fn delete(&self, client: &ClientId) -> Result<(), RoutingError>;

    /// Remove the entry only while it still names `instance`. An entry
    /// owned by another instance, or no entry at all, is left as is.
    async fn delete_if_owner(&self, client: &ClientId, instance: &InstanceId) -> Result<(), RoutingError>;
}
