use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use courier_core::errors::RoutingError;
use courier_core::ids::{ClientId, InstanceId};
use courier_core::routing::RoutingTable;

use crate::database::Database;
use crate::error::StoreError;

/// Routing table stored in the shared database.
///
/// Entries carry no TTL: an instance that dies without logging its clients
/// out leaves their rows behind until those clients register again.
#[derive(Clone)]
pub struct SqliteRoutingTable {
    db: Database,
}

impl SqliteRoutingTable {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(client_id = %client, instance_id = %instance))]
    pub fn upsert(&self, client: &ClientId, instance: &InstanceId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO routes (client_id, instance_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(client_id) DO UPDATE SET
                     instance_id = excluded.instance_id,
                     updated_at = excluded.updated_at",
                rusqlite::params![client.as_str(), instance.as_str(), now],
            )?;
            Ok(())
        })
    }

    pub fn lookup(&self, client: &ClientId) -> Result<Option<InstanceId>, StoreError> {
        self.db.with_conn(|conn| {
            let owner = conn
                .query_row(
                    "SELECT instance_id FROM routes WHERE client_id = ?1",
                    [client.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(owner.map(InstanceId::from_raw))
        })
    }

    #[instrument(skip(self), fields(client_id = %client))]
    pub fn remove(&self, client: &ClientId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM routes WHERE client_id = ?1", [client.as_str()])?;
            Ok(n > 0)
        })
    }

    /// Delete `client`'s row only if `instance` still owns it.
    #[instrument(skip(self), fields(client_id = %client, instance_id = %instance))]
    pub fn remove_if_owner(&self, client: &ClientId, instance: &InstanceId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM routes WHERE client_id = ?1 AND instance_id = ?2",
                rusqlite::params![client.as_str(), instance.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Clients currently advertised by `instance`, sorted by id.
    pub fn entries_for(&self, instance: &InstanceId) -> Result<Vec<ClientId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT client_id FROM routes WHERE instance_id = ?1 ORDER BY client_id",
            )?;
            let rows = stmt.query_map([instance.as_str()], |row| row.get::<_, String>(0))?;
            let mut clients = Vec::new();
            for row in rows {
                clients.push(ClientId::from_raw(row?));
            }
            Ok(clients)
        })
    }
}

fn to_routing(e: StoreError) -> RoutingError {
    RoutingError::Store(e.to_string())
}

#[async_trait]
impl RoutingTable for SqliteRoutingTable {
    async fn set(&self, client: &ClientId, instance: &InstanceId) -> Result<(), RoutingError> {
        self.upsert(client, instance).map_err(to_routing)
    }

    async fn get(&self, client: &ClientId) -> Result<InstanceId, RoutingError> {
        self.lookup(client)
            .map_err(to_routing)?
            .ok_or_else(|| RoutingError::UnknownClient(client.clone()))
    }

    async fn delete(&self, client: &ClientId) -> Result<(), RoutingError> {
        self.remove(client).map(|_| ()).map_err(to_routing)
    }

    async fn delete_if_owner(&self, client: &ClientId, instance: &InstanceId) -> Result<(), RoutingError> {
        self.remove_if_owner(client, instance).map(|_| ()).map_err(to_routing)
    }
}
