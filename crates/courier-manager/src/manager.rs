use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_core::broker::Broker;
use courier_core::capabilities::{GroupDelivery, LogPersistence, Persistence, UnsupportedGroups};
use courier_core::connection::{Client, Connection};
use courier_core::envelope::Envelope;
use courier_core::errors::{ConnectionError, RoutingError};
use courier_core::ids::{ChannelId, ClientId, InstanceId};
use courier_core::routing::RoutingTable;

use crate::error::ManagerError;
use crate::stats::{ManagerStats, StatsSnapshot};

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Capacity of the dispatch queue shared by every ingestion pipeline.
    pub queue_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024 }
    }
}

struct Registration {
    client: Client,
    session: u64,
}

/// Everything that must change together on register/logout.
#[derive(Default)]
struct LocalState {
    clients: HashMap<ClientId, Registration>,
    channels: HashMap<ChannelId, HashSet<ClientId>>,
}

/// How `deliver` disposed of an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Local,
    Forwarded(InstanceId),
    Persisted,
}

/// Running ingestion pipeline of one registered client.
#[derive(Debug)]
pub struct Ingestion {
    client: ClientId,
    session: u64,
    handle: JoinHandle<()>,
}

impl Ingestion {
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Wait until the client's connection ends and its registration is released.
    pub async fn finished(self) {
        if let Err(e) = self.handle.await {
            warn!(client_id = %self.client, error = %e, "ingestion task failed");
        }
    }
}

/// Per-instance connection manager.
///
/// Holds the locally connected clients and channel memberships behind a
/// single lock, and resolves every delivery: local connection first, then
/// the routing table and broker, then persistence.
pub struct Manager {
    instance_id: InstanceId,
    state: RwLock<LocalState>,
    routing: Arc<dyn RoutingTable>,
    pub(crate) broker: Arc<dyn Broker>,
    persistence: Arc<dyn Persistence>,
    groups: Arc<dyn GroupDelivery>,
    queue: mpsc::Sender<Envelope>,
    next_session: AtomicU64,
    pub(crate) dispatcher_running: AtomicBool,
    pub(crate) stats: ManagerStats,
}

impl Manager {
    /// Build a manager and the receiving end of its dispatch queue.
    /// Hand the receiver to [`Manager::start`].
    pub fn new(
        instance_id: InstanceId,
        routing: Arc<dyn RoutingTable>,
        broker: Arc<dyn Broker>,
        config: ManagerConfig,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let manager = Self {
            instance_id,
            state: RwLock::new(LocalState::default()),
            routing,
            broker,
            persistence: Arc::new(LogPersistence),
            groups: Arc::new(UnsupportedGroups),
            queue,
            next_session: AtomicU64::new(1),
            dispatcher_running: AtomicBool::new(false),
            stats: ManagerStats::default(),
        };
        (manager, rx)
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_group_delivery(mut self, groups: Arc<dyn GroupDelivery>) -> Self {
        self.groups = groups;
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn dispatcher_running(&self) -> bool {
        self.dispatcher_running.load(Ordering::Relaxed)
    }

    pub fn is_managed(&self, client: &ClientId) -> bool {
        self.state.read().clients.contains_key(client)
    }

    pub fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    /// Locally managed identities, sorted.
    pub fn managed_clients(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.state.read().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn connection(&self, client: &ClientId) -> Option<Arc<dyn Connection>> {
        self.state
            .read()
            .clients
            .get(client)
            .map(|r| Arc::clone(&r.client.conn))
    }

    /// Take ownership of `client` and start reading from its connection.
    ///
    /// The client becomes locally visible before ownership is advertised in
    /// the routing table, so nothing addressed to it can be routed back here
    /// while it is still missing from the local map. If the table write
    /// fails the local entry is rolled back and the connection is left open
    /// for the caller to deal with. A connection this call replaced stays
    /// closed, so its route is withdrawn as well.
    pub async fn register(self: &Arc<Self>, client: Client) -> Result<Ingestion, ManagerError> {
        let id = client.id.clone();
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);

        let previous = self.state.write().clients.insert(
            id.clone(),
            Registration {
                client: client.clone(),
                session,
            },
        );
        let replaced = previous.is_some();
        if let Some(previous) = previous {
            info!(client_id = %id, "client reconnected, closing previous connection");
            previous.client.conn.close().await;
        }

        if let Err(source) = self.routing.set(&id, &self.instance_id).await {
            let rolled_back = {
                let mut state = self.state.write();
                if state.clients.get(&id).map(|r| r.session) == Some(session) {
                    state.clients.remove(&id);
                    for members in state.channels.values_mut() {
                        members.remove(&id);
                    }
                    true
                } else {
                    false
                }
            };
            if rolled_back && replaced {
                self.withdraw_route(&id).await;
            }
            warn!(client_id = %id, error = %source, "registration failed");
            return Err(ManagerError::Registration { client: id, source });
        }

        info!(client_id = %id, instance_id = %self.instance_id, session, "client registered");

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.ingest(client, session).await });

        Ok(Ingestion {
            client: id,
            session,
            handle,
        })
    }

    /// Client ingestion pipeline: connection → dispatch queue, in order.
    async fn ingest(&self, client: Client, session: u64) {
        loop {
            match client.conn.receive().await {
                Ok(envelope) => {
                    if self.queue.send(envelope).await.is_err() {
                        warn!(client_id = %client.id, "dispatch queue closed, ending ingestion");
                        break;
                    }
                    ManagerStats::bump(&self.stats.enqueued);
                }
                Err(ConnectionError::StreamClosed) => {
                    debug!(client_id = %client.id, "connection closed");
                    break;
                }
                Err(e) => {
                    warn!(client_id = %client.id, error = %e, "read failed, ending ingestion");
                    break;
                }
            }
        }

        if let Err(e) = self.release(&client.id, session).await {
            warn!(client_id = %client.id, error = %e, "release after disconnect incomplete");
        }
    }

    /// Log out `client` unless a newer registration has replaced `session`.
    async fn release(&self, client: &ClientId, session: u64) -> Result<(), ManagerError> {
        let current = self.state.read().clients.get(client).map(|r| r.session);
        if current != Some(session) {
            debug!(client_id = %client, session, "stale session, leaving registration alone");
            return Ok(());
        }
        self.teardown(client, Some(session)).await
    }

    /// Drop `client` from this instance and from the routing table.
    ///
    /// Always runs every step: local map and channel removal, table delete,
    /// connection close. A table failure is reported after the rest is done.
    /// Logging out an identity that is not connected here is not an error.
    pub async fn logout(&self, client: &ClientId) -> Result<(), ManagerError> {
        self.teardown(client, None).await
    }

    async fn teardown(&self, client: &ClientId, session: Option<u64>) -> Result<(), ManagerError> {
        let removed = {
            let mut state = self.state.write();
            let owned = match session {
                Some(s) => state.clients.get(client).map(|r| r.session) == Some(s),
                None => true,
            };
            if owned {
                let removed = state.clients.remove(client);
                for members in state.channels.values_mut() {
                    members.remove(client);
                }
                removed
            } else {
                None
            }
        };

        // A released session only withdraws a route this instance still
        // owns; the client may have moved on to another instance.
        let table_result = match session {
            Some(_) => self.routing.delete_if_owner(client, &self.instance_id).await,
            None => self.routing.delete(client).await,
        };
        self.readvertise_if_managed(client).await;

        match removed {
            Some(registration) => {
                registration.client.conn.close().await;
                info!(client_id = %client, session = registration.session, "client logged out");
            }
            None => info!(client_id = %client, "client already gone"),
        }

        table_result.map_err(ManagerError::from)
    }

    /// Best-effort removal of this instance's own route for `client`.
    async fn withdraw_route(&self, client: &ClientId) {
        if let Err(e) = self.routing.delete_if_owner(client, &self.instance_id).await {
            warn!(client_id = %client, error = %e, "failed to withdraw route");
        }
        self.readvertise_if_managed(client).await;
    }

    /// A fresh registration may have advertised between a local removal and
    /// the table delete; put its entry back.
    async fn readvertise_if_managed(&self, client: &ClientId) {
        if self.is_managed(client) {
            if let Err(e) = self.routing.set(client, &self.instance_id).await {
                warn!(client_id = %client, error = %e, "failed to restore route for reconnected client");
            }
        }
    }

    /// Push an envelope onto the dispatch queue, waiting for room.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), ManagerError> {
        self.queue
            .send(envelope)
            .await
            .map_err(|_| ManagerError::QueueClosed)?;
        ManagerStats::bump(&self.stats.enqueued);
        Ok(())
    }

    /// Deliver one envelope to its recipient wherever it is connected.
    pub async fn deliver(&self, envelope: &Envelope) -> Result<Delivery, ManagerError> {
        if let Some(conn) = self.connection(&envelope.to) {
            conn.send(envelope)
                .await
                .map_err(|source| ManagerError::Connection {
                    client: envelope.to.clone(),
                    source,
                })?;
            ManagerStats::bump(&self.stats.delivered_local);
            return Ok(Delivery::Local);
        }

        match self.routing.get(&envelope.to).await {
            Ok(owner) if owner == self.instance_id => {
                warn!(client_id = %envelope.to, "route points at this instance but client is not connected");
                self.persist(envelope).await;
                Ok(Delivery::Persisted)
            }
            Ok(owner) => {
                self.broker.publish(&owner, envelope).await?;
                ManagerStats::bump(&self.stats.forwarded);
                debug!(client_id = %envelope.to, owner = %owner, kind = %envelope.kind, "forwarded");
                Ok(Delivery::Forwarded(owner))
            }
            Err(RoutingError::UnknownClient(_)) => {
                self.persist(envelope).await;
                Ok(Delivery::Persisted)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, envelope: &Envelope) {
        self.persistence.persist(envelope).await;
        ManagerStats::bump(&self.stats.persisted);
    }

    /// Write `envelope` to every locally managed client.
    ///
    /// Returns how many writes succeeded. A failed write does not stop the
    /// remaining ones; failures are collected into the error.
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<usize, ManagerError> {
        let targets: Vec<(ClientId, Arc<dyn Connection>)> = self
            .state
            .read()
            .clients
            .iter()
            .map(|(id, r)| (id.clone(), Arc::clone(&r.client.conn)))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, conn) in targets {
            match conn.send(envelope).await {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((id, e)),
            }
        }
        self.stats.delivered_local.fetch_add(delivered as u64, Ordering::Relaxed);

        if failed.is_empty() {
            Ok(delivered)
        } else {
            Err(ManagerError::Broadcast { delivered, failed })
        }
    }

    pub(crate) async fn deliver_group(&self, envelope: &Envelope) -> Result<(), ManagerError> {
        self.groups
            .deliver_group(envelope)
            .await
            .map_err(|reason| ManagerError::Capability {
                kind: envelope.kind,
                reason,
            })
    }

    pub(crate) async fn deliver_channel(&self, envelope: &Envelope) -> Result<(), ManagerError> {
        self.groups
            .deliver_channel(envelope)
            .await
            .map_err(|reason| ManagerError::Capability {
                kind: envelope.kind,
                reason,
            })
    }

    /// Add `client` to `channel`. Returns false if it was already a member.
    pub fn join_channel(&self, channel: &ChannelId, client: &ClientId) -> bool {
        self.state
            .write()
            .channels
            .entry(channel.clone())
            .or_default()
            .insert(client.clone())
    }

    pub fn leave_channel(&self, channel: &ChannelId, client: &ClientId) -> bool {
        let mut state = self.state.write();
        let Some(members) = state.channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(client);
        if members.is_empty() {
            state.channels.remove(channel);
        }
        removed
    }

    /// Members of `channel`, sorted. Empty for an unknown channel.
    pub fn channel_members(&self, channel: &ChannelId) -> Vec<ClientId> {
        let mut members: Vec<ClientId> = self
            .state
            .read()
            .channels
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }
}
