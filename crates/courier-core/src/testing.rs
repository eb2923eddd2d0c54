//! In-process doubles for the connection, routing and broker seams.
//!
//! Deterministic stand-ins for tests; none of them touch the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::broker::{Broker, EnvelopeStream};
use crate::capabilities::Persistence;
use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::errors::{BrokerError, ConnectionError, RoutingError};
use crate::ids::{ClientId, InstanceId};
use crate::routing::RoutingTable;

type Inbound = Result<Envelope, ConnectionError>;

/// Scripted connection: tests push inbound envelopes and inspect writes.
pub struct MockConnection {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    sent: Mutex<Vec<Envelope>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        })
    }

    /// Queue an envelope for the next `receive`.
    pub fn push(&self, envelope: Envelope) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(Ok(envelope));
        }
    }

    /// Queue a read error for the next `receive`.
    pub fn push_error(&self, error: ConnectionError) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(Err(error));
        }
    }

    /// End the inbound stream once the queued items are read.
    pub fn hang_up(&self) {
        self.inbound_tx.lock().take();
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn receive(&self) -> Result<Envelope, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::StreamClosed);
        }
        match self.inbound_rx.lock().await.recv().await {
            Some(item) => item,
            None => Err(ConnectionError::StreamClosed),
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::WriteFailure("connection closed".into()));
        }
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(ConnectionError::WriteFailure("injected write failure".into()));
        }
        self.sent.lock().push(envelope.clone());
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::Relaxed);
        self.closed.store(true, Ordering::Relaxed);
        self.hang_up();
    }
}

/// Routing table held in process memory.
#[derive(Default)]
pub struct MemoryRoutingTable {
    entries: Mutex<HashMap<ClientId, InstanceId>>,
    fail_writes: AtomicBool,
    fail_sets: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryRoutingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Fail `set` only; deletes keep working.
    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::Relaxed);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl RoutingTable for MemoryRoutingTable {
    async fn set(&self, client: &ClientId, instance: &InstanceId) -> Result<(), RoutingError> {
        if self.fail_writes.load(Ordering::Relaxed) || self.fail_sets.load(Ordering::Relaxed) {
            return Err(RoutingError::Store("injected write failure".into()));
        }
        self.entries.lock().insert(client.clone(), instance.clone());
        Ok(())
    }

    async fn get(&self, client: &ClientId) -> Result<InstanceId, RoutingError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(RoutingError::Store("injected read failure".into()));
        }
        self.entries
            .lock()
            .get(client)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownClient(client.clone()))
    }

    async fn delete(&self, client: &ClientId) -> Result<(), RoutingError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(RoutingError::Store("injected write failure".into()));
        }
        self.entries.lock().remove(client);
        Ok(())
    }

    async fn delete_if_owner(&self, client: &ClientId, instance: &InstanceId) -> Result<(), RoutingError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(RoutingError::Store("injected write failure".into()));
        }
        let mut entries = self.entries.lock();
        if entries.get(client) == Some(instance) {
            entries.remove(client);
        }
        Ok(())
    }
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

/// In-memory direct exchange shared by several [`MemoryBroker`]s.
#[derive(Default)]
pub struct MemoryExchange {
    queues: Mutex<HashMap<InstanceId, MemoryQueue>>,
    published: Mutex<Vec<(InstanceId, Envelope)>>,
    down: AtomicBool,
}

impl MemoryExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Broker handle bound to `instance`'s queue.
    pub fn broker(self: &Arc<Self>, instance: InstanceId) -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker {
            exchange: Arc::clone(self),
            instance,
            fail_consume: AtomicBool::new(false),
        })
    }

    /// Every publish accepted so far, in order.
    pub fn published(&self) -> Vec<(InstanceId, Envelope)> {
        self.published.lock().clone()
    }

    /// Drop the transport: publishes fail and open streams end.
    pub fn sever(&self) {
        self.down.store(true, Ordering::Relaxed);
        self.queues.lock().clear();
    }

    fn receiver(&self, instance: &InstanceId) -> Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(instance.clone()).or_insert_with(MemoryQueue::new);
        Arc::clone(&queue.rx)
    }
}

pub struct MemoryBroker {
    exchange: Arc<MemoryExchange>,
    instance: InstanceId,
    fail_consume: AtomicBool,
}

impl MemoryBroker {
    pub fn fail_consume(&self, fail: bool) {
        self.fail_consume.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, target: &InstanceId, envelope: &Envelope) -> Result<(), BrokerError> {
        if self.exchange.down.load(Ordering::Relaxed) {
            return Err(BrokerError::PublishFailure("exchange unreachable".into()));
        }
        let mut queues = self.exchange.queues.lock();
        let queue = queues.entry(target.clone()).or_insert_with(MemoryQueue::new);
        queue
            .tx
            .send(envelope.clone())
            .map_err(|e| BrokerError::PublishFailure(e.to_string()))?;
        self.exchange.published.lock().push((target.clone(), envelope.clone()));
        Ok(())
    }

    async fn consume(&self) -> Result<EnvelopeStream, BrokerError> {
        if self.fail_consume.load(Ordering::Relaxed) || self.exchange.down.load(Ordering::Relaxed) {
            return Err(BrokerError::ConsumeFailure("exchange unreachable".into()));
        }
        let rx = self.exchange.receiver(&self.instance);
        let stream = futures::stream::unfold(rx, |rx| async move {
            let next = rx.lock().await.recv().await;
            next.map(|envelope| (envelope, rx))
        });
        Ok(Box::pin(stream))
    }
}

/// Persistence double that remembers what it was handed.
#[derive(Default)]
pub struct RecordingPersistence {
    saved: Mutex<Vec<Envelope>>,
}

impl RecordingPersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn saved(&self) -> Vec<Envelope> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl Persistence for RecordingPersistence {
    async fn persist(&self, envelope: &Envelope) {
        self.saved.lock().push(envelope.clone());
    }
}
