use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use courier_core::broker::EnvelopeStream;
use courier_core::envelope::Envelope;

use crate::error::ManagerError;
use crate::manager::Manager;

/// Running dispatch and broker-ingestion pipelines of one manager.
pub struct ManagerHandle {
    manager: Arc<Manager>,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    dispatcher: JoinHandle<()>,
    broker_ingestion: JoinHandle<()>,
}

impl ManagerHandle {
    /// Resolves once the manager can no longer route: its broker stream
    /// ended or broker envelopes could not be queued. A requested shutdown
    /// never trips it.
    pub async fn fatal(&self) {
        self.fatal.cancelled().await;
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_cancelled()
    }

    pub fn dispatcher_alive(&self) -> bool {
        self.manager.dispatcher_running()
    }

    /// Stop both pipelines and wait for them. Client ingestion tasks end on
    /// their own when their connections close.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "dispatcher task failed");
        }
        if let Err(e) = self.broker_ingestion.await {
            warn!(error = %e, "broker ingestion task failed");
        }
        info!(instance_id = %self.manager.instance_id(), "manager stopped");
    }
}

impl Manager {
    /// Open this instance's broker queue and spawn the dispatch and
    /// broker-ingestion pipelines.
    ///
    /// Fails if the broker queue cannot be consumed; nothing is spawned then.
    pub async fn start(self: &Arc<Self>, rx: mpsc::Receiver<Envelope>) -> Result<ManagerHandle, ManagerError> {
        let stream = self.broker.consume().await?;

        let shutdown = CancellationToken::new();
        let fatal = CancellationToken::new();

        self.dispatcher_running.store(true, Ordering::Relaxed);
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(self), rx, shutdown.clone()));
        let broker_ingestion = tokio::spawn(run_broker_ingestion(
            Arc::clone(self),
            stream,
            shutdown.clone(),
            fatal.clone(),
        ));

        info!(instance_id = %self.instance_id(), "manager started");

        Ok(ManagerHandle {
            manager: Arc::clone(self),
            shutdown,
            fatal,
            dispatcher,
            broker_ingestion,
        })
    }
}

/// The manager owns the queue's sender, so `recv` only ends through shutdown.
async fn run_dispatcher(manager: Arc<Manager>, mut rx: mpsc::Receiver<Envelope>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(envelope) = rx.recv() => manager.handle(envelope).await,
        }
    }
    manager.dispatcher_running.store(false, Ordering::Relaxed);
}

async fn run_broker_ingestion(
    manager: Arc<Manager>,
    mut stream: EnvelopeStream,
    shutdown: CancellationToken,
    fatal: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(envelope) => {
                    if let Err(e) = manager.enqueue(envelope).await {
                        // The dispatcher dropped the queue on its way out.
                        if shutdown.is_cancelled() {
                            break;
                        }
                        error!(error = %e, "cannot enqueue broker message");
                        fatal.cancel();
                        break;
                    }
                }
                None => {
                    error!(instance_id = %manager.instance_id(), "broker stream ended");
                    fatal.cancel();
                    break;
                }
            },
        }
    }
}
