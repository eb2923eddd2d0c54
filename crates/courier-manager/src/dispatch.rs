use tracing::{debug, warn};

use courier_core::envelope::{payload_preview, Envelope, EnvelopeKind};
use courier_core::ids::ClientId;

use crate::error::ManagerError;
use crate::manager::Manager;
use crate::stats::ManagerStats;

/// What dispatch does with one envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Hand the envelope to `deliver`.
    Deliver(Envelope),
    /// Deliver the acknowledgement, then log the client out.
    DeliverThenLogout(Envelope, ClientId),
    Broadcast(Envelope),
    Group(Envelope),
    Channel(Envelope),
}

/// Classify `envelope` by kind. `sender_managed` says whether its sender is
/// connected to this instance.
///
/// Replies generated by a manager arrive here when another instance forwards
/// them; they go straight to their addressee.
pub fn plan(envelope: Envelope, sender_managed: bool) -> Plan {
    if envelope.from == ClientId::server() {
        return Plan::Deliver(envelope);
    }
    let sender = envelope.from.clone();
    match envelope.kind {
        EnvelopeKind::Register if sender_managed => {
            Plan::Deliver(Envelope::reply(EnvelopeKind::Register, "register success", sender))
        }
        EnvelopeKind::Register => {
            Plan::Deliver(Envelope::reply(EnvelopeKind::Register, "failed register", sender))
        }
        EnvelopeKind::Logout if sender_managed => Plan::DeliverThenLogout(
            Envelope::reply(EnvelopeKind::Echo, "logged out", sender.clone()),
            sender,
        ),
        EnvelopeKind::Logout => Plan::Deliver(Envelope::reply(
            EnvelopeKind::Echo,
            "logged out unmanaged client",
            sender,
        )),
        EnvelopeKind::Heartbeat => {
            Plan::Deliver(Envelope::reply(EnvelopeKind::Heartbeat, "health", sender))
        }
        EnvelopeKind::DirectMessage => Plan::Deliver(envelope),
        EnvelopeKind::Group => Plan::Group(envelope),
        EnvelopeKind::Channel => Plan::Channel(envelope),
        EnvelopeKind::Broadcast => Plan::Broadcast(envelope),
        EnvelopeKind::Echo => Plan::Deliver(envelope.redirect_to_sender()),
        EnvelopeKind::Unknown => Plan::Deliver(Envelope::reply(
            EnvelopeKind::Echo,
            "format err, can't parse",
            sender,
        )),
    }
}

impl Manager {
    /// Run one envelope through the state machine.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<(), ManagerError> {
        let sender_managed = self.is_managed(&envelope.from);
        match plan(envelope, sender_managed) {
            Plan::Deliver(out) => self.deliver(&out).await.map(|_| ()),
            Plan::DeliverThenLogout(ack, client) => {
                let delivered = self.deliver(&ack).await.map(|_| ());
                let logged_out = self.logout(&client).await;
                delivered.and(logged_out)
            }
            Plan::Broadcast(out) => self.broadcast(&out).await.map(|_| ()),
            Plan::Group(out) => self.deliver_group(&out).await,
            Plan::Channel(out) => self.deliver_channel(&out).await,
        }
    }

    /// Dispatch and absorb the outcome. Failures are logged and counted; the
    /// queue keeps draining.
    pub(crate) async fn handle(&self, envelope: Envelope) {
        let kind = envelope.kind;
        let from = envelope.from.clone();
        let to = envelope.to.clone();
        let preview = payload_preview(&envelope.payload, 64);
        let size = envelope.payload.len();

        match self.dispatch(envelope).await {
            Ok(()) => {
                ManagerStats::bump(&self.stats.dispatched);
                debug!(%kind, %from, %to, "dispatched");
            }
            Err(e) => {
                ManagerStats::bump(&self.stats.failures);
                warn!(
                    %kind,
                    %from,
                    %to,
                    payload_size = size,
                    payload = %preview,
                    error_kind = e.error_kind(),
                    error = %e,
                    "dispatch failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::connection::Client;
    use courier_core::errors::RoutingError;
    use courier_core::ids::InstanceId;
    use courier_core::routing::RoutingTable;
    use courier_core::testing::{MemoryExchange, MemoryRoutingTable, MockConnection, RecordingPersistence};

    use super::*;
    use crate::manager::ManagerConfig;

    fn env(kind: EnvelopeKind, from: &str, to: &str) -> Envelope {
        Envelope::new(kind, "body", ClientId::from_raw(from), ClientId::from_raw(to))
    }

    fn payload(plan: &Plan) -> &[u8] {
        match plan {
            Plan::Deliver(e) | Plan::DeliverThenLogout(e, _) => &e.payload[..],
            Plan::Broadcast(e) | Plan::Group(e) | Plan::Channel(e) => &e.payload[..],
        }
    }

    #[test]
    fn register_reply_depends_on_management() {
        let ok = plan(env(EnvelopeKind::Register, "u", "server"), true);
        assert_eq!(payload(&ok), b"register success");
        let failed = plan(env(EnvelopeKind::Register, "u", "server"), false);
        assert_eq!(payload(&failed), b"failed register");

        let Plan::Deliver(reply) = failed else {
            panic!("expected a reply");
        };
        assert_eq!(reply.kind, EnvelopeKind::Register);
        assert_eq!(reply.from, ClientId::server());
        assert_eq!(reply.to, ClientId::from_raw("u"));
    }

    #[test]
    fn logout_of_managed_sender_acks_then_logs_out() {
        let p = plan(env(EnvelopeKind::Logout, "u", "server"), true);
        match p {
            Plan::DeliverThenLogout(ack, client) => {
                assert_eq!(ack.kind, EnvelopeKind::Echo);
                assert_eq!(&ack.payload[..], b"logged out");
                assert_eq!(client, ClientId::from_raw("u"));
            }
            other => panic!("unexpected plan {other:?}"),
        }

        let p = plan(env(EnvelopeKind::Logout, "u", "server"), false);
        assert_eq!(payload(&p), b"logged out unmanaged client");
    }

    #[test]
    fn heartbeat_answers_regardless_of_registration() {
        for managed in [true, false] {
            let p = plan(env(EnvelopeKind::Heartbeat, "u", "server"), managed);
            let Plan::Deliver(reply) = p else {
                panic!("expected a reply");
            };
            assert_eq!(reply.kind, EnvelopeKind::Heartbeat);
            assert_eq!(&reply.payload[..], b"health");
            assert_eq!(reply.to, ClientId::from_raw("u"));
        }
    }

    #[test]
    fn pass_through_kinds() {
        let dm = env(EnvelopeKind::DirectMessage, "a", "b");
        assert_eq!(plan(dm.clone(), false), Plan::Deliver(dm));

        let echo = plan(env(EnvelopeKind::Echo, "a", "b"), true);
        let Plan::Deliver(back) = echo else {
            panic!("expected delivery");
        };
        assert_eq!(back.to, ClientId::from_raw("a"));
        assert_eq!(&back.payload[..], b"body");

        assert!(matches!(plan(env(EnvelopeKind::Broadcast, "a", "*"), true), Plan::Broadcast(_)));
        assert!(matches!(plan(env(EnvelopeKind::Group, "a", "g"), true), Plan::Group(_)));
        assert!(matches!(plan(env(EnvelopeKind::Channel, "a", "c"), true), Plan::Channel(_)));
    }

    #[test]
    fn server_replies_are_delivered_unchanged() {
        for reply in [
            Envelope::reply(EnvelopeKind::Heartbeat, "health", ClientId::from_raw("u")),
            Envelope::reply(EnvelopeKind::Register, "register success", ClientId::from_raw("u")),
            Envelope::reply(EnvelopeKind::Echo, "format err, can't parse", ClientId::from_raw("u")),
        ] {
            assert_eq!(plan(reply.clone(), false), Plan::Deliver(reply));
        }
    }

    #[test]
    fn unknown_kind_gets_format_error() {
        let p = plan(env(EnvelopeKind::Unknown, "a", "b"), true);
        let Plan::Deliver(reply) = p else {
            panic!("expected a reply");
        };
        assert_eq!(reply.kind, EnvelopeKind::Echo);
        assert_eq!(&reply.payload[..], b"format err, can't parse");
        assert_eq!(reply.to, ClientId::from_raw("a"));
    }

    fn manager() -> (Arc<Manager>, Arc<MemoryRoutingTable>, Arc<RecordingPersistence>) {
        let routing = MemoryRoutingTable::new();
        let exchange = MemoryExchange::new();
        let persistence = RecordingPersistence::new();
        let instance = InstanceId::from_raw("inst_local");
        let (manager, _rx) = Manager::new(
            instance.clone(),
            routing.clone(),
            exchange.broker(instance),
            ManagerConfig::default(),
        );
        let manager = manager.with_persistence(persistence.clone());
        (Arc::new(manager), routing, persistence)
    }

    async fn connect(manager: &Arc<Manager>, id: &str) -> Arc<MockConnection> {
        let conn = MockConnection::new();
        manager
            .register(Client::new(ClientId::from_raw(id), conn.clone()))
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn logout_message_acks_then_removes_client() {
        let (manager, routing, _) = manager();
        let conn = connect(&manager, "u").await;

        manager.dispatch(env(EnvelopeKind::Logout, "u", "server")).await.unwrap();

        let sent = conn.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].payload[..], b"logged out");
        assert!(!manager.is_managed(&ClientId::from_raw("u")));
        assert!(routing.get(&ClientId::from_raw("u")).await.unwrap_err().is_unknown_client());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn heartbeat_from_unregistered_sender_is_persisted() {
        let (manager, _, persistence) = manager();

        manager.dispatch(env(EnvelopeKind::Heartbeat, "ghost", "server")).await.unwrap();

        let saved = persistence.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].kind, EnvelopeKind::Heartbeat);
        assert_eq!(saved[0].to, ClientId::from_raw("ghost"));
    }

    #[tokio::test]
    async fn echo_round_trips_to_sender() {
        let (manager, _, _) = manager();
        let conn = connect(&manager, "a").await;

        manager.dispatch(env(EnvelopeKind::Echo, "a", "b")).await.unwrap();

        let sent = conn.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeKind::Echo);
        assert_eq!(&sent[0].payload[..], b"body");
    }

    #[tokio::test]
    async fn handle_counts_failures_and_keeps_going() {
        let (manager, routing, _) = manager();
        routing.fail_reads(true);

        manager.handle(env(EnvelopeKind::DirectMessage, "a", "remote")).await;
        assert_eq!(manager.stats().failures, 1);

        routing.fail_reads(false);
        manager.handle(env(EnvelopeKind::DirectMessage, "a", "remote")).await;
        let stats = manager.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.persisted, 1);
    }

    #[tokio::test]
    async fn routing_error_surfaces_from_dispatch() {
        let (manager, routing, _) = manager();
        routing.fail_reads(true);

        let err = manager
            .dispatch(env(EnvelopeKind::DirectMessage, "a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Routing(RoutingError::Store(_))));
    }
}
