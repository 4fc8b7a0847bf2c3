//! Admission gate for inbound realtime events.
//!
//! The transport (socket server, room fan-out) stays outside this crate. It
//! hands each inbound event to [`RealtimeGate::check`] together with the
//! sending connection, and forwards the event only on
//! [`GateDecision::Forward`]. Rejected events are dropped, never queued, and
//! the sender is told why through a [`ConnectionNotifier`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;
use tandem_ratelimit::Admission;
use tandem_ratelimit::TokenBucket;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::identity::peer_identity;
use crate::identity::user_identity;

/// Notification pushed to the connection whose event was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RealtimeNotification {
    RateLimited { scope: String, retry_after_seconds: f64 },
    Unavailable { scope: String },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum NotifyError {
    #[snafu(display("connection {connection_id} is not registered"))]
    UnknownConnection { connection_id: String },

    #[snafu(display("connection {connection_id} is closed"))]
    ConnectionClosed { connection_id: String },
}

/// Delivers notifications to one connection of the realtime transport.
#[async_trait]
pub trait ConnectionNotifier: Send + Sync {
    async fn notify(&self, connection_id: &str, notification: RealtimeNotification) -> Result<(), NotifyError>;
}

/// What the transport knows about the sender of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub connection_id: String,
    /// Authenticated principal, if the connection has one.
    pub user_id: Option<String>,
    pub peer: Option<IpAddr>,
}

impl ClientInfo {
    /// Limiter identity: principal first, then peer address.
    pub fn identity(&self) -> Option<String> {
        self.user_id.as_deref().and_then(user_identity).or_else(|| self.peer.map(peer_identity))
    }
}

/// Why an event was not forwarded.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    RateLimited { retry_after_seconds: f64 },
    Unavailable,
    /// No usable identity for the sender.
    Unidentified,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision<E> {
    Forward(E),
    Dropped(DropReason),
}

impl<E> GateDecision<E> {
    pub fn into_event(self) -> Option<E> {
        match self {
            GateDecision::Forward(event) => Some(event),
            GateDecision::Dropped(_) => None,
        }
    }
}

/// Rate limits one kind of realtime event (for example `sendMessage`) under one scope.
pub struct RealtimeGate {
    limiter: Arc<TokenBucket>,
    scope: String,
    notifier: Arc<dyn ConnectionNotifier>,
}

impl RealtimeGate {
    pub fn new(limiter: Arc<TokenBucket>, scope: impl Into<String>, notifier: Arc<dyn ConnectionNotifier>) -> Self {
        Self {
            limiter,
            scope: scope.into(),
            notifier,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Decide whether `event` from `client` is forwarded.
    pub async fn check<E>(&self, client: &ClientInfo, event: E) -> GateDecision<E> {
        let Some(identity) = client.identity() else {
            debug!(connection_id = %client.connection_id, "dropping event from unidentified connection");
            return GateDecision::Dropped(DropReason::Unidentified);
        };

        match self.limiter.admit(&self.scope, &identity).await {
            Admission::Allowed { .. } | Admission::FailedOpen { .. } => GateDecision::Forward(event),
            Admission::Denied { retry_after_seconds } => {
                self.send(client, RealtimeNotification::RateLimited {
                    scope: self.scope.clone(),
                    retry_after_seconds,
                })
                .await;
                GateDecision::Dropped(DropReason::RateLimited { retry_after_seconds })
            }
            Admission::FailedClosed { .. } => {
                self.send(client, RealtimeNotification::Unavailable {
                    scope: self.scope.clone(),
                })
                .await;
                GateDecision::Dropped(DropReason::Unavailable)
            }
            Admission::Rejected { .. } => GateDecision::Dropped(DropReason::Unidentified),
        }
    }

    async fn send(&self, client: &ClientInfo, notification: RealtimeNotification) {
        // The event is dropped either way; a lost notification is only logged.
        if let Err(e) = self.notifier.notify(&client.connection_id, notification).await {
            warn!(connection_id = %client.connection_id, error = %e, "failed to notify connection");
        }
    }
}

/// Notifier backed by one unbounded channel per registered connection.
///
/// The transport registers a connection when it opens, drains the receiver
/// into the socket, and unregisters on close.
#[derive(Default)]
pub struct ChannelNotifier {
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<RealtimeNotification>>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: impl Into<String>) -> mpsc::UnboundedReceiver<RealtimeNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().insert(connection_id.into(), tx);
        rx
    }

    pub fn unregister(&self, connection_id: &str) -> bool {
        self.connections.write().remove(connection_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[async_trait]
impl ConnectionNotifier for ChannelNotifier {
    async fn notify(&self, connection_id: &str, notification: RealtimeNotification) -> Result<(), NotifyError> {
        let sender = self.connections.read().get(connection_id).cloned().ok_or_else(|| {
            NotifyError::UnknownConnection {
                connection_id: connection_id.to_string(),
            }
        })?;
        sender.send(notification).map_err(|_| NotifyError::ConnectionClosed {
            connection_id: connection_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tandem_kv::DeterministicKeyValueStore;
    use tandem_kv::FaultInjectingStore;
    use tandem_kv::FaultMode;
    use tandem_ratelimit::BucketStore;
    use tandem_ratelimit::CasBucketStore;
    use tandem_ratelimit::FailurePolicy;
    use tandem_ratelimit::LocalBucketStore;
    use tandem_ratelimit::TokenBucketConfig;
    use tandem_time::SimulatedTimeProvider;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct SendMessage {
        text: String,
    }

    fn message(text: &str) -> SendMessage {
        SendMessage { text: text.to_string() }
    }

    fn client(connection_id: &str, user_id: Option<&str>) -> ClientInfo {
        ClientInfo {
            connection_id: connection_id.to_string(),
            user_id: user_id.map(str::to_string),
            peer: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
    }

    fn chat_gate(capacity: u64) -> (RealtimeGate, Arc<ChannelNotifier>, SimulatedTimeProvider) {
        let time = SimulatedTimeProvider::new(5_000_000);
        let store: Arc<dyn BucketStore> = Arc::new(LocalBucketStore::new());
        let limiter =
            TokenBucket::with_time_provider(store, TokenBucketConfig::new(capacity, 0.5), Arc::new(time.clone()))
                .unwrap();
        let notifier = Arc::new(ChannelNotifier::new());
        let gate = RealtimeGate::new(Arc::new(limiter), "chat-send", notifier.clone());
        (gate, notifier, time)
    }

    #[test]
    fn notification_wire_format() {
        let json = serde_json::to_value(RealtimeNotification::RateLimited {
            scope: "chat-send".into(),
            retry_after_seconds: 2.0,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({
            "event": "rate_limited",
            "scope": "chat-send",
            "retry_after_seconds": 2.0,
        }));

        let json = serde_json::to_value(RealtimeNotification::Unavailable {
            scope: "chat-send".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "event": "unavailable", "scope": "chat-send" }));
    }

    #[test]
    fn client_identity_prefers_user() {
        assert_eq!(client("c1", Some("42")).identity().as_deref(), Some("user:42"));
        assert_eq!(client("c1", None).identity().as_deref(), Some("ip:127.0.0.1"));
        let anonymous = ClientInfo {
            connection_id: "c1".into(),
            user_id: None,
            peer: None,
        };
        assert_eq!(anonymous.identity(), None);
    }

    #[tokio::test]
    async fn denied_event_is_dropped_and_sender_notified() {
        let (gate, notifier, _) = chat_gate(2);
        let mut inbox = notifier.register("c1");
        let sender = client("c1", Some("42"));

        assert_eq!(gate.check(&sender, message("hi")).await, GateDecision::Forward(message("hi")));
        assert!(gate.check(&sender, message("again")).await.into_event().is_some());

        let decision = gate.check(&sender, message("spam")).await;
        assert_eq!(decision, GateDecision::Dropped(DropReason::RateLimited {
            retry_after_seconds: 2.0
        }));
        assert_eq!(inbox.try_recv().unwrap(), RealtimeNotification::RateLimited {
            scope: "chat-send".into(),
            retry_after_seconds: 2.0,
        });
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_events_are_not_replayed_after_refill() {
        let (gate, notifier, time) = chat_gate(1);
        let _inbox = notifier.register("c1");
        let sender = client("c1", Some("42"));

        gate.check(&sender, message("one")).await;
        assert!(gate.check(&sender, message("two")).await.into_event().is_none());

        time.advance_secs(2);
        assert_eq!(gate.check(&sender, message("three")).await, GateDecision::Forward(message("three")));
    }

    #[tokio::test]
    async fn other_users_are_unaffected() {
        let (gate, notifier, _) = chat_gate(1);
        let _a = notifier.register("a");
        let mut b_inbox = notifier.register("b");

        gate.check(&client("a", Some("1")), message("x")).await;
        assert!(gate.check(&client("a", Some("1")), message("y")).await.into_event().is_none());

        assert!(gate.check(&client("b", Some("2")), message("z")).await.into_event().is_some());
        assert!(b_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_connection_still_drops() {
        let (gate, _, _) = chat_gate(1);
        let sender = client("gone", Some("42"));
        gate.check(&sender, message("x")).await;
        assert!(matches!(gate.check(&sender, message("y")).await, GateDecision::Dropped(DropReason::RateLimited { .. })));
    }

    fn outage_gate(policy: FailurePolicy) -> (RealtimeGate, Arc<ChannelNotifier>) {
        let kv = Arc::new(FaultInjectingStore::new(DeterministicKeyValueStore::new()));
        kv.set_mode(FaultMode::Unavailable {
            reason: "connection refused".into(),
        });
        let store: Arc<dyn BucketStore> = Arc::new(CasBucketStore::new(kv));
        let limiter = TokenBucket::new(store, TokenBucketConfig::new(10, 0.5).with_failure_policy(policy)).unwrap();
        let notifier = Arc::new(ChannelNotifier::new());
        (RealtimeGate::new(Arc::new(limiter), "chat-send", notifier.clone()), notifier)
    }

    #[tokio::test]
    async fn fail_closed_outage_drops_and_reports_unavailable() {
        let (gate, notifier) = outage_gate(FailurePolicy::Closed);
        let mut inbox = notifier.register("c1");

        let decision = gate.check(&client("c1", Some("42")), message("hi")).await;
        assert_eq!(decision, GateDecision::Dropped(DropReason::Unavailable));
        assert_eq!(inbox.try_recv().unwrap(), RealtimeNotification::Unavailable {
            scope: "chat-send".into()
        });
    }

    #[tokio::test]
    async fn fail_open_outage_forwards() {
        let (gate, notifier) = outage_gate(FailurePolicy::Open);
        let mut inbox = notifier.register("c1");

        let decision = gate.check(&client("c1", Some("42")), message("hi")).await;
        assert_eq!(decision, GateDecision::Forward(message("hi")));
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_receiver_is_reported() {
        let notifier = ChannelNotifier::new();
        drop(notifier.register("c1"));
        let err = notifier
            .notify("c1", RealtimeNotification::Unavailable {
                scope: "chat-send".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::ConnectionClosed { .. }));
        assert!(notifier.unregister("c1"));
        assert!(notifier.is_empty());
    }
}
