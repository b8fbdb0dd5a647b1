use std::collections::{BTreeSet, HashMap, HashSet};

use mesh_wire::{encode_topic_list, Alias, Role, TopicListFormat, WireMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::queue::{OutboundQueue, PushOutcome};
use crate::reporter::{PeerSnapshot, Snapshot};
use crate::subscription::SubscriptionIndex;

/// Which data channel a frame arrived on or should be sent on. Fan-out
/// keeps a message on the channel it arrived on end to end, per the
/// comm-server's backpressure rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Reliable,
    Unreliable,
}

struct PeerEntry {
    role: Role,
    reliable: OutboundQueue,
    unreliable: OutboundQueue,
    stop_tx: watch::Sender<bool>,
    is_authenticated: bool,
}

pub enum Command {
    Register {
        alias: Alias,
        role: Role,
        reliable: OutboundQueue,
        unreliable: OutboundQueue,
        stop_tx: watch::Sender<bool>,
        reply: oneshot::Sender<bool>,
    },
    SetAuthenticated {
        alias: Alias,
    },
    /// Set-replace a peer's topic subscriptions (§4.2 "set-replace, not
    /// delta"). The delta against the previous set is computed inside
    /// the central task, against its own [`SubscriptionIndex`].
    UpdateSubscriptions {
        alias: Alias,
        topics: HashSet<String>,
    },
    /// A `TOPIC` frame from an authenticated peer, ready to fan out.
    TopicMessage {
        from_alias: Alias,
        topic: String,
        body: Vec<u8>,
        channel: Channel,
    },
    PeerClosed {
        alias: Alias,
        reason: String,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

#[derive(Clone)]
pub struct CentralHandle {
    tx: mpsc::Sender<Command>,
}

impl CentralHandle {
    pub async fn register(
        &self,
        alias: Alias,
        role: Role,
        reliable: OutboundQueue,
        unreliable: OutboundQueue,
        stop_tx: watch::Sender<bool>,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Register {
                alias,
                role,
                reliable,
                unreliable,
                stop_tx,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn set_authenticated(&self, alias: Alias) {
        let _ = self.tx.send(Command::SetAuthenticated { alias }).await;
    }

    pub async fn update_subscriptions(&self, alias: Alias, topics: HashSet<String>) {
        let _ = self
            .tx
            .send(Command::UpdateSubscriptions { alias, topics })
            .await;
    }

    pub async fn topic_message(
        &self,
        from_alias: Alias,
        topic: String,
        body: Vec<u8>,
        channel: Channel,
    ) {
        let _ = self
            .tx
            .send(Command::TopicMessage {
                from_alias,
                topic,
                body,
                channel,
            })
            .await;
    }

    pub async fn peer_closed(&self, alias: Alias, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(Command::PeerClosed {
                alias,
                reason: reason.into(),
            })
            .await;
    }

    pub async fn snapshot(&self) -> Snapshot {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot { reply }).await.is_err() {
            return Snapshot::default();
        }
        rx.await.unwrap_or_default()
    }
}

/// The comm-server's registry: sole owner of connected peers and the
/// topic subscription index. Mirrors the coordinator's central task
/// shape, extended with the fan-out engine and the single-hop mesh rule.
pub struct Central {
    peers: HashMap<Alias, PeerEntry>,
    subscriptions: SubscriptionIndex,
}

impl Central {
    pub fn spawn() -> CentralHandle {
        let (tx, rx) = mpsc::channel(1024);
        let central = Central {
            peers: HashMap::new(),
            subscriptions: SubscriptionIndex::new(),
        };
        tokio::spawn(central.run(rx));
        CentralHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        info!("comm-server central task shutting down: command channel closed");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                alias,
                role,
                reliable,
                unreliable,
                stop_tx,
                reply,
            } => {
                if self.peers.contains_key(&alias) {
                    warn!(alias, "duplicate registration, rejecting");
                    let _ = reply.send(false);
                    return;
                }
                self.peers.insert(
                    alias,
                    PeerEntry {
                        role,
                        reliable,
                        unreliable,
                        stop_tx,
                        is_authenticated: false,
                    },
                );
                info!(alias, ?role, "remote peer registered");
                let _ = reply.send(true);
            }
            Command::SetAuthenticated { alias } => {
                let mut just_authenticated_server = false;
                if let Some(peer) = self.peers.get_mut(&alias) {
                    if !peer.is_authenticated {
                        peer.is_authenticated = true;
                        info!(alias, "remote peer authenticated");
                        just_authenticated_server = peer.role == Role::CommunicationServer;
                    }
                }
                if just_authenticated_server {
                    self.send_subscription_aggregate_to(alias);
                }
            }
            Command::UpdateSubscriptions { alias, topics } => {
                let Some(role) = self.peers.get(&alias).map(|peer| peer.role) else {
                    return;
                };
                self.subscriptions.replace(alias, topics);
                // Only a local client's subscriptions feed this server's
                // aggregate; a peer server's own TOPIC_SUBSCRIPTION push
                // already names its aggregate directly and must not be
                // relayed further (single-hop mesh rule, §4.2 step 5).
                if role != Role::CommunicationServer {
                    self.broadcast_subscription_aggregate();
                }
            }
            Command::TopicMessage {
                from_alias,
                topic,
                body,
                channel,
            } => {
                self.fan_out(from_alias, &topic, body, channel);
            }
            Command::PeerClosed { alias, reason } => {
                self.close_peer(alias, &reason);
            }
            Command::Snapshot { reply } => {
                let peers = self
                    .peers
                    .iter()
                    .map(|(alias, peer)| PeerSnapshot {
                        alias: *alias,
                        role: peer.role,
                        topics: self.subscriptions.topics_of(*alias).into_iter().collect(),
                    })
                    .collect();
                let _ = reply.send(Snapshot { peers });
            }
        }
    }

    /// Deliver one `TOPIC` frame to every subscriber except the sender,
    /// skipping server-to-server re-forwarding (§4.2 step 5: single-hop
    /// mesh, no re-forward of a server-sourced message onto the mesh).
    fn fan_out(&mut self, from_alias: Alias, topic: &str, body: Vec<u8>, channel: Channel) {
        let from_role = match self.peers.get(&from_alias) {
            Some(peer) if peer.is_authenticated => peer.role,
            _ => {
                debug!(from_alias, "topic message from unauthenticated/unknown peer, dropping");
                return;
            }
        };
        let subscribers = self.subscriptions.subscribers_of(topic);
        if subscribers.is_empty() {
            return;
        }
        let Ok(frame) = (WireMessage::Topic {
            from_alias,
            topic: topic.to_string(),
            body,
        })
        .encode() else {
            warn!(topic, "failed to encode topic frame for fan-out");
            return;
        };

        let mut overflowed = Vec::new();
        for &recipient in &subscribers {
            if recipient == from_alias {
                continue;
            }
            let Some(peer) = self.peers.get(&recipient) else {
                continue;
            };
            if from_role == Role::CommunicationServer && peer.role == Role::CommunicationServer {
                continue;
            }
            let queue = match channel {
                Channel::Reliable => &peer.reliable,
                Channel::Unreliable => &peer.unreliable,
            };
            match queue.push(frame.clone()) {
                PushOutcome::Enqueued => {}
                PushOutcome::DroppedOldest => {
                    debug!(alias = recipient, "unreliable queue full, dropped oldest frame");
                }
                PushOutcome::Rejected => {
                    warn!(alias = recipient, "reliable queue full, disconnecting peer");
                    overflowed.push(recipient);
                }
            }
        }
        for alias in overflowed {
            self.close_peer(alias, "reliable outbound queue overflow");
        }
    }

    fn close_peer(&mut self, alias: Alias, reason: &str) {
        let Some(peer) = self.peers.remove(&alias) else {
            return;
        };
        info!(alias, reason, "remote peer closed");
        self.subscriptions.remove_peer(alias);
        peer.reliable.close();
        peer.unreliable.close();
        let _ = peer.stop_tx.send(true);
        if peer.role != Role::CommunicationServer {
            self.broadcast_subscription_aggregate();
        }
    }

    /// Union of topics held by every locally-connected, non-server peer.
    /// This is what this server advertises to its peer comm-servers: the
    /// set of topics its own clients care about, never a peer server's
    /// own forwarded set (that would re-propagate past one hop).
    fn local_topic_aggregate(&self) -> BTreeSet<String> {
        let mut aggregate = BTreeSet::new();
        for (&alias, peer) in &self.peers {
            if peer.role != Role::CommunicationServer {
                aggregate.extend(self.subscriptions.topics_of(alias));
            }
        }
        aggregate
    }

    fn encode_subscription_aggregate_frame(&self) -> Option<Vec<u8>> {
        let aggregate = self.local_topic_aggregate();
        let topics = match encode_topic_list(&aggregate, TopicListFormat::Plain) {
            Ok(topics) => topics,
            Err(e) => {
                warn!(error = %e, "failed to encode aggregate subscription list");
                return None;
            }
        };
        match (WireMessage::TopicSubscription {
            format: TopicListFormat::Plain,
            topics,
        })
        .encode()
        {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "failed to encode outbound topic subscription frame");
                None
            }
        }
    }

    /// Push this server's current topic aggregate to every connected
    /// comm-server peer. Called whenever a local (non-server) peer's
    /// subscriptions change, so the mesh's cross-server subscription
    /// index stays coherent under churn (§1, §4.2).
    fn broadcast_subscription_aggregate(&mut self) {
        let Some(frame) = self.encode_subscription_aggregate_frame() else {
            return;
        };
        let mut overflowed = Vec::new();
        for (&alias, peer) in &self.peers {
            if peer.role != Role::CommunicationServer {
                continue;
            }
            if peer.reliable.push(frame.clone()) == PushOutcome::Rejected {
                overflowed.push(alias);
            }
        }
        for alias in overflowed {
            self.close_peer(alias, "reliable outbound queue overflow");
        }
    }

    /// Push the current aggregate to a single, just-authenticated
    /// comm-server peer, so it learns this server's existing subscribers
    /// without waiting for the next local subscription change.
    fn send_subscription_aggregate_to(&mut self, alias: Alias) {
        let Some(frame) = self.encode_subscription_aggregate_frame() else {
            return;
        };
        let rejected = match self.peers.get(&alias) {
            Some(peer) => peer.reliable.push(frame) == PushOutcome::Rejected,
            None => false,
        };
        if rejected {
            self.close_peer(alias, "reliable outbound queue overflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Policy;

    fn queues() -> (OutboundQueue, OutboundQueue) {
        (
            OutboundQueue::new(8, Policy::RejectOnFull),
            OutboundQueue::new(8, Policy::DropOldestOnFull),
        )
    }

    #[tokio::test]
    async fn registering_duplicate_alias_is_rejected() {
        let handle = Central::spawn();
        let (r1, u1) = queues();
        let (stop1, _) = watch::channel(false);
        assert!(handle.register(1, Role::Client, r1, u1, stop1).await);

        let (r2, u2) = queues();
        let (stop2, _) = watch::channel(false);
        assert!(!handle.register(1, Role::Client, r2, u2, stop2).await);
    }

    #[tokio::test]
    async fn topic_message_fans_out_to_subscribers_except_sender() {
        let handle = Central::spawn();
        let (r1, u1) = queues();
        let (stop1, _) = watch::channel(false);
        handle.register(1, Role::Client, r1, u1, stop1).await;
        handle.set_authenticated(1).await;

        let (r2, u2) = queues();
        let (stop2, _) = watch::channel(false);
        handle.register(2, Role::Client, r2.clone(), u2, stop2).await;
        handle.set_authenticated(2).await;

        handle
            .update_subscriptions(1, ["chat".to_string()].into_iter().collect())
            .await;
        handle
            .update_subscriptions(2, ["chat".to_string()].into_iter().collect())
            .await;

        handle
            .topic_message(1, "chat".to_string(), b"hi".to_vec(), Channel::Reliable)
            .await;

        let frame = r2.pop().await.unwrap();
        match WireMessage::decode(&frame).unwrap() {
            WireMessage::Topic { from_alias, topic, body } => {
                assert_eq!(from_alias, 1);
                assert_eq!(topic, "chat");
                assert_eq!(body, b"hi");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_does_not_reforward_server_sourced_message_to_other_servers() {
        let handle = Central::spawn();
        let (r1, u1) = queues();
        let (stop1, _) = watch::channel(false);
        handle
            .register(1, Role::CommunicationServer, r1, u1, stop1)
            .await;
        handle.set_authenticated(1).await;

        let (r2, u2) = queues();
        let (stop2, _) = watch::channel(false);
        handle
            .register(2, Role::CommunicationServer, r2.clone(), u2, stop2)
            .await;
        handle.set_authenticated(2).await;

        // Becoming authenticated as a mesh peer pushes the current
        // (empty) subscription aggregate; drain it before asserting on
        // fan-out so it isn't mistaken for a re-forwarded topic frame.
        let initial = r2.pop().await.unwrap();
        assert!(matches!(
            WireMessage::decode(&initial).unwrap(),
            WireMessage::TopicSubscription { .. }
        ));

        handle
            .update_subscriptions(2, ["chat".to_string()].into_iter().collect())
            .await;

        handle
            .topic_message(1, "chat".to_string(), b"hi".to_vec(), Channel::Reliable)
            .await;

        r2.close();
        assert_eq!(r2.pop().await, None);
    }

    #[tokio::test]
    async fn unauthenticated_sender_is_dropped() {
        let handle = Central::spawn();
        let (r1, u1) = queues();
        let (stop1, _) = watch::channel(false);
        handle.register(1, Role::Client, r1, u1, stop1).await;
        // never authenticated

        let (r2, u2) = queues();
        let (stop2, _) = watch::channel(false);
        handle.register(2, Role::Client, r2.clone(), u2, stop2).await;
        handle.set_authenticated(2).await;
        handle
            .update_subscriptions(2, ["chat".to_string()].into_iter().collect())
            .await;

        handle
            .topic_message(1, "chat".to_string(), b"hi".to_vec(), Channel::Reliable)
            .await;

        r2.close();
        assert_eq!(r2.pop().await, None);
    }

    #[tokio::test]
    async fn reliable_queue_overflow_disconnects_peer() {
        let handle = Central::spawn();
        let (r1, u1) = queues();
        let (stop1, _) = watch::channel(false);
        handle.register(1, Role::Client, r1, u1, stop1).await;
        handle.set_authenticated(1).await;

        let reliable = OutboundQueue::new(1, Policy::RejectOnFull);
        let unreliable = OutboundQueue::new(8, Policy::DropOldestOnFull);
        let (stop2, mut stop_rx2) = watch::channel(false);
        handle
            .register(2, Role::Client, reliable.clone(), unreliable, stop2)
            .await;
        handle.set_authenticated(2).await;
        handle
            .update_subscriptions(2, ["chat".to_string()].into_iter().collect())
            .await;

        // Fill the single-slot reliable queue, then overflow it.
        handle
            .topic_message(1, "chat".to_string(), vec![1], Channel::Reliable)
            .await;
        handle
            .topic_message(1, "chat".to_string(), vec![2], Channel::Reliable)
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(*stop_rx2.borrow_and_update());
    }

    #[tokio::test]
    async fn local_client_subscription_change_is_propagated_to_server_peers() {
        let handle = Central::spawn();

        let (rs, us) = queues();
        let (stop_s, _) = watch::channel(false);
        handle
            .register(100, Role::CommunicationServer, rs.clone(), us, stop_s)
            .await;
        handle.set_authenticated(100).await;
        // Drain the empty aggregate sent on authentication.
        rs.pop().await.unwrap();

        let (rc, uc) = queues();
        let (stop_c, _) = watch::channel(false);
        handle.register(1, Role::Client, rc, uc, stop_c).await;
        handle.set_authenticated(1).await;

        handle
            .update_subscriptions(1, ["chat".to_string()].into_iter().collect())
            .await;

        let frame = rs.pop().await.unwrap();
        match WireMessage::decode(&frame).unwrap() {
            WireMessage::TopicSubscription { format, topics } => {
                let decoded = mesh_wire::decode_topic_list(format, &topics).unwrap();
                assert_eq!(decoded.into_iter().collect::<Vec<_>>(), vec!["chat".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn newly_authenticated_server_peer_receives_current_aggregate() {
        let handle = Central::spawn();

        let (rc, uc) = queues();
        let (stop_c, _) = watch::channel(false);
        handle.register(1, Role::Client, rc, uc, stop_c).await;
        handle.set_authenticated(1).await;
        handle
            .update_subscriptions(1, ["profile".to_string()].into_iter().collect())
            .await;

        let (rs, us) = queues();
        let (stop_s, _) = watch::channel(false);
        handle
            .register(100, Role::CommunicationServer, rs.clone(), us, stop_s)
            .await;
        handle.set_authenticated(100).await;

        let frame = rs.pop().await.unwrap();
        match WireMessage::decode(&frame).unwrap() {
            WireMessage::TopicSubscription { format, topics } => {
                let decoded = mesh_wire::decode_topic_list(format, &topics).unwrap();
                assert_eq!(decoded.into_iter().collect::<Vec<_>>(), vec!["profile".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_sourced_subscription_update_is_not_rebroadcast() {
        let handle = Central::spawn();

        let (r1, u1) = queues();
        let (stop1, _) = watch::channel(false);
        handle
            .register(1, Role::CommunicationServer, r1, u1, stop1)
            .await;
        handle.set_authenticated(1).await;

        let (r2, u2) = queues();
        let (stop2, _) = watch::channel(false);
        handle
            .register(2, Role::CommunicationServer, r2.clone(), u2, stop2)
            .await;
        handle.set_authenticated(2).await;
        // Drain the empty aggregate sent to 2 on its own authentication.
        r2.pop().await.unwrap();

        // Peer 1 advertises its own aggregate; this must not be relayed
        // back out to peer 2 (or anywhere else).
        handle
            .update_subscriptions(1, ["chat".to_string()].into_iter().collect())
            .await;

        r2.close();
        assert_eq!(r2.pop().await, None);
    }
}
