use std::collections::HashMap;

use mesh_wire::{Alias, Role, WireMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::selector::ServerSelector;

/// Everything the central task needs to know about one registered peer.
/// This is the coordinator's half of the "Peer (coordinator view)" data
/// model entry — the WebSocket handle itself lives in the connection's
/// own read/write pump tasks, not here; the central task only holds what
/// it needs to route to and tear down that peer.
struct PeerEntry {
    role: Role,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    stop_tx: watch::Sender<bool>,
    is_authenticated: bool,
}

/// Commands the central task accepts. Every mutation to the registry or
/// the server-selector passes through one of these — per-connection tasks
/// never touch the map directly.
pub enum Command {
    /// A peer finished its WebSocket handshake and was assigned `alias`.
    /// `reply` carries the `availableServers` list for the WELCOME
    /// message (empty for a comm-server registration).
    Register {
        alias: Alias,
        role: Role,
        outbound_tx: mpsc::Sender<Vec<u8>>,
        stop_tx: watch::Sender<bool>,
        reply: oneshot::Sender<Vec<Alias>>,
    },
    /// An `AUTH` relay message validated successfully for this peer.
    SetAuthenticated { alias: Alias },
    /// Relay a frame to `to_alias`, rewriting nothing here — the caller
    /// already rewrote `fromAlias` before this command was sent.
    Relay { to_alias: Alias, frame: Vec<u8> },
    /// A peer's connection ended (socket error, explicit close, auth
    /// timeout, or queue overflow observed by a write pump). Idempotent:
    /// a peer already removed is a silent no-op.
    PeerClosed { alias: Alias, reason: String },
    /// Read-only snapshot for tests and the periodic reporter-equivalent;
    /// never mutates state.
    Snapshot {
        reply: oneshot::Sender<Vec<(Alias, Role, bool)>>,
    },
}

/// Handle used by connection-handling tasks to talk to the central task.
/// Cheap to clone (wraps an `mpsc::Sender`).
#[derive(Clone)]
pub struct CentralHandle {
    tx: mpsc::Sender<Command>,
}

impl CentralHandle {
    pub async fn register(
        &self,
        alias: Alias,
        role: Role,
        outbound_tx: mpsc::Sender<Vec<u8>>,
        stop_tx: watch::Sender<bool>,
    ) -> Vec<Alias> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Register {
                alias,
                role,
                outbound_tx,
                stop_tx,
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn set_authenticated(&self, alias: Alias) {
        let _ = self.tx.send(Command::SetAuthenticated { alias }).await;
    }

    pub async fn relay(&self, to_alias: Alias, frame: Vec<u8>) {
        let _ = self.tx.send(Command::Relay { to_alias, frame }).await;
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

    pub async fn snapshot(&self) -> Vec<(Alias, Role, bool)> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// The registry: the sole owner of `peers` and the server-selector state.
/// Runs as one task for the lifetime of the coordinator; every other task
/// only ever reaches it through a [`CentralHandle`].
pub struct Central {
    peers: HashMap<Alias, PeerEntry>,
    selector: Box<dyn ServerSelector>,
}

impl Central {
    /// Spawn the central task and return a handle to it.
    pub fn spawn(selector: Box<dyn ServerSelector>) -> CentralHandle {
        let (tx, rx) = mpsc::channel(1024);
        let central = Central {
            peers: HashMap::new(),
            selector,
        };
        tokio::spawn(central.run(rx));
        CentralHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        info!("coordinator central task shutting down: command channel closed");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                alias,
                role,
                outbound_tx,
                stop_tx,
                reply,
            } => {
                let available = match role {
                    Role::CommunicationServer => {
                        self.selector.server_registered(alias);
                        Vec::new()
                    }
                    Role::Client | Role::Unknown => self.selector.get_server_alias_list(alias),
                };
                self.peers.insert(
                    alias,
                    PeerEntry {
                        role,
                        outbound_tx,
                        stop_tx,
                        is_authenticated: false,
                    },
                );
                info!(alias, ?role, "peer registered");
                if role == Role::CommunicationServer {
                    self.announce_new_server_to_mesh(alias);
                }
                let _ = reply.send(available);
            }
            Command::SetAuthenticated { alias } => {
                if let Some(peer) = self.peers.get_mut(&alias) {
                    if !peer.is_authenticated {
                        peer.is_authenticated = true;
                        info!(alias, "peer authenticated");
                    }
                }
            }
            Command::Relay { to_alias, frame } => {
                let Some(peer) = self.peers.get(&to_alias) else {
                    debug!(to_alias, "relay target unknown, dropping frame");
                    return;
                };
                match peer.outbound_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(_) => {
                        warn!(
                            alias = to_alias,
                            "outbound queue full, disconnecting peer"
                        );
                        self.close_peer(to_alias, "outbound queue overflow");
                    }
                }
            }
            Command::PeerClosed { alias, reason } => {
                self.close_peer(alias, &reason);
            }
            Command::Snapshot { reply } => {
                let snapshot = self
                    .peers
                    .iter()
                    .map(|(alias, peer)| (*alias, peer.role, peer.is_authenticated))
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }

    /// A newly-registered comm-server gets an empty `availableServers` list
    /// of its own (per the WELCOME rule), so it never dials out on its
    /// own. Instead every comm-server already in the mesh is pushed a
    /// `CONNECT` naming the newcomer, reusing the same message a client
    /// uses to request a connection — the existing server reacts to it
    /// exactly as it would to a client's request, by sending an offer
    /// addressed to the newcomer. This keeps mesh formation to one dial
    /// per pair instead of both sides racing to connect.
    fn announce_new_server_to_mesh(&mut self, new_alias: Alias) {
        for (existing_alias, peer) in self.peers.iter() {
            if *existing_alias == new_alias || peer.role != Role::CommunicationServer {
                continue;
            }
            let Ok(frame) = (WireMessage::Connect {
                from_alias: new_alias,
                to_alias: *existing_alias,
            })
            .encode() else {
                continue;
            };
            let _ = peer.outbound_tx.try_send(frame);
        }
    }

    /// Idempotent teardown: removing an alias that is no longer present
    /// is a silent no-op, since both the read pump and the write pump of
    /// a connection may independently observe its end.
    fn close_peer(&mut self, alias: Alias, reason: &str) {
        let Some(peer) = self.peers.remove(&alias) else {
            return;
        };
        info!(alias, reason, "peer closed");
        if peer.role == Role::CommunicationServer {
            self.selector.server_unregistered(alias);
        }
        let _ = peer.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::DefaultServerSelector;

    #[tokio::test]
    async fn register_client_receives_server_list() {
        let handle = Central::spawn(Box::new(DefaultServerSelector::default()));
        let (server_out_tx, _server_out_rx) = mpsc::channel(8);
        let (server_stop_tx, _) = watch::channel(false);
        handle
            .register(1, Role::CommunicationServer, server_out_tx, server_stop_tx)
            .await;

        let (client_out_tx, _client_out_rx) = mpsc::channel(8);
        let (client_stop_tx, _) = watch::channel(false);
        let servers = handle
            .register(2, Role::Client, client_out_tx, client_stop_tx)
            .await;
        assert_eq!(servers, vec![1]);
    }

    #[tokio::test]
    async fn relay_to_unknown_alias_is_silently_dropped() {
        let handle = Central::spawn(Box::new(DefaultServerSelector::default()));
        handle.relay(999, b"frame".to_vec()).await;
        let snapshot = handle.snapshot().await;
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn overflowing_outbound_queue_disconnects_peer() {
        let handle = Central::spawn(Box::new(DefaultServerSelector::default()));
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        handle.register(5, Role::Client, out_tx, stop_tx).await;

        // Fill the single-slot queue, then overflow it.
        handle.relay(5, vec![1]).await;
        handle.relay(5, vec![2]).await;

        // Give the central task a beat to process both commands in order.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(*stop_rx.borrow_and_update());
        let snapshot = handle.snapshot().await;
        assert!(snapshot.is_empty());
        drop(out_rx.recv().await);
    }

    #[tokio::test]
    async fn new_server_registration_is_announced_to_existing_servers() {
        let handle = Central::spawn(Box::new(DefaultServerSelector::default()));
        let (s1_tx, mut s1_rx) = mpsc::channel(8);
        let (s1_stop, _) = watch::channel(false);
        handle
            .register(1, Role::CommunicationServer, s1_tx, s1_stop)
            .await;

        let (s2_tx, _s2_rx) = mpsc::channel(8);
        let (s2_stop, _) = watch::channel(false);
        handle
            .register(2, Role::CommunicationServer, s2_tx, s2_stop)
            .await;

        let frame = s1_rx.recv().await.unwrap();
        match WireMessage::decode(&frame).unwrap() {
            WireMessage::Connect { from_alias, to_alias } => {
                assert_eq!(from_alias, 2);
                assert_eq!(to_alias, 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_closed_is_idempotent() {
        let handle = Central::spawn(Box::new(DefaultServerSelector::default()));
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (stop_tx, _) = watch::channel(false);
        handle.register(3, Role::Client, out_tx, stop_tx).await;
        handle.peer_closed(3, "test").await;
        handle.peer_closed(3, "test again").await;
        assert!(handle.snapshot().await.is_empty());
    }
}
