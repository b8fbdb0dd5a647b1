//! The comm-server's one connection to the coordinator: a WebSocket
//! client carrying the same wire frames the coordinator relays between
//! clients and servers (`CONNECT`, `WEBRTC_OFFER`/`ANSWER`/
//! `ICE_CANDIDATE`), plus the `WELCOME` that tells this comm-server its
//! own alias and the mesh it should connect to on startup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesh_auth::AuthenticatorRegistry;
use mesh_wire::{Alias, Role, WireMessage};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;

use crate::central::CentralHandle;
use crate::config::CommServerConfig;
use crate::error::Result;
use crate::peer;
use crate::rtc::PeerConnectionFactory;

/// Shared handle for sending signaling frames to the coordinator and for
/// looking up the in-flight peer connection a `WEBRTC_ANSWER` or
/// `WEBRTC_ICE_CANDIDATE` belongs to. Cloned into every per-peer session.
#[derive(Clone)]
pub struct SignalingHandle {
    self_alias: Arc<AtomicU64>,
    outbound: mpsc::Sender<Vec<u8>>,
    sessions: Arc<Mutex<HashMap<Alias, Arc<RTCPeerConnection>>>>,
}

impl SignalingHandle {
    fn new(outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            self_alias: Arc::new(AtomicU64::new(0)),
            outbound,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn set_self_alias(&self, alias: Alias) {
        self.self_alias.store(alias, Ordering::Release);
    }

    pub fn self_alias(&self) -> Alias {
        self.self_alias.load(Ordering::Acquire)
    }

    pub fn register_session(&self, alias: Alias, pc: Arc<RTCPeerConnection>) {
        self.sessions.try_lock().map(|mut s| s.insert(alias, pc)).ok();
    }

    async fn lookup_session(&self, alias: Alias) -> Option<Arc<RTCPeerConnection>> {
        self.sessions.lock().await.get(&alias).cloned()
    }

    pub fn forget_session(&self, alias: Alias) {
        if let Ok(mut sessions) = self.sessions.try_lock() {
            sessions.remove(&alias);
        } else {
            let sessions = Arc::clone(&self.sessions);
            tokio::spawn(async move {
                sessions.lock().await.remove(&alias);
            });
        }
    }

    async fn send(&self, message: &WireMessage) {
        match message.encode() {
            Ok(frame) => {
                if self.outbound.send(frame).await.is_err() {
                    warn!("signaling connection to coordinator is gone, dropping outbound frame");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode outbound signaling frame"),
        }
    }

    pub async fn send_offer(&self, to_alias: Alias, sdp: String) {
        self.send(&WireMessage::WebrtcOffer {
            from_alias: self.self_alias(),
            to_alias,
            sdp,
        })
        .await;
    }

    pub async fn send_answer(&self, to_alias: Alias, sdp: String) {
        self.send(&WireMessage::WebrtcAnswer {
            from_alias: self.self_alias(),
            to_alias,
            sdp,
        })
        .await;
    }

    pub async fn send_ice_candidate(&self, to_alias: Alias, candidate: String) {
        self.send(&WireMessage::WebrtcIceCandidate {
            from_alias: self.self_alias(),
            to_alias,
            candidate,
        })
        .await;
    }
}

/// Owns the coordinator WebSocket connection for the lifetime of the
/// process. `run` reconnects are left to the caller (`bin/comm-server`
/// treats a returned error as fatal, matching the coordinator binary's
/// own top-level error handling) since a comm-server losing its
/// coordinator link has no mesh to rejoin without operator attention.
pub struct CoordinatorLink {
    config: Arc<CommServerConfig>,
    factory: Arc<PeerConnectionFactory>,
    central: CentralHandle,
    auth: Arc<AuthenticatorRegistry>,
}

impl CoordinatorLink {
    pub fn new(
        config: Arc<CommServerConfig>,
        factory: Arc<PeerConnectionFactory>,
        central: CentralHandle,
        auth: Arc<AuthenticatorRegistry>,
    ) -> Self {
        Self {
            config,
            factory,
            central,
            auth,
        }
    }

    pub async fn run(&self, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
        let url = self.config.discover_url();
        info!(url = %url, "connecting to coordinator");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);
        let signaling = SignalingHandle::new(outbound_tx.clone());

        let auth_frame = WireMessage::Auth {
            role: Role::CommunicationServer,
            method: self.config.auth_method.clone(),
            body: self.config.auth_token.clone().unwrap_or_default().into_bytes(),
        }
        .encode()?;
        write.send(Message::Binary(auth_frame)).await?;

        let mut write_stop_rx = stop_rx.clone();
        let write_pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = write_stop_rx.changed() => break,
                    frame = outbound_rx.recv() => {
                        match frame {
                            Some(data) => {
                                if write.send(Message::Binary(data)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        let mut welcomed = false;
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            if !welcomed {
                                match WireMessage::decode(&data) {
                                    Ok(WireMessage::Welcome { alias, .. }) => {
                                        signaling.set_self_alias(alias);
                                        welcomed = true;
                                        info!(alias, "registered with coordinator");
                                    }
                                    Ok(other) => {
                                        warn!(header = ?other.header(), "expected WELCOME as first frame from coordinator");
                                    }
                                    Err(e) => warn!(error = %e, "malformed first frame from coordinator"),
                                }
                                continue;
                            }
                            self.handle_frame(&data, &signaling).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("coordinator closed the signaling connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "error reading from coordinator");
                            break;
                        }
                    }
                }
            }
        }

        let _ = write_pump.await;
        Ok(())
    }

    async fn handle_frame(&self, data: &[u8], signaling: &SignalingHandle) {
        let message = match WireMessage::decode(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "malformed frame from coordinator, dropping");
                return;
            }
        };
        match message {
            WireMessage::Connect { from_alias, .. } => {
                let factory = Arc::clone(&self.factory);
                let central = self.central.clone();
                let auth = Arc::clone(&self.auth);
                let signaling = signaling.clone();
                let config = Arc::clone(&self.config);
                tokio::spawn(async move {
                    match peer::initiate(from_alias, &factory, central, auth, signaling.clone(), &config).await {
                        Ok(sdp) => signaling.send_offer(from_alias, sdp).await,
                        Err(e) => warn!(to = from_alias, error = %e, "failed to initiate webrtc offer"),
                    }
                });
            }
            WireMessage::WebrtcOffer { from_alias, sdp, .. } => {
                let factory = Arc::clone(&self.factory);
                let central = self.central.clone();
                let auth = Arc::clone(&self.auth);
                let signaling = signaling.clone();
                let config = Arc::clone(&self.config);
                tokio::spawn(async move {
                    match peer::accept_offer(from_alias, sdp, &factory, central, auth, signaling.clone(), &config).await {
                        Ok(answer_sdp) => signaling.send_answer(from_alias, answer_sdp).await,
                        Err(e) => warn!(from = from_alias, error = %e, "failed to accept webrtc offer"),
                    }
                });
            }
            WireMessage::WebrtcAnswer { from_alias, sdp, .. } => {
                let signaling = signaling.clone();
                tokio::spawn(async move {
                    match signaling.lookup_session(from_alias).await {
                        Some(pc) => {
                            if let Err(e) = peer::accept_answer(pc, sdp).await {
                                warn!(from = from_alias, error = %e, "failed to apply webrtc answer");
                            }
                        }
                        None => warn!(from = from_alias, "webrtc answer for unknown session"),
                    }
                });
            }
            WireMessage::WebrtcIceCandidate { from_alias, candidate, .. } => {
                let signaling = signaling.clone();
                tokio::spawn(async move {
                    match signaling.lookup_session(from_alias).await {
                        Some(pc) => {
                            if let Err(e) = peer::add_remote_ice_candidate(pc, candidate).await {
                                warn!(from = from_alias, error = %e, "failed to apply ice candidate");
                            }
                        }
                        None => debug!(from = from_alias, "ice candidate for unknown session, dropping"),
                    }
                });
            }
            other => {
                debug!(header = ?other.header(), "unexpected frame from coordinator, dropping");
            }
        }
    }
}

/// Helper used by the binary to keep retrying the coordinator connection
/// with a short backoff instead of exiting on the first transient
/// network error.
pub async fn run_with_reconnect(link: CoordinatorLink, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        match link.run(stop_rx.clone()).await {
            Ok(()) => {}
            Err(e) => warn!(error = %e, "signaling connection to coordinator failed"),
        }
        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            biased;
            _ = stop_rx.changed() => {}
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }
    }
}
