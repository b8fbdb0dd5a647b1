//! Per-remote-peer WebRTC session: data channel lifecycle, the
//! AUTH-over-WebRTC handshake, and the read/write pumps that connect a
//! peer's two data channels to the central registry.
//!
//! A session is built one of two ways, both ending up wired the same:
//! - [`initiate`]: this comm-server is the offerer (told by the
//!   coordinator, via `CONNECT`, to dial another comm-server).
//! - [`accept_offer`]: this comm-server is the answerer (an inbound
//!   `WEBRTC_OFFER` from a client or another comm-server).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use mesh_auth::{AuthenticatorRegistry, Decision};
use mesh_wire::{decode_topic_list, Alias, Role, WireMessage};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::central::{Channel, CentralHandle};
use crate::config::CommServerConfig;
use crate::error::{Error, Result};
use crate::queue::{OutboundQueue, Policy};
use crate::rtc::PeerConnectionFactory;
use crate::signaling::SignalingHandle;

/// Conventional data channel labels every peer connection negotiates.
/// Fan-out in [`crate::central`] is keyed on arrival channel, not label,
/// but the label is what lets the answerer side of [`accept_offer`] route
/// each channel `on_data_channel` hands it to the right handler.
pub const RELIABLE_LABEL: &str = "reliable";
pub const UNRELIABLE_LABEL: &str = "unreliable";

/// `ordered: false, max_retransmits: 0` trades ordering and retransmission
/// for latency — best-effort delivery matching the unreliable queue's
/// drop-oldest backpressure policy. The reliable channel keeps the
/// `RTCDataChannelInit` defaults (ordered, unlimited retransmits).
fn unreliable_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(false),
        max_retransmits: Some(0),
        ..Default::default()
    }
}

/// One remote peer's session state. `alias` is the peer's coordinator-
/// assigned alias, which doubles as its key in the comm-server's central
/// registry once authenticated.
struct Session {
    alias: Alias,
    pc: Arc<RTCPeerConnection>,
    central: CentralHandle,
    auth: Arc<AuthenticatorRegistry>,
    signaling: SignalingHandle,
    reliable_queue: OutboundQueue,
    unreliable_queue: OutboundQueue,
    stop_tx: watch::Sender<bool>,
    authenticated: AtomicBool,
    /// Set once, from the AUTH frame's role, the moment authentication
    /// succeeds; immutable thereafter. Lets `dispatch_authenticated` tell
    /// a directly-authenticated local peer from a mesh-relaying comm-server
    /// peer without a round trip through the central registry.
    role: OnceLock<Role>,
    auth_timeout: Duration,
}

fn new_session(
    alias: Alias,
    pc: Arc<RTCPeerConnection>,
    central: CentralHandle,
    auth: Arc<AuthenticatorRegistry>,
    signaling: SignalingHandle,
    config: &CommServerConfig,
) -> Arc<Session> {
    let (stop_tx, _) = watch::channel(false);
    Arc::new(Session {
        alias,
        pc,
        central,
        auth,
        signaling,
        reliable_queue: OutboundQueue::new(config.reliable_queue_size, Policy::RejectOnFull),
        unreliable_queue: OutboundQueue::new(config.unreliable_queue_size, Policy::DropOldestOnFull),
        stop_tx,
        authenticated: AtomicBool::new(false),
        role: OnceLock::new(),
        auth_timeout: config.peer_auth_timeout,
    })
}

impl Session {
    /// Tear the session down exactly once, whichever path notices first
    /// (bad frame, auth timeout, peer-connection state change, or the
    /// central task disconnecting it for queue overflow). If this peer
    /// was never authenticated it was never registered with the central
    /// task either, so there is nothing for `peer_closed` to do; the
    /// local stop signal and queue closes are all that's needed.
    async fn close(&self, reason: &str) {
        if self.authenticated.swap(false, Ordering::AcqRel) {
            self.central.peer_closed(self.alias, reason.to_string()).await;
        } else {
            self.reliable_queue.close();
            self.unreliable_queue.close();
            let _ = self.stop_tx.send(true);
        }
        self.signaling.forget_session(self.alias);
        if let Err(e) = self.pc.close().await {
            debug!(alias = self.alias, error = %e, "error closing peer connection");
        }
    }

    /// The reliable channel's handshake gate (§4.2 steps 2-4): while
    /// unauthenticated, only a well-formed `AUTH` frame is acceptable;
    /// anything else — wrong type or undecodable bytes — closes the
    /// peer. Authentication failure closes it too, since there is no
    /// retry budget.
    async fn handle_reliable_frame(self: &Arc<Self>, data: &[u8]) {
        if !self.authenticated.load(Ordering::Acquire) {
            match WireMessage::decode(data) {
                Ok(WireMessage::Auth { role, method, body }) => {
                    if !self.try_authenticate(role, &method, &body).await {
                        self.close("webrtc authentication failed").await;
                    }
                }
                Ok(other) => {
                    info!(
                        alias = self.alias,
                        header = ?other.header(),
                        "non-AUTH frame before authentication, closing"
                    );
                    self.close("protocol violation before authentication").await;
                }
                Err(e) => {
                    debug!(alias = self.alias, error = %e, "malformed frame before authentication, closing");
                    self.close("malformed frame before authentication").await;
                }
            }
            return;
        }
        self.dispatch_authenticated(data, Channel::Reliable).await;
    }

    /// Frames on the unreliable channel may race the AUTH handshake on
    /// the reliable one; while unauthenticated they are simply discarded
    /// (§4.2 step 5), never treated as a protocol violation.
    async fn handle_unreliable_frame(self: &Arc<Self>, data: &[u8]) {
        if !self.authenticated.load(Ordering::Acquire) {
            debug!(alias = self.alias, "frame on unreliable channel before authentication, discarding");
            return;
        }
        self.dispatch_authenticated(data, Channel::Unreliable).await;
    }

    async fn try_authenticate(self: &Arc<Self>, role: Role, method: &str, body: &[u8]) -> bool {
        let Some(authenticator) = self.auth.get(method) else {
            warn!(alias = self.alias, method, "unknown auth method in webrtc AUTH frame");
            return false;
        };
        match authenticator.authenticate_from_message(role, body).await {
            Decision::Accept => {
                let registered = self
                    .central
                    .register(
                        self.alias,
                        role,
                        self.reliable_queue.clone(),
                        self.unreliable_queue.clone(),
                        self.stop_tx.clone(),
                    )
                    .await;
                if !registered {
                    warn!(alias = self.alias, "duplicate registration rejected by central registry");
                    return false;
                }
                self.central.set_authenticated(self.alias).await;
                let _ = self.role.set(role);
                self.authenticated.store(true, Ordering::Release);
                info!(alias = self.alias, ?role, "remote peer authenticated over webrtc");
                true
            }
            Decision::Reject { reason } => {
                info!(alias = self.alias, reason, "webrtc AUTH rejected");
                false
            }
        }
    }

    async fn dispatch_authenticated(self: &Arc<Self>, data: &[u8], channel: Channel) {
        let message = match WireMessage::decode(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(alias = self.alias, error = %e, "malformed frame, closing peer");
                self.close("malformed frame").await;
                return;
            }
        };
        match message {
            WireMessage::Topic { from_alias, topic, body } => {
                // A mesh peer's frame carries the original publisher's
                // alias; a direct local peer can only ever speak for
                // itself, so its own session alias is authoritative
                // regardless of what it put on the wire.
                let publisher = if self.role.get() == Some(&Role::CommunicationServer) {
                    from_alias
                } else {
                    self.alias
                };
                self.central
                    .topic_message(publisher, topic, body, channel)
                    .await;
            }
            WireMessage::TopicSubscription { format, topics } => match decode_topic_list(format, &topics) {
                Ok(topics) => {
                    self.central
                        .update_subscriptions(self.alias, topics.into_iter().collect())
                        .await;
                }
                Err(e) => {
                    debug!(alias = self.alias, error = %e, "malformed topic subscription, dropping");
                }
            },
            WireMessage::Auth { .. } => {
                debug!(alias = self.alias, "duplicate AUTH frame after authentication, ignoring");
            }
            other => {
                debug!(alias = self.alias, header = ?other.header(), "unsupported frame from remote peer, dropping");
            }
        }
    }
}

/// Shared peer-connection-level wiring: trickle ICE out to the
/// coordinator as candidates are gathered (§9's "trickle ICE" decision),
/// and a uniform teardown on connection failure/closure.
fn wire_lifecycle(session: Arc<Session>) {
    let ice_session = Arc::clone(&session);
    session.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let session = Arc::clone(&ice_session);
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    warn!(alias = session.alias, error = %e, "failed to serialize gathered ICE candidate");
                    return;
                }
            };
            match serde_json::to_string(&init) {
                Ok(candidate_json) => {
                    session.signaling.send_ice_candidate(session.alias, candidate_json).await;
                }
                Err(e) => {
                    warn!(alias = session.alias, error = %e, "failed to encode ICE candidate payload");
                }
            }
        })
    }));

    let state_session = Arc::clone(&session);
    session
        .pc
        .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let session = Arc::clone(&state_session);
            Box::pin(async move {
                debug!(alias = session.alias, ?state, "peer connection state change");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                        | RTCPeerConnectionState::Disconnected
                ) {
                    session.close("peer connection state change").await;
                }
            })
        }));
}

/// Arm the AUTH deadline (§4.2 step 1), started once the reliable channel
/// opens. Racing against the session's own stop signal means a session
/// that closes for any other reason never leaves a dangling timer task.
fn arm_auth_deadline(session: Arc<Session>) {
    let mut stop_rx = session.stop_tx.subscribe();
    tokio::spawn(async move {
        let deadline = tokio::time::sleep(session.auth_timeout);
        tokio::pin!(deadline);
        tokio::select! {
            biased;
            _ = stop_rx.changed() => {}
            _ = &mut deadline => {
                if !session.authenticated.load(Ordering::Acquire) {
                    info!(alias = session.alias, "webrtc authentication timed out");
                    session.close("authentication timeout").await;
                }
            }
        }
    });
}

/// Drain `queue` onto `dc` until the session stops or the channel send
/// fails, mirroring the coordinator's own write pump
/// (`coordinator::server::run_write_pump`) with a data channel standing
/// in for the WebSocket sink.
async fn run_write_pump(dc: Arc<RTCDataChannel>, queue: OutboundQueue, mut stop_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            frame = queue.pop() => {
                match frame {
                    Some(data) => {
                        if dc.send(&Bytes::from(data)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

fn attach_reliable(session: Arc<Session>, dc: Arc<RTCDataChannel>) {
    let open_session = Arc::clone(&session);
    let open_dc = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        let session = Arc::clone(&open_session);
        let dc = Arc::clone(&open_dc);
        Box::pin(async move {
            info!(alias = session.alias, "reliable data channel open");
            arm_auth_deadline(Arc::clone(&session));
            let stop_rx = session.stop_tx.subscribe();
            let queue = session.reliable_queue.clone();
            tokio::spawn(run_write_pump(dc, queue, stop_rx));
        })
    }));

    let msg_session = Arc::clone(&session);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let session = Arc::clone(&msg_session);
        Box::pin(async move {
            session.handle_reliable_frame(&msg.data).await;
        })
    }));

    let close_session = Arc::clone(&session);
    dc.on_close(Box::new(move || {
        let session = Arc::clone(&close_session);
        Box::pin(async move {
            debug!(alias = session.alias, "reliable data channel closed");
            session.close("reliable channel closed").await;
        })
    }));
}

fn attach_unreliable(session: Arc<Session>, dc: Arc<RTCDataChannel>) {
    let open_session = Arc::clone(&session);
    let open_dc = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        let session = Arc::clone(&open_session);
        let dc = Arc::clone(&open_dc);
        Box::pin(async move {
            info!(alias = session.alias, "unreliable data channel open");
            let stop_rx = session.stop_tx.subscribe();
            let queue = session.unreliable_queue.clone();
            tokio::spawn(run_write_pump(dc, queue, stop_rx));
        })
    }));

    let msg_session = Arc::clone(&session);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let session = Arc::clone(&msg_session);
        Box::pin(async move {
            session.handle_unreliable_frame(&msg.data).await;
        })
    }));

    let close_session = Arc::clone(&session);
    dc.on_close(Box::new(move || {
        let session = Arc::clone(&close_session);
        Box::pin(async move {
            debug!(alias = session.alias, "unreliable data channel closed");
            session.close("unreliable channel closed").await;
        })
    }));
}

/// This comm-server is the offerer: build a fresh peer connection, create
/// both conventional data channels up front (their labels are what the
/// answering side keys `on_data_channel` off of), and return the SDP
/// offer for the caller to relay through the coordinator.
pub async fn initiate(
    remote_alias: Alias,
    factory: &PeerConnectionFactory,
    central: CentralHandle,
    auth: Arc<AuthenticatorRegistry>,
    signaling: SignalingHandle,
    config: &CommServerConfig,
) -> Result<String> {
    let pc = factory.new_peer_connection().await?;
    let session = new_session(remote_alias, Arc::clone(&pc), central, auth, signaling.clone(), config);
    wire_lifecycle(Arc::clone(&session));

    let reliable_dc = pc.create_data_channel(RELIABLE_LABEL, None).await?;
    attach_reliable(Arc::clone(&session), reliable_dc);

    let unreliable_dc = pc
        .create_data_channel(UNRELIABLE_LABEL, Some(unreliable_channel_init()))
        .await?;
    attach_unreliable(Arc::clone(&session), unreliable_dc);

    signaling.register_session(remote_alias, Arc::clone(&pc));

    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;
    let local_desc = pc
        .local_description()
        .await
        .ok_or_else(|| Error::Invariant("no local description after setting offer".to_string()))?;
    Ok(local_desc.sdp)
}

/// This comm-server is the answerer to an inbound `WEBRTC_OFFER` from
/// `remote_alias`. `on_data_channel` is registered before the remote
/// description is set, the same ordering the teacher's
/// `ServerPeer::handle_offer` uses, so a channel that opens in the race
/// window between `set_remote_description` and the rest of this
/// function's setup is never missed.
pub async fn accept_offer(
    remote_alias: Alias,
    offer_sdp: String,
    factory: &PeerConnectionFactory,
    central: CentralHandle,
    auth: Arc<AuthenticatorRegistry>,
    signaling: SignalingHandle,
    config: &CommServerConfig,
) -> Result<String> {
    let pc = factory.new_peer_connection().await?;
    let session = new_session(remote_alias, Arc::clone(&pc), central, auth, signaling.clone(), config);
    wire_lifecycle(Arc::clone(&session));

    let dc_session = Arc::clone(&session);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let session = Arc::clone(&dc_session);
        Box::pin(async move {
            match dc.label() {
                RELIABLE_LABEL => attach_reliable(session, dc),
                UNRELIABLE_LABEL => attach_unreliable(session, dc),
                other => {
                    warn!(alias = session.alias, label = other, "unexpected data channel label, ignoring");
                }
            }
        })
    }));

    signaling.register_session(remote_alias, Arc::clone(&pc));

    let offer = RTCSessionDescription::offer(offer_sdp)?;
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;
    let local_desc = pc
        .local_description()
        .await
        .ok_or_else(|| Error::Invariant("no local description after setting answer".to_string()))?;
    Ok(local_desc.sdp)
}

/// Apply a `WEBRTC_ANSWER` to the peer connection this comm-server
/// offered earlier. The caller looks `pc` up by the answerer's alias in
/// [`SignalingHandle`]'s session table.
pub async fn accept_answer(pc: Arc<RTCPeerConnection>, sdp: String) -> Result<()> {
    let answer = RTCSessionDescription::answer(sdp)?;
    pc.set_remote_description(answer).await?;
    Ok(())
}

/// Apply a trickled `WEBRTC_ICE_CANDIDATE`. The candidate string is the
/// JSON encoding of an `RTCIceCandidateInit`, the same convention the
/// teacher's `PeerConnection::add_ice_candidate` uses.
pub async fn add_remote_ice_candidate(pc: Arc<RTCPeerConnection>, candidate_json: String) -> Result<()> {
    let init: RTCIceCandidateInit = serde_json::from_str(&candidate_json)
        .map_err(|e| Error::Invariant(format!("invalid ice candidate payload: {e}")))?;
    pc.add_ice_candidate(init).await?;
    Ok(())
}
