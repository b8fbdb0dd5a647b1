use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesh_auth::{AuthenticatorRegistry, Decision, QueryParams};
use mesh_wire::{Role, WireMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::central::CentralHandle;
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};

/// A registered coordinator endpoint. `/discover` registers comm-servers,
/// `/connect` registers clients; both share the same handshake and relay
/// loop, differing only in the role they assign and whether the
/// server-selector is consulted for the WELCOME reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Discover,
    Connect,
}

/// The coordinator's WebSocket listener. Owns nothing mutable itself —
/// all mutable state lives in the [`Central`](crate::central::Central)
/// task this is built around.
pub struct CoordinatorServer {
    config: CoordinatorConfig,
    central: CentralHandle,
    auth: Arc<AuthenticatorRegistry>,
    next_alias: Arc<std::sync::atomic::AtomicU64>,
}

impl CoordinatorServer {
    pub fn new(
        config: CoordinatorConfig,
        central: CentralHandle,
        auth: Arc<AuthenticatorRegistry>,
    ) -> Self {
        Self {
            config,
            central,
            auth,
            // Alias 0 is reserved as "unassigned"; the first real peer is 1.
            next_alias: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "coordinator listening");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let central = self.central.clone();
            let auth = Arc::clone(&self.auth);
            let next_alias = Arc::clone(&self.next_alias);
            let auth_timeout = self.config.auth_timeout;
            let queue_size = self.config.queue_size;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(
                    stream,
                    peer_addr,
                    central,
                    auth,
                    next_alias,
                    auth_timeout,
                    queue_size,
                )
                .await
                {
                    debug!(%peer_addr, error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    central: CentralHandle,
    auth: Arc<AuthenticatorRegistry>,
    next_alias: Arc<std::sync::atomic::AtomicU64>,
    auth_timeout: Duration,
    queue_size: usize,
) -> Result<()> {
    let request_info: Arc<Mutex<(String, String)>> = Arc::new(Mutex::new(Default::default()));
    let captured = Arc::clone(&request_info);

    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        move |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
              response: tokio_tungstenite::tungstenite::handshake::server::Response| {
            let path = request.uri().path().to_string();
            let query = request.uri().query().unwrap_or("").to_string();
            *captured.lock().unwrap() = (path, query);
            Ok(response)
        },
    )
    .await?;

    let (path, query_string) = request_info.lock().unwrap().clone();
    let endpoint = match path.as_str() {
        "/discover" => Endpoint::Discover,
        "/connect" => Endpoint::Connect,
        other => {
            warn!(%peer_addr, path = other, "unknown endpoint, closing");
            return Ok(());
        }
    };
    let role = match endpoint {
        Endpoint::Discover => Role::CommunicationServer,
        Endpoint::Connect => Role::Client,
    };
    let query = parse_query(&query_string);

    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    // URL-side verification (handshake step 1-2). This is allowed to
    // suspend on whatever the authenticator needs to do; it runs before
    // any alias is assigned, entirely outside the central task.
    if let Some(method) = query.get("method") {
        let authenticator = match auth.require(method) {
            Ok(a) => a,
            Err(e) => {
                warn!(%peer_addr, method, "unknown auth method, closing");
                let _ = ws_sink.close().await;
                return Err(Error::Auth(e));
            }
        };
        match authenticator.authenticate_from_url(role, &query).await {
            Decision::Accept => {}
            Decision::Reject { reason } => {
                info!(%peer_addr, reason, "url authentication rejected");
                let _ = ws_sink.close().await;
                return Ok(());
            }
        }
    }

    let alias = next_alias.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(queue_size);
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let available_servers = central
        .register(alias, role, outbound_tx.clone(), stop_tx.clone())
        .await;

    let welcome = WireMessage::Welcome {
        alias,
        available_servers,
    }
    .encode()?;
    if ws_sink.send(Message::Binary(welcome)).await.is_err() {
        central.peer_closed(alias, "failed to send welcome").await;
        return Ok(());
    }

    info!(%peer_addr, alias, ?role, "peer welcomed");

    // Arm the authentication deadline. The coordinator's own AUTH message
    // path (not the URL path) is handled inline in the read loop below;
    // if neither path succeeds before the deadline, this task closes it.
    let mut is_authenticated = query.contains_key("method");
    if is_authenticated {
        central.set_authenticated(alias).await;
    }
    let deadline = tokio::time::sleep(auth_timeout);
    tokio::pin!(deadline);

    let write_central = central.clone();
    let write_stop = stop_tx.subscribe();
    let write_task = tokio::spawn(async move {
        run_write_pump(ws_sink, outbound_rx, write_stop).await;
        write_central.peer_closed(alias, "write pump ended").await;
    });

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            _ = &mut deadline, if !is_authenticated => {
                info!(%peer_addr, alias, "authentication timed out");
                central.peer_closed(alias, "authentication timeout").await;
                break;
            }
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = handle_frame(
                            &data,
                            alias,
                            role,
                            &auth,
                            &central,
                            &mut is_authenticated,
                        ).await {
                            debug!(%peer_addr, alias, error = %e, "dropping malformed frame");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        central.peer_closed(alias, "socket closed").await;
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/Ping/Pong frames are not part of the relay
                        // protocol; ignore them.
                    }
                    Some(Err(e)) => {
                        debug!(%peer_addr, alias, error = %e, "read error, closing");
                        central.peer_closed(alias, "read error").await;
                        break;
                    }
                }
            }
        }
    }

    let _ = write_task.await;
    Ok(())
}

async fn run_write_pump(
    mut sink: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        Message,
    >,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(data) => {
                        if sink.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Dispatch one decoded relay-protocol frame. Unknown aliases are
/// silently dropped per §4.1; unknown message types are logged and
/// dropped.
async fn handle_frame(
    data: &[u8],
    from_alias: mesh_wire::Alias,
    role: Role,
    auth: &AuthenticatorRegistry,
    central: &CentralHandle,
    is_authenticated: &mut bool,
) -> Result<()> {
    let message = WireMessage::decode(data)?;
    match message {
        WireMessage::WebrtcOffer { to_alias, sdp, .. } => {
            let frame = WireMessage::WebrtcOffer {
                from_alias,
                to_alias,
                sdp,
            }
            .encode()?;
            central.relay(to_alias, frame).await;
        }
        WireMessage::WebrtcAnswer { to_alias, sdp, .. } => {
            let frame = WireMessage::WebrtcAnswer {
                from_alias,
                to_alias,
                sdp,
            }
            .encode()?;
            central.relay(to_alias, frame).await;
        }
        WireMessage::WebrtcIceCandidate {
            to_alias, candidate, ..
        } => {
            let frame = WireMessage::WebrtcIceCandidate {
                from_alias,
                to_alias,
                candidate,
            }
            .encode()?;
            central.relay(to_alias, frame).await;
        }
        WireMessage::Connect { to_alias, .. } => {
            let frame = WireMessage::Connect {
                from_alias,
                to_alias,
            }
            .encode()?;
            central.relay(to_alias, frame).await;
        }
        WireMessage::Auth { method, body, .. } => {
            if let Some(authenticator) = auth.get(&method) {
                match authenticator.authenticate_from_message(role, &body).await {
                    Decision::Accept => {
                        if !*is_authenticated {
                            *is_authenticated = true;
                            central.set_authenticated(from_alias).await;
                        }
                    }
                    Decision::Reject { reason } => {
                        info!(alias = from_alias, reason, "AUTH message rejected");
                        central.peer_closed(from_alias, "auth rejected").await;
                    }
                }
            } else {
                warn!(alias = from_alias, method, "unknown auth method in AUTH frame");
            }
        }
        other => {
            debug!(alias = from_alias, header = ?other.header(), "unsupported message type, dropping");
        }
    }
    Ok(())
}

fn parse_query(query: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");
        if !key.is_empty() {
            params.insert(
                urlencoded_decode(key),
                urlencoded_decode(value),
            );
        }
    }
    params
}

/// Minimal `application/x-www-form-urlencoded` decode: `+` to space and
/// `%XX` escapes. Query strings here only ever carry method names and
/// opaque tokens, so this is deliberately not a full RFC 3986 decoder.
fn urlencoded_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hi = chars.next();
                let lo = chars.next();
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                        out.push(byte as char);
                        continue;
                    }
                }
                out.push('%');
            }
            other => out.push(other),
        }
    }
    out
}
