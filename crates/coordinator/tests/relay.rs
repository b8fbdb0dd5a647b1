//! End-to-end exercise of the coordinator's WebSocket relay protocol
//! against real loopback TCP sockets — no mocked transport, since the
//! scheduling model (suspension on real I/O) is part of what's under
//! test.

use std::sync::Arc;
use std::time::Duration;

use coordinator::{Central, CoordinatorConfig, CoordinatorServer, DefaultServerSelector};
use futures_util::{SinkExt, StreamExt};
use mesh_auth::{AuthenticatorRegistry, OpenAuthenticator};
use mesh_wire::WireMessage;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn start_coordinator() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = CoordinatorConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_port: port,
        auth_timeout: Duration::from_secs(60),
        queue_size: 32,
    };
    let mut registry = AuthenticatorRegistry::new();
    registry.register("open", Arc::new(OpenAuthenticator)).unwrap();

    let central = Central::spawn(Box::new(DefaultServerSelector::default()));
    let server = CoordinatorServer::new(config, central, Arc::new(registry));
    tokio::spawn(server.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

#[tokio::test]
async fn server_then_client_receives_server_in_welcome() {
    let port = start_coordinator().await;

    let (server_ws, _) = tokio_tungstenite::connect_async(format!(
        "ws://127.0.0.1:{port}/discover?method=open"
    ))
    .await
    .unwrap();
    let (mut server_sink, mut server_stream) = server_ws.split();

    let welcome = server_stream.next().await.unwrap().unwrap();
    let Message::Binary(data) = welcome else {
        panic!("expected binary welcome");
    };
    let server_alias = match WireMessage::decode(&data).unwrap() {
        WireMessage::Welcome { alias, available_servers } => {
            assert!(available_servers.is_empty());
            alias
        }
        other => panic!("unexpected message: {other:?}"),
    };

    let (client_ws, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/connect?method=open"))
            .await
            .unwrap();
    let (_client_sink, mut client_stream) = client_ws.split();

    let welcome = client_stream.next().await.unwrap().unwrap();
    let Message::Binary(data) = welcome else {
        panic!("expected binary welcome");
    };
    match WireMessage::decode(&data).unwrap() {
        WireMessage::Welcome {
            available_servers, ..
        } => {
            assert_eq!(available_servers, vec![server_alias]);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    let _ = server_sink.close().await;
}

#[tokio::test]
async fn offer_is_relayed_with_rewritten_from_alias() {
    let port = start_coordinator().await;

    let (a_ws, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/connect?method=open"))
            .await
            .unwrap();
    let (mut a_sink, mut a_stream) = a_ws.split();
    let a_alias = match recv_welcome(&mut a_stream).await {
        WireMessage::Welcome { alias, .. } => alias,
        _ => unreachable!(),
    };

    let (b_ws, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/connect?method=open"))
            .await
            .unwrap();
    let (_b_sink, mut b_stream) = b_ws.split();
    let b_alias = match recv_welcome(&mut b_stream).await {
        WireMessage::Welcome { alias, .. } => alias,
        _ => unreachable!(),
    };

    let offer = WireMessage::WebrtcOffer {
        from_alias: 0, // should be rewritten by the coordinator
        to_alias: b_alias,
        sdp: "v=0 offer".to_string(),
    }
    .encode()
    .unwrap();
    a_sink.send(Message::Binary(offer)).await.unwrap();

    let relayed = b_stream.next().await.unwrap().unwrap();
    let Message::Binary(data) = relayed else {
        panic!("expected binary frame");
    };
    match WireMessage::decode(&data).unwrap() {
        WireMessage::WebrtcOffer {
            from_alias, sdp, ..
        } => {
            assert_eq!(from_alias, a_alias);
            assert_eq!(sdp, "v=0 offer");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

async fn recv_welcome(
    stream: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> WireMessage {
    let msg = stream.next().await.unwrap().unwrap();
    let Message::Binary(data) = msg else {
        panic!("expected binary welcome");
    };
    WireMessage::decode(&data).unwrap()
}
