//! Signaling wire format and WebSocket transport tests
//!
//! A throwaway WebSocket server on localhost stands in for the coordination
//! server so frames can be crafted byte for byte.

use futures::{SinkExt, StreamExt};
use meshcall_core::{
    CallEvent, EventBus, SignalingChannel, SignalingConfig, SignalingError, SignalingMessage,
    SignalingTransport, TransportConfig, WebSocketTransport,
};
use meshcall_core::{CallId, CallType, IceCandidate, ParticipantRef, PeerId, SessionDescription};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Accept one client and push `frames` to it, then keep the socket open
/// until the client goes away. Returns the URL and what the client sent.
async fn serve_frames(frames: Vec<Message>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        for frame in frames {
            ws.send(frame).await.unwrap();
        }
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let _ = tx.send(text.to_string());
            }
        }
    });

    (url, rx)
}

fn transport(url: &str) -> WebSocketTransport {
    WebSocketTransport::new(TransportConfig {
        url: url.to_string(),
        max_message_bytes: 4096,
    })
}

#[tokio::test]
async fn receive_decodes_text_and_binary_frames() {
    let ended = r#"{"type":"call:ended","callId":"c-1"}"#;
    let joined = r#"{"type":"peer:joined","peerId":"carol"}"#;
    let (url, _sent) = serve_frames(vec![
        Message::text(ended),
        Message::binary(joined.as_bytes().to_vec()),
    ])
    .await;

    let ws = transport(&url);
    ws.connect().await.unwrap();
    assert_eq!(
        ws.receive_message().await.unwrap(),
        Some(SignalingMessage::Ended {
            call_id: CallId::from("c-1")
        })
    );
    assert_eq!(
        ws.receive_message().await.unwrap(),
        Some(SignalingMessage::PeerJoined {
            peer_id: PeerId::new("carol")
        })
    );
    ws.close().await;
}

#[tokio::test]
async fn receive_reports_bad_frames_without_dropping_the_connection() {
    let (url, _sent) = serve_frames(vec![
        Message::text("not json at all"),
        Message::text(r#"{"type":"call:teleport","callId":"c-1"}"#),
        Message::text(r#"{"type":"peer:left","peerId":""}"#),
        Message::text(r#"{"type":"peer:left","peerId":"bob"}"#),
    ])
    .await;

    let ws = transport(&url);
    ws.connect().await.unwrap();
    for _ in 0..3 {
        assert!(matches!(
            ws.receive_message().await,
            Err(SignalingError::InvalidMessage(_))
        ));
    }
    assert_eq!(
        ws.receive_message().await.unwrap(),
        Some(SignalingMessage::PeerLeft {
            peer_id: PeerId::new("bob")
        })
    );
}

#[tokio::test]
async fn receive_rejects_oversized_frames() {
    let padding = "x".repeat(5000);
    let frame = format!(r#"{{"type":"call:reject","callId":"c-1","reason":"{padding}"}}"#);
    let (url, _sent) = serve_frames(vec![Message::text(frame)]).await;

    let ws = transport(&url);
    ws.connect().await.unwrap();
    match ws.receive_message().await {
        Err(SignalingError::MessageTooLarge { size, max }) => {
            assert!(size > 5000);
            assert_eq!(max, 4096);
        }
        other => panic!("expected MessageTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn receive_drops_connection_on_frames_past_wire_limit() {
    let padding = "x".repeat(20_000);
    let frame = format!(r#"{{"type":"call:reject","callId":"c-1","reason":"{padding}"}}"#);
    let (url, _sent) = serve_frames(vec![Message::text(frame)]).await;

    let ws = transport(&url);
    assert_eq!(ws.websocket_config().max_frame_size, Some(4 * 4096));
    ws.connect().await.unwrap();
    assert!(matches!(
        ws.receive_message().await,
        Err(SignalingError::TransportError(_))
    ));
    assert!(matches!(
        ws.receive_message().await,
        Err(SignalingError::NotConnected)
    ));
}

#[tokio::test]
async fn secure_urls_attempt_a_tls_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("wss://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        // Accept and hang up without speaking TLS.
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let err = transport(&url).connect().await.unwrap_err();
    match err {
        SignalingError::TransportError(message) => {
            assert!(!message.contains("TLS support not compiled"), "{message}");
        }
        other => panic!("expected TransportError, got {other:?}"),
    }
}

#[tokio::test]
async fn receive_reports_server_close_as_end_of_stream() {
    let (url, _sent) = serve_frames(vec![Message::Close(None)]).await;

    let ws = transport(&url);
    ws.connect().await.unwrap();
    assert_eq!(ws.receive_message().await.unwrap(), None);
    assert!(matches!(
        ws.receive_message().await,
        Err(SignalingError::NotConnected)
    ));
}

#[tokio::test]
async fn send_writes_camel_case_json() {
    let (url, mut sent) = serve_frames(Vec::new()).await;

    let ws = transport(&url);
    ws.connect().await.unwrap();
    ws.send_message(&SignalingMessage::IceCandidate {
        peer_id: PeerId::new("bob"),
        candidate: IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.2 4000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        },
    })
    .await
    .unwrap();

    let text = tokio::time::timeout(Duration::from_secs(5), sent.recv())
        .await
        .unwrap()
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["type"], "ice:candidate");
    assert_eq!(json["peerId"], "bob");
    assert_eq!(json["candidate"]["sdpMid"], "0");
    assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
}

#[tokio::test]
async fn send_refuses_invalid_messages_before_writing() {
    let (url, _sent) = serve_frames(Vec::new()).await;
    let ws = transport(&url);
    ws.connect().await.unwrap();

    let empty_peer = SignalingMessage::Offer {
        peer_id: PeerId::new(""),
        sdp: SessionDescription::offer("v=0"),
    };
    assert!(matches!(
        ws.send_message(&empty_peer).await,
        Err(SignalingError::InvalidMessage(_))
    ));

    let roster: Vec<ParticipantRef> = (0..10)
        .map(|i| ParticipantRef::new(format!("peer-{i}-{}", "p".repeat(400))))
        .collect();
    let too_long = SignalingMessage::Invite {
        call_id: CallId::from("c-1"),
        participants: roster,
        call_type: CallType::Audio,
    };
    assert!(ws.send_message(&too_long).await.is_err());
}

#[tokio::test]
async fn channel_skips_undecodable_frames() {
    let (url, _sent) = serve_frames(vec![
        Message::text("{}"),
        Message::text(r#"{"type":"call:ended","callId":"c-9"}"#),
    ])
    .await;

    let events = EventBus::default();
    let mut rx_events = events.subscribe();
    let channel = Arc::new(SignalingChannel::new(
        Arc::new(transport(&url)),
        SignalingConfig {
            url: url.clone(),
            ..Default::default()
        },
        events,
    ));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = Arc::clone(&channel);
    let task = tokio::spawn(async move { runner.run(tx).await });

    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        message,
        SignalingMessage::Ended {
            call_id: CallId::from("c-9")
        }
    );
    assert!(matches!(
        rx_events.recv().await.unwrap(),
        CallEvent::SignalingConnected
    ));

    channel.shutdown();
    task.await.unwrap();
    assert!(!channel.is_connected());
}

#[test]
fn decoding_unknown_type_fails() {
    let res = SignalingMessage::from_json(r#"{"type":"call:hold","callId":"c"}"#);
    assert!(matches!(res, Err(SignalingError::InvalidMessage(_))));
}

#[test]
fn decoding_requires_camel_case_fields() {
    let snake = r#"{"type":"call:answer","call_id":"c","with_video":true}"#;
    assert!(SignalingMessage::from_json(snake).is_err());

    let camel = r#"{"type":"call:answer","callId":"c","withVideo":true}"#;
    assert_eq!(
        SignalingMessage::from_json(camel).unwrap(),
        SignalingMessage::Answer {
            call_id: CallId::from("c"),
            with_video: true,
        }
    );
}
