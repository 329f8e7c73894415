#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use buzzed_protocol::events::ChangeUsername;
use buzzed_protocol::{ClientEvent, ServerEvent};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::SecretString;
use crate::server::auth::SessionTokens;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::hub::{Hub, HubConfig};
use crate::server::password::PasswordHasher;
use crate::server::session::{Dispatcher, SessionSettings};
use crate::store::MemoryStore;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(settings: ConnectionSettings) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");

	let dispatcher = Arc::new(Dispatcher::new(
		Arc::new(MemoryStore::new()),
		Hub::new(HubConfig::default()),
		SessionTokens::new(SecretString::new("test-secret"), Duration::from_secs(3600)),
		PasswordHasher::new(1000),
		SessionSettings::default(),
	));

	tokio::spawn(async move {
		while let Ok((stream, peer)) = listener.accept().await {
			let dispatcher = Arc::clone(&dispatcher);
			let settings = settings.clone();
			tokio::spawn(async move {
				let _ = handle_connection(stream, peer, dispatcher, settings).await;
			});
		}
	});

	addr
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
	let (ws, _resp) = tokio_tungstenite::connect_async(format!("ws://{addr}/{query}"))
		.await
		.expect("websocket connect");
	ws
}

async fn next_event(ws: &mut Client) -> ServerEvent {
	loop {
		let frame = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("expected a frame within timeout")
			.expect("stream open")
			.expect("frame");
		if let Message::Text(text) = frame {
			return serde_json::from_str(text.as_str()).expect("server event");
		}
	}
}

/// Skip broadcasts until an event matching `pred` arrives.
async fn next_matching(ws: &mut Client, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
	loop {
		let ev = next_event(ws).await;
		if pred(&ev) {
			return ev;
		}
	}
}

async fn send_raw(ws: &mut Client, text: &str) {
	ws.send(Message::Text(text.to_string().into())).await.expect("send");
}

async fn send_event(ws: &mut Client, event: &ClientEvent) {
	let text = serde_json::to_string(event).expect("encode");
	send_raw(ws, &text).await;
}

#[tokio::test]
async fn first_frame_assigns_identity() {
	let addr = spawn_server(ConnectionSettings::default()).await;
	let mut ws = connect(addr, "").await;

	match next_event(&mut ws).await {
		ServerEvent::UsernameAssigned(a) => assert!(!a.username.as_str().is_empty()),
		other => panic!("expected username_assigned, got: {other:?}"),
	}

	send_event(&mut ws, &ClientEvent::GetRooms).await;
	match next_matching(&mut ws, |e| matches!(e, ServerEvent::RoomsList(_))).await {
		ServerEvent::RoomsList(rooms) => assert!(rooms.is_empty()),
		other => panic!("expected rooms_list, got: {other:?}"),
	}
}

#[tokio::test]
async fn malformed_frames_are_answered_and_connection_stays_open() {
	let addr = spawn_server(ConnectionSettings::default()).await;
	let mut ws = connect(addr, "").await;
	next_event(&mut ws).await;

	send_raw(&mut ws, r#"{"event":"create_room","data":42}"#).await;
	match next_matching(&mut ws, |e| matches!(e, ServerEvent::CommandError(_))).await {
		ServerEvent::CommandError(body) => assert_eq!(body.message, "Malformed \"create_room\" event."),
		other => panic!("expected command_error, got: {other:?}"),
	}

	send_raw(&mut ws, "not json at all").await;
	match next_matching(&mut ws, |e| matches!(e, ServerEvent::CommandError(_))).await {
		ServerEvent::CommandError(body) => assert_eq!(body.message, "Malformed \"unknown\" event."),
		other => panic!("expected command_error, got: {other:?}"),
	}

	send_raw(&mut ws, r#"{"event":"get_rooms","data":null}"#).await;
	let ev = next_matching(&mut ws, |e| matches!(e, ServerEvent::RoomsList(_))).await;
	assert_eq!(ev.name(), "rooms_list");
}

#[tokio::test]
async fn oversized_frames_are_rejected() {
	let addr = spawn_server(ConnectionSettings {
		max_frame_bytes: 64,
		..ConnectionSettings::default()
	})
	.await;
	let mut ws = connect(addr, "").await;
	next_event(&mut ws).await;

	let big = format!(r#"{{"event":"create_room","data":"{}"}}"#, "x".repeat(128));
	send_raw(&mut ws, &big).await;
	match next_matching(&mut ws, |e| matches!(e, ServerEvent::CommandError(_))).await {
		ServerEvent::CommandError(body) => assert_eq!(body.message, "Message too large (max 64 bytes)."),
		other => panic!("expected command_error, got: {other:?}"),
	}
}

#[tokio::test]
async fn frames_beyond_transport_limit_close_the_connection() {
	let addr = spawn_server(ConnectionSettings {
		max_frame_bytes: 64,
		..ConnectionSettings::default()
	})
	.await;
	let mut ws = connect(addr, "").await;
	next_event(&mut ws).await;

	let huge = format!(r#"{{"event":"create_room","data":"{}"}}"#, "x".repeat(4096));
	// The server may already be gone by the time the send completes.
	let _ = ws.send(Message::Text(huge.into())).await;

	loop {
		match timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("expected the connection to end within timeout")
		{
			Some(Ok(Message::Text(text))) => {
				let ev: ServerEvent = serde_json::from_str(text.as_str()).expect("server event");
				assert!(
					!matches!(ev, ServerEvent::CommandError(_)),
					"huge frame should not reach the command decoder"
				);
			}
			Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
			Some(Ok(_)) => {}
		}
	}
}

#[tokio::test]
async fn foreign_origin_is_refused() {
	let addr = spawn_server(ConnectionSettings {
		allowed_origins: vec!["https://buzzed.example".to_string()],
		..ConnectionSettings::default()
	})
	.await;

	let mut request = format!("ws://{addr}/").into_client_request().expect("request");
	request
		.headers_mut()
		.insert("origin", HeaderValue::from_static("https://evil.example"));
	match tokio_tungstenite::connect_async(request).await {
		Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), StatusCode::FORBIDDEN),
		Err(other) => panic!("expected http 403, got: {other:?}"),
		Ok(_) => panic!("expected the handshake to be refused"),
	}

	let mut request = format!("ws://{addr}/").into_client_request().expect("request");
	request
		.headers_mut()
		.insert("origin", HeaderValue::from_static("https://buzzed.example"));
	let (mut ws, _) = tokio_tungstenite::connect_async(request).await.expect("allowed origin");
	assert_eq!(next_event(&mut ws).await.name(), "username_assigned");
}

#[tokio::test]
async fn session_id_resumes_identity_after_reconnect() {
	let addr = spawn_server(ConnectionSettings::default()).await;
	let mut ws = connect(addr, "").await;

	let sid = match next_event(&mut ws).await {
		ServerEvent::UsernameAssigned(a) => a.session_id,
		other => panic!("expected username_assigned, got: {other:?}"),
	};

	send_event(
		&mut ws,
		&ClientEvent::ChangeUsername(ChangeUsername {
			new_username: "Sticky".into(),
			is_registered: false,
		}),
	)
	.await;
	next_matching(&mut ws, |e| matches!(e, ServerEvent::UsernameChanged(_))).await;

	ws.close(None).await.expect("close");
	drop(ws);
	tokio::time::sleep(Duration::from_millis(100)).await;

	let mut ws = connect(addr, &format!("?sid={sid}")).await;
	match next_event(&mut ws).await {
		ServerEvent::UsernameAssigned(a) => {
			assert_eq!(a.session_id, sid);
			assert_eq!(a.username.as_str(), "Sticky");
		}
		other => panic!("expected username_assigned, got: {other:?}"),
	}
}

#[tokio::test]
async fn command_rate_limit_answers_instead_of_dispatching() {
	let addr = spawn_server(ConnectionSettings {
		command_rate_limit_per_conn_burst: 2,
		command_rate_limit_per_conn_per_minute: 1,
		..ConnectionSettings::default()
	})
	.await;
	let mut ws = connect(addr, "").await;
	next_event(&mut ws).await;

	for _ in 0..3 {
		send_event(&mut ws, &ClientEvent::GetRooms).await;
	}

	let reply = |e: &ServerEvent| !matches!(e, ServerEvent::UserOnline(_) | ServerEvent::UserOffline(_));
	assert_eq!(next_matching(&mut ws, reply).await.name(), "rooms_list");
	assert_eq!(next_matching(&mut ws, reply).await.name(), "rooms_list");
	match next_matching(&mut ws, reply).await {
		ServerEvent::CommandError(body) => assert_eq!(body.message, "You are sending commands too fast, slow down."),
		other => panic!("expected command_error, got: {other:?}"),
	}
}
