#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use buzzed_domain::ConnectionId;
use buzzed_protocol::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_client_event, encode_server_event, peek_event_name};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::server::error::CommandError;
use crate::server::session::Dispatcher;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	/// Accepted `Origin` values; empty accepts any, `*` too.
	pub allowed_origins: Vec<String>,

	pub command_rate_limit_per_conn_burst: u32,
	pub command_rate_limit_per_conn_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			allowed_origins: Vec::new(),
			command_rate_limit_per_conn_burst: 0,
			command_rate_limit_per_conn_per_minute: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
	if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
		return true;
	}
	let Some(origin) = origin else {
		return false;
	};
	let origin = origin.trim().trim_end_matches('/');
	allowed
		.iter()
		.any(|a| a.trim().trim_end_matches('/').eq_ignore_ascii_case(origin))
}

/// `?sid=<uuid>` from the upgrade request.
/// Frames up to this many times the command limit are still read and answered
/// with an error; anything larger is cut off by the transport.
const TRANSPORT_LIMIT_FACTOR: usize = 4;

fn transport_config(max_frame_bytes: usize) -> WebSocketConfig {
	let limit = max_frame_bytes.saturating_mul(TRANSPORT_LIMIT_FACTOR);
	WebSocketConfig::default()
		.max_message_size(Some(limit))
		.max_frame_size(Some(limit))
}

fn requested_session(query: Option<&str>) -> Option<ConnectionId> {
	query?
		.split('&')
		.find_map(|pair| pair.strip_prefix("sid="))
		.and_then(|v| v.parse().ok())
}

/// Serve one WebSocket client until it closes.
pub async fn handle_connection(
	stream: TcpStream,
	peer: SocketAddr,
	dispatcher: Arc<Dispatcher>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("buzzed_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("buzzed_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (sid_tx, sid_rx) = oneshot::channel();
	let allowed_origins = settings.allowed_origins.clone();
	let check_upgrade = move |req: &Request, response: Response| {
		let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
		if !origin_allowed(&allowed_origins, origin) {
			let mut refused = ErrorResponse::new(Some("origin not allowed".to_string()));
			*refused.status_mut() = StatusCode::FORBIDDEN;
			return Err(refused);
		}
		let _ = sid_tx.send(requested_session(req.uri().query()));
		Ok(response)
	};
	let config = transport_config(settings.max_frame_bytes);
	let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, check_upgrade, Some(config))
		.await
		.context("websocket handshake")?;
	let requested = sid_rx.await.ok().flatten();

	let (conn_id, mut outbound) = dispatcher.connect(requested).await.context("register connection")?;
	info!(conn_id = %conn_id, %peer, "accepted connection");

	let (mut sink, mut inbound) = ws.split();

	let writer = tokio::spawn(async move {
		while let Some(event) = outbound.recv().await {
			let text = match encode_server_event(&event) {
				Ok(text) => text,
				Err(e) => {
					warn!(conn_id = %conn_id, event = event.name(), error = %e, "failed to encode event");
					continue;
				}
			};
			if sink.send(Message::Text(text.into())).await.is_err() {
				break;
			}
		}
		let _ = sink.close().await;
	});

	let mut rate_limiter = TokenBucket::new(
		settings.command_rate_limit_per_conn_burst,
		settings.command_rate_limit_per_conn_per_minute,
	);

	while let Some(frame) = inbound.next().await {
		let frame = match frame {
			Ok(frame) => frame,
			Err(e) => {
				debug!(conn_id = %conn_id, error = %e, "websocket read failed");
				break;
			}
		};

		let text = match frame {
			Message::Text(text) => text,
			Message::Close(_) => break,
			Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
		};

		if let Some(bucket) = rate_limiter.as_mut()
			&& !bucket.allow()
		{
			let name = peek_event_name(text.as_str()).unwrap_or_else(|| "unknown".to_string());
			dispatcher
				.reject(
					conn_id,
					&name,
					CommandError::RateLimited("You are sending commands too fast, slow down.".into()),
				)
				.await;
			continue;
		}

		match decode_client_event(text.as_str(), settings.max_frame_bytes) {
			Ok(event) => dispatcher.dispatch(conn_id, event).await,
			Err(e) => {
				let name = peek_event_name(text.as_str()).unwrap_or_else(|| "unknown".to_string());
				let message = match &e {
					FramingError::FrameTooLarge { max, .. } => format!("Message too large (max {max} bytes)."),
					_ => format!("Malformed \"{name}\" event."),
				};
				debug!(conn_id = %conn_id, event = %name, error = %e, "undecodable frame");
				dispatcher.reject(conn_id, &name, CommandError::Validation(message)).await;
			}
		}
	}

	dispatcher.disconnect(conn_id).await;
	let _ = writer.await;
	info!(conn_id = %conn_id, "connection closed");

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn origin_rules() {
		assert!(origin_allowed(&[], None));
		assert!(origin_allowed(&["*".into()], Some("http://x")));

		let allowed = vec!["https://buzzed.example".to_string()];
		assert!(origin_allowed(&allowed, Some("https://buzzed.example")));
		assert!(origin_allowed(&allowed, Some("https://BUZZED.example/")));
		assert!(!origin_allowed(&allowed, Some("https://evil.example")));
		assert!(!origin_allowed(&allowed, None));
	}

	#[test]
	fn session_id_from_query() {
		let id = ConnectionId::new_v4();
		assert_eq!(requested_session(Some(&format!("sid={id}"))), Some(id));
		assert_eq!(requested_session(Some(&format!("v=1&sid={id}"))), Some(id));
		assert_eq!(requested_session(Some("sid=nope")), None);
		assert_eq!(requested_session(None), None);
	}

	#[test]
	fn transport_limit_follows_frame_limit() {
		let config = transport_config(64);
		assert_eq!(config.max_message_size, Some(256));
		assert_eq!(config.max_frame_size, Some(256));
	}

	#[test]
	fn bucket_disabled_with_zero_limits() {
		assert!(TokenBucket::new(0, 60).is_none());
		assert!(TokenBucket::new(5, 0).is_none());
	}

	#[test]
	fn bucket_allows_burst_then_refuses() {
		let mut bucket = TokenBucket::new(3, 1).expect("bucket");
		assert!(bucket.allow());
		assert!(bucket.allow());
		assert!(bucket.allow());
		assert!(!bucket.allow());
	}
}
