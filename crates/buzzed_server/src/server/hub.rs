#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use buzzed_domain::ConnectionId;
use buzzed_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Per-connection outbound queues. Every server event leaves through here.
#[derive(Debug, Clone)]
pub struct Hub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

/// Configuration for `Hub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Maximum number of queued events per connection.
	pub connection_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			connection_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Who an event goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
	Connection(ConnectionId),
	Connections(Vec<ConnectionId>),
	Everyone,
}

/// One event and its audience.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
	pub audience: Audience,
	pub event: ServerEvent,
}

impl Delivery {
	pub fn to(conn: ConnectionId, event: ServerEvent) -> Self {
		Self {
			audience: Audience::Connection(conn),
			event,
		}
	}

	pub fn to_all(conns: Vec<ConnectionId>, event: ServerEvent) -> Self {
		Self {
			audience: Audience::Connections(conns),
			event,
		}
	}

	pub fn everyone(event: ServerEvent) -> Self {
		Self {
			audience: Audience::Everyone,
			event,
		}
	}
}

#[derive(Debug, Default)]
struct Inner {
	connections: HashMap<ConnectionId, mpsc::Sender<ServerEvent>>,
}

impl Hub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Open the outbound queue of a connection. Attaching an id again
	/// replaces the previous queue.
	pub async fn attach(&self, conn: ConnectionId) -> mpsc::Receiver<ServerEvent> {
		let (tx, rx) = mpsc::channel(self.cfg.connection_queue_capacity.max(1));

		let mut inner = self.inner.lock().await;
		inner.connections.retain(|_, s| !s.is_closed());
		inner.connections.insert(conn, tx);

		if self.cfg.debug_logs {
			debug!(conn_id = %conn, attached = inner.connections.len(), "hub: attached");
		}

		rx
	}

	pub async fn detach(&self, conn: &ConnectionId) {
		let mut inner = self.inner.lock().await;
		inner.connections.remove(conn);
	}

	pub async fn send_to(&self, conn: ConnectionId, event: ServerEvent) {
		self.deliver(vec![Delivery::to(conn, event)]).await;
	}

	/// Queue every delivery in order. A full queue drops the event for that
	/// connection only; closed queues are forgotten.
	pub async fn deliver(&self, deliveries: Vec<Delivery>) {
		if deliveries.is_empty() {
			return;
		}

		let mut inner = self.inner.lock().await;
		let mut dropped_total: u64 = 0;
		let mut closed = Vec::new();

		for Delivery { audience, event } in deliveries {
			let targets = match audience {
				Audience::Connection(id) => vec![id],
				Audience::Connections(ids) => ids,
				Audience::Everyone => inner.connections.keys().copied().collect(),
			};

			for id in targets {
				let Some(sender) = inner.connections.get(&id) else {
					continue;
				};

				match sender.try_send(event.clone()) {
					Ok(()) => {}
					Err(mpsc::error::TrySendError::Full(_)) => {
						dropped_total += 1;
						metrics::counter!("buzzed_server_outbound_dropped_total").increment(1);
					}
					Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
				}
			}
		}

		for id in closed {
			inner.connections.remove(&id);
		}

		if self.cfg.debug_logs && dropped_total > 0 {
			debug!(dropped = dropped_total, "hub: dropped due to full connection queues");
		}
	}

	pub async fn attached_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.connections.values().filter(|s| !s.is_closed()).count()
	}
}
