#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn reply(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp
}

fn route(method: &Method, path: &str, ready: bool) -> (StatusCode, &'static str) {
	if method != Method::GET {
		return (StatusCode::METHOD_NOT_ALLOWED, "");
	}

	match path {
		"/healthz" => (StatusCode::OK, "ok"),
		"/readyz" if ready => (StatusCode::OK, "ready"),
		"/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "not-ready"),
		_ => (StatusCode::NOT_FOUND, ""),
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (status, body) = route(req.method(), req.uri().path(), state.is_ready());
	Ok(reply(status, body))
}
