#![forbid(unsafe_code)]

mod config;
mod server;
mod store;
mod util;

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use buzzed_domain::Role;
use buzzed_protocol::version::{PROTOCOL_MAJOR, PROTOCOL_MINOR};
use buzzed_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::DEFAULT_BIND;
use crate::server::auth::SessionTokens;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub::{Hub, HubConfig};
use crate::server::password::PasswordHasher;
use crate::server::session::{Dispatcher, SessionSettings};
use crate::store::{MemoryStore, SqliteStore, Store};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: buzzed_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: {DEFAULT_BIND})\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

/// `--bind` override, if given.
fn parse_args() -> Option<WsEndpoint> {
	let mut bind_endpoint = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind_endpoint.map(|v| {
		WsEndpoint::parse(&v).unwrap_or_else(|e| {
			eprintln!("{e}");
			usage_and_exit();
		})
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,buzzed_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("buzzed_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn Store>> {
	match database_url {
		Some(url) => {
			let store = SqliteStore::connect(url).await?;
			info!("persistence: sqlite store ready");
			Ok(Arc::new(store))
		}
		None => {
			warn!("persistence: no database_url configured; using in-memory store (data is lost on restart)");
			Ok(Arc::new(MemoryStore::new()))
		}
	}
}

async fn seed_admins(store: &dyn Store, admins: &[String]) -> anyhow::Result<()> {
	for name in admins {
		if store.set_role(name, Role::Admin).await.context("seed admin role")? {
			info!(username = %name, "persistence: admin role granted");
		} else {
			info!(username = %name, "persistence: admin account not registered yet; role granted on registration");
		}
	}
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_override = parse_args();

	let config_path = crate::config::default_config_path()?;
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = bind_override {
		server_cfg.server.bind = bind;
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = open_store(server_cfg.persistence.database_url.as_deref()).await?;
	seed_admins(store.as_ref(), &server_cfg.persistence.admin_usernames).await?;

	let tokens = match server_cfg.session.token_secret.clone() {
		Some(secret) => SessionTokens::new(secret, server_cfg.session.token_ttl),
		None => SessionTokens::ephemeral(server_cfg.session.token_ttl),
	};

	let hub = Hub::new(HubConfig {
		connection_queue_capacity: server_cfg.server.outbound_queue_capacity,
		debug_logs: false,
	});

	let dispatcher = Arc::new(Dispatcher::new(
		store,
		hub,
		tokens,
		PasswordHasher::new(server_cfg.session.password_iterations),
		SessionSettings {
			grace_period: server_cfg.session.grace_period,
			legacy_event_aliases: server_cfg.server.legacy_event_aliases,
			admin_usernames: server_cfg.persistence.admin_usernames.clone(),
			..SessionSettings::default()
		},
	));

	{
		let dispatcher = Arc::clone(&dispatcher);
		let every = server_cfg.session.sweep_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(every);
			loop {
				ticker.tick().await;
				dispatcher.purge_expired().await;
			}
		});
	}

	let conn_settings = ConnectionSettings {
		max_frame_bytes: server_cfg.server.max_frame_bytes,
		allowed_origins: server_cfg.server.allowed_origins.clone(),
		command_rate_limit_per_conn_burst: server_cfg.server.command_rate_limit_per_conn_burst,
		command_rate_limit_per_conn_per_minute: server_cfg.server.command_rate_limit_per_conn_per_minute,
	};

	let bind_addr = server_cfg
		.server
		.bind
		.resolve()
		.map_err(|e| anyhow!(e))
		.context("resolve bind address")?;
	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {}", server_cfg.server.bind))?;

	info!(
		bind = %server_cfg.server.bind,
		protocol = %format!("{PROTOCOL_MAJOR}.{PROTOCOL_MINOR}"),
		"buzzed_server: websocket endpoint ready"
	);
	health_state.mark_ready();

	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		metrics::counter!("buzzed_server_connections_total").increment(1);

		let dispatcher = Arc::clone(&dispatcher);
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(stream, peer, dispatcher, conn_settings).await {
				warn!(%peer, error = %e, "connection handler exited with error");
			}
		});
	}
}
