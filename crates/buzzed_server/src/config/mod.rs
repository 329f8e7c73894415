#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use buzzed_util::endpoint::WsEndpoint;
use serde::Deserialize;
use tracing::{info, warn};

/// Default listen endpoint.
pub const DEFAULT_BIND: &str = "ws://127.0.0.1:5000";

/// Default config path: `$BUZZED_CONFIG` or `~/.buzzed/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	if let Ok(v) = std::env::var("BUZZED_CONFIG") {
		let v = v.trim();
		if !v.is_empty() {
			return Ok(PathBuf::from(v));
		}
	}

	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".buzzed").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub session: SessionConfig,
	pub persistence: PersistenceSettings,
}

/// Listener and per-connection settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket listen endpoint.
	pub bind: WsEndpoint,
	/// Allowed `Origin` values for the upgrade; empty allows any.
	pub allowed_origins: Vec<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub max_frame_bytes: usize,
	/// Outbound events buffered per connection before drops.
	pub outbound_queue_capacity: usize,
	/// Command rate limiting: per-connection burst size.
	pub command_rate_limit_per_conn_burst: u32,
	/// Command rate limiting: per-connection requests per minute.
	pub command_rate_limit_per_conn_per_minute: u32,
	/// Also emit `username_registered` / `login_successful`.
	pub legacy_event_aliases: bool,
}

/// Identity/session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// How long a disconnected connection id keeps its username.
	pub grace_period: Duration,
	pub sweep_interval: Duration,
	/// HMAC secret for session tokens; random per process when unset.
	pub token_secret: Option<SecretString>,
	pub token_ttl: Duration,
	pub password_iterations: u32,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:). In-memory store when unset.
	pub database_url: Option<String>,
	/// Registered accounts granted the admin role at startup.
	pub admin_usernames: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	session: FileSessionSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	#[serde(default)]
	allowed_origins: Vec<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	command_rate_limit_per_conn_burst: Option<u32>,
	command_rate_limit_per_conn_per_minute: Option<u32>,
	legacy_event_aliases: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	grace_period_minutes: Option<u64>,
	sweep_interval_secs: Option<u64>,
	token_secret: Option<String>,
	token_ttl_hours: Option<u64>,
	password_iterations: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	#[serde(default)]
	admin_usernames: Vec<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let bind_s = file
			.server
			.bind
			.filter(|s| !s.trim().is_empty())
			.unwrap_or_else(|| DEFAULT_BIND.to_string());
		let bind = WsEndpoint::parse(&bind_s).map_err(|e| anyhow!(e).context("server.bind"))?;

		Ok(Self {
			server: ServerSettings {
				bind,
				allowed_origins: clean_list(file.server.allowed_origins),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(buzzed_protocol::DEFAULT_MAX_FRAME_SIZE),
				outbound_queue_capacity: file.server.outbound_queue_capacity.filter(|v| *v > 0).unwrap_or(256),
				command_rate_limit_per_conn_burst: file.server.command_rate_limit_per_conn_burst.unwrap_or(20),
				command_rate_limit_per_conn_per_minute: file.server.command_rate_limit_per_conn_per_minute.unwrap_or(240),
				legacy_event_aliases: file.server.legacy_event_aliases.unwrap_or(false),
			},
			session: SessionConfig {
				grace_period: Duration::from_secs(file.session.grace_period_minutes.unwrap_or(30) * 60),
				sweep_interval: Duration::from_secs(file.session.sweep_interval_secs.filter(|v| *v > 0).unwrap_or(60)),
				token_secret: file
					.session
					.token_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				token_ttl: Duration::from_secs(file.session.token_ttl_hours.filter(|v| *v > 0).unwrap_or(720) * 3600),
				password_iterations: file.session.password_iterations.filter(|v| *v > 0).unwrap_or(100_000),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				admin_usernames: clean_list(file.persistence.admin_usernames),
			},
		})
	}
}

fn clean_list(items: Vec<String>) -> Vec<String> {
	items
		.into_iter()
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
		.collect()
}

fn parse_env_list(v: &str) -> Vec<String> {
	clean_list(v.split(',').map(str::to_string).collect())
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Applies `BUZZED_*` overrides read through `var`.
fn apply_overrides(cfg: &mut ServerConfig, var: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("BUZZED_BIND") {
		match WsEndpoint::parse(&v) {
			Ok(bind) => {
				cfg.server.bind = bind;
				info!("server config: bind overridden by env");
			}
			Err(e) => warn!(error = %e, "server config: ignoring invalid BUZZED_BIND"),
		}
	}

	if let Some(v) = non_empty("BUZZED_PORT")
		&& let Ok(port) = v.parse::<u16>()
	{
		match cfg.server.bind.with_port(port) {
			Ok(bind) => {
				cfg.server.bind = bind;
				info!(port, "server config: port overridden by env");
			}
			Err(e) => warn!(error = %e, "server config: ignoring invalid BUZZED_PORT"),
		}
	}

	if let Some(v) = non_empty("BUZZED_ALLOWED_ORIGINS") {
		cfg.server.allowed_origins = parse_env_list(&v);
		info!(
			origins = cfg.server.allowed_origins.len(),
			"server config: allowed_origins overridden by env"
		);
	}

	if let Some(v) = non_empty("BUZZED_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty("BUZZED_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty("BUZZED_LEGACY_EVENT_ALIASES")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.legacy_event_aliases = enabled;
		info!(enabled, "server config: legacy_event_aliases overridden by env");
	}

	if let Some(v) = non_empty("BUZZED_COMMAND_RATE_LIMIT_PER_CONN_BURST")
		&& let Ok(burst) = v.parse::<u32>()
	{
		cfg.server.command_rate_limit_per_conn_burst = burst;
		info!(burst, "server config: command_rate_limit_per_conn_burst overridden by env");
	}

	if let Some(v) = non_empty("BUZZED_COMMAND_RATE_LIMIT_PER_CONN_PER_MINUTE")
		&& let Ok(rate) = v.parse::<u32>()
	{
		cfg.server.command_rate_limit_per_conn_per_minute = rate;
		info!(
			rate,
			"server config: command_rate_limit_per_conn_per_minute overridden by env"
		);
	}

	if let Some(v) = non_empty("BUZZED_GRACE_PERIOD_MINUTES")
		&& let Ok(minutes) = v.parse::<u64>()
	{
		cfg.session.grace_period = Duration::from_secs(minutes * 60);
		info!(minutes, "session config: grace_period overridden by env");
	}

	if let Some(v) = non_empty("BUZZED_TOKEN_SECRET") {
		cfg.session.token_secret = Some(SecretString::new(v));
		info!("session config: token_secret overridden by env");
	}

	if let Some(v) = non_empty("BUZZED_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = non_empty("BUZZED_ADMIN_USERNAMES") {
		cfg.persistence.admin_usernames = parse_env_list(&v);
		info!(
			admins = cfg.persistence.admin_usernames.len(),
			"persistence: admin_usernames overridden by env"
		);
	}

	if cfg.session.token_secret.is_none() {
		warn!("session config: no token_secret; session tokens will not survive a restart");
	}
}
