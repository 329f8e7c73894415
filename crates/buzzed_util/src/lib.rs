#![forbid(unsafe_code)]

pub mod endpoint {
	use core::fmt;
	use std::net::{SocketAddr, ToSocketAddrs};

	/// Scheme accepted for listen endpoints.
	pub const WS_SCHEME: &str = "ws://";

	/// Parsed `ws://host:port` listen endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		/// Returns `host:port` (IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Same host, different port.
		pub fn with_port(&self, port: u16) -> Result<Self, String> {
			if port == 0 {
				return Err("invalid endpoint port (expected 1..=65535)".to_string());
			}
			Ok(Self {
				host: self.host.clone(),
				port,
			})
		}

		/// Resolve to the first socket address (IP literals or DNS names).
		pub fn resolve(&self) -> Result<SocketAddr, String> {
			let hostport = self.hostport();
			if let Ok(addr) = hostport.parse::<SocketAddr>() {
				return Ok(addr);
			}

			hostport
				.to_socket_addrs()
				.map_err(|e| format!("failed to resolve {hostport}: {e}"))?
				.next()
				.ok_or_else(|| format!("no addresses for {hostport}"))
		}

		/// Parse an endpoint string in the form `ws://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let rest = s
				.strip_prefix(WS_SCHEME)
				.ok_or_else(|| format!("invalid endpoint (expected ws://host:port): {s}"))?;

			let rest = rest.strip_suffix('/').unwrap_or(rest);
			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (path/query/fragment not allowed): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host: {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("invalid endpoint host (IPv6 must be bracketed like ws://[::1]:5000): {s}"));
			}

			let port = match port_str.trim().parse::<u16>() {
				Ok(p) if p > 0 => p,
				_ => return Err(format!("invalid endpoint port (expected 1..=65535): {s}")),
			};

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	impl fmt::Display for WsEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			write!(f, "{WS_SCHEME}{}:{}", self.host, self.port)
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_ipv4_and_displays() {
			let e = WsEndpoint::parse("ws://127.0.0.1:5000").unwrap();
			assert_eq!(e.host, "127.0.0.1");
			assert_eq!(e.port, 5000);
			assert_eq!(e.to_string(), "ws://127.0.0.1:5000");
		}

		#[test]
		fn tolerates_trailing_slash() {
			let e = WsEndpoint::parse("ws://0.0.0.0:8080/").unwrap();
			assert_eq!(e.hostport(), "0.0.0.0:8080");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = WsEndpoint::parse("ws://[::1]:5000").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.resolve().unwrap().to_string(), "[::1]:5000");
		}

		#[test]
		fn rejects_bad_inputs() {
			assert!(WsEndpoint::parse("").is_err());
			assert!(WsEndpoint::parse("quic://127.0.0.1:5000").is_err());
			assert!(WsEndpoint::parse("ws://::1:5000").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:5000/chat").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:0").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1").is_err());
		}

		#[test]
		fn with_port_replaces_port_only() {
			let e = WsEndpoint::parse("ws://127.0.0.1:5000").unwrap().with_port(6000).unwrap();
			assert_eq!(e.hostport(), "127.0.0.1:6000");
			assert!(e.with_port(0).is_err());
		}
	}
}
