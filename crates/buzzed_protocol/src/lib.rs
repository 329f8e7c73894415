#![forbid(unsafe_code)]

pub mod events;
pub mod framing;

pub use events::{ClientEvent, ServerEvent};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_client_event, decode_frame, encode_frame, encode_server_event,
	peek_event_name,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
