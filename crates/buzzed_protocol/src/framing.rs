#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::events::{ClientEvent, ServerEvent};

/// Default maximum text frame size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Encode a message into a JSON text frame.
pub fn encode_frame<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<String, FramingError> {
	let text = serde_json::to_string(msg).map_err(FramingError::Encode)?;
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Decode a single JSON text frame.
pub fn decode_frame<M: DeserializeOwned>(text: &str, max_frame_size: usize) -> Result<M, FramingError> {
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	serde_json::from_str(text).map_err(FramingError::Decode)
}

/// Decode a client event frame.
pub fn decode_client_event(text: &str, max_frame_size: usize) -> Result<ClientEvent, FramingError> {
	decode_frame(text, max_frame_size)
}

/// Encode a server event frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_server_event(event: &ServerEvent) -> Result<String, FramingError> {
	encode_frame(event, DEFAULT_MAX_FRAME_SIZE)
}

/// Best-effort read of the `event` name from a frame that failed to decode.
pub fn peek_event_name(text: &str) -> Option<String> {
	#[derive(serde::Deserialize)]
	struct Peek {
		event: String,
	}

	serde_json::from_str::<Peek>(text).ok().map(|p| p.event)
}
