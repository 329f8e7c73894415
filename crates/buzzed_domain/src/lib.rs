#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod records;

pub use records::{
	BuddyRelation, BuddyStatus, DEFAULT_TEXT_COLOR, DirectMessage, ReplyRef, Role, Room, RoomCustomization, RoomMessage,
	TextFormatting, UserAccount,
};

/// Maximum username length (characters, after trimming).
pub const MAX_USERNAME_CHARS: usize = 32;

/// Maximum room name length (characters, after trimming).
pub const MAX_ROOM_NAME_CHARS: usize = 30;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("too long: {len} characters (max {max})")]
	TooLong { len: usize, max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Display identity of a connection, ephemeral or registered.
///
/// Comparison is exact; use [`Username::folded`] for the case-insensitive
/// key registered identities are unique on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
	/// Create a trimmed, non-empty username without control characters.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let name = name.trim();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let len = name.chars().count();
		if len > MAX_USERNAME_CHARS {
			return Err(ParseIdError::TooLong {
				len,
				max: MAX_USERNAME_CHARS,
			});
		}

		if name.chars().any(char::is_control) {
			return Err(ParseIdError::InvalidFormat("control characters are not allowed".into()));
		}

		Ok(Self(name.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}

	/// Case-folded key.
	pub fn folded(&self) -> String {
		fold_name(&self.0)
	}

	/// Case-insensitive equality.
	pub fn eq_folded(&self, other: &Username) -> bool {
		self.folded() == other.folded()
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s)
	}
}

impl TryFrom<String> for Username {
	type Error = ParseIdError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		Username::new(s)
	}
}

impl From<Username> for String {
	fn from(u: Username) -> Self {
		u.0
	}
}

/// Lowercase key used for case-insensitive uniqueness of user and room names.
pub fn fold_name(name: &str) -> String {
	name.trim().to_lowercase()
}

/// Validate a (sanitized) room name and return its trimmed form.
pub fn validate_room_name(name: &str) -> Result<String, ParseIdError> {
	let name = name.trim();
	if name.is_empty() {
		return Err(ParseIdError::Empty);
	}

	let len = name.chars().count();
	if len > MAX_ROOM_NAME_CHARS {
		return Err(ParseIdError::TooLong {
			len,
			max: MAX_ROOM_NAME_CHARS,
		});
	}

	Ok(name.to_string())
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}

			/// Create a new random id.
			pub fn new_v4() -> Self {
				Self(uuid::Uuid::new_v4().to_string())
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.trim().to_string())
			}
		}

		impl TryFrom<String> for $name {
			type Error = ParseIdError;

			fn try_from(s: String) -> Result<Self, Self::Error> {
				s.parse()
			}
		}

		impl From<$name> for String {
			fn from(id: $name) -> Self {
				id.0
			}
		}
	};
}

string_id!(
	/// Durable room identifier.
	RoomId
);

string_id!(
	/// Durable identifier of a room or direct message.
	MessageId
);

/// Server-issued transport connection id, also handed to the client as its
/// session id for reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
	/// Create a new random connection id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ConnectionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}
