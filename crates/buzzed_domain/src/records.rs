#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{MessageId, RoomId, Username};

/// Text color used when a sender does not pick one.
pub const DEFAULT_TEXT_COLOR: &str = "#000000";

/// Appearance settings a room owner may change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCustomization {
	#[serde(default)]
	pub background_url: String,
	#[serde(default)]
	pub cursor_url: String,
	#[serde(default)]
	pub chat_background_url: String,
}

impl RoomCustomization {
	/// Returns a copy where every provided, non-empty field replaces the
	/// current value. Absent or empty fields keep what was there.
	pub fn merged(&self, background_url: Option<&str>, cursor_url: Option<&str>, chat_background_url: Option<&str>) -> Self {
		fn pick(current: &str, update: Option<&str>) -> String {
			match update.map(str::trim) {
				Some(v) if !v.is_empty() => v.to_string(),
				_ => current.to_string(),
			}
		}

		Self {
			background_url: pick(&self.background_url, background_url),
			cursor_url: pick(&self.cursor_url, cursor_url),
			chat_background_url: pick(&self.chat_background_url, chat_background_url),
		}
	}
}

/// A named chat room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	pub owner: Username,
	pub created_at: i64,
	#[serde(default)]
	pub customization: RoomCustomization,
}

/// Snapshot of the message a room message replies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
	#[serde(alias = "_id")]
	pub id: MessageId,
	pub username: String,
	pub content: String,
}

/// A message broadcast to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
	pub id: MessageId,
	pub room_id: RoomId,
	pub username: Username,
	pub content: String,
	pub text_color: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to: Option<ReplyRef>,
	pub created_at: i64,
}

/// Formatting flags of a direct message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFormatting {
	#[serde(default)]
	pub bold: bool,
	#[serde(default)]
	pub italic: bool,
	#[serde(default)]
	pub underline: bool,
}

/// A buddy-to-buddy message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
	pub id: MessageId,
	pub from: Username,
	pub to: Username,
	pub content: String,
	pub text_color: String,
	#[serde(default)]
	pub formatting: TextFormatting,
	pub created_at: i64,
}

impl DirectMessage {
	/// Whether `a` and `b` (in any order) are the two participants.
	pub fn is_between(&self, a: &Username, b: &Username) -> bool {
		(&self.from == a && &self.to == b) || (&self.from == b && &self.to == a)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuddyStatus {
	Pending,
	Accepted,
}

impl BuddyStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			BuddyStatus::Pending => "pending",
			BuddyStatus::Accepted => "accepted",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"pending" => Some(BuddyStatus::Pending),
			"accepted" => Some(BuddyStatus::Accepted),
			_ => None,
		}
	}
}

/// Relation between two users. The pair is unordered and kept normalized
/// (`user_a <= user_b`), so there is at most one relation per pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuddyRelation {
	pub user_a: Username,
	pub user_b: Username,
	pub status: BuddyStatus,
	pub requested_by: Username,
	pub created_at: i64,
}

impl BuddyRelation {
	/// Order two usernames the way relations store them.
	pub fn normalized_pair(a: &Username, b: &Username) -> (Username, Username) {
		if a <= b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) }
	}

	/// The participant that is not `me`.
	pub fn other(&self, me: &Username) -> &Username {
		if &self.user_a == me { &self.user_b } else { &self.user_a }
	}

	pub fn involves(&self, user: &Username) -> bool {
		&self.user_a == user || &self.user_b == user
	}
}

/// Account role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	#[default]
	Member,
	Admin,
}

impl Role {
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Member => "member",
			Role::Admin => "admin",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"member" => Some(Role::Member),
			"admin" => Some(Role::Admin),
			_ => None,
		}
	}
}

/// Registered account. Never sent to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
	pub username: Username,
	pub password_hash: String,
	pub salt: String,
	pub role: Role,
	pub created_at: i64,
}

impl UserAccount {
	pub fn is_admin(&self) -> bool {
		self.role == Role::Admin
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(s: &str) -> Username {
		Username::new(s).unwrap()
	}

	#[test]
	fn customization_merge_keeps_prior_on_empty() {
		let base = RoomCustomization {
			background_url: "bg.png".into(),
			cursor_url: "cur.png".into(),
			chat_background_url: String::new(),
		};

		let merged = base.merged(Some(""), None, Some("chat.png"));
		assert_eq!(merged.background_url, "bg.png");
		assert_eq!(merged.cursor_url, "cur.png");
		assert_eq!(merged.chat_background_url, "chat.png");
	}

	#[test]
	fn buddy_pair_is_normalized() {
		let (a, b) = BuddyRelation::normalized_pair(&user("zed"), &user("amy"));
		assert_eq!(a.as_str(), "amy");
		assert_eq!(b.as_str(), "zed");

		let rel = BuddyRelation {
			user_a: a,
			user_b: b,
			status: BuddyStatus::Pending,
			requested_by: user("zed"),
			created_at: 0,
		};
		assert_eq!(rel.other(&user("zed")).as_str(), "amy");
		assert!(rel.involves(&user("amy")));
		assert!(!rel.involves(&user("bob")));
	}

	#[test]
	fn room_serializes_camel_case() {
		let room = Room {
			id: RoomId::new("r1").unwrap(),
			name: "Lobby".into(),
			owner: user("amy"),
			created_at: 5,
			customization: RoomCustomization::default(),
		};
		let v = serde_json::to_value(&room).unwrap();
		assert_eq!(v["createdAt"], 5);
		assert_eq!(v["customization"]["chatBackgroundUrl"], "");
	}
}
