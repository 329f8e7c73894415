#![forbid(unsafe_code)]

use std::collections::HashMap;

use buzzed_domain::{ConnectionId, Username};

/// Online usernames and the connection events for each one are delivered to.
#[derive(Debug, Default)]
pub struct PresenceTracker {
	delivery: HashMap<Username, ConnectionId>,
}

impl PresenceTracker {
	/// Make `conn` the delivery target of `name` (last writer wins).
	/// Returns `true` when `name` was not online before.
	pub fn adopt(&mut self, name: &Username, conn: ConnectionId) -> bool {
		self.delivery.insert(name.clone(), conn).is_none()
	}

	/// `conn` stops using `name`. When it was the delivery target the target
	/// moves to `fallback`; without one the name goes offline and `true` is
	/// returned.
	pub fn release(&mut self, name: &Username, conn: ConnectionId, fallback: Option<ConnectionId>) -> bool {
		let Some(target) = self.delivery.get_mut(name) else {
			return false;
		};
		if *target != conn {
			return false;
		}

		match fallback {
			Some(next) => {
				*target = next;
				false
			}
			None => {
				self.delivery.remove(name);
				true
			}
		}
	}

	pub fn resolve(&self, name: &Username) -> Option<ConnectionId> {
		self.delivery.get(name).copied()
	}

	pub fn is_online(&self, name: &Username) -> bool {
		self.delivery.contains_key(name)
	}

	/// Online usernames, sorted.
	pub fn online(&self) -> Vec<Username> {
		let mut names = self.delivery.keys().cloned().collect::<Vec<_>>();
		names.sort();
		names
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(s: &str) -> Username {
		Username::new(s).expect("username")
	}

	#[test]
	fn adopt_reports_first_only() {
		let mut p = PresenceTracker::default();
		let (a, b) = (ConnectionId::new_v4(), ConnectionId::new_v4());

		assert!(p.adopt(&user("alice"), a));
		assert!(!p.adopt(&user("alice"), b));
		assert_eq!(p.resolve(&user("alice")), Some(b));
	}

	#[test]
	fn release_by_non_target_is_a_no_op() {
		let mut p = PresenceTracker::default();
		let (a, b) = (ConnectionId::new_v4(), ConnectionId::new_v4());
		p.adopt(&user("alice"), a);
		p.adopt(&user("alice"), b);

		assert!(!p.release(&user("alice"), a, None));
		assert_eq!(p.resolve(&user("alice")), Some(b));
	}

	#[test]
	fn release_moves_target_to_fallback() {
		let mut p = PresenceTracker::default();
		let (a, b) = (ConnectionId::new_v4(), ConnectionId::new_v4());
		p.adopt(&user("alice"), a);

		assert!(!p.release(&user("alice"), a, Some(b)));
		assert_eq!(p.resolve(&user("alice")), Some(b));

		assert!(p.release(&user("alice"), b, None));
		assert!(!p.is_online(&user("alice")));
		assert!(!p.release(&user("alice"), b, None));
	}

	#[test]
	fn online_is_sorted() {
		let mut p = PresenceTracker::default();
		p.adopt(&user("zed"), ConnectionId::new_v4());
		p.adopt(&user("amy"), ConnectionId::new_v4());
		assert_eq!(p.online(), vec![user("amy"), user("zed")]);
	}
}
