#![forbid(unsafe_code)]

use buzzed_domain::{ParseIdError, Username};
use rand::Rng as _;
use rand::seq::IndexedRandom as _;

const ADJECTIVES: &[&str] = &["Happy", "Lucky", "Sunny", "Clever", "Swift", "Brave"];
const NOUNS: &[&str] = &["Panda", "Tiger", "Eagle", "Dolphin", "Fox", "Wolf"];

/// Generator for `Adjective + Noun + 3-digit number` names. Collisions are
/// tolerated.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralNames;

impl EphemeralNames {
	pub fn generate(&self) -> Result<Username, ParseIdError> {
		let mut rng = rand::rng();
		let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Happy");
		let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Panda");
		let number: u16 = rng.random_range(100..1000);

		Username::new(format!("{adjective}{noun}{number}"))
	}
}
