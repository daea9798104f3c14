//! Tracked players.

use chrono::{DateTime, Utc};

use super::ids::PlayerId;

/// A player observed on a live server at least once.
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    /// External GUID.
    pub id: PlayerId,
    /// Display name; unique ignoring case, `None` while unknown or
    /// displaced by a conflicting name.
    pub callsign: Option<String>,
    /// First sighting.
    pub first_seen: DateTime<Utc>,
    /// Latest sighting.
    pub last_seen: DateTime<Utc>,
    /// Region family the player plays most in.
    pub common_region: Option<String>,
    /// Excluded from global rankings.
    pub blacklisted: bool,
    /// `snapshot_taken` of the newest stats snapshot.
    pub latest_snapshot: Option<DateTime<Utc>>,
}

impl Player {
    /// Creates a player first seen at `seen`.
    #[must_use]
    pub fn new(id: PlayerId, callsign: Option<String>, seen: DateTime<Utc>) -> Self {
        Self {
            id,
            callsign,
            first_seen: seen,
            last_seen: seen,
            common_region: None,
            blacklisted: false,
            latest_snapshot: None,
        }
    }

    /// Records a sighting. `last_seen` never moves backwards.
    pub fn mark_seen(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }
}

/// Case-folded form of a callsign used for uniqueness checks.
#[must_use]
pub fn callsign_key(callsign: &str) -> String {
    callsign.to_lowercase()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn mark_seen_only_moves_forward() {
        let t0 = Utc::now();
        let mut player = Player::new(PlayerId::from("p"), None, t0);
        player.mark_seen(t0 - Duration::seconds(30));
        assert_eq!(player.last_seen, t0);
        player.mark_seen(t0 + Duration::seconds(30));
        assert_eq!(player.last_seen, t0 + Duration::seconds(30));
        assert_eq!(player.first_seen, t0);
    }

    #[test]
    fn callsign_key_folds_case() {
        assert_eq!(callsign_key("FooBar"), callsign_key("foobar"));
    }
}
