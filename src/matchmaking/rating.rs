//! Skill ratings and post-match Elo updates

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Severity;
use crate::game::{MatchMode, MatchOutcome, MatchRoster, TeamId};

/// Rating of a player nobody has seen before
pub const DEFAULT_RATING: f64 = 1500.0;

/// Rating persistence failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("rating store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn severity(&self) -> Severity {
        Severity::Transient
    }
}

/// One player's rating change
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatingUpdate {
    pub player_id: Uuid,
    pub before: f64,
    pub after: f64,
}

impl RatingUpdate {
    pub fn delta(&self) -> f64 {
        self.after - self.before
    }
}

/// Persistence layer for skill ratings. Calls are synchronous and never retried.
pub trait RatingStore: Send + Sync {
    fn rating(&self, player_id: Uuid) -> Result<f64, StoreError>;

    fn record(&self, updates: &[RatingUpdate]) -> Result<(), StoreError>;
}

/// Process-local rating store
pub struct InMemoryRatingStore {
    ratings: DashMap<Uuid, f64>,
    default_rating: f64,
}

impl InMemoryRatingStore {
    pub fn new(default_rating: f64) -> Self {
        Self {
            ratings: DashMap::new(),
            default_rating,
        }
    }

    pub fn set(&self, player_id: Uuid, rating: f64) {
        self.ratings.insert(player_id, rating);
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }
}

impl Default for InMemoryRatingStore {
    fn default() -> Self {
        Self::new(DEFAULT_RATING)
    }
}

impl RatingStore for InMemoryRatingStore {
    fn rating(&self, player_id: Uuid) -> Result<f64, StoreError> {
        Ok(self
            .ratings
            .get(&player_id)
            .map_or(self.default_rating, |r| *r.value()))
    }

    fn record(&self, updates: &[RatingUpdate]) -> Result<(), StoreError> {
        for update in updates {
            self.ratings.insert(update.player_id, update.after);
        }
        Ok(())
    }
}

/// Probability that a side rated `rating` beats one rated `opponent`
pub fn expected_score(rating: f64, opponent: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent - rating) / 400.0))
}

/// Actual score of `team` against `opponent` given the match outcome
fn actual_score(outcome: MatchOutcome, team: TeamId, opponent: TeamId) -> f64 {
    match outcome {
        MatchOutcome::Winner(w) if w == team => 1.0,
        MatchOutcome::Winner(w) if w == opponent => 0.0,
        // Draws, and two losers against each other
        _ => 0.5,
    }
}

/// Elo updates for every roster entry.
///
/// Teams play pairwise against each other using average team ratings. A
/// team's total change is split evenly across its members and scaled so that
/// in a two-team match between equal-sized teams each player moves by the
/// plain `k * (S - E)`. Changes over the whole roster sum to zero. Free-for-all
/// treats each player as a one-player team; co-op has no opponent and produces
/// no updates.
pub fn elo_updates(roster: &MatchRoster, outcome: MatchOutcome, k_factor: f64) -> Vec<RatingUpdate> {
    if roster.mode == MatchMode::Coop {
        return Vec::new();
    }

    let teams = roster.teams();
    if teams.len() < 2 {
        return Vec::new();
    }

    let averages: BTreeMap<TeamId, f64> = teams
        .iter()
        .filter_map(|t| roster.team_average(*t).map(|avg| (*t, avg)))
        .collect();
    let opponents = (teams.len() - 1) as f64;
    let share = roster.len() as f64 / teams.len() as f64;

    let mut per_player: BTreeMap<TeamId, f64> = BTreeMap::new();
    for team in &teams {
        let avg = averages[team];
        let surprise: f64 = teams
            .iter()
            .filter(|other| *other != team)
            .map(|other| actual_score(outcome, *team, *other) - expected_score(avg, averages[other]))
            .sum();
        let size = roster.members(*team).count() as f64;
        per_player.insert(*team, k_factor * surprise / opponents * share / size);
    }

    roster
        .entries
        .iter()
        .map(|entry| RatingUpdate {
            player_id: entry.player_id,
            before: entry.rating,
            after: entry.rating + per_player[&entry.team],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::RosterEntry;

    fn roster(mode: MatchMode, players: &[(f64, TeamId)]) -> MatchRoster {
        MatchRoster::new(
            Uuid::new_v4(),
            mode,
            players
                .iter()
                .map(|(rating, team)| RosterEntry {
                    player_id: Uuid::new_v4(),
                    rating: *rating,
                    team: *team,
                })
                .collect(),
        )
    }

    fn total_delta(updates: &[RatingUpdate]) -> f64 {
        updates.iter().map(RatingUpdate::delta).sum()
    }

    #[test]
    fn even_match_moves_half_k() {
        let r = roster(MatchMode::TeamDeathmatch, &[(1500.0, 0), (1500.0, 1)]);
        let updates = elo_updates(&r, MatchOutcome::Winner(0), 32.0);
        assert!((updates[0].delta() - 16.0).abs() < 1e-9);
        assert!((updates[1].delta() + 16.0).abs() < 1e-9);
    }

    #[test]
    fn team_updates_are_conserved() {
        let r = roster(
            MatchMode::TeamDeathmatch,
            &[(1800.0, 0), (1200.0, 0), (1400.0, 1), (1650.0, 1), (1500.0, 1)],
        );
        for outcome in [MatchOutcome::Winner(0), MatchOutcome::Winner(1), MatchOutcome::Draw] {
            let updates = elo_updates(&r, outcome, 24.0);
            assert!(total_delta(&updates).abs() < 1e-9, "{outcome:?}");
        }
    }

    #[test]
    fn upset_win_pays_more() {
        let r = roster(MatchMode::TeamDeathmatch, &[(1300.0, 0), (1700.0, 1)]);
        let upset = elo_updates(&r, MatchOutcome::Winner(0), 32.0)[0].delta();
        let expected = elo_updates(&r, MatchOutcome::Winner(1), 32.0)[1].delta();
        assert!(upset > expected);
    }

    #[test]
    fn free_for_all_is_pairwise_and_conserved() {
        let r = roster(MatchMode::FreeForAll, &[(1500.0, 0), (1500.0, 1), (1500.0, 2)]);
        let updates = elo_updates(&r, MatchOutcome::Winner(2), 32.0);
        assert!(total_delta(&updates).abs() < 1e-9);
        // Winner scores 1 against both: (0.5 + 0.5) * 32 / 2
        assert!((updates[2].delta() - 16.0).abs() < 1e-9);
        assert!((updates[0].delta() + 8.0).abs() < 1e-9);
    }

    #[test]
    fn coop_has_no_rating_change() {
        let r = roster(MatchMode::Coop, &[(1500.0, 0), (1600.0, 0)]);
        assert!(elo_updates(&r, MatchOutcome::Winner(0), 32.0).is_empty());
    }

    #[test]
    fn store_records_updates() {
        let store = InMemoryRatingStore::default();
        let player = Uuid::new_v4();
        assert_eq!(store.rating(player), Ok(DEFAULT_RATING));
        store
            .record(&[RatingUpdate {
                player_id: player,
                before: DEFAULT_RATING,
                after: 1516.0,
            }])
            .unwrap();
        assert_eq!(store.rating(player), Ok(1516.0));
    }
}
