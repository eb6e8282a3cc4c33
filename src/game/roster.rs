//! Match membership handed from matchmaking to the tick loop

use serde::Serialize;
use uuid::Uuid;

use super::rules::{MatchMode, TeamId};

/// One player slot in a match
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub player_id: Uuid,
    pub rating: f64,
    pub team: TeamId,
}

/// Players assigned to a match with their teams and ratings at match start
#[derive(Debug, Clone, Serialize)]
pub struct MatchRoster {
    pub match_id: Uuid,
    pub mode: MatchMode,
    pub entries: Vec<RosterEntry>,
}

impl MatchRoster {
    pub fn new(match_id: Uuid, mode: MatchMode, entries: Vec<RosterEntry>) -> Self {
        Self {
            match_id,
            mode,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, player_id: Uuid) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.player_id == player_id)
    }

    pub fn team_of(&self, player_id: Uuid) -> Option<TeamId> {
        self.entry(player_id).map(|e| e.team)
    }

    /// Position of the player within their team, used to spread spawns
    pub fn team_index(&self, player_id: Uuid) -> usize {
        let Some(team) = self.team_of(player_id) else {
            return 0;
        };
        self.entries
            .iter()
            .filter(|e| e.team == team)
            .position(|e| e.player_id == player_id)
            .unwrap_or(0)
    }

    pub fn members(&self, team: TeamId) -> impl Iterator<Item = &RosterEntry> {
        self.entries.iter().filter(move |e| e.team == team)
    }

    /// Distinct teams in roster order
    pub fn teams(&self) -> Vec<TeamId> {
        let mut teams: Vec<TeamId> = Vec::new();
        for entry in &self.entries {
            if !teams.contains(&entry.team) {
                teams.push(entry.team);
            }
        }
        teams
    }

    pub fn team_average(&self, team: TeamId) -> Option<f64> {
        let (sum, count) = self
            .members(team)
            .fold((0.0, 0usize), |(sum, count), e| (sum + e.rating, count + 1));
        (count > 0).then(|| sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_queries() {
        let players: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let roster = MatchRoster::new(
            Uuid::new_v4(),
            MatchMode::TeamDeathmatch,
            vec![
                RosterEntry { player_id: players[0], rating: 1600.0, team: 0 },
                RosterEntry { player_id: players[1], rating: 1400.0, team: 1 },
                RosterEntry { player_id: players[2], rating: 1400.0, team: 0 },
                RosterEntry { player_id: players[3], rating: 1600.0, team: 1 },
            ],
        );

        assert_eq!(roster.teams(), vec![0, 1]);
        assert_eq!(roster.team_of(players[3]), Some(1));
        assert_eq!(roster.team_index(players[2]), 1);
        assert_eq!(roster.team_average(0), Some(1500.0));
        assert_eq!(roster.team_average(7), None);
        assert_eq!(roster.team_of(Uuid::new_v4()), None);
    }
}
