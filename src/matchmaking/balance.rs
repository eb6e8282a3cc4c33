//! Team assignment by rating

use uuid::Uuid;

use crate::game::{MatchMode, MatchRoster, RosterEntry, TeamId};

use super::queue::QueuedPlayer;

/// Largest group partitioned by exhaustive search
pub const EXHAUSTIVE_LIMIT: usize = 12;

/// Team per player, in input order
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub teams: Vec<TeamId>,
    /// Absolute difference between the two team average ratings
    pub imbalance: f64,
}

/// Assign teams for a mode
pub fn partition(mode: MatchMode, ratings: &[f64]) -> Partition {
    match mode {
        MatchMode::TeamDeathmatch | MatchMode::Territory => two_teams(ratings),
        // Every player is their own team
        MatchMode::FreeForAll => Partition {
            teams: (0..ratings.len()).map(|i| i as TeamId).collect(),
            imbalance: 0.0,
        },
        MatchMode::Coop => Partition {
            teams: vec![0; ratings.len()],
            imbalance: 0.0,
        },
    }
}

/// Split into two teams of sizes differing by at most one, minimizing the
/// difference of team average ratings
pub fn two_teams(ratings: &[f64]) -> Partition {
    if ratings.len() <= EXHAUSTIVE_LIMIT {
        exhaustive(ratings)
    } else {
        greedy(ratings)
    }
}

fn imbalance(ratings: &[f64], teams: &[TeamId]) -> f64 {
    let mut sums = [0.0f64; 2];
    let mut counts = [0usize; 2];
    for (rating, team) in ratings.iter().zip(teams) {
        let t = (*team as usize).min(1);
        sums[t] += rating;
        counts[t] += 1;
    }
    let avg = |t: usize| {
        if counts[t] == 0 {
            0.0
        } else {
            sums[t] / counts[t] as f64
        }
    };
    (avg(0) - avg(1)).abs()
}

fn exhaustive(ratings: &[f64]) -> Partition {
    let n = ratings.len();
    if n < 2 {
        return Partition {
            teams: vec![0; n],
            imbalance: 0.0,
        };
    }

    let small = n / 2;
    let mut best: Option<Partition> = None;

    // Player 0 always stays on team 0, so each split is visited once
    for mask in 0u32..(1 << (n - 1)) {
        let on_team_one = mask.count_ones() as usize;
        if on_team_one != small && on_team_one != n - small {
            continue;
        }
        let teams: Vec<TeamId> = (0..n)
            .map(|i| if i > 0 && mask & (1 << (i - 1)) != 0 { 1 } else { 0 })
            .collect();
        let score = imbalance(ratings, &teams);
        if best.as_ref().map_or(true, |b| score < b.imbalance) {
            best = Some(Partition {
                teams,
                imbalance: score,
            });
        }
    }

    best.unwrap_or_else(|| greedy(ratings))
}

/// Strongest first, each onto the team with the lower rating total that still has room
fn greedy(ratings: &[f64]) -> Partition {
    let n = ratings.len();
    let capacity = [n.div_ceil(2), n / 2];

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| ratings[*b].total_cmp(&ratings[*a]));

    let mut teams = vec![0 as TeamId; n];
    let mut sums = [0.0f64; 2];
    let mut counts = [0usize; 2];

    for idx in order {
        let team = if counts[0] >= capacity[0] {
            1
        } else if counts[1] >= capacity[1] {
            0
        } else if sums[0] <= sums[1] {
            0
        } else {
            1
        };
        teams[idx] = team as TeamId;
        sums[team] += ratings[idx];
        counts[team] += 1;
    }

    let score = imbalance(ratings, &teams);
    Partition {
        teams,
        imbalance: score,
    }
}

/// Turn a matched group into a roster with balanced teams
pub fn build_roster(match_id: Uuid, mode: MatchMode, group: &[QueuedPlayer]) -> MatchRoster {
    let ratings: Vec<f64> = group.iter().map(|p| p.rating).collect();
    let split = partition(mode, &ratings);
    let entries = group
        .iter()
        .zip(split.teams)
        .map(|(player, team)| RosterEntry {
            player_id: player.player_id,
            rating: player.rating,
            team,
        })
        .collect();
    MatchRoster::new(match_id, mode, entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team_sizes(teams: &[TeamId]) -> (usize, usize) {
        let ones = teams.iter().filter(|t| **t == 1).count();
        (teams.len() - ones, ones)
    }

    #[test]
    fn exhaustive_finds_perfect_split() {
        let ratings = [1000.0, 1100.0, 1200.0, 1300.0];
        let split = two_teams(&ratings);
        assert_eq!(split.imbalance, 0.0);
        assert_eq!(split.teams[0], split.teams[3]);
        assert_eq!(team_sizes(&split.teams), (2, 2));
    }

    #[test]
    fn odd_groups_differ_by_one() {
        let ratings = [1500.0, 1400.0, 1600.0, 1450.0, 1550.0];
        let split = two_teams(&ratings);
        let (a, b) = team_sizes(&split.teams);
        assert_eq!(a.abs_diff(b), 1);
    }

    #[test]
    fn greedy_handles_large_groups() {
        let ratings: Vec<f64> = (0..16).map(|i| 1000.0 + i as f64 * 50.0).collect();
        let split = two_teams(&ratings);
        assert_eq!(team_sizes(&split.teams), (8, 8));
        assert!(split.imbalance <= 50.0, "imbalance {}", split.imbalance);
    }

    #[test]
    fn exhaustive_is_never_worse_than_greedy() {
        let ratings = [2200.0, 1000.0, 1010.0, 1020.0, 1900.0, 1300.0];
        assert!(exhaustive(&ratings).imbalance <= greedy(&ratings).imbalance);
    }

    #[test]
    fn free_for_all_gives_everyone_a_team() {
        let split = partition(MatchMode::FreeForAll, &[1.0, 2.0, 3.0]);
        assert_eq!(split.teams, vec![0, 1, 2]);
        assert_eq!(partition(MatchMode::Coop, &[1.0, 2.0]).teams, vec![0, 0]);
    }
}
