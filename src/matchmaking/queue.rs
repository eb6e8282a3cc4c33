//! Matchmaking queue implementation

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::session::SessionId;

/// Player in the matchmaking queue
#[derive(Debug, Clone)]
pub struct QueuedPlayer {
    pub player_id: Uuid,
    /// Session allocated for the player's connection
    pub session: SessionId,
    pub rating: f64,
    pub queued_at: Instant,
}

impl QueuedPlayer {
    pub fn new(player_id: Uuid, session: SessionId, rating: f64) -> Self {
        Self {
            player_id,
            session,
            rating,
            queued_at: Instant::now(),
        }
    }

    /// How long this player has been waiting as of `now`
    pub fn wait_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.queued_at)
    }
}

/// Grouping parameters
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Players in a full match
    pub players_per_match: usize,
    /// Smallest group formed once someone has waited `max_wait`
    pub min_players: usize,
    /// Rating window around a waiting player
    pub skill_tolerance: f64,
    /// Window growth per second of waiting
    pub widen_per_sec: f64,
    pub max_wait: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            players_per_match: 4,
            min_players: 2,
            skill_tolerance: 100.0,
            widen_per_sec: 25.0,
            max_wait: Duration::from_secs(60),
        }
    }
}

/// The matchmaking queue
pub struct MatchmakingQueue {
    queue: VecDeque<QueuedPlayer>,
    settings: QueueSettings,
}

impl MatchmakingQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            queue: VecDeque::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Add a player to the queue
    pub fn enqueue(&mut self, player: QueuedPlayer) {
        // Remove if already in queue (rejoin)
        self.queue.retain(|p| p.player_id != player.player_id);
        self.queue.push_back(player);
    }

    /// Remove a player from the queue
    pub fn dequeue(&mut self, player_id: Uuid) -> Option<QueuedPlayer> {
        let pos = self.queue.iter().position(|p| p.player_id == player_id)?;
        self.queue.remove(pos)
    }

    /// Drop every queued player the predicate rejects
    pub fn retain(&mut self, keep: impl FnMut(&QueuedPlayer) -> bool) {
        self.queue.retain(keep);
    }

    pub fn contains(&self, player_id: &Uuid) -> bool {
        self.queue.iter().any(|p| &p.player_id == player_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedPlayer> {
        self.queue.iter()
    }

    /// Rating window of a player, widened by how long they have waited
    pub fn tolerance(&self, player: &QueuedPlayer, now: Instant) -> f64 {
        self.settings.skill_tolerance
            + self.settings.widen_per_sec * player.wait_time(now).as_secs_f64()
    }

    /// Try to form one group, oldest waiter first.
    ///
    /// Each waiter anchors a candidate group of the players whose ratings lie
    /// inside both their own and the anchor's window, nearest rating first.
    /// A full group is taken as soon as one exists. An anchor that has waited
    /// past `max_wait` takes its nearest neighbours regardless of rating, as
    /// long as that makes at least `min_players`.
    pub fn try_form_group(&mut self, now: Instant) -> Option<Vec<QueuedPlayer>> {
        let size = self.settings.players_per_match;

        for anchor_idx in 0..self.queue.len() {
            let anchor = &self.queue[anchor_idx];
            let anchor_window = self.tolerance(anchor, now);

            let mut by_distance: Vec<(usize, f64)> = self
                .queue
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != anchor_idx)
                .map(|(idx, p)| (idx, (p.rating - anchor.rating).abs()))
                .collect();
            by_distance.sort_by(|a, b| a.1.total_cmp(&b.1));

            let compatible: Vec<usize> = by_distance
                .iter()
                .filter(|(idx, distance)| {
                    *distance <= anchor_window.min(self.tolerance(&self.queue[*idx], now))
                })
                .map(|(idx, _)| *idx)
                .take(size.saturating_sub(1))
                .collect();

            let members = if compatible.len() + 1 >= size {
                compatible
            } else if anchor.wait_time(now) >= self.settings.max_wait
                && self.queue.len() >= self.settings.min_players
            {
                by_distance
                    .iter()
                    .map(|(idx, _)| *idx)
                    .take(size.saturating_sub(1))
                    .collect()
            } else {
                continue;
            };

            let mut indices: Vec<usize> = members;
            indices.push(anchor_idx);
            indices.sort_unstable_by(|a, b| b.cmp(a));
            let mut group: Vec<QueuedPlayer> = indices
                .into_iter()
                .filter_map(|idx| self.queue.remove(idx))
                .collect();
            // Removed back to front; restore queue order
            group.reverse();
            return Some(group);
        }

        None
    }
}

impl Default for MatchmakingQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(rating: f64, waited_secs: u64, now: Instant) -> QueuedPlayer {
        QueuedPlayer {
            player_id: Uuid::new_v4(),
            session: 0,
            rating,
            queued_at: now - Duration::from_secs(waited_secs),
        }
    }

    fn settings(players_per_match: usize) -> QueueSettings {
        QueueSettings {
            players_per_match,
            ..QueueSettings::default()
        }
    }

    #[test]
    fn groups_players_within_tolerance() {
        let now = Instant::now();
        let mut queue = MatchmakingQueue::new(settings(2));
        queue.enqueue(player(1500.0, 0, now));
        queue.enqueue(player(2100.0, 0, now));
        queue.enqueue(player(1550.0, 0, now));

        let group = queue.try_form_group(now).unwrap();
        let ratings: Vec<f64> = group.iter().map(|p| p.rating).collect();
        assert_eq!(ratings, vec![1500.0, 1550.0]);
        assert_eq!(queue.len(), 1);
        assert!(queue.try_form_group(now).is_none());
    }

    #[test]
    fn tolerance_widens_with_wait() {
        let now = Instant::now();
        let mut queue = MatchmakingQueue::new(settings(2));
        queue.enqueue(player(1500.0, 0, now));
        queue.enqueue(player(1800.0, 0, now));
        assert!(queue.try_form_group(now).is_none());

        // 300 apart: both need a window of 300, i.e. 8 s of waiting at 25/s
        let later = now + Duration::from_secs(8);
        assert_eq!(queue.try_form_group(later).map(|g| g.len()), Some(2));
    }

    #[test]
    fn long_wait_forms_smaller_group() {
        let now = Instant::now();
        let mut queue = MatchmakingQueue::new(settings(4));
        queue.enqueue(player(1000.0, 61, now));
        queue.enqueue(player(2500.0, 0, now));
        queue.enqueue(player(1200.0, 0, now));

        let group = queue.try_form_group(now).unwrap();
        assert_eq!(group.len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn lone_player_is_never_matched() {
        let now = Instant::now();
        let mut queue = MatchmakingQueue::new(settings(4));
        queue.enqueue(player(1500.0, 600, now));
        assert!(queue.try_form_group(now).is_none());
    }

    #[test]
    fn rejoin_replaces_entry() {
        let now = Instant::now();
        let mut queue = MatchmakingQueue::default();
        let mut p = player(1500.0, 0, now);
        queue.enqueue(p.clone());
        p.rating = 1600.0;
        queue.enqueue(p.clone());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue(p.player_id).map(|p| p.rating), Some(1600.0));
    }
}
