//! Matchmaking service - manages queue and match creation

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SimConfig;
use crate::error::Severity;
use crate::game::{EndReason, GameMatch, MatchHandle, MatchMode, MatchRegistry, MatchServices, MatchSummary, TeamId};
use crate::session::{SessionDirectory, SessionId};

use super::balance::build_roster;
use super::queue::{MatchmakingQueue, QueueSettings, QueuedPlayer};
use super::rating::{elo_updates, RatingStore, RatingUpdate, StoreError};

/// How often the queue is grouped
pub const GROUPING_INTERVAL: Duration = Duration::from_millis(500);

/// Where a queued player ended up
#[derive(Clone)]
pub struct Assignment {
    pub match_id: Uuid,
    pub team: TeamId,
    pub handle: MatchHandle,
}

/// Matchmaking failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchmakingError {
    #[error("player is already in a match")]
    AlreadyInMatch,

    #[error(transparent)]
    Rating(#[from] StoreError),
}

impl MatchmakingError {
    pub fn severity(&self) -> Severity {
        match self {
            MatchmakingError::AlreadyInMatch => Severity::Protocol,
            MatchmakingError::Rating(e) => e.severity(),
        }
    }
}

/// Snapshot for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MatchmakingStatus {
    pub mode: MatchMode,
    pub queued: usize,
    pub active_matches: usize,
    pub sessions: usize,
}

/// Matchmaking settings derived from the application config
#[derive(Debug, Clone)]
pub struct MatchmakingSettings {
    pub mode: MatchMode,
    pub queue: QueueSettings,
    pub k_factor: f64,
}

/// Matchmaking service
#[derive(Clone)]
pub struct MatchmakingService {
    queue: Arc<Mutex<MatchmakingQueue>>,
    settings: Arc<MatchmakingSettings>,
    /// Players waiting for an assignment
    pending: Arc<DashMap<Uuid, oneshot::Sender<Assignment>>>,
    /// Map of player -> current match
    player_matches: Arc<DashMap<Uuid, Uuid>>,
    registry: Arc<MatchRegistry>,
    directory: Arc<SessionDirectory>,
    ratings: Arc<dyn RatingStore>,
    sim: Arc<SimConfig>,
    services: MatchServices,
}

impl MatchmakingService {
    pub fn new(
        settings: MatchmakingSettings,
        registry: Arc<MatchRegistry>,
        directory: Arc<SessionDirectory>,
        ratings: Arc<dyn RatingStore>,
        sim: Arc<SimConfig>,
        services: MatchServices,
    ) -> Self {
        Self {
            queue: Arc::new(Mutex::new(MatchmakingQueue::new(settings.queue.clone()))),
            settings: Arc::new(settings),
            pending: Arc::new(DashMap::new()),
            player_matches: Arc::new(DashMap::new()),
            registry,
            directory,
            ratings,
            sim,
            services,
        }
    }

    /// Join matchmaking queue. The receiver resolves once the player has been
    /// placed in a match; it is dropped unresolved if the player leaves.
    pub async fn join_queue(
        &self,
        player_id: Uuid,
        session: SessionId,
    ) -> Result<oneshot::Receiver<Assignment>, MatchmakingError> {
        if self.player_matches.contains_key(&player_id) {
            return Err(MatchmakingError::AlreadyInMatch);
        }
        let rating = self.ratings.rating(player_id)?;

        let (tx, rx) = oneshot::channel();
        let mut queue = self.queue.lock().await;
        self.pending.insert(player_id, tx);
        queue.enqueue(QueuedPlayer::new(player_id, session, rating));

        info!(
            player_id = %player_id,
            session_id = session,
            rating,
            queue_size = queue.len(),
            "Player joined matchmaking queue"
        );
        Ok(rx)
    }

    /// Leave matchmaking queue
    pub async fn leave_queue(&self, player_id: Uuid) {
        let mut queue = self.queue.lock().await;
        if queue.dequeue(player_id).is_some() {
            info!(player_id = %player_id, "Player left matchmaking queue");
        }
        self.pending.remove(&player_id);
    }

    /// Run the matchmaking service (periodic queue processing)
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(GROUPING_INTERVAL);

        loop {
            interval.tick().await;
            for group in self.form_groups(Instant::now()).await {
                self.create_match(group);
            }
        }
    }

    /// Group everything that can be grouped right now
    pub async fn form_groups(&self, now: Instant) -> Vec<Vec<QueuedPlayer>> {
        let mut queue = self.queue.lock().await;

        // Players whose connection went away while waiting
        let pending = self.pending.clone();
        queue.retain(|p| {
            let waiting = pending.get(&p.player_id).is_some_and(|tx| !tx.is_closed());
            if !waiting {
                pending.remove(&p.player_id);
            }
            waiting
        });

        let mut groups = Vec::new();
        while let Some(group) = queue.try_form_group(now) {
            groups.push(group);
        }
        groups
    }

    /// Create a match with the given players and tell each of them where to go
    fn create_match(&self, group: Vec<QueuedPlayer>) -> Uuid {
        let match_id = Uuid::new_v4();
        let roster = build_roster(match_id, self.settings.mode, &group);
        let seed = rand::random::<u64>();

        let (game_match, handle) =
            GameMatch::new(roster.clone(), self.sim.clone(), self.services.clone(), seed);

        // Register match
        self.registry.insert(handle.clone());
        for player in &group {
            self.player_matches.insert(player.player_id, match_id);
            self.directory.bind(player.session, match_id, player.player_id);
        }

        info!(
            match_id = %match_id,
            mode = %roster.mode,
            player_count = group.len(),
            "Created new match"
        );

        // Spawn match task
        let this = self.clone();
        tokio::spawn(async move {
            let summary = game_match.run().await;
            this.complete_match(&summary);
        });

        for entry in &roster.entries {
            let Some((_, tx)) = self.pending.remove(&entry.player_id) else {
                continue;
            };
            let assignment = Assignment {
                match_id,
                team: entry.team,
                handle: handle.clone(),
            };
            if tx.send(assignment).is_err() {
                warn!(match_id = %match_id, player_id = %entry.player_id, "Player left before assignment");
            }
        }

        match_id
    }

    /// Cleanup and rating updates after a match ends
    fn complete_match(&self, summary: &MatchSummary) {
        if summary.end_reason == EndReason::Completed {
            match self.apply_ratings(summary) {
                Ok(updates) => {
                    for update in &updates {
                        info!(
                            match_id = %summary.match_id,
                            player_id = %update.player_id,
                            before = update.before,
                            after = update.after,
                            "Rating updated"
                        );
                    }
                }
                Err(e) => {
                    error!(match_id = %summary.match_id, error = %e, "Failed to record rating updates");
                }
            }
        }

        self.registry.remove(&summary.match_id);
        let unbound = self.directory.unbind_match(summary.match_id);
        for entry in &summary.roster.entries {
            self.player_matches.remove(&entry.player_id);
        }

        info!(match_id = %summary.match_id, sessions = unbound, "Match removed from registry");
    }

    /// Post-match Elo update against the ratings the match started with
    pub fn apply_ratings(&self, summary: &MatchSummary) -> Result<Vec<RatingUpdate>, StoreError> {
        let updates = elo_updates(&summary.roster, summary.outcome, self.settings.k_factor);
        if !updates.is_empty() {
            self.ratings.record(&updates)?;
        }
        Ok(updates)
    }

    /// Get current queue size
    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Check if player is in queue
    pub async fn is_in_queue(&self, player_id: &Uuid) -> bool {
        self.queue.lock().await.contains(player_id)
    }

    /// Get player's current match ID
    pub fn player_match(&self, player_id: &Uuid) -> Option<Uuid> {
        self.player_matches.get(player_id).map(|r| *r)
    }

    pub async fn status(&self) -> MatchmakingStatus {
        MatchmakingStatus {
            mode: self.settings.mode,
            queued: self.queue_size().await,
            active_matches: self.registry.active_matches(),
            sessions: self.registry.total_sessions(),
        }
    }
}
