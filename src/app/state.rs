//! Application state shared across routes

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, SimConfig};
use crate::game::providers::{ArenaEntityFactory, EntityFactory, LevelGeometry, WalledArena};
use crate::game::{MatchRegistry, MatchServices};
use crate::matchmaking::rating::DEFAULT_RATING;
use crate::matchmaking::{
    InMemoryRatingStore, MatchmakingService, MatchmakingSettings, QueueSettings, RatingStore,
};
use crate::session::SessionDirectory;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sim: Arc<SimConfig>,
    pub registry: Arc<MatchRegistry>,
    pub directory: Arc<SessionDirectory>,
    pub ratings: Arc<dyn RatingStore>,
    pub matchmaking: Arc<MatchmakingService>,
}

impl AppState {
    /// State with the built-in arena and an in-memory rating store
    pub fn new(config: Config) -> Self {
        let services = MatchServices {
            geometry: Arc::new(WalledArena::default()) as Arc<dyn LevelGeometry>,
            factory: Arc::new(ArenaEntityFactory::default()) as Arc<dyn EntityFactory>,
        };
        let ratings: Arc<dyn RatingStore> = Arc::new(InMemoryRatingStore::new(DEFAULT_RATING));
        Self::with_collaborators(config, services, ratings)
    }

    /// State with caller-supplied level, content and rating collaborators
    pub fn with_collaborators(
        config: Config,
        services: MatchServices,
        ratings: Arc<dyn RatingStore>,
    ) -> Self {
        let sim = Arc::new(config.sim());
        let config = Arc::new(config);

        // Initialize match registry and session directory
        let registry = Arc::new(MatchRegistry::new());
        let directory = Arc::new(SessionDirectory::new());

        let settings = MatchmakingSettings {
            mode: config.match_mode,
            queue: QueueSettings {
                players_per_match: config.players_per_match,
                min_players: config.min_players,
                skill_tolerance: config.skill_tolerance,
                widen_per_sec: config.tolerance_widen_per_sec,
                max_wait: Duration::from_millis(config.max_queue_wait_ms),
            },
            k_factor: config.elo_k_factor,
        };

        // Initialize matchmaking service (Arc for sharing across cloned AppState)
        let matchmaking = Arc::new(MatchmakingService::new(
            settings,
            registry.clone(),
            directory.clone(),
            ratings.clone(),
            sim.clone(),
            services,
        ));

        Self {
            config,
            sim,
            registry,
            directory,
            ratings,
            matchmaking,
        }
    }
}
