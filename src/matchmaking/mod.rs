//! Skill-based matchmaking, team balancing and ratings

pub mod balance;
pub mod queue;
pub mod rating;
pub mod service;

pub use queue::{MatchmakingQueue, QueueSettings, QueuedPlayer};
pub use rating::{InMemoryRatingStore, RatingStore, RatingUpdate, StoreError};
pub use service::{Assignment, MatchmakingError, MatchmakingService, MatchmakingSettings, MatchmakingStatus};
