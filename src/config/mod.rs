//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::game::rules::{MatchMode, RuleSettings};
use crate::game::validator::ValidatorConfig;
use crate::session::SessionConfig;
use crate::util::time::TickRate;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed CORS origins for the HTTP routes (comma-separated)
    pub client_origin: String,

    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Interpolation delay advertised to clients
    pub interp_buffer_ms: u64,
    /// Silence before an active session goes stale
    pub stale_threshold_ms: u64,
    /// Silence before a session becomes a spectator
    pub spectator_threshold_ms: u64,
    /// Window in which a dropped session can be resumed
    pub reconnect_grace_ms: u64,
    /// Snapshots kept for rewind and delta baselines
    pub snapshot_capacity: usize,
    /// Longest rewind lag compensation must be able to serve
    pub max_rewind_ms: u64,
    pub ingress_capacity: usize,
    pub egress_capacity: usize,
    pub respawn_delay_ms: u64,

    /// Movement speed cap (units per second)
    pub max_speed: f32,
    /// Shots per second cap across all weapons
    pub max_fire_rate: f32,
    /// Z-score above which a headshot ratio is flagged
    pub anomaly_z_threshold: f64,

    pub match_mode: MatchMode,
    pub players_per_match: usize,
    /// Smallest group a long-waiting player will be matched into
    pub min_players: usize,
    /// Rating window for grouping, before widening
    pub skill_tolerance: f64,
    /// Rating window growth per second of waiting
    pub tolerance_widen_per_sec: f64,
    /// Wait after which the smallest viable group is formed regardless of skill
    pub max_queue_wait_ms: u64,
    pub elo_k_factor: f64,
    pub score_limit: u32,
    pub match_time_limit_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            client_origin: "http://localhost:3000".to_string(),
            tick_rate: 20,
            interp_buffer_ms: 100,
            stale_threshold_ms: 500,
            spectator_threshold_ms: 5_000,
            reconnect_grace_ms: 10_000,
            snapshot_capacity: 32,
            max_rewind_ms: 1_000,
            ingress_capacity: 64,
            egress_capacity: 64,
            respawn_delay_ms: 3_000,
            max_speed: 24.0,
            max_fire_rate: 12.0,
            anomaly_z_threshold: 3.0,
            match_mode: MatchMode::TeamDeathmatch,
            players_per_match: 4,
            min_players: 2,
            skill_tolerance: 100.0,
            tolerance_widen_per_sec: 25.0,
            max_queue_wait_ms: 60_000,
            elo_k_factor: 32.0,
            score_limit: 30,
            match_time_limit_secs: 600,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let config = Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or(defaults.client_origin),

            tick_rate: parse_var("TICK_RATE", defaults.tick_rate)?,
            interp_buffer_ms: parse_var("INTERP_BUFFER_MS", defaults.interp_buffer_ms)?,
            stale_threshold_ms: parse_var("STALE_THRESHOLD_MS", defaults.stale_threshold_ms)?,
            spectator_threshold_ms: parse_var("SPECTATOR_THRESHOLD_MS", defaults.spectator_threshold_ms)?,
            reconnect_grace_ms: parse_var("RECONNECT_GRACE_MS", defaults.reconnect_grace_ms)?,
            snapshot_capacity: parse_var("SNAPSHOT_CAPACITY", defaults.snapshot_capacity)?,
            max_rewind_ms: parse_var("MAX_REWIND_MS", defaults.max_rewind_ms)?,
            ingress_capacity: parse_var("INGRESS_CAPACITY", defaults.ingress_capacity)?,
            egress_capacity: parse_var("EGRESS_CAPACITY", defaults.egress_capacity)?,
            respawn_delay_ms: parse_var("RESPAWN_DELAY_MS", defaults.respawn_delay_ms)?,

            max_speed: parse_var("MAX_SPEED", defaults.max_speed)?,
            max_fire_rate: parse_var("MAX_FIRE_RATE", defaults.max_fire_rate)?,
            anomaly_z_threshold: parse_var("ANOMALY_Z_THRESHOLD", defaults.anomaly_z_threshold)?,

            match_mode: parse_var("MATCH_MODE", defaults.match_mode)?,
            players_per_match: parse_var("PLAYERS_PER_MATCH", defaults.players_per_match)?,
            min_players: parse_var("MIN_PLAYERS", defaults.min_players)?,
            skill_tolerance: parse_var("SKILL_TOLERANCE", defaults.skill_tolerance)?,
            tolerance_widen_per_sec: parse_var("SKILL_TOLERANCE_WIDEN", defaults.tolerance_widen_per_sec)?,
            max_queue_wait_ms: parse_var("MAX_QUEUE_WAIT_MS", defaults.max_queue_wait_ms)?,
            elo_k_factor: parse_var("ELO_K_FACTOR", defaults.elo_k_factor)?,
            score_limit: parse_var("SCORE_LIMIT", defaults.score_limit)?,
            match_time_limit_secs: parse_var("MATCH_TIME_LIMIT_SECS", defaults.match_time_limit_secs)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 || self.tick_rate > u16::MAX as u32 {
            return Err(ConfigError::Invalid {
                name: "TICK_RATE",
                value: self.tick_rate.to_string(),
            });
        }
        if self.spectator_threshold_ms <= self.stale_threshold_ms {
            return Err(ConfigError::Inconsistent(
                "SPECTATOR_THRESHOLD_MS must exceed STALE_THRESHOLD_MS",
            ));
        }
        let window_ms = self.snapshot_capacity as u64 * TickRate::new(self.tick_rate).interval_ms();
        if window_ms < self.max_rewind_ms {
            return Err(ConfigError::SnapshotWindowTooShort {
                window_ms,
                required_ms: self.max_rewind_ms,
            });
        }
        if self.min_players < 2 || self.players_per_match < self.min_players {
            return Err(ConfigError::Inconsistent(
                "PLAYERS_PER_MATCH must be at least MIN_PLAYERS, which must be at least 2",
            ));
        }
        if self.interp_buffer_ms > u16::MAX as u64 {
            return Err(ConfigError::Invalid {
                name: "INTERP_BUFFER_MS",
                value: self.interp_buffer_ms.to_string(),
            });
        }
        Ok(())
    }

    pub fn tick_rate(&self) -> TickRate {
        TickRate::new(self.tick_rate)
    }

    /// Settings handed to every match
    pub fn sim(&self) -> SimConfig {
        let tick_rate = self.tick_rate();
        SimConfig {
            tick_rate,
            snapshot_capacity: self.snapshot_capacity,
            ingress_capacity: self.ingress_capacity,
            egress_capacity: self.egress_capacity,
            session: SessionConfig {
                stale_after_ms: self.stale_threshold_ms,
                spectate_after_ms: self.spectator_threshold_ms,
                reconnect_grace_ms: self.reconnect_grace_ms,
                interp_delay_ms: self.interp_buffer_ms,
            },
            validator: ValidatorConfig {
                tick_rate,
                max_speed: self.max_speed,
                max_fire_rate: self.max_fire_rate,
                ..ValidatorConfig::default()
            },
            anomaly_z_threshold: self.anomaly_z_threshold,
            respawn_delay: Duration::from_millis(self.respawn_delay_ms),
            join_timeout: Duration::from_secs(30),
            rules: RuleSettings {
                tick_rate,
                score_limit: self.score_limit,
                time_limit: Duration::from_secs(self.match_time_limit_secs),
                ..RuleSettings::default()
            },
        }
    }
}

/// Per-match simulation settings derived from [`Config`]
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub tick_rate: TickRate,
    pub snapshot_capacity: usize,
    pub ingress_capacity: usize,
    pub egress_capacity: usize,
    pub session: SessionConfig,
    pub validator: ValidatorConfig,
    pub anomaly_z_threshold: f64,
    pub respawn_delay: Duration,
    /// A match nobody joins within this window is abandoned
    pub join_timeout: Duration,
    pub rules: RuleSettings,
}

impl Default for SimConfig {
    fn default() -> Self {
        Config::default().sim()
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(&'static str),

    #[error("Snapshot store covers {window_ms} ms but lag compensation needs {required_ms} ms")]
    SnapshotWindowTooShort { window_ms: u64, required_ms: u64 },
}
