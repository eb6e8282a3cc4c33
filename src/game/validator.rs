//! Command validation and anti-cheat heuristics
//!
//! Every command passes through [`CommandValidator::validate`] before it can
//! touch the simulation. Physical checks (speed, damage, fire rate) act on the
//! command itself. The statistical check only annotates sessions; nothing in
//! here bans anyone.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::warn;

use crate::session::SessionId;
use crate::util::time::{Tick, TickRate};

use super::combat::{WeaponKind, WeaponStats};
use super::{Action, Command};

/// Rule a command can violate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    /// Command's tick is further from the server's than the stale-input threshold
    Stale,
    /// Implied movement speed above the cap
    Speed,
    /// Claimed damage above the weapon's per-shot ceiling
    Damage,
    /// Shot arrived before the weapon's minimum interval elapsed
    FireRate,
    /// Command payload cannot be interpreted (e.g. zero aim vector)
    Malformed,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rule::Stale => "stale_input",
            Rule::Speed => "max_speed",
            Rule::Damage => "max_damage",
            Rule::FireRate => "fire_rate",
            Rule::Malformed => "malformed",
        };
        f.write_str(name)
    }
}

/// Outcome of validating one command
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept(Command),
    /// Accepted after being pulled back inside the limits
    Clamp { command: Command, rule: Rule },
    Drop(Rule),
}

/// Validator thresholds
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub tick_rate: TickRate,
    /// Units per second
    pub max_speed: f32,
    /// Shots per second across all weapons
    pub max_fire_rate: f32,
    /// Commands older than this many ticks are never applied
    pub stale_ticks: u32,
    /// Violation count from which clampable commands are dropped instead
    pub drop_after: u32,
    /// Violation count at which the session is flagged for review
    pub flag_after: u32,
    /// Hits remembered per session for the anomaly check
    pub anomaly_window: usize,
    /// Hits required before a session's ratio is evaluated
    pub anomaly_min_samples: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            tick_rate: TickRate::default(),
            max_speed: 24.0,
            max_fire_rate: 12.0,
            stale_ticks: 10,
            drop_after: 3,
            flag_after: 6,
            anomaly_window: 50,
            anomaly_min_samples: 10,
        }
    }
}

/// Decides whether a session's headshot ratio is an outlier. The population
/// holds the ratios of every other session with enough samples.
pub trait AnomalyPolicy: Send {
    fn is_outlier(&self, ratio: f64, population: &[f64]) -> bool;
}

/// Flags ratios more than `threshold` standard deviations above the population mean
#[derive(Debug, Clone)]
pub struct ZScorePolicy {
    pub threshold: f64,
    pub min_population: usize,
    /// Floor for the standard deviation so a uniform population does not make
    /// every small difference infinite
    pub min_std_dev: f64,
}

impl Default for ZScorePolicy {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            min_population: 4,
            min_std_dev: 0.05,
        }
    }
}

impl AnomalyPolicy for ZScorePolicy {
    fn is_outlier(&self, ratio: f64, population: &[f64]) -> bool {
        if population.len() < self.min_population {
            return false;
        }
        let n = population.len() as f64;
        let mean = population.iter().sum::<f64>() / n;
        let variance = population.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let z = (ratio - mean) / variance.sqrt().max(self.min_std_dev);
        z > self.threshold
    }
}

/// Per-session validator memory
#[derive(Debug, Default)]
struct SessionRecord {
    last_shot_ms: HashMap<WeaponKind, u64>,
    last_any_shot_ms: Option<u64>,
    violations: u32,
    flagged: bool,
    /// Rolling window of confirmed hits; true = headshot
    hits: VecDeque<bool>,
    headshots_in_window: usize,
}

impl SessionRecord {
    fn headshot_ratio(&self) -> f64 {
        if self.hits.is_empty() {
            0.0
        } else {
            self.headshots_in_window as f64 / self.hits.len() as f64
        }
    }
}

/// Per-session annotation exposed to the match summary
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionReport {
    pub violations: u32,
    pub flagged: bool,
    pub headshot_ratio: f64,
}

/// Validates commands and tracks per-session anti-cheat state
pub struct CommandValidator {
    config: ValidatorConfig,
    policy: Box<dyn AnomalyPolicy>,
    sessions: HashMap<SessionId, SessionRecord>,
}

impl CommandValidator {
    pub fn new(config: ValidatorConfig, policy: Box<dyn AnomalyPolicy>) -> Self {
        Self {
            config,
            policy,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate a command at the given server tick
    pub fn validate(&mut self, command: Command, current_tick: Tick) -> Verdict {
        if current_tick.abs_diff(command.client_tick) > self.config.stale_ticks {
            return Verdict::Drop(Rule::Stale);
        }

        match command.action {
            Action::Move { displacement } => {
                let dt = self.config.tick_rate.delta();
                let speed = displacement.length() / dt;
                if speed <= self.config.max_speed * 1.001 {
                    return Verdict::Accept(command);
                }

                let max_step = self.config.max_speed * dt;
                if self.escalate(&command, Rule::Speed, speed) {
                    Verdict::Drop(Rule::Speed)
                } else {
                    let mut clamped = command;
                    clamped.action = Action::Move {
                        displacement: displacement.clamp_length(max_step),
                    };
                    Verdict::Clamp {
                        command: clamped,
                        rule: Rule::Speed,
                    }
                }
            }
            Action::Fire {
                weapon,
                direction,
                claimed_damage,
                ..
            } => {
                if direction.normalized().is_none() || !claimed_damage.is_finite() {
                    return Verdict::Drop(Rule::Malformed);
                }

                let stats = WeaponStats::for_kind(weapon);
                if claimed_damage > stats.max_damage_per_shot() + 1e-3 {
                    self.escalate(&command, Rule::Damage, claimed_damage);
                    return Verdict::Drop(Rule::Damage);
                }

                let now_ms = self.config.tick_rate.tick_time_ms(current_tick);
                let global_interval_ms = (1_000.0 / self.config.max_fire_rate.max(0.001)) as u64;
                let record = self.sessions.entry(command.session).or_default();
                let too_soon_for_weapon = record
                    .last_shot_ms
                    .get(&weapon)
                    .is_some_and(|last| now_ms.saturating_sub(*last) < stats.min_interval_ms);
                let too_soon_overall = record
                    .last_any_shot_ms
                    .is_some_and(|last| now_ms.saturating_sub(last) < global_interval_ms);

                if too_soon_for_weapon || too_soon_overall {
                    self.escalate(&command, Rule::FireRate, now_ms as f32);
                    return Verdict::Drop(Rule::FireRate);
                }

                record.last_shot_ms.insert(weapon, now_ms);
                record.last_any_shot_ms = Some(now_ms);
                Verdict::Accept(command)
            }
        }
    }

    /// Record a violation. Returns true when the session has escalated past clamping.
    fn escalate(&mut self, command: &Command, rule: Rule, observed: f32) -> bool {
        let record = self.sessions.entry(command.session).or_default();
        record.violations += 1;

        warn!(
            session_id = command.session,
            sequence = command.sequence,
            action = ?command.action,
            rule = %rule,
            observed,
            violations = record.violations,
            "Command violated anti-cheat rule"
        );

        if record.violations >= self.config.flag_after && !record.flagged {
            record.flagged = true;
            warn!(
                session_id = command.session,
                violations = record.violations,
                "Session flagged for review after repeated violations"
            );
        }

        record.violations >= self.config.drop_after
    }

    /// Feed a confirmed hit into the session's rolling window and run the
    /// anomaly policy. Returns true if this hit caused the session to be flagged.
    pub fn record_hit(&mut self, session: SessionId, headshot: bool) -> bool {
        let window = self.config.anomaly_window.max(1);
        let record = self.sessions.entry(session).or_default();
        record.hits.push_back(headshot);
        if headshot {
            record.headshots_in_window += 1;
        }
        if record.hits.len() > window {
            if record.hits.pop_front() == Some(true) {
                record.headshots_in_window -= 1;
            }
        }

        if record.flagged || record.hits.len() < self.config.anomaly_min_samples {
            return false;
        }
        let ratio = record.headshot_ratio();

        let population: Vec<f64> = self
            .sessions
            .iter()
            .filter(|(id, r)| **id != session && r.hits.len() >= self.config.anomaly_min_samples)
            .map(|(_, r)| r.headshot_ratio())
            .collect();

        if !self.policy.is_outlier(ratio, &population) {
            return false;
        }

        if let Some(record) = self.sessions.get_mut(&session) {
            record.flagged = true;
        }
        warn!(
            session_id = session,
            headshot_ratio = ratio,
            population = population.len(),
            "Session flagged for review: headshot ratio is a statistical outlier"
        );
        true
    }

    pub fn is_flagged(&self, session: SessionId) -> bool {
        self.sessions.get(&session).is_some_and(|r| r.flagged)
    }

    pub fn report(&self, session: SessionId) -> SessionReport {
        self.sessions
            .get(&session)
            .map(|r| SessionReport {
                violations: r.violations,
                flagged: r.flagged,
                headshot_ratio: r.headshot_ratio(),
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Vec2;

    fn validator() -> CommandValidator {
        CommandValidator::new(ValidatorConfig::default(), Box::new(ZScorePolicy::default()))
    }

    fn command(session: SessionId, sequence: u32, client_tick: Tick, action: Action) -> Command {
        Command {
            session,
            sequence,
            client_tick,
            action,
            received_at_ms: 0,
        }
    }

    fn fire(weapon: WeaponKind, claimed_damage: f32) -> Action {
        Action::Fire {
            weapon,
            direction: Vec2::new(1.0, 0.0),
            claimed_damage,
            target: None,
        }
    }

    #[test]
    fn legal_move_is_accepted() {
        let mut v = validator();
        // 20 u/s at 20 Hz
        let cmd = command(1, 1, 100, Action::Move { displacement: Vec2::new(1.0, 0.0) });
        assert_eq!(v.validate(cmd.clone(), 100), Verdict::Accept(cmd));
    }

    #[test]
    fn speeding_is_clamped_then_dropped() {
        let mut v = validator();
        // 40 u/s at 20 Hz against a 24 u/s cap
        let fast = Action::Move { displacement: Vec2::new(2.0, 0.0) };

        match v.validate(command(1, 1, 100, fast), 100) {
            Verdict::Clamp { command, rule: Rule::Speed } => match command.action {
                Action::Move { displacement } => assert!((displacement.length() - 1.2).abs() < 1e-5),
                other => panic!("unexpected action {other:?}"),
            },
            other => panic!("expected clamp, got {other:?}"),
        }
        assert!(matches!(v.validate(command(1, 2, 100, fast), 100), Verdict::Clamp { .. }));
        assert_eq!(v.validate(command(1, 3, 100, fast), 100), Verdict::Drop(Rule::Speed));
        assert!(!v.is_flagged(1));
    }

    #[test]
    fn repeated_violations_flag_but_never_ban() {
        let mut v = validator();
        let fast = Action::Move { displacement: Vec2::new(5.0, 0.0) };
        for seq in 0..6 {
            v.validate(command(7, seq, 50, fast), 50);
        }
        assert!(v.is_flagged(7));
        // Legal commands still go through
        let ok = command(7, 10, 50, Action::Move { displacement: Vec2::new(0.5, 0.0) });
        assert_eq!(v.validate(ok.clone(), 50), Verdict::Accept(ok));
    }

    #[test]
    fn stale_commands_are_dropped() {
        let mut v = validator();
        let cmd = command(1, 1, 89, Action::Move { displacement: Vec2::ZERO });
        assert_eq!(v.validate(cmd, 100), Verdict::Drop(Rule::Stale));
        let fresh = command(1, 2, 90, Action::Move { displacement: Vec2::ZERO });
        assert!(matches!(v.validate(fresh, 100), Verdict::Accept(_)));
    }

    #[test]
    fn future_ticks_beyond_the_window_are_dropped() {
        let mut v = validator();
        let ahead = command(1, 1, 110, Action::Move { displacement: Vec2::ZERO });
        assert!(matches!(v.validate(ahead, 100), Verdict::Accept(_)));
        let forged = command(1, 2, 111, Action::Move { displacement: Vec2::ZERO });
        assert_eq!(v.validate(forged, 100), Verdict::Drop(Rule::Stale));
        let far = command(1, 3, Tick::MAX, Action::Move { displacement: Vec2::ZERO });
        assert_eq!(v.validate(far, 100), Verdict::Drop(Rule::Stale));
    }

    #[test]
    fn overclaimed_damage_is_dropped() {
        let mut v = validator();
        let max = WeaponStats::for_kind(WeaponKind::Rifle).max_damage_per_shot();
        assert!(matches!(
            v.validate(command(1, 1, 10, fire(WeaponKind::Rifle, max)), 10),
            Verdict::Accept(_)
        ));
        assert_eq!(
            v.validate(command(1, 2, 20, fire(WeaponKind::Rifle, max + 1.0)), 20),
            Verdict::Drop(Rule::Damage)
        );
    }

    #[test]
    fn fire_rate_is_tracked_per_weapon() {
        let mut v = validator();
        // Marksman: 900 ms between shots, 18 ticks at 20 Hz
        assert!(matches!(
            v.validate(command(1, 1, 10, fire(WeaponKind::Marksman, 10.0)), 10),
            Verdict::Accept(_)
        ));
        assert_eq!(
            v.validate(command(1, 2, 12, fire(WeaponKind::Marksman, 10.0)), 12),
            Verdict::Drop(Rule::FireRate)
        );
        // A different weapon has its own interval; only the global cap applies
        assert!(matches!(
            v.validate(command(1, 3, 12, fire(WeaponKind::Sidearm, 10.0)), 12),
            Verdict::Accept(_)
        ));
        assert!(matches!(
            v.validate(command(1, 4, 28, fire(WeaponKind::Marksman, 10.0)), 28),
            Verdict::Accept(_)
        ));
        // Other sessions are unaffected
        assert!(matches!(
            v.validate(command(2, 1, 12, fire(WeaponKind::Marksman, 10.0)), 12),
            Verdict::Accept(_)
        ));
    }

    #[test]
    fn headshot_outlier_is_flagged() {
        let mut v = validator();
        for session in 1..=5 {
            for i in 0..20 {
                assert!(!v.record_hit(session, i % 5 == 0));
            }
        }

        let mut flagged = false;
        for _ in 0..20 {
            flagged |= v.record_hit(99, true);
        }
        assert!(flagged);
        assert!(v.is_flagged(99));
        assert!(!v.is_flagged(1));
        assert!((v.report(1).headshot_ratio - 0.2).abs() < 1e-9);
    }

    #[test]
    fn small_population_never_flags() {
        let policy = ZScorePolicy::default();
        assert!(!policy.is_outlier(1.0, &[0.1, 0.1]));
        assert!(policy.is_outlier(1.0, &[0.1, 0.2, 0.15, 0.1]));
        assert!(!policy.is_outlier(0.2, &[0.1, 0.2, 0.15, 0.1]));
    }
}
