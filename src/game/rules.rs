//! Game-mode rules: scoring, completion and the final outcome

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::SessionId;
use crate::util::time::{Tick, TickRate};

use super::entity::Vec2;

pub type TeamId = u8;

/// Game modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Every player for themselves
    FreeForAll,
    /// Two teams, most kills wins
    TeamDeathmatch,
    /// Everyone on one team, survive the clock
    Coop,
    /// Two teams contest a capture zone
    Territory,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchMode::FreeForAll => "ffa",
            MatchMode::TeamDeathmatch => "tdm",
            MatchMode::Coop => "coop",
            MatchMode::Territory => "territory",
        };
        f.write_str(name)
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ffa" | "free_for_all" => Ok(MatchMode::FreeForAll),
            "tdm" | "team_deathmatch" => Ok(MatchMode::TeamDeathmatch),
            "coop" => Ok(MatchMode::Coop),
            "territory" => Ok(MatchMode::Territory),
            other => Err(format!("unknown match mode '{other}'")),
        }
    }
}

/// Scoring-relevant things that happened during a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreEvent {
    Kill {
        killer: SessionId,
        killer_team: TeamId,
        victim: SessionId,
        victim_team: TeamId,
    },
}

/// How a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Winner(TeamId),
    Draw,
}

/// Limits shared by every mode
#[derive(Debug, Clone)]
pub struct RuleSettings {
    pub tick_rate: TickRate,
    /// Kills (deathmatch modes) or seconds held (territory) needed to win
    pub score_limit: u32,
    pub time_limit: Duration,
    pub capture_center: Vec2,
    pub capture_radius: f32,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            tick_rate: TickRate::default(),
            score_limit: 30,
            time_limit: Duration::from_secs(600),
            capture_center: Vec2::ZERO,
            capture_radius: 8.0,
        }
    }
}

impl RuleSettings {
    fn time_limit_ticks(&self) -> Tick {
        self.tick_rate.ticks_in(self.time_limit)
    }
}

/// Mode-specific match logic, driven by the tick loop
pub trait MatchRules: Send {
    fn mode(&self) -> MatchMode;

    fn on_score_event(&mut self, event: &ScoreEvent);

    /// Called once per tick with the team and position of every living entity
    fn on_tick(&mut self, tick: Tick, positions: &[(TeamId, Vec2)]);

    fn is_match_complete(&self) -> bool;

    fn outcome(&self) -> MatchOutcome;

    /// Current score per team
    fn scores(&self) -> BTreeMap<TeamId, u32>;
}

pub fn rules_for(mode: MatchMode, settings: RuleSettings) -> Box<dyn MatchRules> {
    match mode {
        MatchMode::FreeForAll => Box::new(KillRace::new(MatchMode::FreeForAll, settings)),
        MatchMode::TeamDeathmatch => Box::new(KillRace::new(MatchMode::TeamDeathmatch, settings)),
        MatchMode::Coop => Box::new(CoopSurvival::new(settings)),
        MatchMode::Territory => Box::new(Territory::new(settings)),
    }
}

/// Leader of a score table, or a draw when the top score is shared or nobody scored
fn leader(scores: &BTreeMap<TeamId, u32>) -> MatchOutcome {
    let mut ranked: Vec<(TeamId, u32)> = scores.iter().map(|(t, s)| (*t, *s)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    match ranked.as_slice() {
        [(team, top), rest @ ..] if *top > 0 && rest.first().map_or(true, |(_, s)| s < top) => {
            MatchOutcome::Winner(*team)
        }
        _ => MatchOutcome::Draw,
    }
}

/// Free-for-all and team deathmatch: first team to the kill limit wins.
/// In free-for-all every player is their own team.
pub struct KillRace {
    mode: MatchMode,
    settings: RuleSettings,
    kills: BTreeMap<TeamId, u32>,
    tick: Tick,
}

impl KillRace {
    pub fn new(mode: MatchMode, settings: RuleSettings) -> Self {
        Self {
            mode,
            settings,
            kills: BTreeMap::new(),
            tick: 0,
        }
    }
}

impl MatchRules for KillRace {
    fn mode(&self) -> MatchMode {
        self.mode
    }

    fn on_score_event(&mut self, event: &ScoreEvent) {
        let ScoreEvent::Kill {
            killer_team,
            victim_team,
            ..
        } = *event;
        // Team kills never score
        if killer_team != victim_team {
            *self.kills.entry(killer_team).or_default() += 1;
        }
    }

    fn on_tick(&mut self, tick: Tick, _positions: &[(TeamId, Vec2)]) {
        self.tick = tick;
    }

    fn is_match_complete(&self) -> bool {
        self.tick >= self.settings.time_limit_ticks()
            || self.kills.values().any(|k| *k >= self.settings.score_limit)
    }

    fn outcome(&self) -> MatchOutcome {
        leader(&self.kills)
    }

    fn scores(&self) -> BTreeMap<TeamId, u32> {
        self.kills.clone()
    }
}

/// Cooperative survival: the team wins by lasting until the clock runs out
/// with at least one member alive.
pub struct CoopSurvival {
    settings: RuleSettings,
    tick: Tick,
    alive: usize,
    deaths: u32,
}

impl CoopSurvival {
    pub fn new(settings: RuleSettings) -> Self {
        Self {
            settings,
            tick: 0,
            alive: 0,
            deaths: 0,
        }
    }
}

impl MatchRules for CoopSurvival {
    fn mode(&self) -> MatchMode {
        MatchMode::Coop
    }

    fn on_score_event(&mut self, _event: &ScoreEvent) {
        self.deaths += 1;
    }

    fn on_tick(&mut self, tick: Tick, positions: &[(TeamId, Vec2)]) {
        self.tick = tick;
        self.alive = positions.len();
    }

    fn is_match_complete(&self) -> bool {
        self.tick >= self.settings.time_limit_ticks()
    }

    fn outcome(&self) -> MatchOutcome {
        if self.alive > 0 {
            MatchOutcome::Winner(0)
        } else {
            MatchOutcome::Draw
        }
    }

    fn scores(&self) -> BTreeMap<TeamId, u32> {
        BTreeMap::from([(0, self.tick / self.settings.tick_rate.ticks_per_second().max(1))])
    }
}

/// Territory: a team scores while it is the only one inside the capture zone.
/// Score is counted in ticks held and reported in seconds.
pub struct Territory {
    settings: RuleSettings,
    held_ticks: BTreeMap<TeamId, u32>,
    holder: Option<TeamId>,
    tick: Tick,
}

impl Territory {
    pub fn new(settings: RuleSettings) -> Self {
        Self {
            settings,
            held_ticks: BTreeMap::new(),
            holder: None,
            tick: 0,
        }
    }

    pub fn holder(&self) -> Option<TeamId> {
        self.holder
    }

    fn seconds_held(&self, ticks: u32) -> u32 {
        ticks / self.settings.tick_rate.ticks_per_second().max(1)
    }
}

impl MatchRules for Territory {
    fn mode(&self) -> MatchMode {
        MatchMode::Territory
    }

    fn on_score_event(&mut self, _event: &ScoreEvent) {}

    fn on_tick(&mut self, tick: Tick, positions: &[(TeamId, Vec2)]) {
        self.tick = tick;

        let mut inside = positions
            .iter()
            .filter(|(_, pos)| pos.distance(self.settings.capture_center) <= self.settings.capture_radius)
            .map(|(team, _)| *team);

        self.holder = match inside.next() {
            Some(first) if inside.all(|team| team == first) => Some(first),
            _ => None,
        };

        if let Some(team) = self.holder {
            *self.held_ticks.entry(team).or_default() += 1;
        }
    }

    fn is_match_complete(&self) -> bool {
        self.tick >= self.settings.time_limit_ticks()
            || self
                .held_ticks
                .values()
                .any(|ticks| self.seconds_held(*ticks) >= self.settings.score_limit)
    }

    fn outcome(&self) -> MatchOutcome {
        leader(&self.held_ticks)
    }

    fn scores(&self) -> BTreeMap<TeamId, u32> {
        self.held_ticks
            .iter()
            .map(|(team, ticks)| (*team, self.seconds_held(*ticks)))
            .collect()
    }
}
