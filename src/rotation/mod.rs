//! Algorithm-driven choice of the next profile to activate.
//!
//! Three algorithms: `random`, `round_robin`, and `smart`. Smart scores
//! each candidate from its pool record plus the health store's decayed
//! penalty, and annotates every alternative with the reasons behind its
//! score. The reason strings are for rendering, not contracts.

use parking_lot::Mutex;
use rand::rngs::{StdRng, SysRng};
use rand::{RngExt, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::health::HealthStore;
use crate::pool::PooledProfile;
use crate::provider::{is_system_profile, Provider};

/// Score assigned to cooling profiles so they sink below every live one.
const COOLDOWN_SENTINEL: f64 = -1000.0;

const HEALTHY_TOKEN_BONUS: f64 = 30.0;
const EXPIRED_TOKEN_MALUS: f64 = 20.0;
const FRESH_USE_MALUS: f64 = 10.0;
const IDLE_BONUS: f64 = 15.0;
const PRIORITY_WEIGHT: f64 = 10.0;
const ERROR_MALUS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Random,
    RoundRobin,
    Smart,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Random => "random",
            Algorithm::RoundRobin => "round_robin",
            Algorithm::Smart => "smart",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Algorithm::Random),
            "round_robin" | "round-robin" => Ok(Algorithm::RoundRobin),
            "smart" => Ok(Algorithm::Smart),
            other => Err(Error::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// One candidate with its score and the reasons that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct RankedChoice {
    pub name: String,
    pub score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub chosen: String,
    pub algorithm: Algorithm,
    /// Live candidates, best first.
    pub ranked: Vec<RankedChoice>,
    /// Cooling candidates, surfaced separately from the ranking.
    pub cooling: Vec<RankedChoice>,
}

pub struct RotationSelector {
    algorithm: Algorithm,
    health: Option<Arc<HealthStore>>,
    recent_use_window: Duration,
    rng: Mutex<StdRng>,
}

impl RotationSelector {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            health: None,
            recent_use_window: Duration::from_secs(30 * 60),
            rng: Mutex::new(StdRng::try_from_rng(&mut SysRng).unwrap()),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthStore>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_recent_use_window(mut self, window: Duration) -> Self {
        self.recent_use_window = window;
        self
    }

    /// Fixed RNG seed, for deterministic tests of the random algorithm.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Choose the next profile among `profiles`, optionally filtered by
    /// provider. `current` is the currently active profile name, which
    /// round-robin advances past.
    pub fn select(
        &self,
        provider: Option<Provider>,
        profiles: &[PooledProfile],
        current: Option<&str>,
    ) -> Result<Selection> {
        let scoped: Vec<&PooledProfile> = profiles
            .iter()
            .filter(|p| provider.is_none_or(|want| p.provider == want))
            .collect();
        if scoped.is_empty() {
            return Err(Error::NoProfiles);
        }

        let mut candidates: Vec<&PooledProfile> = scoped
            .into_iter()
            .filter(|p| !is_system_profile(&p.name))
            .collect();
        if candidates.is_empty() {
            return Err(Error::NoUserProfiles);
        }
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        match self.algorithm {
            Algorithm::Random => self.select_random(&candidates),
            Algorithm::RoundRobin => Ok(self.select_round_robin(&candidates, current)),
            Algorithm::Smart => Ok(self.select_smart(&candidates)),
        }
    }

    fn select_random(&self, candidates: &[&PooledProfile]) -> Result<Selection> {
        let index = self.rng.lock().random_range(0..candidates.len());
        let chosen = candidates[index].name.clone();
        let ranked = candidates
            .iter()
            .map(|p| RankedChoice {
                name: p.name.clone(),
                score: 0.0,
                reasons: vec!["uniform random candidate".to_string()],
            })
            .collect();
        Ok(Selection {
            chosen,
            algorithm: Algorithm::Random,
            ranked,
            cooling: Vec::new(),
        })
    }

    fn select_round_robin(
        &self,
        candidates: &[&PooledProfile],
        current: Option<&str>,
    ) -> Selection {
        // Candidates arrive sorted; the successor of `current` wraps, and an
        // unknown or absent `current` starts from the top.
        let index = current
            .and_then(|cur| candidates.iter().position(|p| p.name == cur))
            .map_or(0, |i| (i + 1) % candidates.len());
        let chosen = candidates[index].name.clone();

        let ranked = candidates
            .iter()
            .cycle()
            .skip(index)
            .take(candidates.len())
            .map(|p| RankedChoice {
                name: p.name.clone(),
                score: 0.0,
                reasons: vec!["next in rotation order".to_string()],
            })
            .collect();
        Selection {
            chosen,
            algorithm: Algorithm::RoundRobin,
            ranked,
            cooling: Vec::new(),
        }
    }

    fn select_smart(&self, candidates: &[&PooledProfile]) -> Selection {
        let mut ranked = Vec::new();
        let mut cooling = Vec::new();

        for profile in candidates {
            let choice = self.score(profile);
            if profile.is_in_cooldown() {
                cooling.push(choice);
            } else {
                ranked.push(choice);
            }
        }

        // Ties break deterministically by name; the sort above already put
        // candidates in name order and sort_by is stable.
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        cooling.sort_by(|a, b| a.name.cmp(&b.name));

        // With every candidate cooling, surface the least-bad one rather
        // than refusing to answer.
        let chosen = ranked
            .first()
            .or_else(|| cooling.first())
            .map(|c| c.name.clone())
            .unwrap_or_default();

        Selection {
            chosen,
            algorithm: Algorithm::Smart,
            ranked,
            cooling,
        }
    }

    fn score(&self, profile: &PooledProfile) -> RankedChoice {
        let mut score = 0.0;
        let mut reasons = Vec::new();

        if profile.is_in_cooldown() {
            score += COOLDOWN_SENTINEL;
            if let Some(until) = profile.cooldown_until {
                reasons.push(format!("in cooldown until {}", until.to_rfc3339()));
            } else {
                reasons.push("in cooldown".to_string());
            }
        }

        if profile.is_expired() {
            score -= EXPIRED_TOKEN_MALUS;
            reasons.push("token expired".to_string());
        } else if profile.token_expiry.is_some() {
            score += HEALTHY_TOKEN_BONUS;
            reasons.push("token healthy".to_string());
        }

        match profile.last_used {
            Some(last) if chrono::Utc::now() - last
                < chrono::Duration::from_std(self.recent_use_window)
                    .unwrap_or_else(|_| chrono::Duration::minutes(30)) =>
            {
                score -= FRESH_USE_MALUS;
                reasons.push("used recently".to_string());
            }
            _ => {
                score += IDLE_BONUS;
                reasons.push("not recently used".to_string());
            }
        }

        if profile.priority != 0 {
            score += f64::from(profile.priority) * PRIORITY_WEIGHT;
            reasons.push(format!("priority {}", profile.priority));
        }

        if profile.error_count > 0 {
            score -= f64::from(profile.error_count) * ERROR_MALUS;
            reasons.push(format!("{} recent errors", profile.error_count));
        }

        if let Some(health) = &self.health {
            let penalty = health.penalty(profile.provider, &profile.name);
            if penalty > 0.5 {
                score -= penalty;
                reasons.push(format!("rate-limit penalty {penalty:.1}"));
            }
        }

        RankedChoice {
            name: profile.name.clone(),
            score,
            reasons,
        }
    }
}
