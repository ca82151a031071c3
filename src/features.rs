use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::digest::ContentHasher;
use crate::error::ComputationError;
use crate::facts::{COUNTER_COUNT, Counter, GameMode, MatchFact, Role};

const ROLE_CATEGORIES: usize = 6;
const MODE_CATEGORIES: usize = 10;

/// Half-open time range `[start_ms, end_ms)` over match creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Window {
    pub fn new(start_ms: i64, end_ms: i64) -> Result<Self> {
        if end_ms <= start_ms {
            return Err(anyhow!("window end {end_ms} must be after start {start_ms}"));
        }
        Ok(Self { start_ms, end_ms })
    }

    /// Window between two `YYYY-MM-DD` dates (UTC midnight, end exclusive).
    pub fn from_dates(start: &str, end: &str) -> Result<Self> {
        Self::new(date_to_ms(start)?, date_to_ms(end)?)
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            DateTime::<Utc>::from_timestamp_millis(self.start_ms),
            DateTime::<Utc>::from_timestamp_millis(self.end_ms),
        ) {
            (Some(s), Some(e)) => write!(f, "[{}, {})", s.to_rfc3339(), e.to_rfc3339()),
            _ => write!(f, "[{}, {})", self.start_ms, self.end_ms),
        }
    }
}

fn date_to_ms(raw: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| anyhow!("invalid date `{raw}`: {err}"))?;
    let dt = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("invalid midnight for `{raw}`"))?;
    Ok(dt.and_utc().timestamp_millis())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Role,
    Mode,
    Champion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    /// Σcounter / max(Σduration_secs, floor) × 60.
    PerMinute { counter: Counter },
    /// Σcounter / matches.
    PerMatch { counter: Counter },
    /// Σnumerator / max(Σdenominator, floor).
    Ratio {
        numerator: Vec<Counter>,
        denominator: Vec<Counter>,
        #[serde(default = "default_floor")]
        floor: f64,
    },
    WinRate,
    /// Shannon entropy of the category distribution, normalized to 0..=1.
    Diversity { category: Category },
    /// Distinct category values / matches.
    DistinctShare { category: Category },
}

fn default_floor() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FeatureKind,
    #[serde(default)]
    pub high_label: Option<String>,
    #[serde(default)]
    pub low_label: Option<String>,
}

impl FeatureSpec {
    fn new(name: &str, kind: FeatureKind, high: Option<&str>, low: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            high_label: high.map(str::to_string),
            low_label: low.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: String,
    #[serde(default = "default_floor")]
    pub duration_floor_secs: f64,
    pub features: Vec<FeatureSpec>,
}

impl FeatureSchema {
    pub fn default_lol() -> Self {
        use FeatureKind::*;
        Self {
            version: "lol-v1".to_string(),
            duration_floor_secs: 1.0,
            features: vec![
                FeatureSpec::new(
                    "dmg_per_min",
                    PerMinute {
                        counter: Counter::DamageToChampions,
                    },
                    Some("aggressor"),
                    Some("passive"),
                ),
                FeatureSpec::new(
                    "kills_per_min",
                    PerMinute {
                        counter: Counter::Kills,
                    },
                    Some("skirmisher"),
                    None,
                ),
                FeatureSpec::new(
                    "deaths_per_match",
                    PerMatch {
                        counter: Counter::Deaths,
                    },
                    Some("risk_taker"),
                    Some("cautious"),
                ),
                FeatureSpec::new(
                    "kda",
                    Ratio {
                        numerator: vec![Counter::Kills, Counter::Assists],
                        denominator: vec![Counter::Deaths],
                        floor: 1.0,
                    },
                    Some("survivor"),
                    None,
                ),
                FeatureSpec::new(
                    "gold_per_min",
                    PerMinute {
                        counter: Counter::GoldEarned,
                    },
                    Some("economist"),
                    None,
                ),
                FeatureSpec::new(
                    "cs_per_min",
                    PerMinute { counter: Counter::Cs },
                    Some("farmer"),
                    Some("roamer"),
                ),
                FeatureSpec::new(
                    "vision_per_min",
                    PerMinute {
                        counter: Counter::VisionScore,
                    },
                    Some("visionary"),
                    None,
                ),
                FeatureSpec::new(
                    "objective_dmg_per_min",
                    PerMinute {
                        counter: Counter::DamageToObjectives,
                    },
                    Some("objective_hunter"),
                    None,
                ),
                FeatureSpec::new("win_rate", WinRate, Some("closer"), None),
                FeatureSpec::new(
                    "role_diversity",
                    Diversity {
                        category: Category::Role,
                    },
                    Some("flex"),
                    Some("specialist"),
                ),
                FeatureSpec::new(
                    "champion_share",
                    DistinctShare {
                        category: Category::Champion,
                    },
                    Some("experimenter"),
                    Some("one_trick"),
                ),
            ],
        }
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.name.clone()).collect()
    }

    pub fn spec(&self, name: &str) -> Option<&FeatureSpec> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn definition_digest(&self) -> String {
        let mut h = ContentHasher::new("feature_schema/v1");
        let json = serde_json::to_string(self).unwrap_or_default();
        h.push_str(&json);
        h.finish()
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(anyhow!("feature schema version is empty"));
        }
        if self.features.is_empty() {
            return Err(anyhow!("feature schema {} has no features", self.version));
        }
        let mut seen = BTreeSet::new();
        for f in &self.features {
            if !seen.insert(f.name.as_str()) {
                return Err(anyhow!("duplicate feature `{}` in {}", f.name, self.version));
            }
        }
        if !self.duration_floor_secs.is_finite() || self.duration_floor_secs < 0.0 {
            return Err(anyhow!("duration floor must be a non-negative number"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub player_id: String,
    pub window: Window,
    pub schema_version: String,
    pub values: Vec<FeatureValue>,
    pub match_count: u64,
}

impl FeatureVector {
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.iter().find(|v| v.name == name).map(|v| v.value)
    }

    pub fn names(&self) -> Vec<&str> {
        self.values.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn raw_values(&self) -> Vec<f64> {
        self.values.iter().map(|v| v.value).collect()
    }

    pub fn content_digest(&self) -> String {
        let mut h = ContentHasher::new("feature_vector/v1");
        h.push_str(&self.player_id)
            .push_i64(self.window.start_ms)
            .push_i64(self.window.end_ms)
            .push_str(&self.schema_version)
            .push_u64(self.match_count);
        for v in &self.values {
            h.push_str(&v.name).push_f64(v.value);
        }
        h.finish()
    }
}

/// Exact integer running totals for one player-window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureAccumulator {
    pub player_id: String,
    pub window: Option<Window>,
    pub match_ids: BTreeSet<String>,
    pub wins: u64,
    pub duration_secs: u64,
    pub counter_sums: [u64; COUNTER_COUNT],
    pub roles: BTreeMap<Role, u64>,
    pub modes: BTreeMap<GameMode, u64>,
    pub champions: BTreeMap<String, u64>,
}

impl FeatureAccumulator {
    pub fn new(player_id: &str, window: Window) -> Self {
        Self {
            player_id: player_id.to_string(),
            window: Some(window),
            ..Default::default()
        }
    }

    pub fn match_count(&self) -> u64 {
        self.match_ids.len() as u64
    }

    /// Adds one fact. Facts outside the window are ignored and a match that
    /// was already folded is not counted twice. Returns whether it was added.
    pub fn fold(&mut self, fact: &MatchFact) -> std::result::Result<bool, ComputationError> {
        if fact.player_id != self.player_id {
            return Err(ComputationError::ForeignFact {
                expected: self.player_id.clone(),
                found: fact.player_id.clone(),
                match_id: fact.match_id.clone(),
            });
        }
        if let Some(window) = self.window
            && !window.contains(fact.game_creation_ms)
        {
            return Ok(false);
        }
        if !self.match_ids.insert(fact.match_id.clone()) {
            return Ok(false);
        }
        self.wins += u64::from(fact.win);
        self.duration_secs += u64::from(fact.duration_secs);
        for (sum, value) in self.counter_sums.iter_mut().zip(fact.counters) {
            *sum = sum.saturating_add(value);
        }
        *self.roles.entry(fact.role).or_insert(0) += 1;
        *self.modes.entry(fact.game_mode).or_insert(0) += 1;
        *self.champions.entry(fact.champion_name.clone()).or_insert(0) += 1;
        Ok(true)
    }

    pub fn fold_all<'a, I>(&mut self, facts: I) -> std::result::Result<usize, ComputationError>
    where
        I: IntoIterator<Item = &'a MatchFact>,
    {
        let mut added = 0usize;
        for fact in facts {
            if self.fold(fact)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn finish(
        &self,
        schema: &FeatureSchema,
    ) -> std::result::Result<Option<FeatureVector>, ComputationError> {
        let matches = self.match_count();
        if matches == 0 {
            return Ok(None);
        }
        let window = self.window.unwrap_or(Window {
            start_ms: i64::MIN,
            end_ms: i64::MAX,
        });

        let mut values = Vec::with_capacity(schema.features.len());
        for spec in &schema.features {
            let value = self.compute(spec, schema.duration_floor_secs);
            if !value.is_finite() {
                return Err(ComputationError::NonFiniteFeature {
                    player_id: self.player_id.clone(),
                    window: window.to_string(),
                    feature: spec.name.clone(),
                });
            }
            values.push(FeatureValue {
                name: spec.name.clone(),
                value,
            });
        }

        Ok(Some(FeatureVector {
            player_id: self.player_id.clone(),
            window,
            schema_version: schema.version.clone(),
            values,
            match_count: matches,
        }))
    }

    fn sum(&self, counter: Counter) -> f64 {
        self.counter_sums[counter.index()] as f64
    }

    fn compute(&self, spec: &FeatureSpec, duration_floor: f64) -> f64 {
        let matches = self.match_count() as f64;
        match &spec.kind {
            FeatureKind::PerMinute { counter } => {
                self.sum(*counter) / (self.duration_secs as f64).max(duration_floor) * 60.0
            }
            FeatureKind::PerMatch { counter } => self.sum(*counter) / matches,
            FeatureKind::Ratio {
                numerator,
                denominator,
                floor,
            } => {
                let num: u64 = numerator
                    .iter()
                    .map(|c| self.counter_sums[c.index()])
                    .fold(0u64, u64::saturating_add);
                let den: u64 = denominator
                    .iter()
                    .map(|c| self.counter_sums[c.index()])
                    .fold(0u64, u64::saturating_add);
                num as f64 / (den as f64).max(*floor)
            }
            FeatureKind::WinRate => self.wins as f64 / matches,
            FeatureKind::Diversity { category } => {
                let (counts, domain): (Vec<u64>, usize) = match category {
                    Category::Role => (self.roles.values().copied().collect(), ROLE_CATEGORIES),
                    Category::Mode => (self.modes.values().copied().collect(), MODE_CATEGORIES),
                    Category::Champion => (
                        self.champions.values().copied().collect(),
                        self.match_count() as usize,
                    ),
                };
                normalized_entropy(&counts, domain)
            }
            FeatureKind::DistinctShare { category } => {
                let distinct = match category {
                    Category::Role => self.roles.len(),
                    Category::Mode => self.modes.len(),
                    Category::Champion => self.champions.len(),
                };
                distinct as f64 / matches
            }
        }
    }
}

fn normalized_entropy(counts: &[u64], domain: usize) -> f64 {
    let total: u64 = counts.iter().sum();
    if total == 0 || domain < 2 {
        return 0.0;
    }
    let total = total as f64;
    let mut h = 0.0_f64;
    for &c in counts {
        if c == 0 {
            continue;
        }
        let p = c as f64 / total;
        h -= p * p.ln();
    }
    h / (domain as f64).ln()
}

pub fn extract_features(
    player_id: &str,
    facts: &[MatchFact],
    window: Window,
    schema: &FeatureSchema,
) -> std::result::Result<Option<FeatureVector>, ComputationError> {
    let mut acc = FeatureAccumulator::new(player_id, window);
    acc.fold_all(facts)?;
    acc.finish(schema)
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Built {
        vector: FeatureVector,
        state: FeatureAccumulator,
    },
    Absent {
        player_id: String,
    },
    Failed {
        player_id: String,
        error: ComputationError,
    },
}

impl UnitOutcome {
    pub fn player_id(&self) -> &str {
        match self {
            UnitOutcome::Built { vector, .. } => &vector.player_id,
            UnitOutcome::Absent { player_id } | UnitOutcome::Failed { player_id, .. } => player_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnitInput {
    pub player_id: String,
    pub prior: Option<FeatureAccumulator>,
    pub facts: Vec<MatchFact>,
}

/// Builds every unit in parallel. A failing unit is reported in place and
/// never aborts the others. Output order follows input order.
pub fn build_units(inputs: &[UnitInput], window: Window, schema: &FeatureSchema) -> Vec<UnitOutcome> {
    inputs
        .par_iter()
        .map(|input| build_unit(input, window, schema))
        .collect()
}

fn build_unit(input: &UnitInput, window: Window, schema: &FeatureSchema) -> UnitOutcome {
    let mut acc = match input.prior.as_ref() {
        Some(prior) if prior.window == Some(window) && prior.player_id == input.player_id => {
            prior.clone()
        }
        _ => FeatureAccumulator::new(&input.player_id, window),
    };
    let result = acc
        .fold_all(&input.facts)
        .and_then(|_| acc.finish(schema));
    match result {
        Ok(Some(vector)) => UnitOutcome::Built { vector, state: acc },
        Ok(None) => UnitOutcome::Absent {
            player_id: input.player_id.clone(),
        },
        Err(error) => {
            warn!(
                player_id = %input.player_id,
                window = %window,
                reason_code = error.reason_code(),
                error = %error,
                "feature unit failed"
            );
            UnitOutcome::Failed {
                player_id: input.player_id.clone(),
                error,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipRange {
    pub low: f64,
    pub high: f64,
}

impl ClipRange {
    pub fn apply(&self, value: f64) -> f64 {
        value.clamp(self.low, self.high)
    }
}

/// Per-column percentile bounds over `rows`. Rows must share one length.
pub fn clip_ranges(rows: &[Vec<f64>], low_q: f64, high_q: f64) -> Vec<ClipRange> {
    let Some(width) = rows.first().map(|r| r.len()) else {
        return Vec::new();
    };
    (0..width)
        .map(|col| {
            let mut column = rows.iter().map(|r| r[col]).collect::<Vec<_>>();
            column.sort_by(|a, b| a.total_cmp(b));
            ClipRange {
                low: percentile_sorted(&column, low_q),
                high: percentile_sorted(&column, high_q),
            }
        })
        .collect()
}

pub fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}
