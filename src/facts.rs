use std::fmt;

use serde::{Deserialize, Serialize};

use crate::digest::ContentHasher;

pub const COUNTER_COUNT: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    Kills,
    Deaths,
    Assists,
    DamageToChampions,
    DamageToObjectives,
    GoldEarned,
    Cs,
    VisionScore,
    WardsPlaced,
}

impl Counter {
    pub const ALL: [Counter; COUNTER_COUNT] = [
        Counter::Kills,
        Counter::Deaths,
        Counter::Assists,
        Counter::DamageToChampions,
        Counter::DamageToObjectives,
        Counter::GoldEarned,
        Counter::Cs,
        Counter::VisionScore,
        Counter::WardsPlaced,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Counter::Kills => "kills",
            Counter::Deaths => "deaths",
            Counter::Assists => "assists",
            Counter::DamageToChampions => "damage_to_champions",
            Counter::DamageToObjectives => "damage_to_objectives",
            Counter::GoldEarned => "gold_earned",
            Counter::Cs => "cs",
            Counter::VisionScore => "vision_score",
            Counter::WardsPlaced => "wards_placed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameMode {
    Classic,
    Aram,
    Urf,
    Arurf,
    OneForAll,
    NexusBlitz,
    Ultbook,
    Cherry,
    PracticeTool,
    Tutorial,
}

impl GameMode {
    pub fn parse(raw: &str) -> Option<Self> {
        let mode = match raw.trim().to_ascii_uppercase().as_str() {
            "CLASSIC" => GameMode::Classic,
            "ARAM" => GameMode::Aram,
            "URF" => GameMode::Urf,
            "ARURF" => GameMode::Arurf,
            "ONEFORALL" => GameMode::OneForAll,
            "NEXUSBLITZ" => GameMode::NexusBlitz,
            "ULTBOOK" => GameMode::Ultbook,
            "CHERRY" => GameMode::Cherry,
            "PRACTICETOOL" => GameMode::PracticeTool,
            "TUTORIAL" => GameMode::Tutorial,
            _ => return None,
        };
        Some(mode)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameMode::Classic => "CLASSIC",
            GameMode::Aram => "ARAM",
            GameMode::Urf => "URF",
            GameMode::Arurf => "ARURF",
            GameMode::OneForAll => "ONEFORALL",
            GameMode::NexusBlitz => "NEXUSBLITZ",
            GameMode::Ultbook => "ULTBOOK",
            GameMode::Cherry => "CHERRY",
            GameMode::PracticeTool => "PRACTICETOOL",
            GameMode::Tutorial => "TUTORIAL",
        }
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Top,
    Jungle,
    Middle,
    Bottom,
    Utility,
    None,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        let role = match raw.trim().to_ascii_uppercase().as_str() {
            "TOP" => Role::Top,
            "JUNGLE" => Role::Jungle,
            "MIDDLE" | "MID" => Role::Middle,
            "BOTTOM" | "BOT" | "ADC" => Role::Bottom,
            "UTILITY" | "SUPPORT" => Role::Utility,
            // Riot reports `Invalid` for modes without lanes.
            "NONE" | "UNKNOWN" | "INVALID" => Role::None,
            _ => return None,
        };
        Some(role)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Top => "TOP",
            Role::Jungle => "JUNGLE",
            Role::Middle => "MIDDLE",
            Role::Bottom => "BOTTOM",
            Role::Utility => "UTILITY",
            Role::None => "NONE",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub match_id: String,
    pub player_id: String,
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.match_id, self.player_id)
    }
}

/// A per-match-per-player row as delivered by ingestion, before validation.
/// Every field is optional and numeric fields are loose floats so the gate
/// can see missing, negative and non-finite values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFactRow {
    #[serde(default)]
    pub match_id: Option<String>,
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub game_mode: Option<String>,
    #[serde(default)]
    pub game_creation_ms: Option<i64>,
    #[serde(default, with = "lossless_f64")]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub champion_name: Option<String>,
    #[serde(default)]
    pub win: Option<bool>,
    #[serde(default, with = "lossless_f64")]
    pub kills: Option<f64>,
    #[serde(default, with = "lossless_f64")]
    pub deaths: Option<f64>,
    #[serde(default, with = "lossless_f64")]
    pub assists: Option<f64>,
    #[serde(default, with = "lossless_f64")]
    pub damage_to_champions: Option<f64>,
    #[serde(default, with = "lossless_f64")]
    pub damage_to_objectives: Option<f64>,
    #[serde(default, with = "lossless_f64")]
    pub gold_earned: Option<f64>,
    #[serde(default, with = "lossless_f64")]
    pub cs: Option<f64>,
    #[serde(default, with = "lossless_f64")]
    pub vision_score: Option<f64>,
    #[serde(default, with = "lossless_f64")]
    pub wards_placed: Option<f64>,
}

impl RawFactRow {
    pub fn counter(&self, counter: Counter) -> Option<f64> {
        match counter {
            Counter::Kills => self.kills,
            Counter::Deaths => self.deaths,
            Counter::Assists => self.assists,
            Counter::DamageToChampions => self.damage_to_champions,
            Counter::DamageToObjectives => self.damage_to_objectives,
            Counter::GoldEarned => self.gold_earned,
            Counter::Cs => self.cs,
            Counter::VisionScore => self.vision_score,
            Counter::WardsPlaced => self.wards_placed,
        }
    }

    pub fn set_counter(&mut self, counter: Counter, value: Option<f64>) {
        let slot = match counter {
            Counter::Kills => &mut self.kills,
            Counter::Deaths => &mut self.deaths,
            Counter::Assists => &mut self.assists,
            Counter::DamageToChampions => &mut self.damage_to_champions,
            Counter::DamageToObjectives => &mut self.damage_to_objectives,
            Counter::GoldEarned => &mut self.gold_earned,
            Counter::Cs => &mut self.cs,
            Counter::VisionScore => &mut self.vision_score,
            Counter::WardsPlaced => &mut self.wards_placed,
        };
        *slot = value;
    }

    /// Key when both halves are present and non-blank.
    pub fn key(&self) -> Option<FactKey> {
        let match_id = self.match_id.as_deref().map(str::trim).unwrap_or("");
        let player_id = self.player_id.as_deref().map(str::trim).unwrap_or("");
        if match_id.is_empty() || player_id.is_empty() {
            return None;
        }
        Some(FactKey {
            match_id: match_id.to_string(),
            player_id: player_id.to_string(),
        })
    }

    /// Digest of the raw row exactly as received; identifies quarantined rows.
    pub fn digest(&self) -> String {
        let mut h = ContentHasher::new("raw_fact_row/v1");
        push_opt_str(&mut h, self.match_id.as_deref());
        push_opt_str(&mut h, self.player_id.as_deref());
        push_opt_str(&mut h, self.game_mode.as_deref());
        push_opt_i64(&mut h, self.game_creation_ms);
        push_opt_f64(&mut h, self.duration_secs);
        push_opt_i64(&mut h, self.team_id);
        push_opt_str(&mut h, self.role.as_deref());
        push_opt_str(&mut h, self.champion_name.as_deref());
        match self.win {
            Some(w) => {
                h.push_bool(true).push_bool(w);
            }
            None => {
                h.push_bool(false);
            }
        }
        for counter in Counter::ALL {
            push_opt_f64(&mut h, self.counter(counter));
        }
        h.finish()
    }
}

/// A validated, immutable match fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFact {
    pub match_id: String,
    pub player_id: String,
    pub game_mode: GameMode,
    pub game_creation_ms: i64,
    pub duration_secs: u32,
    pub team_id: i64,
    pub role: Role,
    pub champion_name: String,
    pub win: bool,
    pub counters: [u64; COUNTER_COUNT],
}

impl MatchFact {
    pub fn key(&self) -> FactKey {
        FactKey {
            match_id: self.match_id.clone(),
            player_id: self.player_id.clone(),
        }
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter.index()]
    }

    pub fn to_raw_row(&self) -> RawFactRow {
        let mut row = RawFactRow {
            match_id: Some(self.match_id.clone()),
            player_id: Some(self.player_id.clone()),
            game_mode: Some(self.game_mode.as_str().to_string()),
            game_creation_ms: Some(self.game_creation_ms),
            duration_secs: Some(f64::from(self.duration_secs)),
            team_id: Some(self.team_id),
            role: Some(self.role.as_str().to_string()),
            champion_name: Some(self.champion_name.clone()),
            win: Some(self.win),
            ..Default::default()
        };
        for counter in Counter::ALL {
            row.set_counter(counter, Some(self.counter(counter) as f64));
        }
        row
    }

    /// Digest over the normalized content; equal digests mean identical facts.
    pub fn content_digest(&self) -> String {
        let mut h = ContentHasher::new("match_fact/v1");
        h.push_str(&self.match_id)
            .push_str(&self.player_id)
            .push_str(self.game_mode.as_str())
            .push_i64(self.game_creation_ms)
            .push_u64(u64::from(self.duration_secs))
            .push_i64(self.team_id)
            .push_str(self.role.as_str())
            .push_str(&self.champion_name)
            .push_bool(self.win);
        for value in self.counters {
            h.push_u64(value);
        }
        h.finish()
    }
}

/// Keeps NaN and infinities through JSON, which has no literal for them.
mod lossless_f64 {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) if v.is_nan() => s.serialize_str("NaN"),
            Some(v) if v.is_infinite() && *v > 0.0 => s.serialize_str("inf"),
            Some(v) if v.is_infinite() => s.serialize_str("-inf"),
            Some(v) => s.serialize_f64(*v),
            None => s.serialize_none(),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        match Option::<Repr>::deserialize(d)? {
            None => Ok(None),
            Some(Repr::Number(v)) => Ok(Some(v)),
            Some(Repr::Text(raw)) => match raw.trim() {
                "NaN" | "nan" => Ok(Some(f64::NAN)),
                "inf" | "+inf" | "Infinity" => Ok(Some(f64::INFINITY)),
                "-inf" | "-Infinity" => Ok(Some(f64::NEG_INFINITY)),
                other => Err(D::Error::custom(format!("expected a number, got `{other}`"))),
            },
        }
    }
}

fn push_opt_str(h: &mut ContentHasher, value: Option<&str>) {
    match value {
        Some(v) => {
            h.push_bool(true).push_str(v);
        }
        None => {
            h.push_bool(false);
        }
    }
}

fn push_opt_i64(h: &mut ContentHasher, value: Option<i64>) {
    match value {
        Some(v) => {
            h.push_bool(true).push_i64(v);
        }
        None => {
            h.push_bool(false);
        }
    }
}

fn push_opt_f64(h: &mut ContentHasher, value: Option<f64>) {
    match value {
        Some(v) => {
            h.push_bool(true).push_f64(v);
        }
        None => {
            h.push_bool(false);
        }
    }
}
