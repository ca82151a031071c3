use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ValidationReason;
use crate::facts::{COUNTER_COUNT, Counter, FactKey, GameMode, MatchFact, RawFactRow, Role};

/// Largest counter value that survives an f64 round trip exactly.
const MAX_EXACT_COUNTER: f64 = 9_007_199_254_740_992.0;

/// Lookup of facts that were accepted by earlier batches.
pub trait FactLedger {
    fn fact_digest(&self, key: &FactKey) -> Result<Option<String>>;
}

impl FactLedger for HashMap<FactKey, String> {
    fn fact_digest(&self, key: &FactKey) -> Result<Option<String>> {
        Ok(self.get(key).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRow {
    pub row: RawFactRow,
    pub reason: ValidationReason,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub accepted: Vec<MatchFact>,
    pub quarantined: Vec<QuarantinedRow>,
    /// Accepted rows whose identical content was already ingested.
    pub already_ingested: usize,
}

impl GateOutcome {
    pub fn reason_counts(&self) -> BTreeMap<ValidationReason, usize> {
        let mut out = BTreeMap::new();
        for q in &self.quarantined {
            *out.entry(q.reason).or_insert(0) += 1;
        }
        out
    }
}

type RowVerdict = std::result::Result<MatchFact, (ValidationReason, String)>;

/// Partitions a batch into accepted facts and quarantined rows.
///
/// Every input row ends up in exactly one of the two lists. Inside the batch
/// identical copies of a key keep the first and quarantine the rest as
/// `DUPLICATE_IN_BATCH`; differing copies are all quarantined as
/// `CONFLICTING_DUPLICATE`. Keys already in `ledger` are accepted only when
/// their content is identical.
pub fn validate_batch(rows: Vec<RawFactRow>, ledger: &dyn FactLedger) -> Result<GateOutcome> {
    let verdicts: Vec<RowVerdict> = rows.par_iter().map(validate_row).collect();

    let mut quarantined: Vec<(usize, QuarantinedRow)> = Vec::new();
    let mut candidates: BTreeMap<FactKey, Vec<(usize, MatchFact, String)>> = BTreeMap::new();

    for (idx, (row, verdict)) in rows.iter().zip(verdicts).enumerate() {
        match verdict {
            Ok(fact) => {
                let digest = fact.content_digest();
                candidates
                    .entry(fact.key())
                    .or_default()
                    .push((idx, fact, digest));
            }
            Err((reason, detail)) => quarantined.push((
                idx,
                QuarantinedRow {
                    row: row.clone(),
                    reason,
                    detail,
                },
            )),
        }
    }

    let mut accepted: Vec<(usize, MatchFact)> = Vec::new();
    let mut already_ingested = 0usize;
    for (key, copies) in candidates {
        let first_digest = copies[0].2.clone();
        let consistent = copies.iter().all(|(_, _, d)| *d == first_digest);
        if !consistent {
            for (idx, _, _) in &copies {
                quarantined.push((
                    *idx,
                    QuarantinedRow {
                        row: rows[*idx].clone(),
                        reason: ValidationReason::ConflictingDuplicate,
                        detail: format!("{key} appears {} times with differing content", copies.len()),
                    },
                ));
            }
            continue;
        }

        let mut copies = copies.into_iter();
        let Some((first_idx, fact, digest)) = copies.next() else {
            continue;
        };
        for (idx, _, _) in copies {
            quarantined.push((
                idx,
                QuarantinedRow {
                    row: rows[idx].clone(),
                    reason: ValidationReason::DuplicateInBatch,
                    detail: format!("{key} repeated in batch; first copy at row {first_idx} kept"),
                },
            ));
        }

        match ledger.fact_digest(&key)? {
            Some(existing) if existing == digest => {
                already_ingested += 1;
                accepted.push((first_idx, fact));
            }
            Some(_) => quarantined.push((
                first_idx,
                QuarantinedRow {
                    row: rows[first_idx].clone(),
                    reason: ValidationReason::ConflictingDuplicate,
                    detail: format!("{key} already ingested with different content"),
                },
            )),
            None => accepted.push((first_idx, fact)),
        }
    }

    accepted.sort_by_key(|(idx, _)| *idx);
    quarantined.sort_by_key(|(idx, _)| *idx);

    for (idx, q) in &quarantined {
        warn!(
            row = idx,
            reason_code = q.reason.code(),
            match_id = q.row.match_id.as_deref().unwrap_or(""),
            player_id = q.row.player_id.as_deref().unwrap_or(""),
            detail = %q.detail,
            "row quarantined"
        );
    }
    debug!(
        accepted = accepted.len(),
        quarantined = quarantined.len(),
        already_ingested,
        "batch validated"
    );

    Ok(GateOutcome {
        accepted: accepted.into_iter().map(|(_, f)| f).collect(),
        quarantined: quarantined.into_iter().map(|(_, q)| q).collect(),
        already_ingested,
    })
}

/// Checks one row in isolation. Order matters: the first failing check
/// decides the reason code.
pub fn validate_row(row: &RawFactRow) -> RowVerdict {
    let key = row.key().ok_or_else(|| {
        (
            ValidationReason::MissingKey,
            "match_id or player_id missing".to_string(),
        )
    })?;

    let mode_raw = required(row.game_mode.as_deref(), "game_mode")?;
    let role_raw = required(row.role.as_deref(), "role")?;
    let win = required(row.win, "win")?;
    let created = required(row.game_creation_ms, "game_creation_ms")?;
    let duration = required(row.duration_secs, "duration_secs")?;
    let team_id = required(row.team_id, "team_id")?;
    let mut raw_counters = [0.0_f64; COUNTER_COUNT];
    for counter in Counter::ALL {
        raw_counters[counter.index()] = required(row.counter(counter), counter.name())?;
    }

    if !duration.is_finite() {
        return Err(non_finite("duration_secs", duration));
    }
    for counter in Counter::ALL {
        let v = raw_counters[counter.index()];
        if !v.is_finite() {
            return Err(non_finite(counter.name(), v));
        }
    }

    let duration_secs = duration.round();
    if duration_secs <= 0.0 || duration_secs > f64::from(u32::MAX) {
        return Err((
            ValidationReason::InvalidDuration,
            format!("duration_secs={duration} must be > 0"),
        ));
    }
    if created < 0 {
        return Err((
            ValidationReason::InvalidRange,
            format!("game_creation_ms={created} is negative"),
        ));
    }

    let mut counters = [0u64; COUNTER_COUNT];
    for counter in Counter::ALL {
        let v = raw_counters[counter.index()];
        if v < 0.0 || v.fract() != 0.0 || v > MAX_EXACT_COUNTER {
            return Err((
                ValidationReason::InvalidRange,
                format!("{}={v} is not a non-negative integer", counter.name()),
            ));
        }
        counters[counter.index()] = v as u64;
    }

    let game_mode = GameMode::parse(mode_raw).ok_or_else(|| {
        (
            ValidationReason::UnknownEnum,
            format!("game_mode `{mode_raw}` is not a known mode"),
        )
    })?;
    let role = Role::parse(role_raw).ok_or_else(|| {
        (
            ValidationReason::UnknownEnum,
            format!("role `{role_raw}` is not a known role"),
        )
    })?;

    Ok(MatchFact {
        match_id: key.match_id,
        player_id: key.player_id,
        game_mode,
        game_creation_ms: created,
        duration_secs: duration_secs as u32,
        team_id,
        role,
        champion_name: row
            .champion_name
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .to_string(),
        win,
        counters,
    })
}

fn required<T>(value: Option<T>, field: &str) -> std::result::Result<T, (ValidationReason, String)> {
    value.ok_or_else(|| {
        (
            ValidationReason::MissingField,
            format!("{field} is missing"),
        )
    })
}

fn non_finite(field: &str, value: f64) -> (ValidationReason, String) {
    (
        ValidationReason::NonFinite,
        format!("{field}={value} is not finite"),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn good_row(match_id: &str, player_id: &str) -> RawFactRow {
        RawFactRow {
            match_id: Some(match_id.to_string()),
            player_id: Some(player_id.to_string()),
            game_mode: Some("CLASSIC".to_string()),
            game_creation_ms: Some(1_700_000_000_000),
            duration_secs: Some(1800.0),
            team_id: Some(100),
            role: Some("TOP".to_string()),
            champion_name: Some("Garen".to_string()),
            win: Some(true),
            kills: Some(5.0),
            deaths: Some(3.0),
            assists: Some(7.0),
            damage_to_champions: Some(18000.0),
            damage_to_objectives: Some(4000.0),
            gold_earned: Some(11000.0),
            cs: Some(190.0),
            vision_score: Some(20.0),
            wards_placed: Some(9.0),
        }
    }

    #[test]
    fn nan_is_reported_before_range() {
        let mut row = good_row("m", "p");
        row.deaths = Some(f64::NAN);
        row.kills = Some(-1.0);
        let (reason, _) = validate_row(&row).unwrap_err();
        assert_eq!(reason, ValidationReason::NonFinite);
    }

    #[test]
    fn zero_duration_is_invalid() {
        let mut row = good_row("m", "p");
        row.duration_secs = Some(0.0);
        let (reason, _) = validate_row(&row).unwrap_err();
        assert_eq!(reason, ValidationReason::InvalidDuration);
    }

    #[test]
    fn fractional_counter_is_out_of_range() {
        let mut row = good_row("m", "p");
        row.assists = Some(2.5);
        let (reason, detail) = validate_row(&row).unwrap_err();
        assert_eq!(reason, ValidationReason::InvalidRange);
        assert!(detail.contains("assists"));
    }

    #[test]
    fn unknown_role_and_missing_fields() {
        let mut row = good_row("m", "p");
        row.role = Some("GOALIE".to_string());
        assert_eq!(validate_row(&row).unwrap_err().0, ValidationReason::UnknownEnum);

        let mut row = good_row("m", "p");
        row.win = None;
        assert_eq!(validate_row(&row).unwrap_err().0, ValidationReason::MissingField);

        let mut row = good_row("m", "p");
        row.match_id = None;
        assert_eq!(validate_row(&row).unwrap_err().0, ValidationReason::MissingKey);
    }

    #[test]
    fn identical_in_batch_copies_keep_the_first() {
        let ledger: HashMap<FactKey, String> = HashMap::new();
        let rows = vec![good_row("m1", "p"), good_row("m1", "p"), good_row("m2", "p")];
        let out = validate_batch(rows, &ledger).unwrap();
        assert_eq!(out.accepted.len(), 2);
        assert_eq!(out.quarantined.len(), 1);
        assert_eq!(out.quarantined[0].reason, ValidationReason::DuplicateInBatch);
    }

    #[test]
    fn conflicting_in_batch_copies_are_all_quarantined() {
        let ledger: HashMap<FactKey, String> = HashMap::new();
        let mut changed = good_row("m1", "p");
        changed.kills = Some(9.0);
        let out = validate_batch(vec![good_row("m1", "p"), changed], &ledger).unwrap();
        assert!(out.accepted.is_empty());
        assert_eq!(out.quarantined.len(), 2);
        assert!(
            out.quarantined
                .iter()
                .all(|q| q.reason == ValidationReason::ConflictingDuplicate)
        );
    }

    #[test]
    fn cross_batch_duplicates_depend_on_content() {
        let first = validate_row(&good_row("m1", "p")).unwrap();
        let mut ledger: HashMap<FactKey, String> = HashMap::new();
        ledger.insert(first.key(), first.content_digest());

        let out = validate_batch(vec![good_row("m1", "p")], &ledger).unwrap();
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.already_ingested, 1);

        let mut changed = good_row("m1", "p");
        changed.gold_earned = Some(1.0);
        let out = validate_batch(vec![changed], &ledger).unwrap();
        assert!(out.accepted.is_empty());
        assert_eq!(out.quarantined[0].reason, ValidationReason::ConflictingDuplicate);
    }
}
