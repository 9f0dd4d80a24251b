// uback_common is the core library implementing the backup-chain engine.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Retention policy grammar and the pruning engine. A policy retains one
//! subject per interval, walked newest to oldest, up to a count; an
//! interval is honored once its elapsed delta reaches 0.9x its nominal
//! length, so that jittered backup schedules don't starve a bucket.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;

use crate::error::RetentionError;
use crate::model::{sorted_newest_first, Backup, Snapshot};

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 30 * DAY;
const YEAR: i64 = 365 * DAY;
const INTERVAL_TOLERANCE: f64 = 0.9;

/// One retained-per-interval rule: keep up to `count` subjects, spaced at
/// least `interval_seconds` apart, optionally restricted to full backups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub interval_seconds: i64,
    pub count: usize,
    pub full_only: bool,
}

fn interval_alias(name: &str) -> Option<i64> {
    match name {
        "hourly" => Some(HOUR),
        "daily" => Some(DAY),
        "weekly" => Some(WEEK),
        "monthly" => Some(MONTH),
        "yearly" => Some(YEAR),
        _ => None,
    }
}

/// Parse a period expression: a named alias (`hourly`, `daily`, ...), a
/// bare integer (seconds), or `<N><unit>` with unit in `h d w m y`.
pub fn parse_interval(s: &str) -> Result<i64, RetentionError> {
    if let Some(seconds) = interval_alias(s) {
        return Ok(seconds);
    }

    if s.is_empty() {
        return Err(RetentionError::InvalidInterval(s.to_string()));
    }

    let last = s.chars().last().expect("non-empty checked above");
    let (digits, unit) = if last.is_ascii_digit() {
        (s, None)
    } else {
        (&s[..s.len() - last.len_utf8()], Some(last))
    };

    let n: i64 = digits
        .parse()
        .map_err(|_| RetentionError::InvalidInterval(s.to_string()))?;

    let seconds = match unit {
        None => n,
        Some('h') => n * HOUR,
        Some('d') => n * DAY,
        Some('w') => n * WEEK,
        Some('m') => n * MONTH,
        Some('y') => n * YEAR,
        Some(_) => return Err(RetentionError::InvalidInterval(s.to_string())),
    };

    Ok(seconds)
}

/// Parse a full policy expression: `<period>=<count>[:full]`.
pub fn parse_retention_policy(s: &str) -> Result<RetentionPolicy, RetentionError> {
    let (period, rhs) = s
        .split_once('=')
        .ok_or_else(|| RetentionError::InvalidRetentionPolicy(s.to_string()))?;

    let interval_seconds = parse_interval(period)?;

    let (count_str, full_only) = match rhs.split_once(':') {
        Some((count, "full")) => (count, true),
        Some(_) => return Err(RetentionError::InvalidRetentionPolicy(s.to_string())),
        None => (rhs, false),
    };

    let count: usize = count_str
        .parse()
        .map_err(|_| RetentionError::InvalidRetentionPolicy(s.to_string()))?;

    Ok(RetentionPolicy { interval_seconds, count, full_only })
}

/// Parse every `@RetentionPolicy=...` entry off a resolved [`Options`].
pub fn policies_from_options(options: &crate::options::Options) -> Result<Vec<RetentionPolicy>, RetentionError> {
    options.get_multi("RetentionPolicy").iter().map(|s| parse_retention_policy(s)).collect()
}

/// Walk `subjects` (already newest-first) and retain the indices a single
/// policy would keep: one per interval, stopping once `count` is reached.
fn apply_single_policy<T>(
    policy: &RetentionPolicy,
    subjects_newest_first: &[T],
    timestamp: impl Fn(&T) -> NaiveDateTime,
    is_full: impl Fn(&T) -> bool,
) -> HashSet<usize> {
    let mut retained = HashSet::new();
    let mut last_retained: Option<NaiveDateTime> = None;

    for (i, subject) in subjects_newest_first.iter().enumerate() {
        if retained.len() >= policy.count {
            break;
        }
        if policy.full_only && !is_full(subject) {
            continue;
        }

        let t = timestamp(subject);
        let keep = match last_retained {
            None => true,
            Some(last) => {
                let delta = (last - t).num_seconds() as f64;
                delta >= INTERVAL_TOLERANCE * policy.interval_seconds as f64
            }
        };

        if keep {
            retained.insert(i);
            last_retained = Some(t);
        }
    }

    retained
}

/// Union the retained set across every policy in `policies` against
/// `subjects` (need not be pre-sorted).
fn retained_names<T: Clone>(
    policies: &[RetentionPolicy],
    subjects: &[T],
    name: impl Fn(&T) -> String,
    timestamp: impl Fn(&T) -> NaiveDateTime,
    is_full: impl Fn(&T) -> bool,
) -> HashSet<String>
where
    T: Ord,
{
    let sorted = sorted_newest_first(subjects.to_vec());
    let mut names = HashSet::new();
    for policy in policies {
        let idxs = apply_single_policy(policy, &sorted, &timestamp, &is_full);
        for i in idxs {
            names.insert(name(&sorted[i]));
        }
    }
    names
}

/// Prune a destination's backups against `policies`. Orphan chains (base
/// missing from the destination) are never candidates for retention and
/// are always pruned once any policy is configured; every backup in the
/// full chain of a retained backup is protected, so an incremental is
/// never orphaned by pruning its base out from under it. Zero policies
/// means keep everything, including orphans.
pub fn get_pruned_backups(backups: &[Backup], policies: &[RetentionPolicy]) -> Vec<Backup> {
    if policies.is_empty() {
        log::warn!("no retention policies configured for backups; keeping all of them");
        return Vec::new();
    }

    let index = crate::model::make_index(backups);

    let candidates: Vec<Backup> = backups
        .iter()
        .filter(|b| crate::model::get_full_chain(b, &index).1)
        .cloned()
        .collect();

    let retained = retained_names(
        policies,
        &candidates,
        |b| b.snapshot.as_str().to_string(),
        |b| b.snapshot.time(),
        |b| b.is_full(),
    );

    let mut protected: HashSet<String> = HashSet::new();
    for name in &retained {
        let backup = index.get(name).expect("retained name came from the index");
        let (chain, _) = crate::model::get_full_chain(backup, &index);
        protected.extend(chain.iter().map(|b| b.snapshot.as_str().to_string()));
    }

    backups
        .iter()
        .filter(|b| !protected.contains(b.snapshot.as_str()))
        .cloned()
        .collect()
}

/// Prune a source's archives and bookmarks against `policies`. Unlike
/// backups, a snapshot protected by `state` (in use as some destination's
/// last-full or last-common base) is never pruned even if no policy would
/// retain it, and the full-only filter never applies since snapshots have
/// no full/incremental distinction. Zero policies means keep nothing
/// except what `state` protects.
pub fn get_pruned_snapshots(
    archives: &[Snapshot],
    bookmarks: &[Snapshot],
    policies: &[RetentionPolicy],
    state: &HashMap<String, String>,
) -> (Vec<Snapshot>, Vec<Snapshot>) {
    let state_protected: HashSet<&str> = state.values().map(String::as_str).collect();

    let prune = |subjects: &[Snapshot]| -> Vec<Snapshot> {
        let retained = if policies.is_empty() {
            HashSet::new()
        } else {
            retained_names(policies, subjects, |s| s.as_str().to_string(), |s| s.time(), |_| true)
        };

        subjects
            .iter()
            .filter(|s| !retained.contains(s.as_str()) && !state_protected.contains(s.as_str()))
            .cloned()
            .collect()
    };

    (prune(archives), prune(bookmarks))
}

/// Remove each of `pruned` via `remove`, logging and continuing past any
/// individual failure rather than aborting the whole sweep.
pub fn prune_with<T>(pruned: &[T], name: impl Fn(&T) -> String, mut remove: impl FnMut(&T) -> Result<(), crate::error::DriverError>) {
    for item in pruned {
        if let Err(e) = remove(item) {
            log::warn!("failed to prune {}: {e}", name(item));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(s: &str) -> Snapshot {
        Snapshot::parse(s).unwrap()
    }

    #[test]
    fn parse_named_alias() {
        let p = parse_retention_policy("daily=7").unwrap();
        assert_eq!(p.interval_seconds, DAY);
        assert_eq!(p.count, 7);
        assert!(!p.full_only);
    }

    #[test]
    fn parse_explicit_unit_with_full_flag() {
        let p = parse_retention_policy("7d=4:full").unwrap();
        assert_eq!(p.interval_seconds, 7 * DAY);
        assert_eq!(p.count, 4);
        assert!(p.full_only);
    }

    #[test]
    fn parse_bare_seconds() {
        let p = parse_retention_policy("3600=2").unwrap();
        assert_eq!(p.interval_seconds, 3600);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_retention_policy("weirdly=4").is_err());
        assert!(parse_retention_policy("daily").is_err());
    }

    #[test]
    fn parse_rejects_unknown_suffix() {
        assert!(parse_retention_policy("daily=4:foo").is_err());
    }

    #[test]
    fn single_policy_respects_interval_tolerance() {
        let policy = RetentionPolicy { interval_seconds: DAY, count: 4, full_only: true };
        let subjects = vec![
            Backup::full(snap("20210131T000000.000")),
            Backup::full(snap("20210130T120000.000")),
            Backup::full(snap("20210130T000002.000")),
            Backup::full(snap("20210129T000001.000")),
            Backup::full(snap("20210128T000000.000")),
            Backup::full(snap("20210127T000000.000")),
        ];
        let idxs = apply_single_policy(&policy, &subjects, |b| b.snapshot.time(), |b| b.is_full());
        let kept: HashSet<String> = idxs.iter().map(|&i| subjects[i].snapshot.as_str().to_string()).collect();
        let expected: HashSet<String> = ["20210131T000000.000", "20210130T000002.000", "20210129T000001.000", "20210128T000000.000"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn zero_policies_keeps_all_backups_including_orphans() {
        let orphan = Backup::incremental(snap("20210131T000000.000"), snap("20210101T000000.000"));
        let pruned = get_pruned_backups(&[orphan], &[]);
        assert!(pruned.is_empty());
    }

    #[test]
    fn orphan_backup_is_always_pruned_once_policy_exists() {
        let orphan = Backup::incremental(snap("20210131T000000.000"), snap("20210101T000000.000"));
        let policy = RetentionPolicy { interval_seconds: DAY, count: 10, full_only: false };
        let pruned = get_pruned_backups(&[orphan.clone()], &[policy]);
        assert_eq!(pruned, vec![orphan]);
    }

    #[test]
    fn retained_incremental_protects_its_base() {
        let base = Backup::full(snap("20210101T000000.000"));
        let child = Backup::incremental(snap("20210102T000000.000"), snap("20210101T000000.000"));
        let policy = RetentionPolicy { interval_seconds: DAY, count: 1, full_only: false };
        let pruned = get_pruned_backups(&[base, child], &[policy]);
        assert!(pruned.is_empty());
    }

    #[test]
    fn zero_policies_prunes_all_snapshots_except_state_protected() {
        let archives = vec![snap("20210101T000000.000"), snap("20210102T000000.000")];
        let bookmarks = vec![snap("20210103T000000.000")];
        let mut state = HashMap::new();
        state.insert("dest1".to_string(), "20210101T000000.000".to_string());

        let (pruned_archives, pruned_bookmarks) = get_pruned_snapshots(&archives, &bookmarks, &[], &state);
        assert_eq!(pruned_archives, vec![snap("20210102T000000.000")]);
        assert_eq!(pruned_bookmarks, vec![snap("20210103T000000.000")]);
    }

    #[test]
    fn state_protects_snapshot_even_without_policy_retaining_it() {
        let archives = vec![snap("20210101T000000.000"), snap("20210102T000000.000"), snap("20210103T000000.000")];
        let policy = RetentionPolicy { interval_seconds: 365 * DAY, count: 1, full_only: false };
        let mut state = HashMap::new();
        state.insert("dest1".to_string(), "20210102T000000.000".to_string());

        let (pruned_archives, _) = get_pruned_snapshots(&archives, &[], &[policy], &state);
        assert_eq!(pruned_archives, vec![snap("20210101T000000.000")]);
    }
}
