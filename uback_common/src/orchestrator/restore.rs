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

//! Resolves a backup name (possibly just a unique prefix) against a
//! destination's listing, walks its chain back to the full backup, and
//! replays the chain oldest-first into the target directory.

use std::fs;
use std::path::Path;

use crate::container;
use crate::crypto::Identity;
use crate::error::OrchestratorError;
use crate::model::{self, Backup};
use crate::ports::{Destination, Source};

/// Resolve `name_prefix` to exactly one backup in `backups` (sorted or
/// not). An empty prefix matches everything, so with more than one backup
/// present it is always ambiguous -- callers wanting "restore the newest
/// backup" should select `backups[0]` (newest-first) directly rather than
/// resolving an empty prefix here.
pub fn resolve_backup<'a>(backups: &'a [Backup], name_prefix: &str) -> Result<&'a Backup, OrchestratorError> {
    let mut matches = backups.iter().filter(|b| b.full_name().starts_with(name_prefix));
    let first = matches.next().ok_or_else(|| OrchestratorError::AmbiguousOrMissingBackup(name_prefix.to_string()))?;
    if matches.next().is_some() {
        return Err(OrchestratorError::AmbiguousOrMissingBackup(name_prefix.to_string()));
    }
    Ok(first)
}

/// Restore `target_backup` and every backup it transitively depends on,
/// oldest (full) first, into `target_dir`. Creates `target_dir` if it
/// does not exist.
pub fn run_restore(
    source: &mut dyn Source,
    destination: &dyn Destination,
    identity: &Identity,
    target_backup: &Backup,
    all_backups: &[Backup],
    target_dir: &Path,
) -> Result<(), OrchestratorError> {
    let index = model::make_index(all_backups);
    let (chain, complete) = model::get_full_chain(target_backup, &index);
    if !complete {
        return Err(OrchestratorError::OrphanChain);
    }

    fs::create_dir_all(target_dir)?;

    for backup in chain.into_iter().rev() {
        log::info!("restoring {} onto {}", backup.filename(), target_dir.display());

        let data = destination.receive_backup(&backup)?;
        let mut reader = container::Reader::open(data, Some(identity))?;
        source.restore_backup(target_dir, &backup, &mut reader)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Snapshot;

    fn snap(s: &str) -> Snapshot {
        Snapshot::parse(s).unwrap()
    }

    #[test]
    fn resolve_exact_prefix_match() {
        let backups = vec![
            Backup::full(snap("20210101T000000.000")),
            Backup::full(snap("20210102T000000.000")),
        ];
        let resolved = resolve_backup(&backups, "20210101T000000.000-full").unwrap();
        assert_eq!(resolved.snapshot, snap("20210101T000000.000"));
    }

    #[test]
    fn resolve_rejects_ambiguous_prefix() {
        let backups = vec![
            Backup::full(snap("20210101T000000.000")),
            Backup::incremental(snap("20210101T000000.001"), snap("20210101T000000.000")),
        ];
        assert!(resolve_backup(&backups, "20210101T000000.00").is_err());
    }

    #[test]
    fn resolve_rejects_missing_prefix() {
        let backups = vec![Backup::full(snap("20210101T000000.000"))];
        assert!(resolve_backup(&backups, "99999999T000000.000").is_err());
    }

    #[test]
    fn orphan_chain_is_rejected_before_restoring() {
        let orphan = Backup::incremental(snap("20210102T000000.000"), snap("20210101T000000.000"));
        let index = model::make_index(&[orphan.clone()]);
        let (_, complete) = model::get_full_chain(&orphan, &index);
        assert!(!complete);
    }
}
