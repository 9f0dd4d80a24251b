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

//! Drives one backup: picks an incremental base (or forces a full
//! backup), pipes the source's plaintext through the container codec to
//! the destination, updates the state map, and optionally prunes.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::thread;

use x25519_dalek::PublicKey;

use crate::container;
use crate::error::OrchestratorError;
use crate::model::{self, Backup, Snapshot};
use crate::options::Options;
use crate::ports::{Destination, Source};
use crate::retention::{self, RetentionPolicy};
use crate::state::{self, State};

const PIPE_DEPTH: usize = 4;

/// A single-producer single-consumer byte pipe bridging the writer thread
/// (sealing the container) and the sender thread (streaming it out),
/// mirroring the teacher's `thread::scope` + channel-backed sync idiom
/// without pulling in an async runtime or `os_pipe`.
struct PipeWriter {
    tx: mpsc::SyncSender<io::Result<Vec<u8>>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "backup pipe reader gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PipeReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.buf.len() {
                let n = (self.buf.len() - self.pos).min(out.len());
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.buf = chunk;
                    self.pos = 0;
                    if self.buf.is_empty() {
                        return Ok(0);
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(0),
            }
        }
    }
}

fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::sync_channel(PIPE_DEPTH);
    (PipeWriter { tx }, PipeReader { rx, buf: Vec::new(), pos: 0 })
}

/// Everything the decision procedure and execution pipeline need,
/// resolved ahead of time from fingerprints by the caller.
pub struct BackupRequest<'a> {
    pub source: &'a mut dyn Source,
    pub destination: &'a mut dyn Destination,
    pub source_opts: &'a Options,
    pub source_type: &'a str,
    pub recipient: &'a PublicKey,
    pub destination_id: String,
    pub compression_level: i32,
    pub force_full: bool,
    pub no_prune: bool,
    pub source_policies: &'a [RetentionPolicy],
    pub destination_policies: &'a [RetentionPolicy],
    pub state_path: Option<&'a std::path::Path>,
}

/// Decide whether this run must be a full backup, and if not, which
/// snapshot to use as the incremental base. `state_file_present` must be
/// true only when a `StateFile` was configured *and* it already exists on
/// disk -- an un-configured or not-yet-created state file forces full,
/// matching `original_source/cmd/backup.go`'s `StateFile == ""` check.
fn choose_base(
    source_opts: &Options,
    backups_newest_first: &[Backup],
    snapshot_names: &HashSet<String>,
    force_full: bool,
    state_file_present: bool,
) -> Option<Snapshot> {
    if force_full {
        return None;
    }

    if !state_file_present {
        log::warn!("no state file configured or state file missing, full backup forced");
        return None;
    }

    let full_interval = match source_opts.get_string("FullInterval") {
        Some(v) => match retention::parse_interval(v) {
            Ok(seconds) => seconds,
            Err(e) => {
                log::warn!("invalid FullInterval, full backup forced: {e}");
                return None;
            }
        },
        None => {
            log::warn!("no FullInterval option given, full backup forced");
            return None;
        }
    };

    let mut last_full: Option<&Backup> = None;
    let mut last_common: Option<&Backup> = None;
    for b in backups_newest_first {
        if last_common.is_none() && snapshot_names.contains(b.snapshot.as_str()) {
            last_common = Some(b);
        }
        if last_full.is_none() && b.is_full() {
            last_full = Some(b);
        }
        if last_full.is_some() && last_common.is_some() {
            break;
        }
    }

    let last_full = match last_full {
        Some(b) => b,
        None => {
            log::warn!("no full backup found at destination, full backup forced");
            return None;
        }
    };
    let last_common = match last_common {
        Some(b) => b,
        None => {
            log::warn!("no common snapshot between source and destination, full backup forced");
            return None;
        }
    };

    let elapsed = (chrono::Utc::now().naive_utc() - last_full.snapshot.time()).num_seconds() as f64;
    if elapsed >= 0.9 * full_interval as f64 {
        log::info!("interval between full backups reached, full backup forced");
        return None;
    }

    Some(last_common.snapshot.clone())
}

/// Run one backup end to end. Returns the backup that was created.
pub fn run_backup(req: BackupRequest) -> Result<Backup, OrchestratorError> {
    let BackupRequest {
        source,
        destination,
        source_opts,
        source_type,
        recipient,
        destination_id,
        compression_level,
        force_full,
        no_prune,
        source_policies,
        destination_policies,
        state_path,
    } = req;

    let mut backups = model::sorted_newest_first(destination.list_backups()?);
    let archives = source.list_archives()?;
    let bookmarks = source.list_bookmarks()?;

    let mut snapshot_names: HashSet<String> = HashSet::new();
    snapshot_names.extend(archives.iter().map(|s| s.as_str().to_string()));
    snapshot_names.extend(bookmarks.iter().map(|s| s.as_str().to_string()));

    let state_file_present = state_path.is_some_and(|p| p.exists());
    let base = choose_base(source_opts, &backups, &snapshot_names, force_full, state_file_present);

    let (backup_meta, mut plaintext) = source.create_backup(base.as_ref())?;

    let (pipe_writer, mut pipe_reader) = pipe();
    let type_str = source_type.to_string();
    let recipient = *recipient;

    let writer_result: Result<(), OrchestratorError> = thread::scope(|scope| {
        let writer_handle = scope.spawn(move || -> Result<(), OrchestratorError> {
            let mut sealed = container::Writer::seal(pipe_writer, &recipient, &type_str, compression_level)?;
            io::copy(&mut plaintext, &mut sealed)?;
            Ok(())
        });

        destination.send_backup(&backup_meta, &mut pipe_reader)?;

        writer_handle
            .join()
            .map_err(|_| OrchestratorError::PipeClosed("writer thread panicked".to_string()))?
    });
    writer_result?;

    let mut state: State = match state_path {
        Some(p) => state::load(p)?,
        None => State::new(),
    };
    if let Some(p) = state_path {
        state.insert(destination_id, backup_meta.snapshot.as_str().to_string());
        state::save(p, &state)?;
    }

    if !no_prune {
        let mut all_archives = archives.clone();
        all_archives.insert(0, backup_meta.snapshot.clone());
        let (pruned_archives, pruned_bookmarks) =
            retention::get_pruned_snapshots(&all_archives, &bookmarks, source_policies, &state);
        retention::prune_with(&pruned_archives, |s| s.as_str().to_string(), |s| source.remove_archive(s));
        retention::prune_with(&pruned_bookmarks, |s| s.as_str().to_string(), |s| source.remove_bookmark(s));

        backups.insert(0, backup_meta.clone());
        let pruned_backups = retention::get_pruned_backups(&backups, destination_policies);
        retention::prune_with(&pruned_backups, |b| b.full_name(), |b| destination.remove_backup(b));
    }

    Ok(backup_meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(s: &str) -> Snapshot {
        Snapshot::parse(s).unwrap()
    }

    #[test]
    fn force_full_skips_interval_check() {
        let opts = Options::default();
        let backups = vec![Backup::full(snap("20210101T000000.000"))];
        let names: HashSet<String> = HashSet::new();
        assert!(choose_base(&opts, &backups, &names, true, true).is_none());
    }

    #[test]
    fn missing_state_file_forces_full() {
        let mut strings = std::collections::HashMap::new();
        strings.insert("FullInterval".to_string(), "7d".to_string());
        let opts = Options { strings, str_slices: Default::default() };
        let full = Backup::full(Snapshot::now());
        let backups = vec![full.clone()];
        let names: HashSet<String> = [full.snapshot.as_str().to_string()].into_iter().collect();
        assert!(choose_base(&opts, &backups, &names, false, false).is_none());
    }

    #[test]
    fn missing_full_interval_forces_full() {
        let opts = Options::default();
        let backups = vec![Backup::full(snap("20210101T000000.000"))];
        let names: HashSet<String> = [("20210101T000000.000".to_string())].into_iter().collect();
        assert!(choose_base(&opts, &backups, &names, false, true).is_none());
    }

    #[test]
    fn no_common_snapshot_forces_full() {
        let mut strings = std::collections::HashMap::new();
        strings.insert("FullInterval".to_string(), "7d".to_string());
        let opts = Options { strings, str_slices: Default::default() };
        let backups = vec![Backup::full(snap("20210101T000000.000"))];
        let names: HashSet<String> = HashSet::new();
        assert!(choose_base(&opts, &backups, &names, false, true).is_none());
    }

    #[test]
    fn common_snapshot_and_fresh_full_yields_incremental_base() {
        let mut strings = std::collections::HashMap::new();
        strings.insert("FullInterval".to_string(), "365d".to_string());
        let opts = Options { strings, str_slices: Default::default() };
        let full = Backup::full(Snapshot::now());
        let backups = vec![full.clone()];
        let names: HashSet<String> = [full.snapshot.as_str().to_string()].into_iter().collect();
        assert_eq!(choose_base(&opts, &backups, &names, false, true), Some(full.snapshot));
    }
}
