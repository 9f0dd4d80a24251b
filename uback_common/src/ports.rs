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

//! The polymorphic `Source`/`Destination` ports every driver implements.
//! The core engine dispatches through these traits only and never depends
//! on a concrete driver's internals.

use std::io::{Read, Write};

use crate::error::DriverError;
use crate::model::{Backup, Snapshot};

/// A source of snapshots and backups: filesystem CoW volumes, SQL hot-copy
/// tools, tar with a change journal, or an arbitrary external command.
pub trait Source {
    /// Restorable on-source snapshots, subject to retention.
    fn list_archives(&self) -> Result<Vec<Snapshot>, DriverError>;
    /// Lightweight snapshot handles kept only to serve as incremental bases.
    fn list_bookmarks(&self) -> Result<Vec<Snapshot>, DriverError>;
    fn remove_archive(&mut self, snapshot: &Snapshot) -> Result<(), DriverError>;
    fn remove_bookmark(&mut self, snapshot: &Snapshot) -> Result<(), DriverError>;

    /// Produce a backup, optionally incremental against `base`. The driver
    /// MUST NOT return an incremental backup when `base` is `None`.
    fn create_backup(&mut self, base: Option<&Snapshot>) -> Result<(Backup, Box<dyn Read + Send>), DriverError>;

    /// Idempotently restore `backup`'s plaintext into `target_dir`. When
    /// incremental, the base's restored output is already present in
    /// `target_dir` under the base snapshot's name.
    fn restore_backup(&mut self, target_dir: &std::path::Path, backup: &Backup, data: &mut dyn Read) -> Result<(), DriverError>;
}

/// A destination a backup is shipped to: a local directory, object
/// storage, or a subprocess-bridged remote.
pub trait Destination {
    fn list_backups(&self) -> Result<Vec<Backup>, DriverError>;
    fn remove_backup(&mut self, backup: &Backup) -> Result<(), DriverError>;

    /// Must expose the final object under the backup's filename only on
    /// full success (temp-then-rename or equivalent).
    fn send_backup(&mut self, backup: &Backup, data: &mut dyn Read) -> Result<(), DriverError>;
    fn receive_backup(&self, backup: &Backup) -> Result<Box<dyn Read + Send>, DriverError>;

    /// A stable identifier for this destination instance, used as the key
    /// into the state map.
    fn id(&self) -> String;
}

/// Helper shared by drivers that stream a backup straight into a
/// caller-owned writer rather than returning an owned `Box<dyn Read>`
/// (e.g. when piping directly from a subprocess's stdout).
pub fn copy_all(mut from: impl Read, mut to: impl Write) -> std::io::Result<u64> {
    std::io::copy(&mut from, &mut to)
}
