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

//! A `Destination` backed by a plain directory on the local filesystem.

use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

use crate::error::DriverError;
use crate::model::Backup;
use crate::ports::Destination;

pub struct FsDestination {
    base_path: PathBuf,
}

fn driver_err(kind: &str, source: impl std::error::Error + Send + Sync + 'static) -> DriverError {
    DriverError::DriverFailure { kind: kind.to_string(), source: Box::new(source) }
}

impl FsDestination {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, DriverError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(FsDestination { base_path })
    }

    fn path_for(&self, backup: &Backup) -> PathBuf {
        self.base_path.join(backup.filename())
    }
}

impl Destination for FsDestination {
    fn list_backups(&self) -> Result<Vec<Backup>, DriverError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }
            if entry.file_type()?.is_dir() {
                continue;
            }

            match Backup::parse_filename(&name, true) {
                Ok(backup) => out.push(backup),
                Err(e) => log::warn!("invalid backup file {name}: {e}"),
            }
        }
        Ok(out)
    }

    fn remove_backup(&mut self, backup: &Backup) -> Result<(), DriverError> {
        Ok(fs::remove_file(self.path_for(backup))?)
    }

    fn send_backup(&mut self, backup: &Backup, data: &mut dyn Read) -> Result<(), DriverError> {
        let tmp_path = self.base_path.join(format!("_tmp-{}", backup.filename()));
        let final_path = self.path_for(backup);

        let result = (|| -> Result<(), DriverError> {
            let mut tmp_f = File::create(&tmp_path)?;
            log::debug!("writing backup to {}", tmp_path.display());
            std::io::copy(data, &mut tmp_f).map_err(|e| driver_err("send-backup", e))?;
            drop(tmp_f);
            log::debug!("moving final backup to {}", final_path.display());
            fs::rename(&tmp_path, &final_path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn receive_backup(&self, backup: &Backup) -> Result<Box<dyn Read + Send>, DriverError> {
        Ok(Box::new(File::open(self.path_for(backup))?))
    }

    fn id(&self) -> String {
        self.base_path.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Snapshot;
    use std::io::Cursor;

    #[test]
    fn send_then_list_then_receive_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut dest = FsDestination::new(dir.path()).unwrap();

        let backup = Backup::full(Snapshot::parse("20210131T000000.000").unwrap());
        dest.send_backup(&backup, &mut Cursor::new(b"payload".to_vec())).unwrap();

        let listed = dest.list_backups().unwrap();
        assert_eq!(listed, vec![backup.clone()]);

        let mut received = Vec::new();
        dest.receive_backup(&backup).unwrap().read_to_end(&mut received).unwrap();
        assert_eq!(received, b"payload");
    }

    #[test]
    fn list_skips_dotfiles_and_underscore_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden"), b"").unwrap();
        fs::write(dir.path().join("_tmp-leftover"), b"").unwrap();
        let dest = FsDestination::new(dir.path()).unwrap();
        assert!(dest.list_backups().unwrap().is_empty());
    }

    #[test]
    fn remove_backup_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut dest = FsDestination::new(dir.path()).unwrap();
        let backup = Backup::full(Snapshot::parse("20210131T000000.000").unwrap());
        dest.send_backup(&backup, &mut Cursor::new(b"x".to_vec())).unwrap();
        dest.remove_backup(&backup).unwrap();
        assert!(dest.list_backups().unwrap().is_empty());
    }
}
