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

//! The state map: destination id -> last snapshot backed up to it, used
//! both to pick an incremental base and to protect snapshots from pruning.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::error::OrchestratorError;

pub type State = HashMap<String, String>;

/// Load the state map from `path`. A missing file is treated as an empty
/// map (the first backup to any destination is necessarily a full one).
pub fn load(path: &Path) -> Result<State, OrchestratorError> {
    match fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(State::new()),
        Err(e) => Err(e.into()),
    }
}

/// Persist the state map via a temp file in the same directory followed by
/// a rename, so a crash mid-write never leaves a half-written state file.
pub fn save(path: &Path, state: &State) -> Result<(), OrchestratorError> {
    let raw = serde_json::to_vec_pretty(state)?;

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        "_tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state.json")
    ));

    fs::write(&tmp_path, &raw)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = load(&dir.path().join("state.json")).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = State::new();
        state.insert("dest1".to_string(), "20210131T000000.000".to_string());
        save(&path, &state).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn save_overwrites_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut first = State::new();
        first.insert("dest1".to_string(), "20210101T000000.000".to_string());
        save(&path, &first).unwrap();

        let mut second = State::new();
        second.insert("dest1".to_string(), "20210201T000000.000".to_string());
        save(&path, &second).unwrap();

        assert_eq!(load(&path).unwrap(), second);
    }
}
