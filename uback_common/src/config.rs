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

//! Static, machine-local configuration: where the identity key lives,
//! where presets would be read from, and the default state file path.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// A `Config` holds the paths `uback` falls back to when the CLI does not
/// override them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Path to this node's X25519 identity (raw 32 bytes).
    pub identity_path: String,
    /// Directory presets would be read from, were preset-from-disk in scope.
    pub preset_dir: Option<String>,
    /// Reserved default state file path. Never substituted for a missing
    /// `StateFile` option: an un-configured state file forces a full backup
    /// rather than silently sharing one across sources.
    pub default_state_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            identity_path: "/etc/uback/identity".to_string(),
            preset_dir: Some("/etc/uback/presets".to_string()),
            default_state_file: Some("/var/lib/uback/state.json".to_string()),
        }
    }
}

impl Config {
    pub const PATH: &'static str = "/etc/uback/uback.conf";

    /// Loads the configuration file at `Self::PATH`, falling back to
    /// defaults if it does not exist.
    pub fn load() -> Result<Self, OrchestratorError> {
        let mut f = match File::open(Self::PATH) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        let mut s = String::new();
        f.read_to_string(&mut s)?;
        Ok(toml::from_str(&s)?)
    }

    /// Saves the configuration to `Self::PATH` with owner-only permissions.
    pub fn save(&self) -> Result<(), OrchestratorError> {
        let s = toml::to_string_pretty(self).expect("Config always serializes");

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(Self::PATH)?;

        write!(f, "{s}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_paths() {
        let c = Config::default();
        assert!(c.identity_path.starts_with('/'));
    }
}
