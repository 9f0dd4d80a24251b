// uback is a tool for incremental, content-addressed, end-to-end encrypted backups.
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

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required fingerprint option: {0}")]
    MissingOption(String),
    #[error("unknown driver type \"{0}\"")]
    UnknownDriverType(String),

    #[error("options error: {0}")]
    Options(#[from] uback_common::OptionsError),
    #[error("retention error: {0}")]
    Retention(#[from] uback_common::RetentionError),
    #[error("driver error: {0}")]
    Driver(#[from] uback_common::DriverError),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] uback_common::OrchestratorError),

    #[error("invalid key encoding: {0}")]
    HexDecode(#[from] hex::FromHexError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
