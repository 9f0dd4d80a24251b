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

use std::io;

use thiserror::Error;

/// A `ContainerError` indicates a failure sealing or unsealing a container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The header did not start with the expected magic bytes.
    #[error("invalid magic bytes")]
    InvalidMagic,
    /// The header declared flags this implementation does not understand.
    #[error("unsupported flags: {0:#06x}")]
    UnsupportedFlags(u16),
    /// The header was cut off before all fixed fields could be read.
    #[error("truncated container header")]
    TruncatedHeader,
    /// A secretstream block failed authentication.
    #[error("MAC mismatch while unsealing container")]
    MacMismatch,
    /// The reader's key does not correspond to the container's recipient.
    #[error("provided private key does not correspond to the recipient public key")]
    RecipientMismatch,
    /// The stream ended without a FINAL-tagged block.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    /// Plaintext/sealed mode mismatch between header and caller-supplied key.
    #[error("container plaintext mode does not match supplied key")]
    PlaintextModeMismatch,
    /// Compression layer failure.
    #[error("zstd error: {0}")]
    Zstd(#[source] io::Error),
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A `ModelError` indicates a failure parsing a snapshot or backup identity.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The string does not match the snapshot timestamp grammar.
    #[error("invalid snapshot name \"{0}\"")]
    InvalidSnapshotName(String),
    /// The string does not match the backup filename grammar.
    #[error("invalid backup name \"{0}\"")]
    InvalidBackupName(String),
}

/// An `OptionsError` indicates a failure parsing an options/fingerprint string.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// A key=value pair could not be parsed.
    #[error("invalid option \"{0}\"")]
    InvalidOption(String),
    /// A required option key was not present.
    #[error("missing required option \"{0}\"")]
    MissingOption(String),
}

/// A `RetentionError` indicates a failure parsing a retention policy expression.
#[derive(Debug, Error)]
pub enum RetentionError {
    /// The policy string as a whole is malformed.
    #[error("invalid retention policy \"{0}\"")]
    InvalidRetentionPolicy(String),
    /// The interval portion of a policy string is malformed.
    #[error("invalid retention interval \"{0}\"")]
    InvalidInterval(String),
}

/// A `DriverError` wraps a failure reported by a `Source` or `Destination` driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver reported a failure; `kind` names the operation that failed.
    #[error("driver failure during {kind}: {source}")]
    DriverFailure {
        /// The operation the driver was performing, e.g. "send-backup".
        kind: String,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// An `OrchestratorError` indicates a failure of the backup or restore orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A container-level error occurred.
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
    /// A model-level error occurred.
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    /// An options-level error occurred.
    #[error("options error: {0}")]
    Options(#[from] OptionsError),
    /// A retention-level error occurred.
    #[error("retention error: {0}")]
    Retention(#[from] RetentionError),
    /// A driver reported an error.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    /// The backup's chain does not end in a full backup.
    #[error("backup chain is incomplete (orphan)")]
    OrphanChain,
    /// No backup matched the requested name, or more than one did.
    #[error("no unambiguous backup matches \"{0}\"")]
    AmbiguousOrMissingBackup(String),
    /// The producer/consumer pipe was closed by the other side.
    #[error("pipe closed: {0}")]
    PipeClosed(String),
    /// The state file could not be parsed as JSON.
    #[error("state file is corrupt: {0}")]
    StateFileCorrupt(#[from] serde_json::Error),
    /// The static config file could not be parsed as TOML.
    #[error("config file is corrupt: {0}")]
    ConfigCorrupt(#[from] toml::de::Error),
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
