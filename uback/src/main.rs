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

mod error;
use error::*;

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use uback_common::config::Config;
use uback_common::crypto::{self, Identity};
use uback_common::drivers::command::{CommandDestination, CommandSource};
use uback_common::drivers::fs::FsDestination;
use uback_common::model::{self, Backup, Snapshot};
use uback_common::options::{self, Options};
use uback_common::orchestrator::backup::{run_backup, BackupRequest};
use uback_common::orchestrator::restore::resolve_backup;
use uback_common::ports::{Destination, Source};
use uback_common::{container, retention, state};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backup from a source and send it to a destination.
    Backup {
        /// The source fingerprint (e.g. `Type=command,Command=...,FullInterval=1d`).
        source: String,
        /// The destination fingerprint (e.g. `Type=fs,Path=/srv/backups,Id=offsite`).
        destination: String,
        /// Force a full backup regardless of the source's FullInterval.
        #[arg(short, long)]
        force_full: bool,
        /// Do not prune snapshots or backups after this run.
        #[arg(short, long)]
        no_prune: bool,
        /// Override (or supply) the source's StateFile option.
        #[arg(long = "state-file")]
        state_file: Option<String>,
        /// Override (or supply) the source's FullInterval option.
        #[arg(long = "full-interval")]
        full_interval: Option<String>,
    },
    /// Restore a backup (and its full chain) from a destination.
    Restore {
        /// The destination fingerprint to restore from.
        destination: String,
        /// A prefix of the backup's full name; the newest backup if omitted.
        backup: Option<String>,
        /// Directory decrypted backup payloads are written into.
        #[arg(short = 'd', long = "target-dir", default_value = ".")]
        target_dir: String,
        /// Reuse an already-downloaded encrypted backup file from target-dir
        /// instead of fetching it from the destination again.
        #[arg(short, long)]
        local: bool,
    },
    /// Prune backups or snapshots against their retention policies.
    Prune {
        #[command(subcommand)]
        target: PruneTarget,
    },
    /// List backups on a destination, or snapshots on a source.
    List {
        #[command(subcommand)]
        target: ListTarget,
    },
    /// Generate a fresh X25519 identity.
    Keygen {
        /// Where to write the raw private key (0o600). Defaults to the configured identity_path.
        #[arg(long = "private-key-path")]
        private_key_path: Option<String>,
    },
}

#[derive(Subcommand)]
enum PruneTarget {
    /// Prune backups on a destination.
    Backups {
        destination: String,
        /// Print what would be pruned without removing anything.
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
    },
    /// Prune archives and bookmarks on a source.
    Snapshots {
        source: String,
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ListTarget {
    /// List backups on a destination.
    Backups { destination: String },
    /// List archives and bookmarks on a source.
    Snapshots { source: String },
}

/// Evaluate a fingerprint string. Preset-from-disk expansion is out of
/// scope, so `Preset=...` references always miss and are dropped.
fn eval_fingerprint(fingerprint: &str) -> Result<Options> {
    let presets: HashMap<String, Vec<String>> = HashMap::new();
    let fields = options::split_options(fingerprint);
    Ok(options::eval_options(&fields, &presets)?)
}

fn command_from_options(opts: &Options) -> Result<Vec<String>> {
    let multi = opts.get_multi("Command");
    if !multi.is_empty() {
        return Ok(multi.to_vec());
    }

    let s = opts.get_required("Command")?;
    let parts: Vec<String> = s.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        return Err(Error::MissingOption("Command".to_string()));
    }
    Ok(parts)
}

fn build_source(opts: &Options) -> Result<Box<dyn Source>> {
    match opts.get_required("Type")? {
        "command" => Ok(Box::new(CommandSource::new(command_from_options(opts)?, opts)?)),
        other => Err(Error::UnknownDriverType(other.to_string())),
    }
}

fn build_destination(opts: &Options) -> Result<Box<dyn Destination>> {
    match opts.get_required("Type")? {
        "fs" => Ok(Box::new(FsDestination::new(opts.get_required("Path")?)?)),
        "command" => Ok(Box::new(CommandDestination::new(command_from_options(opts)?, opts)?)),
        other => Err(Error::UnknownDriverType(other.to_string())),
    }
}

fn recipient_key(opts: &Options) -> Result<x25519_dalek::PublicKey> {
    Ok(crypto::public_key_from_hex(opts.get_required("Key")?)?)
}

fn load_identity() -> Result<Identity> {
    let config = Config::load()?;
    Ok(Identity::load_private_from_file(Path::new(&config.identity_path))?)
}

fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Backup { source, destination, force_full, no_prune, state_file, full_interval } => {
            cmd_backup(&source, &destination, force_full, no_prune, state_file, full_interval)
        }
        Commands::Restore { destination, backup, target_dir, local } => {
            cmd_restore(&destination, backup.as_deref(), &target_dir, local)
        }
        Commands::Prune { target: PruneTarget::Backups { destination, dry_run } } => {
            cmd_prune_backups(&destination, dry_run)
        }
        Commands::Prune { target: PruneTarget::Snapshots { source, dry_run } } => {
            cmd_prune_snapshots(&source, dry_run)
        }
        Commands::List { target: ListTarget::Backups { destination } } => cmd_list_backups(&destination),
        Commands::List { target: ListTarget::Snapshots { source } } => cmd_list_snapshots(&source),
        Commands::Keygen { private_key_path } => cmd_keygen(private_key_path),
    }
}

fn cmd_backup(
    source_fp: &str,
    dest_fp: &str,
    force_full: bool,
    no_prune: bool,
    state_file: Option<String>,
    full_interval: Option<String>,
) -> Result<()> {
    let mut source_opts = eval_fingerprint(source_fp)?;
    if let Some(interval) = full_interval {
        source_opts.strings.insert("FullInterval".to_string(), interval);
    }
    if let Some(path) = &state_file {
        source_opts.strings.insert("StateFile".to_string(), path.clone());
    }

    let dest_opts = eval_fingerprint(dest_fp)?;

    let mut source = build_source(&source_opts)?;
    let mut destination = build_destination(&dest_opts)?;

    let source_type = source_opts.get_required("Type")?.to_string();
    let recipient = recipient_key(&source_opts)?;
    let destination_id = dest_opts.get_required("Id")?.to_string();
    let compression_level: i32 = source_opts
        .get_string("CompressionLevel")
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);

    let source_policies = retention::policies_from_options(&source_opts)?;
    let destination_policies = retention::policies_from_options(&dest_opts)?;

    let state_path: Option<PathBuf> = source_opts.get_string("StateFile").map(PathBuf::from);

    let backup = run_backup(BackupRequest {
        source: source.as_mut(),
        destination: destination.as_mut(),
        source_opts: &source_opts,
        source_type: &source_type,
        recipient: &recipient,
        destination_id,
        compression_level,
        force_full,
        no_prune,
        source_policies: &source_policies,
        destination_policies: &destination_policies,
        state_path: state_path.as_deref(),
    })?;

    println!("{}", backup.filename());
    Ok(())
}

/// Mirrors `original_source/cmd/restore.go`'s `restore()` helper: a local
/// copy of the encrypted backup file under `target_dir` is reused when
/// `--local` is given and the file exists, otherwise it is fetched from
/// the destination. The reduced CLI surface has no source fingerprint
/// argument for restore, so the decrypted payload is written flat as
/// `target_dir/<full-name>.data` rather than handed to a `Source::restore_backup`.
fn cmd_restore(dest_fp: &str, backup_prefix: Option<&str>, target_dir: &str, local: bool) -> Result<()> {
    let dest_opts = eval_fingerprint(dest_fp)?;
    let destination = build_destination(&dest_opts)?;
    let identity = load_identity()?;

    let backups = model::sorted_newest_first(destination.list_backups()?);
    let target_backup = match backup_prefix {
        Some(prefix) => resolve_backup(&backups, prefix)?.clone(),
        None => backups.first().ok_or_else(|| {
            uback_common::OrchestratorError::AmbiguousOrMissingBackup(String::new())
        })?.clone(),
    };

    let index = model::make_index(&backups);
    let (chain, complete) = model::get_full_chain(&target_backup, &index);
    if !complete {
        return Err(uback_common::OrchestratorError::OrphanChain.into());
    }

    let target_dir = Path::new(target_dir);
    std::fs::create_dir_all(target_dir)?;

    for backup in chain.into_iter().rev() {
        log::info!("restoring {} into {}", backup.filename(), target_dir.display());

        let local_path = target_dir.join(backup.filename());
        let data: Box<dyn io::Read + Send> = if local && local_path.exists() {
            Box::new(File::open(&local_path)?)
        } else {
            destination.receive_backup(&backup)?
        };

        let mut reader =
            container::Reader::open(data, Some(&identity)).map_err(uback_common::OrchestratorError::from)?;

        let out_path = target_dir.join(format!("{}.data", backup.full_name()));
        let mut out = File::create(&out_path)?;
        io::copy(&mut reader, &mut out)?;
    }

    Ok(())
}

fn cmd_prune_backups(dest_fp: &str, dry_run: bool) -> Result<()> {
    let dest_opts = eval_fingerprint(dest_fp)?;
    let mut destination = build_destination(&dest_opts)?;
    let policies = retention::policies_from_options(&dest_opts)?;

    let backups = model::sorted_newest_first(destination.list_backups()?);
    let pruned = retention::get_pruned_backups(&backups, &policies);

    for backup in &pruned {
        println!("{}", backup.full_name());
    }

    if !dry_run {
        retention::prune_with(&pruned, Backup::full_name, |b| destination.remove_backup(b));
    }
    Ok(())
}

fn cmd_prune_snapshots(source_fp: &str, dry_run: bool) -> Result<()> {
    let source_opts = eval_fingerprint(source_fp)?;
    let mut source = build_source(&source_opts)?;
    let policies = retention::policies_from_options(&source_opts)?;

    let archives = model::sorted_newest_first(source.list_archives()?);
    let bookmarks = model::sorted_newest_first(source.list_bookmarks()?);

    let state = match source_opts.get_string("StateFile") {
        Some(path) => state::load(Path::new(path))?,
        None => state::State::new(),
    };

    let (pruned_archives, pruned_bookmarks) =
        retention::get_pruned_snapshots(&archives, &bookmarks, &policies, &state);

    for snapshot in pruned_archives.iter().chain(pruned_bookmarks.iter()) {
        println!("{snapshot}");
    }

    if !dry_run {
        retention::prune_with(&pruned_archives, Snapshot::to_string, |s| source.remove_archive(s));
        retention::prune_with(&pruned_bookmarks, Snapshot::to_string, |s| source.remove_bookmark(s));
    }
    Ok(())
}

fn cmd_list_backups(dest_fp: &str) -> Result<()> {
    let dest_opts = eval_fingerprint(dest_fp)?;
    let destination = build_destination(&dest_opts)?;

    for backup in model::sorted_newest_first(destination.list_backups()?) {
        match &backup.base {
            None => println!("{} (full)", backup.snapshot),
            Some(base) => println!("{} (base: {})", backup.snapshot, base),
        }
    }
    Ok(())
}

fn cmd_list_snapshots(source_fp: &str) -> Result<()> {
    let source_opts = eval_fingerprint(source_fp)?;
    let source = build_source(&source_opts)?;

    for snapshot in model::sorted_newest_first(source.list_archives()?) {
        println!("{snapshot} (archive)");
    }
    for snapshot in model::sorted_newest_first(source.list_bookmarks()?) {
        println!("{snapshot} (bookmark)");
    }
    Ok(())
}

fn cmd_keygen(private_key_path: Option<String>) -> Result<()> {
    let path = match private_key_path {
        Some(p) => p,
        None => Config::load()?.identity_path,
    };

    let identity = Identity::generate();
    identity.save_private_to_file(Path::new(&path))?;
    println!("{}", hex::encode(identity.public_bytes()));
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        log::error!("{e}");
        std::process::exit(1);
    }
}
