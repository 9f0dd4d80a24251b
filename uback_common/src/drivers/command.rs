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

//! A `Source`/`Destination` pair that shells out to an external command,
//! dispatching verbs as positional arguments and carrying resolved
//! options as `UBACK_OPT_<KEY>` / `UBACK_SOPT_<KEY>` environment
//! variables.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::error::DriverError;
use crate::model::{Backup, Snapshot};
use crate::options::Options;
use crate::ports::{Destination, Source};

fn driver_err(kind: &str, source: impl std::error::Error + Send + Sync + 'static) -> DriverError {
    DriverError::DriverFailure { kind: kind.to_string(), source: Box::new(source) }
}

/// `FullInterval` -> `FULL_INTERVAL`.
fn screaming_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_uppercase() && i != 0 {
            out.push('_');
        }
        out.extend(c.to_uppercase());
    }
    out
}

fn build_env(options: &Options) -> Result<Vec<(String, String)>, DriverError> {
    let mut env = Vec::new();
    for (k, v) in &options.strings {
        env.push((format!("UBACK_OPT_{}", screaming_snake_case(k)), v.clone()));
    }
    for (k, v) in &options.str_slices {
        let json = serde_json::to_string(v).map_err(|e| driver_err("build-env", e))?;
        env.push((format!("UBACK_SOPT_{}", screaming_snake_case(k)), json));
    }
    Ok(env)
}

fn build_command(command: &[String], env: &[(String, String)], args: &[&str]) -> Command {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);
    cmd.args(args);
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd
}

fn run_capturing_stdout(mut cmd: Command) -> Result<String, DriverError> {
    cmd.stderr(Stdio::inherit());
    let output = cmd.output().map_err(|e| driver_err("spawn", e))?;
    if !output.status.success() {
        return Err(driver_err("exec", std::io::Error::other(format!("exit status {}", output.status))));
    }
    String::from_utf8(output.stdout).map_err(|e| driver_err("decode-stdout", e))
}

fn run_quiet(mut cmd: Command) -> Result<(), DriverError> {
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    let status = cmd.status().map_err(|e| driver_err("spawn", e))?;
    if !status.success() {
        return Err(driver_err("exec", std::io::Error::other(format!("exit status {status}"))));
    }
    Ok(())
}

fn parse_listing(raw: &str, parse: impl Fn(&str) -> Option<Snapshot>) -> Vec<Snapshot> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('.') && !l.starts_with('_'))
        .filter_map(|l| {
            let parsed = parse(l);
            if parsed.is_none() {
                log::warn!("invalid snapshot name from driver: {l}");
            }
            parsed
        })
        .collect()
}

/// A source driven entirely by an external command's verb subcommands.
pub struct CommandSource {
    command: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandSource {
    pub fn new(command: Vec<String>, options: &Options) -> Result<Self, DriverError> {
        let env = build_env(options)?;
        Ok(CommandSource { command, env })
    }

    fn cmd(&self, args: &[&str]) -> Command {
        build_command(&self.command, &self.env, args)
    }
}

impl Source for CommandSource {
    fn list_archives(&self) -> Result<Vec<Snapshot>, DriverError> {
        let raw = run_capturing_stdout(self.cmd(&["list-archives"]))?;
        Ok(parse_listing(&raw, |l| Snapshot::parse(l).ok()))
    }

    fn list_bookmarks(&self) -> Result<Vec<Snapshot>, DriverError> {
        let raw = run_capturing_stdout(self.cmd(&["list-bookmarks"]))?;
        Ok(parse_listing(&raw, |l| Snapshot::parse(l).ok()))
    }

    fn remove_archive(&mut self, snapshot: &Snapshot) -> Result<(), DriverError> {
        run_quiet(self.cmd(&["remove-archive", snapshot.as_str()]))
    }

    fn remove_bookmark(&mut self, snapshot: &Snapshot) -> Result<(), DriverError> {
        run_quiet(self.cmd(&["remove-bookmark", snapshot.as_str()]))
    }

    fn create_backup(&mut self, base: Option<&Snapshot>) -> Result<(Backup, Box<dyn Read + Send>), DriverError> {
        let mut cmd = match base {
            Some(base) => self.cmd(&["create-backup", base.as_str()]),
            None => self.cmd(&["create-backup"]),
        };
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child: Child = cmd.spawn().map_err(|e| driver_err("spawn", e))?;
        let mut stdout = BufReader::new(child.stdout.take().expect("stdout piped"));

        let mut name_line = String::new();
        stdout.read_line(&mut name_line).map_err(|e| driver_err("read-backup-name", e))?;
        let backup = Backup::parse_filename(name_line.trim(), false)
            .map_err(|e| driver_err("parse-backup-name", e))?;

        Ok((backup, Box::new(ChildStdoutThenWait { stdout, child: Some(child) })))
    }

    fn restore_backup(&mut self, target_dir: &Path, backup: &Backup, data: &mut dyn Read) -> Result<(), DriverError> {
        let target = target_dir.to_string_lossy().into_owned();
        let mut cmd = match &backup.base {
            Some(base) => self.cmd(&["restore-backup", &target, backup.snapshot.as_str(), base.as_str()]),
            None => self.cmd(&["restore-backup", &target, backup.snapshot.as_str()]),
        };
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| driver_err("spawn", e))?;
        std::io::copy(data, child.stdin.as_mut().expect("stdin piped")).map_err(|e| driver_err("write-restore-stdin", e))?;
        drop(child.stdin.take());

        let status = child.wait().map_err(|e| driver_err("wait", e))?;
        if !status.success() {
            return Err(driver_err("restore-backup", std::io::Error::other(format!("exit status {status}"))));
        }
        Ok(())
    }
}

/// Reads the remainder of a child's stdout, then reaps the process once
/// the stream is drained so a partial read never leaks a zombie.
struct ChildStdoutThenWait {
    stdout: BufReader<std::process::ChildStdout>,
    child: Option<Child>,
}

impl Read for ChildStdoutThenWait {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 {
            if let Some(mut child) = self.child.take() {
                child.wait()?;
            }
        }
        Ok(n)
    }
}

/// A destination driven entirely by an external command's verb subcommands.
pub struct CommandDestination {
    command: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandDestination {
    pub fn new(command: Vec<String>, options: &Options) -> Result<Self, DriverError> {
        let env = build_env(options)?;
        let validate = build_command(&command, &env, &["validate-options"]);
        run_quiet(validate)?;
        Ok(CommandDestination { command, env })
    }

    fn cmd(&self, args: &[&str]) -> Command {
        build_command(&self.command, &self.env, args)
    }
}

impl Destination for CommandDestination {
    fn list_backups(&self) -> Result<Vec<Backup>, DriverError> {
        let raw = run_capturing_stdout(self.cmd(&["list-backups"]))?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('.') && !l.starts_with('_'))
            .filter_map(|l| match Backup::parse_filename(l, false) {
                Ok(b) => Some(b),
                Err(e) => {
                    log::warn!("invalid backup file from driver {l}: {e}");
                    None
                }
            })
            .collect())
    }

    fn remove_backup(&mut self, backup: &Backup) -> Result<(), DriverError> {
        run_quiet(self.cmd(&["remove-backup", &backup.full_name()]))
    }

    fn send_backup(&mut self, backup: &Backup, data: &mut dyn Read) -> Result<(), DriverError> {
        let mut cmd = self.cmd(&["send-backup", &backup.full_name()]);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| driver_err("spawn", e))?;
        std::io::copy(data, child.stdin.as_mut().expect("stdin piped")).map_err(|e| driver_err("write-send-stdin", e))?;
        drop(child.stdin.take());

        let status = child.wait().map_err(|e| driver_err("wait", e))?;
        if !status.success() {
            return Err(driver_err("send-backup", std::io::Error::other(format!("exit status {status}"))));
        }
        Ok(())
    }

    fn receive_backup(&self, backup: &Backup) -> Result<Box<dyn Read + Send>, DriverError> {
        let mut cmd = self.cmd(&["receive-backup", &backup.full_name()]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| driver_err("spawn", e))?;
        let stdout = child.stdout.take().expect("stdout piped");
        Ok(Box::new(ChildStdoutThenWait { stdout: BufReader::new(stdout), child: Some(child) }))
    }

    fn id(&self) -> String {
        self.command.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screaming_snake_case_splits_on_capitals() {
        assert_eq!(screaming_snake_case("FullInterval"), "FULL_INTERVAL");
        assert_eq!(screaming_snake_case("Id"), "ID");
        assert_eq!(screaming_snake_case("Path"), "PATH");
    }

    #[test]
    fn build_env_covers_both_maps() {
        let mut options = Options::default();
        options.strings.insert("Path".to_string(), "/tmp".to_string());
        options.str_slices.insert("Tag".to_string(), vec!["a".to_string(), "b".to_string()]);

        let env = build_env(&options).unwrap();
        assert!(env.contains(&("UBACK_OPT_PATH".to_string(), "/tmp".to_string())));
        assert!(env.contains(&("UBACK_SOPT_TAG".to_string(), "[\"a\",\"b\"]".to_string())));
    }
}
