/*
 * Created on Fri Mar 21 2025
 *
 * This file is a part of Vigil
 * Vigil is a free and open-source centralized audit log receiver that
 * records privileged command sessions into durable, relayable artifacts
 * without compromising on integrity or operability.
 *
 * Copyright (c) 2025, The Vigil Authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # Journals
//!
//! A journal is the relay sink's artifact: the session's raw framed client
//! messages, byte for byte, spooled under `<relay_dir>/incoming/` while the
//! session runs. The exit handler commits it with a rename onto a fresh
//! unique name under `<relay_dir>/outgoing/`, where the forwarder picks it
//! up. A journal still sitting in `incoming/` after a crash is left for an
//! operator recovery pass.

use {
    crate::{
        error::{ProtocolError, RestartError, RuntimeResult},
        proto::{
            frame::{self, FrameReader},
            pb, Elapsed,
        },
        util,
    },
    prost::Message,
    std::{
        fs::{self, File, OpenOptions},
        io::{BufReader, BufWriter, ErrorKind, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
    },
};

pub const INCOMING_DIR: &str = "incoming";
pub const OUTGOING_DIR: &str = "outgoing";

/// Journal file names are `<prefix>.XXXXXX` under incoming/ and outgoing/
const JOURNAL_PREFIX: &str = "vigil";
const JOURNAL_FILE_MODE: u32 = 0o600;
const RELAY_DIR_MODE: u32 = 0o711;

#[derive(Debug)]
pub struct Journal {
    file: BufWriter<File>,
    path: PathBuf,
    name: String,
}

impl Journal {
    /// Create a fresh journal under `<relay_dir>/incoming/`: unique name,
    /// mode 0600, exclusively locked for the lifetime of the handle.
    pub fn create(relay_dir: &Path) -> RuntimeResult<Self> {
        let incoming = relay_dir.join(INCOMING_DIR);
        util::os::create_dir_tree(&incoming, RELAY_DIR_MODE)?;
        let (file, path) = util::os::create_unique_file(&incoming, JOURNAL_PREFIX, JOURNAL_FILE_MODE)?;
        util::os::lock_exclusive(&file)?;
        let name = file_name_of(&path);
        Ok(Self {
            file: BufWriter::new(file),
            path,
            name,
        })
    }
    /// Reopen an interrupted journal under `<relay_dir>/incoming/` for a
    /// restarting client.
    pub fn open_incoming(relay_dir: &Path, name: &str) -> RuntimeResult<Self> {
        let path = relay_dir.join(INCOMING_DIR).join(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no incoming journal at {}", path.display());
                return Err(RestartError::MissingJournal.into());
            }
            Err(e) => return Err(e.into()),
        };
        util::os::lock_exclusive(&file)?;
        let name = file_name_of(&path);
        Ok(Self {
            file: BufWriter::new(file),
            path,
            name,
        })
    }
    /// The file name under `incoming/`, used to build the client's log id
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// Append one raw client frame, exactly as received off the wire
    pub fn append(&mut self, raw: &[u8]) -> RuntimeResult<()> {
        frame::write_frame(&mut self.file, raw)
    }
    /// Commit the journal: flush, rewind to offset zero for the forwarder,
    /// then rename onto a fresh unique name under `outgoing/`. The rename
    /// is the commit point; on failure the outgoing placeholder is removed
    /// and the journal stays under `incoming/`.
    pub fn finish(&mut self, relay_dir: &Path) -> RuntimeResult<()> {
        self.file.flush()?;
        self.file.rewind()?;
        let outgoing = relay_dir.join(OUTGOING_DIR);
        util::os::create_dir_tree(&outgoing, RELAY_DIR_MODE)?;
        let (placeholder, out_path) =
            util::os::create_unique_file(&outgoing, JOURNAL_PREFIX, JOURNAL_FILE_MODE)?;
        drop(placeholder);
        if let Err(e) = fs::rename(&self.path, &out_path) {
            let _ = fs::remove_file(&out_path);
            return Err(e.into());
        }
        self.path = out_path;
        Ok(())
    }
    /// Replay the journal from the beginning, accounting every record's
    /// delay into `elapsed`, until `elapsed` equals `target`. Nothing is
    /// executed; the walk doubles as structural validation. On success the
    /// file is positioned immediately past the last counted record, ready
    /// for appends. A journal that overshoots the target, ends before it,
    /// or contains an unparsable record is invalid.
    pub fn seek_to(&mut self, target: &Elapsed, elapsed: &mut Elapsed) -> RuntimeResult<()> {
        self.file.flush()?;
        let raw_file = self.file.get_mut();
        raw_file.rewind()?;
        let mut consumed: u64 = 0;
        let mut frames = FrameReader::new();
        let mut reader = BufReader::new(&mut *raw_file);
        while *elapsed < *target {
            let payload = match frames.read_from(&mut reader)? {
                Some(p) => p,
                None => {
                    debug!("journal ended at {} before resume point {}", elapsed, target);
                    return Err(RestartError::InvalidJournal.into());
                }
            };
            consumed += (frame::LEN_PREFIX + payload.len()) as u64;
            let msg = match pb::ClientMessage::decode(payload) {
                Ok(msg) => msg,
                Err(_) => {
                    debug!("undecodable record in journal {}", self.name);
                    return Err(ProtocolError::BadPayload.into());
                }
            };
            let ty = msg.r#type.ok_or(ProtocolError::BadPayload)?;
            if let Some(delay) = ty.delay() {
                elapsed.advance(&delay);
            }
        }
        if *elapsed > *target {
            debug!("journal overshot resume point: {} > {}", elapsed, target);
            return Err(RestartError::InvalidJournal.into());
        }
        drop(reader);
        raw_file.seek(SeekFrom::Start(consumed))?;
        Ok(())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
