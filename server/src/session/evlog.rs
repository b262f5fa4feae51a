/*
 * Created on Wed Mar 19 2025
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

//! # Event records
//!
//! Every policy decision (accept, reject, alert) and every exit becomes one
//! structured record: submission time, optional reason, and the client's
//! key/value metadata. Records are appended to the administrative event log
//! and, for sessions with I/O logs, to the session's own `log` file.

use {
    crate::{
        error::{ProtocolError, RuntimeResult},
        proto::pb,
    },
    chrono::{TimeZone, Utc},
    parking_lot::Mutex,
    std::{
        fmt::Write as _,
        fs::OpenOptions,
        io::Write as _,
        path::{Path, PathBuf},
    },
};

#[derive(Debug, Clone, PartialEq)]
/// A parsed metadata value. String lists render as JSON arrays so that
/// order and embedded separators survive.
pub enum InfoValue {
    Num(i64),
    Str(String),
    List(Vec<String>),
}

impl InfoValue {
    fn render(&self, out: &mut String) {
        match self {
            Self::Num(n) => {
                let _ = write!(out, "{n}");
            }
            Self::Str(s) => out.push_str(s),
            Self::List(items) => {
                out.push_str(
                    &serde_json::to_string(items).unwrap_or_else(|_| String::from("[]")),
                );
            }
        }
    }
}

/// Parse client metadata, rejecting entries whose value variant this
/// server does not know.
pub fn parse_infos(msgs: &[pb::InfoMessage]) -> RuntimeResult<Vec<(String, InfoValue)>> {
    let mut out = Vec::with_capacity(msgs.len());
    for msg in msgs {
        let value = match &msg.value {
            Some(pb::info_message::Value::Numval(n)) => InfoValue::Num(*n),
            Some(pb::info_message::Value::Strval(s)) => InfoValue::Str(s.clone()),
            Some(pb::info_message::Value::Strlistval(l)) => InfoValue::List(l.strings.clone()),
            None => return Err(ProtocolError::UnknownInfoValue.into()),
        };
        out.push((msg.key.clone(), value));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
/// The event-log descriptor a session carries once an accept, reject or
/// alert has been processed (or a restart synthesized one).
pub struct EventRecord {
    /// wall-clock submission time reported by the client
    pub submit_time: pb::TimeSpec,
    /// parsed metadata, in client order
    pub infos: Vec<(String, InfoValue)>,
    /// the session's I/O log path relative to the log root, if it has one
    pub iolog_path: Option<String>,
}

impl EventRecord {
    pub fn new(submit_time: Option<pb::TimeSpec>, msgs: &[pb::InfoMessage]) -> RuntimeResult<Self> {
        Ok(Self {
            submit_time: submit_time.unwrap_or_default(),
            infos: parse_infos(msgs)?,
            iolog_path: None,
        })
    }
    /// A restart cannot recover the original metadata; carry the session
    /// identity and the resume submission time only.
    pub fn synthesized(iolog_path: String) -> Self {
        Self {
            submit_time: pb::TimeSpec::default(),
            infos: Vec::new(),
            iolog_path: Some(iolog_path),
        }
    }
    /// The `user` metadata entry, used to root the I/O log tree
    pub fn user(&self) -> Option<&str> {
        self.infos.iter().find_map(|(k, v)| match (k.as_str(), v) {
            ("user", InfoValue::Str(s)) => Some(s.as_str()),
            _ => None,
        })
    }
}

fn render_time(ts: &pb::TimeSpec) -> String {
    match Utc.timestamp_opt(ts.tv_sec, ts.tv_nsec.max(0) as u32) {
        chrono::LocalResult::Single(t) => t.format("%b %e %H:%M:%S %Y").to_string(),
        _ => format!("@{}.{:09}", ts.tv_sec, ts.tv_nsec.max(0)),
    }
}

/// Render one event record line: `<time> <KIND> [reason] key=value ...`
pub fn render_event(
    kind: &str,
    at: &pb::TimeSpec,
    reason: Option<&str>,
    rec: &EventRecord,
) -> String {
    let mut line = String::with_capacity(128);
    let _ = write!(line, "{} {}", render_time(at), kind);
    if let Some(reason) = reason {
        let _ = write!(line, " ({reason})");
    }
    for (key, value) in &rec.infos {
        let _ = write!(line, " {key}=");
        value.render(&mut line);
    }
    if let Some(iolog) = &rec.iolog_path {
        let _ = write!(line, " iolog={iolog}");
    }
    line.push('\n');
    line
}

#[derive(Debug)]
/// Append-only administrative event log. Shared by every connection; the
/// lock serializes whole-line appends.
pub struct EventLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            lock: Mutex::new(()),
        }
    }
    pub fn accept(&self, rec: &EventRecord) -> RuntimeResult<()> {
        self.append(&render_event("ACCEPT", &rec.submit_time, None, rec))
    }
    pub fn reject(&self, rec: &EventRecord, reason: &str) -> RuntimeResult<()> {
        self.append(&render_event("REJECT", &rec.submit_time, Some(reason), rec))
    }
    pub fn alert(
        &self,
        rec: &EventRecord,
        alert_time: &pb::TimeSpec,
        reason: &str,
    ) -> RuntimeResult<()> {
        self.append(&render_event("ALERT", alert_time, Some(reason), rec))
    }
    fn append(&self, line: &str) -> RuntimeResult<()> {
        let _guard = self.lock.lock();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(line.as_bytes())?;
        Ok(())
    }
}
