/*
 * Created on Fri Mar 14 2025
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

//! # Wire protocol
//!
//! Client and server messages are protobuf encodings framed with a `u32`
//! big-endian length prefix. The message structs live in [`pb`] (generated
//! style); [`frame`] implements the length-prefixed codec; this module adds
//! the elapsed-time arithmetic every session record drives.

pub mod frame;
pub mod pb;

use core::{cmp::Ordering, fmt};

const NSEC_PER_SEC: u32 = 1_000_000_000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// Monotonic per-connection elapsed time: the sum of the delays of every
/// record processed so far, normalized to `nsec < 1s`.
pub struct Elapsed {
    sec: i64,
    nsec: u32,
}

impl Elapsed {
    pub const fn zero() -> Self {
        Self { sec: 0, nsec: 0 }
    }
    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
    pub const fn sec(&self) -> i64 {
        self.sec
    }
    pub const fn nsec(&self) -> u32 {
        self.nsec
    }
    /// Add a record's delay, carrying nanoseconds into seconds. Negative
    /// delay components are treated as zero; time never moves backwards.
    pub fn advance(&mut self, delay: &pb::TimeSpec) {
        let dsec = delay.tv_sec.max(0);
        let dnsec = delay.tv_nsec.max(0) as u32;
        self.sec += dsec;
        self.nsec += dnsec;
        if self.nsec >= NSEC_PER_SEC {
            self.sec += 1;
            self.nsec -= NSEC_PER_SEC;
        }
    }
    pub fn as_timespec(&self) -> pb::TimeSpec {
        pb::TimeSpec {
            tv_sec: self.sec,
            tv_nsec: self.nsec as i32,
        }
    }
}

impl From<&pb::TimeSpec> for Elapsed {
    fn from(ts: &pb::TimeSpec) -> Self {
        let mut e = Self::zero();
        e.advance(ts);
        e
    }
}

impl PartialOrd for Elapsed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Elapsed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sec, self.nsec).cmp(&(other.sec, other.nsec))
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.sec, self.nsec)
    }
}

impl pb::client_message::Type {
    /// The record's delay since the previous record, if this variant
    /// carries one (I/O buffers, window-size changes and suspends do;
    /// control messages do not).
    pub fn delay(&self) -> Option<pb::TimeSpec> {
        use pb::client_message::Type;
        match self {
            Type::TtyinBuf(b)
            | Type::TtyoutBuf(b)
            | Type::StdinBuf(b)
            | Type::StdoutBuf(b)
            | Type::StderrBuf(b) => b.delay,
            Type::WinsizeEvent(w) => w.delay,
            Type::SuspendEvent(s) => s.delay,
            Type::AcceptMsg(_)
            | Type::RejectMsg(_)
            | Type::ExitMsg(_)
            | Type::RestartMsg(_)
            | Type::AlertMsg(_)
            | Type::HelloMsg(_) => None,
        }
    }
    pub fn name(&self) -> &'static str {
        use pb::client_message::Type;
        match self {
            Type::AcceptMsg(_) => "accept",
            Type::RejectMsg(_) => "reject",
            Type::ExitMsg(_) => "exit",
            Type::RestartMsg(_) => "restart",
            Type::AlertMsg(_) => "alert",
            Type::TtyinBuf(_) => "ttyin",
            Type::TtyoutBuf(_) => "ttyout",
            Type::StdinBuf(_) => "stdin",
            Type::StdoutBuf(_) => "stdout",
            Type::StderrBuf(_) => "stderr",
            Type::WinsizeEvent(_) => "winsize",
            Type::SuspendEvent(_) => "suspend",
            Type::HelloMsg(_) => "hello",
        }
    }
}

impl pb::ServerMessage {
    pub fn log_id(id: String) -> Self {
        Self {
            r#type: Some(pb::server_message::Type::LogId(id)),
        }
    }
    pub fn commit_point(at: pb::TimeSpec) -> Self {
        Self {
            r#type: Some(pb::server_message::Type::CommitPoint(at)),
        }
    }
    pub fn hello(server_id: String) -> Self {
        Self {
            r#type: Some(pb::server_message::Type::Hello(pb::ServerHello {
                server_id,
            })),
        }
    }
}
