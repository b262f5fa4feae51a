/*
 * Created on Wed Mar 12 2025
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

use core::fmt;

pub type RuntimeResult<T> = Result<T, Error>;

#[derive(Debug)]
/// Any error that a message handler can surface. The event loop renders it,
/// stores it on the connection and tears the connection down.
pub enum Error {
    /// an I/O failure on a journal, an I/O log file or the wire
    Io(std::io::Error),
    /// the peer broke the wire protocol, or an on-disk record is unparsable
    Protocol(ProtocolError),
    /// a restart request that cannot be honored
    Restart(RestartError),
    /// anything else (resource exhaustion, injected test failures)
    Other(String),
}

direct_from! {
    Error => {
        std::io::Error as Io,
        ProtocolError as Protocol,
        RestartError as Restart,
        String as Other,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Restart(e) => write!(f, "{e}"),
            Self::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Wire and record format errors
pub enum ProtocolError {
    /// a frame length exceeds the fixed message size cap
    OversizeFrame,
    /// the stream or file ended in the middle of a frame
    TruncatedFrame,
    /// the frame payload does not decode to a known client message
    BadPayload,
    /// a client hello after the session was already established
    UnexpectedHello,
    /// an I/O buffer, suspend or window-size record before an accept
    ExpectedAccept,
    /// a metadata entry with a value variant this server does not know
    UnknownInfoValue,
    /// a formatted timing record exceeded the line cap
    TimingLineOverflow,
    /// a timing record that does not parse
    BadTimingRecord,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OversizeFrame => "client message too large",
            Self::TruncatedFrame => "premature EOF while reading a framed record",
            Self::BadPayload => "unable to parse client message",
            Self::UnexpectedHello => "unexpected hello from an established client",
            Self::ExpectedAccept => "received a session record before an accept",
            Self::UnknownInfoValue => "unknown value type in client metadata",
            Self::TimingLineOverflow => "timing record too long",
            Self::BadTimingRecord => "invalid timing record",
        };
        write!(f, "{msg}")
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// Why a restart could not be honored. The rendered strings are part of the
/// operator contract; tests pin them.
pub enum RestartError {
    /// the journal disagrees with the acknowledged resume point
    InvalidJournal,
    /// the session's timing file has already had its write bits cleared
    AlreadyComplete,
    /// no I/O log tree exists for the given identifier
    MissingIolog,
    /// no incoming journal exists for the given identifier
    MissingJournal,
    /// the timing file ended (or jumped past) the resume point
    ResumePointNotFound,
}

impl fmt::Display for RestartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidJournal => "invalid journal file, unable to restart",
            Self::AlreadyComplete => "log is already complete, cannot be restarted",
            Self::MissingIolog => "unable to open I/O log directory",
            Self::MissingJournal => "unable to open journal file",
            Self::ResumePointNotFound => "unable to find resume point in timing file",
        };
        write!(f, "{msg}")
    }
}
