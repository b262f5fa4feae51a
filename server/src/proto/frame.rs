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

use {
    crate::error::{ProtocolError, RuntimeResult},
    std::io::{ErrorKind, Read, Write},
};

/// Cap on a single framed record, wire or journal. Anything larger is a
/// protocol violation, not an allocation request.
pub const MESSAGE_SIZE_MAX: usize = 2 * 1024 * 1024;

/// Bytes of length prefix ahead of every record
pub const LEN_PREFIX: usize = 4;

const SCRATCH_MIN: usize = 4096;

/// Write one `u32 BE length | payload` record. Short writes surface as
/// errors from the underlying handle; both parts must land.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> RuntimeResult<()> {
    if payload.len() > MESSAGE_SIZE_MAX {
        return Err(ProtocolError::OversizeFrame.into());
    }
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

#[derive(Debug)]
/// Reads framed records, reusing one scratch buffer that grows to the next
/// power of two whenever a record outgrows it.
pub struct FrameReader {
    scratch: Vec<u8>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            scratch: vec![0; SCRATCH_MIN],
        }
    }
    /// Read the next record. Returns `Ok(None)` on a clean EOF at a record
    /// boundary; EOF anywhere else is [`ProtocolError::TruncatedFrame`].
    pub fn read_from<R: Read>(&mut self, r: &mut R) -> RuntimeResult<Option<&[u8]>> {
        let mut lenb = [0u8; 4];
        let mut have = 0;
        while have != lenb.len() {
            match r.read(&mut lenb[have..]) {
                Ok(0) if have == 0 => return Ok(None),
                Ok(0) => return Err(ProtocolError::TruncatedFrame.into()),
                Ok(n) => have += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let len = u32::from_be_bytes(lenb) as usize;
        if len > MESSAGE_SIZE_MAX {
            return Err(ProtocolError::OversizeFrame.into());
        }
        if len > self.scratch.len() {
            self.scratch.resize(len.next_power_of_two(), 0);
        }
        match r.read_exact(&mut self.scratch[..len]) {
            Ok(()) => Ok(Some(&self.scratch[..len])),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(ProtocolError::TruncatedFrame.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}
