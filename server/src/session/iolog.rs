/*
 * Created on Tue Mar 25 2025
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

//! # I/O log trees
//!
//! A session that captures I/O gets a directory of its own: a `log` event
//! file, up to five payload stream files (lazily created, optionally
//! gzip-compressed) and a plaintext `timing` file that orders every stream,
//! window-size and suspend event by its delay. The timing file's write bits
//! double as the session's liveness marker: sealing a session is
//! `chmod a-w timing`, and a restart of a sealed session is refused.
//!
//! Restarting an interrupted session either seeks (plain streams admit
//! random access) or, when any stream is compressed, rewrites the tree up
//! to the resume point into fresh files.

use {
    crate::{
        error::{ProtocolError, RestartError, RuntimeResult},
        proto::{pb, Elapsed},
        util,
    },
    flate2::{read::GzDecoder, write::GzEncoder, Compression},
    std::{
        fs::{self, File, OpenOptions},
        io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write},
        os::unix::fs::{OpenOptionsExt, PermissionsExt},
        path::{Path, PathBuf},
    },
    uuid::Uuid,
};

pub const TIMING_FILE: &str = "timing";
pub const LOG_FILE: &str = "log";

/// Timing event kinds 0..=4 are the stream indexes
pub const EVT_WINSIZE: u8 = 5;
pub const EVT_SUSPEND: u8 = 6;

const TIMING_LINE_MAX: usize = 256;
const REWRITE_TMP_DIR: &str = "restart.tmp";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// The five captured I/O streams, in timing-file kind order
pub enum IoStream {
    TtyIn = 0,
    TtyOut = 1,
    StdIn = 2,
    StdOut = 3,
    StdErr = 4,
}

impl IoStream {
    pub const ALL: [Self; 5] = [
        Self::TtyIn,
        Self::TtyOut,
        Self::StdIn,
        Self::StdOut,
        Self::StdErr,
    ];
    pub const fn idx(self) -> usize {
        self as usize
    }
    pub const fn name(self) -> &'static str {
        match self {
            Self::TtyIn => "ttyin",
            Self::TtyOut => "ttyout",
            Self::StdIn => "stdin",
            Self::StdOut => "stdout",
            Self::StdErr => "stderr",
        }
    }
    fn from_kind(kind: u8) -> Option<Self> {
        Self::ALL.get(kind as usize).copied()
    }
}

/*
    stream handles
*/

#[derive(Debug)]
enum StreamWriter {
    Plain(File),
    Gzip(Box<GzEncoder<File>>),
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(f) => f.write(buf),
            Self::Gzip(gz) => gz.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(f) => f.flush(),
            Self::Gzip(gz) => gz.flush(),
        }
    }
}

impl StreamWriter {
    fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(_) => Ok(()),
            Self::Gzip(gz) => gz.finish().map(|_| ()),
        }
    }
}

enum StreamReader {
    Plain(BufReader<File>),
    Gzip(Box<GzDecoder<BufReader<File>>>),
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Gzip(gz) => gz.read(buf),
        }
    }
}

#[derive(Debug, Default)]
struct StreamFile {
    enabled: bool,
    compressed: bool,
    writer: Option<StreamWriter>,
}

/*
    timing records
*/

#[derive(Debug, PartialEq)]
enum TimingEvent {
    IoBuf { stream: IoStream, len: u64 },
    Winsize { rows: i32, cols: i32 },
    Suspend { signal: String },
}

#[derive(Debug, PartialEq)]
struct TimingRecord {
    delay: pb::TimeSpec,
    event: TimingEvent,
}

impl TimingRecord {
    /// Parse one LF-terminated timing line (without the terminator)
    fn parse(line: &str) -> RuntimeResult<Self> {
        let mut it = line.split_ascii_whitespace();
        let kind: u8 = it
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or(ProtocolError::BadTimingRecord)?;
        let delay = parse_delay(it.next().ok_or(ProtocolError::BadTimingRecord)?)?;
        let event = match IoStream::from_kind(kind) {
            Some(stream) => {
                let len = it
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or(ProtocolError::BadTimingRecord)?;
                TimingEvent::IoBuf { stream, len }
            }
            None if kind == EVT_WINSIZE => {
                let rows = it
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or(ProtocolError::BadTimingRecord)?;
                let cols = it
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or(ProtocolError::BadTimingRecord)?;
                TimingEvent::Winsize { rows, cols }
            }
            None if kind == EVT_SUSPEND => {
                let signal = it.next().ok_or(ProtocolError::BadTimingRecord)?.to_owned();
                TimingEvent::Suspend { signal }
            }
            None => return Err(ProtocolError::BadTimingRecord.into()),
        };
        if it.next().is_some() {
            return Err(ProtocolError::BadTimingRecord.into());
        }
        Ok(Self { delay, event })
    }
}

/// `<sec>.<nsec>` with exactly nine nanosecond digits
fn parse_delay(token: &str) -> RuntimeResult<pb::TimeSpec> {
    let (sec, nsec) = token.split_once('.').ok_or(ProtocolError::BadTimingRecord)?;
    if nsec.len() != 9 {
        return Err(ProtocolError::BadTimingRecord.into());
    }
    let tv_sec = sec.parse().map_err(|_| ProtocolError::BadTimingRecord)?;
    let tv_nsec = nsec.parse().map_err(|_| ProtocolError::BadTimingRecord)?;
    Ok(pb::TimeSpec { tv_sec, tv_nsec })
}

fn fmt_timing_line(kind: u8, delay: &pb::TimeSpec, tail: &str) -> RuntimeResult<String> {
    let line = format!(
        "{} {}.{:09} {}\n",
        kind,
        delay.tv_sec.max(0),
        delay.tv_nsec.max(0),
        tail
    );
    if line.len() > TIMING_LINE_MAX {
        return Err(ProtocolError::TimingLineOverflow.into());
    }
    Ok(line)
}

/// Directories get the file mode plus owner search and, mirroring the read
/// bits, group/other search
const fn dir_mode(file_mode: u32) -> u32 {
    let mut mode = file_mode | 0o700;
    if mode & 0o040 != 0 {
        mode |= 0o010;
    }
    if mode & 0o004 != 0 {
        mode |= 0o001;
    }
    mode
}

fn create_session_file(path: &Path, mode: u32) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(mode)
        .open(path)
}

/*
    the tree
*/

#[derive(Debug)]
pub struct IologSet {
    dir: PathBuf,
    log_id: String,
    streams: [StreamFile; 5],
    timing: Option<File>,
    compress: bool,
    file_mode: u32,
}

impl IologSet {
    /// Create a fresh I/O log tree under `<root>/<user>/<unique>` and hand
    /// back the set. Stream files appear lazily on first write.
    pub fn create(root: &Path, user: &str, file_mode: u32, compress: bool) -> RuntimeResult<Self> {
        let user = if user.is_empty() {
            "nobody".to_owned()
        } else {
            user.replace('/', "_")
        };
        let log_id = format!("{}/{}", user, Uuid::new_v4().simple());
        let dir = root.join(&log_id);
        util::os::create_dir_tree(&dir, dir_mode(file_mode))?;
        Ok(Self {
            dir,
            log_id,
            streams: Default::default(),
            timing: None,
            compress,
            file_mode,
        })
    }
    /// The tree's path relative to the log root; this is the log id handed
    /// to the client for later restarts.
    pub fn log_id(&self) -> &str {
        &self.log_id
    }
    /// Append one event record line to the session's `log` file
    pub fn write_session_log(&self, line: &str) -> RuntimeResult<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(self.file_mode)
            .open(self.dir.join(LOG_FILE))?;
        f.write_all(line.as_bytes())?;
        Ok(())
    }
    fn ensure_stream(&mut self, stream: IoStream) -> RuntimeResult<&mut StreamWriter> {
        let slot = &mut self.streams[stream.idx()];
        if slot.writer.is_none() {
            let file = create_session_file(&self.dir.join(stream.name()), self.file_mode)?;
            let writer = if self.compress {
                StreamWriter::Gzip(Box::new(GzEncoder::new(file, Compression::default())))
            } else {
                StreamWriter::Plain(file)
            };
            slot.enabled = true;
            slot.compressed = self.compress;
            slot.writer = Some(writer);
        }
        // the slot was just filled if it was empty
        Ok(slot.writer.as_mut().unwrap())
    }
    fn write_timing(&mut self, line: &str) -> RuntimeResult<()> {
        if self.timing.is_none() {
            self.timing = Some(create_session_file(
                &self.dir.join(TIMING_FILE),
                self.file_mode,
            )?);
        }
        // same reasoning as ensure_stream
        self.timing.as_mut().unwrap().write_all(line.as_bytes())?;
        Ok(())
    }
    /// Write one I/O buffer: the payload to its stream, then the timing
    /// record. Both writes must land or the handler fails the connection.
    pub fn write_iobuf(
        &mut self,
        stream: IoStream,
        delay: &pb::TimeSpec,
        data: &[u8],
    ) -> RuntimeResult<()> {
        self.ensure_stream(stream)?.write_all(data)?;
        let line = fmt_timing_line(stream.idx() as u8, delay, &data.len().to_string())?;
        self.write_timing(&line)
    }
    pub fn write_winsize(&mut self, delay: &pb::TimeSpec, rows: i32, cols: i32) -> RuntimeResult<()> {
        let line = fmt_timing_line(EVT_WINSIZE, delay, &format!("{rows} {cols}"))?;
        self.write_timing(&line)
    }
    pub fn write_suspend(&mut self, delay: &pb::TimeSpec, signal: &str) -> RuntimeResult<()> {
        let line = fmt_timing_line(EVT_SUSPEND, delay, signal)?;
        self.write_timing(&line)
    }
    /// Seal the session: finish every stream and clear the write bits on
    /// the timing file. A sealed session refuses restarts.
    pub fn seal(&mut self) -> RuntimeResult<()> {
        for (stream, slot) in IoStream::ALL.iter().zip(self.streams.iter_mut()) {
            if !slot.enabled {
                continue;
            }
            if let Some(writer) = slot.writer.take() {
                debug!(
                    "closing {} stream `{}`",
                    if slot.compressed { "compressed" } else { "plain" },
                    stream.name()
                );
                writer.finish()?;
            }
        }
        let timing_path = self.dir.join(TIMING_FILE);
        if self.timing.is_none() && !timing_path.exists() {
            // a session may exit without a single timed record; the marker
            // file must exist to be sealed
            create_session_file(&timing_path, self.file_mode)?;
        }
        self.timing = None;
        util::os::clear_write_bits(&timing_path)?;
        Ok(())
    }

    /*
        restart
    */

    /// Reopen an interrupted session and position every file at the resume
    /// point. Plain streams are seeked in place; if any stream is
    /// compressed the tree is rewritten up to the target instead.
    pub fn restart(
        root: &Path,
        log_id: &str,
        file_mode: u32,
        compress: bool,
        target: &Elapsed,
        elapsed: &mut Elapsed,
    ) -> RuntimeResult<Self> {
        let dir = root.join(log_id);
        let timing_path = dir.join(TIMING_FILE);
        let md = match fs::metadata(&timing_path) {
            Ok(md) => md,
            Err(e) => {
                debug!("no timing file at {}: {e}", timing_path.display());
                return Err(RestartError::MissingIolog.into());
            }
        };
        if md.permissions().mode() & 0o200 == 0 {
            return Err(RestartError::AlreadyComplete.into());
        }
        let mut set = Self {
            dir,
            log_id: log_id.to_owned(),
            streams: Default::default(),
            timing: None,
            compress,
            file_mode,
        };
        if set.any_stream_compressed()? {
            set.rewrite(target, elapsed)?;
        } else {
            set.seek(target, elapsed)?;
        }
        Ok(set)
    }
    fn any_stream_compressed(&self) -> RuntimeResult<bool> {
        for stream in IoStream::ALL {
            let path = self.dir.join(stream.name());
            let mut f = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut magic = [0u8; 2];
            match f.read_exact(&mut magic) {
                Ok(()) if magic == GZIP_MAGIC => return Ok(true),
                Ok(()) => {}
                // shorter than the magic: certainly not compressed
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }
    /// Seek mode: walk the timing file, advancing each plain stream by the
    /// payload lengths it records, until the accumulated delays equal the
    /// target. The timing handle is explicitly repositioned before it
    /// transitions from reading to writing.
    fn seek(&mut self, target: &Elapsed, elapsed: &mut Elapsed) -> RuntimeResult<()> {
        let timing = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.dir.join(TIMING_FILE))?;
        let mut reader = BufReader::new(timing);
        let mut consumed: u64 = 0;
        let mut positions = [0u64; 5];
        let mut line = String::new();
        while *elapsed < *target {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                debug!("timing file ended at {} before resume point {}", elapsed, target);
                return Err(RestartError::ResumePointNotFound.into());
            }
            consumed += n as u64;
            let rec = TimingRecord::parse(line.trim_end_matches('\n'))?;
            elapsed.advance(&rec.delay);
            if let TimingEvent::IoBuf { stream, len } = rec.event {
                positions[stream.idx()] += len;
            }
        }
        if *elapsed > *target {
            debug!("timing file overshot resume point: {} > {}", elapsed, target);
            return Err(RestartError::ResumePointNotFound.into());
        }
        let mut timing = reader.into_inner();
        timing.seek(SeekFrom::Start(consumed))?;
        self.timing = Some(timing);
        for stream in IoStream::ALL {
            let path = self.dir.join(stream.name());
            let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            file.seek(SeekFrom::Start(positions[stream.idx()]))?;
            self.streams[stream.idx()] = StreamFile {
                enabled: true,
                compressed: false,
                writer: Some(StreamWriter::Plain(file)),
            };
        }
        Ok(())
    }
    /// Rewrite mode: compressed streams admit no random access, so replay
    /// the timing file into a fresh set of files truncated at the resume
    /// point, then move them over the originals.
    fn rewrite(&mut self, target: &Elapsed, elapsed: &mut Elapsed) -> RuntimeResult<()> {
        let tmp = self.dir.join(REWRITE_TMP_DIR);
        util::os::create_dir_tree(&tmp, dir_mode(self.file_mode))?;
        let result = self.rewrite_into(&tmp, target, elapsed);
        if result.is_err() {
            let _ = fs::remove_dir_all(&tmp);
        }
        result
    }
    fn rewrite_into(
        &mut self,
        tmp: &Path,
        target: &Elapsed,
        elapsed: &mut Elapsed,
    ) -> RuntimeResult<()> {
        // every existing stream is regenerated, even ones with no payload
        // before the resume point (their replacements truncate them)
        let mut readers: [Option<StreamReader>; 5] = Default::default();
        let mut writers: [Option<StreamWriter>; 5] = Default::default();
        for stream in IoStream::ALL {
            let path = self.dir.join(stream.name());
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut probe = BufReader::new(file);
            let compressed = {
                let head = probe.fill_buf()?;
                head.len() >= 2 && head[..2] == GZIP_MAGIC
            };
            readers[stream.idx()] = Some(if compressed {
                StreamReader::Gzip(Box::new(GzDecoder::new(probe)))
            } else {
                StreamReader::Plain(probe)
            });
            let out = create_session_file(&tmp.join(stream.name()), self.file_mode)?;
            writers[stream.idx()] = Some(if self.compress {
                StreamWriter::Gzip(Box::new(GzEncoder::new(out, Compression::default())))
            } else {
                StreamWriter::Plain(out)
            });
        }
        let mut out_timing = create_session_file(&tmp.join(TIMING_FILE), self.file_mode)?;
        let mut treader = BufReader::new(File::open(self.dir.join(TIMING_FILE))?);
        let mut line = String::new();
        while *elapsed < *target {
            line.clear();
            if treader.read_line(&mut line)? == 0 {
                debug!("timing file ended at {} before resume point {}", elapsed, target);
                return Err(RestartError::ResumePointNotFound.into());
            }
            let rec = TimingRecord::parse(line.trim_end_matches('\n'))?;
            elapsed.advance(&rec.delay);
            if let TimingEvent::IoBuf { stream, len } = rec.event {
                let reader = readers[stream.idx()]
                    .as_mut()
                    .ok_or(ProtocolError::BadTimingRecord)?;
                let writer = writers[stream.idx()]
                    .as_mut()
                    .ok_or(ProtocolError::BadTimingRecord)?;
                let copied = io::copy(&mut reader.by_ref().take(len), writer)?;
                if copied != len {
                    return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
                }
            }
            out_timing.write_all(line.as_bytes())?;
        }
        if *elapsed > *target {
            debug!("timing file overshot resume point: {} > {}", elapsed, target);
            return Err(RestartError::ResumePointNotFound.into());
        }
        drop(treader);
        // swap the regenerated files in; the open handles stay valid for
        // the appends that follow
        for stream in IoStream::ALL {
            if let Some(writer) = writers[stream.idx()].take() {
                fs::rename(tmp.join(stream.name()), self.dir.join(stream.name()))?;
                self.streams[stream.idx()] = StreamFile {
                    enabled: true,
                    compressed: self.compress,
                    writer: Some(writer),
                };
            }
        }
        fs::rename(tmp.join(TIMING_FILE), self.dir.join(TIMING_FILE))?;
        self.timing = Some(out_timing);
        let _ = fs::remove_dir(tmp);
        Ok(())
    }
}
