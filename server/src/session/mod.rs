/*
 * Created on Thu Mar 27 2025
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

//! # Sessions
//!
//! One [`Connection`] per client connection, owned by the connection's
//! event-loop task and driven one message at a time. Each inbound message
//! variant maps to exactly one handler of the bound sink: the local sink
//! produces event logs and I/O log trees, the journal sink spools raw
//! frames for an upstream receiver. The sink is chosen at construction
//! from the configuration and never changes for the connection's lifetime.

pub mod evlog;
pub mod iolog;
pub mod journal;
#[cfg(test)]
mod tests;

use {
    self::{
        evlog::{EventLog, EventRecord},
        iolog::{IoStream, IologSet},
        journal::Journal,
    },
    crate::{
        config::{Config, SinkKind},
        error::{Error, ProtocolError, RestartError, RuntimeResult},
        proto::{pb, Elapsed},
    },
    rand::Rng,
    std::{borrow::Cow, collections::VecDeque, sync::Arc},
};

/// State shared by both sinks: the connection's time accounting, its event
/// record, the outbound queue and the last error.
#[derive(Debug)]
pub struct SessionCore {
    config: Arc<Config>,
    elapsed: Elapsed,
    evlog: Option<EventRecord>,
    errstr: Option<Cow<'static, str>>,
    outbound: VecDeque<pb::ServerMessage>,
}

impl SessionCore {
    fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            elapsed: Elapsed::zero(),
            evlog: None,
            errstr: None,
            outbound: VecDeque::new(),
        }
    }
    fn push_outbound(&mut self, msg: pb::ServerMessage) {
        self.outbound.push_back(msg);
    }
    fn advance(&mut self, delay: &Option<pb::TimeSpec>) {
        if let Some(delay) = delay {
            self.elapsed.advance(delay);
        }
    }
    /// Queue a commit point carrying the elapsed time made durable so far
    fn ack_commit_point(&mut self) {
        self.push_outbound(pb::ServerMessage::commit_point(self.elapsed.as_timespec()));
    }
    fn maybe_drop(&self) -> RuntimeResult<()> {
        let p = self.config.random_drop();
        if p > 0.0 && rand::thread_rng().gen::<f64>() < p {
            return Err(Error::Other("randomly dropping connection".to_owned()));
        }
        Ok(())
    }
}

/// The two sinks; exactly one is bound per connection
#[derive(Debug)]
enum Sink {
    Local(LocalSink),
    Journal(JournalSink),
}

#[derive(Debug)]
pub struct Connection {
    core: SessionCore,
    sink: Sink,
}

impl Connection {
    pub fn new(config: Arc<Config>, event_log: Arc<EventLog>) -> Self {
        let sink = match config.sink_kind() {
            SinkKind::Local => Sink::Local(LocalSink {
                event_log,
                iolog: None,
            }),
            SinkKind::Journal => Sink::Journal(JournalSink { journal: None }),
        };
        Self {
            core: SessionCore::new(config),
            sink,
        }
    }
    /// Elapsed time accounted on this connection so far
    pub fn elapsed(&self) -> Elapsed {
        self.core.elapsed
    }
    /// The last handler failure, rendered for the operator
    pub fn errstr(&self) -> Option<&str> {
        self.core.errstr.as_deref()
    }
    /// Drain the queued outbound messages for the write event
    pub fn take_outbound(&mut self) -> Vec<pb::ServerMessage> {
        self.core.outbound.drain(..).collect()
    }
    /// Route one inbound message to the handler its variant selects on the
    /// bound sink. Exactly one handler runs; a failure is recorded on the
    /// connection and surfaced to the event loop, which closes us down.
    pub fn dispatch(&mut self, msg: pb::ClientMessage, raw: &[u8]) -> RuntimeResult<()> {
        use pb::client_message::Type;
        let ty = match msg.r#type {
            Some(ty) => ty,
            None => {
                let err = Error::Protocol(ProtocolError::BadPayload);
                self.core.errstr = Some(err.to_string().into());
                return Err(err);
            }
        };
        let Self { core, sink } = self;
        let result = match sink {
            Sink::Local(local) => match &ty {
                Type::AcceptMsg(m) => local.accept(core, m),
                Type::RejectMsg(m) => local.reject(core, m),
                Type::ExitMsg(m) => local.exit(core, m),
                Type::RestartMsg(m) => local.restart(core, m),
                Type::AlertMsg(m) => local.alert(core, m),
                Type::TtyinBuf(m) => local.iobuf(core, IoStream::TtyIn, m),
                Type::TtyoutBuf(m) => local.iobuf(core, IoStream::TtyOut, m),
                Type::StdinBuf(m) => local.iobuf(core, IoStream::StdIn, m),
                Type::StdoutBuf(m) => local.iobuf(core, IoStream::StdOut, m),
                Type::StderrBuf(m) => local.iobuf(core, IoStream::StdErr, m),
                Type::WinsizeEvent(m) => local.winsize(core, m),
                Type::SuspendEvent(m) => local.suspend(core, m),
                Type::HelloMsg(_) => Err(ProtocolError::UnexpectedHello.into()),
            },
            Sink::Journal(jrnl) => match &ty {
                Type::AcceptMsg(m) => jrnl.accept(core, m, raw),
                Type::RejectMsg(m) => jrnl.reject(core, m, raw),
                Type::ExitMsg(m) => jrnl.exit(core, m, raw),
                Type::RestartMsg(m) => jrnl.restart(core, m),
                Type::AlertMsg(m) => jrnl.alert(core, m, raw),
                Type::TtyinBuf(m) => jrnl.iobuf(core, m, raw),
                Type::TtyoutBuf(m) => jrnl.iobuf(core, m, raw),
                Type::StdinBuf(m) => jrnl.iobuf(core, m, raw),
                Type::StdoutBuf(m) => jrnl.iobuf(core, m, raw),
                Type::StderrBuf(m) => jrnl.iobuf(core, m, raw),
                Type::WinsizeEvent(m) => jrnl.winsize(core, m, raw),
                Type::SuspendEvent(m) => jrnl.suspend(core, m, raw),
                Type::HelloMsg(_) => Err(ProtocolError::UnexpectedHello.into()),
            },
        };
        if let Err(e) = &result {
            debug!("handler for `{}` failed: {e}", ty.name());
            core.errstr = Some(e.to_string().into());
        }
        result
    }
}

/*
    local sink: event log + I/O log trees
*/

#[derive(Debug)]
struct LocalSink {
    event_log: Arc<EventLog>,
    iolog: Option<IologSet>,
}

impl LocalSink {
    fn accept(&mut self, core: &mut SessionCore, m: &pb::AcceptMessage) -> RuntimeResult<()> {
        let mut rec = EventRecord::new(m.submit_time, &m.info_msgs)?;
        if m.expect_iobufs {
            let iolog = IologSet::create(
                core.config.iolog_dir(),
                rec.user().unwrap_or_default(),
                core.config.iolog_mode(),
                core.config.iolog_compress(),
            )?;
            rec.iolog_path = Some(iolog.log_id().to_owned());
            iolog.write_session_log(&evlog::render_event(
                "ACCEPT",
                &rec.submit_time,
                None,
                &rec,
            ))?;
            core.push_outbound(pb::ServerMessage::log_id(iolog.log_id().to_owned()));
            self.iolog = Some(iolog);
        }
        self.event_log.accept(&rec)?;
        core.evlog = Some(rec);
        Ok(())
    }
    fn reject(&mut self, core: &mut SessionCore, m: &pb::RejectMessage) -> RuntimeResult<()> {
        let rec = EventRecord::new(m.submit_time, &m.info_msgs)?;
        self.event_log.reject(&rec, &m.reason)?;
        core.evlog = Some(rec);
        Ok(())
    }
    fn exit(&mut self, _core: &mut SessionCore, m: &pb::ExitMessage) -> RuntimeResult<()> {
        if let Some(iolog) = &mut self.iolog {
            let status = if m.signal.is_empty() {
                format!("EXIT {}", m.exit_value)
            } else if m.dumped_core {
                format!("SIGNAL {} (core dumped)", m.signal)
            } else {
                format!("SIGNAL {}", m.signal)
            };
            iolog.write_session_log(&format!("{status}\n"))?;
            iolog.seal()?;
        }
        Ok(())
    }
    fn restart(&mut self, core: &mut SessionCore, m: &pb::RestartMessage) -> RuntimeResult<()> {
        // the log id is a path relative to the log root; refuse anything
        // that could escape it
        let log_id = m.log_id.trim_matches('/');
        let escapes = std::path::Path::new(log_id)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
        if log_id.is_empty() || escapes {
            return Err(RestartError::MissingIolog.into());
        }
        let target = Elapsed::from(&m.resume_point.unwrap_or_default());
        let iolog = IologSet::restart(
            core.config.iolog_dir(),
            log_id,
            core.config.iolog_mode(),
            core.config.iolog_compress(),
            &target,
            &mut core.elapsed,
        )?;
        // the original metadata is gone; keep the session identity so
        // alerts after the restart still name the log
        core.evlog = Some(EventRecord::synthesized(iolog.log_id().to_owned()));
        self.iolog = Some(iolog);
        Ok(())
    }
    fn alert(&mut self, core: &mut SessionCore, m: &pb::AlertMessage) -> RuntimeResult<()> {
        let alert_time = m.alert_time.unwrap_or_default();
        if core.evlog.is_none() {
            core.evlog = Some(EventRecord::new(m.alert_time, &m.info_msgs)?);
        }
        // the slot was just filled if it was empty
        let rec = core.evlog.as_ref().unwrap();
        self.event_log.alert(rec, &alert_time, &m.reason)
    }
    fn iobuf(
        &mut self,
        core: &mut SessionCore,
        stream: IoStream,
        m: &pb::IoBuffer,
    ) -> RuntimeResult<()> {
        let iolog = self.iolog.as_mut().ok_or(ProtocolError::ExpectedAccept)?;
        let delay = m.delay.unwrap_or_default();
        iolog.write_iobuf(stream, &delay, &m.data)?;
        core.advance(&m.delay);
        core.ack_commit_point();
        core.maybe_drop()
    }
    fn winsize(&mut self, core: &mut SessionCore, m: &pb::WinsizeChange) -> RuntimeResult<()> {
        let iolog = self.iolog.as_mut().ok_or(ProtocolError::ExpectedAccept)?;
        iolog.write_winsize(&m.delay.unwrap_or_default(), m.rows, m.cols)?;
        core.advance(&m.delay);
        Ok(())
    }
    fn suspend(&mut self, core: &mut SessionCore, m: &pb::CommandSuspend) -> RuntimeResult<()> {
        let iolog = self.iolog.as_mut().ok_or(ProtocolError::ExpectedAccept)?;
        iolog.write_suspend(&m.delay.unwrap_or_default(), &m.signal)?;
        core.advance(&m.delay);
        Ok(())
    }
}

/*
    journal sink: raw frames spooled for the forwarder
*/

#[derive(Debug)]
struct JournalSink {
    journal: Option<Journal>,
}

impl JournalSink {
    fn relay_dir(core: &SessionCore) -> RuntimeResult<&std::path::Path> {
        // the sink is only ever bound when a relay directory is configured
        core.config
            .relay_dir()
            .ok_or_else(|| Error::Other("relay directory not configured".to_owned()))
    }
    fn journal_mut(&mut self) -> RuntimeResult<&mut Journal> {
        self.journal
            .as_mut()
            .ok_or_else(|| Error::Protocol(ProtocolError::ExpectedAccept))
    }
    fn accept(
        &mut self,
        core: &mut SessionCore,
        m: &pb::AcceptMessage,
        raw: &[u8],
    ) -> RuntimeResult<()> {
        let mut journal = Journal::create(Self::relay_dir(core)?)?;
        journal.append(raw)?;
        if m.expect_iobufs {
            let log_id = format!("{}/{}", core.config.hostname(), journal.name());
            core.push_outbound(pb::ServerMessage::log_id(log_id));
        }
        self.journal = Some(journal);
        Ok(())
    }
    fn reject(
        &mut self,
        core: &mut SessionCore,
        _m: &pb::RejectMessage,
        raw: &[u8],
    ) -> RuntimeResult<()> {
        let mut journal = Journal::create(Self::relay_dir(core)?)?;
        journal.append(raw)?;
        self.journal = Some(journal);
        Ok(())
    }
    fn exit(
        &mut self,
        core: &mut SessionCore,
        _m: &pb::ExitMessage,
        raw: &[u8],
    ) -> RuntimeResult<()> {
        let relay_dir = Self::relay_dir(core)?.to_owned();
        let journal = self.journal_mut()?;
        journal.append(raw)?;
        journal.finish(&relay_dir)
    }
    fn restart(&mut self, core: &mut SessionCore, m: &pb::RestartMessage) -> RuntimeResult<()> {
        // a relayed log id is `hostname/name`; the suffix names the
        // journal under incoming/
        let name = match m.log_id.split_once('/') {
            Some((_, suffix)) => suffix,
            None => m.log_id.as_str(),
        };
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(RestartError::MissingJournal.into());
        }
        let mut journal = Journal::open_incoming(Self::relay_dir(core)?, name)?;
        let target = Elapsed::from(&m.resume_point.unwrap_or_default());
        journal.seek_to(&target, &mut core.elapsed)?;
        self.journal = Some(journal);
        Ok(())
    }
    fn alert(
        &mut self,
        _core: &mut SessionCore,
        _m: &pb::AlertMessage,
        raw: &[u8],
    ) -> RuntimeResult<()> {
        self.journal_mut()?.append(raw)
    }
    fn iobuf(&mut self, core: &mut SessionCore, m: &pb::IoBuffer, raw: &[u8]) -> RuntimeResult<()> {
        self.journal_mut()?.append(raw)?;
        core.advance(&m.delay);
        core.ack_commit_point();
        Ok(())
    }
    fn winsize(
        &mut self,
        core: &mut SessionCore,
        m: &pb::WinsizeChange,
        raw: &[u8],
    ) -> RuntimeResult<()> {
        self.journal_mut()?.append(raw)?;
        core.advance(&m.delay);
        Ok(())
    }
    fn suspend(
        &mut self,
        core: &mut SessionCore,
        m: &pb::CommandSuspend,
        raw: &[u8],
    ) -> RuntimeResult<()> {
        self.journal_mut()?.append(raw)?;
        core.advance(&m.delay);
        Ok(())
    }
}
