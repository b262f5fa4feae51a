/*
 * Created on Mon Mar 31 2025
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

//! # Network layer
//!
//! One accept loop, one task per client connection. The handshake (TLS if
//! configured), the hello exchange and the framed read loop all run inside
//! the connection's own task; the accept loop never blocks on a client.
//! Each task holds one permit of the connection cap for as long as it
//! lives, so the cap bounds live sessions, not accepts.

use {
    crate::{
        config::{Config, TlsConfig},
        proto::frame::MESSAGE_SIZE_MAX,
        session::{evlog::EventLog, Connection},
    },
    bytes::BytesMut,
    openssl::{
        pkey::PKey,
        ssl::{Ssl, SslAcceptor, SslMethod},
        x509::X509,
    },
    prost::Message,
    std::{pin::Pin, sync::Arc, time::Duration},
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
        net::{TcpListener, TcpStream},
        sync::{broadcast, mpsc, Semaphore},
        time::timeout,
    },
    tokio_openssl::SslStream,
};

pub trait Socket: AsyncWrite + AsyncRead + Unpin {}
pub type IoResult<T> = Result<T, std::io::Error>;

const BUF_WRITE_CAP: usize = 16384;
/// Cap on concurrently live sessions (not accepts)
const CONNECTION_LIMIT: usize = 4096;

impl Socket for TcpStream {}
impl Socket for SslStream<TcpStream> {}

enum SessionLoopResult {
    /// the client closed cleanly at a frame boundary
    Fin,
    /// the connection died mid-frame
    Rst,
    /// the client broke framing badly enough that we gave up
    BadFrame,
    /// a handler failed; the error string was already logged
    HandlerFailed,
    /// the client went silent past the server timeout
    TimedOut,
}

/*
    per-connection loop
*/

/// Connection handler for a remote client
pub struct ConnectionHandler<S> {
    socket: BufWriter<S>,
    con: Connection,
    read_timeout: Duration,
    sig_terminate: broadcast::Receiver<()>,
    _sig_inflight_complete: mpsc::Sender<()>,
}

impl<S: Socket> ConnectionHandler<S> {
    pub fn new(
        socket: S,
        config: Arc<Config>,
        event_log: Arc<EventLog>,
        term_sig: broadcast::Receiver<()>,
        _inflight_complete: mpsc::Sender<()>,
    ) -> Self {
        let read_timeout = config.server_timeout();
        Self {
            socket: BufWriter::with_capacity(BUF_WRITE_CAP, socket),
            con: Connection::new(config, event_log),
            read_timeout,
            sig_terminate: term_sig,
            _sig_inflight_complete: _inflight_complete,
        }
    }
    pub async fn run(&mut self) -> IoResult<()> {
        let Self {
            socket,
            con,
            read_timeout,
            ..
        } = self;
        tokio::select! {
            ret = session_loop(socket, con, *read_timeout) => {
                socket.flush().await?;
                match ret {
                    Ok(SessionLoopResult::Fin) => {}
                    Ok(SessionLoopResult::Rst) => error!("connection reset while talking to client"),
                    Ok(SessionLoopResult::BadFrame) => error!("client broke message framing"),
                    Ok(SessionLoopResult::TimedOut) => warn!("client went silent; dropping connection"),
                    Ok(SessionLoopResult::HandlerFailed) => {}
                    Err(e) => {
                        error!("error while handling connection: {e}");
                        return Err(e);
                    }
                }
                Ok(())
            },
            _ = self.sig_terminate.recv() => {
                Ok(())
            }
        }
    }
}

/// Send one framed server message
async fn write_message<S: Socket>(
    socket: &mut BufWriter<S>,
    msg: &crate::proto::pb::ServerMessage,
) -> IoResult<()> {
    let encoded = msg.encode_to_vec();
    socket.write_u32(encoded.len() as u32).await?;
    socket.write_all(&encoded).await?;
    Ok(())
}

/// The per-connection read loop: hello, then one framed client message at
/// a time. Every message is fully handled (and its side effects made
/// durable) before the next read; outbound messages queued by the handler
/// are flushed right after it returns.
async fn session_loop<S: Socket>(
    socket: &mut BufWriter<S>,
    con: &mut Connection,
    read_timeout: Duration,
) -> IoResult<SessionLoopResult> {
    use crate::proto::pb;
    write_message(
        socket,
        &pb::ServerMessage::hello(format!("Vigil {}", libvigil::VERSION)),
    )
    .await?;
    socket.flush().await?;
    let mut payload = BytesMut::with_capacity(libvigil::BUF_CAP);
    loop {
        let len = match timeout(read_timeout, socket.read_u32()).await {
            Err(_) => return Ok(SessionLoopResult::TimedOut),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(SessionLoopResult::Fin)
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(len)) => len as usize,
        };
        if len > MESSAGE_SIZE_MAX {
            error!("oversize client message ({len} bytes)");
            return Ok(SessionLoopResult::BadFrame);
        }
        payload.resize(len, 0);
        match timeout(read_timeout, socket.read_exact(&mut payload[..])).await {
            Err(_) => return Ok(SessionLoopResult::TimedOut),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(SessionLoopResult::Rst)
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(_)) => {}
        }
        let msg = match pb::ClientMessage::decode(&payload[..]) {
            Ok(msg) => msg,
            Err(e) => {
                error!("undecodable client message: {e}");
                return Ok(SessionLoopResult::BadFrame);
            }
        };
        let dispatched = con.dispatch(msg, &payload);
        for out in con.take_outbound() {
            write_message(socket, &out).await?;
        }
        socket.flush().await?;
        if dispatched.is_err() {
            if let Some(errstr) = con.errstr() {
                error!("closing connection: {errstr}");
            }
            return Ok(SessionLoopResult::HandlerFailed);
        }
    }
}

/*
    listener
*/

/// A TCP (optionally TLS) listener bound to the configured endpoint
pub struct Listener {
    config: Arc<Config>,
    event_log: Arc<EventLog>,
    listener: TcpListener,
    tls: Option<SslAcceptor>,
    climit: Arc<Semaphore>,
    sig_shutdown: broadcast::Sender<()>,
    sig_inflight: mpsc::Sender<()>,
    sig_inflight_wait: mpsc::Receiver<()>,
}

impl Listener {
    pub async fn new(
        config: Arc<Config>,
        event_log: Arc<EventLog>,
        tls: Option<SslAcceptor>,
        sig_shutdown: broadcast::Sender<()>,
    ) -> IoResult<Self> {
        let (sig_inflight, sig_inflight_wait) = mpsc::channel(1);
        let listener = TcpListener::bind((config.host(), config.port())).await?;
        Ok(Self {
            config,
            event_log,
            listener,
            tls,
            climit: Arc::new(Semaphore::new(CONNECTION_LIMIT)),
            sig_shutdown,
            sig_inflight,
            sig_inflight_wait,
        })
    }
    /// Wait until every spawned handler has finished. Handlers keep clones
    /// of the inflight sender, so once ours is gone the recv below can
    /// only resolve when the last handler has dropped its clone.
    pub async fn terminate(self) {
        let Self {
            sig_inflight,
            mut sig_inflight_wait,
            ..
        } = self;
        drop(sig_inflight);
        let _ = sig_inflight_wait.recv().await;
    }
    /// The accept loop. A failed accept pauses the loop with a doubling
    /// delay so a broken socket cannot spin it hot; the delay resets on
    /// the next successful accept.
    pub async fn listen(&mut self) {
        let mut consecutive_failures: u32 = 0;
        loop {
            let permit = match self.climit.clone().acquire_owned().await {
                Ok(permit) => permit,
                // the semaphore only closes when we are shutting down
                Err(_) => return,
            };
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => {
                    consecutive_failures = 0;
                    conn
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!("failed to accept connection: `{e}`");
                    tokio::time::sleep(accept_retry_delay(consecutive_failures)).await;
                    continue;
                }
            };
            debug!("accepted connection from {peer}");
            let config = self.config.clone();
            let event_log = self.event_log.clone();
            let tls = self.tls.clone();
            let term_sig = self.sig_shutdown.subscribe();
            let inflight = self.sig_inflight.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match tls {
                    Some(acceptor) => match secure(&acceptor, stream).await {
                        Ok(stream) => drive(stream, config, event_log, term_sig, inflight).await,
                        Err(e) => warn!("TLS handshake with {peer} failed: `{e}`"),
                    },
                    None => drive(stream, config, event_log, term_sig, inflight).await,
                }
            });
        }
    }
}

/// 20ms after the first failure, doubling up to a 2.56s cap
fn accept_retry_delay(consecutive_failures: u32) -> Duration {
    Duration::from_millis(10u64 << consecutive_failures.min(8))
}

/// Run a fully set-up socket through its session
async fn drive<S: Socket>(
    socket: S,
    config: Arc<Config>,
    event_log: Arc<EventLog>,
    term_sig: broadcast::Receiver<()>,
    inflight: mpsc::Sender<()>,
) {
    let mut handler = ConnectionHandler::new(socket, config, event_log, term_sig, inflight);
    if let Err(e) = handler.run().await {
        warn!("error handling client connection: `{e}`");
    }
}

/// Server side of the TLS handshake on a fresh TCP stream
async fn secure(
    acceptor: &SslAcceptor,
    stream: TcpStream,
) -> Result<SslStream<TcpStream>, openssl::ssl::Error> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, stream)?;
    Pin::new(&mut stream).accept().await?;
    Ok(stream)
}

/// Build the TLS acceptor from the configured PEM material. The
/// certificate file may carry a chain; its first entry is the leaf, the
/// rest become the extra chain.
pub fn tls_acceptor(tls: &TlsConfig) -> IoResult<SslAcceptor> {
    use std::io::{Error, ErrorKind};
    let invalid = |e: openssl::error::ErrorStack| Error::new(ErrorKind::InvalidInput, e);
    let cert_pem = std::fs::read(&tls.cert)?;
    let key_pem = std::fs::read(&tls.private_key)?;
    let mut certs = X509::stack_from_pem(&cert_pem).map_err(invalid)?.into_iter();
    let leaf = certs
        .next()
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "no certificate in PEM file"))?;
    let key = if tls.passphrase.is_empty() {
        PKey::private_key_from_pem(&key_pem).map_err(invalid)?
    } else {
        PKey::private_key_from_pem_passphrase(&key_pem, tls.passphrase.as_bytes())
            .map_err(invalid)?
    };
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).map_err(invalid)?;
    builder.set_private_key(&key).map_err(invalid)?;
    builder.set_certificate(&leaf).map_err(invalid)?;
    for extra in certs {
        builder.add_extra_chain_cert(extra).map_err(invalid)?;
    }
    builder.check_private_key().map_err(invalid)?;
    Ok(builder.build())
}
