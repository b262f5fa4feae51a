/*
 * Created on Tue Apr 01 2025
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
    super::{evlog::EventLog, journal, Connection},
    crate::{
        config::Config,
        error::{Error, RestartError},
        proto::{pb, Elapsed},
    },
    prost::Message,
    rand::{distributions::Alphanumeric, Rng},
    std::{
        fs,
        io::Read,
        os::unix::fs::PermissionsExt,
        path::PathBuf,
        sync::Arc,
    },
};

/*
    harness
*/

/// A scratch directory tree removed when the test ends
struct TestRoot {
    path: PathBuf,
}

impl TestRoot {
    fn new(tag: &str) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let path = std::env::temp_dir().join(format!("vigil-{tag}-{suffix}"));
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }
    fn iolog(&self) -> PathBuf {
        self.path.join("io")
    }
    fn relay(&self) -> PathBuf {
        self.path.join("relay")
    }
    fn event_log(&self) -> PathBuf {
        self.path.join("events.log")
    }
}

impl Drop for TestRoot {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn local_conn(root: &TestRoot) -> Connection {
    local_conn_with(root, |_| {})
}

fn local_conn_with(root: &TestRoot, tweak: impl FnOnce(&mut Config)) -> Connection {
    let mut config = Config::test_local(&root.iolog(), &root.event_log());
    tweak(&mut config);
    let config = Arc::new(config);
    let event_log = Arc::new(EventLog::new(config.event_log()));
    Connection::new(config, event_log)
}

fn journal_conn(root: &TestRoot) -> Connection {
    let config = Arc::new(Config::test_journal(&root.relay()));
    let event_log = Arc::new(EventLog::new(config.event_log()));
    Connection::new(config, event_log)
}

fn ts(sec: i64, nsec: i32) -> pb::TimeSpec {
    pb::TimeSpec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

fn msg(ty: pb::client_message::Type) -> pb::ClientMessage {
    pb::ClientMessage { r#type: Some(ty) }
}

fn info_str(key: &str, value: &str) -> pb::InfoMessage {
    pb::InfoMessage {
        key: key.to_owned(),
        value: Some(pb::info_message::Value::Strval(value.to_owned())),
    }
}

fn info_list(key: &str, values: &[&str]) -> pb::InfoMessage {
    pb::InfoMessage {
        key: key.to_owned(),
        value: Some(pb::info_message::Value::Strlistval(pb::StringList {
            strings: values.iter().map(|s| s.to_string()).collect(),
        })),
    }
}

fn accept(expect_iobufs: bool, infos: Vec<pb::InfoMessage>) -> pb::ClientMessage {
    msg(pb::client_message::Type::AcceptMsg(pb::AcceptMessage {
        submit_time: Some(ts(1_700_000_000, 0)),
        info_msgs: infos,
        expect_iobufs,
    }))
}

fn exit_ok() -> pb::ClientMessage {
    msg(pb::client_message::Type::ExitMsg(pb::ExitMessage {
        run_time: Some(ts(2, 0)),
        exit_value: 0,
        ..Default::default()
    }))
}

fn ttyout(delay: pb::TimeSpec, data: &[u8]) -> pb::ClientMessage {
    msg(pb::client_message::Type::TtyoutBuf(pb::IoBuffer {
        delay: Some(delay),
        data: data.to_vec(),
    }))
}

fn stdout_buf(delay: pb::TimeSpec, data: &[u8]) -> pb::ClientMessage {
    msg(pb::client_message::Type::StdoutBuf(pb::IoBuffer {
        delay: Some(delay),
        data: data.to_vec(),
    }))
}

fn restart(log_id: &str, resume: pb::TimeSpec) -> pb::ClientMessage {
    msg(pb::client_message::Type::RestartMsg(pb::RestartMessage {
        log_id: log_id.to_owned(),
        resume_point: Some(resume),
    }))
}

/// Encode and dispatch the way the event loop does: the handler sees both
/// the decoded message and the original serialized bytes
fn feed(con: &mut Connection, message: pb::ClientMessage) -> crate::error::RuntimeResult<Vec<u8>> {
    let raw = message.encode_to_vec();
    con.dispatch(message, &raw).map(|_| raw)
}

fn take_log_id(con: &mut Connection) -> String {
    con.take_outbound()
        .into_iter()
        .find_map(|m| match m.r#type {
            Some(pb::server_message::Type::LogId(id)) => Some(id),
            _ => None,
        })
        .expect("expected a log id message")
}

/*
    local sink scenarios
*/

#[test]
fn local_accept_without_iobufs_logs_event_only() {
    let root = TestRoot::new("local-plain");
    let mut con = local_conn(&root);
    feed(
        &mut con,
        accept(false, vec![info_str("user", "alice")]),
    )
    .unwrap();
    feed(&mut con, exit_ok()).unwrap();
    let events = fs::read_to_string(root.event_log()).unwrap();
    assert_eq!(events.lines().count(), 1);
    assert!(events.contains("ACCEPT"));
    assert!(events.contains("user=alice"));
    // no I/O expected, so no tree was created
    assert!(!root.iolog().exists());
    assert_eq!(con.elapsed(), Elapsed::zero());
}

#[test]
fn local_io_session_writes_streams_timing_and_seals() {
    let root = TestRoot::new("local-io");
    let mut con = local_conn(&root);
    feed(
        &mut con,
        accept(
            true,
            vec![
                info_str("user", "alice"),
                info_list("argv", &["/bin/ls", "-l"]),
            ],
        ),
    )
    .unwrap();
    let log_id = take_log_id(&mut con);
    assert!(log_id.starts_with("alice/"));
    feed(&mut con, ttyout(ts(0, 500_000_000), b"hello\n")).unwrap();
    feed(&mut con, ttyout(ts(1, 0), b"world\n")).unwrap();
    let session_dir = root.iolog().join(&log_id);
    // the session is still live: owner write bit set on timing
    let mode = fs::metadata(session_dir.join("timing"))
        .unwrap()
        .permissions()
        .mode();
    assert_ne!(mode & 0o200, 0);
    feed(&mut con, exit_ok()).unwrap();
    assert_eq!(
        fs::read_to_string(session_dir.join("ttyout")).unwrap(),
        "hello\nworld\n"
    );
    assert_eq!(
        fs::read_to_string(session_dir.join("timing")).unwrap(),
        "1 0.500000000 6\n1 1.000000000 6\n"
    );
    // sealed: every write bit cleared
    let mode = fs::metadata(session_dir.join("timing"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o222, 0);
    assert_eq!(con.elapsed(), Elapsed::new(1, 500_000_000));
    // metadata made it to both event logs, lists as JSON arrays
    let events = fs::read_to_string(root.event_log()).unwrap();
    assert!(events.contains(r#"argv=["/bin/ls","-l"]"#));
    let session_log = fs::read_to_string(session_dir.join("log")).unwrap();
    assert!(session_log.contains("ACCEPT"));
    assert!(session_log.contains("EXIT 0"));
}

#[test]
fn local_winsize_and_suspend_write_timing_records_only() {
    let root = TestRoot::new("local-timing");
    let mut con = local_conn(&root);
    feed(&mut con, accept(true, vec![info_str("user", "bob")])).unwrap();
    let log_id = take_log_id(&mut con);
    feed(
        &mut con,
        msg(pb::client_message::Type::WinsizeEvent(pb::WinsizeChange {
            delay: Some(ts(0, 100_000_000)),
            rows: 24,
            cols: 80,
        })),
    )
    .unwrap();
    feed(
        &mut con,
        msg(pb::client_message::Type::SuspendEvent(pb::CommandSuspend {
            delay: Some(ts(0, 200_000_000)),
            signal: "TSTP".to_owned(),
        })),
    )
    .unwrap();
    let timing = fs::read_to_string(root.iolog().join(&log_id).join("timing")).unwrap();
    assert_eq!(timing, "5 0.100000000 24 80\n6 0.200000000 TSTP\n");
    // no payload stream was created
    assert!(!root.iolog().join(&log_id).join("ttyout").exists());
    assert_eq!(con.elapsed(), Elapsed::new(0, 300_000_000));
}

#[test]
fn local_restart_of_sealed_session_is_refused() {
    let root = TestRoot::new("local-sealed");
    let mut con = local_conn(&root);
    feed(&mut con, accept(true, vec![info_str("user", "alice")])).unwrap();
    let log_id = take_log_id(&mut con);
    feed(&mut con, ttyout(ts(0, 500_000_000), b"hello\n")).unwrap();
    feed(&mut con, exit_ok()).unwrap();
    drop(con);
    let mut con = local_conn(&root);
    let err = feed(&mut con, restart(&log_id, ts(0, 500_000_000))).unwrap_err();
    assert!(matches!(
        err,
        Error::Restart(RestartError::AlreadyComplete)
    ));
    assert_eq!(
        con.errstr(),
        Some("log is already complete, cannot be restarted")
    );
}

#[test]
fn local_restart_of_missing_session_is_refused() {
    let root = TestRoot::new("local-missing");
    let mut con = local_conn(&root);
    let err = feed(&mut con, restart("alice/nonexistent", ts(0, 0))).unwrap_err();
    assert!(matches!(err, Error::Restart(RestartError::MissingIolog)));
    assert_eq!(con.errstr(), Some("unable to open I/O log directory"));
}

#[test]
fn local_restart_seeks_plain_streams_and_resumes() {
    let root = TestRoot::new("local-seek");
    let mut con = local_conn(&root);
    feed(&mut con, accept(true, vec![info_str("user", "alice")])).unwrap();
    let log_id = take_log_id(&mut con);
    feed(&mut con, ttyout(ts(0, 100_000_000), b"aaaa")).unwrap();
    feed(&mut con, ttyout(ts(0, 200_000_000), b"bbbb")).unwrap();
    feed(&mut con, ttyout(ts(0, 300_000_000), b"cccc")).unwrap();
    // the connection dies without an exit; the session stays live
    drop(con);
    let mut con = local_conn(&root);
    feed(&mut con, restart(&log_id, ts(0, 300_000_000))).unwrap();
    assert_eq!(con.elapsed(), Elapsed::new(0, 300_000_000));
    // the client resends from the resume point with different bytes
    feed(&mut con, ttyout(ts(0, 300_000_000), b"BBBB")).unwrap();
    feed(&mut con, exit_ok()).unwrap();
    let session_dir = root.iolog().join(&log_id);
    // the first two records survive; the resent bytes overwrite the third
    let data = fs::read_to_string(session_dir.join("ttyout")).unwrap();
    assert_eq!(data, "aaaabbbbBBBB");
    let timing = fs::read_to_string(session_dir.join("timing")).unwrap();
    assert_eq!(
        timing,
        "1 0.100000000 4\n1 0.200000000 4\n1 0.300000000 4\n"
    );
}

#[test]
fn local_restart_overshoot_is_a_corruption_signal() {
    let root = TestRoot::new("local-overshoot");
    let mut con = local_conn(&root);
    feed(&mut con, accept(true, vec![info_str("user", "alice")])).unwrap();
    let log_id = take_log_id(&mut con);
    feed(&mut con, ttyout(ts(0, 100_000_000), b"aaaa")).unwrap();
    feed(&mut con, ttyout(ts(0, 200_000_000), b"bbbb")).unwrap();
    drop(con);
    let mut con = local_conn(&root);
    let err = feed(&mut con, restart(&log_id, ts(0, 250_000_000))).unwrap_err();
    assert!(matches!(
        err,
        Error::Restart(RestartError::ResumePointNotFound)
    ));
}

#[test]
fn local_restart_rewrites_compressed_streams() {
    let root = TestRoot::new("local-rewrite");
    let mut con = local_conn_with(&root, |c| c.test_set_compress(true));
    feed(&mut con, accept(true, vec![info_str("user", "alice")])).unwrap();
    let log_id = take_log_id(&mut con);
    feed(&mut con, ttyout(ts(0, 100_000_000), b"hello ")).unwrap();
    feed(&mut con, ttyout(ts(0, 200_000_000), b"cruel ")).unwrap();
    feed(&mut con, stdout_buf(ts(0, 100_000_000), b"12345678")).unwrap();
    drop(con);
    let session_dir = root.iolog().join(&log_id);
    // the stream really is compressed on disk
    let mut magic = [0u8; 2];
    fs::File::open(session_dir.join("ttyout"))
        .unwrap()
        .read_exact(&mut magic)
        .unwrap();
    assert_eq!(magic, [0x1f, 0x8b]);
    // resume after the second ttyout record
    let mut con = local_conn_with(&root, |c| c.test_set_compress(true));
    feed(&mut con, restart(&log_id, ts(0, 300_000_000))).unwrap();
    assert_eq!(con.elapsed(), Elapsed::new(0, 300_000_000));
    feed(&mut con, ttyout(ts(0, 100_000_000), b"world\n")).unwrap();
    feed(&mut con, exit_ok()).unwrap();
    let read_gz = |name: &str| {
        let mut out = String::new();
        flate2::read::GzDecoder::new(fs::File::open(session_dir.join(name)).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        out
    };
    assert_eq!(read_gz("ttyout"), "hello cruel world\n");
    // stdout's only record was past the resume point: truncated away
    assert_eq!(read_gz("stdout"), "");
    // the rewrite scratch directory is gone
    assert!(!session_dir.join("restart.tmp").exists());
    let timing = fs::read_to_string(session_dir.join("timing")).unwrap();
    assert_eq!(
        timing,
        "1 0.100000000 6\n1 0.200000000 6\n1 0.100000000 6\n"
    );
}

#[test]
fn local_iobuf_before_accept_is_a_protocol_error() {
    let root = TestRoot::new("local-noaccept");
    let mut con = local_conn(&root);
    let err = feed(&mut con, ttyout(ts(0, 0), b"x")).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(con.errstr().is_some());
}

#[test]
fn local_unknown_metadata_variant_is_a_protocol_error() {
    let root = TestRoot::new("local-badinfo");
    let mut con = local_conn(&root);
    let bad = pb::InfoMessage {
        key: "mystery".to_owned(),
        value: None,
    };
    let err = feed(&mut con, accept(false, vec![bad])).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    // nothing was logged for the failed accept
    assert!(!root.event_log().exists());
}

#[test]
fn local_random_drop_fails_iobuf_after_accounting() {
    let root = TestRoot::new("local-drop");
    // gen::<f64>() samples [0, 1), so a probability of 1.0 always drops
    let mut con = local_conn_with(&root, |c| c.test_set_random_drop(1.0));
    feed(&mut con, accept(true, vec![info_str("user", "alice")])).unwrap();
    let log_id = take_log_id(&mut con);
    let err = feed(&mut con, ttyout(ts(0, 500_000_000), b"hello\n")).unwrap_err();
    assert!(matches!(err, Error::Other(_)));
    // the write and the time accounting happened before the drop
    assert_eq!(con.elapsed(), Elapsed::new(0, 500_000_000));
    let data = fs::read_to_string(root.iolog().join(&log_id).join("ttyout")).unwrap();
    assert_eq!(data, "hello\n");
}

/*
    journal sink scenarios
*/

#[test]
fn journal_relay_commits_raw_frames_to_outgoing() {
    let root = TestRoot::new("journal-relay");
    let mut con = journal_conn(&root);
    let raw_accept = feed(&mut con, accept(true, vec![info_str("user", "alice")])).unwrap();
    let log_id = take_log_id(&mut con);
    assert!(log_id.contains('/'));
    let raw_buf = feed(&mut con, stdout_buf(ts(0, 10_000_000), b"x")).unwrap();
    let raw_exit = feed(&mut con, exit_ok()).unwrap();
    let incoming: Vec<_> = fs::read_dir(root.relay().join(journal::INCOMING_DIR))
        .unwrap()
        .collect();
    assert!(incoming.is_empty());
    let outgoing: Vec<_> = fs::read_dir(root.relay().join(journal::OUTGOING_DIR))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(outgoing.len(), 1);
    let mut expected = Vec::new();
    for raw in [&raw_accept, &raw_buf, &raw_exit] {
        expected.extend_from_slice(&(raw.len() as u32).to_be_bytes());
        expected.extend_from_slice(raw);
    }
    assert_eq!(fs::read(&outgoing[0]).unwrap(), expected);
    assert_eq!(con.elapsed(), Elapsed::new(0, 10_000_000));
}

fn spool_journal(root: &TestRoot) -> String {
    let mut con = journal_conn(root);
    feed(&mut con, accept(true, vec![info_str("user", "alice")])).unwrap();
    let log_id = take_log_id(&mut con);
    feed(&mut con, stdout_buf(ts(0, 100_000_000), b"a")).unwrap();
    feed(&mut con, stdout_buf(ts(0, 200_000_000), b"b")).unwrap();
    feed(&mut con, stdout_buf(ts(0, 300_000_000), b"c")).unwrap();
    // no exit: the journal stays under incoming/ for a restart
    log_id
}

#[test]
fn journal_restart_at_partial_sum_succeeds() {
    let root = TestRoot::new("journal-hit");
    let log_id = spool_journal(&root);
    let mut con = journal_conn(&root);
    // 0.1 + 0.2 accounted; positioned ahead of the third buffer
    feed(&mut con, restart(&log_id, ts(0, 300_000_000))).unwrap();
    assert_eq!(con.elapsed(), Elapsed::new(0, 300_000_000));
    // the rewrite from the resume point followed by an exit commits the
    // journal: accept + two original buffers + resent buffer + exit
    let raw_resent = feed(&mut con, stdout_buf(ts(0, 300_000_000), b"C")).unwrap();
    let raw_exit = feed(&mut con, exit_ok()).unwrap();
    let outgoing: Vec<_> = fs::read_dir(root.relay().join(journal::OUTGOING_DIR))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(outgoing.len(), 1);
    let bytes = fs::read(&outgoing[0]).unwrap();
    let mut tail = Vec::new();
    for raw in [&raw_resent, &raw_exit] {
        tail.extend_from_slice(&(raw.len() as u32).to_be_bytes());
        tail.extend_from_slice(raw);
    }
    assert!(bytes.ends_with(&tail));
}

#[test]
fn journal_restart_between_records_is_invalid() {
    let root = TestRoot::new("journal-miss");
    let log_id = spool_journal(&root);
    let mut con = journal_conn(&root);
    let err = feed(&mut con, restart(&log_id, ts(0, 250_000_000))).unwrap_err();
    assert!(matches!(err, Error::Restart(RestartError::InvalidJournal)));
    assert_eq!(
        con.errstr(),
        Some("invalid journal file, unable to restart")
    );
}

#[test]
fn journal_restart_past_the_end_is_invalid() {
    let root = TestRoot::new("journal-past");
    let log_id = spool_journal(&root);
    let mut con = journal_conn(&root);
    let err = feed(&mut con, restart(&log_id, ts(10, 0))).unwrap_err();
    assert!(matches!(err, Error::Restart(RestartError::InvalidJournal)));
}

#[test]
fn journal_restart_of_missing_journal_is_refused() {
    let root = TestRoot::new("journal-missing");
    // materialize the relay tree
    spool_journal(&root);
    let mut con = journal_conn(&root);
    let err = feed(&mut con, restart("host/vigil.zzzzzz", ts(0, 0))).unwrap_err();
    assert!(matches!(err, Error::Restart(RestartError::MissingJournal)));
    assert_eq!(con.errstr(), Some("unable to open journal file"));
}

#[test]
fn journal_iobuf_before_accept_is_a_protocol_error() {
    let root = TestRoot::new("journal-noaccept");
    let mut con = journal_conn(&root);
    let err = feed(&mut con, stdout_buf(ts(0, 0), b"x")).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

/*
    dispatch properties
*/

#[test]
fn dispatch_routes_each_variant_to_exactly_one_sink_slot() {
    let root = TestRoot::new("dispatch-one");
    let mut con = local_conn(&root);
    feed(&mut con, accept(false, vec![info_str("user", "alice")])).unwrap();
    feed(
        &mut con,
        msg(pb::client_message::Type::AlertMsg(pb::AlertMessage {
            alert_time: Some(ts(1_700_000_100, 0)),
            reason: "policy tripped".to_owned(),
            info_msgs: vec![],
        })),
    )
    .unwrap();
    let events = fs::read_to_string(root.event_log()).unwrap();
    // exactly one record per dispatched message, in order
    let kinds: Vec<&str> = events
        .lines()
        .map(|l| {
            if l.contains("ACCEPT") {
                "accept"
            } else if l.contains("ALERT") {
                "alert"
            } else {
                "?"
            }
        })
        .collect();
    assert_eq!(kinds, ["accept", "alert"]);
    // the alert handler never created an I/O tree
    assert!(!root.iolog().exists());
}

#[test]
fn dispatch_rejects_mid_session_hello() {
    let root = TestRoot::new("dispatch-hello");
    let mut con = local_conn(&root);
    let err = feed(
        &mut con,
        msg(pb::client_message::Type::HelloMsg(pb::ClientHello {
            client_id: "late".to_owned(),
        })),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn dispatch_queues_commit_points_for_iobufs() {
    let root = TestRoot::new("dispatch-ack");
    let mut con = local_conn(&root);
    feed(&mut con, accept(true, vec![info_str("user", "alice")])).unwrap();
    let _ = take_log_id(&mut con);
    feed(&mut con, ttyout(ts(0, 500_000_000), b"hi")).unwrap();
    let outbound = con.take_outbound();
    assert_eq!(outbound.len(), 1);
    match &outbound[0].r#type {
        Some(pb::server_message::Type::CommitPoint(at)) => {
            assert_eq!((at.tv_sec, at.tv_nsec), (0, 500_000_000));
        }
        other => panic!("expected a commit point, got {other:?}"),
    }
    // no commit point for reject/exit style records
    feed(&mut con, exit_ok()).unwrap();
    assert!(con.take_outbound().is_empty());
}

#[test]
fn local_reject_logs_reason() {
    let root = TestRoot::new("local-reject");
    let mut con = local_conn(&root);
    feed(
        &mut con,
        msg(pb::client_message::Type::RejectMsg(pb::RejectMessage {
            submit_time: Some(ts(1_700_000_000, 0)),
            reason: "not in policy".to_owned(),
            info_msgs: vec![info_str("user", "mallory")],
        })),
    )
    .unwrap();
    let events = fs::read_to_string(root.event_log()).unwrap();
    assert!(events.contains("REJECT"));
    assert!(events.contains("(not in policy)"));
    assert!(events.contains("user=mallory"));
}
