//! Reply reading: the status loop and per-command result decoding.
//!
//! Replies are status-first and use field-local length prefixes that exclude
//! themselves, unlike outbound frames whose leading length includes itself.
//! That asymmetry is the engine's contract and is preserved here.
//!
//! The unusual construct is the mid-reply callback: while the status byte is
//! `RETRIEVE_DEPENDENCY` the engine is asking the driver for a dependency
//! table before it finishes the reply. The loop below is iterative on
//! purpose, so stack depth stays bounded no matter how many dependencies one
//! fragment pulls.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::coordinator::Coordinator;
use crate::error::{EngineError, Result};
use crate::transport::Transport;

use super::exception::{take_bytes, take_u32, take_u8, CrashReport, SerializedException};
use super::status;

/// Dependency ids and tables produced by a single plan fragment.
#[derive(Debug, Clone)]
pub struct DependencySet {
    /// Whether the fragment modified any table.
    pub dirty: bool,
    /// Pairs of dependency id and serialized table body.
    pub dependencies: Vec<(u32, Bytes)>,
}

/// Read status bytes until the reply is resolved.
///
/// Returns `Ok(())` on success; any other terminal status becomes a typed
/// error. Dependency sub-requests are answered inline through the raw
/// socket, never through the frame buffer (which still holds the outbound
/// command).
pub(crate) fn read_status(
    transport: &mut Transport,
    coordinator: &mut dyn Coordinator,
) -> Result<()> {
    loop {
        let status = transport.read_status()?;
        match status {
            status::SUCCESS => return Ok(()),
            status::RETRIEVE_DEPENDENCY => {
                let dependency_id = transport.read_u32()?;
                send_dependency(transport, coordinator, dependency_id)?;
            }
            status::CRASH_ENGINE => {
                // The crash payload is framed separately: a total length
                // outside the report body, unlike exception payloads.
                let total = transport.read_u32()?;
                let body = transport.read_exact_bytes(total as usize)?;
                let report = CrashReport::decode(body)?;
                tracing::error!(%report, "engine requested coordinator crash");
                coordinator.fatal_crash(&report);
                return Err(EngineError::Crash(report));
            }
            other if other >= status::RETRIEVE_DEPENDENCY => {
                // 101/102 are driver-to-engine only; everything else up
                // here is outside the documented set.
                return Err(EngineError::Protocol(format!(
                    "status {other} is not valid from the engine"
                )));
            }
            other => return Err(decode_exception(transport, other)),
        }
    }
}

/// Answer one `RETRIEVE_DEPENDENCY` sub-request.
fn send_dependency(
    transport: &mut Transport,
    coordinator: &mut dyn Coordinator,
    dependency_id: u32,
) -> Result<()> {
    match coordinator.next_dependency(dependency_id) {
        None => {
            tracing::debug!(dependency_id, "dependency not found");
            transport.write_all(&[status::DEPENDENCY_NOT_FOUND])
        }
        Some(table) => {
            tracing::debug!(dependency_id, len = table.len(), "sending dependency");
            let mut message = Vec::with_capacity(1 + 4 + table.len());
            message.push(status::DEPENDENCY_FOUND);
            message.extend_from_slice(&(table.len() as u32).to_be_bytes());
            message.extend_from_slice(&table);
            transport.write_all(&message)
        }
    }
}

/// Decode the exception payload that follows a nonzero error status.
///
/// A zero length means the status code alone identifies the error. Otherwise
/// the length is re-prepended so the exception deserializer sees a
/// self-describing blob.
fn decode_exception(transport: &mut Transport, error_status: u8) -> EngineError {
    let len = match transport.read_u32() {
        Ok(len) => len,
        Err(e) => return e,
    };
    if len == 0 {
        return EngineError::Engine {
            status: error_status,
        };
    }
    let body = match transport.read_exact_bytes(len as usize) {
        Ok(body) => body,
        Err(e) => return e,
    };
    let mut blob = BytesMut::with_capacity(4 + body.len());
    blob.put_u32(len);
    blob.extend_from_slice(&body);
    match SerializedException::decode(blob.freeze()) {
        Ok(exception) => EngineError::Exception(exception),
        Err(e) => e,
    }
}

/// Read the length-prefixed dependency set a plan fragment produced.
///
/// Body layout: dirty byte (`> 0`), u32 count, then per dependency a u32 id
/// and a u32-prefixed table body.
pub(crate) fn read_dependency_set(transport: &mut Transport) -> Result<DependencySet> {
    let len = transport.read_u32()?;
    let mut body = transport.read_exact_bytes(len as usize)?;

    let dirty = (take_u8(&mut body, "dependency dirty flag")? as i8) > 0;
    let count = take_u32(&mut body, "dependency count")?;
    let mut dependencies = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let dependency_id = take_u32(&mut body, "dependency id")?;
        let table_len = take_u32(&mut body, "dependency table length")? as usize;
        let table = take_bytes(&mut body, table_len, "dependency table")?;
        dependencies.push((dependency_id, table));
    }
    Ok(DependencySet {
        dirty,
        dependencies,
    })
}

/// Read the length-prefixed result set for `expected` plan fragments.
///
/// Body layout: dirty byte (`!= 0`), then per table a u32 dependency count
/// that must equal one, a u32 dependency id (ignored), and a u32-prefixed
/// table body.
pub(crate) fn read_result_tables(
    transport: &mut Transport,
    expected: usize,
) -> Result<(bool, Vec<Bytes>)> {
    let len = transport.read_u32()?;
    let mut body = transport.read_exact_bytes(len as usize)?;

    let dirty = take_u8(&mut body, "result dirty flag")? != 0;
    let mut tables = Vec::with_capacity(expected);
    for _ in 0..expected {
        let dependency_count = take_u32(&mut body, "result dependency count")?;
        if dependency_count != 1 {
            return Err(EngineError::Protocol(format!(
                "expected one dependency per fragment, got {dependency_count}"
            )));
        }
        let _dependency_id = take_u32(&mut body, "result dependency id")?;
        let table_len = take_u32(&mut body, "result table length")? as usize;
        tables.push(take_bytes(&mut body, table_len, "result table")?);
    }
    if body.remaining() > 0 {
        return Err(EngineError::Protocol(format!(
            "{} trailing bytes after {expected} result tables",
            body.remaining()
        )));
    }
    Ok((dirty, tables))
}

/// Read the statistics reply: a u32-prefixed message holding one
/// u32-prefixed serialized table.
pub(crate) fn read_stats_table(transport: &mut Transport) -> Result<Bytes> {
    let message_len = transport.read_u32()?;
    let mut message = transport.read_exact_bytes(message_len as usize)?;
    let table_len = take_u32(&mut message, "stats table length")? as usize;
    take_bytes(&mut message, table_len, "stats table")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::thread::JoinHandle;

    struct TestCoordinator {
        tables: HashMap<u32, Bytes>,
        requested: Vec<u32>,
        crash: Option<CrashReport>,
    }

    impl TestCoordinator {
        fn new(tables: HashMap<u32, Bytes>) -> Self {
            Self {
                tables,
                requested: Vec::new(),
                crash: None,
            }
        }
    }

    impl Coordinator for TestCoordinator {
        fn next_dependency(&mut self, dependency_id: u32) -> Option<Bytes> {
            self.requested.push(dependency_id);
            self.tables.get(&dependency_id).cloned()
        }

        fn fatal_crash(&mut self, report: &CrashReport) {
            self.crash = Some(report.clone());
        }
    }

    /// Connect a transport to a scripted peer running on a thread.
    fn scripted_peer<F>(script: F) -> (Transport, JoinHandle<Vec<u8>>)
    where
        F: FnOnce(&mut TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            script(&mut sock);
            let mut received = Vec::new();
            sock.read_to_end(&mut received).unwrap();
            received
        });
        (Transport::connect(port).unwrap(), handle)
    }

    #[test]
    fn test_success_resolves_immediately() {
        let (mut transport, peer) = scripted_peer(|sock| {
            sock.write_all(&[status::SUCCESS]).unwrap();
        });
        let mut coordinator = TestCoordinator::new(HashMap::new());
        read_status(&mut transport, &mut coordinator).unwrap();
        assert!(coordinator.requested.is_empty());
        transport.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_dependency_loop_found_and_missing() {
        let (mut transport, peer) = scripted_peer(|sock| {
            sock.write_all(&[status::RETRIEVE_DEPENDENCY]).unwrap();
            sock.write_all(&1u32.to_be_bytes()).unwrap();
            // Driver answers with [101][len][bytes]; wait for it so the
            // exchange stays request/reply shaped.
            let mut reply = vec![0u8; 1 + 4 + 128];
            sock.read_exact(&mut reply).unwrap();
            assert_eq!(reply[0], status::DEPENDENCY_FOUND);
            assert_eq!(&reply[1..5], &128u32.to_be_bytes());

            sock.write_all(&[status::RETRIEVE_DEPENDENCY]).unwrap();
            sock.write_all(&2u32.to_be_bytes()).unwrap();
            let mut reply = [0u8; 1];
            sock.read_exact(&mut reply).unwrap();
            assert_eq!(reply[0], status::DEPENDENCY_NOT_FOUND);

            sock.write_all(&[status::SUCCESS]).unwrap();
        });

        let mut tables = HashMap::new();
        tables.insert(1u32, Bytes::from(vec![0x5A; 128]));
        let mut coordinator = TestCoordinator::new(tables);

        read_status(&mut transport, &mut coordinator).unwrap();
        assert_eq!(coordinator.requested, vec![1, 2]);
        transport.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_crash_invokes_coordinator_and_fails() {
        let (mut transport, peer) = scripted_peer(|sock| {
            let mut body = Vec::new();
            for s in ["boom", "ee.cc"] {
                body.extend_from_slice(&(s.len() as u32).to_be_bytes());
                body.extend_from_slice(s.as_bytes());
            }
            body.extend_from_slice(&123u32.to_be_bytes());
            body.extend_from_slice(&1u32.to_be_bytes());
            body.extend_from_slice(&5u32.to_be_bytes());
            body.extend_from_slice(b"trace");

            sock.write_all(&[status::CRASH_ENGINE]).unwrap();
            sock.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
            sock.write_all(&body).unwrap();
        });

        let mut coordinator = TestCoordinator::new(HashMap::new());
        let err = read_status(&mut transport, &mut coordinator).unwrap_err();
        let report = match err {
            EngineError::Crash(report) => report,
            other => panic!("expected crash, got {other:?}"),
        };
        assert_eq!(report.reason, "boom");
        assert_eq!(report.filename, "ee.cc");
        assert_eq!(report.lineno, 123);
        assert_eq!(report.traces, vec!["trace"]);
        assert_eq!(coordinator.crash.as_ref().unwrap(), &report);
        transport.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_empty_exception_payload_keeps_status() {
        let (mut transport, peer) = scripted_peer(|sock| {
            sock.write_all(&[status::ERROR]).unwrap();
            sock.write_all(&0u32.to_be_bytes()).unwrap();
        });
        let mut coordinator = TestCoordinator::new(HashMap::new());
        let err = read_status(&mut transport, &mut coordinator).unwrap_err();
        assert!(matches!(err, EngineError::Engine { status: 1 }));
        transport.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_typed_exception_is_decoded() {
        let (mut transport, peer) = scripted_peer(|sock| {
            let mut body = Vec::new();
            body.extend_from_slice(&17u32.to_be_bytes());
            let msg = "unique constraint";
            body.extend_from_slice(&(msg.len() as u32).to_be_bytes());
            body.extend_from_slice(msg.as_bytes());
            body.extend_from_slice(&0u32.to_be_bytes());

            sock.write_all(&[status::ERROR]).unwrap();
            sock.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
            sock.write_all(&body).unwrap();
        });
        let mut coordinator = TestCoordinator::new(HashMap::new());
        let err = read_status(&mut transport, &mut coordinator).unwrap_err();
        match err {
            EngineError::Exception(e) => {
                assert_eq!(e.code, 17);
                assert_eq!(e.message, "unique constraint");
            }
            other => panic!("expected exception, got {other:?}"),
        }
        transport.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_driver_only_statuses_are_violations() {
        for bad in [status::DEPENDENCY_FOUND, status::DEPENDENCY_NOT_FOUND, 103] {
            let (mut transport, peer) = scripted_peer(move |sock| {
                sock.write_all(&[bad]).unwrap();
            });
            let mut coordinator = TestCoordinator::new(HashMap::new());
            let err = read_status(&mut transport, &mut coordinator).unwrap_err();
            assert!(matches!(err, EngineError::Protocol(_)), "status {bad}");
            transport.close();
            peer.join().unwrap();
        }
    }

    fn dependency_set_body(dirty: u8, deps: &[(u32, &[u8])]) -> Vec<u8> {
        let mut body = vec![dirty];
        body.extend_from_slice(&(deps.len() as u32).to_be_bytes());
        for (id, table) in deps {
            body.extend_from_slice(&id.to_be_bytes());
            body.extend_from_slice(&(table.len() as u32).to_be_bytes());
            body.extend_from_slice(table);
        }
        body
    }

    #[test]
    fn test_read_dependency_set() {
        let (mut transport, peer) = scripted_peer(|sock| {
            let body = dependency_set_body(1, &[(9, b"table-bytes")]);
            sock.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
            sock.write_all(&body).unwrap();
        });
        let set = read_dependency_set(&mut transport).unwrap();
        assert!(set.dirty);
        assert_eq!(set.dependencies.len(), 1);
        assert_eq!(set.dependencies[0].0, 9);
        assert_eq!(&set.dependencies[0].1[..], b"table-bytes");
        transport.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_dependency_dirty_is_signed_greater_than_zero() {
        // 0xFF is -1 as i8: not dirty under the `> 0` rule.
        let (mut transport, peer) = scripted_peer(|sock| {
            let body = dependency_set_body(0xFF, &[]);
            sock.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
            sock.write_all(&body).unwrap();
        });
        let set = read_dependency_set(&mut transport).unwrap();
        assert!(!set.dirty);
        transport.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_read_result_tables_rejects_bad_dependency_count() {
        let (mut transport, peer) = scripted_peer(|sock| {
            let mut body = vec![0u8];
            body.extend_from_slice(&2u32.to_be_bytes());
            body.extend_from_slice(&7u32.to_be_bytes());
            body.extend_from_slice(&0u32.to_be_bytes());
            sock.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
            sock.write_all(&body).unwrap();
        });
        let err = read_result_tables(&mut transport, 1).unwrap_err();
        assert!(err.to_string().contains("one dependency per fragment"));
        transport.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_read_result_tables_multiple() {
        let (mut transport, peer) = scripted_peer(|sock| {
            let mut body = vec![1u8];
            for (id, table) in [(1u32, b"aa".as_slice()), (2u32, b"bbbb".as_slice())] {
                body.extend_from_slice(&1u32.to_be_bytes());
                body.extend_from_slice(&id.to_be_bytes());
                body.extend_from_slice(&(table.len() as u32).to_be_bytes());
                body.extend_from_slice(table);
            }
            sock.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
            sock.write_all(&body).unwrap();
        });
        let (dirty, tables) = read_result_tables(&mut transport, 2).unwrap();
        assert!(dirty);
        assert_eq!(tables.len(), 2);
        assert_eq!(&tables[0][..], b"aa");
        assert_eq!(&tables[1][..], b"bbbb");
        transport.close();
        peer.join().unwrap();
    }

    #[test]
    fn test_read_stats_table() {
        let (mut transport, peer) = scripted_peer(|sock| {
            let table = b"stats-table";
            let mut message = Vec::new();
            message.extend_from_slice(&(table.len() as u32).to_be_bytes());
            message.extend_from_slice(table);
            sock.write_all(&(message.len() as u32).to_be_bytes()).unwrap();
            sock.write_all(&message).unwrap();
        });
        let table = read_stats_table(&mut transport).unwrap();
        assert_eq!(&table[..], b"stats-table");
        transport.close();
        peer.join().unwrap();
    }
}
