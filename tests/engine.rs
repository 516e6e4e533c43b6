//! End-to-end exercises of the request lifecycle against a scripted peer.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use common::{reply_to, ScriptedTransport};

use cifs::connection::signing::SigningContext;
use cifs::packets::wire::WireBuf;
use cifs::{Command, Connection, ConnectionConfig, Error, Session, Status, Tree};

fn connection(transport: ScriptedTransport) -> Connection {
    let config = ConnectionConfig {
        timeout: Duration::from_millis(50),
        ..Default::default()
    };
    Connection::new(Box::new(transport), config)
}

fn echo_request(conn: &mut Connection, payload: &[u8]) -> cifs::Request {
    let mut request = conn
        .setup(&Session::anonymous(), &Tree::none(), Command::Echo, 1, payload.len())
        .unwrap();
    request.put_word_u16(0, 1).unwrap();
    request.append_bytes(payload).unwrap();
    request
}

fn send_echo(conn: &mut Connection, payload: &[u8]) -> u16 {
    let request = echo_request(conn, payload);
    conn.send(request).unwrap()
}

#[test_log::test]
fn test_round_trip_correlates_by_mid() {
    let transport = ScriptedTransport::new(Box::new(|request| {
        assert_eq!(request.header.command, Command::Echo);
        let mut reply = reply_to(request, Command::Echo, 1);
        reply.put_word_u16(0, 1).unwrap();
        reply.append_bytes(b"pong").unwrap();
        vec![reply.into_bytes()]
    }));
    let mut conn = connection(transport);

    let request = echo_request(&mut conn, b"ping");
    let mid = conn.send(request).unwrap();
    let packet = conn.wait(mid).unwrap();
    assert_eq!(packet.header.mid, mid);
    assert!(packet.header.flags.reply());
    assert_eq!(packet.block().unwrap().data, b"pong");
}

#[test_log::test]
fn test_stray_mid_discarded() {
    let transport = ScriptedTransport::new(Box::new(|request| {
        let mut stray = reply_to(request, Command::Echo, 0);
        let bogus = request.header.mid ^ 0x1234;
        stray.with_header(|header| header.mid = bogus).unwrap();
        let reply = reply_to(request, Command::Echo, 0);
        vec![stray.into_bytes(), reply.into_bytes()]
    }));
    let mut conn = connection(transport);

    let mid = send_echo(&mut conn, b"");
    let packet = conn.wait(mid).unwrap();
    assert_eq!(packet.header.mid, mid);
}

#[test_log::test]
fn test_timeout_forgets_request() {
    let mut conn = connection(ScriptedTransport::silent());
    let mid = send_echo(&mut conn, b"anyone home");
    assert!(matches!(conn.wait(mid), Err(Error::Timeout(_))));
    // The request is gone; a second wait has nothing to correlate.
    assert!(matches!(
        conn.wait(mid),
        Err(Error::CorrelationNotFound(_))
    ));
    // The connection itself is still usable.
    assert!(conn.is_alive());
}

#[test_log::test]
fn test_late_reply_discarded() {
    // No answer to the first request; the second request flushes out a late
    // reply to the first, which must be dropped, then its own reply.
    let stale: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let stale_in_responder = stale.clone();
    let transport = ScriptedTransport::new(Box::new(move |request| {
        let mut slot = stale_in_responder.borrow_mut();
        match slot.take() {
            None => {
                *slot = Some(reply_to(request, Command::Echo, 0).into_bytes());
                Vec::new()
            }
            Some(late) => vec![late, reply_to(request, Command::Echo, 0).into_bytes()],
        }
    }));
    let mut conn = connection(transport);

    let first = send_echo(&mut conn, b"first");
    assert!(matches!(conn.wait(first), Err(Error::Timeout(_))));

    let second = send_echo(&mut conn, b"second");
    let packet = conn.wait(second).unwrap();
    assert_eq!(packet.header.mid, second);
}

#[test_log::test]
fn test_cancel_completes_original_request() {
    let parked: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let parked_in_responder = parked.clone();
    let transport = ScriptedTransport::new(Box::new(move |request| {
        match request.header.command {
            Command::Echo => {
                // Park the reply until the client cancels.
                let mut reply = reply_to(request, Command::Echo, 0);
                reply
                    .with_header(|header| header.status = Status::U32_CANCELLED)
                    .unwrap();
                *parked_in_responder.borrow_mut() = Some(reply.into_bytes());
                Vec::new()
            }
            Command::NtCancel => vec![parked_in_responder.borrow_mut().take().unwrap()],
            other => panic!("unexpected command {}", other),
        }
    }));
    let mut conn = connection(transport);

    let mid = send_echo(&mut conn, b"slow");
    conn.cancel(mid).unwrap();
    assert!(matches!(conn.wait(mid), Err(Error::OperationCanceled)));
}

#[test_log::test]
fn test_cancel_unknown_mid_rejected() {
    let mut conn = connection(ScriptedTransport::silent());
    assert!(matches!(
        conn.cancel(0x1234),
        Err(Error::CorrelationNotFound(0x1234))
    ));
}

#[test_log::test]
fn test_one_way_request_not_registered() {
    let mut conn = connection(ScriptedTransport::new(Box::new(|_| Vec::new())));
    let mut request = echo_request(&mut conn, b"fire and forget");
    request.set_one_way();
    let mid = conn.send(request).unwrap();
    assert!(matches!(
        conn.wait(mid),
        Err(Error::CorrelationNotFound(_))
    ));
}

#[test_log::test]
fn test_mismatched_reply_command_fails_request() {
    let transport = ScriptedTransport::new(Box::new(|request| {
        vec![reply_to(request, Command::Close, 0).into_bytes()]
    }));
    let mut conn = connection(transport);
    let mid = send_echo(&mut conn, b"");
    assert!(matches!(
        conn.wait(mid),
        Err(Error::UnexpectedCommand(0x04))
    ));
}

#[test_log::test]
fn test_oplock_break_routed_to_handler() {
    let transport = ScriptedTransport::new(Box::new(|request| {
        let mut oplock = WireBuf::allocate(Command::LockingX, 8, 0).unwrap();
        oplock.with_header(|header| header.mid = 0xFFFF).unwrap();
        vec![
            oplock.into_bytes(),
            reply_to(request, Command::Echo, 0).into_bytes(),
        ]
    }));
    let mut conn = connection(transport);

    let breaks = Rc::new(RefCell::new(0u32));
    let breaks_in_handler = breaks.clone();
    conn.set_oplock_handler(Box::new(move |packet| {
        assert_eq!(packet.header.command, Command::LockingX);
        *breaks_in_handler.borrow_mut() += 1;
    }));

    let mid = send_echo(&mut conn, b"");
    conn.wait(mid).unwrap();
    assert_eq!(*breaks.borrow(), 1);
}

#[test_log::test]
fn test_oplock_break_acknowledged_one_way() {
    let acks = Rc::new(RefCell::new(0usize));
    let acks_in_responder = acks.clone();
    let transport = ScriptedTransport::new(Box::new(move |request| {
        match request.header.command {
            Command::Echo => {
                let mut oplock = WireBuf::allocate(Command::LockingX, 8, 0).unwrap();
                oplock
                    .with_header(|header| {
                        header.mid = 0xFFFF;
                        header.tid = 0x0042;
                    })
                    .unwrap();
                oplock.put_word_u16(4, 0x0BEE).unwrap();
                vec![
                    oplock.into_bytes(),
                    reply_to(request, Command::Echo, 0).into_bytes(),
                ]
            }
            Command::LockingX => {
                // The acknowledgment itself: reserved MID, oplock release.
                assert_eq!(request.header.mid, 0xFFFF);
                assert_eq!(request.header.tid, 0x0042);
                let block = request.block().unwrap();
                assert_eq!(block.word_u16(4).unwrap(), 0x0BEE);
                assert_eq!(block.word_u16(6).unwrap(), 0x0002);
                *acks_in_responder.borrow_mut() += 1;
                Vec::new()
            }
            other => panic!("unexpected command {}", other),
        }
    }));
    let mut conn = connection(transport);

    let notifications = Rc::new(RefCell::new(Vec::new()));
    let notifications_in_handler = notifications.clone();
    conn.set_oplock_handler(Box::new(move |packet| {
        notifications_in_handler
            .borrow_mut()
            .push(packet.bytes().to_vec());
    }));

    let mid = send_echo(&mut conn, b"");
    conn.wait(mid).unwrap();

    let raw = notifications.borrow_mut().pop().unwrap();
    let notification = cifs::packets::wire::ReceivedPacket::parse(raw).unwrap();
    conn.ack_oplock_break(&notification, 0).unwrap();
    assert_eq!(*acks.borrow(), 1);
}

#[test_log::test]
fn test_cancel_consumes_one_sequence_number() {
    let mut conn = connection(ScriptedTransport::silent());
    conn.begin_signing(b"key material 1234", b"").unwrap();
    assert_eq!(conn.next_sequence(), 2);

    // A two-way request reserves a pair, the cancel exactly one.
    let mid = send_echo(&mut conn, b"slow");
    assert_eq!(conn.next_sequence(), 4);
    conn.cancel(mid).unwrap();
    assert_eq!(conn.next_sequence(), 5);
}

const SESSION_KEY: &[u8] = b"0123456789abcdef";
const RESPONSE_BLOB: &[u8] = b"ntlm-response-blob";

/// A responder that verifies request MACs and signs its replies, mirroring
/// the client's sequence accounting.
fn signing_responder(corrupt_from: usize) -> common::Responder {
    let mut server = SigningContext::new();
    server.begin_signing(SESSION_KEY, RESPONSE_BLOB).unwrap();
    let mut exchanges = 0usize;
    Box::new(move |request| {
        let mut bytes = reply_to(request, Command::Echo, 0).into_bytes();
        if let Some(seq) = server.seq_alloc(false) {
            if server.verify(request.bytes(), Some(seq)).is_err() {
                // The client stopped signing; so does the server.
                server.disable();
            } else {
                let reply_seq = if exchanges >= corrupt_from { 0xDEAD } else { seq + 1 };
                server.sign(&mut bytes, Some(reply_seq)).unwrap();
            }
        }
        exchanges += 1;
        vec![bytes]
    })
}

#[test_log::test]
fn test_signed_round_trip() {
    let mut conn = connection(ScriptedTransport::new(signing_responder(usize::MAX)));
    conn.begin_signing(SESSION_KEY, RESPONSE_BLOB).unwrap();

    for expected_seq in [2u32, 4, 6] {
        assert_eq!(conn.next_sequence(), expected_seq);
        let mid = send_echo(&mut conn, b"signed");
        conn.wait(mid).unwrap();
    }
}

#[test_log::test]
fn test_bad_mac_after_trust_kills_connection() {
    // First exchange verifies, establishing trust; the corrupted second
    // exchange is then fatal.
    let mut conn = connection(ScriptedTransport::new(signing_responder(1)));
    conn.begin_signing(SESSION_KEY, RESPONSE_BLOB).unwrap();

    let mid = send_echo(&mut conn, b"good");
    conn.wait(mid).unwrap();

    let mid = send_echo(&mut conn, b"tampered");
    assert!(matches!(conn.wait(mid), Err(Error::SignatureInvalid)));
    assert!(!conn.is_alive());
    assert!(matches!(
        conn.setup(&Session::anonymous(), &Tree::none(), Command::Echo, 0, 0),
        Err(Error::TransportClosed)
    ));
}

#[test_log::test]
fn test_bad_mac_before_trust_downgrades() {
    // A peer that negotiates signing but never signs correctly is tolerated
    // until the first verified reply; signing just turns off.
    let mut conn = connection(ScriptedTransport::new(signing_responder(0)));
    conn.begin_signing(SESSION_KEY, RESPONSE_BLOB).unwrap();

    let mid = send_echo(&mut conn, b"unsigned peer");
    let packet = conn.wait(mid).unwrap();
    assert_eq!(packet.header.mid, mid);
    assert!(conn.is_alive());
    // Subsequent requests go out unsigned.
    assert_eq!(conn.next_sequence(), 4);
    let mid = send_echo(&mut conn, b"still works");
    let packet = conn.wait(mid).unwrap();
    assert_eq!(packet.header.mid, mid);
}
