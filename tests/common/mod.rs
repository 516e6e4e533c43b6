//! Shared plumbing for the integration tests: an in-memory transport driven
//! by a scripted responder closure instead of a network peer.

use std::collections::VecDeque;
use std::time::Duration;

use cifs::packets::header::Command;
use cifs::packets::wire::{ReceivedPacket, WireBuf};
use cifs::Transport;

/// What the fake server does with each packet the client sends: zero or more
/// reply packets, queued for the client to receive.
pub type Responder = Box<dyn FnMut(&ReceivedPacket) -> Vec<Vec<u8>>>;

pub struct ScriptedTransport {
    responder: Responder,
    queue: VecDeque<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new(responder: Responder) -> ScriptedTransport {
        ScriptedTransport {
            responder,
            queue: VecDeque::new(),
        }
    }

    /// A transport whose peer never answers.
    pub fn silent() -> ScriptedTransport {
        ScriptedTransport::new(Box::new(|_| Vec::new()))
    }
}

impl Transport for ScriptedTransport {
    fn send_frame(&mut self, payload: &[u8]) -> cifs::Result<()> {
        let packet = ReceivedPacket::parse(payload.to_vec())
            .map_err(|e| cifs::Error::InvalidMessage(format!("client sent garbage: {}", e)))?;
        for reply in (self.responder)(&packet) {
            self.queue.push_back(reply);
        }
        Ok(())
    }

    fn receive_frame(&mut self, timeout: Option<Duration>) -> cifs::Result<Vec<u8>> {
        self.queue
            .pop_front()
            .ok_or(cifs::Error::Timeout(timeout.unwrap_or_default()))
    }
}

/// Builds a minimal reply packet echoing the identifiers of `request`.
pub fn reply_to(request: &ReceivedPacket, command: Command, word_count: u8) -> WireBuf {
    let mut buf = WireBuf::allocate(command, word_count, 0).unwrap();
    let (tid, pid, uid, mid) = (
        request.header.tid,
        request.header.pid,
        request.header.uid,
        request.header.mid,
    );
    buf.with_header(|header| {
        header.flags = header.flags.with_reply(true);
        header.tid = tid;
        header.pid = pid;
        header.uid = uid;
        header.mid = mid;
    })
    .unwrap();
    buf
}
