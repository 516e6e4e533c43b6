//! Client-side request objects.
//!
//! A [`Request`] is an outgoing packet under construction plus the bookkeeping
//! the connection needs to correlate its reply. The connection stamps the
//! identifiers at setup time; the caller fills the words and data through the
//! underlying [`WireBuf`] and hands the request back for sending.

use std::time::Duration;

use crate::packets::header::Command;
use crate::packets::wire::{WireBuf, WireStr};

/// An authenticated session on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub uid: u16,
}

impl Session {
    /// Session identifier used before any authentication has happened.
    pub fn anonymous() -> Session {
        Session { uid: 0 }
    }
}

/// A connected share on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tree {
    pub tid: u16,
}

impl Tree {
    /// Tree identifier used before any share is connected.
    pub fn none() -> Tree {
        Tree { tid: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Words and data still being filled in.
    Building,
    /// On the wire, reply not yet correlated.
    Sent,
    /// Reply received and handed to the caller.
    Done,
    /// Send or correlation failed.
    Failed,
}

/// An outgoing request packet.
#[derive(Debug)]
pub struct Request {
    mid: u16,
    command: Command,
    buf: WireBuf,
    state: RequestState,
    one_way: bool,
    timeout: Option<Duration>,
}

impl Request {
    pub(crate) fn new(mid: u16, command: Command, buf: WireBuf) -> Request {
        Request {
            mid,
            command,
            buf,
            state: RequestState::Building,
            one_way: false,
            timeout: None,
        }
    }

    pub fn mid(&self) -> u16 {
        self.mid
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: RequestState) {
        self.state = state;
    }

    /// Marks the request as expecting no reply. One-way requests are not
    /// registered for correlation and consume a single signing sequence
    /// number instead of two.
    pub fn set_one_way(&mut self) {
        self.one_way = true;
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    /// Overrides the connection-wide reply timeout for this request.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Writes a word-region byte at `offset` within the current block.
    pub fn put_word_u8(&mut self, offset: usize, value: u8) -> crate::Result<()> {
        self.buf.put_word_u8(offset, value)
    }

    pub fn put_word_u16(&mut self, offset: usize, value: u16) -> crate::Result<()> {
        self.buf.put_word_u16(offset, value)
    }

    pub fn put_word_u32(&mut self, offset: usize, value: u32) -> crate::Result<()> {
        self.buf.put_word_u32(offset, value)
    }

    /// Appends raw bytes to the data region, returning their absolute offset.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> crate::Result<usize> {
        self.buf.append_bytes(bytes)
    }

    /// Appends a string to the data region in the requested encoding.
    pub fn append_string(&mut self, s: &str, encoding: WireStr) -> crate::Result<usize> {
        self.buf.append_string(s, encoding)
    }

    /// Opens a chained AndX block for `command` after the current block.
    pub fn chain(&mut self, command: Command, word_count: u8, data_len: usize) -> crate::Result<()> {
        self.buf.chain(command, word_count, data_len)
    }

    /// Serialized length of the packet so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn buf(&self) -> &WireBuf {
        &self.buf
    }

    pub(crate) fn buf_mut(&mut self) -> &mut WireBuf {
        &mut self.buf
    }

    pub(crate) fn into_buf(self) -> WireBuf {
        self.buf
    }
}
