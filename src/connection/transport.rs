//! Framed byte transports.
//!
//! The engine talks to the network through [`Transport`]: whole SMB packets
//! in, whole SMB packets out, with the NetBIOS session framing handled here.
//! [`TcpTransport`] is the production implementation; tests substitute
//! scripted ones.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use binrw::prelude::*;
use std::io::Cursor;

use crate::packets::netbios::{FrameHeader, FrameType};

/// A blocking, framed packet transport.
pub trait Transport {
    /// Sends one SMB packet, wrapped in a session message frame.
    fn send_frame(&mut self, payload: &[u8]) -> crate::Result<()>;

    /// Receives the next SMB packet, stripping the frame. Keep-alive frames
    /// are consumed internally and never surface.
    ///
    /// `timeout` bounds the wait for the *first* byte of a frame; `None`
    /// blocks indefinitely.
    fn receive_frame(&mut self, timeout: Option<Duration>) -> crate::Result<Vec<u8>>;
}

/// [`Transport`] over a plain TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> crate::Result<TcpTransport> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    log::debug!("Connected to {}.", addr);
                    return Ok(TcpTransport { stream });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "No addresses to connect to")
            })
            .into())
    }

    pub fn from_stream(stream: TcpStream) -> crate::Result<TcpTransport> {
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }

    fn map_recv_error(e: std::io::Error, timeout: Option<Duration>) -> crate::Error {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset => crate::Error::TransportClosed,
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                crate::Error::Timeout(timeout.unwrap_or_default())
            }
            _ => e.into(),
        }
    }
}

impl Transport for TcpTransport {
    fn send_frame(&mut self, payload: &[u8]) -> crate::Result<()> {
        let header = FrameHeader::session_message(payload.len())?;
        let mut frame = Vec::new();
        frame
            .try_reserve(FrameHeader::SIZE + payload.len())
            .map_err(|_| crate::Error::AllocationFailed(FrameHeader::SIZE + payload.len()))?;
        header.write(&mut Cursor::new(&mut frame))?;
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
            ) {
                crate::Error::TransportClosed
            } else {
                e.into()
            }
        })?;
        log::trace!("Sent frame of {} bytes.", payload.len());
        Ok(())
    }

    fn receive_frame(&mut self, timeout: Option<Duration>) -> crate::Result<Vec<u8>> {
        loop {
            self.stream.set_read_timeout(timeout)?;
            let mut header_bytes = [0u8; FrameHeader::SIZE];
            self.stream
                .read_exact(&mut header_bytes)
                .map_err(|e| Self::map_recv_error(e, timeout))?;
            let header = FrameHeader::read(&mut Cursor::new(&header_bytes))?;

            if header.ptype == FrameType::SessionKeepAlive {
                log::trace!("Swallowed keep-alive frame.");
                continue;
            }

            // Once the header is in, the rest of the frame is due promptly.
            self.stream.set_read_timeout(None)?;
            let len = header.payload_len();
            let mut payload = Vec::new();
            payload
                .try_reserve_exact(len)
                .map_err(|_| crate::Error::AllocationFailed(len))?;
            payload.resize(len, 0);
            self.stream
                .read_exact(&mut payload)
                .map_err(|e| Self::map_recv_error(e, None))?;
            log::trace!("Received frame of {} bytes.", len);
            return Ok(payload);
        }
    }
}
