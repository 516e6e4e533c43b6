//! Chunked transaction requests and reply reassembly.
//!
//! The three transaction families carry three independent payload regions
//! (setup words, parameter bytes, data bytes) that may be split across
//! multiple packets in each direction. [`TransRequest`] describes a complete
//! outgoing transaction; the connection fragments it against the negotiated
//! buffer size. [`TransReassembly`] collects reply fragments into a
//! [`TransReply`], trusting none of the peer's offsets.

use crate::packets::trans::{read_reply, TransFamily};
use crate::packets::wire::ReceivedPacket;

/// A complete outgoing transaction.
#[derive(Debug)]
pub struct TransRequest<'a> {
    pub family: TransFamily,
    /// Transaction name (pipe name for Trans; empty elsewhere).
    pub name: &'a str,
    pub setup: &'a [u16],
    pub max_setup: u8,
    pub params: &'a [u8],
    pub max_param: u32,
    pub data: &'a [u8],
    pub max_data: u32,
    pub flags: u16,
    pub timeout_ms: u32,
    /// NT Transact function code.
    pub function: u16,
}

impl<'a> TransRequest<'a> {
    pub fn new(family: TransFamily) -> TransRequest<'a> {
        TransRequest {
            family,
            name: "",
            setup: &[],
            max_setup: 0,
            params: &[],
            max_param: 0,
            data: &[],
            max_data: 0,
            flags: 0,
            timeout_ms: 0,
            function: 0,
        }
    }
}

/// A fully reassembled transaction reply.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TransReply {
    pub setup: Vec<u16>,
    pub params: Vec<u8>,
    pub data: Vec<u8>,
}

/// Incremental reassembly of a fragmented transaction reply.
///
/// The first fragment fixes the total region sizes. Later fragments must
/// agree: a peer that shrinks or grows the totals mid-stream is answered
/// with [`crate::Error::BufferTooSmall`] rather than a reallocation.
#[derive(Debug)]
pub struct TransReassembly {
    family: TransFamily,
    totals: Option<(u32, u32)>,
    params: Vec<u8>,
    data: Vec<u8>,
    got_param: u32,
    got_data: u32,
    setup: Vec<u16>,
    interim_seen: bool,
}

impl TransReassembly {
    pub fn new(family: TransFamily) -> TransReassembly {
        TransReassembly {
            family,
            totals: None,
            params: Vec::new(),
            data: Vec::new(),
            got_param: 0,
            got_data: 0,
            setup: Vec::new(),
            interim_seen: false,
        }
    }

    /// Whether the zero-word interim acknowledgment has arrived.
    pub fn interim_seen(&self) -> bool {
        self.interim_seen
    }

    /// Folds one reply packet into the reassembly. Returns `true` once both
    /// regions are complete.
    pub fn feed(&mut self, packet: &ReceivedPacket) -> crate::Result<bool> {
        let block = packet.block()?;

        // A zero-word reply is the interim acknowledgment that unblocks
        // sending the secondaries. It carries no payload.
        if block.words.is_empty() {
            log::trace!("Interim {} acknowledgment.", self.family);
            self.interim_seen = true;
            return Ok(false);
        }

        let (fields, setup) = read_reply(&block, self.family)?;

        match self.totals {
            None => {
                self.reserve(fields.total_param, fields.total_data)?;
                self.totals = Some((fields.total_param, fields.total_data));
            }
            Some((total_param, total_data)) => {
                // Totals are a contract, not a running estimate.
                if fields.total_param != total_param || fields.total_data != total_data {
                    return Err(crate::Error::BufferTooSmall {
                        declared: total_param.max(total_data),
                        received: fields.total_param.max(fields.total_data),
                    });
                }
            }
        }

        if !setup.is_empty() {
            self.setup = setup;
        }

        self.place(
            Region::Param,
            fields.param_disp,
            fields.param_offset,
            fields.this_param,
            packet,
        )?;
        self.place(
            Region::Data,
            fields.data_disp,
            fields.data_offset,
            fields.this_data,
            packet,
        )?;

        let (total_param, total_data) = self.totals.unwrap_or((0, 0));
        Ok(self.got_param >= total_param && self.got_data >= total_data)
    }

    fn reserve(&mut self, total_param: u32, total_data: u32) -> crate::Result<()> {
        self.params
            .try_reserve_exact(total_param as usize)
            .map_err(|_| crate::Error::AllocationFailed(total_param as usize))?;
        self.params.resize(total_param as usize, 0);
        self.data
            .try_reserve_exact(total_data as usize)
            .map_err(|_| crate::Error::AllocationFailed(total_data as usize))?;
        self.data.resize(total_data as usize, 0);
        Ok(())
    }

    fn place(
        &mut self,
        region: Region,
        disp: u32,
        offset: u32,
        length: u32,
        packet: &ReceivedPacket,
    ) -> crate::Result<()> {
        if length == 0 {
            return Ok(());
        }
        let (buf, got, total) = match region {
            Region::Param => (
                &mut self.params,
                &mut self.got_param,
                self.totals.map(|t| t.0).unwrap_or(0),
            ),
            Region::Data => (
                &mut self.data,
                &mut self.got_data,
                self.totals.map(|t| t.1).unwrap_or(0),
            ),
        };
        if disp.checked_add(length).map_or(true, |end| end > total) {
            return Err(crate::Error::BufferTooSmall {
                declared: total,
                received: disp.saturating_add(length),
            });
        }
        let source = packet.read_bounded(offset as usize, length as usize)?;
        buf[disp as usize..(disp + length) as usize].copy_from_slice(source);
        *got += length;
        log::trace!(
            "Placed {} {:?} bytes at displacement {} ({}/{} received).",
            length,
            region,
            disp,
            *got,
            total
        );
        Ok(())
    }

    pub fn into_reply(self) -> TransReply {
        TransReply {
            setup: self.setup,
            params: self.params,
            data: self.data,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Region {
    Param,
    Data,
}
