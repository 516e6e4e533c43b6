//! Outgoing packet builder and bounds-checked incoming packet reader.
//!
//! An SMB1 packet is a fixed header followed by one or more command blocks,
//! each a word-count byte, `word_count` 16-bit words, a 16-bit byte count and
//! that many data bytes. The builder keeps plain byte offsets into a single
//! `Vec<u8>` and recomputes slices on demand; nothing here holds a pointer
//! into the buffer across a reallocation.
//!
//! Every read of an incoming packet goes through an explicit bounds check,
//! since the offsets involved originate from the peer.

use std::io::Cursor;

use binrw::prelude::*;

use super::header::{Command, Header};

/// Extra capacity reserved beyond the declared regions, so that appending a
/// couple of strings rarely triggers a second allocation.
const ALLOC_SLACK: usize = 128;

/// String encodings accepted by [`WireBuf::append_string`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireStr {
    /// 8-bit bytes, NUL terminated.
    Ascii,
    /// UTF-16LE, NUL terminated, padded to an even packet offset.
    Unicode,
    /// UTF-16LE without the alignment pad.
    UnicodeUnaligned,
}

/// Builder for an outgoing packet.
#[derive(Debug)]
pub struct WireBuf {
    bytes: Vec<u8>,
    /// Offset of the current block's word-count byte.
    wct_at: usize,
    /// Offset of the current block's byte-count field.
    bcc_at: usize,
}

impl WireBuf {
    /// Reserves a packet with a default header, `word_count` zeroed parameter
    /// words and room for `data_len` data bytes.
    pub fn allocate(command: Command, word_count: u8, data_len: usize) -> crate::Result<WireBuf> {
        let block_size = 1 + word_count as usize * 2 + 2;
        let mut bytes = Vec::new();
        try_reserve(
            &mut bytes,
            Header::STRUCT_SIZE + block_size + data_len + ALLOC_SLACK,
        )?;

        Header::new(command).write(&mut Cursor::new(&mut bytes))?;
        debug_assert_eq!(bytes.len(), Header::STRUCT_SIZE);

        let wct_at = bytes.len();
        bytes.push(word_count);
        bytes.resize(bytes.len() + word_count as usize * 2, 0);
        let bcc_at = bytes.len();
        bytes.extend_from_slice(&[0, 0]);

        Ok(WireBuf {
            bytes,
            wct_at,
            bcc_at,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Parses the fixed header back out of the buffer.
    pub fn header(&self) -> crate::Result<Header> {
        Ok(Header::read_le(&mut Cursor::new(&self.bytes))?)
    }

    /// Re-serializes the header after letting `f` edit it.
    pub fn with_header(&mut self, f: impl FnOnce(&mut Header)) -> crate::Result<()> {
        let mut header = self.header()?;
        f(&mut header);
        header.write_to(&mut self.bytes)
    }

    /// Length in bytes of the current block's word region.
    pub fn words_len(&self) -> usize {
        self.bytes[self.wct_at] as usize * 2
    }

    fn word_slot(&mut self, offset: usize, width: usize) -> crate::Result<&mut [u8]> {
        let limit = self.words_len();
        let end = offset
            .checked_add(width)
            .ok_or(crate::Error::OutOfBounds {
                offset,
                length: width,
                limit,
            })?;
        if end > limit {
            return Err(crate::Error::OutOfBounds {
                offset,
                length: width,
                limit,
            });
        }
        let base = self.wct_at + 1;
        Ok(&mut self.bytes[base + offset..base + end])
    }

    /// Writes a byte at `offset` within the current block's word region.
    pub fn put_word_u8(&mut self, offset: usize, value: u8) -> crate::Result<()> {
        self.word_slot(offset, 1)?[0] = value;
        Ok(())
    }

    pub fn put_word_u16(&mut self, offset: usize, value: u16) -> crate::Result<()> {
        self.word_slot(offset, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put_word_u32(&mut self, offset: usize, value: u32) -> crate::Result<()> {
        self.word_slot(offset, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Offset of the first data byte of the current block.
    pub fn data_start(&self) -> usize {
        self.bcc_at + 2
    }

    /// Current block's declared data length.
    pub fn data_len(&self) -> usize {
        u16::from_le_bytes([self.bytes[self.bcc_at], self.bytes[self.bcc_at + 1]]) as usize
    }

    fn bump_bcc(&mut self, added: usize) -> crate::Result<()> {
        let new_len = self.data_len() + added;
        if new_len > u16::MAX as usize {
            return Err(crate::Error::InvalidMessage(format!(
                "Data region of {} bytes overflows the 16-bit byte count",
                new_len
            )));
        }
        self.bytes[self.bcc_at..self.bcc_at + 2].copy_from_slice(&(new_len as u16).to_le_bytes());
        Ok(())
    }

    /// Appends raw bytes to the current block's data region, returning the
    /// absolute offset at which they were placed.
    pub fn append_bytes(&mut self, data: &[u8]) -> crate::Result<usize> {
        try_reserve(&mut self.bytes, data.len())?;
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(data);
        self.bump_bcc(data.len())?;
        Ok(offset)
    }

    /// Appends a NUL-terminated string in the requested encoding, returning
    /// the number of bytes consumed (alignment pad included).
    pub fn append_string(&mut self, text: &str, encoding: WireStr) -> crate::Result<usize> {
        match encoding {
            WireStr::Ascii => {
                let mut encoded = Vec::new();
                try_reserve(&mut encoded, text.len() + 1)?;
                encoded.extend_from_slice(text.as_bytes());
                encoded.push(0);
                self.append_bytes(&encoded)?;
                Ok(encoded.len())
            }
            WireStr::Unicode | WireStr::UnicodeUnaligned => {
                let mut written = 0;
                if encoding == WireStr::Unicode && self.bytes.len() % 2 == 1 {
                    self.append_bytes(&[0])?;
                    written += 1;
                }
                let mut encoded = Vec::new();
                try_reserve(&mut encoded, text.len() * 2 + 2)?;
                for unit in text.encode_utf16() {
                    encoded.extend_from_slice(&unit.to_le_bytes());
                }
                encoded.extend_from_slice(&[0, 0]);
                self.append_bytes(&encoded)?;
                Ok(written + encoded.len())
            }
        }
    }

    /// Starts a new command block chained after the current one.
    ///
    /// The current block must lead with the two AndX words (next command,
    /// reserved byte, next offset); they are rewritten to point at the new
    /// block. Must be called before the packet is sent.
    pub fn chain(&mut self, command: Command, word_count: u8, data_len: usize) -> crate::Result<()> {
        if self.words_len() < 4 {
            return Err(crate::Error::InvalidState(
                "Current block has no AndX words to chain from".into(),
            ));
        }
        let next_offset = self.bytes.len();
        if next_offset > u16::MAX as usize {
            return Err(crate::Error::InvalidMessage(format!(
                "Chain offset {} does not fit the AndX offset field",
                next_offset
            )));
        }
        self.put_word_u8(0, command as u8)?;
        self.put_word_u8(1, 0)?;
        self.put_word_u16(2, next_offset as u16)?;

        let block_size = 1 + word_count as usize * 2 + 2;
        try_reserve(&mut self.bytes, block_size + data_len)?;
        self.wct_at = self.bytes.len();
        self.bytes.push(word_count);
        self.bytes.resize(self.bytes.len() + word_count as usize * 2, 0);
        self.bcc_at = self.bytes.len();
        self.bytes.extend_from_slice(&[0, 0]);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn try_reserve(bytes: &mut Vec<u8>, additional: usize) -> crate::Result<()> {
    bytes
        .try_reserve(additional)
        .map_err(|_| crate::Error::AllocationFailed(additional))
}

/// A parsed incoming packet: raw bytes plus the decoded fixed header.
#[derive(Debug)]
pub struct ReceivedPacket {
    bytes: Vec<u8>,
    pub header: Header,
}

impl ReceivedPacket {
    /// Minimum plausible packet: fixed header + empty block.
    pub const MIN_SIZE: usize = Header::STRUCT_SIZE + 3;

    pub fn parse(bytes: Vec<u8>) -> crate::Result<ReceivedPacket> {
        if bytes.len() < Self::MIN_SIZE {
            return Err(crate::Error::InvalidMessage(format!(
                "Packet of {} bytes is shorter than a header and an empty block",
                bytes.len()
            )));
        }
        let header = Header::read_le(&mut Cursor::new(&bytes))?;
        Ok(ReceivedPacket { bytes, header })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The first (or only) command block of the packet.
    pub fn block(&self) -> crate::Result<Block<'_>> {
        self.block_at(Header::STRUCT_SIZE)
    }

    /// Parses a command block starting at the given absolute offset.
    fn block_at(&self, offset: usize) -> crate::Result<Block<'_>> {
        let oob = |length| crate::Error::OutOfBounds {
            offset,
            length,
            limit: self.bytes.len(),
        };
        if offset >= self.bytes.len() {
            return Err(oob(1));
        }
        let word_count = self.bytes[offset] as usize;
        let words_at = offset + 1;
        let bcc_at = words_at + word_count * 2;
        if bcc_at + 2 > self.bytes.len() {
            return Err(oob(1 + word_count * 2 + 2));
        }
        let data_len = u16::from_le_bytes([self.bytes[bcc_at], self.bytes[bcc_at + 1]]) as usize;
        let data_at = bcc_at + 2;
        if data_at + data_len > self.bytes.len() {
            return Err(oob(data_at + data_len - offset));
        }
        Ok(Block {
            offset,
            data_offset: data_at,
            words: &self.bytes[words_at..bcc_at],
            data: &self.bytes[data_at..data_at + data_len],
        })
    }

    /// Bounds-checked read of `length` bytes at an absolute `offset`, which
    /// must lie within the first block's data region. Both the offset and the
    /// length come off the wire, so wraparound is rejected explicitly.
    pub fn read_bounded(&self, offset: usize, length: usize) -> crate::Result<&[u8]> {
        let block = self.block()?;
        let data_start = block.data_offset;
        let data_end = data_start + block.data.len();
        let oob = crate::Error::OutOfBounds {
            offset,
            length,
            limit: data_end,
        };
        let end = offset.checked_add(length).ok_or(oob)?;
        if offset < data_start || end > data_end {
            return Err(crate::Error::OutOfBounds {
                offset,
                length,
                limit: data_end,
            });
        }
        Ok(&self.bytes[offset..end])
    }

    /// Walks the chained sub-replies of an AndX packet.
    pub fn chain(&self) -> ChainCursor<'_> {
        ChainCursor {
            packet: self,
            next: Some((self.header.command as u8, Header::STRUCT_SIZE)),
            last_offset: None,
        }
    }
}

/// One command block of an incoming packet.
#[derive(Debug)]
pub struct Block<'a> {
    /// Absolute offset of the block's word-count byte.
    pub offset: usize,
    /// Absolute offset of the block's first data byte.
    pub data_offset: usize,
    pub words: &'a [u8],
    pub data: &'a [u8],
}

impl Block<'_> {
    fn word_bytes(&self, offset: usize, width: usize) -> crate::Result<&[u8]> {
        let oob = crate::Error::OutOfBounds {
            offset,
            length: width,
            limit: self.words.len(),
        };
        let end = offset.checked_add(width).ok_or(oob)?;
        if end > self.words.len() {
            return Err(crate::Error::OutOfBounds {
                offset,
                length: width,
                limit: self.words.len(),
            });
        }
        Ok(&self.words[offset..end])
    }

    pub fn word_u8(&self, offset: usize) -> crate::Result<u8> {
        Ok(self.word_bytes(offset, 1)?[0])
    }

    pub fn word_u16(&self, offset: usize) -> crate::Result<u16> {
        let b = self.word_bytes(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn word_u32(&self, offset: usize) -> crate::Result<u32> {
        let b = self.word_bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// A sub-reply yielded while walking an AndX chain.
#[derive(Debug)]
pub struct ChainedBlock<'a> {
    pub command: u8,
    pub block: Block<'a>,
}

/// Cursor over the chained command blocks of a reply.
///
/// The chain is a linked list embedded in the flat buffer: each AndX block
/// names the next command and its absolute offset in its first two words, and
/// 0xFF terminates. Offsets must advance strictly forward, so a malicious
/// chain cannot loop.
pub struct ChainCursor<'a> {
    packet: &'a ReceivedPacket,
    next: Option<(u8, usize)>,
    last_offset: Option<usize>,
}

impl<'a> Iterator for ChainCursor<'a> {
    type Item = crate::Result<ChainedBlock<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (command, offset) = self.next.take()?;
        if let Some(last) = self.last_offset {
            if offset <= last {
                return Some(Err(crate::Error::InvalidMessage(format!(
                    "AndX chain offset {} does not advance past {}",
                    offset, last
                ))));
            }
        }
        let block = match self.packet.block_at(offset) {
            Ok(block) => block,
            Err(e) => return Some(Err(e)),
        };
        self.last_offset = Some(offset);
        if block.words.len() >= 4 {
            let next_command = block.words[0];
            let next_offset = u16::from_le_bytes([block.words[2], block.words[3]]) as usize;
            if next_command != Command::NoCommand as u8 {
                self.next = Some((next_command, next_offset));
            }
        }
        Some(Ok(ChainedBlock { command, block }))
    }
}
