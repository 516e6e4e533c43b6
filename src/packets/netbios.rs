//! NetBIOS session service stream framing.
//!
//! Every SMB packet travels inside a session-message frame: a type byte, a
//! flags byte whose low bit extends the length field, and a 16-bit big-endian
//! length. Only the frame types the engine reacts to are modeled.

use binrw::prelude::*;

#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(big)]
pub struct FrameHeader {
    pub ptype: FrameType,
    #[br(assert(flags & !0x01 == 0))]
    pub flags: u8,
    pub length: u16,
}

impl FrameHeader {
    /// Size of the frame header in bytes.
    pub const SIZE: usize = 4;
    /// Largest payload expressible with the length-extension flag bit.
    pub const MAX_PAYLOAD: usize = (1 << 17) - 1;

    pub fn session_message(payload_len: usize) -> crate::Result<FrameHeader> {
        if payload_len > Self::MAX_PAYLOAD {
            return Err(crate::Error::InvalidMessage(format!(
                "Payload of {} bytes does not fit a session message frame",
                payload_len
            )));
        }
        Ok(FrameHeader {
            ptype: FrameType::SessionMessage,
            flags: (payload_len >> 16) as u8,
            length: (payload_len & 0xFFFF) as u16,
        })
    }

    /// Declared payload length, including the extension bit.
    pub fn payload_len(&self) -> usize {
        ((self.flags as usize & 1) << 16) | self.length as usize
    }
}

#[binrw::binrw]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[brw(repr(u8))]
pub enum FrameType {
    SessionMessage = 0x00,
    SessionKeepAlive = 0x85,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_header_write() {
        let header = FrameHeader::session_message(0x1_0203).unwrap();
        let mut buf = Vec::new();
        header.write(&mut Cursor::new(&mut buf)).unwrap();
        assert_eq!(buf, [0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_frame_header_read() {
        let data = [0x00u8, 0x01, 0x00, 0x10];
        let header = FrameHeader::read(&mut Cursor::new(&data)).unwrap();
        assert_eq!(header.ptype, FrameType::SessionMessage);
        assert_eq!(header.payload_len(), 0x1_0010);
    }

    #[test]
    fn test_frame_header_keepalive() {
        let data = [0x85u8, 0x00, 0x00, 0x00];
        let header = FrameHeader::read(&mut Cursor::new(&data)).unwrap();
        assert_eq!(header.ptype, FrameType::SessionKeepAlive);
        assert_eq!(header.payload_len(), 0);
    }

    #[test]
    fn test_frame_header_oversized_payload() {
        assert!(FrameHeader::session_message(1 << 17).is_err());
    }
}
