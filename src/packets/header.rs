use std::io::Cursor;

use binrw::prelude::*;
use modular_bitfield::prelude::*;

/// SMB1 command codes handled by the engine.
///
/// Typed wrappers for further commands live outside the engine; anything the
/// engine only forwards is still represented here so replies parse.
#[derive(BinRead, BinWrite, Debug, PartialEq, Eq, Clone, Copy)]
#[brw(repr(u8))]
pub enum Command {
    Close = 0x04,
    LockingX = 0x24,
    Trans = 0x25,
    TransSecondary = 0x26,
    Echo = 0x2B,
    ReadX = 0x2E,
    WriteX = 0x2F,
    Trans2 = 0x32,
    Trans2Secondary = 0x33,
    TreeDisconnect = 0x71,
    Negotiate = 0x72,
    SessionSetupX = 0x73,
    TreeConnectX = 0x75,
    NtTrans = 0xA0,
    NtTransSecondary = 0xA1,
    NtCreateX = 0xA2,
    NtCancel = 0xA4,
    /// Chain terminator marker; never sent as a packet's own command.
    NoCommand = 0xFF,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message_as_string = match self {
            Command::Close => "Close",
            Command::LockingX => "Locking AndX",
            Command::Trans => "Transaction",
            Command::TransSecondary => "Transaction Secondary",
            Command::Echo => "Echo",
            Command::ReadX => "Read AndX",
            Command::WriteX => "Write AndX",
            Command::Trans2 => "Transaction2",
            Command::Trans2Secondary => "Transaction2 Secondary",
            Command::TreeDisconnect => "Tree Disconnect",
            Command::Negotiate => "Negotiate",
            Command::SessionSetupX => "Session Setup AndX",
            Command::TreeConnectX => "Tree Connect AndX",
            Command::NtTrans => "NT Transact",
            Command::NtTransSecondary => "NT Transact Secondary",
            Command::NtCreateX => "NT Create AndX",
            Command::NtCancel => "NT Cancel",
            Command::NoCommand => "No Command",
        };
        write!(f, "{} ({:#04x})", message_as_string, *self as u8)
    }
}

/// NT status codes the engine itself inspects.
#[binrw::binrw]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[brw(repr(u32))]
pub enum Status {
    Success = 0x00000000,
    Pending = 0x00000103,
    BufferOverflow = 0x80000005,
    NotImplemented = 0xC0000002,
    InvalidParameter = 0xC000000D,
    AccessDenied = 0xC0000022,
    BufferTooSmall = 0xC0000023,
    NotSupported = 0xC00000BB,
    Cancelled = 0xC0000120,
    InvalidSmb = 0x00010002,
}

impl Status {
    pub const U32_SUCCESS: u32 = 0x00000000;
    pub const U32_BUFFER_OVERFLOW: u32 = 0x80000005;
    pub const U32_CANCELLED: u32 = 0xC0000120;

    /// Tries converting a raw u32 to a known [`Status`] string; falls back
    /// to the hex representation for codes the engine does not name.
    pub fn try_display_as_status(value: u32) -> String {
        match Self::try_from(value) {
            Ok(status) => format!("{}", status),
            Err(_) => format!("{:#010x}", value),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message_as_string = match self {
            Status::Success => "Success",
            Status::Pending => "Pending",
            Status::BufferOverflow => "Buffer Overflow",
            Status::NotImplemented => "Not Implemented",
            Status::InvalidParameter => "Invalid Parameter",
            Status::AccessDenied => "Access Denied",
            Status::BufferTooSmall => "Buffer Too Small",
            Status::NotSupported => "Not Supported",
            Status::Cancelled => "Cancelled",
            Status::InvalidSmb => "Invalid SMB",
        };
        write!(f, "{} ({:#010x})", message_as_string, *self as u32)
    }
}

impl TryFrom<u32> for Status {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Status::read_le(&mut Cursor::new(value.to_le_bytes())).map_err(|_| {
            crate::Error::InvalidMessage(format!("NT status variant not found: {:#x}", value))
        })
    }
}

/// Fixed SMB1 packet header.
#[binrw::binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(magic(b"\xffSMB"), little)]
pub struct Header {
    pub command: Command,
    /// NT status. Use the [`Header::status()`] method to convert to a [`Status`].
    pub status: u32,
    pub flags: HeaderFlags,
    pub flags2: HeaderFlags2,
    pub pid_high: u16,
    /// Sequence number + MAC while signing is active, placeholder otherwise.
    pub signature: [u8; 8],
    pub tid: u16,
    pub pid: u16,
    pub uid: u16,
    pub mid: u16,
}

impl Header {
    pub const STRUCT_SIZE: usize = 30;
    /// Byte offset of the flags2 field within the serialized header.
    pub const FLAGS2_OFFSET: usize = 10;
    /// Byte offset of the signing field within the serialized header.
    pub const SIGNATURE_OFFSET: usize = 14;
    /// Byte offset of the MID field within the serialized header.
    pub const MID_OFFSET: usize = 28;

    pub fn new(command: Command) -> Header {
        Header {
            command,
            status: 0,
            flags: HeaderFlags::new()
                .with_caseless(true)
                .with_canonical_paths(true),
            flags2: HeaderFlags2::new().with_long_names(true).with_nt_status(true),
            pid_high: 0,
            signature: [0u8; 8],
            tid: 0,
            pid: 0,
            uid: 0,
            mid: 0,
        }
    }

    /// Tries to convert the [`Header::status`] field to a [`Status`],
    /// returning it, if successful.
    pub fn status(&self) -> crate::Result<Status> {
        self.status.try_into()
    }

    /// Serializes the header over the first [`Header::STRUCT_SIZE`] bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) -> crate::Result<()> {
        debug_assert!(buf.len() >= Self::STRUCT_SIZE);
        let mut cursor = Cursor::new(&mut buf[..Self::STRUCT_SIZE]);
        self.write(&mut cursor)?;
        Ok(())
    }
}

#[bitfield]
#[derive(BinWrite, BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[bw(map = |&x| Self::into_bytes(x))]
#[br(map = Self::from_bytes)]
pub struct HeaderFlags {
    pub lock_and_read: bool,
    pub receive_buffer_posted: bool,
    #[skip]
    __: B1,
    pub caseless: bool,
    pub canonical_paths: bool,
    pub oplock: bool,
    pub notify: bool,
    /// Set on server replies, clear on client requests.
    pub reply: bool,
}

#[bitfield]
#[derive(BinWrite, BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[bw(map = |&x| Self::into_bytes(x))]
#[br(map = Self::from_bytes)]
pub struct HeaderFlags2 {
    pub long_names: bool,
    pub extended_attributes: bool,
    #[skip]
    __: B4,
    pub long_names_used: bool,
    #[skip]
    __: B4,
    pub extended_security: bool,
    #[skip]
    __: B2,
    pub nt_status: bool,
    /// Bit 15: the packet carries a MAC in the signing field.
    pub signed: bool,
}
