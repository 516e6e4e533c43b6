//! Field codecs for the three transaction command families.
//!
//! Trans and Trans2 carry 16-bit counts and offsets; NT Transact carries the
//! same shape widened to 32 bits. All offsets are absolute from the start of
//! the fixed header. The codecs read and write the word region of an already
//! allocated block; region payloads are placed by the transaction engine.

use super::header::Command;
use super::wire::{Block, WireBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransFamily {
    Trans,
    Trans2,
    NtTrans,
}

impl TransFamily {
    pub fn primary_command(&self) -> Command {
        match self {
            TransFamily::Trans => Command::Trans,
            TransFamily::Trans2 => Command::Trans2,
            TransFamily::NtTrans => Command::NtTrans,
        }
    }

    pub fn secondary_command(&self) -> Command {
        match self {
            TransFamily::Trans => Command::TransSecondary,
            TransFamily::Trans2 => Command::Trans2Secondary,
            TransFamily::NtTrans => Command::NtTransSecondary,
        }
    }

    /// The family whose primary command this is, if any.
    pub fn of_command(command: Command) -> Option<TransFamily> {
        match command {
            Command::Trans => Some(TransFamily::Trans),
            Command::Trans2 => Some(TransFamily::Trans2),
            Command::NtTrans => Some(TransFamily::NtTrans),
            _ => None,
        }
    }

    /// Whether counts, offsets and displacements are 32-bit on the wire.
    pub fn is_wide(&self) -> bool {
        matches!(self, TransFamily::NtTrans)
    }

    pub fn primary_word_count(&self, setup_count: usize) -> u8 {
        match self {
            TransFamily::Trans | TransFamily::Trans2 => 14 + setup_count as u8,
            TransFamily::NtTrans => 19 + setup_count as u8,
        }
    }

    pub fn secondary_word_count(&self) -> u8 {
        match self {
            TransFamily::Trans => 8,
            TransFamily::Trans2 => 9,
            TransFamily::NtTrans => 18,
        }
    }

    pub fn reply_word_count(&self, setup_count: usize) -> u8 {
        match self {
            TransFamily::Trans | TransFamily::Trans2 => 10 + setup_count as u8,
            TransFamily::NtTrans => 18 + setup_count as u8,
        }
    }
}

impl std::fmt::Display for TransFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransFamily::Trans => write!(f, "Transaction"),
            TransFamily::Trans2 => write!(f, "Transaction2"),
            TransFamily::NtTrans => write!(f, "NT Transact"),
        }
    }
}

fn narrow(value: u32, what: &str) -> crate::Result<u16> {
    u16::try_from(value).map_err(|_| {
        crate::Error::InvalidMessage(format!("{} of {} exceeds its 16-bit field", what, value))
    })
}

/// Fixed fields of a primary transaction request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryFields {
    pub total_param: u32,
    pub total_data: u32,
    pub max_param: u32,
    pub max_data: u32,
    pub max_setup: u8,
    pub flags: u16,
    pub timeout: u32,
    /// NT Transact function code; unused by the narrow families.
    pub function: u16,
    pub this_param: u32,
    pub param_offset: u32,
    pub this_data: u32,
    pub data_offset: u32,
}

pub fn write_primary(
    buf: &mut WireBuf,
    family: TransFamily,
    fields: &PrimaryFields,
    setup: &[u16],
) -> crate::Result<()> {
    if family.is_wide() {
        buf.put_word_u8(0, fields.max_setup)?;
        buf.put_word_u32(3, fields.total_param)?;
        buf.put_word_u32(7, fields.total_data)?;
        buf.put_word_u32(11, fields.max_param)?;
        buf.put_word_u32(15, fields.max_data)?;
        buf.put_word_u32(19, fields.this_param)?;
        buf.put_word_u32(23, fields.param_offset)?;
        buf.put_word_u32(27, fields.this_data)?;
        buf.put_word_u32(31, fields.data_offset)?;
        buf.put_word_u8(35, setup.len() as u8)?;
        buf.put_word_u16(36, fields.function)?;
        for (i, word) in setup.iter().enumerate() {
            buf.put_word_u16(38 + i * 2, *word)?;
        }
    } else {
        buf.put_word_u16(0, narrow(fields.total_param, "Total parameter count")?)?;
        buf.put_word_u16(2, narrow(fields.total_data, "Total data count")?)?;
        buf.put_word_u16(4, narrow(fields.max_param, "Max parameter count")?)?;
        buf.put_word_u16(6, narrow(fields.max_data, "Max data count")?)?;
        buf.put_word_u8(8, fields.max_setup)?;
        buf.put_word_u16(10, fields.flags)?;
        buf.put_word_u32(12, fields.timeout)?;
        buf.put_word_u16(18, narrow(fields.this_param, "Parameter count")?)?;
        buf.put_word_u16(20, narrow(fields.param_offset, "Parameter offset")?)?;
        buf.put_word_u16(22, narrow(fields.this_data, "Data count")?)?;
        buf.put_word_u16(24, narrow(fields.data_offset, "Data offset")?)?;
        buf.put_word_u8(26, setup.len() as u8)?;
        for (i, word) in setup.iter().enumerate() {
            buf.put_word_u16(28 + i * 2, *word)?;
        }
    }
    Ok(())
}

pub fn read_primary(
    block: &Block<'_>,
    family: TransFamily,
) -> crate::Result<(PrimaryFields, Vec<u16>)> {
    let mut fields = PrimaryFields::default();
    let setup_count;
    if family.is_wide() {
        fields.max_setup = block.word_u8(0)?;
        fields.total_param = block.word_u32(3)?;
        fields.total_data = block.word_u32(7)?;
        fields.max_param = block.word_u32(11)?;
        fields.max_data = block.word_u32(15)?;
        fields.this_param = block.word_u32(19)?;
        fields.param_offset = block.word_u32(23)?;
        fields.this_data = block.word_u32(27)?;
        fields.data_offset = block.word_u32(31)?;
        setup_count = block.word_u8(35)? as usize;
        fields.function = block.word_u16(36)?;
        let mut setup = Vec::with_capacity(setup_count);
        for i in 0..setup_count {
            setup.push(block.word_u16(38 + i * 2)?);
        }
        Ok((fields, setup))
    } else {
        fields.total_param = block.word_u16(0)? as u32;
        fields.total_data = block.word_u16(2)? as u32;
        fields.max_param = block.word_u16(4)? as u32;
        fields.max_data = block.word_u16(6)? as u32;
        fields.max_setup = block.word_u8(8)?;
        fields.flags = block.word_u16(10)?;
        fields.timeout = block.word_u32(12)?;
        fields.this_param = block.word_u16(18)? as u32;
        fields.param_offset = block.word_u16(20)? as u32;
        fields.this_data = block.word_u16(22)? as u32;
        fields.data_offset = block.word_u16(24)? as u32;
        setup_count = block.word_u8(26)? as usize;
        let mut setup = Vec::with_capacity(setup_count);
        for i in 0..setup_count {
            setup.push(block.word_u16(28 + i * 2)?);
        }
        Ok((fields, setup))
    }
}

/// Fixed fields of a secondary (continuation) request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecondaryFields {
    pub total_param: u32,
    pub total_data: u32,
    pub this_param: u32,
    pub param_offset: u32,
    pub param_disp: u32,
    pub this_data: u32,
    pub data_offset: u32,
    pub data_disp: u32,
    /// Trans2 continuations carry the fid of the operation; ignored elsewhere.
    pub fid: u16,
}

pub fn write_secondary(
    buf: &mut WireBuf,
    family: TransFamily,
    fields: &SecondaryFields,
) -> crate::Result<()> {
    if family.is_wide() {
        buf.put_word_u32(3, fields.total_param)?;
        buf.put_word_u32(7, fields.total_data)?;
        buf.put_word_u32(11, fields.this_param)?;
        buf.put_word_u32(15, fields.param_offset)?;
        buf.put_word_u32(19, fields.param_disp)?;
        buf.put_word_u32(23, fields.this_data)?;
        buf.put_word_u32(27, fields.data_offset)?;
        buf.put_word_u32(31, fields.data_disp)?;
    } else {
        buf.put_word_u16(0, narrow(fields.total_param, "Total parameter count")?)?;
        buf.put_word_u16(2, narrow(fields.total_data, "Total data count")?)?;
        buf.put_word_u16(4, narrow(fields.this_param, "Parameter count")?)?;
        buf.put_word_u16(6, narrow(fields.param_offset, "Parameter offset")?)?;
        buf.put_word_u16(8, narrow(fields.param_disp, "Parameter displacement")?)?;
        buf.put_word_u16(10, narrow(fields.this_data, "Data count")?)?;
        buf.put_word_u16(12, narrow(fields.data_offset, "Data offset")?)?;
        buf.put_word_u16(14, narrow(fields.data_disp, "Data displacement")?)?;
        if family == TransFamily::Trans2 {
            buf.put_word_u16(16, fields.fid)?;
        }
    }
    Ok(())
}

pub fn read_secondary(block: &Block<'_>, family: TransFamily) -> crate::Result<SecondaryFields> {
    let mut fields = SecondaryFields::default();
    if family.is_wide() {
        fields.total_param = block.word_u32(3)?;
        fields.total_data = block.word_u32(7)?;
        fields.this_param = block.word_u32(11)?;
        fields.param_offset = block.word_u32(15)?;
        fields.param_disp = block.word_u32(19)?;
        fields.this_data = block.word_u32(23)?;
        fields.data_offset = block.word_u32(27)?;
        fields.data_disp = block.word_u32(31)?;
    } else {
        fields.total_param = block.word_u16(0)? as u32;
        fields.total_data = block.word_u16(2)? as u32;
        fields.this_param = block.word_u16(4)? as u32;
        fields.param_offset = block.word_u16(6)? as u32;
        fields.param_disp = block.word_u16(8)? as u32;
        fields.this_data = block.word_u16(10)? as u32;
        fields.data_offset = block.word_u16(12)? as u32;
        fields.data_disp = block.word_u16(14)? as u32;
        if family == TransFamily::Trans2 {
            fields.fid = block.word_u16(16)?;
        }
    }
    Ok(fields)
}

/// Fixed fields of a reply fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyFields {
    pub total_param: u32,
    pub total_data: u32,
    pub this_param: u32,
    pub param_offset: u32,
    pub param_disp: u32,
    pub this_data: u32,
    pub data_offset: u32,
    pub data_disp: u32,
}

pub fn write_reply(
    buf: &mut WireBuf,
    family: TransFamily,
    fields: &ReplyFields,
    setup: &[u16],
) -> crate::Result<()> {
    if family.is_wide() {
        buf.put_word_u32(3, fields.total_param)?;
        buf.put_word_u32(7, fields.total_data)?;
        buf.put_word_u32(11, fields.this_param)?;
        buf.put_word_u32(15, fields.param_offset)?;
        buf.put_word_u32(19, fields.param_disp)?;
        buf.put_word_u32(23, fields.this_data)?;
        buf.put_word_u32(27, fields.data_offset)?;
        buf.put_word_u32(31, fields.data_disp)?;
        buf.put_word_u8(35, setup.len() as u8)?;
        for (i, word) in setup.iter().enumerate() {
            buf.put_word_u16(36 + i * 2, *word)?;
        }
    } else {
        buf.put_word_u16(0, narrow(fields.total_param, "Total parameter count")?)?;
        buf.put_word_u16(2, narrow(fields.total_data, "Total data count")?)?;
        buf.put_word_u16(6, narrow(fields.this_param, "Parameter count")?)?;
        buf.put_word_u16(8, narrow(fields.param_offset, "Parameter offset")?)?;
        buf.put_word_u16(10, narrow(fields.param_disp, "Parameter displacement")?)?;
        buf.put_word_u16(12, narrow(fields.this_data, "Data count")?)?;
        buf.put_word_u16(14, narrow(fields.data_offset, "Data offset")?)?;
        buf.put_word_u16(16, narrow(fields.data_disp, "Data displacement")?)?;
        buf.put_word_u8(18, setup.len() as u8)?;
        for (i, word) in setup.iter().enumerate() {
            buf.put_word_u16(20 + i * 2, *word)?;
        }
    }
    Ok(())
}

pub fn read_reply(block: &Block<'_>, family: TransFamily) -> crate::Result<(ReplyFields, Vec<u16>)> {
    let mut fields = ReplyFields::default();
    let setup_count;
    let setup_at;
    if family.is_wide() {
        fields.total_param = block.word_u32(3)?;
        fields.total_data = block.word_u32(7)?;
        fields.this_param = block.word_u32(11)?;
        fields.param_offset = block.word_u32(15)?;
        fields.param_disp = block.word_u32(19)?;
        fields.this_data = block.word_u32(23)?;
        fields.data_offset = block.word_u32(27)?;
        fields.data_disp = block.word_u32(31)?;
        setup_count = block.word_u8(35)? as usize;
        setup_at = 36;
    } else {
        fields.total_param = block.word_u16(0)? as u32;
        fields.total_data = block.word_u16(2)? as u32;
        fields.this_param = block.word_u16(6)? as u32;
        fields.param_offset = block.word_u16(8)? as u32;
        fields.param_disp = block.word_u16(10)? as u32;
        fields.this_data = block.word_u16(12)? as u32;
        fields.data_offset = block.word_u16(14)? as u32;
        fields.data_disp = block.word_u16(16)? as u32;
        setup_count = block.word_u8(18)? as usize;
        setup_at = 20;
    }
    let mut setup = Vec::with_capacity(setup_count);
    for i in 0..setup_count {
        setup.push(block.word_u16(setup_at + i * 2)?);
    }
    Ok((fields, setup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::wire::ReceivedPacket;

    fn roundtrip_primary(family: TransFamily) {
        let setup = [0x0001u16, 0x0A0B];
        let fields = PrimaryFields {
            total_param: 40000,
            total_data: 12345,
            max_param: 1024,
            max_data: 65000,
            max_setup: 4,
            flags: if family.is_wide() { 0 } else { 0x0002 },
            timeout: if family.is_wide() { 0 } else { 5000 },
            function: if family.is_wide() { 0x0004 } else { 0 },
            this_param: 3000,
            param_offset: 72,
            this_data: 1200,
            data_offset: 3072,
        };
        let mut buf = WireBuf::allocate(
            family.primary_command(),
            family.primary_word_count(setup.len()),
            0,
        )
        .unwrap();
        write_primary(&mut buf, family, &fields, &setup).unwrap();

        let pkt = ReceivedPacket::parse(buf.into_bytes()).unwrap();
        let (parsed, parsed_setup) = read_primary(&pkt.block().unwrap(), family).unwrap();
        assert_eq!(parsed, fields);
        assert_eq!(parsed_setup, setup);
    }

    #[test]
    fn test_primary_roundtrip_all_families() {
        roundtrip_primary(TransFamily::Trans);
        roundtrip_primary(TransFamily::Trans2);
        roundtrip_primary(TransFamily::NtTrans);
    }

    fn roundtrip_secondary(family: TransFamily) {
        let fields = SecondaryFields {
            total_param: 40000,
            total_data: 500,
            this_param: 4000,
            param_offset: 66,
            param_disp: 36000,
            this_data: 0,
            data_offset: 0,
            data_disp: 500,
            fid: if family == TransFamily::Trans2 { 0x1234 } else { 0 },
        };
        let mut buf = WireBuf::allocate(
            family.secondary_command(),
            family.secondary_word_count(),
            0,
        )
        .unwrap();
        write_secondary(&mut buf, family, &fields).unwrap();

        let pkt = ReceivedPacket::parse(buf.into_bytes()).unwrap();
        let parsed = read_secondary(&pkt.block().unwrap(), family).unwrap();
        assert_eq!(parsed, fields);
    }

    #[test]
    fn test_secondary_roundtrip_all_families() {
        roundtrip_secondary(TransFamily::Trans);
        roundtrip_secondary(TransFamily::Trans2);
        roundtrip_secondary(TransFamily::NtTrans);
    }

    fn roundtrip_reply(family: TransFamily) {
        let setup = [0xBEEFu16];
        let fields = ReplyFields {
            total_param: 64,
            total_data: 40000,
            this_param: 64,
            param_offset: 56,
            param_disp: 0,
            this_data: 4000,
            data_offset: 120,
            data_disp: 8000,
        };
        let mut buf = WireBuf::allocate(
            family.primary_command(),
            family.reply_word_count(setup.len()),
            0,
        )
        .unwrap();
        write_reply(&mut buf, family, &fields, &setup).unwrap();

        let pkt = ReceivedPacket::parse(buf.into_bytes()).unwrap();
        let (parsed, parsed_setup) = read_reply(&pkt.block().unwrap(), family).unwrap();
        assert_eq!(parsed, fields);
        assert_eq!(parsed_setup, setup);
    }

    #[test]
    fn test_reply_roundtrip_all_families() {
        roundtrip_reply(TransFamily::Trans);
        roundtrip_reply(TransFamily::Trans2);
        roundtrip_reply(TransFamily::NtTrans);
    }

    #[test]
    fn test_narrow_field_overflow_rejected() {
        let fields = ReplyFields {
            total_data: 70000,
            ..Default::default()
        };
        let mut buf = WireBuf::allocate(
            Command::Trans2,
            TransFamily::Trans2.reply_word_count(0),
            0,
        )
        .unwrap();
        assert!(write_reply(&mut buf, TransFamily::Trans2, &fields, &[]).is_err());
    }
}
