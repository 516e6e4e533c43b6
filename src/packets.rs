//! Wire-format types for the SMB1/CIFS packet layer.

pub mod header;
pub mod netbios;
pub mod trans;
pub mod wire;
