//! Packet signing engine.
//!
//! Once a session has negotiated signing, every packet carries an 8-byte MAC
//! in the header's signing field: the first 8 bytes of `MD5(key ∥ packet)`,
//! where the packet's signing field holds the 32-bit sequence number followed
//! by 4 zero bytes during the computation. The engine owns the per-connection
//! sequence counter and the signing-state transitions.

use md5::{Digest, Md5};

use crate::packets::header::Header;

/// Placeholder written into the signing field before real signing starts.
/// A historical compatibility stub; it protects nothing.
pub const FIXED_TOKEN: [u8; 8] = *b"BSRSPYL ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningState {
    Off,
    FixedToken,
    Active,
}

/// Per-connection signing state. Mutated only by the connection's event loop.
#[derive(Debug)]
pub struct SigningContext {
    state: SigningState,
    mac_key: Vec<u8>,
    next_seq: u32,
    /// Whether a correctly signed reply has ever been verified on this
    /// connection. Before that, a bad MAC downgrades to `Off` instead of
    /// failing, to interoperate with peers that negotiate signing and then
    /// do not sign.
    trusted: bool,
}

impl SigningContext {
    pub fn new() -> SigningContext {
        SigningContext {
            state: SigningState::Off,
            mac_key: Vec::new(),
            next_seq: 0,
            trusted: false,
        }
    }

    pub fn state(&self) -> SigningState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SigningState::Active
    }

    /// Sequence number the next signed packet will consume. Diagnostic.
    pub fn next_sequence(&self) -> u32 {
        self.next_seq
    }

    /// Switches to the compatibility placeholder used during session setup.
    pub fn set_fixed_token(&mut self) -> crate::Result<()> {
        if self.state == SigningState::Active {
            return Err(crate::Error::InvalidState(
                "Signing is already active".into(),
            ));
        }
        self.state = SigningState::FixedToken;
        Ok(())
    }

    /// Activates signing with a MAC key derived from the session key and,
    /// where the authentication scheme provides one, the response blob.
    ///
    /// The first data request after session setup owns sequence numbers 0-1,
    /// so the counter starts at 2.
    pub fn begin_signing(&mut self, session_key: &[u8], response: &[u8]) -> crate::Result<()> {
        if self.state == SigningState::Active {
            return Err(crate::Error::InvalidState(
                "Signing is already active".into(),
            ));
        }
        let mut mac_key = Vec::new();
        mac_key
            .try_reserve(session_key.len() + response.len())
            .map_err(|_| crate::Error::AllocationFailed(session_key.len() + response.len()))?;
        mac_key.extend_from_slice(session_key);
        mac_key.extend_from_slice(response);
        self.mac_key = mac_key;
        self.next_seq = 2;
        self.trusted = false;
        self.state = SigningState::Active;
        log::debug!("Packet signing activated ({} byte MAC key).", self.mac_key.len());
        Ok(())
    }

    /// Zeroes and releases the MAC key and turns signing off.
    pub fn disable(&mut self) {
        self.mac_key.iter_mut().for_each(|b| *b = 0);
        self.mac_key = Vec::new();
        self.state = SigningState::Off;
    }

    /// Allocates the sequence number for a packet about to hit the wire.
    ///
    /// A signed request consumes two numbers (one for itself, one reserved
    /// for its reply); a one-way request consumes exactly one. Returns `None`
    /// when signing is not active.
    pub fn seq_alloc(&mut self, one_way: bool) -> Option<u32> {
        if self.state != SigningState::Active {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += if one_way { 1 } else { 2 };
        Some(seq)
    }

    /// Signs an outgoing packet in place.
    pub fn sign(&mut self, bytes: &mut [u8], seq: Option<u32>) -> crate::Result<()> {
        match self.state {
            SigningState::Off => Ok(()),
            SigningState::FixedToken => {
                field_mut(bytes)?.copy_from_slice(&FIXED_TOKEN);
                Ok(())
            }
            SigningState::Active => {
                let seq = seq.ok_or_else(|| {
                    crate::Error::InvalidState("Signing active but no sequence allocated".into())
                })?;
                // The signed bit is part of the MAC'd bytes, so set it first.
                if bytes.len() < Header::STRUCT_SIZE {
                    return Err(crate::Error::InvalidMessage(
                        "Packet too short to sign".into(),
                    ));
                }
                bytes[Header::FLAGS2_OFFSET + 1] |= 0x80;
                let mac = packet_mac(&self.mac_key, bytes, seq);
                field_mut(bytes)?.copy_from_slice(&mac);
                log::trace!("Signed packet with sequence {}.", seq);
                Ok(())
            }
        }
    }

    /// Verifies an incoming packet against the sequence number reserved for
    /// it at send time.
    ///
    /// A mismatch before the first verified reply silently disables signing;
    /// after it, a mismatch is a hard protocol violation and the caller must
    /// tear the connection down.
    pub fn verify(&mut self, bytes: &[u8], expected_seq: Option<u32>) -> crate::Result<()> {
        if self.state != SigningState::Active {
            return Ok(());
        }
        let Some(seq) = expected_seq else {
            return Ok(());
        };
        if bytes.len() < Header::STRUCT_SIZE {
            return Err(crate::Error::InvalidMessage(
                "Packet too short to verify".into(),
            ));
        }
        let stored = &bytes[Header::SIGNATURE_OFFSET..Header::SIGNATURE_OFFSET + 8];
        let expected = packet_mac(&self.mac_key, bytes, seq);
        if stored == expected {
            self.trusted = true;
            log::trace!("Verified packet signature (sequence {}).", seq);
            return Ok(());
        }
        if !self.trusted {
            log::warn!(
                "Bad MAC on sequence {} before any verified reply; disabling signing.",
                seq
            );
            self.disable();
            return Ok(());
        }
        log::error!("Bad MAC on sequence {} from a trusted peer.", seq);
        Err(crate::Error::SignatureInvalid)
    }
}

impl Default for SigningContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SigningContext {
    fn drop(&mut self) {
        self.mac_key.iter_mut().for_each(|b| *b = 0);
    }
}

fn field_mut(bytes: &mut [u8]) -> crate::Result<&mut [u8]> {
    if bytes.len() < Header::STRUCT_SIZE {
        return Err(crate::Error::InvalidMessage(
            "Packet too short to sign".into(),
        ));
    }
    Ok(&mut bytes[Header::SIGNATURE_OFFSET..Header::SIGNATURE_OFFSET + 8])
}

/// `MD5(key ∥ packet)` with the signing field replaced by the sequence
/// number and 4 zero bytes, truncated to 8 bytes.
fn packet_mac(key: &[u8], bytes: &[u8], seq: u32) -> [u8; 8] {
    let mut md5 = Md5::new();
    md5.update(key);
    md5.update(&bytes[..Header::SIGNATURE_OFFSET]);
    md5.update(seq.to_le_bytes());
    md5.update([0u8; 4]);
    md5.update(&bytes[Header::SIGNATURE_OFFSET + 8..]);
    let digest = md5.finalize();
    let mut mac = [0u8; 8];
    mac.copy_from_slice(&digest[..8]);
    mac
}
