//! frame.rs
//! MSP frame model and the encoder for both wire versions.
//!
//! Wire layout:
//! ```text
//! legacy   : '$' 'M' dir  len  cmd  [jlo jhi]  payload  xor
//! extended : '$' 'X' dir  flag clo chi llo lhi payload  crc8
//! ```
//! A legacy `len` of 0xFF escapes to the 16-bit jumbo length that follows
//! the command byte. The legacy XOR covers every byte after `dir` up to the
//! payload end, exactly as transmitted (escape byte and jumbo length included).
//! The extended CRC-8/DVB-S2 covers `flag` through the payload.

use crate::error::{Result, SitlError};
use crate::msp::crc::{crc8_dvb_s2_update, xor_update};

/// Payload ceiling for both versions; longer frames are abandoned.
pub const MSP_MAX_PAYLOAD: usize = 1024;

/// Legacy length byte announcing a jumbo frame.
pub const JUMBO_ESCAPE: u8 = 0xFF;

pub const SYNC_BYTE: u8 = b'$';

/// Size of the receiver configuration block exchanged by `RX_CONFIG`.
pub const RX_CONFIG_SIZE: usize = 24;

/// Command codes understood by the proxy.
pub mod command {
    pub const RX_CONFIG: u16 = 44;
    pub const SET_RX_CONFIG: u16 = 45;
    pub const RC: u16 = 105;
    pub const ANALOG: u16 = 110;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MspVersion {
    /// `$M`: one-byte command, XOR checksum.
    V1,
    /// `$X`: 16-bit command and length, CRC-8/DVB-S2.
    V2,
}

impl MspVersion {
    pub fn from_sync(byte: u8) -> Option<Self> {
        match byte {
            b'M' => Some(Self::V1),
            b'X' => Some(Self::V2),
            _ => None,
        }
    }

    pub fn sync_byte(self) -> u8 {
        match self {
            Self::V1 => b'M',
            Self::V2 => b'X',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `<`: request towards the flight controller.
    ToDevice,
    /// `>`: reply from the flight controller.
    FromDevice,
    /// `!`: the flight controller rejected the command.
    Error,
}

impl Direction {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'<' => Some(Self::ToDevice),
            b'>' => Some(Self::FromDevice),
            b'!' => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::ToDevice => b'<',
            Self::FromDevice => b'>',
            Self::Error => b'!',
        }
    }
}

/// A fully received (checksum-verified) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspFrame {
    pub version: MspVersion,
    pub direction: Direction,
    /// Extended-version flag byte; always 0 for legacy frames.
    pub flags: u8,
    pub command: u16,
    pub payload: Vec<u8>,
}

impl MspFrame {
    /// Re-encode this frame in its own wire version.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self.version {
            MspVersion::V1 => encode_v1(self.direction, self.command as u8, &self.payload),
            MspVersion::V2 => encode_v2(self.direction, self.flags, self.command, &self.payload),
        }
    }

    /// Little-endian u16 at `offset`, if the payload is long enough.
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.payload.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

/// Payload length as it goes on the wire; anything the decoder would drop is refused.
fn wire_len(payload: &[u8]) -> Result<u16> {
    if payload.len() > MSP_MAX_PAYLOAD {
        return Err(SitlError::Protocol(format!(
            "payload of {} bytes exceeds {}",
            payload.len(),
            MSP_MAX_PAYLOAD
        )));
    }
    Ok(payload.len() as u16)
}

/// Header bytes covered by the legacy checksum, as they go on the wire.
fn v1_header(command: u8, len: u16) -> Vec<u8> {
    if len < u16::from(JUMBO_ESCAPE) {
        vec![len as u8, command]
    } else {
        let jumbo = len.to_le_bytes();
        vec![JUMBO_ESCAPE, command, jumbo[0], jumbo[1]]
    }
}

/// Encode a legacy `$M` frame. Payloads of 255 bytes or more use the jumbo length.
pub fn encode_v1(direction: Direction, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let header = v1_header(command, wire_len(payload)?);
    let mut out = Vec::with_capacity(3 + header.len() + payload.len() + 1);
    out.extend_from_slice(&[SYNC_BYTE, MspVersion::V1.sync_byte(), direction.as_byte()]);
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    // XOR of the transmitted header bytes and the payload
    out.push(xor_update(xor_update(0, &header), payload));
    Ok(out)
}

/// Encode an extended `$X` frame.
pub fn encode_v2(direction: Direction, flags: u8, command: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let cmd = command.to_le_bytes();
    let len = wire_len(payload)?.to_le_bytes();
    let header = [flags, cmd[0], cmd[1], len[0], len[1]];
    let mut out = Vec::with_capacity(9 + payload.len());
    out.extend_from_slice(&[SYNC_BYTE, MspVersion::V2.sync_byte(), direction.as_byte()]);
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    out.push(crc8_dvb_s2_update(crc8_dvb_s2_update(0, &header), payload));
    Ok(out)
}

/// Host-to-device request as sent by the proxy (always extended framing).
pub fn encode_request(command: u16, payload: &[u8]) -> Result<Vec<u8>> {
    encode_v2(Direction::ToDevice, 0, command, payload)
}
