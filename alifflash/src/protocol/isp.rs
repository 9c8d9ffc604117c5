//! SE-UART ISP frame codec.
//!
//! Every frame on the wire has the form:
//!
//! ```text
//! [length:u8][command:u8][payload:u8*][checksum:u8]
//! ```
//!
//! `length` is the size of the whole frame including the length byte itself,
//! and `checksum` makes the sum of all frame bytes zero modulo 256.
//!
//! Decoding is deliberately liberal: noise, short frames and timeouts all
//! come back as `None` instead of an error, because partial reads are routine
//! while the device is resetting.

use std::{
    fmt,
    time::{Duration, Instant},
};

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, trace};

use crate::{
    error::{Error, Result},
    port::{Port, read_with_deadline},
};

/// Bytes of framing around the payload (length, command, checksum).
pub const FRAME_OVERHEAD: usize = 3;

/// Largest payload a frame can carry given the one-byte length field.
pub const MAX_PAYLOAD: usize = u8::MAX as usize - FRAME_OVERHEAD;

/// Data bytes carried by one DOWNLOAD_DATA chunk.
pub const DATA_PER_CHUNK: usize = 240;

/// ISP command and response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    /// Enter ISP mode.
    StartIsp = 0x00,
    /// Leave ISP mode.
    StopIsp = 0x01,
    /// One sequenced chunk of image data.
    DownloadData = 0x04,
    /// End of a BURN_MRAM data stream.
    DownloadDone = 0x05,
    /// Open an MRAM write window (`address`, `size`).
    BurnMram = 0x08,
    /// Reset the device. Never acknowledged.
    Reset = 0x09,
    /// Query device state.
    Enquiry = 0x0F,
    /// Request maintenance mode on next boot.
    SetMaintenance = 0x16,
    /// Response carrying data.
    DataResponse = 0xFD,
    /// Plain acknowledge.
    Ack = 0xFE,
}

impl CommandId {
    /// Wire value.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::StartIsp),
            0x01 => Some(Self::StopIsp),
            0x04 => Some(Self::DownloadData),
            0x05 => Some(Self::DownloadDone),
            0x08 => Some(Self::BurnMram),
            0x09 => Some(Self::Reset),
            0x0F => Some(Self::Enquiry),
            0x16 => Some(Self::SetMaintenance),
            0xFD => Some(Self::DataResponse),
            0xFE => Some(Self::Ack),
            _ => None,
        }
    }

    /// Label used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::StartIsp => "START_ISP",
            Self::StopIsp => "STOP_ISP",
            Self::DownloadData => "DOWNLOAD_DATA",
            Self::DownloadDone => "DOWNLOAD_DONE",
            Self::BurnMram => "BURN_MRAM",
            Self::Reset => "RESET_DEVICE",
            Self::Enquiry => "ENQUIRY",
            Self::SetMaintenance => "SET_MAINTENANCE",
            Self::DataResponse => "DATA_RESP",
            Self::Ack => "ACK",
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Checksum byte that brings the sum of `bytes` to zero modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// ISP frame builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IspFrame {
    command: CommandId,
    payload: Vec<u8>,
}

impl IspFrame {
    /// Frame without payload.
    pub fn new(command: CommandId) -> Self {
        Self {
            command,
            payload: Vec::new(),
        }
    }

    /// Frame with an arbitrary payload.
    pub fn with_payload(command: CommandId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// BURN_MRAM window: little-endian address and size.
    pub fn burn_mram(address: u32, size: u32) -> Self {
        let mut payload = Vec::with_capacity(8);
        #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
        payload
            .write_u32::<LittleEndian>(address)
            .unwrap();
        #[allow(clippy::unwrap_used)]
        payload
            .write_u32::<LittleEndian>(size)
            .unwrap();
        Self::with_payload(CommandId::BurnMram, payload)
    }

    /// DOWNLOAD_DATA chunk: little-endian sequence number followed by data.
    pub fn download_data(sequence: u16, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(2 + data.len());
        #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
        payload
            .write_u16::<LittleEndian>(sequence)
            .unwrap();
        payload.extend_from_slice(data);
        Self::with_payload(CommandId::DownloadData, payload)
    }

    /// Command carried by this frame.
    pub fn command(&self) -> CommandId {
        self.command
    }

    /// Payload carried by this frame.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to wire bytes.
    pub fn build(&self) -> Result<Vec<u8>> {
        encode(self.command, &self.payload)
    }
}

/// Encode one frame. Fails only when `payload` cannot be represented.
pub fn encode(command: CommandId, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD above
    frame.push((payload.len() + FRAME_OVERHEAD) as u8);
    frame.push(command.code());
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    Ok(frame)
}

/// A decoded frame from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw command/response code.
    pub code: u8,
    /// Payload between the code and the checksum.
    pub payload: Vec<u8>,
}

impl Response {
    /// Code as a known command, if it is one.
    pub fn command(&self) -> Option<CommandId> {
        CommandId::from_code(self.code)
    }

    /// ACK or DATA_RESP.
    pub fn is_accepted(&self) -> bool {
        matches!(self.command(), Some(CommandId::Ack | CommandId::DataResponse))
    }

    /// Human-readable status in the form used by the exchange logs.
    pub fn status(&self) -> String {
        match self.command() {
            Some(CommandId::Ack) => "ACK".to_string(),
            Some(CommandId::DataResponse) => format!("DATA ({} bytes)", self.payload.len()),
            _ => format!("0x{:02X}", self.code),
        }
    }
}

/// Rebuild a response from its length byte and the bytes that followed it.
fn assemble(length: u8, rest: &[u8]) -> Option<Response> {
    if length < 2 {
        return None;
    }
    let expected = usize::from(length) - 1;
    if rest.len() < expected {
        trace!("short frame: expected {expected} bytes after length, got {}", rest.len());
        return None;
    }
    let rest = &rest[..expected];

    if rest.len() >= 2 && checksum(rest) != length {
        // Checksum is advisory on responses
        debug!("checksum mismatch in response frame {length:02X} {rest:02X?}");
    }

    let payload = if rest.len() > 2 {
        rest[1..rest.len() - 1].to_vec()
    } else {
        Vec::new()
    };
    Some(Response {
        code: rest[0],
        payload,
    })
}

/// Parse a complete frame held in memory.
pub fn parse_frame(bytes: &[u8]) -> Option<Response> {
    let (&length, rest) = bytes.split_first()?;
    assemble(length, rest)
}

/// Read one frame from `port` within `timeout`.
///
/// Returns `None` for an empty line, a length byte below 2, or a frame that
/// does not arrive completely before the deadline.
pub fn decode<P: Port + ?Sized>(port: &mut P, timeout: Duration) -> Option<Response> {
    let deadline = Instant::now() + timeout;

    let header = read_with_deadline(port, 1, timeout);
    let &length = header.first()?;
    if length < 2 {
        return None;
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    let rest = read_with_deadline(port, usize::from(length) - 1, remaining);
    let response = assemble(length, &rest);
    trace!("<- {length:02X} {rest:02X?}");
    response
}
