//! Frame Protocol
//!
//! Binary sub-protocol used for chunked transfers over the frame protocol
//! service, plus the GATT layout both services are addressed by.

use crate::domain::models::TransferKind;
use crate::domain::settings::Settings;
use crate::error::FrameError;
use anyhow::{Context, Result};
use uuid::Uuid;

/// Simple command service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe2_0000_1000_8000_00805f9b34fb);
pub const DOCUMENT_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe3_0000_1000_8000_00805f9b34fb);

/// Frame protocol service
pub const FRAME_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001100_d102_11e1_9b23_00025b00a5a5);
pub const FRAME_COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x00001101_d102_11e1_9b23_00025b00a5a5);
pub const FRAME_RESPONSE_CHAR_UUID: Uuid = Uuid::from_u128(0x00001102_d102_11e1_9b23_00025b00a5a5);
pub const FRAME_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x00001103_d102_11e1_9b23_00025b00a5a5);

/// First byte of every frame
pub const START_MARKER: u8 = 0x10;

/// Frame header length: marker, command, two length/status bytes
pub const HEADER_LEN: usize = 4;

/// Status byte value reported for a successful command
pub const STATUS_SUCCESS: u8 = 0x00;

/// Frame protocol command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    /// Open a transfer session; payload carries metadata
    StartTransfer,
    /// One chunk of the transfer payload
    Chunk,
}

impl CommandCode {
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::StartTransfer => 0x46,
            Self::Chunk => 0x47,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x46 => Some(Self::StartTransfer),
            0x47 => Some(Self::Chunk),
            _ => None,
        }
    }
}

/// Encode an outgoing frame
///
/// # Frame Structure
///
/// ```text
/// [0]     : Start marker (0x10)
/// [1]     : Command code
/// [2-3]   : Payload length (u16 little-endian)
/// [4..]   : Payload
/// ```
pub fn encode(command: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length =
        u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(START_MARKER);
    frame.push(command);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decoded frame from the data characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub command: u8,
    pub payload: Vec<u8>,
}

/// Decode a frame whose bytes 2-3 carry the payload length.
///
/// Trailing bytes past the declared length are ignored.
pub fn decode(bytes: &[u8]) -> Result<DataFrame, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }
    if bytes[0] != START_MARKER {
        return Err(FrameError::BadMarker(bytes[0]));
    }

    let declared = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    let available = bytes.len() - HEADER_LEN;
    if declared > available {
        return Err(FrameError::Truncated {
            declared,
            actual: available,
        });
    }

    Ok(DataFrame {
        command: bytes[1],
        payload: bytes[HEADER_LEN..HEADER_LEN + declared].to_vec(),
    })
}

/// Decoded response from the response characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: u8,
    pub status: u8,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Decode a command response.
///
/// # Response Structure
///
/// ```text
/// [0]     : Start marker (not checked)
/// [1]     : Command code being answered
/// [2]     : Reserved
/// [3]     : Status (0x00 = success)
/// [4..]   : Optional payload
/// ```
pub fn decode_response(bytes: &[u8]) -> Result<Response, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }

    Ok(Response {
        command: bytes[1],
        status: bytes[3],
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

/// Start metadata for an outbound transfer
///
/// ```text
/// [0]     : Kind tag
/// [1-4]   : Total byte count (u32 little-endian)
/// [5]     : File name length
/// [6..]   : File name (UTF-8, at most 255 bytes)
/// ```
pub fn send_metadata(kind: TransferKind, file_name: Option<&str>, total_bytes: usize) -> Vec<u8> {
    let name = file_name.map(|n| truncate_utf8(n, u8::MAX as usize)).unwrap_or("");
    let total = u32::try_from(total_bytes).unwrap_or(u32::MAX);

    let mut metadata = Vec::with_capacity(6 + name.len());
    metadata.push(kind.tag());
    metadata.extend_from_slice(&total.to_le_bytes());
    metadata.push(name.len() as u8);
    metadata.extend_from_slice(name.as_bytes());
    metadata
}

/// Start metadata asking the accessory to push a transfer of `kind`
pub fn receive_metadata(kind: TransferKind) -> Vec<u8> {
    vec![kind.tag()]
}

/// Total size the accessory may declare in a successful start response
pub fn declared_total(payload: &[u8]) -> Option<usize> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as usize)
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Service and characteristic identifiers of the accessory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattLayout {
    pub service: Uuid,
    pub command: Uuid,
    pub status: Uuid,
    pub document: Uuid,
    pub frame_service: Uuid,
    pub frame_command: Uuid,
    pub frame_response: Uuid,
    pub frame_data: Uuid,
}

impl GattLayout {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let parse = |name: &str, value: &str| {
            Uuid::parse_str(value).with_context(|| format!("Invalid {} UUID: {}", name, value))
        };

        Ok(Self {
            service: parse("service", &settings.ble_service_uuid)?,
            command: parse("command", &settings.ble_command_char_uuid)?,
            status: parse("status", &settings.ble_status_char_uuid)?,
            document: parse("document", &settings.ble_document_char_uuid)?,
            frame_service: parse("frame service", &settings.frame_service_uuid)?,
            frame_command: parse("frame command", &settings.frame_command_char_uuid)?,
            frame_response: parse("frame response", &settings.frame_response_char_uuid)?,
            frame_data: parse("frame data", &settings.frame_data_char_uuid)?,
        })
    }

    /// Characteristics to discover for a given service
    pub fn characteristics_of(&self, service: Uuid) -> Vec<Uuid> {
        if service == self.service {
            vec![self.command, self.status, self.document]
        } else if service == self.frame_service {
            vec![self.frame_command, self.frame_response, self.frame_data]
        } else {
            Vec::new()
        }
    }
}

impl Default for GattLayout {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID,
            command: COMMAND_CHAR_UUID,
            status: STATUS_CHAR_UUID,
            document: DOCUMENT_CHAR_UUID,
            frame_service: FRAME_SERVICE_UUID,
            frame_command: FRAME_COMMAND_CHAR_UUID,
            frame_response: FRAME_RESPONSE_CHAR_UUID,
            frame_data: FRAME_DATA_CHAR_UUID,
        }
    }
}
