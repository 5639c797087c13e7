use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Stable identity of a peripheral as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque transport handle used to address a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralHandle(pub u64);

/// A discovered accessory.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Signal strength in dBm
    pub rssi: i16,
    pub is_connected: bool,
    pub handle: Option<PeripheralHandle>,
}

/// Snapshot of the accessory state, decoded from the status characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub playing: bool,
    pub volume: u8,
    pub battery: u8,
    pub signal: u8,
}

impl DeviceStatus {
    /// Decode a JSON status payload. Values outside 0-100 are rejected.
    pub fn from_json(bytes: &[u8]) -> anyhow::Result<Self> {
        let status: DeviceStatus = serde_json::from_slice(bytes)?;
        for (field, value) in [
            ("volume", status.volume),
            ("battery", status.battery),
            ("signal", status.signal),
        ] {
            if value > 100 {
                anyhow::bail!("{} out of range: {}", field, value);
            }
        }
        Ok(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
}

/// Power state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Resetting,
    Unauthorized,
    Unknown,
    Unsupported,
}

impl AdapterState {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    /// Human-readable status line for this adapter state
    pub fn status_text(&self) -> &'static str {
        match self {
            Self::PoweredOn => "Ready to scan",
            Self::PoweredOff => "Bluetooth is powered off",
            Self::Resetting => "Bluetooth is resetting",
            Self::Unauthorized => "Bluetooth is unauthorized",
            Self::Unknown => "Bluetooth state unknown",
            Self::Unsupported => "Bluetooth not supported",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Image,
    Document,
    File,
}

impl TransferKind {
    /// Tag carried in the start-transfer metadata
    pub fn tag(&self) -> u8 {
        match self {
            Self::Image => 0x01,
            Self::Document => 0x02,
            Self::File => 0x03,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Image => "img",
            Self::Document => "txt",
            Self::File => "bin",
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Document => "document",
            Self::File => "file",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Starting,
    Transferring,
    Completed,
    Failed,
}

impl TransferState {
    /// Whether a session in this state still owns the link
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Transferring)
    }
}

/// Point-in-time view of a transfer session, published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub direction: TransferDirection,
    pub kind: TransferKind,
    pub state: TransferState,
    pub progress: f32,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// Playback and status commands understood by the accessory's command characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleCommand {
    Play,
    Pause,
    VolumeUp,
    VolumeDown,
    GetStatus,
}

impl SimpleCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "PLAY",
            Self::Pause => "PAUSE",
            Self::VolumeUp => "VOLUME UP",
            Self::VolumeDown => "VOLUME DOWN",
            Self::GetStatus => "GET_STATUS",
        }
    }
}

/// Requests into the Bluetooth worker.
#[derive(Debug, Clone, PartialEq)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Disconnect,
    SendCommand(SimpleCommand),
    RawCommand(String),
    RequestStatus,
    SendTransfer {
        kind: TransferKind,
        file_name: Option<String>,
        data: Vec<u8>,
    },
    RequestDocument(TransferKind),
    CancelTransfer,
}

/// Observations published by the Bluetooth worker.
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionState),
    AdapterAvailability(bool),
    DevicesUpdated(Vec<Device>),
    DeviceStatus(Option<DeviceStatus>),
    Transfer(TransferSnapshot),
    DocumentReceived(String),
    ArtifactSaved(PathBuf),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
