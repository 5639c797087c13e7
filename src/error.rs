//! Typed errors for the transport, frame codec and transfer layers.
//!
//! None of these escalate past their layer: the service logs them and
//! reflects the outcome in connection or session state.

use thiserror::Error;

/// Immediate failure to submit a request to the BLE transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bluetooth adapter is not powered on")]
    NotPoweredOn,

    #[error("no peripheral with that handle")]
    UnknownPeripheral,

    #[error("peripheral is not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Backend(String),
}

/// Frame codec and request gating errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer than the 4 header bytes.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("bad start marker: {0:#04x}")]
    BadMarker(u8),

    #[error("payload of {0} bytes does not fit a 16-bit length")]
    PayloadTooLarge(usize),

    /// Declared payload length exceeds the bytes received.
    #[error("truncated frame: declared {declared}, got {actual}")]
    Truncated { declared: usize, actual: usize },

    /// A previous command is still awaiting its response.
    #[error("a command is already in flight")]
    Busy,

    /// Frame protocol characteristics have not been discovered.
    #[error("frame protocol characteristics not available")]
    NotReady,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reasons a transfer request is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("another transfer is already running")]
    AlreadyActive,

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Frame(#[from] FrameError),
}
