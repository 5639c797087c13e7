//! BLE Transport
//!
//! The radio stack is an external capability. The service issues
//! fire-and-forget requests through [`Transport`] and learns about their
//! outcome later from [`TransportEvent`]s delivered on a channel.

use crate::domain::models::{AdapterState, DeviceId, PeripheralHandle};
use crate::error::TransportError;
use uuid::Uuid;

/// Which advertisements a scan should report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    /// Every advertising peripheral
    All,
    /// Only peripherals advertising one of these services
    Services(Vec<Uuid>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// A characteristic on a specific peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub peripheral: PeripheralHandle,
    pub uuid: Uuid,
}

/// Requests the core makes of the BLE stack.
///
/// Every method only submits the request; results arrive as events.
pub trait Transport: Send {
    fn start_scan(&mut self, filter: ScanFilter) -> Result<(), TransportError>;
    fn stop_scan(&mut self) -> Result<(), TransportError>;
    fn connect(&mut self, peripheral: PeripheralHandle) -> Result<(), TransportError>;
    fn disconnect(&mut self, peripheral: PeripheralHandle) -> Result<(), TransportError>;
    fn discover_services(
        &mut self,
        peripheral: PeripheralHandle,
        services: &[Uuid],
    ) -> Result<(), TransportError>;
    fn discover_characteristics(
        &mut self,
        peripheral: PeripheralHandle,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), TransportError>;
    fn set_notify(
        &mut self,
        characteristic: CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError>;
    fn write(
        &mut self,
        characteristic: CharacteristicHandle,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;
}

/// Callbacks from the BLE stack, funneled into the service loop
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    AdapterStateChanged(AdapterState),
    Discovered {
        id: DeviceId,
        name: Option<String>,
        rssi: i16,
        handle: PeripheralHandle,
        services: Vec<Uuid>,
    },
    Connected(PeripheralHandle),
    ConnectFailed {
        handle: PeripheralHandle,
        reason: String,
    },
    Disconnected {
        handle: PeripheralHandle,
        reason: Option<String>,
    },
    ServicesDiscovered {
        handle: PeripheralHandle,
        services: Vec<Uuid>,
    },
    CharacteristicsDiscovered {
        handle: PeripheralHandle,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    ValueUpdated {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
    WriteFailed {
        characteristic: CharacteristicHandle,
        reason: String,
    },
}
