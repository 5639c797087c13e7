//! BLE Connection Module
//!
//! Owns the device registry and the scan/connect lifecycle, and tracks the
//! characteristic handles found on the connected accessory.

use crate::domain::models::{
    AdapterState, ConnectionState, Device, DeviceId, DeviceStatus, PeripheralHandle,
};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::GattLayout;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::transport::{CharacteristicHandle, Transport};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a characteristic is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicRole {
    Command,
    Status,
    Document,
    FrameCommand,
    FrameResponse,
    FrameData,
}

/// Characteristics the frame engine writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChannels {
    pub command: CharacteristicHandle,
    pub data: CharacteristicHandle,
}

/// Characteristic handles discovered on the connected accessory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Characteristics {
    pub command: Option<CharacteristicHandle>,
    pub status: Option<CharacteristicHandle>,
    pub document: Option<CharacteristicHandle>,
    pub frame_command: Option<CharacteristicHandle>,
    pub frame_response: Option<CharacteristicHandle>,
    pub frame_data: Option<CharacteristicHandle>,
}

impl Characteristics {
    pub fn frame_channels(&self) -> Option<FrameChannels> {
        Some(FrameChannels {
            command: self.frame_command?,
            data: self.frame_data?,
        })
    }

    fn role_of(&self, handle: &CharacteristicHandle) -> Option<CharacteristicRole> {
        let slots = [
            (self.command, CharacteristicRole::Command),
            (self.status, CharacteristicRole::Status),
            (self.document, CharacteristicRole::Document),
            (self.frame_command, CharacteristicRole::FrameCommand),
            (self.frame_response, CharacteristicRole::FrameResponse),
            (self.frame_data, CharacteristicRole::FrameData),
        ];
        slots
            .into_iter()
            .find(|(slot, _)| slot.as_ref() == Some(handle))
            .map(|(_, role)| role)
    }
}

pub struct ConnectionManager {
    layout: GattLayout,
    scanner: BleScanner,
    state: ConnectionState,
    adapter: AdapterState,
    devices: Vec<Device>,
    connected: Option<PeripheralHandle>,
    pending: Option<PeripheralHandle>,
    characteristics: Characteristics,
    device_status: Option<DeviceStatus>,
    status_text: String,
}

impl ConnectionManager {
    pub fn new(layout: GattLayout, scan_grace: Duration) -> Self {
        Self {
            scanner: BleScanner::new(layout.service, scan_grace),
            layout,
            state: ConnectionState::Idle,
            adapter: AdapterState::Unknown,
            devices: Vec::new(),
            connected: None,
            pending: None,
            characteristics: Characteristics::default(),
            device_status: None,
            status_text: "Disconnected".to_string(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn adapter(&self) -> AdapterState {
        self.adapter
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_status(&self) -> Option<DeviceStatus> {
        self.device_status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn characteristics(&self) -> &Characteristics {
        &self.characteristics
    }

    pub fn connected_device(&self) -> Option<&Device> {
        let handle = self.connected?;
        self.devices.iter().find(|d| d.handle == Some(handle))
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn scan_deadline(&self) -> Option<Instant> {
        self.scanner.grace_deadline()
    }

    pub fn role_of(&self, handle: &CharacteristicHandle) -> Option<CharacteristicRole> {
        self.characteristics.role_of(handle)
    }

    /// Whether `handle` is the peripheral we are connected or connecting to
    pub fn owns(&self, handle: PeripheralHandle) -> bool {
        self.connected == Some(handle) || self.pending == Some(handle)
    }

    /// Clear the registry and start discovery
    pub fn start_scanning(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<(), TransportError> {
        if !self.adapter.is_available() {
            warn!("Bluetooth not powered on. State: {:?}", self.adapter);
            return Err(TransportError::NotPoweredOn);
        }

        self.devices.clear();
        self.scanner.start(transport, now)?;
        self.state = ConnectionState::Scanning;
        Ok(())
    }

    pub fn stop_scanning(&mut self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        if !self.adapter.is_available() {
            return Ok(());
        }
        self.scanner.stop(transport)?;
        if self.state == ConnectionState::Scanning {
            self.state = ConnectionState::Idle;
        }
        Ok(())
    }

    pub fn on_scan_grace_elapsed(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<(), TransportError> {
        self.scanner.on_grace_elapsed(transport)
    }

    /// Connect to a discovered device
    pub fn connect(
        &mut self,
        transport: &mut dyn Transport,
        id: &DeviceId,
    ) -> Result<(), TransportError> {
        if !self.adapter.is_available() {
            return Err(TransportError::NotPoweredOn);
        }

        let handle = self
            .devices
            .iter()
            .find(|d| &d.id == id)
            .and_then(|d| d.handle)
            .ok_or(TransportError::UnknownPeripheral)?;

        // Scanning and connecting must not overlap
        self.scanner.stop(transport)?;

        info!("Connecting to device {}", id);
        transport.connect(handle)?;
        self.pending = Some(handle);
        self.state = ConnectionState::Connecting;
        self.status_text = "Connecting...".to_string();
        Ok(())
    }

    /// Ask the transport to drop the link. Returns the peripheral being dropped.
    pub fn disconnect(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<Option<PeripheralHandle>, TransportError> {
        let Some(handle) = self.connected.or(self.pending) else {
            return Ok(None);
        };
        transport.disconnect(handle)?;
        Ok(Some(handle))
    }

    /// Returns `true` if adapter availability changed
    pub fn handle_adapter_state(
        &mut self,
        transport: &mut dyn Transport,
        adapter: AdapterState,
        now: Instant,
    ) -> bool {
        let was_available = self.adapter.is_available();
        info!("Bluetooth state: {:?}", adapter);
        self.adapter = adapter;
        self.status_text = adapter.status_text().to_string();

        if adapter.is_available() {
            if self.connected.is_none() && self.pending.is_none() {
                if let Err(e) = self.start_scanning(transport, now) {
                    warn!("Could not start scanning: {}", e);
                }
            }
        } else {
            self.scanner.halt();
            if self.state == ConnectionState::Scanning {
                self.state = ConnectionState::Idle;
            }
        }

        was_available != adapter.is_available()
    }

    /// Register a discovery result, updating a known device in place
    pub fn handle_discovered(
        &mut self,
        id: DeviceId,
        name: Option<String>,
        rssi: i16,
        handle: PeripheralHandle,
        services: &[Uuid],
    ) {
        self.scanner.observe(services);

        if let Some(device) = self.devices.iter_mut().find(|d| d.id == id) {
            device.rssi = rssi;
            device.handle = Some(handle);
            return;
        }

        debug!("Discovered {} ({} dBm)", id, rssi);
        self.devices.push(Device {
            id,
            name: name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "Unknown Device".to_string()),
            rssi,
            is_connected: false,
            handle: Some(handle),
        });
    }

    /// Returns `Ok(false)` for a peripheral we did not ask to connect to
    pub fn handle_connected(
        &mut self,
        transport: &mut dyn Transport,
        handle: PeripheralHandle,
    ) -> Result<bool, TransportError> {
        if self.pending != Some(handle) {
            debug!("Ignoring connection of unrequested peripheral {:?}", handle);
            return Ok(false);
        }

        info!("Connected to peripheral {:?}", handle);
        self.connected = Some(handle);
        self.pending = None;
        self.state = ConnectionState::Connected;
        self.status_text = "Connected".to_string();
        if let Some(device) = self.devices.iter_mut().find(|d| d.handle == Some(handle)) {
            device.is_connected = true;
        }

        transport.discover_services(handle, &[self.layout.service, self.layout.frame_service])?;
        Ok(true)
    }

    /// Returns `false` for a peripheral we were not connecting to
    pub fn handle_connect_failed(&mut self, handle: PeripheralHandle, reason: &str) -> bool {
        if self.pending != Some(handle) {
            debug!("Ignoring connect failure of unrelated peripheral {:?}", handle);
            return false;
        }

        warn!("Failed to connect to {:?}: {}", handle, reason);
        self.pending = None;
        self.state = ConnectionState::Disconnected;
        self.status_text = "Connection failed".to_string();
        true
    }

    /// Tear down per-connection state. Returns `false` for a peripheral we
    /// were not connected to.
    pub fn handle_disconnected(
        &mut self,
        transport: &mut dyn Transport,
        handle: PeripheralHandle,
        now: Instant,
    ) -> bool {
        if !self.owns(handle) {
            debug!("Ignoring disconnect of unrelated peripheral {:?}", handle);
            return false;
        }

        info!("Disconnected from peripheral {:?}", handle);
        self.connected = None;
        self.pending = None;
        self.characteristics = Characteristics::default();
        self.device_status = None;
        self.state = ConnectionState::Disconnected;
        self.status_text = "Disconnected".to_string();
        if let Some(device) = self.devices.iter_mut().find(|d| d.handle == Some(handle)) {
            device.is_connected = false;
        }

        if self.adapter.is_available() {
            if let Err(e) = self.start_scanning(transport, now) {
                warn!("Could not restart scanning: {}", e);
            }
        }
        true
    }

    pub fn handle_services_discovered(
        &mut self,
        transport: &mut dyn Transport,
        handle: PeripheralHandle,
        services: &[Uuid],
    ) -> Result<(), TransportError> {
        if self.connected != Some(handle) {
            return Ok(());
        }
        for service in services {
            let wanted = self.layout.characteristics_of(*service);
            if !wanted.is_empty() {
                transport.discover_characteristics(handle, *service, &wanted)?;
            }
        }
        Ok(())
    }

    pub fn handle_characteristics_discovered(
        &mut self,
        transport: &mut dyn Transport,
        handle: PeripheralHandle,
        characteristics: &[Uuid],
    ) -> Result<(), TransportError> {
        if self.connected != Some(handle) {
            return Ok(());
        }

        for uuid in characteristics {
            let ch = CharacteristicHandle {
                peripheral: handle,
                uuid: *uuid,
            };
            let (slot, notify) = if *uuid == self.layout.command {
                (&mut self.characteristics.command, false)
            } else if *uuid == self.layout.status {
                (&mut self.characteristics.status, true)
            } else if *uuid == self.layout.document {
                (&mut self.characteristics.document, true)
            } else if *uuid == self.layout.frame_command {
                (&mut self.characteristics.frame_command, false)
            } else if *uuid == self.layout.frame_response {
                (&mut self.characteristics.frame_response, true)
            } else if *uuid == self.layout.frame_data {
                (&mut self.characteristics.frame_data, true)
            } else {
                continue;
            };

            *slot = Some(ch);
            debug!("Found characteristic {}", uuid);
            if notify {
                transport.set_notify(ch, true)?;
            }
        }
        Ok(())
    }

    /// Replace the status snapshot from a status notification.
    ///
    /// Undecodable payloads leave the previous snapshot in place.
    pub fn handle_status_value(&mut self, value: &[u8]) -> Option<DeviceStatus> {
        match DeviceStatus::from_json(value) {
            Ok(status) => {
                self.device_status = Some(status);
                Some(status)
            }
            Err(e) => {
                warn!("Ignoring malformed status payload: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::fake::{Call, RecordingTransport};
    use crate::infrastructure::bluetooth::transport::ScanFilter;

    const PERIPHERAL: PeripheralHandle = PeripheralHandle(7);

    fn powered() -> (ConnectionManager, RecordingTransport) {
        let mut manager = ConnectionManager::new(GattLayout::default(), Duration::from_secs(2));
        let mut transport = RecordingTransport::default();
        manager.handle_adapter_state(&mut transport, AdapterState::PoweredOn, Instant::now());
        transport.clear();
        (manager, transport)
    }

    fn discover(manager: &mut ConnectionManager, rssi: i16, handle: PeripheralHandle) {
        manager.handle_discovered(
            DeviceId("dev-1".to_string()),
            Some("ESP32_Headphone".to_string()),
            rssi,
            handle,
            &[],
        );
    }

    fn connected() -> (ConnectionManager, RecordingTransport) {
        let (mut manager, mut transport) = powered();
        discover(&mut manager, -60, PERIPHERAL);
        manager
            .connect(&mut transport, &DeviceId("dev-1".to_string()))
            .unwrap();
        manager.handle_connected(&mut transport, PERIPHERAL).unwrap();
        transport.clear();
        (manager, transport)
    }

    #[test]
    fn test_power_on_starts_scanning() {
        let (manager, _) = powered();
        assert_eq!(manager.state(), ConnectionState::Scanning);
        assert_eq!(manager.status_text(), "Ready to scan");
        assert!(manager.scan_deadline().is_some());
    }

    #[test]
    fn test_scan_requires_power() {
        let mut manager = ConnectionManager::new(GattLayout::default(), Duration::from_secs(2));
        let mut transport = RecordingTransport::default();
        assert_eq!(
            manager.start_scanning(&mut transport, Instant::now()),
            Err(TransportError::NotPoweredOn)
        );
        assert!(transport.calls.is_empty());
    }

    #[test]
    fn test_repeat_discovery_updates_in_place() {
        let (mut manager, _) = powered();
        discover(&mut manager, -70, PeripheralHandle(1));
        discover(&mut manager, -40, PeripheralHandle(2));

        assert_eq!(manager.devices().len(), 1);
        assert_eq!(manager.devices()[0].rssi, -40);
        assert_eq!(manager.devices()[0].handle, Some(PeripheralHandle(2)));
    }

    #[test]
    fn test_unnamed_device_gets_placeholder() {
        let (mut manager, _) = powered();
        manager.handle_discovered(DeviceId("x".to_string()), None, -80, PERIPHERAL, &[]);
        assert_eq!(manager.devices()[0].name, "Unknown Device");
    }

    #[test]
    fn test_connect_stops_scan_first() {
        let (mut manager, mut transport) = powered();
        discover(&mut manager, -60, PERIPHERAL);
        manager
            .connect(&mut transport, &DeviceId("dev-1".to_string()))
            .unwrap();

        assert_eq!(transport.calls, vec![Call::StopScan, Call::Connect(PERIPHERAL)]);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_connect_unknown_device() {
        let (mut manager, mut transport) = powered();
        assert_eq!(
            manager.connect(&mut transport, &DeviceId("missing".to_string())),
            Err(TransportError::UnknownPeripheral)
        );
    }

    #[test]
    fn test_connected_discovers_both_services() {
        let (mut manager, mut transport) = powered();
        discover(&mut manager, -60, PERIPHERAL);
        manager
            .connect(&mut transport, &DeviceId("dev-1".to_string()))
            .unwrap();
        transport.clear();
        manager.handle_connected(&mut transport, PERIPHERAL).unwrap();

        let layout = GattLayout::default();
        assert_eq!(
            transport.calls,
            vec![Call::DiscoverServices(
                PERIPHERAL,
                vec![layout.service, layout.frame_service]
            )]
        );
        assert!(manager.connected_device().unwrap().is_connected);
    }

    #[test]
    fn test_characteristics_subscribe_notifying_roles() {
        let (mut manager, mut transport) = connected();
        let layout = GattLayout::default();
        manager
            .handle_characteristics_discovered(
                &mut transport,
                PERIPHERAL,
                &[layout.frame_command, layout.frame_response, layout.frame_data],
            )
            .unwrap();

        let notified: Vec<Uuid> = transport
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::SetNotify(ch, true) => Some(ch.uuid),
                _ => None,
            })
            .collect();
        assert_eq!(notified, vec![layout.frame_response, layout.frame_data]);
        assert!(manager.characteristics().frame_channels().is_some());

        let response = CharacteristicHandle {
            peripheral: PERIPHERAL,
            uuid: layout.frame_response,
        };
        assert_eq!(
            manager.role_of(&response),
            Some(CharacteristicRole::FrameResponse)
        );
    }

    #[test]
    fn test_disconnect_clears_and_rescans() {
        let (mut manager, mut transport) = connected();
        let layout = GattLayout::default();
        manager
            .handle_characteristics_discovered(&mut transport, PERIPHERAL, &[layout.status])
            .unwrap();
        manager.handle_status_value(br#"{"playing":true,"volume":1,"battery":2,"signal":3}"#);
        transport.clear();

        assert!(manager.handle_disconnected(&mut transport, PERIPHERAL, Instant::now()));
        assert_eq!(manager.characteristics(), &Characteristics::default());
        assert!(manager.device_status().is_none());
        assert_eq!(manager.state(), ConnectionState::Scanning);
        assert_eq!(transport.calls, vec![Call::StartScan(ScanFilter::All)]);
    }

    #[test]
    fn test_disconnect_without_power_stays_disconnected() {
        let (mut manager, mut transport) = connected();
        manager.handle_adapter_state(&mut transport, AdapterState::PoweredOff, Instant::now());
        manager.handle_disconnected(&mut transport, PERIPHERAL, Instant::now());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_unrelated_disconnect_ignored() {
        let (mut manager, mut transport) = connected();
        assert!(!manager.handle_disconnected(
            &mut transport,
            PeripheralHandle(99),
            Instant::now()
        ));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_power_loss_stops_scanning() {
        let (mut manager, mut transport) = powered();
        let changed = manager.handle_adapter_state(
            &mut transport,
            AdapterState::Unauthorized,
            Instant::now(),
        );
        assert!(changed);
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.status_text(), "Bluetooth is unauthorized");
        assert!(manager.scan_deadline().is_none());
    }

    #[test]
    fn test_connect_failure_is_not_retried() {
        let (mut manager, mut transport) = powered();
        discover(&mut manager, -60, PERIPHERAL);
        manager
            .connect(&mut transport, &DeviceId("dev-1".to_string()))
            .unwrap();
        transport.clear();

        assert!(manager.handle_connect_failed(PERIPHERAL, "timeout"));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.status_text(), "Connection failed");
        assert!(transport.calls.is_empty());
    }

    #[test]
    fn test_unrelated_connect_events_ignored() {
        let (mut manager, mut transport) = connected();
        manager
            .handle_characteristics_discovered(
                &mut transport,
                PERIPHERAL,
                &[GattLayout::default().frame_command, GattLayout::default().frame_data],
            )
            .unwrap();
        transport.clear();

        assert!(!manager.handle_connect_failed(PeripheralHandle(9), "x"));
        assert!(!manager
            .handle_connected(&mut transport, PeripheralHandle(9))
            .unwrap());

        assert!(manager.is_connected());
        assert!(manager.characteristics().frame_channels().is_some());
        assert!(transport.calls.is_empty());
    }

    #[test]
    fn test_malformed_status_keeps_previous() {
        let (mut manager, _) = connected();
        manager.handle_status_value(br#"{"playing":false,"volume":10,"battery":20,"signal":30}"#);
        assert!(manager.handle_status_value(b"{").is_none());
        assert_eq!(manager.device_status().unwrap().volume, 10);
    }
}
