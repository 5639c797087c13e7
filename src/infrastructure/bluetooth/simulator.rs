//! Simulated Headphones
//!
//! In-process stand-in for a BLE stack with one accessory in range. Every
//! request is answered by pushing the matching [`TransportEvent`] onto the
//! service's event channel, the same way a real backend would report its
//! callbacks.

use crate::domain::models::{AdapterState, DeviceId, DeviceStatus, PeripheralHandle};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{self, CommandCode, GattLayout, STATUS_SUCCESS};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, ScanFilter, Transport, TransportEvent, WriteKind,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PERIPHERAL: PeripheralHandle = PeripheralHandle(1);
const DEVICE_NAME: &str = "ESP32_Headphone";
const VOLUME_STEP: u8 = 10;
/// Payload size the accessory uses for frames it pushes
const PUSH_CHUNK: usize = 16;

const CANNED_DOCUMENT: &str = "Track list\n1. Intro\n2. Theme\n3. Outro\n";

#[derive(Debug, Default)]
struct Upload {
    expected: usize,
    received: Vec<u8>,
}

pub struct SimulatedHeadphones {
    layout: GattLayout,
    events: mpsc::UnboundedSender<TransportEvent>,
    status: DeviceStatus,
    connected: bool,
    notifying: Vec<Uuid>,
    upload: Option<Upload>,
}

impl SimulatedHeadphones {
    pub fn new(layout: GattLayout, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            layout,
            events,
            status: DeviceStatus {
                playing: false,
                volume: 50,
                battery: 87,
                signal: 72,
            },
            connected: false,
            notifying: Vec::new(),
            upload: None,
        }
    }

    /// Report the adapter as ready
    pub fn power_on(&self) {
        self.emit(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn notify(&self, uuid: Uuid, value: Vec<u8>) {
        if !self.notifying.contains(&uuid) {
            debug!("Notification on {} suppressed, not subscribed", uuid);
            return;
        }
        self.emit(TransportEvent::ValueUpdated {
            characteristic: CharacteristicHandle {
                peripheral: PERIPHERAL,
                uuid,
            },
            value,
        });
    }

    fn push_status(&self) {
        match serde_json::to_vec(&self.status) {
            Ok(json) => self.notify(self.layout.status, json),
            Err(e) => warn!("Failed to encode status: {}", e),
        }
    }

    fn respond(&self, command: CommandCode, status: u8, payload: &[u8]) {
        let mut frame = vec![protocol::START_MARKER, command.as_byte(), 0, status];
        frame.extend_from_slice(payload);
        self.notify(self.layout.frame_response, frame);
    }

    fn handle_text_command(&mut self, text: &str) {
        match text {
            "PLAY" => self.status.playing = true,
            "PAUSE" => self.status.playing = false,
            "VOLUME UP" => self.status.volume = (self.status.volume + VOLUME_STEP).min(100),
            "VOLUME DOWN" => self.status.volume = self.status.volume.saturating_sub(VOLUME_STEP),
            "GET_STATUS" => {}
            "ACK" => return,
            other => {
                info!("Accessory ignoring unknown command {:?}", other);
                return;
            }
        }
        self.push_status();
    }

    fn handle_frame_command(&mut self, bytes: &[u8]) {
        let frame = match protocol::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Accessory got malformed frame: {}", e);
                return;
            }
        };
        if CommandCode::from_byte(frame.command) != Some(CommandCode::StartTransfer) {
            warn!("Accessory got unexpected command {:#04x}", frame.command);
            return;
        }

        match protocol::declared_total(frame.payload.get(1..).unwrap_or_default()) {
            // Upload: the metadata carries the byte count
            Some(expected) => {
                info!("Accessory accepting upload of {} bytes", expected);
                self.upload = Some(Upload {
                    expected,
                    received: Vec::new(),
                });
                self.respond(CommandCode::StartTransfer, STATUS_SUCCESS, &[]);
            }
            // Download request: announce the size, then push the data
            None => {
                let document = CANNED_DOCUMENT.as_bytes();
                let total = document.len() as u32;
                self.respond(CommandCode::StartTransfer, STATUS_SUCCESS, &total.to_le_bytes());
                for chunk in document.chunks(PUSH_CHUNK) {
                    match protocol::encode(CommandCode::Chunk.as_byte(), chunk) {
                        Ok(frame) => self.notify(self.layout.frame_data, frame),
                        Err(e) => warn!("Failed to encode chunk: {}", e),
                    }
                }
            }
        }
    }

    fn handle_chunk(&mut self, bytes: &[u8]) {
        let Ok(frame) = protocol::decode(bytes) else {
            warn!("Accessory got malformed chunk");
            return;
        };
        let Some(upload) = self.upload.as_mut() else {
            warn!("Accessory got chunk without an upload");
            return;
        };

        upload.received.extend_from_slice(&frame.payload);
        if upload.received.len() >= upload.expected {
            info!("Accessory stored upload of {} bytes", upload.received.len());
            self.upload = None;
        }
        self.respond(CommandCode::Chunk, STATUS_SUCCESS, &[]);
    }

    fn check_connected(&self, peripheral: PeripheralHandle) -> Result<(), TransportError> {
        if self.connected && peripheral == PERIPHERAL {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Transport for SimulatedHeadphones {
    fn start_scan(&mut self, filter: ScanFilter) -> Result<(), TransportError> {
        let services = vec![self.layout.service];
        if let ScanFilter::Services(wanted) = &filter {
            if !wanted.iter().any(|s| services.contains(s)) {
                return Ok(());
            }
        }
        self.emit(TransportEvent::Discovered {
            id: DeviceId("sim-headphone-01".to_string()),
            name: Some(DEVICE_NAME.to_string()),
            rssi: -55,
            handle: PERIPHERAL,
            services,
        });
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn connect(&mut self, peripheral: PeripheralHandle) -> Result<(), TransportError> {
        if peripheral != PERIPHERAL {
            self.emit(TransportEvent::ConnectFailed {
                handle: peripheral,
                reason: "peripheral out of range".to_string(),
            });
            return Ok(());
        }
        self.connected = true;
        self.emit(TransportEvent::Connected(peripheral));
        Ok(())
    }

    fn disconnect(&mut self, peripheral: PeripheralHandle) -> Result<(), TransportError> {
        self.connected = false;
        self.notifying.clear();
        self.upload = None;
        self.emit(TransportEvent::Disconnected {
            handle: peripheral,
            reason: None,
        });
        Ok(())
    }

    fn discover_services(
        &mut self,
        peripheral: PeripheralHandle,
        services: &[Uuid],
    ) -> Result<(), TransportError> {
        self.check_connected(peripheral)?;
        let offered = [self.layout.service, self.layout.frame_service];
        self.emit(TransportEvent::ServicesDiscovered {
            handle: peripheral,
            services: services
                .iter()
                .copied()
                .filter(|s| offered.contains(s))
                .collect(),
        });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        peripheral: PeripheralHandle,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), TransportError> {
        self.check_connected(peripheral)?;
        self.emit(TransportEvent::CharacteristicsDiscovered {
            handle: peripheral,
            service,
            characteristics: characteristics.to_vec(),
        });
        Ok(())
    }

    fn set_notify(
        &mut self,
        characteristic: CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.check_connected(characteristic.peripheral)?;
        self.notifying.retain(|u| *u != characteristic.uuid);
        if enabled {
            self.notifying.push(characteristic.uuid);
        }
        Ok(())
    }

    fn write(
        &mut self,
        characteristic: CharacteristicHandle,
        data: &[u8],
        _kind: WriteKind,
    ) -> Result<(), TransportError> {
        self.check_connected(characteristic.peripheral)?;

        let uuid = characteristic.uuid;
        if uuid == self.layout.command {
            let text = String::from_utf8_lossy(data);
            self.handle_text_command(text.trim());
        } else if uuid == self.layout.frame_command {
            self.handle_frame_command(data);
        } else if uuid == self.layout.frame_data {
            self.handle_chunk(data);
        } else {
            self.emit(TransportEvent::WriteFailed {
                characteristic,
                reason: "characteristic is not writable".to_string(),
            });
        }
        Ok(())
    }
}
