//! Bluetooth Service Module
//!
//! Single serialized context for everything the accessory link does.
//! Commands from the application, transport callbacks and timers are all
//! handled on one task, so protocol state is never touched concurrently.

use crate::domain::models::{
    AppEvent, BluetoothCommand, ConnectionState, MessageSeverity, PeripheralHandle,
    SimpleCommand, StatusMessage, TransferKind, TransferSnapshot,
};
use crate::domain::settings::Settings;
use crate::domain::transfer::{sentinel, DocumentAction, DocumentReceiver};
use crate::error::TransferError;
use crate::infrastructure::bluetooth::{
    commands::{self, StatusPoller},
    connection::{CharacteristicRole, ConnectionManager},
    frame_engine::{EngineConfig, FrameEngine, FrameOutcome},
    protocol::GattLayout,
    transport::{CharacteristicHandle, Transport, TransportEvent},
};
use crate::infrastructure::storage::ArtifactStore;
use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Everything the service needs from settings
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub layout: GattLayout,
    pub engine: EngineConfig,
    pub scan_grace: Duration,
    pub status_poll_interval: Duration,
}

impl ServiceConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            layout: GattLayout::from_settings(settings)?,
            engine: EngineConfig {
                max_payload: settings.max_payload,
                response_timeout: Duration::from_millis(settings.response_timeout_ms),
                receive_size_hint: settings.receive_size_hint,
            },
            scan_grace: Duration::from_millis(settings.scan_grace_ms),
            status_poll_interval: Duration::from_millis(settings.status_poll_interval_ms),
        })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            layout: GattLayout::default(),
            engine: EngineConfig::default(),
            scan_grace: Duration::from_secs(2),
            status_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Main Bluetooth service coordinating all BLE operations
pub struct HeadphoneService<T: Transport> {
    transport: T,
    connection: ConnectionManager,
    engine: FrameEngine,
    documents: DocumentReceiver,
    poller: StatusPoller,
    store: Box<dyn ArtifactStore>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    published_state: Option<ConnectionState>,
}

impl<T: Transport> HeadphoneService<T> {
    /// Create a new Bluetooth service
    pub fn new(
        transport: T,
        config: ServiceConfig,
        store: Box<dyn ArtifactStore>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            connection: ConnectionManager::new(config.layout, config.scan_grace),
            engine: FrameEngine::new(config.engine),
            documents: DocumentReceiver::new(config.engine.receive_size_hint),
            poller: StatusPoller::new(config.status_poll_interval),
            store,
            event_sender,
            published_state: None,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn engine(&self) -> &FrameEngine {
        &self.engine
    }

    pub fn poller(&self) -> &StatusPoller {
        &self.poller
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run until the command channel closes
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("Bluetooth service running");

        loop {
            let next_timer = self.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, Instant::now()),
                    None => break,
                },
                Some(event) = events.recv() => {
                    self.handle_transport_event(event, Instant::now());
                }
                _ = wait_until(next_timer) => {
                    self.handle_timers(Instant::now());
                }
            }
        }

        if let Err(e) = self.connection.disconnect(&mut self.transport) {
            warn!("Disconnect on shutdown failed: {}", e);
        }
        info!("Bluetooth service stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.connection.scan_deadline(),
            self.poller.next_due(),
            self.engine.response_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire whatever timers are due at `now`
    pub fn handle_timers(&mut self, now: Instant) {
        if self.connection.scan_deadline().is_some_and(|d| d <= now) {
            if let Err(e) = self.connection.on_scan_grace_elapsed(&mut self.transport) {
                error!("Failed to narrow scan: {}", e);
            }
        }

        if self.poller.poll(now) {
            let command = self.connection.characteristics().command;
            if let Err(e) = commands::request_status(&mut self.transport, command) {
                warn!("Status request failed: {}", e);
            }
        }

        if let Some(outcome) = self.engine.check_timeout(now) {
            self.publish_outcome(outcome);
        }
    }

    pub fn handle_command(&mut self, command: BluetoothCommand, now: Instant) {
        match command {
            BluetoothCommand::StartScan => {
                if let Err(e) = self.connection.start_scanning(&mut self.transport, now) {
                    self.send_log(&format!("Cannot scan: {}", e), MessageSeverity::Warning);
                } else {
                    self.send_log("Scanning for devices...", MessageSeverity::Info);
                    self.emit(AppEvent::DevicesUpdated(Vec::new()));
                }
            }
            BluetoothCommand::StopScan => {
                if let Err(e) = self.connection.stop_scanning(&mut self.transport) {
                    error!("Failed to stop scan: {}", e);
                }
            }
            BluetoothCommand::Connect(id) => {
                if let Err(e) = self.connection.connect(&mut self.transport, &id) {
                    error!("Connection failed: {}", e);
                    self.send_log(&format!("Connection failed: {}", e), MessageSeverity::Error);
                } else {
                    self.send_log("Connecting to device...", MessageSeverity::Info);
                }
            }
            BluetoothCommand::Disconnect => match self.connection.disconnect(&mut self.transport) {
                Ok(Some(handle)) => self.on_disconnected(handle, now),
                Ok(None) => {}
                Err(e) => error!("Disconnect failed: {}", e),
            },
            BluetoothCommand::SendCommand(command) => {
                self.send_text(command.as_str());
            }
            BluetoothCommand::RawCommand(text) => {
                self.send_text(&text);
            }
            BluetoothCommand::RequestStatus => {
                self.send_text(SimpleCommand::GetStatus.as_str());
            }
            BluetoothCommand::SendTransfer {
                kind,
                file_name,
                data,
            } => {
                let result = if self.connection.is_connected() {
                    let channels = self.connection.characteristics().frame_channels();
                    self.engine
                        .start_send(&mut self.transport, channels, kind, file_name, &data, now)
                } else {
                    Err(TransferError::NotConnected)
                };
                self.report_transfer_start(kind, result);
            }
            BluetoothCommand::RequestDocument(kind) => {
                let result = if self.connection.is_connected() {
                    let channels = self.connection.characteristics().frame_channels();
                    self.engine
                        .start_receive(&mut self.transport, channels, kind, now)
                } else {
                    Err(TransferError::NotConnected)
                };
                self.report_transfer_start(kind, result);
            }
            BluetoothCommand::CancelTransfer => {
                if let Some(outcome) = self.engine.cancel() {
                    self.publish_outcome(outcome);
                }
            }
        }
        self.publish_connection_state();
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::AdapterStateChanged(adapter) => {
                let changed =
                    self.connection
                        .handle_adapter_state(&mut self.transport, adapter, now);
                if changed {
                    self.emit(AppEvent::AdapterAvailability(adapter.is_available()));
                }
                let severity = if adapter.is_available() {
                    MessageSeverity::Info
                } else {
                    MessageSeverity::Warning
                };
                self.send_log(adapter.status_text(), severity);
            }
            TransportEvent::Discovered {
                id,
                name,
                rssi,
                handle,
                services,
            } => {
                self.connection
                    .handle_discovered(id, name, rssi, handle, &services);
                self.emit(AppEvent::DevicesUpdated(self.connection.devices().to_vec()));
            }
            TransportEvent::Connected(handle) => {
                match self.connection.handle_connected(&mut self.transport, handle) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => error!("Service discovery failed: {}", e),
                }
                self.poller.start(now);
                self.send_log("Connected", MessageSeverity::Success);
                self.emit(AppEvent::DevicesUpdated(self.connection.devices().to_vec()));
            }
            TransportEvent::ConnectFailed { handle, reason } => {
                if !self.connection.handle_connect_failed(handle, &reason) {
                    return;
                }
                self.send_log(
                    &format!("Connection failed: {}", reason),
                    MessageSeverity::Error,
                );
            }
            TransportEvent::Disconnected { handle, reason } => {
                if let Some(reason) = reason {
                    info!("Peripheral disconnected: {}", reason);
                }
                self.on_disconnected(handle, now);
            }
            TransportEvent::ServicesDiscovered { handle, services } => {
                if let Err(e) =
                    self.connection
                        .handle_services_discovered(&mut self.transport, handle, &services)
                {
                    error!("Characteristic discovery failed: {}", e);
                }
            }
            TransportEvent::CharacteristicsDiscovered {
                handle,
                characteristics,
                ..
            } => {
                if let Err(e) = self.connection.handle_characteristics_discovered(
                    &mut self.transport,
                    handle,
                    &characteristics,
                ) {
                    error!("Notification subscription failed: {}", e);
                }
            }
            TransportEvent::ValueUpdated {
                characteristic,
                value,
            } => self.handle_value(characteristic, &value, now),
            TransportEvent::WriteFailed {
                characteristic,
                reason,
            } => {
                self.send_log(&format!("Write failed: {}", reason), MessageSeverity::Error);
                if matches!(
                    self.connection.role_of(&characteristic),
                    Some(CharacteristicRole::FrameCommand | CharacteristicRole::FrameData)
                ) {
                    if let Some(outcome) = self.engine.handle_write_failed(&reason) {
                        self.publish_outcome(outcome);
                    }
                }
            }
        }
        self.publish_connection_state();
    }

    fn handle_value(&mut self, characteristic: CharacteristicHandle, value: &[u8], now: Instant) {
        match self.connection.role_of(&characteristic) {
            Some(CharacteristicRole::Status) => {
                if let Some(status) = self.connection.handle_status_value(value) {
                    self.emit(AppEvent::DeviceStatus(Some(status)));
                }
            }
            Some(CharacteristicRole::FrameResponse) => {
                let channels = self.connection.characteristics().frame_channels();
                if let Some(outcome) =
                    self.engine
                        .handle_response(&mut self.transport, channels, value, now)
                {
                    self.publish_outcome(outcome);
                }
            }
            Some(CharacteristicRole::FrameData) => {
                if let Some(outcome) = self.engine.handle_data(value, now) {
                    self.publish_outcome(outcome);
                }
            }
            Some(CharacteristicRole::Document) => match self.documents.handle(value) {
                DocumentAction::None => {}
                DocumentAction::SendAck => {
                    self.send_text(sentinel::ACK);
                }
                DocumentAction::Progress(snapshot) => self.emit(AppEvent::Transfer(snapshot)),
                DocumentAction::Completed(artifact) => {
                    if let Some(session) = self.documents.session() {
                        self.emit(AppEvent::Transfer(session.snapshot()));
                    }
                    self.persist(TransferKind::Document, None, &artifact);
                }
            },
            Some(CharacteristicRole::Command | CharacteristicRole::FrameCommand) | None => {
                trace!("Ignoring value from {}", characteristic.uuid);
            }
        }
    }

    /// Drop everything tied to the connection
    fn on_disconnected(&mut self, handle: PeripheralHandle, now: Instant) {
        if !self.connection.owns(handle) {
            debug!("Ignoring disconnect of unrelated peripheral {:?}", handle);
            return;
        }

        if let Some(outcome) = self.engine.reset() {
            self.publish_outcome(outcome);
        }
        if let Some(snapshot) = self.documents.reset() {
            self.emit(AppEvent::Transfer(snapshot));
        }
        self.poller.stop();

        self.connection
            .handle_disconnected(&mut self.transport, handle, now);
        self.send_log("Disconnected from device", MessageSeverity::Info);
        self.emit(AppEvent::DeviceStatus(None));
        self.emit(AppEvent::DevicesUpdated(self.connection.devices().to_vec()));
    }

    fn send_text(&mut self, text: &str) {
        let command = self.connection.characteristics().command;
        if let Err(e) = commands::send_text(&mut self.transport, command, text) {
            self.send_log(&format!("Command failed: {}", e), MessageSeverity::Error);
        }
    }

    fn report_transfer_start(
        &mut self,
        kind: TransferKind,
        result: Result<TransferSnapshot, TransferError>,
    ) {
        match result {
            Ok(snapshot) => self.emit(AppEvent::Transfer(snapshot)),
            Err(e) => {
                warn!("Cannot start {} transfer: {}", kind, e);
                self.send_log(
                    &format!("Cannot start {} transfer: {}", kind, e),
                    MessageSeverity::Warning,
                );
            }
        }
    }

    fn publish_outcome(&mut self, outcome: FrameOutcome) {
        match outcome {
            FrameOutcome::Progress(snapshot) => self.emit(AppEvent::Transfer(snapshot)),
            FrameOutcome::Completed {
                snapshot,
                artifact,
                file_name,
            } => {
                let kind = snapshot.kind;
                self.emit(AppEvent::Transfer(snapshot));
                self.send_log(
                    &format!("{} transfer completed", kind),
                    MessageSeverity::Success,
                );
                if let Some(artifact) = artifact {
                    self.persist(kind, file_name.as_deref(), &artifact);
                }
            }
            FrameOutcome::Failed { snapshot, reason } => {
                self.emit(AppEvent::Transfer(snapshot));
                self.send_log(
                    &format!("Transfer failed: {}", reason),
                    MessageSeverity::Error,
                );
            }
        }
    }

    fn persist(&mut self, kind: TransferKind, file_name: Option<&str>, artifact: &[u8]) {
        if kind == TransferKind::Document {
            self.emit(AppEvent::DocumentReceived(
                String::from_utf8_lossy(artifact).into_owned(),
            ));
        }
        match self.store.save(kind, file_name, artifact) {
            Ok(path) => self.emit(AppEvent::ArtifactSaved(path)),
            Err(e) => {
                error!("Failed to save {}: {:#}", kind, e);
                self.send_log(&format!("Failed to save {}: {}", kind, e), MessageSeverity::Error);
            }
        }
    }

    fn publish_connection_state(&mut self) {
        let state = self.connection.state();
        if self.published_state != Some(state) {
            self.published_state = Some(state);
            self.emit(AppEvent::ConnectionStatus(state));
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AdapterState, DeviceId, TransferState};
    use crate::infrastructure::bluetooth::protocol::{
        self, COMMAND_CHAR_UUID, DOCUMENT_CHAR_UUID, FRAME_COMMAND_CHAR_UUID,
        FRAME_DATA_CHAR_UUID, FRAME_RESPONSE_CHAR_UUID, FRAME_SERVICE_UUID, SERVICE_UUID,
        STATUS_CHAR_UUID,
    };
    use crate::infrastructure::bluetooth::transport::fake::{Call, RecordingTransport};
    use crate::infrastructure::bluetooth::transport::ScanFilter;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    const PERIPHERAL: PeripheralHandle = PeripheralHandle(3);

    type Saved = Arc<Mutex<Vec<(TransferKind, Vec<u8>)>>>;

    struct MemoryStore(Saved);

    impl ArtifactStore for MemoryStore {
        fn save(
            &mut self,
            kind: TransferKind,
            _file_name: Option<&str>,
            bytes: &[u8],
        ) -> Result<PathBuf> {
            let mut saved = self.0.lock().unwrap();
            saved.push((kind, bytes.to_vec()));
            Ok(PathBuf::from(format!("artifact-{}", saved.len())))
        }
    }

    /// Transport the test keeps a handle to while the service runs
    #[derive(Clone, Default)]
    struct SharedTransport(Arc<Mutex<RecordingTransport>>);

    impl Transport for SharedTransport {
        fn start_scan(&mut self, filter: ScanFilter) -> Result<(), crate::error::TransportError> {
            self.0.lock().unwrap().start_scan(filter)
        }
        fn stop_scan(&mut self) -> Result<(), crate::error::TransportError> {
            self.0.lock().unwrap().stop_scan()
        }
        fn connect(&mut self, p: PeripheralHandle) -> Result<(), crate::error::TransportError> {
            self.0.lock().unwrap().connect(p)
        }
        fn disconnect(&mut self, p: PeripheralHandle) -> Result<(), crate::error::TransportError> {
            self.0.lock().unwrap().disconnect(p)
        }
        fn discover_services(
            &mut self,
            p: PeripheralHandle,
            services: &[uuid::Uuid],
        ) -> Result<(), crate::error::TransportError> {
            self.0.lock().unwrap().discover_services(p, services)
        }
        fn discover_characteristics(
            &mut self,
            p: PeripheralHandle,
            service: uuid::Uuid,
            characteristics: &[uuid::Uuid],
        ) -> Result<(), crate::error::TransportError> {
            self.0
                .lock()
                .unwrap()
                .discover_characteristics(p, service, characteristics)
        }
        fn set_notify(
            &mut self,
            ch: CharacteristicHandle,
            enabled: bool,
        ) -> Result<(), crate::error::TransportError> {
            self.0.lock().unwrap().set_notify(ch, enabled)
        }
        fn write(
            &mut self,
            ch: CharacteristicHandle,
            data: &[u8],
            kind: crate::infrastructure::bluetooth::transport::WriteKind,
        ) -> Result<(), crate::error::TransportError> {
            self.0.lock().unwrap().write(ch, data, kind)
        }
    }

    fn ch(uuid: uuid::Uuid) -> CharacteristicHandle {
        CharacteristicHandle {
            peripheral: PERIPHERAL,
            uuid,
        }
    }

    fn value(uuid: uuid::Uuid, bytes: &[u8]) -> TransportEvent {
        TransportEvent::ValueUpdated {
            characteristic: ch(uuid),
            value: bytes.to_vec(),
        }
    }

    struct Harness {
        service: HeadphoneService<SharedTransport>,
        transport: SharedTransport,
        events: mpsc::UnboundedReceiver<AppEvent>,
        saved: Saved,
    }

    impl Harness {
        fn new() -> Self {
            let transport = SharedTransport::default();
            let saved = Saved::default();
            let (tx, events) = mpsc::unbounded_channel();
            let config = ServiceConfig {
                engine: EngineConfig {
                    max_payload: 2,
                    ..EngineConfig::default()
                },
                ..ServiceConfig::default()
            };
            let service = HeadphoneService::new(
                transport.clone(),
                config,
                Box::new(MemoryStore(saved.clone())),
                tx,
            );
            Self {
                service,
                transport,
                events,
                saved,
            }
        }

        fn event(&mut self, event: TransportEvent) {
            self.service.handle_transport_event(event, Instant::now());
        }

        fn command(&mut self, command: BluetoothCommand) {
            self.service.handle_command(command, Instant::now());
        }

        fn calls(&self) -> Vec<Call> {
            self.transport.0.lock().unwrap().calls.clone()
        }

        fn writes_to(&self, uuid: uuid::Uuid) -> Vec<Vec<u8>> {
            self.transport.0.lock().unwrap().writes_to(uuid)
        }

        fn drain(&mut self) -> Vec<AppEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Powered, connected and fully discovered
        fn connected() -> Self {
            let mut h = Self::new();
            h.event(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn));
            h.event(TransportEvent::Discovered {
                id: DeviceId("dev".to_string()),
                name: Some("ESP32_Headphone".to_string()),
                rssi: -50,
                handle: PERIPHERAL,
                services: vec![SERVICE_UUID],
            });
            h.command(BluetoothCommand::Connect(DeviceId("dev".to_string())));
            h.event(TransportEvent::Connected(PERIPHERAL));
            h.event(TransportEvent::ServicesDiscovered {
                handle: PERIPHERAL,
                services: vec![SERVICE_UUID, FRAME_SERVICE_UUID],
            });
            h.event(TransportEvent::CharacteristicsDiscovered {
                handle: PERIPHERAL,
                service: SERVICE_UUID,
                characteristics: vec![COMMAND_CHAR_UUID, STATUS_CHAR_UUID, DOCUMENT_CHAR_UUID],
            });
            h.event(TransportEvent::CharacteristicsDiscovered {
                handle: PERIPHERAL,
                service: FRAME_SERVICE_UUID,
                characteristics: vec![
                    FRAME_COMMAND_CHAR_UUID,
                    FRAME_RESPONSE_CHAR_UUID,
                    FRAME_DATA_CHAR_UUID,
                ],
            });
            h.drain();
            h.transport.0.lock().unwrap().clear();
            h
        }
    }

    fn transfer_states(events: &[AppEvent]) -> Vec<TransferState> {
        events
            .iter()
            .filter_map(|e| match e {
                AppEvent::Transfer(s) => Some(s.state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_flow() {
        let mut h = Harness::new();
        h.event(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn));
        assert_eq!(h.service.connection().state(), ConnectionState::Scanning);

        h.event(TransportEvent::Discovered {
            id: DeviceId("dev".to_string()),
            name: None,
            rssi: -70,
            handle: PERIPHERAL,
            services: vec![],
        });
        h.command(BluetoothCommand::Connect(DeviceId("dev".to_string())));
        assert_eq!(h.service.connection().state(), ConnectionState::Connecting);

        h.event(TransportEvent::Connected(PERIPHERAL));
        assert!(h.service.poller().is_running());

        let states: Vec<ConnectionState> = h
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::ConnectionStatus(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Scanning,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
        assert!(h
            .calls()
            .contains(&Call::DiscoverServices(PERIPHERAL, vec![SERVICE_UUID, FRAME_SERVICE_UUID])));
    }

    #[test]
    fn test_commands_and_status() {
        let mut h = Harness::connected();
        h.command(BluetoothCommand::SendCommand(SimpleCommand::Play));
        h.command(BluetoothCommand::RequestStatus);
        assert_eq!(
            h.writes_to(COMMAND_CHAR_UUID),
            vec![b"PLAY".to_vec(), b"GET_STATUS".to_vec()]
        );

        h.event(value(
            STATUS_CHAR_UUID,
            br#"{"playing":true,"volume":55,"battery":90,"signal":80}"#,
        ));
        assert_eq!(h.service.connection().device_status().unwrap().volume, 55);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, AppEvent::DeviceStatus(Some(s)) if s.playing)));
    }

    #[test]
    fn test_outbound_transfer_through_service() {
        let mut h = Harness::connected();
        h.command(BluetoothCommand::SendTransfer {
            kind: TransferKind::Image,
            file_name: Some("p.png".to_string()),
            data: b"hello".to_vec(),
        });
        assert_eq!(h.writes_to(FRAME_COMMAND_CHAR_UUID).len(), 1);

        h.event(value(FRAME_RESPONSE_CHAR_UUID, &[0x10, 0x46, 0x00, 0x00]));
        for _ in 0..3 {
            h.event(value(FRAME_RESPONSE_CHAR_UUID, &[0x10, 0x47, 0x00, 0x00]));
        }

        assert_eq!(h.writes_to(FRAME_DATA_CHAR_UUID).len(), 3);
        let states = transfer_states(&h.drain());
        assert_eq!(states.first(), Some(&TransferState::Starting));
        assert_eq!(states.last(), Some(&TransferState::Completed));
        assert!(h.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn test_transfer_rejected_when_disconnected() {
        let mut h = Harness::new();
        h.command(BluetoothCommand::SendTransfer {
            kind: TransferKind::File,
            file_name: None,
            data: vec![1, 2, 3],
        });
        assert!(h.calls().is_empty());
        assert!(h.service.engine().session().is_none());
    }

    #[test]
    fn test_disconnect_mid_transfer() {
        let mut h = Harness::connected();
        h.command(BluetoothCommand::SendTransfer {
            kind: TransferKind::File,
            file_name: None,
            data: b"hello".to_vec(),
        });
        h.event(value(FRAME_RESPONSE_CHAR_UUID, &[0x10, 0x46, 0x00, 0x00]));
        assert!(h.service.engine().is_in_flight());
        h.drain();

        h.event(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            reason: Some("link lost".to_string()),
        });

        assert!(!h.service.engine().is_in_flight());
        assert!(h.service.engine().session().is_none());
        assert!(!h.service.poller().is_running());
        assert!(h.service.connection().characteristics().frame_channels().is_none());
        assert_eq!(h.service.connection().state(), ConnectionState::Scanning);
        assert_eq!(transfer_states(&h.drain()), vec![TransferState::Failed]);

        // A late response for the old session is not misapplied
        h.event(value(FRAME_RESPONSE_CHAR_UUID, &[0x10, 0x47, 0x00, 0x00]));
        assert!(h.service.engine().session().is_none());
    }

    #[test]
    fn test_user_disconnect_tears_down_immediately() {
        let mut h = Harness::connected();
        h.command(BluetoothCommand::Disconnect);
        assert!(h.calls().contains(&Call::Disconnect(PERIPHERAL)));
        assert!(h.service.connection().characteristics().command.is_none());

        // The transport's echo of the same disconnect is harmless
        h.event(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            reason: None,
        });
        assert_eq!(h.service.connection().state(), ConnectionState::Scanning);
    }

    fn start_outbound(h: &mut Harness) {
        h.command(BluetoothCommand::SendTransfer {
            kind: TransferKind::File,
            file_name: None,
            data: b"hello".to_vec(),
        });
        h.event(value(FRAME_RESPONSE_CHAR_UUID, &[0x10, 0x46, 0x00, 0x00]));
    }

    #[test]
    fn test_unrelated_disconnect_keeps_link() {
        let mut h = Harness::connected();
        start_outbound(&mut h);

        h.event(TransportEvent::Disconnected {
            handle: PeripheralHandle(99),
            reason: None,
        });

        assert_eq!(h.service.connection().state(), ConnectionState::Connected);
        assert_eq!(
            h.service.engine().session().map(|s| s.state()),
            Some(TransferState::Transferring)
        );
        assert!(h.service.engine().is_in_flight());
        assert!(h.service.poller().is_running());
    }

    #[test]
    fn test_late_disconnect_echo_after_reconnect() {
        let mut h = Harness::connected();
        h.command(BluetoothCommand::Disconnect);

        let other = PeripheralHandle(4);
        h.event(TransportEvent::Discovered {
            id: DeviceId("other".to_string()),
            name: None,
            rssi: -45,
            handle: other,
            services: vec![SERVICE_UUID],
        });
        h.command(BluetoothCommand::Connect(DeviceId("other".to_string())));
        h.event(TransportEvent::Connected(other));
        assert!(h.service.connection().is_connected());

        // Echo of the earlier disconnect from the first device
        h.event(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            reason: None,
        });
        assert!(h.service.connection().is_connected());
        assert!(h.service.poller().is_running());
    }

    #[test]
    fn test_unrelated_connect_failure_keeps_transfers_available() {
        let mut h = Harness::connected();
        h.event(TransportEvent::ConnectFailed {
            handle: PeripheralHandle(9),
            reason: "x".to_string(),
        });
        assert!(h.service.connection().is_connected());

        start_outbound(&mut h);
        assert_eq!(h.writes_to(FRAME_DATA_CHAR_UUID).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_download_times_out() {
        let mut h = Harness::connected();
        h.command(BluetoothCommand::RequestDocument(TransferKind::Document));
        h.event(value(FRAME_RESPONSE_CHAR_UUID, &[0x10, 0x46, 0x00, 0x00]));
        h.event(value(FRAME_DATA_CHAR_UUID, &protocol::encode(0x47, b"ab").unwrap()));
        assert_eq!(
            h.service.engine().response_deadline(),
            Some(Instant::now() + Duration::from_secs(5))
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        h.service.handle_timers(Instant::now());
        assert_eq!(
            h.service.engine().session().map(|s| s.state()),
            Some(TransferState::Failed)
        );
        assert!(h.service.engine().response_deadline().is_none());

        h.command(BluetoothCommand::SendTransfer {
            kind: TransferKind::File,
            file_name: None,
            data: b"abc".to_vec(),
        });
        assert_eq!(h.writes_to(FRAME_COMMAND_CHAR_UUID).len(), 2);
    }

    #[test]
    fn test_frame_receive_saves_artifact() {
        let mut h = Harness::connected();
        h.command(BluetoothCommand::RequestDocument(TransferKind::Document));
        let mut ack = vec![0x10, 0x46, 0x00, 0x00];
        ack.extend_from_slice(&4u32.to_le_bytes());
        h.event(value(FRAME_RESPONSE_CHAR_UUID, &ack));
        h.event(value(FRAME_DATA_CHAR_UUID, &protocol::encode(0x47, b"ab").unwrap()));
        h.event(value(FRAME_DATA_CHAR_UUID, &protocol::encode(0x47, b"cd").unwrap()));

        assert_eq!(
            h.saved.lock().unwrap().as_slice(),
            &[(TransferKind::Document, b"abcd".to_vec())]
        );
        let events = h.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, AppEvent::DocumentReceived(text) if text == "abcd")));
        assert!(events
            .iter()
            .any(|e| matches!(e, AppEvent::ArtifactSaved(_))));
    }

    #[test]
    fn test_document_channel_acks_and_saves() {
        let mut h = Harness::connected();
        h.event(value(DOCUMENT_CHAR_UUID, b"TRANSFER_STARTED"));
        h.event(value(DOCUMENT_CHAR_UUID, b"Hello "));
        h.event(value(DOCUMENT_CHAR_UUID, b"CHUNK_RECEIVED"));
        h.event(value(DOCUMENT_CHAR_UUID, b"there"));
        h.event(value(DOCUMENT_CHAR_UUID, b"TRANSFER_COMPLETED"));

        assert_eq!(h.writes_to(COMMAND_CHAR_UUID), vec![b"ACK".to_vec()]);
        assert_eq!(
            h.saved.lock().unwrap().as_slice(),
            &[(TransferKind::Document, b"Hello there".to_vec())]
        );
        assert_eq!(
            transfer_states(&h.drain()).last(),
            Some(&TransferState::Completed)
        );
    }

    #[test]
    fn test_frame_write_failure_fails_transfer() {
        let mut h = Harness::connected();
        h.command(BluetoothCommand::SendTransfer {
            kind: TransferKind::File,
            file_name: None,
            data: b"abc".to_vec(),
        });
        h.event(TransportEvent::WriteFailed {
            characteristic: ch(FRAME_COMMAND_CHAR_UUID),
            reason: "gatt error".to_string(),
        });

        assert!(!h.service.engine().is_in_flight());
        assert_eq!(
            h.service.engine().session().unwrap().state(),
            TransferState::Failed
        );
    }

    #[test]
    fn test_cancel_transfer() {
        let mut h = Harness::connected();
        h.command(BluetoothCommand::SendTransfer {
            kind: TransferKind::File,
            file_name: None,
            data: b"abc".to_vec(),
        });
        h.command(BluetoothCommand::CancelTransfer);
        assert!(!h.service.engine().is_in_flight());
        assert_eq!(
            transfer_states(&h.drain()),
            vec![TransferState::Starting, TransferState::Failed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_timers() {
        let transport = SharedTransport::default();
        let (app_tx, mut app_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let service = HeadphoneService::new(
            transport.clone(),
            ServiceConfig::default(),
            Box::new(MemoryStore(Saved::default())),
            app_tx,
        );
        let worker = tokio::spawn(service.run(cmd_rx, event_rx));

        event_tx
            .send(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn))
            .unwrap();

        // Grace window passes without the accessory service: scan narrows
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(transport
            .0
            .lock()
            .unwrap()
            .calls
            .contains(&Call::StartScan(ScanFilter::Services(vec![SERVICE_UUID]))));

        event_tx
            .send(TransportEvent::Discovered {
                id: DeviceId("dev".to_string()),
                name: None,
                rssi: -40,
                handle: PERIPHERAL,
                services: vec![SERVICE_UUID],
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cmd_tx
            .send(BluetoothCommand::Connect(DeviceId("dev".to_string())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        event_tx.send(TransportEvent::Connected(PERIPHERAL)).unwrap();
        event_tx
            .send(TransportEvent::CharacteristicsDiscovered {
                handle: PERIPHERAL,
                service: SERVICE_UUID,
                characteristics: vec![COMMAND_CHAR_UUID],
            })
            .unwrap();
        event_tx
            .send(TransportEvent::CharacteristicsDiscovered {
                handle: PERIPHERAL,
                service: FRAME_SERVICE_UUID,
                characteristics: vec![
                    FRAME_COMMAND_CHAR_UUID,
                    FRAME_RESPONSE_CHAR_UUID,
                    FRAME_DATA_CHAR_UUID,
                ],
            })
            .unwrap();

        // Status polling once per second while connected
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let polls = transport.0.lock().unwrap().writes_to(COMMAND_CHAR_UUID);
        assert_eq!(polls, vec![b"GET_STATUS".to_vec(), b"GET_STATUS".to_vec()]);

        // An unanswered start command times out and fails the transfer
        cmd_tx
            .send(BluetoothCommand::SendTransfer {
                kind: TransferKind::File,
                file_name: None,
                data: b"abc".to_vec(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5100)).await;

        drop(cmd_tx);
        worker.await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = app_rx.try_recv() {
            if let AppEvent::Transfer(s) = event {
                states.push(s.state);
            }
        }
        assert_eq!(states, vec![TransferState::Starting, TransferState::Failed]);
    }
}
