//! Frame Protocol Engine
//!
//! Gates the frame protocol to one outstanding command, and advances the
//! active transfer session from the responses and data frames the
//! accessory sends back. Chunks are never pipelined: each one waits for
//! the acknowledgement of the previous one.

use crate::domain::models::{TransferDirection, TransferKind, TransferSnapshot, TransferState};
use crate::domain::transfer::TransferSession;
use crate::error::{FrameError, TransferError};
use crate::infrastructure::bluetooth::connection::FrameChannels;
use crate::infrastructure::bluetooth::protocol::{self, CommandCode, Response};
use crate::infrastructure::bluetooth::transport::{CharacteristicHandle, Transport, WriteKind};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Result of feeding the engine a response, data frame or timer
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Progress(TransferSnapshot),
    Completed {
        snapshot: TransferSnapshot,
        /// Assembled bytes of a receive session
        artifact: Option<Vec<u8>>,
        file_name: Option<String>,
    },
    Failed {
        snapshot: TransferSnapshot,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    command: u8,
    deadline: Instant,
}

/// Engine tuning
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Largest chunk payload the link carries reliably
    pub max_payload: usize,
    pub response_timeout: Duration,
    /// Assumed size of a receive transfer with no declared total
    pub receive_size_hint: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_payload: 12,
            response_timeout: Duration::from_secs(5),
            receive_size_hint: 1024 * 1024,
        }
    }
}

pub struct FrameEngine {
    config: EngineConfig,
    in_flight: Option<InFlight>,
    session: Option<TransferSession>,
    /// Inbound sessions fail if no data frame arrives before this
    idle_deadline: Option<Instant>,
}

impl FrameEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            in_flight: None,
            session: None,
            idle_deadline: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    /// Next point at which the active transfer times out: the outstanding
    /// command's response, or the next data frame of an inbound transfer
    pub fn response_deadline(&self) -> Option<Instant> {
        [self.in_flight.map(|f| f.deadline), self.idle_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Write one frame. Rejected while a previous command awaits its response.
    pub fn send(
        &mut self,
        transport: &mut dyn Transport,
        target: CharacteristicHandle,
        command: u8,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), FrameError> {
        if let Some(pending) = self.in_flight {
            warn!(
                "Dropping command {:#04x}: {:#04x} still awaiting response",
                command, pending.command
            );
            return Err(FrameError::Busy);
        }

        let frame = protocol::encode(command, payload)?;
        trace!("Frame out: {:02X?}", frame);
        transport.write(target, &frame, WriteKind::WithResponse)?;
        self.in_flight = Some(InFlight {
            command,
            deadline: now + self.config.response_timeout,
        });
        Ok(())
    }

    fn check_can_start(&self) -> Result<(), TransferError> {
        if self.session.as_ref().is_some_and(|s| s.state().is_active()) {
            warn!("Transfer rejected: another transfer is running");
            return Err(TransferError::AlreadyActive);
        }
        if self.in_flight.is_some() {
            return Err(FrameError::Busy.into());
        }
        Ok(())
    }

    /// Begin uploading `data` to the accessory
    pub fn start_send(
        &mut self,
        transport: &mut dyn Transport,
        channels: Option<FrameChannels>,
        kind: TransferKind,
        file_name: Option<String>,
        data: &[u8],
        now: Instant,
    ) -> Result<TransferSnapshot, TransferError> {
        self.check_can_start()?;
        let channels = channels.ok_or(FrameError::NotReady)?;

        let mut session = TransferSession::outbound(kind, file_name, data, self.config.max_payload);
        let metadata = protocol::send_metadata(kind, session.file_name(), session.total_bytes());
        self.send(
            transport,
            channels.command,
            CommandCode::StartTransfer.as_byte(),
            &metadata,
            now,
        )?;

        info!(
            "Sending {} of {} bytes in {} chunks",
            kind,
            data.len(),
            session.total_chunks()
        );
        session.mark_starting();
        let snapshot = session.snapshot();
        self.session = Some(session);
        Ok(snapshot)
    }

    /// Ask the accessory to push a transfer of `kind`
    pub fn start_receive(
        &mut self,
        transport: &mut dyn Transport,
        channels: Option<FrameChannels>,
        kind: TransferKind,
        now: Instant,
    ) -> Result<TransferSnapshot, TransferError> {
        self.check_can_start()?;
        let channels = channels.ok_or(FrameError::NotReady)?;

        self.send(
            transport,
            channels.command,
            CommandCode::StartTransfer.as_byte(),
            &protocol::receive_metadata(kind),
            now,
        )?;

        info!("Requesting {} from accessory", kind);
        let mut session = TransferSession::inbound(kind, self.config.receive_size_hint);
        session.mark_starting();
        let snapshot = session.snapshot();
        self.session = Some(session);
        Ok(snapshot)
    }

    /// Handle a notification from the response characteristic
    pub fn handle_response(
        &mut self,
        transport: &mut dyn Transport,
        channels: Option<FrameChannels>,
        bytes: &[u8],
        now: Instant,
    ) -> Option<FrameOutcome> {
        let response = match protocol::decode_response(bytes) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping malformed response: {}", e);
                return None;
            }
        };
        debug!(
            "Response to {:#04x}, status {:#04x}",
            response.command, response.status
        );

        self.in_flight = None;

        match CommandCode::from_byte(response.command) {
            Some(CommandCode::StartTransfer) => {
                self.on_start_response(transport, channels, &response, now)
            }
            Some(CommandCode::Chunk) => self.on_chunk_response(transport, channels, &response, now),
            None => {
                warn!("Ignoring response to unknown command {:#04x}", response.command);
                None
            }
        }
    }

    fn on_start_response(
        &mut self,
        transport: &mut dyn Transport,
        channels: Option<FrameChannels>,
        response: &Response,
        now: Instant,
    ) -> Option<FrameOutcome> {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.state() == TransferState::Starting)
        else {
            warn!("Start response without a pending transfer");
            return None;
        };

        if !response.is_success() {
            return self.fail_active(format!(
                "start rejected with status {:#04x}",
                response.status
            ));
        }

        match session.direction() {
            TransferDirection::Send => {
                session.begin(None);
                self.send_current_chunk(transport, channels, now)
            }
            TransferDirection::Receive => {
                session.begin(protocol::declared_total(&response.payload));
                self.idle_deadline = Some(now + self.config.response_timeout);
                Some(FrameOutcome::Progress(session.snapshot()))
            }
        }
    }

    fn on_chunk_response(
        &mut self,
        transport: &mut dyn Transport,
        channels: Option<FrameChannels>,
        response: &Response,
        now: Instant,
    ) -> Option<FrameOutcome> {
        let Some(session) = self.session.as_mut().filter(|s| {
            s.state() == TransferState::Transferring && s.direction() == TransferDirection::Send
        }) else {
            warn!("Chunk response without an outbound transfer");
            return None;
        };

        if !response.is_success() {
            let reason = format!(
                "chunk {} rejected with status {:#04x}",
                session.chunk_index(),
                response.status
            );
            return self.fail_active(reason);
        }

        if session.advance() {
            self.send_current_chunk(transport, channels, now)
        } else {
            info!("Transfer completed");
            Some(FrameOutcome::Completed {
                snapshot: session.snapshot(),
                artifact: None,
                file_name: session.file_name().map(str::to_string),
            })
        }
    }

    fn send_current_chunk(
        &mut self,
        transport: &mut dyn Transport,
        channels: Option<FrameChannels>,
        now: Instant,
    ) -> Option<FrameOutcome> {
        let session = self.session.as_mut()?;
        let Some(chunk) = session.current_chunk().map(<[u8]>::to_vec) else {
            // Nothing to send: an empty payload completes immediately
            session.complete();
            return Some(FrameOutcome::Completed {
                snapshot: session.snapshot(),
                artifact: None,
                file_name: session.file_name().map(str::to_string),
            });
        };

        let Some(channels) = channels else {
            return self.fail_active("frame characteristics unavailable".to_string());
        };

        match self.send(
            transport,
            channels.data,
            CommandCode::Chunk.as_byte(),
            &chunk,
            now,
        ) {
            Ok(()) => self
                .session
                .as_ref()
                .map(|s| FrameOutcome::Progress(s.snapshot())),
            Err(e) => self.fail_active(format!("chunk write failed: {}", e)),
        }
    }

    /// Handle a notification from the data characteristic
    pub fn handle_data(&mut self, bytes: &[u8], now: Instant) -> Option<FrameOutcome> {
        let frame = match protocol::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed data frame: {}", e);
                return None;
            }
        };
        if frame.command != CommandCode::Chunk.as_byte() {
            debug!("Ignoring data frame with command {:#04x}", frame.command);
            return None;
        }

        let Some(session) = self.session.as_mut().filter(|s| {
            s.state() == TransferState::Transferring && s.direction() == TransferDirection::Receive
        }) else {
            debug!("Data frame without an inbound transfer");
            return None;
        };

        // An empty frame marks the end of a transfer with no declared size
        let finished = frame.payload.is_empty() || session.append(&frame.payload);
        if finished {
            self.idle_deadline = None;
            let artifact = session.complete();
            info!(
                "Received {} ({} bytes)",
                session.kind(),
                artifact.as_ref().map(Vec::len).unwrap_or(0)
            );
            Some(FrameOutcome::Completed {
                snapshot: session.snapshot(),
                artifact,
                file_name: session.file_name().map(str::to_string),
            })
        } else {
            self.idle_deadline = Some(now + self.config.response_timeout);
            Some(FrameOutcome::Progress(session.snapshot()))
        }
    }

    /// Fail the transfer if its outstanding command or inbound data stream
    /// has been silent too long
    pub fn check_timeout(&mut self, now: Instant) -> Option<FrameOutcome> {
        if let Some(pending) = self.in_flight.filter(|f| now >= f.deadline) {
            warn!("No response to command {:#04x}", pending.command);
            self.in_flight = None;
            return self.fail_active("timed out".to_string());
        }

        if self.idle_deadline.is_some_and(|d| now >= d) {
            warn!("No data frame before the deadline");
            return self.fail_active("timed out".to_string());
        }
        None
    }

    /// A write on a frame characteristic failed; its response will never come
    pub fn handle_write_failed(&mut self, reason: &str) -> Option<FrameOutcome> {
        self.in_flight.take()?;
        self.fail_active(format!("write failed: {}", reason))
    }

    pub fn cancel(&mut self) -> Option<FrameOutcome> {
        self.in_flight = None;
        self.fail_active("cancelled".to_string())
    }

    /// Drop all protocol state after a disconnect
    pub fn reset(&mut self) -> Option<FrameOutcome> {
        self.in_flight = None;
        let outcome = self.fail_active("disconnected".to_string());
        self.session = None;
        outcome
    }

    fn fail_active(&mut self, reason: String) -> Option<FrameOutcome> {
        self.idle_deadline = None;
        let session = self.session.as_mut().filter(|s| s.state().is_active())?;
        warn!("Transfer failed: {}", reason);
        session.fail();
        Some(FrameOutcome::Failed {
            snapshot: session.snapshot(),
            reason,
        })
    }
}
