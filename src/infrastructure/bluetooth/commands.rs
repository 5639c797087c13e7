//! Simple command channel and status polling
//!
//! Text commands are written with response but carry no application-level
//! acknowledgement. Without a command characteristic they are dropped.

use crate::domain::models::SimpleCommand;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{CharacteristicHandle, Transport, WriteKind};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Write a text command. Returns `Ok(false)` when there is nowhere to send it.
pub fn send_text(
    transport: &mut dyn Transport,
    characteristic: Option<CharacteristicHandle>,
    text: &str,
) -> Result<bool, TransportError> {
    let Some(characteristic) = characteristic else {
        debug!("No command characteristic, dropping {:?}", text);
        return Ok(false);
    };
    debug!("Command: {}", text);
    transport.write(characteristic, text.as_bytes(), WriteKind::WithResponse)?;
    Ok(true)
}

pub fn send_command(
    transport: &mut dyn Transport,
    characteristic: Option<CharacteristicHandle>,
    command: SimpleCommand,
) -> Result<bool, TransportError> {
    send_text(transport, characteristic, command.as_str())
}

pub fn request_status(
    transport: &mut dyn Transport,
    characteristic: Option<CharacteristicHandle>,
) -> Result<bool, TransportError> {
    send_command(transport, characteristic, SimpleCommand::GetStatus)
}

/// Fires a status request once per interval while connected
pub struct StatusPoller {
    interval: Duration,
    next_due: Option<Instant>,
}

impl StatusPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    /// Start polling; the first request is due after one interval
    pub fn start(&mut self, now: Instant) {
        self.next_due = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    /// Returns `true` if a poll is due, and schedules the next one
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next_due {
            Some(due) if now >= due => {
                self.next_due = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}
