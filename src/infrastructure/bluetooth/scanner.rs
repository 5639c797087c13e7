//! BLE Scanner Module
//!
//! Discovery runs an unfiltered sweep first so nearby devices show up
//! quickly, then narrows to the accessory service if it was not seen
//! within the grace window.

use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{ScanFilter, Transport};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    /// Unfiltered discovery
    Broad,
    /// Discovery filtered by the accessory service
    Filtered,
}

pub struct BleScanner {
    target_service: Uuid,
    grace: Duration,
    phase: Option<ScanPhase>,
    grace_deadline: Option<Instant>,
    target_seen: bool,
}

impl BleScanner {
    pub fn new(target_service: Uuid, grace: Duration) -> Self {
        Self {
            target_service,
            grace,
            phase: None,
            grace_deadline: None,
            target_seen: false,
        }
    }

    /// Start an unfiltered sweep and arm the grace window
    pub fn start(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<(), TransportError> {
        self.stop(transport)?;

        info!("Starting BLE scan (unfiltered)");
        transport.start_scan(ScanFilter::All)?;
        self.phase = Some(ScanPhase::Broad);
        self.grace_deadline = Some(now + self.grace);
        self.target_seen = false;
        Ok(())
    }

    /// Note the services advertised by a discovered peripheral
    pub fn observe(&mut self, services: &[Uuid]) {
        if services.contains(&self.target_service) {
            self.target_seen = true;
        }
    }

    /// Called once the grace deadline passes
    pub fn on_grace_elapsed(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<(), TransportError> {
        self.grace_deadline = None;
        if self.phase != Some(ScanPhase::Broad) || self.target_seen {
            return Ok(());
        }

        info!(
            "Accessory service not seen, narrowing scan to {}",
            self.target_service
        );
        transport.stop_scan()?;
        transport.start_scan(ScanFilter::Services(vec![self.target_service]))?;
        self.phase = Some(ScanPhase::Filtered);
        Ok(())
    }

    /// Stop scanning
    pub fn stop(&mut self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        if self.phase.is_some() {
            info!("Stopping BLE scan...");
            self.halt();
            transport.stop_scan()?;
        }
        Ok(())
    }

    /// Forget the scan without touching the radio (adapter went away)
    pub fn halt(&mut self) {
        self.phase = None;
        self.grace_deadline = None;
        self.target_seen = false;
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.phase.is_some()
    }

    pub fn phase(&self) -> Option<ScanPhase> {
        self.phase
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        self.grace_deadline
    }
}
