//! Transfer sessions
//!
//! Chunking plus the send/receive session state machines driven by the
//! frame engine, and the sentinel-driven receiver for the document
//! characteristic.

use crate::domain::models::{TransferDirection, TransferKind, TransferSnapshot, TransferState};
use tracing::{debug, info, warn};

/// Split `data` into consecutive slices of at most `max_payload` bytes.
///
/// Empty input yields no chunks. `max_payload` must be non-zero.
pub fn prepare_chunks(data: &[u8], max_payload: usize) -> Vec<Vec<u8>> {
    assert!(max_payload > 0, "max_payload must be non-zero");
    data.chunks(max_payload).map(|c| c.to_vec()).collect()
}

/// Sentinel messages on the document characteristic
pub mod sentinel {
    pub const TRANSFER_STARTED: &str = "TRANSFER_STARTED";
    pub const TRANSFER_COMPLETED: &str = "TRANSFER_COMPLETED";
    pub const CHUNK_RECEIVED: &str = "CHUNK_RECEIVED";
    /// Written back to the command characteristic after `CHUNK_RECEIVED`
    pub const ACK: &str = "ACK";
}

#[derive(Debug)]
enum Payload {
    Outbound { chunks: Vec<Vec<u8>> },
    Inbound { buffer: Vec<u8>, expected: Option<usize> },
}

/// One send or receive operation.
#[derive(Debug)]
pub struct TransferSession {
    kind: TransferKind,
    file_name: Option<String>,
    payload: Payload,
    chunk_index: usize,
    progress: f32,
    state: TransferState,
    size_hint: usize,
}

impl TransferSession {
    /// Session that uploads `data` in chunks of at most `max_payload` bytes
    pub fn outbound(
        kind: TransferKind,
        file_name: Option<String>,
        data: &[u8],
        max_payload: usize,
    ) -> Self {
        Self {
            kind,
            file_name,
            payload: Payload::Outbound {
                chunks: prepare_chunks(data, max_payload),
            },
            chunk_index: 0,
            progress: 0.0,
            state: TransferState::Idle,
            size_hint: data.len(),
        }
    }

    /// Session that accumulates data pushed by the accessory.
    ///
    /// `size_hint` is used for progress until the accessory declares a total.
    pub fn inbound(kind: TransferKind, size_hint: usize) -> Self {
        Self {
            kind,
            file_name: None,
            payload: Payload::Inbound {
                buffer: Vec::new(),
                expected: None,
            },
            chunk_index: 0,
            progress: 0.0,
            state: TransferState::Idle,
            size_hint: size_hint.max(1),
        }
    }

    pub fn direction(&self) -> TransferDirection {
        match self.payload {
            Payload::Outbound { .. } => TransferDirection::Send,
            Payload::Inbound { .. } => TransferDirection::Receive,
        }
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    /// Number of outbound chunks; zero for inbound sessions
    pub fn total_chunks(&self) -> usize {
        match &self.payload {
            Payload::Outbound { chunks } => chunks.len(),
            Payload::Inbound { .. } => 0,
        }
    }

    /// Total bytes carried by an outbound session
    pub fn total_bytes(&self) -> usize {
        match &self.payload {
            Payload::Outbound { chunks } => chunks.iter().map(Vec::len).sum(),
            Payload::Inbound { buffer, .. } => buffer.len(),
        }
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            direction: self.direction(),
            kind: self.kind,
            state: self.state,
            progress: self.progress,
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks(),
        }
    }

    /// Start command has been written
    pub fn mark_starting(&mut self) {
        self.state = TransferState::Starting;
        self.chunk_index = 0;
        self.progress = 0.0;
    }

    /// Start acknowledged. For receive sessions `declared_total` replaces the size hint.
    pub fn begin(&mut self, declared_total: Option<usize>) {
        self.state = TransferState::Transferring;
        self.chunk_index = 0;
        self.progress = 0.0;
        if let Payload::Inbound { buffer, expected } = &mut self.payload {
            buffer.clear();
            *expected = declared_total;
        }
    }

    /// Chunk waiting to be sent at the current index
    pub fn current_chunk(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Outbound { chunks } if self.state == TransferState::Transferring => {
                chunks.get(self.chunk_index).map(Vec::as_slice)
            }
            _ => None,
        }
    }

    /// Record an acknowledged outbound chunk.
    ///
    /// Returns `true` when more chunks remain; otherwise the session is completed.
    pub fn advance(&mut self) -> bool {
        let total = self.total_chunks();
        self.chunk_index += 1;
        if self.chunk_index < total {
            self.progress = self.chunk_index as f32 / total as f32;
            true
        } else {
            self.complete();
            false
        }
    }

    /// Append inbound bytes. Returns `true` once the declared total has been reached.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let size_hint = self.size_hint;
        let Payload::Inbound { buffer, expected } = &mut self.payload else {
            warn!("Ignoring inbound bytes on an outbound session");
            return false;
        };
        buffer.extend_from_slice(bytes);
        self.chunk_index += 1;

        let total = expected.unwrap_or(size_hint).max(1);
        let reached = matches!(expected, Some(n) if buffer.len() >= *n);
        // Without a declared total the estimate never claims completion
        let ceiling = if expected.is_some() { 1.0 } else { 0.99 };
        self.progress = (buffer.len() as f32 / total as f32).min(ceiling);
        reached
    }

    /// Mark the session finished. Inbound sessions hand back their buffer.
    pub fn complete(&mut self) -> Option<Vec<u8>> {
        self.state = TransferState::Completed;
        self.progress = 1.0;
        match &mut self.payload {
            Payload::Outbound { chunks } => {
                chunks.clear();
                None
            }
            Payload::Inbound { buffer, .. } => Some(std::mem::take(buffer)),
        }
    }

    /// Mark the session failed and release its buffers.
    pub fn fail(&mut self) {
        self.state = TransferState::Failed;
        self.chunk_index = 0;
        match &mut self.payload {
            Payload::Outbound { chunks } => chunks.clear(),
            Payload::Inbound { buffer, .. } => *buffer = Vec::new(),
        }
    }
}

/// What the caller must do after a document-channel message.
#[derive(Debug, PartialEq)]
pub enum DocumentAction {
    None,
    /// Write the acknowledgement back to the accessory
    SendAck,
    /// Progress changed
    Progress(TransferSnapshot),
    /// The finished artifact
    Completed(Vec<u8>),
}

/// Receiver for the document characteristic, driven by sentinel text
/// messages interleaved with raw chunks.
#[derive(Debug)]
pub struct DocumentReceiver {
    session: Option<TransferSession>,
    size_hint: usize,
}

impl DocumentReceiver {
    pub fn new(size_hint: usize) -> Self {
        Self {
            session: None,
            size_hint,
        }
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    pub fn is_receiving(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.state().is_active())
            .unwrap_or(false)
    }

    fn arm(&mut self) -> &mut TransferSession {
        let mut session = TransferSession::inbound(TransferKind::Document, self.size_hint);
        session.begin(None);
        self.session.insert(session)
    }

    /// Handle one notification from the document characteristic
    pub fn handle(&mut self, value: &[u8]) -> DocumentAction {
        let text = std::str::from_utf8(value).map(str::trim).unwrap_or("");

        match text {
            sentinel::TRANSFER_STARTED => {
                info!("Document transfer started");
                let session = self.arm();
                DocumentAction::Progress(session.snapshot())
            }
            sentinel::TRANSFER_COMPLETED => match self.session.as_mut() {
                Some(session) if session.state().is_active() => {
                    let artifact = session.complete().unwrap_or_default();
                    info!("Document transfer completed ({} bytes)", artifact.len());
                    DocumentAction::Completed(artifact)
                }
                _ => {
                    warn!("Transfer completion without an active document transfer");
                    DocumentAction::None
                }
            },
            sentinel::CHUNK_RECEIVED => DocumentAction::SendAck,
            _ => {
                if !self.is_receiving() {
                    debug!("Chunk before transfer start, arming receiver");
                    self.arm();
                }
                match self.session.as_mut() {
                    Some(session) => {
                        session.append(value);
                        DocumentAction::Progress(session.snapshot())
                    }
                    None => DocumentAction::None,
                }
            }
        }
    }

    /// Drop any partial document. Returns the failed snapshot if one was active.
    pub fn reset(&mut self) -> Option<TransferSnapshot> {
        let mut session = self.session.take()?;
        if session.state().is_active() {
            session.fail();
            Some(session.snapshot())
        } else {
            None
        }
    }
}
