//! Line-oriented front end for the Bluetooth worker.

use crate::domain::models::{
    AppEvent, BluetoothCommand, ConnectionState, Device, DeviceId, MessageSeverity,
    SimpleCommand, TransferKind, TransferSnapshot, TransferState,
};
use crate::domain::settings::SettingsService;
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

const HELP: &str = "\
Commands:
  scan                      start scanning
  stop                      stop scanning
  devices                   list discovered devices
  connect <n|id>            connect to device number n or by id
  disconnect
  play | pause | vol+ | vol-
  status                    request a status update
  raw <text>                send a raw text command
  send <path> [kind]        upload a file (kind: image, document, file)
  fetch [kind]              download from the accessory (default: document)
  cancel                    cancel the running transfer
  help | quit";

#[derive(Debug, PartialEq)]
pub enum ConsoleAction {
    Send(BluetoothCommand),
    SendFile { path: PathBuf, kind: TransferKind },
    ListDevices,
    Help,
    Quit,
}

fn parse_kind(word: &str) -> Result<TransferKind> {
    match word.to_lowercase().as_str() {
        "image" | "img" => Ok(TransferKind::Image),
        "document" | "doc" | "text" => Ok(TransferKind::Document),
        "file" | "bin" => Ok(TransferKind::File),
        other => bail!("Unknown transfer kind '{}'", other),
    }
}

/// Guess the transfer kind from a file extension
fn kind_for_path(path: &Path) -> TransferKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    match ext.as_deref() {
        Some("png" | "jpg" | "jpeg" | "bmp" | "gif") => TransferKind::Image,
        Some("txt" | "md") => TransferKind::Document,
        _ => TransferKind::File,
    }
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str, devices: &[Device]) -> Result<Option<ConsoleAction>> {
    let line = line.trim();
    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map(|(w, r)| (w, r.trim()))
        .unwrap_or((line, ""));

    let action = match word.to_lowercase().as_str() {
        "" => return Ok(None),
        "scan" => ConsoleAction::Send(BluetoothCommand::StartScan),
        "stop" => ConsoleAction::Send(BluetoothCommand::StopScan),
        "devices" | "ls" => ConsoleAction::ListDevices,
        "connect" => {
            if rest.is_empty() {
                bail!("Usage: connect <n|id>");
            }
            let id = match rest.parse::<usize>() {
                Ok(n) => devices
                    .get(n.wrapping_sub(1))
                    .map(|d| d.id.clone())
                    .ok_or_else(|| anyhow!("No device number {}", n))?,
                Err(_) => DeviceId(rest.to_string()),
            };
            ConsoleAction::Send(BluetoothCommand::Connect(id))
        }
        "disconnect" => ConsoleAction::Send(BluetoothCommand::Disconnect),
        "play" => ConsoleAction::Send(BluetoothCommand::SendCommand(SimpleCommand::Play)),
        "pause" => ConsoleAction::Send(BluetoothCommand::SendCommand(SimpleCommand::Pause)),
        "vol+" => ConsoleAction::Send(BluetoothCommand::SendCommand(SimpleCommand::VolumeUp)),
        "vol-" => ConsoleAction::Send(BluetoothCommand::SendCommand(SimpleCommand::VolumeDown)),
        "status" => ConsoleAction::Send(BluetoothCommand::RequestStatus),
        "raw" => {
            if rest.is_empty() {
                bail!("Usage: raw <text>");
            }
            ConsoleAction::Send(BluetoothCommand::RawCommand(rest.to_string()))
        }
        "send" => {
            let mut args = rest.split_whitespace();
            let path = args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("Usage: send <path> [kind]"))?;
            let kind = match args.next() {
                Some(kind) => parse_kind(kind)?,
                None => kind_for_path(&path),
            };
            ConsoleAction::SendFile { path, kind }
        }
        "fetch" => {
            let kind = if rest.is_empty() {
                TransferKind::Document
            } else {
                parse_kind(rest)?
            };
            ConsoleAction::Send(BluetoothCommand::RequestDocument(kind))
        }
        "cancel" => ConsoleAction::Send(BluetoothCommand::CancelTransfer),
        "help" | "?" => ConsoleAction::Help,
        "quit" | "exit" => ConsoleAction::Quit,
        other => bail!("Unknown command '{}', try 'help'", other),
    };
    Ok(Some(action))
}

fn describe_transfer(snapshot: &TransferSnapshot) -> String {
    let state = match snapshot.state {
        TransferState::Idle => "idle",
        TransferState::Starting => "starting",
        TransferState::Transferring => "transferring",
        TransferState::Completed => "completed",
        TransferState::Failed => "failed",
    };
    format!(
        "{:?} {}: {} {:.0}% ({}/{})",
        snapshot.direction,
        snapshot.kind,
        state,
        snapshot.progress * 100.0,
        snapshot.chunk_index,
        snapshot.total_chunks
    )
}

pub struct Console {
    settings: SettingsService,
    commands: mpsc::UnboundedSender<BluetoothCommand>,
    devices: Vec<Device>,
    state: ConnectionState,
}

impl Console {
    pub fn new(
        settings: SettingsService,
        commands: mpsc::UnboundedSender<BluetoothCommand>,
    ) -> Self {
        Self {
            settings,
            commands,
            devices: Vec::new(),
            state: ConnectionState::Idle,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Track an event and return the line to print for it, if any
    pub fn render(&mut self, event: AppEvent) -> Option<String> {
        match event {
            AppEvent::ConnectionStatus(state) => {
                self.state = state;
                if state == ConnectionState::Connected {
                    self.remember_connected();
                }
                Some(format!("[state] {:?}", state))
            }
            AppEvent::AdapterAvailability(available) => Some(format!(
                "[adapter] {}",
                if available { "available" } else { "unavailable" }
            )),
            AppEvent::DevicesUpdated(devices) => {
                let added = devices.len() > self.devices.len();
                self.devices = devices;
                added.then(|| {
                    let device = &self.devices[self.devices.len() - 1];
                    format!(
                        "[found] {}. {} ({} dBm)",
                        self.devices.len(),
                        device.name,
                        device.rssi
                    )
                })
            }
            AppEvent::DeviceStatus(Some(status)) => Some(format!(
                "[status] {} | volume {}% | battery {}% | signal {}%",
                if status.playing { "playing" } else { "paused" },
                status.volume,
                status.battery,
                status.signal
            )),
            AppEvent::DeviceStatus(None) => None,
            AppEvent::Transfer(snapshot) => {
                Some(format!("[transfer] {}", describe_transfer(&snapshot)))
            }
            AppEvent::DocumentReceived(text) => Some(format!("[document]\n{}", text.trim_end())),
            AppEvent::ArtifactSaved(path) => Some(format!("[saved] {}", path.display())),
            AppEvent::LogMessage(message) => {
                let tag = match message.severity {
                    MessageSeverity::Info => "info",
                    MessageSeverity::Success => "ok",
                    MessageSeverity::Warning => "warn",
                    MessageSeverity::Error => "error",
                };
                Some(format!("[{}] {}", tag, message.message))
            }
        }
    }

    fn remember_connected(&mut self) {
        let Some(device) = self.devices.iter().find(|d| d.is_connected) else {
            return;
        };
        let id = device.id.0.clone();
        if let Err(e) = self.settings.remember_device(&id) {
            warn!("Failed to save last connected device: {}", e);
        }
    }

    fn list_devices(&self) -> String {
        if self.devices.is_empty() {
            return "No devices found".to_string();
        }
        let last = self.settings.get().last_connected_device.as_deref();
        self.devices
            .iter()
            .enumerate()
            .map(|(i, d)| {
                format!(
                    "{:>2}. {} [{}] {} dBm{}{}",
                    i + 1,
                    d.name,
                    d.id,
                    d.rssi,
                    if d.is_connected { " (connected)" } else { "" },
                    if last == Some(d.id.0.as_str()) { " (last used)" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn send(&self, command: BluetoothCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("Bluetooth worker has stopped"))
    }

    /// Returns `false` when the console should exit
    async fn dispatch(&mut self, action: ConsoleAction) -> Result<bool> {
        match action {
            ConsoleAction::Send(command) => self.send(command)?,
            ConsoleAction::SendFile { path, kind } => {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Could not read {}", path.display()))?;
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string);
                info!("Queueing {} ({} bytes)", path.display(), data.len());
                self.send(BluetoothCommand::SendTransfer {
                    kind,
                    file_name,
                    data,
                })?;
            }
            ConsoleAction::ListDevices => println!("{}", self.list_devices()),
            ConsoleAction::Help => println!("{}", HELP),
            ConsoleAction::Quit => return Ok(false),
        }
        Ok(true)
    }

    /// Read commands from stdin and print events until quit or end of input
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<AppEvent>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("Type 'help' for commands.");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_line(&line, &self.devices) {
                        Ok(Some(action)) => {
                            match self.dispatch(action).await {
                                Ok(true) => {}
                                Ok(false) => break,
                                Err(e) => println!("[error] {:#}", e),
                            }
                        }
                        Ok(None) => {}
                        Err(e) => println!("[error] {}", e),
                    }
                }
                Some(event) = events.recv() => {
                    if let Some(line) = self.render(event) {
                        println!("{}", line);
                    }
                }
            }
        }

        if self.state == ConnectionState::Connected {
            let _ = self.send(BluetoothCommand::Disconnect);
        }
        Ok(())
    }
}
