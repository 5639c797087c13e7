//! Bluetooth Module
//!
//! BLE link to the headphone accessory: discovery, connection, the simple
//! text command channel and the framed transfer protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    HeadphoneService                      │
//! │   (single task: commands, transport events, timers)      │
//! └──────┬──────────────┬──────────────┬──────────────┬─────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌─────────────┐ ┌──────────┐
//! │ Connection │ │  Commands  │ │ FrameEngine │ │ Protocol │
//! │ + Scanner  │ │            │ │             │ │          │
//! │ - registry │ │ - PLAY ... │ │ - in-flight │ │ - UUIDs  │
//! │ - GATT     │ │ - polling  │ │ - sessions  │ │ - frames │
//! └─────┬──────┘ └────────────┘ └─────────────┘ └──────────┘
//!       │
//!       ▼
//! ┌──────────────────────────────┐
//! │ Transport (BLE stack / sim)  │
//! └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - BLE stack capability and its callback events
//! - [`protocol`] - UUIDs, frame codec and transfer metadata
//! - [`scanner`] - Broad then filtered discovery
//! - [`connection`] - Device registry, connection lifecycle, GATT handles
//! - [`commands`] - Text commands and status polling
//! - [`frame_engine`] - One-command-in-flight transfer engine
//! - [`service`] - Main service coordinator
//! - [`simulator`] - In-process accessory for running without hardware

pub mod commands;
pub mod connection;
pub mod frame_engine;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulator;
pub mod transport;

// Re-export main service for convenience
pub use service::{HeadphoneService, ServiceConfig};
