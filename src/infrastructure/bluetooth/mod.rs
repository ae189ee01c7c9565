//! Bluetooth Module
//!
//! Peripheral communication engine for the wearable motion sensor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LinkService                         │
//! │  (commands, transport events, pairing outcomes → 1 task) │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌───────────┐  ┌─────────────┐  ┌──────────────┐
//! │BtleBackend│  │ LinkSession │  │ BtleTransport│
//! │           │  │             │  │              │
//! │ - BLE     │  │ - Queue     │  │ - btleplug   │
//! │ discovery │  │ - Reassembly│  │   GATT ops   │
//! │           │  │ - Pairing   │  │              │
//! └───────────┘  └─────────────┘  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Channel identifiers and wire constants
//! - [`transport`] - Transport seam and inbound transport events
//! - [`queue`] - Single-flight write queue
//! - [`reassembler`] - Telemetry framing and envelope decoding
//! - [`session`] - Link state machine and event dispatch
//! - [`backend`] - Scanning and link opening behind one seam
//! - [`btle`] - btleplug transport
//! - [`scanner`] - BLE device discovery
//! - [`service`] - Async event loop driving the session

pub mod backend;
pub mod btle;
pub mod protocol;
pub mod queue;
pub mod reassembler;
pub mod scanner;
pub mod service;
pub mod session;
pub mod transport;

// Re-export main service for convenience
pub use backend::{BtleBackend, LinkBackend};
pub use service::{LinkService, PairingBackend};
pub use session::{LinkSession, LinkState};
pub use transport::{Transport, TransportEvent};
