//! Link engine for a BLE motion-sensing wearable: connection lifecycle,
//! serialized configuration writes, telemetry reassembly and the device
//! pairing handshake.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{AppEvent, LinkCommand, TelemetrySample};
pub use error::{EnvelopeError, LinkError, ServiceError};
pub use infrastructure::bluetooth::{LinkService, LinkSession, LinkState};
