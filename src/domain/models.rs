use serde::{Deserialize, Serialize};

/// One orientation quaternion, components in transmitted order
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl TelemetrySample {
    pub const fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    pub fn components(&self) -> [f32; 4] {
        [self.w, self.x, self.y, self.z]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    ConnectionStatus(ConnectionStatus),
    /// Samples decoded from one envelope, delivered together
    TelemetryBatch(Vec<TelemetrySample>),
    /// The last command of a write batch of this kind was acknowledged
    ConfigApplied(BatchKind),
    Pairing(PairingSnapshot),
    DeviceFound(ScannedDevice),
    LogMessage(StatusMessage),
}

/// Which command produced a write batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Wifi,
    Config,
    Finish,
    UserId,
}

/// Commands issued by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    StartScan,
    StopScan,
    Connect(String),
    SendWifi { ssid: String, password: String },
    SendConfig(Vec<(String, String)>),
    FinishExperiment,
    EnableTelemetry,
    EnableIdentity,
    ReadTelemetryOnce,
    SetUserId(Option<String>),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected { device_name: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PairingPhase {
    #[default]
    AwaitingIdentity,
    Exchanging,
    Ready,
    Error,
}

/// Read-only mirror of the pairing state handed to presentation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PairingSnapshot {
    pub phase: PairingPhase,
    pub esp_device_id: Option<String>,
    pub server_device_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub signal_strength: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
