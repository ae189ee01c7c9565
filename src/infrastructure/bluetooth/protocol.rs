//! Wearable Peripheral Protocol
//!
//! Channel identifiers, channel groups and the small set of wire constants
//! shared with the peripheral firmware.

use uuid::Uuid;

/// Bluetooth base UUID; 16-bit identifiers occupy bits 96..112.
/// Template: `0000xxxx-0000-1000-8000-00805F9B34FB`
pub const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Client Characteristic Configuration Descriptor
pub const CCCD_SHORT_ID: u16 = 0x2902;

/// Value written to the CCCD to enable notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Payload written to apply / finish trigger channels
pub const TRIGGER_PAYLOAD: [u8; 1] = [0x01];

/// Transmission unit requested right after the link comes up
pub const DESIRED_MTU: u16 = 500;

/// Expand a 16-bit identifier into the full 128-bit UUID
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Extract the 16-bit identifier from a UUID built on the base template
pub fn short_id(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = ((value >> 96) & 0xFFFF) as u16;
    ((value & !(0xFFFF_u128 << 96)) == BASE_UUID).then_some(short)
}

pub fn cccd_uuid() -> Uuid {
    short_uuid(CCCD_SHORT_ID)
}

/// A named group of related channels ("service")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelGroup {
    Wifi,
    DeviceConfig,
    Telemetry,
}

impl ChannelGroup {
    pub const fn short_id(self) -> u16 {
        match self {
            Self::Wifi => 0xFFF0,
            Self::DeviceConfig => 0xFFF4,
            Self::Telemetry => 0xFFF8,
        }
    }

    pub fn uuid(self) -> Uuid {
        short_uuid(self.short_id())
    }
}

/// One logical read/write/notify endpoint on the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Wi-Fi network name (write)
    WifiSsid,
    /// Wi-Fi password (write)
    WifiPassword,
    /// Apply Wi-Fi credentials (write trigger)
    WifiApply,
    /// Experiment name parameter (write)
    ExperimentName,
    /// Sampling interval in milliseconds (write)
    SamplingMs,
    /// Apply device configuration (write trigger)
    ConfigApply,
    /// End the running experiment (write trigger)
    FinishExperiment,
    /// Peripheral-reported identity (notify)
    DeviceId,
    /// Local user identifier (write)
    UserId,
    /// Orientation telemetry envelopes (read/notify)
    Telemetry,
}

impl Channel {
    pub const ALL: [Channel; 10] = [
        Self::WifiSsid,
        Self::WifiPassword,
        Self::WifiApply,
        Self::ExperimentName,
        Self::SamplingMs,
        Self::ConfigApply,
        Self::FinishExperiment,
        Self::DeviceId,
        Self::UserId,
        Self::Telemetry,
    ];

    pub const fn short_id(self) -> u16 {
        match self {
            Self::WifiSsid => 0xFFF1,
            Self::WifiPassword => 0xFFF2,
            Self::WifiApply => 0xFFF3,
            Self::ExperimentName => 0xFFF5,
            Self::SamplingMs => 0xFFF6,
            Self::ConfigApply => 0xFFF7,
            Self::FinishExperiment => 0xFFFB,
            Self::DeviceId => 0xFFFC,
            Self::UserId => 0xFFFD,
            Self::Telemetry => 0xFFF9,
        }
    }

    pub const fn group(self) -> ChannelGroup {
        match self {
            Self::WifiSsid | Self::WifiPassword | Self::WifiApply => ChannelGroup::Wifi,
            Self::ExperimentName
            | Self::SamplingMs
            | Self::ConfigApply
            | Self::FinishExperiment
            | Self::DeviceId
            | Self::UserId => ChannelGroup::DeviceConfig,
            Self::Telemetry => ChannelGroup::Telemetry,
        }
    }

    pub fn uuid(self) -> Uuid {
        short_uuid(self.short_id())
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        let short = short_id(uuid)?;
        Self::ALL.into_iter().find(|c| c.short_id() == short)
    }
}

/// Named experiment parameters accepted by `send_config`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigParameter {
    ExperimentName,
    SamplingMs,
}

impl ConfigParameter {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "experimentName" => Some(Self::ExperimentName),
            "samplingMs" => Some(Self::SamplingMs),
            _ => None,
        }
    }

    pub const fn key(self) -> &'static str {
        match self {
            Self::ExperimentName => "experimentName",
            Self::SamplingMs => "samplingMs",
        }
    }

    pub const fn channel(self) -> Channel {
        match self {
            Self::ExperimentName => Channel::ExperimentName,
            Self::SamplingMs => Channel::SamplingMs,
        }
    }
}

/// Decode the identity string pushed on [`Channel::DeviceId`].
///
/// Firmware pads the value with NULs; whitespace and terminators are trimmed
/// and an empty result is not an identity.
pub fn decode_identity(value: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(value);
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Hex preview of the first bytes of a payload, for write logging
pub fn hex_preview(payload: &[u8]) -> String {
    payload
        .iter()
        .take(8)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
