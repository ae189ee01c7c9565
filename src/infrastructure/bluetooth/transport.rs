//! Transport seam between the link engine and a BLE stack.
//!
//! Submissions are synchronous and only report whether the request went
//! out. Every outcome comes back later as a [`TransportEvent`] on the single
//! serialized event stream owned by the session's driver.

use crate::infrastructure::bluetooth::protocol::Channel;

/// Inbound events produced by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    MtuChanged { mtu: u16, success: bool },
    ChannelsDiscovered {
        success: bool,
        device_name: Option<String>,
    },
    WriteComplete { channel: Channel, success: bool },
    ReadComplete {
        channel: Channel,
        success: bool,
        value: Vec<u8>,
    },
    Notification { channel: Channel, value: Vec<u8> },
    DescriptorWriteComplete { channel: Channel, success: bool },
}

/// Outbound operations on one peripheral connection
pub trait Transport {
    /// Start connecting; completion arrives as `Connected` / `Disconnected`
    fn connect(&mut self, address: &str) -> bool;

    /// Ask for a larger transmission unit; `false` means the request was not sent
    fn request_mtu(&mut self, mtu: u16) -> bool;

    /// Resolve services and characteristics
    fn discover_channels(&mut self) -> bool;

    fn has_channel(&self, channel: Channel) -> bool;

    /// Submit one write; at most one may be outstanding per connection
    fn write(&mut self, channel: Channel, payload: &[u8]) -> bool;

    fn read(&mut self, channel: Channel) -> bool;

    /// Write the enable-notifications value to the channel's control descriptor
    fn enable_notifications(&mut self, channel: Channel) -> bool;

    fn disconnect(&mut self) -> anyhow::Result<()>;

    /// Release the underlying handle
    fn close(&mut self) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording transport double used across the crate's tests.

    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Connect(String),
        RequestMtu(u16),
        Discover,
        Write(Channel, Vec<u8>),
        Read(Channel),
        EnableNotifications(Channel),
        Disconnect,
        Close,
    }

    pub struct RecordingTransport {
        pub calls: Vec<Call>,
        pub channels: HashSet<Channel>,
        pub accept_mtu: bool,
        pub accept_writes: bool,
        pub fail_teardown: bool,
    }

    impl Default for RecordingTransport {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                channels: Channel::ALL.into_iter().collect(),
                accept_mtu: true,
                accept_writes: true,
                fail_teardown: false,
            }
        }
    }

    impl RecordingTransport {
        pub fn writes(&self) -> Vec<(Channel, Vec<u8>)> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Write(ch, payload) => Some((*ch, payload.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn connect(&mut self, address: &str) -> bool {
            self.calls.push(Call::Connect(address.to_string()));
            true
        }

        fn request_mtu(&mut self, mtu: u16) -> bool {
            self.calls.push(Call::RequestMtu(mtu));
            self.accept_mtu
        }

        fn discover_channels(&mut self) -> bool {
            self.calls.push(Call::Discover);
            true
        }

        fn has_channel(&self, channel: Channel) -> bool {
            self.channels.contains(&channel)
        }

        fn write(&mut self, channel: Channel, payload: &[u8]) -> bool {
            self.calls.push(Call::Write(channel, payload.to_vec()));
            self.accept_writes
        }

        fn read(&mut self, channel: Channel) -> bool {
            self.calls.push(Call::Read(channel));
            true
        }

        fn enable_notifications(&mut self, channel: Channel) -> bool {
            self.calls.push(Call::EnableNotifications(channel));
            true
        }

        fn disconnect(&mut self) -> anyhow::Result<()> {
            self.calls.push(Call::Disconnect);
            if self.fail_teardown {
                anyhow::bail!("gatt already gone");
            }
            Ok(())
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.calls.push(Call::Close);
            if self.fail_teardown {
                anyhow::bail!("gatt already closed");
            }
            Ok(())
        }
    }
}
