//! Link Session
//!
//! Owns the single connection to one peripheral and funnels every inbound
//! transport event to the command queue, the stream reassembler and the
//! pairing coordinator.
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─Connected─▶ McuNegotiating ─MtuChanged─▶ Discovering ─ChannelsDiscovered─▶ Ready
//!       ▲                                                                                                          │
//!       └──────────────────────────────── Disconnected event / disconnect_and_close ◀────────────────────────────────┘
//! ```

use crate::domain::models::{
    AppEvent, BatchKind, ConnectionStatus, MessageSeverity, StatusMessage, TelemetrySample,
};
use crate::domain::pairing::{PairingCoordinator, PairingOutcome, PairingRequest, PairingStep, PairingStore};
use crate::error::LinkError;
use crate::infrastructure::bluetooth::protocol::{
    decode_identity, hex_preview, Channel, ConfigParameter, DESIRED_MTU, TRIGGER_PAYLOAD,
};
use crate::infrastructure::bluetooth::queue::CommandQueue;
use crate::infrastructure::bluetooth::reassembler::StreamReassembler;
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    McuNegotiating,
    Discovering,
    Ready,
}

pub struct LinkSession<T: Transport> {
    state: LinkState,
    address: Option<String>,
    transport: Option<T>,
    queue: CommandQueue,
    reassembler: StreamReassembler,
    pairing: PairingCoordinator,
    events: mpsc::UnboundedSender<AppEvent>,
    desired_mtu: u16,
    negotiated_mtu: Option<u16>,
    device_name: Option<String>,
    /// Kind of the batch the queue is working through
    batch: Option<BatchKind>,
    /// User id held back until the running batch drains
    deferred_user_id: Option<String>,
}

impl<T: Transport> LinkSession<T> {
    pub fn new(events: mpsc::UnboundedSender<AppEvent>, user_id: Option<String>) -> Self {
        Self {
            state: LinkState::Disconnected,
            address: None,
            transport: None,
            queue: CommandQueue::new(),
            reassembler: StreamReassembler::new(),
            pairing: PairingCoordinator::new(user_id),
            events,
            desired_mtu: DESIRED_MTU,
            negotiated_mtu: None,
            device_name: None,
            batch: None,
            deferred_user_id: None,
        }
    }

    pub fn with_desired_mtu(mut self, mtu: u16) -> Self {
        self.desired_mtu = mtu;
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    pub fn negotiated_mtu(&self) -> Option<u16> {
        self.negotiated_mtu
    }

    pub fn pairing(&self) -> &PairingCoordinator {
        &self.pairing
    }

    pub fn set_user_id(&mut self, user_id: Option<String>) {
        self.pairing.set_user_id(user_id);
    }

    /// True while configuration writes are queued or awaiting acknowledgement
    pub fn is_queue_busy(&self) -> bool {
        self.queue.is_busy()
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Start a session to `address` over `transport`
    pub fn connect(&mut self, address: &str, mut transport: T) -> Result<(), LinkError> {
        if self.state != LinkState::Disconnected {
            return Err(LinkError::AlreadyActive(self.state));
        }

        info!("Connecting to {}", address);
        self.state = LinkState::Connecting;
        self.emit(AppEvent::ConnectionStatus(ConnectionStatus::Connecting));

        if !transport.connect(address) {
            self.transport = Some(transport);
            self.disconnect_and_close();
            return Err(LinkError::Transport(format!("connect to {address} was not started")));
        }

        self.address = Some(address.to_string());
        self.transport = Some(transport);
        Ok(())
    }

    /// Dispatch one inbound transport event.
    ///
    /// Returns a pairing request when an identity notification started a
    /// handshake; the caller resolves it and hands the outcome to
    /// [`LinkSession::complete_pairing`].
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<PairingRequest> {
        if self.transport.is_none() {
            debug!("Ignoring {:?} without an active session", event);
            return None;
        }

        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected => {
                info!("Peripheral disconnected");
                self.disconnect_and_close();
            }
            TransportEvent::MtuChanged { mtu, success } => self.on_mtu_changed(mtu, success),
            TransportEvent::ChannelsDiscovered {
                success,
                device_name,
            } => self.on_channels_discovered(success, device_name),
            TransportEvent::WriteComplete { channel, success } => {
                self.on_write_complete(channel, success)
            }
            TransportEvent::ReadComplete {
                channel,
                success,
                value,
            } => {
                if !success {
                    warn!("Read on {:?} failed", channel);
                } else if channel == Channel::Telemetry {
                    self.feed_telemetry(&value);
                } else {
                    debug!("Read on {:?} returned {}", channel, hex_preview(&value));
                }
            }
            TransportEvent::Notification { channel, value } => match channel {
                Channel::Telemetry => self.feed_telemetry(&value),
                Channel::DeviceId => return self.on_identity(&value),
                other => debug!("Notification on {:?}: {}", other, hex_preview(&value)),
            },
            TransportEvent::DescriptorWriteComplete { channel, success } => {
                if success {
                    info!("Notifications enabled on {:?}", channel);
                } else {
                    warn!("Enabling notifications on {:?} failed", channel);
                    self.send_log(
                        &format!("Failed to enable notifications on {channel:?}"),
                        MessageSeverity::Warning,
                    );
                }
            }
        }
        None
    }

    /// Apply the result of a pairing exchange started by this session
    pub fn complete_pairing(&mut self, outcome: PairingOutcome, store: &mut dyn PairingStore) {
        if self.pairing.complete(outcome, store) {
            self.emit_pairing();
        }
    }

    pub fn send_wifi(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        info!("Sending Wi-Fi credentials for SSID {}", ssid);
        self.submit_batch(
            BatchKind::Wifi,
            vec![
                (Channel::WifiSsid, ssid.as_bytes().to_vec()),
                (Channel::WifiPassword, password.as_bytes().to_vec()),
                (Channel::WifiApply, TRIGGER_PAYLOAD.to_vec()),
            ],
        )
    }

    /// Write named parameters followed by the apply trigger; unknown names are skipped
    pub fn send_config(&mut self, params: &[(String, String)]) -> Result<(), LinkError> {
        let mut batch = Vec::with_capacity(params.len() + 1);
        for (key, value) in params {
            match ConfigParameter::from_key(key) {
                Some(param) => batch.push((param.channel(), value.as_bytes().to_vec())),
                None => warn!("Unknown config parameter {:?}, skipping", key),
            }
        }
        batch.push((Channel::ConfigApply, TRIGGER_PAYLOAD.to_vec()));
        info!("Sending {} config parameter(s)", batch.len() - 1);
        self.submit_batch(BatchKind::Config, batch)
    }

    pub fn finish_experiment(&mut self) -> Result<(), LinkError> {
        info!("Sending finish trigger");
        self.submit_batch(
            BatchKind::Finish,
            vec![(Channel::FinishExperiment, TRIGGER_PAYLOAD.to_vec())],
        )
    }

    pub fn send_user_id(&mut self, user_id: &str) -> Result<(), LinkError> {
        self.submit_batch(
            BatchKind::UserId,
            vec![(Channel::UserId, user_id.as_bytes().to_vec())],
        )
    }

    pub fn enable_notifications(&mut self, channel: Channel) -> Result<(), LinkError> {
        let transport = self.ready_transport(&[channel])?;
        if !transport.enable_notifications(channel) {
            return Err(LinkError::Rejected {
                channel,
                operation: "enable notifications",
            });
        }
        debug!("Notification subscription requested on {:?}", channel);
        Ok(())
    }

    pub fn enable_telemetry_notifications(&mut self) -> Result<(), LinkError> {
        self.enable_notifications(Channel::Telemetry)
    }

    pub fn enable_identity_notifications(&mut self) -> Result<(), LinkError> {
        self.enable_notifications(Channel::DeviceId)
    }

    /// One-shot read; the value goes through the same reassembly path as notifications
    pub fn read_telemetry_once(&mut self) -> Result<(), LinkError> {
        let transport = self.ready_transport(&[Channel::Telemetry])?;
        if !transport.read(Channel::Telemetry) {
            return Err(LinkError::Rejected {
                channel: Channel::Telemetry,
                operation: "read",
            });
        }
        Ok(())
    }

    /// Release the transport and every piece of per-session state.
    ///
    /// Safe to call from any state and any number of times; transport
    /// failures are logged and swallowed.
    pub fn disconnect_and_close(&mut self) {
        let previous = self.state;

        self.queue.clear();
        self.batch = None;
        self.deferred_user_id = None;
        self.reassembler.clear();
        self.pairing.on_disconnected();
        self.negotiated_mtu = None;
        self.device_name = None;
        self.address = None;

        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.disconnect() {
                debug!("Ignoring disconnect failure during teardown: {}", e);
            }
            if let Err(e) = transport.close() {
                debug!("Ignoring close failure during teardown: {}", e);
            }
        }

        self.state = LinkState::Disconnected;
        if previous != LinkState::Disconnected {
            info!("Session closed (was {:?})", previous);
            self.emit(AppEvent::ConnectionStatus(ConnectionStatus::Disconnected));
            self.emit_pairing();
        }
    }

    fn on_connected(&mut self) {
        if self.state != LinkState::Connecting {
            debug!("Connected event in state {:?}, ignoring", self.state);
            return;
        }
        self.state = LinkState::McuNegotiating;
        let mtu = self.desired_mtu;
        let requested = self
            .transport
            .as_mut()
            .map(|t| t.request_mtu(mtu))
            .unwrap_or(false);
        if requested {
            debug!("Requested MTU {}", mtu);
        } else {
            debug!("MTU request not sent, continuing with discovery");
            self.start_discovery();
        }
    }

    fn on_mtu_changed(&mut self, mtu: u16, success: bool) {
        if self.state != LinkState::McuNegotiating {
            debug!("MTU event in state {:?}, ignoring", self.state);
            return;
        }
        if success {
            info!("MTU negotiated: {}", mtu);
            self.negotiated_mtu = Some(mtu);
        } else {
            warn!("MTU negotiation failed, keeping default");
        }
        self.start_discovery();
    }

    fn start_discovery(&mut self) {
        self.state = LinkState::Discovering;
        let started = self
            .transport
            .as_mut()
            .map(|t| t.discover_channels())
            .unwrap_or(false);
        if !started {
            error!("Channel discovery could not be started");
            self.send_log("Service discovery failed", MessageSeverity::Error);
            self.disconnect_and_close();
        }
    }

    fn on_channels_discovered(&mut self, success: bool, device_name: Option<String>) {
        if self.state != LinkState::Discovering {
            debug!("Discovery event in state {:?}, ignoring", self.state);
            return;
        }
        if !success {
            error!("Channel discovery failed");
            self.send_log("Service discovery failed", MessageSeverity::Error);
            self.disconnect_and_close();
            return;
        }

        if let Some(transport) = self.transport.as_ref() {
            let missing: Vec<Channel> = Channel::ALL
                .into_iter()
                .filter(|c| !transport.has_channel(*c))
                .collect();
            if !missing.is_empty() {
                warn!("Peripheral lacks channels {:?}", missing);
            }
        }

        self.state = LinkState::Ready;
        self.device_name = device_name.clone();
        info!("Link ready ({})", device_name.as_deref().unwrap_or("unnamed"));
        self.emit(AppEvent::ConnectionStatus(ConnectionStatus::Connected {
            device_name,
        }));

        self.pairing.on_link_ready();
        self.emit_pairing();
    }

    fn on_write_complete(&mut self, channel: Channel, success: bool) {
        if !success {
            warn!("Write on {:?} failed, continuing with the batch", channel);
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if !self.queue.on_write_complete(transport) {
            return;
        }
        if let Some(kind) = self.batch.take() {
            info!("{:?} batch applied", kind);
            self.emit(AppEvent::ConfigApplied(kind));
        }
        if let Some(user_id) = self.deferred_user_id.take() {
            if let Err(e) = self.send_user_id(&user_id) {
                warn!("Could not send user id to device: {}", e);
            }
        }
    }

    fn feed_telemetry(&mut self, fragment: &[u8]) {
        for batch in self.reassembler.push(fragment) {
            self.emit_batch(batch);
        }
    }

    fn on_identity(&mut self, value: &[u8]) -> Option<PairingRequest> {
        let Some(identity) = decode_identity(value) else {
            debug!("Empty identity notification ignored");
            return None;
        };
        info!("Device reported identity {}", identity);

        match self.pairing.on_identity(identity) {
            PairingStep::Ignored => None,
            PairingStep::Failed => {
                self.emit_pairing();
                None
            }
            PairingStep::Exchange(request) => {
                if self.queue.is_busy() {
                    // Replacing the running batch would drop its unsent writes
                    debug!("Write batch in progress, user id goes out after it");
                    self.deferred_user_id = Some(request.user_id.clone());
                } else if let Err(e) = self.send_user_id(&request.user_id) {
                    warn!("Could not send user id to device: {}", e);
                }
                self.emit_pairing();
                Some(request)
            }
        }
    }

    fn ready_transport(&mut self, channels: &[Channel]) -> Result<&mut T, LinkError> {
        if self.state != LinkState::Ready {
            return Err(LinkError::NotReady(self.state));
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or(LinkError::NotReady(LinkState::Disconnected))?;
        if let Some(missing) = channels.iter().find(|c| !transport.has_channel(**c)) {
            return Err(LinkError::ChannelMissing(*missing));
        }
        Ok(transport)
    }

    /// `clear()` + `enqueue()`×N + `start()`; batches never interleave
    fn submit_batch(
        &mut self,
        kind: BatchKind,
        batch: Vec<(Channel, Vec<u8>)>,
    ) -> Result<(), LinkError> {
        let channels: Vec<Channel> = batch.iter().map(|(c, _)| *c).collect();
        self.ready_transport(&channels)?;

        let Some(transport) = self.transport.as_mut() else {
            return Err(LinkError::NotReady(self.state));
        };
        self.queue.clear();
        for (channel, payload) in batch {
            self.queue.enqueue(channel, payload);
        }
        self.batch = Some(kind);
        if !self.queue.start(transport) {
            // Every submission was rejected; nothing will complete
            self.batch = None;
            return Err(LinkError::Transport("no write in the batch was accepted".to_string()));
        }
        Ok(())
    }

    fn emit_batch(&self, batch: Vec<TelemetrySample>) {
        debug!("Telemetry batch of {} sample(s)", batch.len());
        self.emit(AppEvent::TelemetryBatch(batch));
    }

    fn emit_pairing(&self) {
        self.emit(AppEvent::Pairing(self.pairing.snapshot()));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }
}

impl<T: Transport> Drop for LinkSession<T> {
    fn drop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.disconnect();
            let _ = transport.close();
        }
    }
}
