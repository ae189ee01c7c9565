//! Link Service Module
//!
//! Runs the link engine: presentation commands, transport completions and
//! pairing outcomes are multiplexed onto one task so the session only ever
//! sees serialized input.
//!
//! Every connect gets a fresh transport channel. Replacing the receiver drops
//! whatever the previous link still had queued.

use crate::domain::models::{AppEvent, ConnectionStatus, LinkCommand, MessageSeverity, StatusMessage};
use crate::domain::pairing::{PairingFailure, PairingOutcome, PairingRequest};
use crate::domain::settings::SettingsService;
use crate::error::ServiceError;
use crate::infrastructure::bluetooth::{
    backend::LinkBackend,
    session::{LinkSession, LinkState},
    transport::TransportEvent,
};
use crate::infrastructure::network::{AuthenticatedCaller, PairingService};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Account backend used to resolve pairing handshakes
#[derive(Clone)]
pub struct PairingBackend {
    pub caller: Arc<AuthenticatedCaller>,
    pub service: Arc<dyn PairingService>,
}

/// Owns the session and everything feeding it
pub struct LinkService<B: LinkBackend> {
    session: LinkSession<B::Transport>,
    backend: B,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings: Arc<Mutex<SettingsService>>,
    pairing: Option<PairingBackend>,
    /// Events of the current link only
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    outcome_tx: mpsc::UnboundedSender<PairingOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<PairingOutcome>,
}

impl<B: LinkBackend> LinkService<B> {
    pub fn new(
        event_sender: mpsc::UnboundedSender<AppEvent>,
        settings: Arc<Mutex<SettingsService>>,
        backend: B,
        pairing: Option<PairingBackend>,
    ) -> Result<Self> {
        let (user_id, desired_mtu) = {
            let settings = settings
                .lock()
                .map_err(|_| anyhow::anyhow!("Lock error"))?;
            let s = settings.get();
            (s.user_id.clone(), s.link.desired_mtu)
        };

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        Ok(Self {
            session: LinkSession::new(event_sender.clone(), user_id).with_desired_mtu(desired_mtu),
            backend,
            event_sender,
            settings,
            pairing,
            transport_rx: None,
            outcome_tx,
            outcome_rx,
        })
    }

    pub fn session(&self) -> &LinkSession<B::Transport> {
        &self.session
    }

    /// Serve until the command channel closes, then tear the session down
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
        info!("Link service started");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = next_transport_event(&mut self.transport_rx) => self.handle_transport_event(event),
                Some(outcome) = self.outcome_rx.recv() => self.complete_pairing(outcome),
            }
        }
        self.shutdown().await;
        info!("Link service stopped");
    }

    pub async fn handle_command(&mut self, cmd: LinkCommand) {
        let result = match cmd {
            LinkCommand::StartScan => self.start_scan().await,
            LinkCommand::StopScan => self.backend.stop_scan().await,
            LinkCommand::Connect(address) => {
                if let Err(e) = self.connect(&address).await {
                    error!("Connection failed: {}", e);
                    self.send_log(&format!("Connection failed: {}", e), MessageSeverity::Error);
                    if self.session.state() == LinkState::Disconnected {
                        let _ = self
                            .event_sender
                            .send(AppEvent::ConnectionStatus(ConnectionStatus::Disconnected));
                    }
                }
                Ok(())
            }
            LinkCommand::SendWifi { ssid, password } => {
                self.session.send_wifi(&ssid, &password).map_err(Into::into)
            }
            LinkCommand::SendConfig(params) => self.session.send_config(&params).map_err(Into::into),
            LinkCommand::FinishExperiment => self.session.finish_experiment().map_err(Into::into),
            LinkCommand::EnableTelemetry => self
                .session
                .enable_telemetry_notifications()
                .map_err(Into::into),
            LinkCommand::EnableIdentity => self
                .session
                .enable_identity_notifications()
                .map_err(Into::into),
            LinkCommand::ReadTelemetryOnce => self.session.read_telemetry_once().map_err(Into::into),
            LinkCommand::SetUserId(user_id) => self.set_user_id(user_id),
            LinkCommand::Disconnect => {
                self.session.disconnect_and_close();
                self.backend.stop_scan().await
            }
        };

        if let Err(e) = result {
            warn!("Command failed: {}", e);
            self.send_log(&e.to_string(), MessageSeverity::Warning);
        }
    }

    async fn start_scan(&mut self) -> Result<()> {
        let show_all = {
            let settings = self
                .settings
                .lock()
                .map_err(|_| anyhow::anyhow!("Lock error"))?;
            settings.get().link.show_all_devices
        };
        self.backend.start_scan(show_all).await
    }

    async fn connect(&mut self, address: &str) -> Result<()> {
        if self.session.state() != LinkState::Disconnected {
            anyhow::bail!("already connected or connecting ({:?})", self.session.state());
        }
        let timeout = self.with_settings(|s| s.get().link.scan_timeout_secs)?;

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = self.backend.open(address, timeout, transport_tx).await?;
        self.session.connect(address, transport)?;
        self.transport_rx = Some(transport_rx);

        self.with_settings(|s| s.add_known_address(address))??;
        Ok(())
    }

    fn set_user_id(&mut self, user_id: Option<String>) -> Result<()> {
        self.session.set_user_id(user_id.clone());
        self.with_settings(|s| {
            s.get_mut().user_id = user_id;
            s.save()
        })?
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let was_ready = self.session.is_ready();
        if let Some(request) = self.session.handle_event(event) {
            self.resolve_pairing(request);
        }

        if !was_ready && self.session.is_ready() {
            let subscribe = self
                .with_settings(|s| s.get().link.subscribe_identity_on_ready)
                .unwrap_or(true);
            if subscribe {
                if let Err(e) = self.session.enable_identity_notifications() {
                    warn!("Could not subscribe to device identity: {}", e);
                }
            }
        }
    }

    /// Run the network leg off the event loop; the outcome comes back on `outcome_rx`
    fn resolve_pairing(&self, request: PairingRequest) {
        let outcome_tx = self.outcome_tx.clone();
        match self.pairing.clone() {
            Some(backend) => {
                tokio::spawn(async move {
                    let outcome = request
                        .resolve(&backend.caller, backend.service.as_ref())
                        .await;
                    let _ = outcome_tx.send(outcome);
                });
            }
            None => {
                warn!("No pairing backend configured");
                let _ = outcome_tx.send(PairingOutcome {
                    attempt: request.attempt,
                    device_id: request.device_id,
                    result: Err(PairingFailure::Lookup(ServiceError::Credentials(
                        "not signed in".to_string(),
                    ))),
                });
            }
        }
    }

    fn complete_pairing(&mut self, outcome: PairingOutcome) {
        let Ok(mut settings) = self.settings.lock() else {
            error!("Settings lock poisoned, dropping pairing outcome");
            return;
        };
        self.session.complete_pairing(outcome, &mut *settings);
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.backend.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        self.session.disconnect_and_close();
        self.transport_rx = None;
    }

    fn with_settings<R>(&self, f: impl FnOnce(&mut SettingsService) -> R) -> Result<R> {
        let mut settings = self
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        Ok(f(&mut settings))
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

/// Next event of the current link; pends while there is none
async fn next_transport_event(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> TransportEvent {
    let closed = match rx.as_mut() {
        Some(receiver) => match receiver.recv().await {
            Some(event) => return event,
            None => true,
        },
        None => false,
    };
    if closed {
        // Every sender of this link is gone
        *rx = None;
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::PairingPhase;
    use crate::infrastructure::bluetooth::protocol::Channel;
    use crate::infrastructure::bluetooth::transport::testing::{Call, RecordingTransport};
    use crate::infrastructure::bluetooth::transport::Transport;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Recording transport the test keeps a handle to after the service takes it
    struct SharedTransport(Arc<Mutex<RecordingTransport>>);

    impl Transport for SharedTransport {
        fn connect(&mut self, address: &str) -> bool {
            self.0.lock().unwrap().connect(address)
        }
        fn request_mtu(&mut self, mtu: u16) -> bool {
            self.0.lock().unwrap().request_mtu(mtu)
        }
        fn discover_channels(&mut self) -> bool {
            self.0.lock().unwrap().discover_channels()
        }
        fn has_channel(&self, channel: Channel) -> bool {
            self.0.lock().unwrap().has_channel(channel)
        }
        fn write(&mut self, channel: Channel, payload: &[u8]) -> bool {
            self.0.lock().unwrap().write(channel, payload)
        }
        fn read(&mut self, channel: Channel) -> bool {
            self.0.lock().unwrap().read(channel)
        }
        fn enable_notifications(&mut self, channel: Channel) -> bool {
            self.0.lock().unwrap().enable_notifications(channel)
        }
        fn disconnect(&mut self) -> anyhow::Result<()> {
            self.0.lock().unwrap().disconnect()
        }
        fn close(&mut self) -> anyhow::Result<()> {
            self.0.lock().unwrap().close()
        }
    }

    struct FakeBackend {
        transport: Arc<Mutex<RecordingTransport>>,
        links: mpsc::UnboundedSender<mpsc::UnboundedSender<TransportEvent>>,
        scan_stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LinkBackend for FakeBackend {
        type Transport = SharedTransport;

        async fn start_scan(&mut self, _show_all_devices: bool) -> Result<()> {
            Ok(())
        }

        async fn stop_scan(&mut self) -> Result<()> {
            self.scan_stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn open(
            &mut self,
            _target: &str,
            _timeout_secs: u64,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<SharedTransport> {
            let _ = self.links.send(events);
            Ok(SharedTransport(self.transport.clone()))
        }
    }

    struct Harness {
        commands: mpsc::UnboundedSender<LinkCommand>,
        events: mpsc::UnboundedReceiver<AppEvent>,
        links: mpsc::UnboundedReceiver<mpsc::UnboundedSender<TransportEvent>>,
        transport: Arc<Mutex<RecordingTransport>>,
        scan_stops: Arc<AtomicUsize>,
        worker: tokio::task::JoinHandle<()>,
        dir: PathBuf,
    }

    impl Harness {
        fn start(name: &str, subscribe_identity: bool) -> Self {
            let dir = std::env::temp_dir()
                .join(format!("wearable_link_service_{}_{}", name, std::process::id()));
            let mut settings = SettingsService::with_path(dir.join("settings.json"));
            settings.get_mut().user_id = Some("alice".to_string());
            settings.get_mut().link.subscribe_identity_on_ready = subscribe_identity;

            let transport = Arc::new(Mutex::new(RecordingTransport::default()));
            let scan_stops = Arc::new(AtomicUsize::new(0));
            let (links_tx, links) = mpsc::unbounded_channel();
            let backend = FakeBackend {
                transport: transport.clone(),
                links: links_tx,
                scan_stops: scan_stops.clone(),
            };

            let (event_tx, events) = mpsc::unbounded_channel();
            let (commands, cmd_rx) = mpsc::unbounded_channel();
            let service =
                LinkService::new(event_tx, Arc::new(Mutex::new(settings)), backend, None).unwrap();
            let worker = tokio::spawn(service.run(cmd_rx));

            Self {
                commands,
                events,
                links,
                transport,
                scan_stops,
                worker,
                dir,
            }
        }

        /// Connect and walk the new link to ready; returns its event sender
        async fn bring_up(&mut self) -> mpsc::UnboundedSender<TransportEvent> {
            self.commands
                .send(LinkCommand::Connect("AA:BB".to_string()))
                .unwrap();
            let link = tokio::time::timeout(Duration::from_secs(5), self.links.recv())
                .await
                .expect("backend was never asked for a link")
                .unwrap();
            for event in [
                TransportEvent::Connected,
                TransportEvent::MtuChanged {
                    mtu: 247,
                    success: true,
                },
                TransportEvent::ChannelsDiscovered {
                    success: true,
                    device_name: Some("ESP32".to_string()),
                },
            ] {
                link.send(event).unwrap();
            }
            self.wait_for(|e| {
                matches!(
                    e,
                    AppEvent::ConnectionStatus(ConnectionStatus::Connected { .. })
                )
            })
            .await;
            link
        }

        async fn wait_for(&mut self, done: impl Fn(&AppEvent) -> bool) -> AppEvent {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let event = self.events.recv().await.expect("service stopped");
                    if done(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("timed out waiting for service event")
        }

        async fn pairing_error(&mut self) -> String {
            match self
                .wait_for(|e| matches!(e, AppEvent::Pairing(s) if s.phase == PairingPhase::Error))
                .await
            {
                AppEvent::Pairing(snapshot) => snapshot.status.unwrap_or_default(),
                _ => unreachable!(),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.transport.lock().unwrap().calls.clone()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn identity(value: &str) -> TransportEvent {
        TransportEvent::Notification {
            channel: Channel::DeviceId,
            value: value.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_ready_link_subscribes_identity_and_pairing_fails_without_account() {
        let mut harness = Harness::start("ready", true);
        let link = harness.bring_up().await;

        link.send(identity("DEV1")).unwrap();
        assert_eq!(
            harness.pairing_error().await,
            "Failed to check server: credentials unavailable: not signed in"
        );

        let calls = harness.calls();
        assert!(calls.contains(&Call::Connect("AA:BB".to_string())));
        assert!(calls.contains(&Call::EnableNotifications(Channel::DeviceId)));
        assert!(calls.contains(&Call::Write(Channel::UserId, b"alice".to_vec())));
    }

    #[tokio::test]
    async fn test_identity_subscription_follows_setting() {
        let mut harness = Harness::start("no_subscribe", false);
        let link = harness.bring_up().await;

        link.send(identity("DEV1")).unwrap();
        harness.pairing_error().await;
        assert!(!harness
            .calls()
            .contains(&Call::EnableNotifications(Channel::DeviceId)));
    }

    #[tokio::test]
    async fn test_reconnect_drops_events_of_previous_link() {
        let mut harness = Harness::start("reconnect", true);
        let first = harness.bring_up().await;

        harness.commands.send(LinkCommand::Disconnect).unwrap();
        harness
            .wait_for(|e| *e == AppEvent::ConnectionStatus(ConnectionStatus::Disconnected))
            .await;
        let second = harness.bring_up().await;

        assert!(first.is_closed());
        assert!(first.send(TransportEvent::Disconnected).is_err());

        // The live link still answers
        second.send(identity("DEV2")).unwrap();
        harness.pairing_error().await;
    }

    #[tokio::test]
    async fn test_closing_commands_stops_scan_and_tears_down() {
        let mut harness = Harness::start("shutdown", true);
        harness.bring_up().await;

        harness.commands.send(LinkCommand::StartScan).unwrap();
        let (closed, _) = mpsc::unbounded_channel();
        harness.commands = closed;
        tokio::time::timeout(Duration::from_secs(5), &mut harness.worker)
            .await
            .expect("service did not stop")
            .unwrap();

        assert!(harness.scan_stops.load(Ordering::SeqCst) >= 1);
        let calls = harness.calls();
        assert!(calls.contains(&Call::Disconnect));
        assert!(calls.contains(&Call::Close));
        harness
            .wait_for(|e| *e == AppEvent::ConnectionStatus(ConnectionStatus::Disconnected))
            .await;
    }
}
