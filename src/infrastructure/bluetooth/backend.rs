//! Link Backend
//!
//! What [`LinkService`](super::LinkService) needs from a BLE stack: scanning
//! and opening a transport to one peripheral.

use crate::domain::models::AppEvent;
use crate::infrastructure::bluetooth::btle::{BtleTransport, TeardownGate};
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait LinkBackend: Send + 'static {
    type Transport: Transport + Send + 'static;

    async fn start_scan(&mut self, show_all_devices: bool) -> Result<()>;

    async fn stop_scan(&mut self) -> Result<()>;

    /// Locate `target` and build a transport posting onto `events`.
    ///
    /// The transport is not connected yet; the session starts it.
    async fn open(
        &mut self,
        target: &str,
        timeout_secs: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self::Transport>;
}

/// btleplug scanner plus the teardown ordering shared by its links
pub struct BtleBackend {
    scanner: BleScanner,
    gate: TeardownGate,
}

impl BtleBackend {
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            scanner: BleScanner::new(event_sender),
            gate: TeardownGate::default(),
        }
    }
}

#[async_trait]
impl LinkBackend for BtleBackend {
    type Transport = BtleTransport;

    async fn start_scan(&mut self, show_all_devices: bool) -> Result<()> {
        self.scanner.start(show_all_devices).await
    }

    async fn stop_scan(&mut self) -> Result<()> {
        self.scanner.stop().await
    }

    async fn open(
        &mut self,
        target: &str,
        timeout_secs: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<BtleTransport> {
        self.scanner.stop().await?;
        let peripheral = self.scanner.find(target, timeout_secs).await?;
        let adapter = self.scanner.adapter().await?;
        BtleTransport::new(adapter, peripheral, events, self.gate.clone())
    }
}
