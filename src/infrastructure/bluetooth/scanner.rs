//! BLE Scanner Module
//!
//! Handles Bluetooth LE discovery of wearable peripherals.

use crate::domain::models::{AppEvent, MessageSeverity, ScannedDevice, StatusMessage};
use crate::infrastructure::bluetooth::protocol::ChannelGroup;
use anyhow::{anyhow, Result};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// BLE Scanner for discovering wearable peripherals
pub struct BleScanner {
    adapter: Option<Adapter>,
    watcher: Option<JoinHandle<()>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            adapter: None,
            watcher: None,
            event_sender,
        }
    }

    /// First Bluetooth adapter of the host, opened lazily
    pub async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    /// Start scanning for BLE devices
    ///
    /// # Arguments
    /// * `show_all_devices` - If true, report every advertiser instead of only
    ///   those exposing the Wi-Fi configuration service
    pub async fn start(&mut self, show_all_devices: bool) -> Result<()> {
        // Stop any existing scan
        self.stop().await?;

        let adapter = self.adapter().await?;
        let service = ChannelGroup::Wifi.uuid();
        info!(
            "Starting BLE scan (service filter: {})",
            if show_all_devices { "none".to_string() } else { service.to_string() }
        );
        self.send_log("Scanning for devices...", MessageSeverity::Info);

        let mut events = adapter.events().await?;
        let filter = if show_all_devices {
            ScanFilter::default()
        } else {
            ScanFilter {
                services: vec![service],
            }
        };
        adapter.start_scan(filter).await?;

        let sender = self.event_sender.clone();
        let watcher_adapter = adapter.clone();
        self.watcher = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDiscovered(id) = event else {
                    continue;
                };
                let Ok(peripheral) = watcher_adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                if !show_all_devices && !props.services.contains(&service) {
                    debug!("Skipping {:?}: no config service advertised", id);
                    continue;
                }

                let device = ScannedDevice {
                    name: props
                        .local_name
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| "Unknown".to_string()),
                    address: peripheral.address().to_string(),
                    signal_strength: props.rssi,
                };
                let _ = sender.send(AppEvent::DeviceFound(device));
            }
        }));

        Ok(())
    }

    /// Stop scanning
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE scan...");
            watcher.abort();
            self.send_log("Scan stopped.", MessageSeverity::Info);
            if let Some(adapter) = &self.adapter {
                adapter.stop_scan().await?;
            }
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.watcher.is_some()
    }

    /// Scan until a peripheral whose address equals `target` (case-insensitive)
    /// or whose name contains it shows up
    pub async fn find(&mut self, target: &str, timeout_secs: u64) -> Result<Peripheral> {
        let adapter = self.adapter().await?;
        let was_scanning = self.is_scanning();
        if !was_scanning {
            adapter.start_scan(ScanFilter::default()).await?;
        }

        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            loop {
                for p in adapter.peripherals().await.unwrap_or_default() {
                    if matches_target(&p, target).await {
                        return p;
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await;

        if !was_scanning {
            adapter.stop_scan().await.ok();
        }
        result.map_err(|_| anyhow!("No device matching {target} found within {timeout_secs} s"))
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

async fn matches_target(peripheral: &Peripheral, target: &str) -> bool {
    if peripheral.address().to_string().eq_ignore_ascii_case(target) {
        return true;
    }
    matches!(
        peripheral.properties().await,
        Ok(Some(props)) if props.local_name.as_deref().is_some_and(|n| n.contains(target))
    )
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}
