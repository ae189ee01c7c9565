//! btleplug Transport
//!
//! Bridges the synchronous-submit / asynchronous-complete [`Transport`]
//! contract onto btleplug. Every submission spawns a task that performs the
//! GATT operation and posts the matching [`TransportEvent`] back onto the
//! channel handed to this link, so completions reach the session in a single
//! stream. Each link gets its own channel; events of a closed link never reach
//! the next one.
//!
//! Teardown runs detached. Links opened through the same [`TeardownGate`]
//! wait for the previous teardown before connecting, so a late
//! `peripheral.disconnect()` cannot drop a fresh link to the same device.

use crate::infrastructure::bluetooth::protocol::Channel;
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type CharacteristicMap = Arc<Mutex<HashMap<Channel, Characteristic>>>;
type Teardown = Shared<BoxFuture<'static, ()>>;

/// Completion of the last detached teardown, shared by links on one adapter
#[derive(Clone, Default)]
pub struct TeardownGate(Arc<Mutex<Option<Teardown>>>);

impl TeardownGate {
    /// Run `teardown` after any earlier one; later links wait for it
    fn chain<F>(&self, runtime: &Handle, teardown: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let previous = slot.take();
        let handle = runtime.spawn(async move {
            if let Some(previous) = previous {
                previous.await;
            }
            teardown.await;
        });
        *slot = Some(handle.map(|_| ()).boxed().shared());
    }

    /// Resolves once every teardown chained so far has finished
    pub async fn settled(&self) {
        let pending = self.0.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(pending) = pending {
            pending.await;
        }
    }
}

pub struct BtleTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    characteristics: CharacteristicMap,
    events: mpsc::UnboundedSender<TransportEvent>,
    gate: TeardownGate,
    runtime: Handle,
    tasks: Vec<JoinHandle<()>>,
}

impl BtleTransport {
    /// Must be created from within a tokio runtime
    pub fn new(
        adapter: Adapter,
        peripheral: Peripheral,
        events: mpsc::UnboundedSender<TransportEvent>,
        gate: TeardownGate,
    ) -> anyhow::Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| anyhow::anyhow!("BLE transport needs a tokio runtime: {e}"))?;
        Ok(Self {
            adapter,
            peripheral,
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            events,
            gate,
            runtime,
            tasks: Vec::new(),
        })
    }

    fn characteristic(&self, channel: Channel) -> Option<Characteristic> {
        self.characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel)
            .cloned()
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(self.runtime.spawn(task));
    }

    /// Post `DeviceDisconnected` for this peripheral as a transport event.
    ///
    /// A report for a peripheral that is connected again belongs to an
    /// earlier link and is skipped.
    async fn watch_disconnect(
        mut stream: impl Stream<Item = CentralEvent> + Unpin,
        peripheral: Peripheral,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let peripheral_id = peripheral.id();
        while let Some(event) = stream.next().await {
            let CentralEvent::DeviceDisconnected(id) = event else {
                continue;
            };
            if id != peripheral_id {
                continue;
            }
            if matches!(peripheral.is_connected().await, Ok(true)) {
                debug!("Stale disconnect report for {:?}, link is up", id);
                continue;
            }
            info!("Peripheral {:?} dropped the link", id);
            let _ = events.send(TransportEvent::Disconnected);
            break;
        }
    }

    /// Forward notifications on known channels until the stream ends
    fn pump_notifications(&mut self) {
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Could not open notification stream: {e}");
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                match Channel::from_uuid(&notification.uuid) {
                    Some(channel) => {
                        let _ = events.send(TransportEvent::Notification {
                            channel,
                            value: notification.value,
                        });
                    }
                    None => debug!("Notification from unknown characteristic {}", notification.uuid),
                }
            }
            debug!("Notification stream closed");
        });
    }
}

impl Transport for BtleTransport {
    fn connect(&mut self, address: &str) -> bool {
        debug!("Opening link to {}", address);
        let adapter = self.adapter.clone();
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let gate = self.gate.clone();
        self.spawn(async move {
            gate.settled().await;

            let watcher = match adapter.events().await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!("Disconnect watcher: could not subscribe to adapter events: {e}");
                    None
                }
            };
            if let Err(e) = peripheral.connect().await {
                warn!("Connect failed: {e}");
                let _ = events.send(TransportEvent::Disconnected);
                return;
            }
            let _ = events.send(TransportEvent::Connected);

            if let Some(stream) = watcher {
                Self::watch_disconnect(stream, peripheral, events).await;
            }
        });
        true
    }

    fn request_mtu(&mut self, mtu: u16) -> bool {
        // The platform negotiates the MTU on its own
        debug!("MTU request for {} not supported by the backend", mtu);
        false
    }

    fn discover_channels(&mut self) -> bool {
        let peripheral = self.peripheral.clone();
        let characteristics = self.characteristics.clone();
        let events = self.events.clone();
        self.spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                warn!("Service discovery failed: {e}");
                let _ = events.send(TransportEvent::ChannelsDiscovered {
                    success: false,
                    device_name: None,
                });
                return;
            }

            let found: HashMap<Channel, Characteristic> = peripheral
                .characteristics()
                .into_iter()
                .filter_map(|c| Channel::from_uuid(&c.uuid).map(|channel| (channel, c)))
                .collect();
            debug!("Resolved {} known channel(s)", found.len());
            *characteristics.lock().unwrap_or_else(|e| e.into_inner()) = found;

            let device_name = match peripheral.properties().await {
                Ok(Some(props)) => props.local_name,
                _ => None,
            };
            let _ = events.send(TransportEvent::ChannelsDiscovered {
                success: true,
                device_name,
            });
        });
        self.pump_notifications();
        true
    }

    fn has_channel(&self, channel: Channel) -> bool {
        self.characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&channel)
    }

    fn write(&mut self, channel: Channel, payload: &[u8]) -> bool {
        let Some(characteristic) = self.characteristic(channel) else {
            return false;
        };
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let payload = payload.to_vec();
        self.spawn(async move {
            let result = peripheral
                .write(&characteristic, &payload, WriteType::WithResponse)
                .await;
            if let Err(e) = &result {
                warn!("Write on {:?} failed: {e}", channel);
            }
            let _ = events.send(TransportEvent::WriteComplete {
                channel,
                success: result.is_ok(),
            });
        });
        true
    }

    fn read(&mut self, channel: Channel) -> bool {
        let Some(characteristic) = self.characteristic(channel) else {
            return false;
        };
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let event = match peripheral.read(&characteristic).await {
                Ok(value) => TransportEvent::ReadComplete {
                    channel,
                    success: true,
                    value,
                },
                Err(e) => {
                    warn!("Read on {:?} failed: {e}", channel);
                    TransportEvent::ReadComplete {
                        channel,
                        success: false,
                        value: Vec::new(),
                    }
                }
            };
            let _ = events.send(event);
        });
        true
    }

    fn enable_notifications(&mut self, channel: Channel) -> bool {
        let Some(characteristic) = self.characteristic(channel) else {
            return false;
        };
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.spawn(async move {
            // btleplug writes the control descriptor itself
            let result = peripheral.subscribe(&characteristic).await;
            if let Err(e) = &result {
                warn!("Subscribe on {:?} failed: {e}", channel);
            }
            let _ = events.send(TransportEvent::DescriptorWriteComplete {
                channel,
                success: result.is_ok(),
            });
        });
        true
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        let peripheral = self.peripheral.clone();
        // Not tracked: close() must not abort it
        self.gate.chain(&self.runtime, async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect reported: {e}");
            }
        });
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
