//! Command sequencer
//! Drains the command queue one command at a time against the adapter and
//! turns every outcome into a session event. Adapter failures are reported
//! and never stop the loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::adapter::BleAdapter;
use crate::core::bluetooth::aggregator::AdvertisementAggregator;
use crate::core::bluetooth::commands::{Command, LivenessReport, LivenessTarget};
use crate::core::bluetooth::error::{SessionError, SessionResult};
use crate::core::bluetooth::events::{EventSender, SessionEvent};
use crate::core::bluetooth::registry::SessionRegistry;
use crate::core::bluetooth::types::{BluetoothDevice, ClientHandle, WriteMode};

pub struct CommandSequencer {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<SessionRegistry>,
    aggregator: Arc<Mutex<AdvertisementAggregator>>,
    events: EventSender,
    dispatched: u64,
}

impl CommandSequencer {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<SessionRegistry>,
        aggregator: Arc<Mutex<AdvertisementAggregator>>,
        events: EventSender,
    ) -> Self {
        Self {
            adapter,
            registry,
            aggregator,
            events,
            dispatched: 0,
        }
    }

    /// Runs until a `Shutdown` command arrives or every sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Command sequencer started.");
        while let Some(command) = commands.recv().await {
            if matches!(command, Command::Shutdown) {
                info!("Shutdown requested, command sequencer stopping.");
                break;
            }
            self.dispatch(command).await;
        }
        info!("Command sequencer stopped.");
    }

    /// Executes one command to completion. Failures become `Error` events.
    pub async fn dispatch(&mut self, command: Command) {
        self.dispatched += 1;
        let sequence = self.dispatched;
        debug!("Dispatching command #{}: {}", sequence, command);

        let description = command.to_string();
        let target = command
            .characteristic_target()
            .map(|(address, characteristic)| (address.to_string(), characteristic));
        let result = match command {
            Command::Scan { duration } => self.scan(duration).await,
            Command::Connect { address, timeout } => self.connect(&address, timeout).await,
            Command::Disconnect { address } => self.disconnect(&address).await,
            Command::Read {
                address,
                characteristic,
            } => self.read(&address, characteristic).await,
            Command::Write {
                address,
                characteristic,
                value,
                mode,
            } => self.write(&address, characteristic, &value, mode).await,
            Command::StartNotify {
                address,
                characteristic,
            } => self.start_notify(&address, characteristic).await,
            Command::StopNotify {
                address,
                characteristic,
            } => self.stop_notify(&address, characteristic).await,
            Command::CheckLiveness { target, reply } => {
                self.check_liveness(target, reply).await;
                Ok(())
            }
            Command::Release { address, client } => {
                self.release(&address, client).await;
                Ok(())
            }
            Command::Forget { address } => {
                self.registry.forget(&address);
                Ok(())
            }
            Command::Shutdown => Ok(()),
        };

        match result {
            Ok(()) => debug!("Command #{} succeeded: {}", sequence, description),
            Err(e) => {
                warn!("Command #{} failed: {}: {}", sequence, description, e);
                match target {
                    Some((address, characteristic)) => {
                        self.events
                            .characteristic_error(&address, characteristic, e.to_string())
                    }
                    None => self.events.error(e.to_string()),
                }
            }
        }
    }

    async fn scan(&self, duration: Duration) -> SessionResult<()> {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_for_new_scan();
        self.events.emit(SessionEvent::ScanStarted {
            duration_ms: duration.as_millis() as u64,
        });
        self.events.emit(SessionEvent::DevicesUpdated {
            devices: Vec::new(),
        });

        let on_advertisement = |device: BluetoothDevice| {
            let advertisement = device.advertisement.clone();
            let (is_new, min_period_ms, devices) = {
                let mut aggregator = self
                    .aggregator
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let is_new = aggregator.on_advertisement(device.clone());
                let min_period_ms = aggregator.min_period(&device.address);
                let devices = is_new.then(|| aggregator.all());
                (is_new, min_period_ms, devices)
            };
            if is_new {
                debug!("New device {} ({})", device.address, device.display_name());
            }
            self.events.emit(SessionEvent::AdvertisementObserved {
                device,
                advertisement,
                min_period_ms,
            });
            if let Some(devices) = devices {
                self.events.emit(SessionEvent::DevicesUpdated { devices });
            }
        };

        info!("Scanning for {} ms", duration.as_millis());
        let result = self.adapter.scan(duration, &on_advertisement).await;

        let devices = self
            .aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .all();
        info!("Scan finished with {} devices", devices.len());
        self.events.emit(SessionEvent::ScanCompleted { devices });
        result.map_err(SessionError::from)
    }

    async fn connect(&self, address: &str, timeout: Duration) -> SessionResult<()> {
        if let Some((client, subscriptions)) = self.registry.begin_disconnect(address) {
            info!("Closing existing session {} before reconnecting", address);
            self.teardown(address, client, subscriptions).await;
            if let Err(e) = self.adapter.disconnect(client).await {
                warn!("Ignoring disconnect failure for {}: {}", address, e);
            }
            self.registry.mark_disconnected(address);
        }

        self.registry.begin(address)?;

        info!("Connecting to {} (timeout {} ms)", address, timeout.as_millis());
        match self.adapter.connect(address, timeout).await {
            Ok((client, services)) => {
                if let Err(e) = self.registry.complete(address, Some((client, services.clone()))) {
                    error!("Connected to {} but the session is gone: {}", address, e);
                    if let Err(e) = self.adapter.disconnect(client).await {
                        warn!("Failed to close orphaned link to {}: {}", address, e);
                    }
                    return Ok(());
                }
                self.events.emit(SessionEvent::ConnectionChanged {
                    connected: true,
                    address: address.to_string(),
                });
                self.events.emit(SessionEvent::ServicesDiscovered {
                    address: address.to_string(),
                    services,
                });
                Ok(())
            }
            Err(e) => {
                if let Err(inner) = self.registry.complete(address, None) {
                    error!("Failed connect to {} has no pending session: {}", address, inner);
                }
                self.events.emit(SessionEvent::ConnectionChanged {
                    connected: false,
                    address: address.to_string(),
                });
                Err(SessionError::Adapter(e))
            }
        }
    }

    async fn disconnect(&self, address: &str) -> SessionResult<()> {
        let Some((client, subscriptions)) = self.registry.begin_disconnect(address) else {
            debug!("Disconnect requested for {} which is not connected", address);
            if self.registry.mark_disconnected(address) {
                self.emit_disconnected(address);
            }
            return Ok(());
        };

        info!("Disconnecting from {}", address);
        self.teardown(address, client, subscriptions).await;
        let result = self.adapter.disconnect(client).await;
        if self.registry.mark_disconnected(address) {
            self.emit_disconnected(address);
        }
        result.map_err(SessionError::from)
    }

    /// Frees a client whose link was lost. The session is already closed,
    /// so failures are only logged.
    async fn release(&self, address: &str, client: ClientHandle) {
        if self.registry.client(address) == Some(client) {
            debug!("{} still serves {}, not releasing it", client, address);
            return;
        }
        debug!("Releasing {} of lost session {}", client, address);
        if let Err(e) = self.adapter.disconnect(client).await {
            warn!("Ignoring release failure for {}: {}", address, e);
        }
    }

    /// Best-effort unsubscribe of every characteristic; failures are only logged.
    async fn teardown(&self, address: &str, client: ClientHandle, subscriptions: Vec<Uuid>) {
        for characteristic in subscriptions {
            if let Err(e) = self.adapter.stop_notify(client, characteristic).await {
                warn!(
                    "Ignoring stop notify failure for {} on {}: {}",
                    characteristic, address, e
                );
            }
        }
    }

    fn connected_client(&self, address: &str) -> SessionResult<ClientHandle> {
        self.registry
            .client(address)
            .ok_or_else(|| SessionError::NotConnected(address.to_string()))
    }

    async fn read(&self, address: &str, characteristic: Uuid) -> SessionResult<()> {
        let client = self.connected_client(address)?;
        let value = self.adapter.read(client, characteristic).await?;
        self.events.emit(SessionEvent::CharacteristicRead {
            address: address.to_string(),
            characteristic,
            value,
        });
        Ok(())
    }

    async fn write(
        &self,
        address: &str,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> SessionResult<()> {
        let client = self.connected_client(address)?;
        let result = self.adapter.write(client, characteristic, value, mode).await;
        self.events.emit(SessionEvent::CharacteristicWritten {
            address: address.to_string(),
            characteristic,
            success: result.is_ok(),
        });
        result.map_err(SessionError::from)
    }

    async fn start_notify(&self, address: &str, characteristic: Uuid) -> SessionResult<()> {
        let client = self.connected_client(address)?;
        if self.registry.is_subscribed(address, &characteristic) {
            debug!("Already subscribed to {} on {}", characteristic, address);
            return Ok(());
        }
        self.adapter.start_notify(client, characteristic).await?;
        self.registry.record_subscription(address, characteristic, true)
    }

    async fn stop_notify(&self, address: &str, characteristic: Uuid) -> SessionResult<()> {
        let client = self.connected_client(address)?;
        if !self.registry.is_subscribed(address, &characteristic) {
            debug!("Not subscribed to {} on {}", characteristic, address);
            return Ok(());
        }
        self.adapter.stop_notify(client, characteristic).await?;
        self.registry.record_subscription(address, characteristic, false)
    }

    async fn check_liveness(
        &self,
        target: LivenessTarget,
        reply: Option<mpsc::UnboundedSender<LivenessReport>>,
    ) {
        let addresses = match target {
            LivenessTarget::Address(address) => vec![address],
            LivenessTarget::All => self.registry.addresses(),
        };

        for address in addresses {
            let client = self.registry.client(&address);
            let connected = match client {
                Some(client) => self.adapter.is_connected(client).await,
                None => false,
            };
            debug!("Liveness of {}: {}", address, connected);
            self.events.emit(SessionEvent::ConnectionLivenessChecked {
                address: address.clone(),
                connected,
            });
            if let Some(reply) = &reply {
                let report = LivenessReport {
                    address,
                    client,
                    connected,
                };
                if reply.send(report).is_err() {
                    debug!("Liveness reply channel closed");
                }
            }
        }
    }

    fn emit_disconnected(&self, address: &str) {
        self.events.emit(SessionEvent::ConnectionChanged {
            connected: false,
            address: address.to_string(),
        });
    }
}
