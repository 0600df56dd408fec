//! Bluetooth session manager for the BLE inspector
//! This module wires the sequencer, the notification router and the liveness
//! monitor around one adapter and exposes the caller facing API.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::InspectorConfig;
use crate::core::bluetooth::adapter::{AdapterEvent, BleAdapter};
use crate::core::bluetooth::aggregator::{AdvertisementAggregator, DeviceFilter};
use crate::core::bluetooth::commands::CommandSender;
use crate::core::bluetooth::error::SessionResult;
use crate::core::bluetooth::events::{EventSender, SessionEvent};
use crate::core::bluetooth::liveness::LivenessMonitor;
use crate::core::bluetooth::registry::SessionRegistry;
use crate::core::bluetooth::router::NotificationRouter;
use crate::core::bluetooth::sequencer::CommandSequencer;
use crate::core::bluetooth::types::{BluetoothDevice, ConnectionRecord};

/// Owns the background tasks of one BLE session
pub struct SessionManager {
    commands: CommandSender,
    registry: Arc<SessionRegistry>,
    aggregator: Arc<Mutex<AdvertisementAggregator>>,
    cancel_token: CancellationToken,
    sequencer_task: Option<JoinHandle<()>>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl SessionManager {
    /// Spawns the session tasks on the current tokio runtime.
    /// Returns the manager and the stream of session events.
    pub fn start(
        adapter: Arc<dyn BleAdapter>,
        adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
        config: &InspectorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let registry = Arc::new(SessionRegistry::new());
        let aggregator = Arc::new(Mutex::new(AdvertisementAggregator::new()));
        let (events, event_rx) = EventSender::channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let commands = CommandSender::new(command_tx);
        let cancel_token = CancellationToken::new();

        let sequencer = CommandSequencer::new(
            adapter,
            registry.clone(),
            aggregator.clone(),
            events.clone(),
        );
        let sequencer_task = tokio::spawn(sequencer.run(command_rx));

        let router = NotificationRouter::new(registry.clone(), commands.clone(), events.clone());
        let router_task = tokio::spawn(router.run(adapter_events, cancel_token.clone()));

        let monitor = LivenessMonitor::new(
            registry.clone(),
            commands.clone(),
            events,
            config.liveness_interval(),
        );
        let monitor_task = tokio::spawn(monitor.run(cancel_token.clone()));

        info!("BLE session started.");
        let manager = Self {
            commands,
            registry,
            aggregator,
            cancel_token,
            sequencer_task: Some(sequencer_task),
            background_tasks: vec![router_task, monitor_task],
        };
        (manager, event_rx)
    }

    /// A clonable handle for queuing commands
    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn snapshot(&self, address: &str) -> Option<ConnectionRecord> {
        self.registry.snapshot(address)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.registry.is_connected(address)
    }

    pub fn devices(&self, filter: &DeviceFilter) -> Vec<BluetoothDevice> {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .query(filter)
    }

    pub fn device(&self, address: &str) -> Option<BluetoothDevice> {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .device(address)
            .cloned()
    }

    pub fn min_period(&self, address: &str) -> Option<u64> {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .min_period(address)
    }

    /// Disconnects (if needed) and then drops the session of `address`,
    /// in queue order.
    pub fn close(&self, address: &str) -> SessionResult<()> {
        self.commands.disconnect(address)?;
        self.commands.forget(address)
    }

    /// Disconnects every open session, then stops all tasks. Commands queued
    /// before this call still run.
    pub async fn shutdown(mut self, grace: Duration) {
        info!("Shutting down BLE session.");
        self.cancel_token.cancel();

        for (address, _) in self.registry.connected() {
            if let Err(e) = self.commands.disconnect(&address) {
                warn!("Failed to queue disconnect for {}: {}", address, e);
            }
        }
        if let Err(e) = self.commands.shutdown() {
            warn!("Failed to queue shutdown: {}", e);
        }

        if let Some(task) = self.sequencer_task.take() {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => info!("Command sequencer drained."),
                Ok(Err(e)) => warn!("Command sequencer ended with a join error: {:?}", e),
                Err(_) => warn!(
                    "Command sequencer still busy after {} ms, abandoning it",
                    grace.as_millis()
                ),
            }
        }
        for task in self.background_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Session task ended with a join error: {:?}", e);
            }
        }
        info!("BLE session stopped.");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
