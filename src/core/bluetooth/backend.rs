//! The production adapter, backed by the platform stack through bluest

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use bluest::{Adapter, Characteristic, Device};
use log::{info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{AdapterEvent, BleAdapter};
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{BluetoothDevice, ClientHandle, ServiceTree, WriteMode};

/// State held for each open link
#[derive(Clone)]
pub struct ConnectedDeviceState {
    pub address: String,
    pub device: Device,
    pub characteristics: HashMap<Uuid, Characteristic>,
}

pub struct BluestAdapter {
    scanner: BluetoothScanner,
    connection_manager: ConnectionManager,
    notification_handler: NotificationHandler,
    clients: Mutex<HashMap<ClientHandle, ConnectedDeviceState>>,
    next_client: AtomicU64,
}

impl BluestAdapter {
    /// Opens the default adapter and waits until it is powered on
    pub async fn new(events: mpsc::UnboundedSender<AdapterEvent>) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        Ok(Self {
            scanner: BluetoothScanner::new(adapter.clone()),
            connection_manager: ConnectionManager::new(adapter),
            notification_handler: NotificationHandler::new(events),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        })
    }

    fn state(&self, client: ClientHandle) -> Result<ConnectedDeviceState> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client)
            .cloned()
            .ok_or_else(|| anyhow!("{} is not an open connection", client))
    }

    fn characteristic(&self, client: ClientHandle, uuid: Uuid) -> Result<(ConnectedDeviceState, Characteristic)> {
        let state = self.state(client)?;
        let characteristic = state
            .characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| anyhow!("Characteristic {} not found on {}", uuid, state.address))?;
        Ok((state, characteristic))
    }

    async fn find_device(&self, address: &str) -> Result<Device> {
        if let Some(device) = self.scanner.device(address) {
            return Ok(device);
        }
        match self.scanner.find_connected(address).await? {
            Some(device) => Ok(device),
            None => bail!("Device not found with address: {}", address),
        }
    }
}

#[async_trait::async_trait]
impl BleAdapter for BluestAdapter {
    async fn scan(
        &self,
        duration: Duration,
        on_advertisement: &(dyn Fn(BluetoothDevice) + Send + Sync),
    ) -> Result<()> {
        self.scanner.scan(duration, on_advertisement).await
    }

    async fn connect(&self, address: &str, timeout: Duration) -> Result<(ClientHandle, ServiceTree)> {
        let device = self.find_device(address).await?;
        let (services, characteristics) =
            match tokio::time::timeout(timeout, self.connection_manager.connect(&device)).await {
                Ok(result) => result?,
                Err(_) => {
                    if let Err(e) = self.connection_manager.disconnect(&device).await {
                        warn!("Failed to abort connection to {}: {}", address, e);
                    }
                    bail!("Connection to {} timed out after {} ms", address, timeout.as_millis());
                }
            };

        let client = ClientHandle::new(self.next_client.fetch_add(1, Ordering::Relaxed));
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                client,
                ConnectedDeviceState {
                    address: address.to_string(),
                    device,
                    characteristics,
                },
            );
        info!("Connected to {} as {}", address, client);
        Ok((client, services))
    }

    async fn disconnect(&self, client: ClientHandle) -> Result<()> {
        let state = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client);
        let Some(state) = state else {
            info!("{} already released", client);
            return Ok(());
        };
        self.notification_handler.stop_all(&state.address);
        self.connection_manager.disconnect(&state.device).await
    }

    async fn is_connected(&self, client: ClientHandle) -> bool {
        match self.state(client) {
            Ok(state) => state.device.is_connected().await,
            Err(_) => false,
        }
    }

    async fn read(&self, client: ClientHandle, characteristic: Uuid) -> Result<Vec<u8>> {
        let (_, characteristic) = self.characteristic(client, characteristic)?;
        Ok(characteristic.read().await?)
    }

    async fn write(
        &self,
        client: ClientHandle,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let (_, characteristic) = self.characteristic(client, characteristic)?;
        match mode {
            WriteMode::WithResponse => characteristic.write(value).await?,
            WriteMode::WithoutResponse => characteristic.write_without_response(value).await?,
        }
        Ok(())
    }

    async fn start_notify(&self, client: ClientHandle, characteristic: Uuid) -> Result<()> {
        let (state, characteristic) = self.characteristic(client, characteristic)?;
        self.notification_handler
            .start(&state.address, state.device, characteristic)
            .await
    }

    async fn stop_notify(&self, client: ClientHandle, characteristic: Uuid) -> Result<()> {
        let state = self.state(client)?;
        self.notification_handler
            .stop(&state.address, characteristic)
            .await
    }
}
