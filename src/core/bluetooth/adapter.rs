//! The platform BLE stack as seen by the session core.
//! Implementations own the radio; the core only ever calls them from the
//! command sequencer, one call at a time.

use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use crate::core::bluetooth::types::{BluetoothDevice, ClientHandle, ServiceTree, WriteMode};

/// Unsolicited events produced by an adapter outside of any command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// A value pushed by a subscribed characteristic
    Notification {
        address: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The link to a device dropped without being asked to
    Disconnected { address: String },
}

#[async_trait::async_trait]
pub trait BleAdapter: Send + Sync {
    /// Reports advertisements through `on_advertisement` until `duration` elapses
    async fn scan(
        &self,
        duration: Duration,
        on_advertisement: &(dyn Fn(BluetoothDevice) + Send + Sync),
    ) -> Result<()>;

    /// Connects and discovers the GATT tree; `timeout` bounds the whole attempt
    async fn connect(&self, address: &str, timeout: Duration) -> Result<(ClientHandle, ServiceTree)>;

    async fn disconnect(&self, client: ClientHandle) -> Result<()>;

    async fn is_connected(&self, client: ClientHandle) -> bool;

    async fn read(&self, client: ClientHandle, characteristic: Uuid) -> Result<Vec<u8>>;

    async fn write(
        &self,
        client: ClientHandle,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Enables notifications; values arrive as [`AdapterEvent::Notification`]
    async fn start_notify(&self, client: ClientHandle, characteristic: Uuid) -> Result<()>;

    async fn stop_notify(&self, client: ClientHandle, characteristic: Uuid) -> Result<()>;
}
