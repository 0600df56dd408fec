//! Typed events emitted by the session core towards the presentation layer.

use log::{debug, error};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::types::{AdvertisementData, BluetoothDevice, ServiceTree};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    ScanStarted {
        duration_ms: u64,
    },
    ScanCompleted {
        devices: Vec<BluetoothDevice>,
    },
    DevicesUpdated {
        devices: Vec<BluetoothDevice>,
    },
    AdvertisementObserved {
        device: BluetoothDevice,
        advertisement: AdvertisementData,
        min_period_ms: Option<u64>,
    },
    ConnectionChanged {
        connected: bool,
        address: String,
    },
    ServicesDiscovered {
        address: String,
        services: ServiceTree,
    },
    CharacteristicRead {
        address: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        address: String,
        characteristic: Uuid,
        success: bool,
    },
    NotificationReceived {
        address: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// A failed command. Commands on a characteristic name their target.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        characteristic: Option<Uuid>,
    },
    ConnectionLivenessChecked {
        address: String,
        connected: bool,
    },
}

impl SessionEvent {
    /// The device an event is about, if it concerns a single one
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::ConnectionChanged { address, .. }
            | Self::ServicesDiscovered { address, .. }
            | Self::CharacteristicRead { address, .. }
            | Self::CharacteristicWritten { address, .. }
            | Self::NotificationReceived { address, .. }
            | Self::ConnectionLivenessChecked { address, .. } => Some(address),
            Self::AdvertisementObserved { device, .. } => Some(&device.address),
            _ => None,
        }
    }
}

/// Clonable emitter shared by the sequencer, the router and the liveness monitor.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: SessionEvent) {
        debug!("Emitting session event: {:?}", event);
        if let Err(e) = self.tx.send(event) {
            error!("Failed to emit session event, presentation layer is gone: {:?}", e.0);
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Error {
            message: message.into(),
            address: None,
            characteristic: None,
        });
    }

    pub fn characteristic_error(
        &self,
        address: &str,
        characteristic: Uuid,
        message: impl Into<String>,
    ) {
        self.emit(SessionEvent::Error {
            message: message.into(),
            address: Some(address.to_string()),
            characteristic: Some(characteristic),
        });
    }
}
