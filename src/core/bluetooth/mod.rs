//! Bluetooth functionality for the BLE inspector
//! This module handles scanning, per-device sessions, serialized GATT
//! operations, notification delivery and liveness checks.

pub mod adapter;
pub mod aggregator;
pub mod backend;
pub mod commands;
mod connection;
pub mod constants;
pub mod error;
pub mod events;
pub mod liveness;
pub mod manager;
mod notification;
pub mod registry;
pub mod router;
mod scanner;
pub mod sequencer;
pub mod simulated;
pub mod types;

// Re-export types that should be publicly accessible
pub use adapter::{AdapterEvent, BleAdapter};
pub use aggregator::{AdvertisementAggregator, DeviceFilter};
pub use backend::BluestAdapter;
pub use commands::{Command, CommandSender, LivenessReport, LivenessTarget};
pub use constants::*; // Re-export all constants
pub use error::{SessionError, SessionResult};
pub use events::{EventSender, SessionEvent};
pub use manager::SessionManager;
pub use registry::SessionRegistry;
pub use scanner::BluetoothScanner;
pub use simulated::{AdapterCall, Failure, SimulatedAdapter, SimulatedDevice};
pub use types::{
    AdvertisementData, BluetoothDevice, CharacteristicInfo, CharacteristicProperties, ClientHandle,
    ConnectionRecord, ConnectionState, ServiceInfo, ServiceTree, WriteMode,
};
