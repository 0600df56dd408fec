//! Defines shared data structures for the Bluetooth module.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::constants::{UNKNOWN_DEVICE_NAME, describe_uuid};

/// Payload of the most recent advertisement seen for a device.
/// Every optional field is explicit; absent fields stay `None` or empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdvertisementData {
    /// The local name carried by the advertisement, if any
    pub local_name: Option<String>,
    /// Manufacturer specific data keyed by company identifier
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
    /// Service data keyed by service UUID
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// Advertised transmit power level in dBm
    pub tx_power: Option<i16>,
}

impl AdvertisementData {
    /// Lowercase hex of every manufacturer data byte, concatenated in company id order
    pub fn manufacturer_hex(&self) -> String {
        self.manufacturer_data.values().map(hex::encode).collect()
    }
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BluetoothDevice {
    /// The address of the device (MAC address on most platforms, the platform UUID on macOS)
    pub address: String,
    /// Platform-specific unique identifier for the device
    pub id: String,
    /// The name of the device, if available
    pub name: Option<String>,
    /// The signal strength (RSSI) of the last advertisement
    pub rssi: Option<i16>,
    /// The last advertisement payload
    pub advertisement: AdvertisementData,
}

impl BluetoothDevice {
    /// Creates a new BluetoothDevice instance
    pub fn new(
        address: String,
        id: String,
        name: Option<String>,
        rssi: Option<i16>,
        advertisement: AdvertisementData,
    ) -> Self {
        Self {
            address,
            id,
            name,
            rssi,
            advertisement,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

/// Opaque token identifying one adapter-level connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientHandle(u64);

impl ClientHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// GATT characteristic properties the inspector cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Acknowledged writes are used whenever the characteristic advertises `write`.
    pub fn write_mode(&self) -> WriteMode {
        if self.write {
            WriteMode::WithResponse
        } else {
            WriteMode::WithoutResponse
        }
    }

    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.read, "read"),
            (self.write, "write"),
            (self.write_without_response, "write-without-response"),
            (self.notify, "notify"),
            (self.indicate, "indicate"),
        ];
        let names: Vec<&str> = flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Write acknowledgement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub description: Option<String>,
    pub properties: CharacteristicProperties,
}

impl CharacteristicInfo {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            description: describe_uuid(&uuid).map(str::to_string),
            properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub description: Option<String>,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    pub fn new(uuid: Uuid, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            uuid,
            description: describe_uuid(&uuid).map(str::to_string),
            characteristics,
        }
    }
}

/// Read-only snapshot of a device's GATT tree, replaced wholesale on reconnect
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ServiceTree {
    services: Vec<ServiceInfo>,
}

impl ServiceTree {
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicInfo> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| characteristic.uuid == *uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(text)
    }
}

/// Per-address session state owned by the session registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    pub address: String,
    pub state: ConnectionState,
    /// Present while connected, and while disconnecting for cleanup
    pub client: Option<ClientHandle>,
    /// Present after a successful connect
    pub services: Option<ServiceTree>,
    /// Characteristics with an active notification subscription
    pub subscriptions: BTreeSet<Uuid>,
}

impl ConnectionRecord {
    pub fn connecting(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: ConnectionState::Connecting,
            client: None,
            services: None,
            subscriptions: BTreeSet::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_subscribed(&self, characteristic: &Uuid) -> bool {
        self.subscriptions.contains(characteristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE};

    #[test]
    fn manufacturer_hex_concatenates_in_company_order() {
        let mut advertisement = AdvertisementData::default();
        advertisement.manufacturer_data.insert(0x004c, vec![0xAB, 0x01]);
        advertisement.manufacturer_data.insert(0x0006, vec![0x0F]);
        assert_eq!(advertisement.manufacturer_hex(), "0fab01");
    }

    #[test]
    fn write_mode_follows_write_property() {
        let acked = CharacteristicProperties {
            write: true,
            write_without_response: true,
            ..Default::default()
        };
        let unacked = CharacteristicProperties {
            write_without_response: true,
            ..Default::default()
        };
        assert_eq!(acked.write_mode(), WriteMode::WithResponse);
        assert_eq!(unacked.write_mode(), WriteMode::WithoutResponse);
        assert_eq!(acked.to_string(), "write, write-without-response");
    }

    #[test]
    fn service_tree_finds_characteristics_across_services() {
        let battery = CharacteristicInfo::new(
            UUID_BATTERY_LEVEL,
            CharacteristicProperties {
                read: true,
                notify: true,
                ..Default::default()
            },
        );
        let tree = ServiceTree::new(vec![ServiceInfo::new(UUID_BATTERY_SERVICE, vec![battery])]);

        let found = tree.characteristic(&UUID_BATTERY_LEVEL).map(|c| c.description.clone());
        assert_eq!(found, Some(Some("Battery Level".to_string())));
        assert!(tree.characteristic(&Uuid::nil()).is_none());
    }
}
