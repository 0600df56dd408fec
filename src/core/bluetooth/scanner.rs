use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use bluest::{Adapter, AdvertisingDevice, Device};
use futures_util::StreamExt;
use log::{debug, info};
use regex::Regex;
use tokio::time::sleep;

use crate::core::bluetooth::types::{AdvertisementData, BluetoothDevice};

static MAC_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}[0-9A-Fa-f]{2}").expect("MAC address pattern is valid")
});

/// Scans with bluest and remembers the platform device handle of every
/// advertiser so it can be connected to later.
pub struct BluetoothScanner {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl BluetoothScanner {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Scans until `duration` elapses, reporting each advertisement as it arrives.
    pub async fn scan(
        &self,
        duration: Duration,
        on_advertisement: &(dyn Fn(BluetoothDevice) + Send + Sync),
    ) -> Result<()> {
        // Clear existing devices
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!("Starting bluetooth scan");
        let mut scan_stream = self.adapter.scan(&[]).await?;
        let deadline = sleep(duration);
        tokio::pin!(deadline);

        // Process discovered devices in real-time
        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered_device) => {
                            debug!(
                                "Found device - Device: {:?}, RSSI: {:?}",
                                discovered_device.device, discovered_device.rssi
                            );
                            let device = Self::to_bluetooth_device(&discovered_device);
                            self.devices
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(device.address.clone(), discovered_device.device.clone());
                            on_advertisement(device);
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = &mut deadline => {
                    info!("Scan duration elapsed.");
                    break;
                }
            }
        }
        Ok(())
    }

    /// The platform handle of a device seen during the last scan
    pub fn device(&self, address: &str) -> Option<Device> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    /// Looks for `address` among the devices the system already holds a link to
    pub async fn find_connected(&self, address: &str) -> Result<Option<Device>> {
        let connected_devices = self.adapter.connected_devices().await?;
        Ok(connected_devices
            .into_iter()
            .find(|device| Self::address_of(&device.id().to_string()) == address))
    }

    fn to_bluetooth_device(discovered: &AdvertisingDevice) -> BluetoothDevice {
        let id = discovered.device.id().to_string();
        let adv = &discovered.adv_data;
        let name = adv
            .local_name
            .clone()
            .or_else(|| discovered.device.name().ok())
            .filter(|name| !name.is_empty());

        let advertisement = AdvertisementData {
            local_name: adv.local_name.clone(),
            manufacturer_data: adv
                .manufacturer_data
                .iter()
                .map(|m| (m.company_id, m.data.to_vec()))
                .collect(),
            service_uuids: adv.services.iter().copied().collect(),
            service_data: adv
                .service_data
                .iter()
                .map(|(uuid, data)| (*uuid, data.to_vec()))
                .collect(),
            tx_power: adv.tx_power_level,
        };

        BluetoothDevice::new(
            Self::address_of(&id),
            id,
            name,
            discovered.rssi,
            advertisement,
        )
    }

    /// The MAC address embedded in a platform id, or the id itself when the
    /// platform hides MAC addresses.
    pub fn address_of(device_id: &str) -> String {
        Self::extract_mac_address(device_id).unwrap_or_else(|| device_id.to_string())
    }

    pub fn extract_mac_address(device_id: &str) -> Option<String> {
        MAC_ADDRESS
            .find_iter(device_id)
            .last()
            .map(|m| m.as_str().replace(['_', '-'], ":").to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_mac_from_bluez_path() {
        assert_eq!(
            BluetoothScanner::extract_mac_address("/org/bluez/hci0/dev_aa_bb_cc_dd_ee_ff"),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
    }

    #[test]
    fn extracts_mac_from_windows_id() {
        assert_eq!(
            BluetoothScanner::extract_mac_address("BluetoothLE#BluetoothLE00:11:22:33:44:55-c4:7c:8d:6a:01:02"),
            Some("C4:7C:8D:6A:01:02".to_string())
        );
    }

    #[test]
    fn falls_back_to_platform_id() {
        let id = "6F1C2B2A-3D6E-4C1B-9D2F-0A1B2C3D4E5F";
        assert_eq!(BluetoothScanner::extract_mac_address(id), None);
        assert_eq!(BluetoothScanner::address_of(id), id);
    }
}
