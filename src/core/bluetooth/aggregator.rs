//! Advertisement aggregation
//! Deduplicates scanned devices, tracks how often each one advertises and
//! answers the filtered device list shown to the operator.

use std::collections::HashMap;
use tokio::time::Instant;

use indexmap::IndexMap;
use serde::Serialize;

use crate::core::bluetooth::types::BluetoothDevice;

/// Inter-arrival statistics for one address.
/// Only the last timestamp and the running minimum are kept, so every
/// append is O(1) no matter how long the scan runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdvertisementHistory {
    samples: u64,
    last_seen_ms: Option<u64>,
    min_period_ms: Option<u64>,
}

impl AdvertisementHistory {
    pub fn record(&mut self, timestamp_ms: u64) {
        if let Some(last) = self.last_seen_ms {
            let period = timestamp_ms.saturating_sub(last);
            self.min_period_ms = Some(match self.min_period_ms {
                Some(current) => current.min(period),
                None => period,
            });
        }
        self.last_seen_ms = Some(timestamp_ms);
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// `None` until at least two advertisements were observed
    pub fn min_period_ms(&self) -> Option<u64> {
        self.min_period_ms
    }
}

/// Operator supplied device filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub mac: Option<String>,
    pub min_rssi: Option<i16>,
    pub adv_hex: Option<String>,
}

impl DeviceFilter {
    pub fn matches(&self, device: &BluetoothDevice) -> bool {
        if let Some(mac) = self.mac.as_deref().filter(|mac| !mac.is_empty()) {
            if !device
                .address
                .to_lowercase()
                .contains(&mac.to_lowercase())
            {
                return false;
            }
        }

        if let Some(min_rssi) = self.min_rssi {
            match device.rssi {
                Some(rssi) if rssi >= min_rssi => {}
                _ => return false,
            }
        }

        if let Some(needle) = self.adv_hex.as_deref() {
            let needle: String = needle
                .split_whitespace()
                .collect::<String>()
                .to_lowercase();
            if !needle.is_empty() && !device.advertisement.manufacturer_hex().contains(&needle) {
                return false;
            }
        }

        true
    }
}

pub struct AdvertisementAggregator {
    epoch: Instant,
    devices: IndexMap<String, BluetoothDevice>,
    history: HashMap<String, AdvertisementHistory>,
}

impl Default for AdvertisementAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl AdvertisementAggregator {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            devices: IndexMap::new(),
            history: HashMap::new(),
        }
    }

    /// Ingests an advertisement stamped with the monotonic clock.
    /// Returns `true` when the address was seen for the first time this scan.
    pub fn on_advertisement(&mut self, device: BluetoothDevice) -> bool {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.on_advertisement_at(device, now_ms)
    }

    pub fn on_advertisement_at(&mut self, device: BluetoothDevice, timestamp_ms: u64) -> bool {
        let address = device.address.clone();
        self.history
            .entry(address.clone())
            .or_default()
            .record(timestamp_ms);

        match self.devices.get_mut(&address) {
            Some(existing) => {
                let name = device.name.clone().or_else(|| existing.name.take());
                *existing = BluetoothDevice { name, ..device };
                false
            }
            None => {
                self.devices.insert(address, device);
                true
            }
        }
    }

    pub fn device(&self, address: &str) -> Option<&BluetoothDevice> {
        self.devices.get(address)
    }

    pub fn history(&self, address: &str) -> Option<&AdvertisementHistory> {
        self.history.get(address)
    }

    pub fn min_period(&self, address: &str) -> Option<u64> {
        self.history.get(address).and_then(|h| h.min_period_ms())
    }

    /// Devices matching `filter`, in first-seen order
    pub fn query(&self, filter: &DeviceFilter) -> Vec<BluetoothDevice> {
        self.devices
            .values()
            .filter(|device| filter.matches(device))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<BluetoothDevice> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn reset_for_new_scan(&mut self) {
        self.devices.clear();
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::types::AdvertisementData;

    fn device(address: &str, rssi: Option<i16>) -> BluetoothDevice {
        BluetoothDevice::new(
            address.to_string(),
            address.to_string(),
            None,
            rssi,
            AdvertisementData::default(),
        )
    }

    #[test]
    fn min_period_is_smallest_gap() {
        let mut aggregator = AdvertisementAggregator::new();
        for t in [0, 100, 250] {
            aggregator.on_advertisement_at(device("AA:BB", Some(-70)), t);
        }
        assert_eq!(aggregator.min_period("AA:BB"), Some(100));
    }

    #[test]
    fn min_period_matches_pairwise_minimum_for_irregular_series() {
        let timestamps = [5u64, 40, 41, 90, 300, 310, 900];
        let mut aggregator = AdvertisementAggregator::new();
        for t in timestamps {
            aggregator.on_advertisement_at(device("CC:DD", None), t);
        }
        let expected = timestamps.windows(2).map(|w| w[1] - w[0]).min();
        assert_eq!(aggregator.min_period("CC:DD"), expected);
        assert_eq!(aggregator.history("CC:DD").map(|h| h.samples()), Some(7));
    }

    #[test]
    fn single_sample_has_no_period() {
        let mut aggregator = AdvertisementAggregator::new();
        assert!(aggregator.on_advertisement_at(device("AA:BB", None), 10));
        assert!(!aggregator.on_advertisement_at(device("AA:BB", None), 20));
        let mut other = AdvertisementAggregator::new();
        other.on_advertisement_at(device("AA:BB", None), 10);
        assert_eq!(other.min_period("AA:BB"), None);
    }

    #[test]
    fn rssi_filter_excludes_weak_and_unknown() {
        let mut aggregator = AdvertisementAggregator::new();
        aggregator.on_advertisement_at(device("AA:BB", Some(-70)), 0);
        let filter = DeviceFilter {
            min_rssi: Some(-60),
            ..Default::default()
        };
        assert!(aggregator.query(&filter).is_empty());

        aggregator.on_advertisement_at(device("AA:BB", Some(-50)), 100);
        aggregator.on_advertisement_at(device("EE:FF", None), 120);
        let found: Vec<String> = aggregator.query(&filter).into_iter().map(|d| d.address).collect();
        assert_eq!(found, vec!["AA:BB".to_string()]);
    }

    #[test]
    fn mac_and_hex_filters_are_case_and_space_insensitive() {
        let mut aggregator = AdvertisementAggregator::new();
        let mut beacon = device("AA:BB:CC:00:11:22", Some(-40));
        beacon
            .advertisement
            .manufacturer_data
            .insert(0x004c, vec![0x02, 0x15, 0xFE]);
        aggregator.on_advertisement_at(beacon, 0);
        aggregator.on_advertisement_at(device("11:22:33:44:55:66", Some(-40)), 5);

        let by_mac = DeviceFilter {
            mac: Some("cc:00".to_string()),
            ..Default::default()
        };
        assert_eq!(aggregator.query(&by_mac).len(), 1);

        let by_hex = DeviceFilter {
            adv_hex: Some(" 15 fE ".to_string()),
            ..Default::default()
        };
        let found = aggregator.query(&by_hex);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "AA:BB:CC:00:11:22");

        assert_eq!(aggregator.query(&DeviceFilter::default()).len(), 2);
    }

    #[test]
    fn query_keeps_first_seen_order_and_updates_in_place() {
        let mut aggregator = AdvertisementAggregator::new();
        let mut named = device("02", Some(-80));
        named.name = Some("Sensor".to_string());
        aggregator.on_advertisement_at(device("01", Some(-90)), 0);
        aggregator.on_advertisement_at(named, 1);
        aggregator.on_advertisement_at(device("02", Some(-30)), 2);

        let all = aggregator.all();
        assert_eq!(all[0].address, "01");
        assert_eq!(all[1].address, "02");
        assert_eq!(all[1].rssi, Some(-30));
        assert_eq!(all[1].name.as_deref(), Some("Sensor"));
    }

    #[test]
    fn reset_clears_devices_and_history() {
        let mut aggregator = AdvertisementAggregator::new();
        aggregator.on_advertisement_at(device("AA:BB", None), 0);
        aggregator.on_advertisement_at(device("AA:BB", None), 50);
        aggregator.reset_for_new_scan();
        assert!(aggregator.is_empty());
        assert_eq!(aggregator.history("AA:BB"), None);
        assert_eq!(aggregator.min_period("AA:BB"), None);
    }
}
