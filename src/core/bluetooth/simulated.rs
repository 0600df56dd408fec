//! Simulated adapter
//!
//! A deterministic in-process BLE stack for tests and for running the console
//! without a radio. Devices advertise on fixed intervals, every call is
//! recorded, and failures can be injected per operation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{AdapterEvent, BleAdapter};
use crate::core::bluetooth::constants::{
    UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE, UUID_BODY_SENSOR_LOCATION, UUID_DEVICE_INFORMATION_SERVICE,
    UUID_DEVICE_NAME, UUID_ENVIRONMENTAL_SENSING_SERVICE, UUID_GENERIC_ACCESS_SERVICE,
    UUID_HEART_RATE_CONTROL_POINT, UUID_HEART_RATE_MEASUREMENT, UUID_HEART_RATE_SERVICE, UUID_HUMIDITY,
    UUID_MANUFACTURER_NAME, UUID_MODEL_NUMBER, UUID_TEMPERATURE,
};
use crate::core::bluetooth::types::{
    AdvertisementData, BluetoothDevice, CharacteristicInfo, CharacteristicProperties, ClientHandle,
    ServiceInfo, ServiceTree, WriteMode,
};

/// A fixture device
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub advertisement: AdvertisementData,
    /// Time between two advertisements during a scan
    pub advertising_interval: Duration,
    pub services: Vec<ServiceInfo>,
    /// Current characteristic values
    pub values: HashMap<Uuid, Vec<u8>>,
}

impl SimulatedDevice {
    pub fn new(address: &str, name: Option<&str>) -> Self {
        Self {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: -60,
            advertisement: AdvertisementData {
                local_name: name.map(str::to_string),
                ..Default::default()
            },
            advertising_interval: Duration::from_millis(100),
            services: Vec::new(),
            values: HashMap::new(),
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_advertising_interval(mut self, interval: Duration) -> Self {
        self.advertising_interval = interval;
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: &[u8]) -> Self {
        self.advertisement
            .manufacturer_data
            .insert(company_id, data.to_vec());
        self
    }

    /// Adds a characteristic, creating its service on first use
    pub fn with_characteristic(
        mut self,
        service: Uuid,
        characteristic: Uuid,
        properties: CharacteristicProperties,
        value: &[u8],
    ) -> Self {
        let info = CharacteristicInfo::new(characteristic, properties);
        match self.services.iter_mut().find(|s| s.uuid == service) {
            Some(existing) => existing.characteristics.push(info),
            None => {
                self.advertisement.service_uuids.push(service);
                self.services.push(ServiceInfo::new(service, vec![info]));
            }
        }
        self.values.insert(characteristic, value.to_vec());
        self
    }

    fn to_bluetooth_device(&self) -> BluetoothDevice {
        BluetoothDevice::new(
            self.address.clone(),
            format!("sim/{}", self.address),
            self.name.clone(),
            Some(self.rssi),
            self.advertisement.clone(),
        )
    }

    fn properties(&self, characteristic: &Uuid) -> Option<CharacteristicProperties> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|c| c.uuid == *characteristic)
            .map(|c| c.properties)
    }
}

/// Every adapter entry point, as recorded by [`SimulatedAdapter::calls`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Scan,
    Connect(String),
    Disconnect(ClientHandle),
    IsConnected(ClientHandle),
    Read(ClientHandle, Uuid),
    Write(ClientHandle, Uuid, Vec<u8>, WriteMode),
    StartNotify(ClientHandle, Uuid),
    StopNotify(ClientHandle, Uuid),
}

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failure {
    Connect,
    Disconnect,
    Read,
    Write,
    StartNotify,
    StopNotify,
}

struct Link {
    address: String,
    alive: bool,
    subscriptions: HashSet<Uuid>,
}

#[derive(Default)]
struct SimulationState {
    devices: IndexMap<String, SimulatedDevice>,
    links: HashMap<ClientHandle, Link>,
    failures: HashSet<Failure>,
    connect_latency: Duration,
    calls: Vec<AdapterCall>,
    next_client: u64,
}

pub struct SimulatedAdapter {
    state: Mutex<SimulationState>,
    events: mpsc::UnboundedSender<AdapterEvent>,
}

impl SimulatedAdapter {
    pub fn new(events: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self {
            state: Mutex::new(SimulationState::default()),
            events,
        }
    }

    pub fn with_devices(
        events: mpsc::UnboundedSender<AdapterEvent>,
        devices: impl IntoIterator<Item = SimulatedDevice>,
    ) -> Self {
        let adapter = Self::new(events);
        for device in devices {
            adapter.add_device(device);
        }
        adapter
    }

    /// A heart rate strap, an environment sensor and a beacon
    pub fn demo(events: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        let read = CharacteristicProperties {
            read: true,
            ..Default::default()
        };
        let read_notify = CharacteristicProperties {
            read: true,
            notify: true,
            ..Default::default()
        };
        let write = CharacteristicProperties {
            write: true,
            ..Default::default()
        };

        let heart_rate = SimulatedDevice::new("C0:FF:EE:00:00:01", Some("Pulse HR"))
            .with_rssi(-48)
            .with_advertising_interval(Duration::from_millis(250))
            .with_characteristic(UUID_GENERIC_ACCESS_SERVICE, UUID_DEVICE_NAME, read, b"Pulse HR")
            .with_characteristic(UUID_HEART_RATE_SERVICE, UUID_HEART_RATE_MEASUREMENT, read_notify, &[0x00, 72])
            .with_characteristic(UUID_HEART_RATE_SERVICE, UUID_BODY_SENSOR_LOCATION, read, &[0x01])
            .with_characteristic(UUID_HEART_RATE_SERVICE, UUID_HEART_RATE_CONTROL_POINT, write, &[])
            .with_characteristic(UUID_BATTERY_SERVICE, UUID_BATTERY_LEVEL, read_notify, &[87]);

        let environment = SimulatedDevice::new("C0:FF:EE:00:00:02", Some("Env Sensor"))
            .with_rssi(-71)
            .with_advertising_interval(Duration::from_millis(1000))
            .with_characteristic(UUID_DEVICE_INFORMATION_SERVICE, UUID_MANUFACTURER_NAME, read, b"Inspector Labs")
            .with_characteristic(UUID_DEVICE_INFORMATION_SERVICE, UUID_MODEL_NUMBER, read, b"ENV-2")
            .with_characteristic(UUID_ENVIRONMENTAL_SENSING_SERVICE, UUID_TEMPERATURE, read_notify, &[0x34, 0x08])
            .with_characteristic(UUID_ENVIRONMENTAL_SENSING_SERVICE, UUID_HUMIDITY, read, &[0x88, 0x13]);

        let beacon = SimulatedDevice::new("C0:FF:EE:00:00:03", None)
            .with_rssi(-89)
            .with_advertising_interval(Duration::from_millis(100))
            .with_manufacturer_data(0x004c, &[0x02, 0x15, 0xab, 0xcd]);

        Self::with_devices(events, [heart_rate, environment, beacon])
    }

    fn lock(&self) -> MutexGuard<'_, SimulationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        self.lock().devices.insert(device.address.clone(), device);
    }

    pub fn fail(&self, failure: Failure) {
        self.lock().failures.insert(failure);
    }

    pub fn recover(&self, failure: Failure) {
        self.lock().failures.remove(&failure);
    }

    /// Delay before a connect completes; connects slower than their timeout fail
    pub fn set_connect_latency(&self, latency: Duration) {
        self.lock().connect_latency = latency;
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn set_value(&self, address: &str, characteristic: Uuid, value: &[u8]) {
        if let Some(device) = self.lock().devices.get_mut(address) {
            device.values.insert(characteristic, value.to_vec());
        }
    }

    pub fn value(&self, address: &str, characteristic: &Uuid) -> Option<Vec<u8>> {
        self.lock()
            .devices
            .get(address)
            .and_then(|device| device.values.get(characteristic).cloned())
    }

    /// Clients the adapter still holds, dead links included
    pub fn held_clients(&self) -> Vec<ClientHandle> {
        let mut clients: Vec<ClientHandle> = self.lock().links.keys().copied().collect();
        clients.sort();
        clients
    }

    /// Kills the link silently; only a liveness probe notices
    pub fn drop_link(&self, address: &str) -> bool {
        let mut state = self.lock();
        let mut dropped = false;
        for link in state.links.values_mut().filter(|l| l.address == address && l.alive) {
            link.alive = false;
            link.subscriptions.clear();
            dropped = true;
        }
        dropped
    }

    /// Kills the link and reports it like a stack would
    pub fn sever_link(&self, address: &str) -> bool {
        let dropped = self.drop_link(address);
        if dropped {
            let _ = self.events.send(AdapterEvent::Disconnected {
                address: address.to_string(),
            });
        }
        dropped
    }

    /// Pushes a value to every live subscription of `characteristic`.
    /// Returns `false` when nobody is subscribed.
    pub fn push_notification(&self, address: &str, characteristic: Uuid, value: &[u8]) -> bool {
        let subscribed = {
            let mut state = self.lock();
            if let Some(device) = state.devices.get_mut(address) {
                device.values.insert(characteristic, value.to_vec());
            }
            state
                .links
                .values()
                .any(|l| l.address == address && l.alive && l.subscriptions.contains(&characteristic))
        };
        if subscribed {
            let _ = self.events.send(AdapterEvent::Notification {
                address: address.to_string(),
                characteristic,
                value: value.to_vec(),
            });
        }
        subscribed
    }

    /// Periodically emits fresh heart rate and temperature values to subscribers
    pub fn start_notification_ticker(
        self: &Arc<Self>,
        period: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            let mut tick: u8 = 0;
            loop {
                tokio::select! {
                    _ = sleep(period) => {}
                    _ = cancel_token.cancelled() => break,
                }
                tick = tick.wrapping_add(1);
                let subscriptions: Vec<(String, Uuid)> = {
                    let state = adapter.lock();
                    state
                        .links
                        .values()
                        .filter(|l| l.alive)
                        .flat_map(|l| l.subscriptions.iter().map(|c| (l.address.clone(), *c)))
                        .collect()
                };
                for (address, characteristic) in subscriptions {
                    let value = match characteristic {
                        c if c == UUID_HEART_RATE_MEASUREMENT => vec![0x00, 60 + tick % 30],
                        c if c == UUID_TEMPERATURE => {
                            (2000u16 + u16::from(tick % 50) * 10).to_le_bytes().to_vec()
                        }
                        c if c == UUID_BATTERY_LEVEL => vec![100 - tick % 100],
                        _ => continue,
                    };
                    adapter.push_notification(&address, characteristic, &value);
                }
            }
            debug!("Notification ticker stopped.");
        })
    }

    fn record(&self, call: AdapterCall) {
        self.lock().calls.push(call);
    }

    fn check(&self, failure: Failure) -> Result<()> {
        if self.lock().failures.contains(&failure) {
            bail!("Simulated {:?} failure", failure);
        }
        Ok(())
    }

    fn live_link(&self, client: ClientHandle) -> Result<String> {
        let state = self.lock();
        match state.links.get(&client) {
            Some(link) if link.alive => Ok(link.address.clone()),
            Some(link) => bail!("Link to {} is down", link.address),
            None => bail!("{} is not an open connection", client),
        }
    }

    fn characteristic(&self, client: ClientHandle, characteristic: &Uuid) -> Result<(String, CharacteristicProperties)> {
        let address = self.live_link(client)?;
        let state = self.lock();
        let properties = state
            .devices
            .get(&address)
            .and_then(|device| device.properties(characteristic))
            .ok_or_else(|| anyhow!("Characteristic {} not found on {}", characteristic, address))?;
        Ok((address, properties))
    }
}

#[async_trait]
impl BleAdapter for SimulatedAdapter {
    async fn scan(
        &self,
        duration: Duration,
        on_advertisement: &(dyn Fn(BluetoothDevice) + Send + Sync),
    ) -> Result<()> {
        self.record(AdapterCall::Scan);
        let devices: Vec<SimulatedDevice> = self.lock().devices.values().cloned().collect();

        let mut schedule: Vec<(Duration, usize)> = Vec::new();
        for (index, device) in devices.iter().enumerate() {
            let mut offset = Duration::ZERO;
            while offset < duration {
                schedule.push((offset, index));
                if device.advertising_interval.is_zero() {
                    break;
                }
                offset += device.advertising_interval;
            }
        }
        schedule.sort_by_key(|(offset, index)| (*offset, *index));

        let start = Instant::now();
        for (offset, index) in schedule {
            sleep_until(start + offset).await;
            on_advertisement(devices[index].to_bluetooth_device());
        }
        sleep_until(start + duration).await;
        Ok(())
    }

    async fn connect(&self, address: &str, timeout: Duration) -> Result<(ClientHandle, ServiceTree)> {
        self.record(AdapterCall::Connect(address.to_string()));
        let latency = self.lock().connect_latency;
        if latency > timeout {
            sleep(timeout).await;
            bail!("Connection to {} timed out after {} ms", address, timeout.as_millis());
        }
        sleep(latency).await;
        self.check(Failure::Connect)?;

        let mut state = self.lock();
        let services = match state.devices.get(address) {
            Some(device) => ServiceTree::new(device.services.clone()),
            None => bail!("Device not found with address: {}", address),
        };
        state.next_client += 1;
        let client = ClientHandle::new(state.next_client);
        state.links.insert(
            client,
            Link {
                address: address.to_string(),
                alive: true,
                subscriptions: HashSet::new(),
            },
        );
        info!("Simulated link to {} opened as {}", address, client);
        Ok((client, services))
    }

    async fn disconnect(&self, client: ClientHandle) -> Result<()> {
        self.record(AdapterCall::Disconnect(client));
        let removed = self.lock().links.remove(&client);
        if removed.is_none() {
            warn!("Disconnect for unknown {}", client);
        }
        self.check(Failure::Disconnect)
    }

    async fn is_connected(&self, client: ClientHandle) -> bool {
        self.record(AdapterCall::IsConnected(client));
        self.live_link(client).is_ok()
    }

    async fn read(&self, client: ClientHandle, characteristic: Uuid) -> Result<Vec<u8>> {
        self.record(AdapterCall::Read(client, characteristic));
        self.check(Failure::Read)?;
        let (address, properties) = self.characteristic(client, &characteristic)?;
        if !properties.read {
            bail!("Characteristic {} is not readable", characteristic);
        }
        Ok(self.value(&address, &characteristic).unwrap_or_default())
    }

    async fn write(
        &self,
        client: ClientHandle,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        self.record(AdapterCall::Write(client, characteristic, value.to_vec(), mode));
        self.check(Failure::Write)?;
        let (address, properties) = self.characteristic(client, &characteristic)?;
        if !(properties.write || properties.write_without_response) {
            bail!("Characteristic {} is not writable", characteristic);
        }
        self.set_value(&address, characteristic, value);
        Ok(())
    }

    async fn start_notify(&self, client: ClientHandle, characteristic: Uuid) -> Result<()> {
        self.record(AdapterCall::StartNotify(client, characteristic));
        self.check(Failure::StartNotify)?;
        let (_, properties) = self.characteristic(client, &characteristic)?;
        if !properties.can_subscribe() {
            bail!("Characteristic {} does not notify", characteristic);
        }
        if let Some(link) = self.lock().links.get_mut(&client) {
            link.subscriptions.insert(characteristic);
        }
        Ok(())
    }

    async fn stop_notify(&self, client: ClientHandle, characteristic: Uuid) -> Result<()> {
        self.record(AdapterCall::StopNotify(client, characteristic));
        self.check(Failure::StopNotify)?;
        if let Some(link) = self.lock().links.get_mut(&client) {
            link.subscriptions.remove(&characteristic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor() -> SimulatedDevice {
        SimulatedDevice::new("AA:00:00:00:00:01", Some("Sensor")).with_characteristic(
            UUID_BATTERY_SERVICE,
            UUID_BATTERY_LEVEL,
            CharacteristicProperties {
                read: true,
                notify: true,
                ..Default::default()
            },
            &[50],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn scan_advertises_on_each_interval() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = SimulatedAdapter::with_devices(
            tx,
            [sensor().with_advertising_interval(Duration::from_millis(100))],
        );
        let seen = Mutex::new(Vec::new());
        let start = Instant::now();
        adapter
            .scan(Duration::from_millis(350), &|device: BluetoothDevice| {
                seen.lock().unwrap().push((device.address, start.elapsed().as_millis()));
            })
            .await
            .unwrap();

        let offsets: Vec<u128> = seen.lock().unwrap().iter().map(|(_, ms)| *ms).collect();
        assert_eq!(offsets, vec![0, 100, 200, 300]);
        assert_eq!(start.elapsed(), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = SimulatedAdapter::with_devices(tx, [sensor()]);
        adapter.set_connect_latency(Duration::from_secs(20));
        let result = adapter
            .connect("AA:00:00:00:00:01", Duration::from_secs(10))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn notifications_only_reach_subscribers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = SimulatedAdapter::with_devices(tx, [sensor()]);
        let (client, services) = adapter
            .connect("AA:00:00:00:00:01", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(services.characteristic(&UUID_BATTERY_LEVEL).is_some());

        assert!(!adapter.push_notification("AA:00:00:00:00:01", UUID_BATTERY_LEVEL, &[49]));
        adapter.start_notify(client, UUID_BATTERY_LEVEL).await.unwrap();
        assert!(adapter.push_notification("AA:00:00:00:00:01", UUID_BATTERY_LEVEL, &[48]));

        assert_eq!(
            rx.try_recv().unwrap(),
            AdapterEvent::Notification {
                address: "AA:00:00:00:00:01".to_string(),
                characteristic: UUID_BATTERY_LEVEL,
                value: vec![48],
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_link_fails_probes_and_reads() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = SimulatedAdapter::with_devices(tx, [sensor()]);
        let (client, _) = adapter
            .connect("AA:00:00:00:00:01", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(adapter.drop_link("AA:00:00:00:00:01"));
        assert!(!adapter.is_connected(client).await);
        assert!(adapter.read(client, UUID_BATTERY_LEVEL).await.is_err());
        assert!(rx.try_recv().is_err());
    }
}
