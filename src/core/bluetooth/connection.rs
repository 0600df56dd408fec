//! Bluetooth connection handling
//! This module connects to a device and walks its GATT tree

use std::collections::HashMap;

use anyhow::Result;
use bluest::{Adapter, Characteristic, Device, Uuid};
use log::{debug, info, warn};

use crate::core::bluetooth::types::{
    CharacteristicInfo, CharacteristicProperties, ServiceInfo, ServiceTree,
};

/// Connection manager for the bluest backend
#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Adapter,
}

impl ConnectionManager {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Connects to `device` and discovers every service and characteristic.
    /// Returns the tree together with the characteristic handles keyed by UUID.
    pub async fn connect(
        &self,
        device: &Device,
    ) -> Result<(ServiceTree, HashMap<Uuid, Characteristic>)> {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let id = device.id().to_string();
        info!("Device details - ID: {}, Name: {:?}", id, name);

        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            self.adapter.connect_device(device).await?;
        }

        info!("Connection successful, discovering services...");
        let mut services = Vec::new();
        let mut handles = HashMap::new();
        for service in device.services().await? {
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid();
                let properties = match characteristic.properties().await {
                    Ok(props) => CharacteristicProperties {
                        read: props.read,
                        write: props.write,
                        write_without_response: props.write_without_response,
                        notify: props.notify,
                        indicate: props.indicate,
                    },
                    Err(e) => {
                        warn!("Could not read properties of {}: {}", uuid, e);
                        CharacteristicProperties::default()
                    }
                };
                debug!("Found characteristic {} ({})", uuid, properties);
                characteristics.push(CharacteristicInfo::new(uuid, properties));
                handles.insert(uuid, characteristic);
            }
            info!(
                "Found service {} with {} characteristics",
                service.uuid(),
                characteristics.len()
            );
            services.push(ServiceInfo::new(service.uuid(), characteristics));
        }

        info!("Service discovery on {} completed", id);
        Ok((ServiceTree::new(services), handles))
    }

    pub async fn disconnect(&self, device: &Device) -> Result<()> {
        if device.is_connected().await {
            info!("Disconnecting from device {}", device.id());
            self.adapter.disconnect_device(device).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", device.id());
        }
        Ok(())
    }
}
