//! Session registry
//! The single source of truth for per-address connection state. Every
//! mutation goes through one mutex that is never held across an await.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use log::{debug, info};
use uuid::Uuid;

use crate::core::bluetooth::error::{SessionError, SessionResult};
use crate::core::bluetooth::types::{ClientHandle, ConnectionRecord, ConnectionState, ServiceTree};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    records: Mutex<IndexMap<String, ConnectionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, ConnectionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a `Connecting` record, replacing a closed one.
    pub fn begin(&self, address: &str) -> SessionResult<()> {
        let mut records = self.lock();
        if let Some(record) = records.get(address) {
            if matches!(
                record.state,
                ConnectionState::Connecting | ConnectionState::Disconnecting
            ) {
                return Err(SessionError::AlreadyPending(address.to_string()));
            }
        }
        records.insert(address.to_string(), ConnectionRecord::connecting(address));
        debug!("Session {} is connecting", address);
        Ok(())
    }

    /// Resolves a pending connect. `None` means the attempt failed.
    pub fn complete(
        &self,
        address: &str,
        outcome: Option<(ClientHandle, ServiceTree)>,
    ) -> SessionResult<()> {
        let mut records = self.lock();
        let record = records
            .get_mut(address)
            .filter(|record| record.state == ConnectionState::Connecting)
            .ok_or_else(|| SessionError::UnknownAddress(address.to_string()))?;

        match outcome {
            Some((client, services)) => {
                record.state = ConnectionState::Connected;
                record.client = Some(client);
                record.services = Some(services);
                info!("Session {} connected with {}", address, client);
            }
            None => {
                record.state = ConnectionState::Disconnected;
                record.client = None;
                record.services = None;
                info!("Session {} failed to connect", address);
            }
        }
        record.subscriptions.clear();
        Ok(())
    }

    /// Moves a connected session to `Disconnecting`, taking its subscriptions
    /// so they can be torn down. Returns `None` when not connected.
    pub fn begin_disconnect(&self, address: &str) -> Option<(ClientHandle, Vec<Uuid>)> {
        let mut records = self.lock();
        let record = records
            .get_mut(address)
            .filter(|record| record.state == ConnectionState::Connected)?;
        let client = record.client?;
        record.state = ConnectionState::Disconnecting;
        let subscriptions = std::mem::take(&mut record.subscriptions);
        Some((client, subscriptions.into_iter().collect()))
    }

    /// Forces the session to `Disconnected`. Returns `true` if this call
    /// performed the transition, `false` when already closed or unknown.
    pub fn mark_disconnected(&self, address: &str) -> bool {
        let mut records = self.lock();
        match records.get_mut(address) {
            Some(record) => Self::close(record),
            None => false,
        }
    }

    /// Like [`Self::mark_disconnected`], but only while the session is still
    /// the one identified by `client`.
    pub fn mark_disconnected_if(&self, address: &str, client: ClientHandle) -> bool {
        let mut records = self.lock();
        match records.get_mut(address) {
            Some(record) if record.client == Some(client) => Self::close(record),
            _ => false,
        }
    }

    fn close(record: &mut ConnectionRecord) -> bool {
        record.subscriptions.clear();
        record.client = None;
        if record.state == ConnectionState::Disconnected {
            return false;
        }
        record.state = ConnectionState::Disconnected;
        info!("Session {} disconnected", record.address);
        true
    }

    pub fn record_subscription(
        &self,
        address: &str,
        characteristic: Uuid,
        active: bool,
    ) -> SessionResult<()> {
        let mut records = self.lock();
        let record = records
            .get_mut(address)
            .filter(|record| record.is_connected())
            .ok_or_else(|| SessionError::NotConnected(address.to_string()))?;
        if active {
            record.subscriptions.insert(characteristic);
        } else {
            record.subscriptions.remove(&characteristic);
        }
        Ok(())
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.lock()
            .get(address)
            .is_some_and(ConnectionRecord::is_connected)
    }

    pub fn is_subscribed(&self, address: &str, characteristic: &Uuid) -> bool {
        self.lock()
            .get(address)
            .is_some_and(|record| record.is_subscribed(characteristic))
    }

    /// The client handle of a connected session
    pub fn client(&self, address: &str) -> Option<ClientHandle> {
        self.lock()
            .get(address)
            .filter(|record| record.is_connected())
            .and_then(|record| record.client)
    }

    pub fn snapshot(&self, address: &str) -> Option<ConnectionRecord> {
        self.lock().get(address).cloned()
    }

    pub fn snapshots(&self) -> Vec<ConnectionRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Connected sessions with their client handles
    pub fn connected(&self) -> Vec<(String, ClientHandle)> {
        self.lock()
            .values()
            .filter(|record| record.is_connected())
            .filter_map(|record| record.client.map(|client| (record.address.clone(), client)))
            .collect()
    }

    pub fn subscriptions(&self, address: &str) -> BTreeSet<Uuid> {
        self.lock()
            .get(address)
            .map(|record| record.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn forget(&self, address: &str) -> Option<ConnectionRecord> {
        self.lock().shift_remove(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{UUID_BATTERY_LEVEL, UUID_HEART_RATE_MEASUREMENT};

    fn connected(registry: &SessionRegistry, address: &str, client: u64) {
        registry.begin(address).unwrap();
        registry
            .complete(address, Some((ClientHandle::new(client), ServiceTree::default())))
            .unwrap();
    }

    #[test]
    fn begin_rejects_duplicate_pending_connect() {
        let registry = SessionRegistry::new();
        registry.begin("AA").unwrap();
        assert!(matches!(
            registry.begin("AA"),
            Err(SessionError::AlreadyPending(address)) if address == "AA"
        ));
    }

    #[test]
    fn complete_without_pending_record_is_unknown() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.complete("AA", None),
            Err(SessionError::UnknownAddress(_))
        ));

        connected(&registry, "AA", 1);
        assert!(matches!(
            registry.complete("AA", None),
            Err(SessionError::UnknownAddress(_))
        ));
    }

    #[test]
    fn failed_connect_ends_disconnected_without_handle() {
        let registry = SessionRegistry::new();
        registry.begin("AA").unwrap();
        registry.complete("AA", None).unwrap();

        let record = registry.snapshot("AA").unwrap();
        assert_eq!(record.state, ConnectionState::Disconnected);
        assert_eq!(record.client, None);
        assert_eq!(record.services, None);
        registry.begin("AA").unwrap();
    }

    #[test]
    fn subscriptions_require_connected_state() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.record_subscription("AA", UUID_BATTERY_LEVEL, true),
            Err(SessionError::NotConnected(_))
        ));

        connected(&registry, "AA", 1);
        registry.record_subscription("AA", UUID_BATTERY_LEVEL, true).unwrap();
        assert!(registry.is_subscribed("AA", &UUID_BATTERY_LEVEL));
        registry.record_subscription("AA", UUID_BATTERY_LEVEL, false).unwrap();
        assert!(registry.subscriptions("AA").is_empty());
    }

    #[test]
    fn begin_disconnect_takes_subscriptions_atomically() {
        let registry = SessionRegistry::new();
        connected(&registry, "AA", 7);
        registry.record_subscription("AA", UUID_BATTERY_LEVEL, true).unwrap();
        registry
            .record_subscription("AA", UUID_HEART_RATE_MEASUREMENT, true)
            .unwrap();

        let (client, taken) = registry.begin_disconnect("AA").unwrap();
        assert_eq!(client, ClientHandle::new(7));
        assert_eq!(taken.len(), 2);
        assert!(registry.subscriptions("AA").is_empty());
        assert_eq!(
            registry.snapshot("AA").map(|r| r.state),
            Some(ConnectionState::Disconnecting)
        );
        assert!(registry.begin_disconnect("AA").is_none());
        assert!(registry.mark_disconnected("AA"));
    }

    #[test]
    fn mark_disconnected_is_idempotent() {
        let registry = SessionRegistry::new();
        assert!(!registry.mark_disconnected("missing"));

        connected(&registry, "AA", 1);
        registry.record_subscription("AA", UUID_BATTERY_LEVEL, true).unwrap();
        assert!(registry.mark_disconnected("AA"));
        assert!(!registry.mark_disconnected("AA"));

        let record = registry.snapshot("AA").unwrap();
        assert_eq!(record.state, ConnectionState::Disconnected);
        assert!(record.subscriptions.is_empty());
        assert!(!registry.is_connected("AA"));
    }

    #[test]
    fn stale_client_cannot_close_newer_session() {
        let registry = SessionRegistry::new();
        connected(&registry, "AA", 1);
        registry.mark_disconnected("AA");
        connected(&registry, "AA", 2);

        assert!(!registry.mark_disconnected_if("AA", ClientHandle::new(1)));
        assert!(registry.is_connected("AA"));
        assert!(registry.mark_disconnected_if("AA", ClientHandle::new(2)));
    }

    #[test]
    fn forget_removes_record() {
        let registry = SessionRegistry::new();
        connected(&registry, "AA", 1);
        connected(&registry, "BB", 2);
        assert_eq!(registry.connected().len(), 2);

        registry.forget("AA");
        assert_eq!(registry.addresses(), vec!["BB".to_string()]);
        assert!(registry.snapshot("AA").is_none());
    }
}
