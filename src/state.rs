//! Application state management
//! This module defines the state shared by the console loop and the event printer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::InspectorConfig;
use crate::core::SessionManager;

/// Devices the operator opened a view for, plus reads still waiting for a value
#[derive(Debug, Default)]
pub struct DeviceViews {
    open: IndexSet<String>,
    pending_reads: HashMap<(String, Uuid), Instant>,
}

impl DeviceViews {
    /// Returns `false` if the view was already open
    pub fn open(&mut self, address: &str) -> bool {
        self.open.insert(address.to_string())
    }

    pub fn close(&mut self, address: &str) -> bool {
        self.pending_reads.retain(|(owner, _), _| owner != address);
        self.open.shift_remove(address)
    }

    pub fn is_open(&self, address: &str) -> bool {
        self.open.contains(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.open.iter().cloned().collect()
    }

    pub fn read_started(&mut self, address: &str, characteristic: Uuid) {
        self.pending_reads
            .insert((address.to_string(), characteristic), Instant::now());
    }

    /// How long the read took, if it was still pending
    pub fn read_finished(&mut self, address: &str, characteristic: Uuid) -> Option<Duration> {
        self.pending_reads
            .remove(&(address.to_string(), characteristic))
            .map(|started| started.elapsed())
    }

    /// Removes and returns every read older than `timeout`
    pub fn take_overdue_reads(&mut self, timeout: Duration) -> Vec<(String, Uuid)> {
        let mut overdue = Vec::new();
        self.pending_reads.retain(|(address, characteristic), started| {
            if started.elapsed() >= timeout {
                overdue.push((address.clone(), *characteristic));
                false
            } else {
                true
            }
        });
        overdue.sort();
        overdue
    }
}

/// Global application state
pub struct AppState {
    /// The BLE session
    pub session_manager: SessionManager,
    pub config: InspectorConfig,
    pub config_path: PathBuf,
    views: Arc<Mutex<DeviceViews>>,
}

impl AppState {
    pub fn new(session_manager: SessionManager, config: InspectorConfig, config_path: PathBuf) -> Self {
        Self {
            session_manager,
            config,
            config_path,
            views: Arc::new(Mutex::new(DeviceViews::default())),
        }
    }

    /// Shared handle for the event printer
    pub fn views_arc(&self) -> Arc<Mutex<DeviceViews>> {
        self.views.clone()
    }

    pub fn views(&self) -> MutexGuard<'_, DeviceViews> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gives up the state, keeping only the session for shutdown
    pub fn into_session_manager(self) -> SessionManager {
        self.session_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_a_view_drops_its_pending_reads() {
        let mut views = DeviceViews::default();
        assert!(views.open("AA"));
        assert!(!views.open("AA"));
        views.read_started("AA", Uuid::nil());

        assert!(views.close("AA"));
        assert!(!views.is_open("AA"));
        assert_eq!(views.read_finished("AA", Uuid::nil()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_reads_are_reported_once() {
        let mut views = DeviceViews::default();
        views.open("AA");
        views.read_started("AA", Uuid::nil());
        tokio::time::sleep(Duration::from_millis(4_999)).await;
        assert!(views.take_overdue_reads(Duration::from_secs(5)).is_empty());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            views.take_overdue_reads(Duration::from_secs(5)),
            vec![("AA".to_string(), Uuid::nil())]
        );
        assert!(views.take_overdue_reads(Duration::from_secs(5)).is_empty());
    }
}
