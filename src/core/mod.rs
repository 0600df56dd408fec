//! Core functionality for the BLE inspector
//! This module contains the session machinery that talks to BLE adapters

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{SessionEvent, SessionManager};
