//! BLE inspector library
//! Session management for inspecting Bluetooth Low Energy devices, plus the
//! console front end built on top of it.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod display;
pub mod logging;
pub mod state;
pub mod utils;
