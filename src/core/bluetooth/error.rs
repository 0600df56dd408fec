//! Error taxonomy of the BLE session core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Radio or transport failure reported by the adapter, timeouts included
    #[error("BLE Error: {0:#}")]
    Adapter(anyhow::Error),

    #[error("Device {0} is not connected")]
    NotConnected(String),

    #[error("A connection to {0} is already pending")]
    AlreadyPending(String),

    #[error("No pending connection for {0}")]
    UnknownAddress(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("The BLE session has been shut down")]
    SessionClosed,
}

impl From<anyhow::Error> for SessionError {
    fn from(error: anyhow::Error) -> Self {
        Self::Adapter(error)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
