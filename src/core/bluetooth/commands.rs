//! BLE session commands
//! This module contains every command callers can queue for the radio and
//! the clonable sender used to queue them.

use std::fmt;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::error::{SessionError, SessionResult};
use crate::core::bluetooth::types::{ClientHandle, WriteMode};

/// Which sessions a liveness check covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessTarget {
    Address(String),
    /// Every address known to the session registry
    All,
}

/// Outcome of one liveness probe, sent back to whoever asked for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub address: String,
    /// The session that was probed; `None` when there was no open client
    pub client: Option<ClientHandle>,
    pub connected: bool,
}

/// Commands executed by the sequencer, strictly in the order they were queued
#[derive(Debug)]
pub enum Command {
    Scan {
        duration: Duration,
    },
    Connect {
        address: String,
        timeout: Duration,
    },
    Disconnect {
        address: String,
    },
    Read {
        address: String,
        characteristic: Uuid,
    },
    Write {
        address: String,
        characteristic: Uuid,
        value: Vec<u8>,
        mode: WriteMode,
    },
    StartNotify {
        address: String,
        characteristic: Uuid,
    },
    StopNotify {
        address: String,
        characteristic: Uuid,
    },
    CheckLiveness {
        target: LivenessTarget,
        reply: Option<mpsc::UnboundedSender<LivenessReport>>,
    },
    /// Frees the adapter side of a session that was already closed by a
    /// lost link. Nothing is reported to the caller.
    Release {
        address: String,
        client: ClientHandle,
    },
    /// Drops the registry record once every earlier command has run
    Forget {
        address: String,
    },
    /// Stops the sequencer once every earlier command has run
    Shutdown,
}

impl Command {
    /// The characteristic a command operates on, if any
    pub fn characteristic_target(&self) -> Option<(&str, Uuid)> {
        match self {
            Self::Read {
                address,
                characteristic,
            }
            | Self::Write {
                address,
                characteristic,
                ..
            }
            | Self::StartNotify {
                address,
                characteristic,
            }
            | Self::StopNotify {
                address,
                characteristic,
            } => Some((address.as_str(), *characteristic)),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan { duration } => write!(f, "scan for {} ms", duration.as_millis()),
            Self::Connect { address, timeout } => {
                write!(f, "connect {} (timeout {} ms)", address, timeout.as_millis())
            }
            Self::Disconnect { address } => write!(f, "disconnect {}", address),
            Self::Read {
                address,
                characteristic,
            } => write!(f, "read {} on {}", characteristic, address),
            Self::Write {
                address,
                characteristic,
                value,
                mode,
            } => write!(
                f,
                "write {} bytes ({:?}) to {} on {}",
                value.len(),
                mode,
                characteristic,
                address
            ),
            Self::StartNotify {
                address,
                characteristic,
            } => write!(f, "start notify {} on {}", characteristic, address),
            Self::StopNotify {
                address,
                characteristic,
            } => write!(f, "stop notify {} on {}", characteristic, address),
            Self::CheckLiveness { target, .. } => match target {
                LivenessTarget::Address(address) => write!(f, "check liveness of {}", address),
                LivenessTarget::All => write!(f, "check liveness of all sessions"),
            },
            Self::Release { address, client } => write!(f, "release {} of {}", client, address),
            Self::Forget { address } => write!(f, "forget {}", address),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A clonable handle that queues commands for the sequencer.
/// Queuing never blocks; results come back as session events.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    pub fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    pub fn send(&self, command: Command) -> SessionResult<()> {
        debug!("Queuing command: {}", command);
        self.tx.send(command).map_err(|_| SessionError::SessionClosed)
    }

    pub fn scan(&self, duration: Duration) -> SessionResult<()> {
        self.send(Command::Scan { duration })
    }

    pub fn connect(&self, address: &str, timeout: Duration) -> SessionResult<()> {
        self.send(Command::Connect {
            address: address.to_string(),
            timeout,
        })
    }

    pub fn disconnect(&self, address: &str) -> SessionResult<()> {
        self.send(Command::Disconnect {
            address: address.to_string(),
        })
    }

    pub fn read(&self, address: &str, characteristic: Uuid) -> SessionResult<()> {
        self.send(Command::Read {
            address: address.to_string(),
            characteristic,
        })
    }

    /// Rejects an empty payload before anything is queued.
    pub fn write(
        &self,
        address: &str,
        characteristic: Uuid,
        value: Vec<u8>,
        mode: WriteMode,
    ) -> SessionResult<()> {
        if value.is_empty() {
            return Err(SessionError::InvalidPayload(
                "refusing to write an empty value".to_string(),
            ));
        }
        self.send(Command::Write {
            address: address.to_string(),
            characteristic,
            value,
            mode,
        })
    }

    pub fn start_notify(&self, address: &str, characteristic: Uuid) -> SessionResult<()> {
        self.send(Command::StartNotify {
            address: address.to_string(),
            characteristic,
        })
    }

    pub fn stop_notify(&self, address: &str, characteristic: Uuid) -> SessionResult<()> {
        self.send(Command::StopNotify {
            address: address.to_string(),
            characteristic,
        })
    }

    pub fn check_liveness(&self, target: LivenessTarget) -> SessionResult<()> {
        self.send(Command::CheckLiveness {
            target,
            reply: None,
        })
    }

    pub fn release(&self, address: &str, client: ClientHandle) -> SessionResult<()> {
        self.send(Command::Release {
            address: address.to_string(),
            client,
        })
    }

    pub fn forget(&self, address: &str) -> SessionResult<()> {
        self.send(Command::Forget {
            address: address.to_string(),
        })
    }

    pub fn shutdown(&self) -> SessionResult<()> {
        self.send(Command::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_write_is_rejected_before_queueing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = CommandSender::new(tx);

        let result = sender.write("AA", Uuid::nil(), Vec::new(), WriteMode::WithResponse);
        assert!(matches!(result, Err(SessionError::InvalidPayload(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn commands_queue_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = CommandSender::new(tx);
        sender.connect("AA", Duration::from_secs(1)).unwrap();
        sender.read("AA", Uuid::nil()).unwrap();

        assert!(matches!(rx.try_recv(), Ok(Command::Connect { .. })));
        assert!(matches!(rx.try_recv(), Ok(Command::Read { .. })));
    }

    #[test]
    fn closed_queue_reports_session_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sender = CommandSender::new(tx);
        assert!(matches!(sender.shutdown(), Err(SessionError::SessionClosed)));
    }
}
