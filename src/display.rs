//! Event presentation
//! Prints session events for the operator, either as text lines or as JSON.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};

use crate::commands::{format_value, uuid_label};
use crate::config::EventFormat;
use crate::core::SessionEvent;
use crate::state::DeviceViews;

const OVERDUE_CHECK_PERIOD: Duration = Duration::from_millis(250);

pub struct EventPrinter {
    views: Arc<Mutex<DeviceViews>>,
    format: EventFormat,
    read_timeout: Duration,
}

impl EventPrinter {
    pub fn new(views: Arc<Mutex<DeviceViews>>, format: EventFormat, read_timeout: Duration) -> Self {
        Self {
            views,
            format,
            read_timeout,
        }
    }

    /// Prints events until every session task has dropped its sender
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let mut overdue_check = interval(OVERDUE_CHECK_PERIOD);
        overdue_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(line) = self.render(&event) {
                                println!("{}", line);
                            }
                        }
                        None => break,
                    }
                }
                _ = overdue_check.tick() => {
                    for line in self.overdue_reads() {
                        println!("{}", line);
                    }
                }
            }
        }
        debug!("Event printer stopped.");
    }

    fn overdue_reads(&self) -> Vec<String> {
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_overdue_reads(self.read_timeout)
            .into_iter()
            .map(|(address, characteristic)| {
                format!(
                    "[{}] no value for {} after {} ms",
                    address,
                    uuid_label(&characteristic),
                    self.read_timeout.as_millis()
                )
            })
            .collect()
    }

    /// The line to print for `event`, if any. Device events are dropped
    /// unless the operator has a view open for that device.
    pub fn render(&self, event: &SessionEvent) -> Option<String> {
        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            SessionEvent::CharacteristicRead {
                address,
                characteristic,
                ..
            }
            | SessionEvent::Error {
                address: Some(address),
                characteristic: Some(characteristic),
                ..
            } => {
                views.read_finished(address, *characteristic);
            }
            _ => {}
        }
        let scoped = !matches!(event, SessionEvent::AdvertisementObserved { .. });
        if let Some(address) = event.address().filter(|_| scoped) {
            if !views.is_open(address) {
                debug!("Ignoring event for {} without an open view", address);
                return None;
            }
        }
        drop(views);

        match self.format {
            EventFormat::Json => match serde_json::to_string(event) {
                Ok(json) => Some(json),
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    None
                }
            },
            EventFormat::Text => Self::render_text(event),
        }
    }

    fn render_text(event: &SessionEvent) -> Option<String> {
        let line = match event {
            SessionEvent::ScanStarted { duration_ms } => {
                format!("Scanning for {:.1} s...", *duration_ms as f64 / 1000.0)
            }
            SessionEvent::ScanCompleted { devices } => {
                format!("Scan complete, {} device(s). Use `devices` to list them.", devices.len())
            }
            SessionEvent::DevicesUpdated { devices } if !devices.is_empty() => {
                let newest = devices.last().map(|d| d.display_name()).unwrap_or_default();
                format!("Found {} ({} so far)", newest, devices.len())
            }
            SessionEvent::ConnectionChanged { connected, address } => {
                let state = if *connected { "connected" } else { "disconnected" };
                format!("[{}] {}", address, state)
            }
            SessionEvent::ServicesDiscovered { address, services } => {
                let characteristics: usize = services
                    .services()
                    .iter()
                    .map(|s| s.characteristics.len())
                    .sum();
                format!(
                    "[{}] {} service(s), {} characteristic(s). Use `services {}` to list them.",
                    address,
                    services.services().len(),
                    characteristics,
                    address
                )
            }
            SessionEvent::CharacteristicRead {
                address,
                characteristic,
                value,
            } => format!(
                "[{}] read {}: {}",
                address,
                uuid_label(characteristic),
                format_value(value)
            ),
            SessionEvent::CharacteristicWritten {
                address,
                characteristic,
                success,
            } => {
                let outcome = if *success { "ok" } else { "failed" };
                format!("[{}] write {}: {}", address, uuid_label(characteristic), outcome)
            }
            SessionEvent::NotificationReceived {
                address,
                characteristic,
                value,
            } => format!(
                "[{}] notify {}: {}",
                address,
                uuid_label(characteristic),
                format_value(value)
            ),
            SessionEvent::Error { message, .. } => format!("error: {}", message),
            _ => return None,
        };
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::UUID_BATTERY_LEVEL;

    fn printer(format: EventFormat) -> (EventPrinter, Arc<Mutex<DeviceViews>>) {
        let views = Arc::new(Mutex::new(DeviceViews::default()));
        (
            EventPrinter::new(views.clone(), format, Duration::from_secs(5)),
            views,
        )
    }

    fn notification() -> SessionEvent {
        SessionEvent::NotificationReceived {
            address: "AA".to_string(),
            characteristic: UUID_BATTERY_LEVEL,
            value: vec![0x57],
        }
    }

    #[test]
    fn device_events_need_an_open_view() {
        let (printer, views) = printer(EventFormat::Text);
        assert_eq!(printer.render(&notification()), None);

        views.lock().unwrap().open("AA");
        let line = printer.render(&notification()).unwrap();
        assert!(line.starts_with("[AA] notify Battery Level"));
        assert!(line.ends_with("57 \"W\""));
    }

    #[test]
    fn errors_are_always_shown() {
        let (printer, _views) = printer(EventFormat::Text);
        let event = SessionEvent::Error {
            message: "Device not connected: AA".to_string(),
            address: None,
            characteristic: None,
        };
        assert_eq!(
            printer.render(&event),
            Some("error: Device not connected: AA".to_string())
        );
    }

    #[test]
    fn json_events_are_tagged() {
        let (printer, views) = printer(EventFormat::Json);
        views.lock().unwrap().open("AA");
        let line = printer
            .render(&SessionEvent::ConnectionChanged {
                connected: true,
                address: "AA".to_string(),
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "connection-changed");
        assert_eq!(value["connected"], true);
    }

    #[test]
    fn a_read_value_settles_the_pending_read() {
        let (printer, views) = printer(EventFormat::Text);
        views.lock().unwrap().open("AA");
        views.lock().unwrap().read_started("AA", UUID_BATTERY_LEVEL);
        printer.render(&SessionEvent::CharacteristicRead {
            address: "AA".to_string(),
            characteristic: UUID_BATTERY_LEVEL,
            value: vec![1],
        });
        assert_eq!(
            views.lock().unwrap().read_finished("AA", UUID_BATTERY_LEVEL),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_failed_read_is_not_reported_as_overdue() {
        let (printer, views) = printer(EventFormat::Text);
        views.lock().unwrap().open("AA");
        views.lock().unwrap().read_started("AA", UUID_BATTERY_LEVEL);
        let line = printer.render(&SessionEvent::Error {
            message: "BLE Error: read rejected".to_string(),
            address: Some("AA".to_string()),
            characteristic: Some(UUID_BATTERY_LEVEL),
        });
        assert_eq!(line, Some("error: BLE Error: read rejected".to_string()));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(printer.overdue_reads().is_empty());
    }
}
