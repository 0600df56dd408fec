//! Notification routing
//! Delivers unsolicited adapter events to the presentation layer without
//! queueing them behind sequencer commands.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::AdapterEvent;
use crate::core::bluetooth::commands::CommandSender;
use crate::core::bluetooth::events::{EventSender, SessionEvent};
use crate::core::bluetooth::registry::SessionRegistry;

#[derive(Clone)]
pub struct NotificationRouter {
    registry: Arc<SessionRegistry>,
    commands: CommandSender,
    events: EventSender,
}

impl NotificationRouter {
    pub fn new(registry: Arc<SessionRegistry>, commands: CommandSender, events: EventSender) -> Self {
        Self {
            registry,
            commands,
            events,
        }
    }

    pub async fn run(
        self,
        mut adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
        cancel_token: CancellationToken,
    ) {
        info!("Notification router started.");
        loop {
            tokio::select! {
                event = adapter_events.recv() => {
                    match event {
                        Some(event) => self.route(event),
                        None => {
                            info!("Adapter event stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
        info!("Notification router stopped.");
    }

    pub fn route(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::Notification {
                address,
                characteristic,
                value,
            } => self.on_notification(&address, characteristic, value),
            AdapterEvent::Disconnected { address } => self.on_spontaneous_disconnect(&address),
        }
    }

    pub fn on_notification(&self, address: &str, characteristic: Uuid, value: Vec<u8>) {
        if !self.registry.is_subscribed(address, &characteristic) {
            debug!(
                "Notification for {} on {} without an active subscription",
                characteristic, address
            );
        }
        self.events.emit(SessionEvent::NotificationReceived {
            address: address.to_string(),
            characteristic,
            value,
        });
    }

    /// Closes the session and queues the release of its adapter client.
    pub fn on_spontaneous_disconnect(&self, address: &str) {
        let lost = self.registry.client(address);
        let closed = match lost {
            Some(client) => self.registry.mark_disconnected_if(address, client),
            None => self.registry.mark_disconnected(address),
        };
        if !closed {
            debug!("Disconnect report for {} which is already closed", address);
            return;
        }
        warn!("Device {} disconnected unexpectedly", address);
        self.events.emit(SessionEvent::ConnectionChanged {
            connected: false,
            address: address.to_string(),
        });
        if let Some(client) = lost {
            if let Err(e) = self.commands.release(address, client) {
                debug!("Cannot release {} of {}: {}", client, address, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::commands::Command;
    use crate::core::bluetooth::types::{ClientHandle, ServiceTree};

    fn router() -> (
        NotificationRouter,
        Arc<SessionRegistry>,
        mpsc::UnboundedReceiver<SessionEvent>,
        mpsc::UnboundedReceiver<Command>,
    ) {
        let registry = Arc::new(SessionRegistry::new());
        let (events, rx) = EventSender::channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let router = NotificationRouter::new(registry.clone(), CommandSender::new(command_tx), events);
        (router, registry, rx, command_rx)
    }

    #[test]
    fn notifications_are_forwarded_verbatim() {
        let (router, _registry, mut rx, _commands) = router();
        let characteristic = Uuid::from_u128(0x1234);
        router.route(AdapterEvent::Notification {
            address: "AA".to_string(),
            characteristic,
            value: vec![1, 2, 3],
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::NotificationReceived {
                address: "AA".to_string(),
                characteristic,
                value: vec![1, 2, 3],
            }
        );
    }

    #[test]
    fn spontaneous_disconnect_emits_once() {
        let (router, registry, mut rx, mut commands) = router();
        registry.begin("AA").unwrap();
        registry
            .complete("AA", Some((ClientHandle::new(1), ServiceTree::default())))
            .unwrap();

        router.on_spontaneous_disconnect("AA");
        router.on_spontaneous_disconnect("AA");

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::ConnectionChanged {
                connected: false,
                address: "AA".to_string(),
            }
        );
        assert!(rx.try_recv().is_err());
        assert!(!registry.is_connected("AA"));

        match commands.try_recv() {
            Ok(Command::Release { address, client }) => {
                assert_eq!(address, "AA");
                assert_eq!(client, ClientHandle::new(1));
            }
            other => panic!("expected a release, got {:?}", other),
        }
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (router, _registry, _rx, _commands) = router();
        let (_tx, adapter_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(router.run(adapter_rx, cancel_token.clone()));
        cancel_token.cancel();
        task.await.unwrap();
    }
}
