//! Liveness monitoring
//! Periodically asks the adapter whether connected sessions are still up and
//! closes the ones that dropped without telling us.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::{Command, CommandSender, LivenessReport, LivenessTarget};
use crate::core::bluetooth::events::{EventSender, SessionEvent};
use crate::core::bluetooth::registry::SessionRegistry;

pub struct LivenessMonitor {
    registry: Arc<SessionRegistry>,
    commands: CommandSender,
    events: EventSender,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        commands: CommandSender,
        events: EventSender,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            commands,
            events,
            interval,
        }
    }

    /// Each cycle queues a check for every connected session that has no
    /// check outstanding, then sleeps for the interval before re-arming.
    pub async fn run(self, cancel_token: CancellationToken) {
        info!(
            "Liveness monitor started with an interval of {} ms",
            self.interval.as_millis()
        );
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let mut outstanding: HashSet<String> = HashSet::new();

        'cycles: loop {
            for (address, _) in self.registry.connected() {
                if !outstanding.insert(address.clone()) {
                    debug!("Liveness check for {} still pending", address);
                    continue;
                }
                let command = Command::CheckLiveness {
                    target: LivenessTarget::Address(address),
                    reply: Some(reply_tx.clone()),
                };
                if let Err(e) = self.commands.send(command) {
                    info!("Liveness monitor stopping: {}", e);
                    break 'cycles;
                }
            }

            let next_cycle = sleep(self.interval);
            tokio::pin!(next_cycle);
            loop {
                tokio::select! {
                    _ = &mut next_cycle => break,
                    Some(report) = reply_rx.recv() => {
                        outstanding.remove(&report.address);
                        self.reconcile(&report);
                    }
                    _ = cancel_token.cancelled() => break 'cycles,
                }
            }
        }
        info!("Liveness monitor stopped.");
    }

    /// Treats a negative probe of a still-open session as a spontaneous
    /// disconnect and queues the release of its client. Returns `true` when
    /// the session was closed.
    pub fn reconcile(&self, report: &LivenessReport) -> bool {
        if report.connected {
            return false;
        }
        let Some(client) = report.client else {
            return false;
        };
        if !self.registry.mark_disconnected_if(&report.address, client) {
            return false;
        }
        warn!("Device {} disconnected unexpectedly", report.address);
        self.events.emit(SessionEvent::ConnectionChanged {
            connected: false,
            address: report.address.clone(),
        });
        if let Err(e) = self.commands.release(&report.address, client) {
            debug!("Cannot release {} of {}: {}", client, report.address, e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::types::{ClientHandle, ServiceTree};

    fn monitor() -> (
        LivenessMonitor,
        Arc<SessionRegistry>,
        mpsc::UnboundedReceiver<Command>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let registry = Arc::new(SessionRegistry::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = EventSender::channel();
        let monitor = LivenessMonitor::new(
            registry.clone(),
            CommandSender::new(command_tx),
            events,
            Duration::from_millis(2000),
        );
        (monitor, registry, command_rx, event_rx)
    }

    fn connect(registry: &SessionRegistry, address: &str, client: u64) {
        registry.begin(address).unwrap();
        registry
            .complete(address, Some((ClientHandle::new(client), ServiceTree::default())))
            .unwrap();
    }

    #[test]
    fn negative_report_closes_session_once() {
        let (monitor, registry, mut commands, mut events) = monitor();
        connect(&registry, "AA", 3);
        let report = LivenessReport {
            address: "AA".to_string(),
            client: Some(ClientHandle::new(3)),
            connected: false,
        };

        assert!(monitor.reconcile(&report));
        assert!(!monitor.reconcile(&report));
        assert!(!registry.is_connected("AA"));
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::ConnectionChanged {
                connected: false,
                address: "AA".to_string(),
            }
        );
        assert!(events.try_recv().is_err());
        assert!(matches!(
            commands.try_recv(),
            Ok(Command::Release { client, .. }) if client == ClientHandle::new(3)
        ));
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn positive_or_stale_reports_change_nothing() {
        let (monitor, registry, mut commands, mut events) = monitor();
        connect(&registry, "AA", 5);

        assert!(!monitor.reconcile(&LivenessReport {
            address: "AA".to_string(),
            client: Some(ClientHandle::new(5)),
            connected: true,
        }));
        assert!(!monitor.reconcile(&LivenessReport {
            address: "AA".to_string(),
            client: Some(ClientHandle::new(4)),
            connected: false,
        }));
        assert!(registry.is_connected("AA"));
        assert!(events.try_recv().is_err());
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cycles_do_not_stack_checks_for_slow_adapters() {
        let (monitor, registry, mut commands, _events) = monitor();
        connect(&registry, "AA", 1);
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(monitor.run(cancel_token.clone()));

        sleep(Duration::from_millis(7_000)).await;
        let mut queued = 0;
        while let Ok(command) = commands.try_recv() {
            assert!(matches!(command, Command::CheckLiveness { .. }));
            queued += 1;
        }
        assert_eq!(queued, 1);

        cancel_token.cancel();
        task.await.unwrap();
    }
}
