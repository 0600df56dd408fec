//! Notification handling for the bluest backend
//! Each subscription runs as its own task that forwards values as adapter events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use bluest::{Characteristic, Device, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::AdapterEvent;

struct Subscription {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct NotificationHandler {
    events: mpsc::UnboundedSender<AdapterEvent>,
    subscriptions: Arc<Mutex<HashMap<(String, Uuid), Subscription>>>,
}

impl NotificationHandler {
    pub fn new(events: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self {
            events,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribes to `characteristic` and resolves once the stack accepted it
    pub async fn start(
        &self,
        address: &str,
        device: Device,
        characteristic: Characteristic,
    ) -> Result<()> {
        let uuid = characteristic.uuid();
        info!("Subscribing to notifications of {} on {}...", uuid, address);

        let cancel_token = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(Self::process_notifications(
            address.to_string(),
            device,
            characteristic,
            self.events.clone(),
            cancel_token.clone(),
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {
                let previous = self
                    .subscriptions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        (address.to_string(), uuid),
                        Subscription { cancel_token, task },
                    );
                if let Some(previous) = previous {
                    previous.cancel_token.cancel();
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow!("Notification task for {} ended before subscribing", uuid)),
        }
    }

    /// Ends the subscription and waits for its task to release the stream
    pub async fn stop(&self, address: &str, characteristic: Uuid) -> Result<()> {
        let subscription = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(address.to_string(), characteristic));
        match subscription {
            Some(subscription) => {
                subscription.cancel_token.cancel();
                subscription.task.await?;
                info!("Unsubscribed from {} on {}", characteristic, address);
            }
            None => debug!("No notification stream for {} on {}", characteristic, address),
        }
        Ok(())
    }

    /// Cancels every stream that belongs to `address`
    pub fn stop_all(&self, address: &str) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|(owner, _), subscription| {
            if owner == address {
                subscription.cancel_token.cancel();
                false
            } else {
                true
            }
        });
    }

    async fn process_notifications(
        address: String,
        device: Device,
        characteristic: Characteristic,
        events: mpsc::UnboundedSender<AdapterEvent>,
        cancel_token: CancellationToken,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let uuid = characteristic.uuid();
        let mut notification_stream = match characteristic.notify().await {
            Ok(stream) => {
                if ready.send(Ok(())).is_err() {
                    return;
                }
                stream
            }
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                let _ = ready.send(Err(e.into()));
                return;
            }
        };

        info!("Listening for notifications of {} on {}...", uuid, address);
        loop {
            tokio::select! {
                result = notification_stream.next() => {
                    match result {
                        Some(Ok(value)) => {
                            debug!("Received {} bytes from {}", value.len(), uuid);
                            let event = AdapterEvent::Notification {
                                address: address.clone(),
                                characteristic: uuid,
                                value,
                            };
                            if events.send(event).is_err() {
                                warn!("Adapter event receiver dropped, ending stream of {}", uuid);
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
                _ = cancel_token.cancelled() => {
                    info!("Notification stream of {} cancelled", uuid);
                    return;
                }
            }
        }

        info!("Notification stream ended");
        if !device.is_connected().await {
            warn!("Device {} dropped while streaming {}", address, uuid);
            let _ = events.send(AdapterEvent::Disconnected { address });
        }
    }
}
