use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};

use crate::chains::EventSource;
use crate::types::{RawEvent, SourceConfig, SourceEventId};

const STREAM_BUFFER: usize = 256;

/// Reconnecting subscription to the configured source-chain event kinds
pub struct EventSubscriber {
    source: Arc<dyn EventSource>,
    event_names: Vec<String>,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

impl EventSubscriber {
    pub fn new(source: Arc<dyn EventSource>, config: &SourceConfig) -> Self {
        Self {
            source,
            event_names: config.event_names.clone(),
            reconnect_initial: Duration::from_millis(config.reconnect_initial_ms.max(1)),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms.max(1)),
        }
    }

    fn reconnect_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.reconnect_initial)
            .with_max_interval(self.reconnect_max.max(self.reconnect_initial))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Start delivering events strictly after `resume_after`.
    ///
    /// The returned stream never ends on its own: connection failures are retried
    /// with exponential backoff, resuming after the last id delivered. Events around
    /// a reconnect may be delivered twice. Dropping the stream stops the pump.
    pub fn subscribe(&self, resume_after: Option<SourceEventId>) -> EventStream {
        let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
        let source = Arc::clone(&self.source);
        let names = self.event_names.clone();
        let mut backoff = self.reconnect_backoff();
        let reconnect_max = self.reconnect_max;

        let task = tokio::spawn(async move {
            let mut cursor = resume_after;

            loop {
                match source.connect(&names, cursor).await {
                    Ok(mut connection) => {
                        info!(
                            "Subscribed to {:?} after {}",
                            names,
                            cursor.map(|c| c.to_string()).unwrap_or_else(|| "genesis".to_string())
                        );

                        loop {
                            match connection.next_event().await {
                                Ok(Some(event)) => {
                                    backoff.reset();
                                    cursor = cursor.max(Some(event.id));

                                    if !names.iter().any(|name| *name == event.name) {
                                        debug!("Ignoring event {} of kind {}", event.id, event.name);
                                        continue;
                                    }
                                    if sender.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => {
                                    warn!("Event source closed the subscription");
                                    break;
                                }
                                Err(e) => {
                                    warn!("Event subscription failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("Failed to connect to event source: {}", e),
                }

                let delay = backoff.next_backoff().unwrap_or(reconnect_max);
                debug!("Reconnecting to event source in {:?}", delay);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = sender.closed() => return,
                }
            }
        });

        EventStream {
            receiver,
            task: Some(task),
        }
    }
}

/// Lazy, non-restartable sequence of source events
pub struct EventStream {
    receiver: mpsc::Receiver<RawEvent>,
    task: Option<JoinHandle<()>>,
}

impl EventStream {
    /// A finite stream over fixed events. Ends after the last one.
    pub fn from_events(events: Vec<RawEvent>) -> Self {
        let (sender, receiver) = mpsc::channel(events.len().max(1));
        for event in events {
            // capacity covers every event
            let _ = sender.try_send(event);
        }
        Self {
            receiver,
            task: None,
        }
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<RawEvent> {
        self.receiver.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
