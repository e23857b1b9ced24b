//! Fire-and-forget event publication.
//!
//! Request handlers hand events to an actor over a bounded channel and never wait on the
//! sink. A full channel drops the event with a warning; each sink call is time-boxed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::sink::EventSink;
use crate::models::AttributionEvent;

enum PublisherMessage {
    Publish(AttributionEvent),
    /// Drain whatever is queued, then acknowledge
    Shutdown(oneshot::Sender<()>),
}

struct PublisherActor {
    receiver: mpsc::Receiver<PublisherMessage>,
    sink: Arc<dyn EventSink>,
    publish_timeout: Duration,
}

impl PublisherActor {
    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            match message {
                PublisherMessage::Publish(event) => self.deliver(event).await,
                PublisherMessage::Shutdown(ack) => {
                    info!("Event publisher received shutdown signal, draining...");
                    self.receiver.close();
                    while let Some(PublisherMessage::Publish(event)) = self.receiver.recv().await {
                        self.deliver(event).await;
                    }
                    let _ = ack.send(());
                    return;
                }
            }
        }
        debug!("Event publisher channel closed");
    }

    async fn deliver(&self, event: AttributionEvent) {
        let kind = event.kind();
        match tokio::time::timeout(self.publish_timeout, self.sink.publish(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(kind, error = %err, "failed to publish event"),
            Err(_) => warn!(
                kind,
                timeout_ms = self.publish_timeout.as_millis() as u64,
                "event publication timed out"
            ),
        }
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    sender: mpsc::Sender<PublisherMessage>,
}

impl EventPublisher {
    /// Spawn the publishing actor on the current runtime.
    pub fn spawn(sink: Arc<dyn EventSink>, buffer_size: usize, publish_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let actor = PublisherActor {
            receiver,
            sink,
            publish_timeout,
        };
        tokio::spawn(actor.run());
        Self { sender }
    }

    /// Queue an event without waiting.
    pub fn publish(&self, event: AttributionEvent) {
        match self.sender.try_send(PublisherMessage::Publish(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Event publisher stopped, dropping event");
            }
        }
    }

    /// Deliver everything queued so far and stop the actor.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(PublisherMessage::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}
