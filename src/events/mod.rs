pub mod background;
pub mod publisher;
pub mod sink;

pub use background::spawn_detached;
pub use publisher::EventPublisher;
pub use sink::{EventSink, HttpSink, TracingSink};

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EventSinkKind, EventsConfig};

/// Build the configured sink.
pub fn sink_from_config(config: &EventsConfig) -> Result<Arc<dyn EventSink>> {
    Ok(match config.sink {
        EventSinkKind::Log => Arc::new(TracingSink),
        EventSinkKind::Http => {
            let url = config
                .sink_url
                .as_deref()
                .context("EVENT_SINK_URL must be set when EVENT_SINK=http")?;
            Arc::new(HttpSink::new(
                url,
                Duration::from_millis(config.publish_timeout_ms),
            )?)
        }
    })
}
