//! Bridge availability reporting.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rumqttc::QoS;

use crate::Result;
use crate::publisher::BusPublisher;

/// Payload of the retained availability topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Online,
    Offline,
}

impl Availability {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    fn from_flag(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes the retained availability signal at QoS 1.
///
/// The last announced value is shared with the bus network loop, which
/// re-announces it after every broker reconnect.
#[derive(Clone)]
pub struct AvailabilityPublisher {
    publisher: Arc<dyn BusPublisher>,
    topic: String,
    online: Arc<AtomicBool>,
}

impl AvailabilityPublisher {
    /// Create a new availability publisher. The initial state is offline.
    pub fn new(publisher: Arc<dyn BusPublisher>, topic: impl Into<String>) -> Self {
        Self::with_flag(publisher, topic, Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn with_flag(
        publisher: Arc<dyn BusPublisher>,
        topic: impl Into<String>,
        online: Arc<AtomicBool>,
    ) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            online,
        }
    }

    /// The availability topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Last announced state.
    pub fn current(&self) -> Availability {
        Availability::from_flag(self.online.load(Ordering::Acquire))
    }

    /// Publish "online".
    pub async fn publish_online(&self) -> Result<()> {
        self.publish(Availability::Online).await
    }

    /// Publish "offline".
    pub async fn publish_offline(&self) -> Result<()> {
        self.publish(Availability::Offline).await
    }

    /// Publish a state and remember it for reconnect re-announcements.
    pub async fn publish(&self, state: Availability) -> Result<()> {
        self.online
            .store(state == Availability::Online, Ordering::Release);
        tracing::info!(availability = %state, "Publishing availability");
        self.publisher
            .publish(
                &self.topic,
                state.as_str().as_bytes().to_vec(),
                QoS::AtLeastOnce,
                true,
            )
            .await
    }
}
