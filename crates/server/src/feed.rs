// Live feed fan-out.
//
// A broadcast channel carries every admitted event to the attached SSE
// subscribers. Delivery is best-effort: a subscriber that falls more
// than the channel capacity behind is disconnected rather than allowed
// to stall the rest.

use serde::Serialize;
use tokio::sync::broadcast;

/// Per-subscriber buffer. A subscriber this far behind gets dropped.
pub const FEED_CAPACITY: usize = 64;

/// One frame on the live feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedEvent {
    pub source_ip: String,
    pub target_username: Option<String>,
    pub event_timestamp: String,
    pub host_id: String,
    /// Post-insert lifetime failure count for this IP.
    pub attempt_number: i64,
}

pub struct FeedHub {
    tx: broadcast::Sender<FeedEvent>,
}

impl FeedHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget publish. No subscribers is not an error.
    pub fn publish(&self, event: FeedEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new()
    }
}
