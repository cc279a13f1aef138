//! Event types for the monitor event system
//!
//! Provides the shared event definitions and the EventBus used by the
//! detection core to notify external subscribers (API layer, websocket
//! bridge, log sinks). Delivery is best-effort: publishing never blocks,
//! and a slow subscriber loses the oldest events rather than stalling the
//! detection pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Operational status of a monitored station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationStatus {
    /// Stream reachable and being monitored
    Active,
    /// Marked down after repeated probe failures; retried at a slower rhythm
    Inactive,
    /// Administratively disabled; never probed
    Offline,
}

impl StationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationStatus::Active => "active",
            StationStatus::Inactive => "inactive",
            StationStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(StationStatus::Active),
            "inactive" => Some(StationStatus::Inactive),
            "offline" => Some(StationStatus::Offline),
            _ => None,
        }
    }
}

/// Monitor event types
///
/// Events are broadcast via the EventBus; payloads are serializable so the
/// external API layer can forward them verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A play ended and its Detection row was committed
    DetectionFinalized {
        station_id: i64,
        track_id: i64,
        detected_at: DateTime<Utc>,
        end_time: DateTime<Utc>,
        play_duration_s: f64,
        confidence: f64,
        method: String,
    },

    /// A station's operational status changed
    StationHealthChanged {
        station_id: i64,
        status: StationStatus,
        latency_ms: Option<u64>,
        reason: Option<String>,
    },

    /// A component raised an error worth surfacing to operators
    ErrorRaised {
        scope: String,
        kind: String,
        message: String,
    },
}

/// Central event distribution bus
///
/// Wraps `tokio::sync::broadcast`: non-blocking publish, multiple
/// concurrent subscribers, oldest events dropped on overflow. Subscribers
/// that fall behind observe `RecvError::Lagged(n)`; `EventSubscriber`
/// folds those into a shared dropped-event counter.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers reached; 0 when nobody listens.
    /// Never blocks and never fails the caller.
    pub fn publish(&self, event: MonitorEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    /// Total events lost to slow subscribers since startup
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving half of the EventBus
pub struct EventSubscriber {
    rx: broadcast::Receiver<MonitorEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSubscriber {
    /// Receive the next event, transparently skipping over lag gaps.
    ///
    /// Returns `None` once the bus is closed (all senders dropped).
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(skipped = n, "event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
