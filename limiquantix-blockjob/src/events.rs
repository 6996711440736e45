//! Domain lifecycle events emitted for block jobs.
//!
//! Every processed job transition produces up to two events:
//! - the legacy event, keyed by the image path of the disk (only emitted
//!   for local images)
//! - the generalized event, keyed by the disk target
//!
//! Delivery to clients happens elsewhere; [`EventQueue`] is an in-memory
//! ring buffer sink that keeps the most recent events.

use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::BlockJobType;

/// Default number of events kept by [`EventQueue`].
pub const DEFAULT_CAPACITY: usize = 1000;

/// Job status reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockJobStatus {
    Completed,
    Failed,
    Cancelled,
    Ready,
}

impl std::fmt::Display for BlockJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockJobStatus::Completed => write!(f, "completed"),
            BlockJobStatus::Failed => write!(f, "failed"),
            BlockJobStatus::Cancelled => write!(f, "cancelled"),
            BlockJobStatus::Ready => write!(f, "ready"),
        }
    }
}

/// A block job event for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Legacy event identifying the disk by image path
    BlockJob {
        domain: String,
        path: String,
        job_type: BlockJobType,
        status: BlockJobStatus,
    },
    /// Event identifying the disk by target name
    BlockJob2 {
        domain: String,
        disk: String,
        job_type: BlockJobType,
        status: BlockJobStatus,
    },
}

impl DomainEvent {
    pub fn domain(&self) -> &str {
        match self {
            DomainEvent::BlockJob { domain, .. } | DomainEvent::BlockJob2 { domain, .. } => domain,
        }
    }

    pub fn status(&self) -> BlockJobStatus {
        match self {
            DomainEvent::BlockJob { status, .. } | DomainEvent::BlockJob2 { status, .. } => *status,
        }
    }
}

/// Receives domain events.
pub trait EventSink: Send + Sync {
    fn queue_event(&self, event: DomainEvent);
}

/// Event with the time it was queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub timestamp: DateTime<Utc>,
    pub event: DomainEvent,
}

/// Thread-safe ring buffer of recent events.
pub struct EventQueue {
    events: RwLock<VecDeque<QueuedEvent>>,
    capacity: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// All events, oldest first.
    pub fn get_all(&self) -> Vec<DomainEvent> {
        self.events
            .read()
            .map(|events| events.iter().map(|e| e.event.clone()).collect())
            .unwrap_or_default()
    }

    /// Events of one domain, oldest first.
    pub fn for_domain(&self, domain: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event.domain() == domain)
                    .map(|e| e.event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove and return everything queued so far.
    pub fn drain(&self) -> Vec<QueuedEvent> {
        self.events
            .write()
            .map(|mut events| events.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventQueue {
    fn queue_event(&self, event: DomainEvent) {
        if let Ok(mut events) = self.events.write() {
            if events.len() >= self.capacity {
                if let Some(dropped) = events.pop_front() {
                    debug!(domain = %dropped.event.domain(), "Event queue full, dropping oldest event");
                }
            }

            info!(domain = %event.domain(), status = %event.status(), "Block job event");
            events.push_back(QueuedEvent {
                timestamp: Utc::now(),
                event,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(domain: &str, status: BlockJobStatus) -> DomainEvent {
        DomainEvent::BlockJob2 {
            domain: domain.to_string(),
            disk: "vda".to_string(),
            job_type: BlockJobType::Copy,
            status,
        }
    }

    #[test]
    fn test_queue_capacity() {
        let queue = EventQueue::with_capacity(2);
        queue.queue_event(event("vm1", BlockJobStatus::Ready));
        queue.queue_event(event("vm1", BlockJobStatus::Completed));
        queue.queue_event(event("vm2", BlockJobStatus::Failed));

        let all = queue.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status(), BlockJobStatus::Completed);
        assert_eq!(queue.for_domain("vm2").len(), 1);
    }

    #[test]
    fn test_drain_empties_queue() {
        let queue = EventQueue::new();
        queue.queue_event(event("vm1", BlockJobStatus::Ready));
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
