//! Session grouping
//!
//! Partitions a time-ordered sequence of raw events into work sessions by
//! inactivity gap. Pure: no I/O, no clock, recomputed per batch and never
//! persisted.

use chrono::Duration;

use crate::store::RawEvent;

/// A contiguous, non-empty run of events with no internal gap exceeding
/// the configured threshold.
#[derive(Debug, Clone)]
pub struct Session {
    events: Vec<RawEvent>,
}

impl Session {
    fn new(first: RawEvent) -> Self {
        Self {
            events: vec![first],
        }
    }

    pub fn events(&self) -> &[RawEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<RawEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        // Sessions are non-empty by construction
        false
    }

    pub fn start(&self) -> chrono::DateTime<chrono::Utc> {
        self.events[0].event_time
    }

    pub fn end(&self) -> chrono::DateTime<chrono::Utc> {
        self.events[self.events.len() - 1].event_time
    }

    /// Character size of the whole session, as counted against the
    /// batch context budget.
    pub fn estimated_chars(&self) -> usize {
        self.events.iter().map(|e| e.estimated_chars()).sum()
    }

    pub fn event_ids(&self) -> Vec<i64> {
        self.events.iter().map(|e| e.id).collect()
    }
}

/// Partition time-ordered events into sessions.
///
/// A new session starts at the first event and at every event whose gap
/// from the previous event exceeds `gap`. Concatenating the output
/// reproduces the input exactly; the number of sessions equals the number
/// of over-threshold gaps plus one.
pub fn group_into_sessions(events: Vec<RawEvent>, gap: Duration) -> Vec<Session> {
    let mut sessions: Vec<Session> = Vec::new();

    for event in events {
        match sessions.last_mut() {
            Some(current) if event.event_time - current.end() <= gap => {
                current.events.push(event);
            }
            _ => sessions.push(Session::new(event)),
        }
    }

    sessions
}
