//! Structured engine events.
//!
//! Every suspend, resume, host-root registration and instrument call leaves
//! one [`EngineEvent`] in the owning log.  Events are plain data so callers
//! can print them as JSON lines or assert on them in tests.

use serde::{Deserialize, Serialize};

pub const OUTCOME_ALLOW: &str = "allow";
pub const OUTCOME_DENY: &str = "deny";
pub const NO_ERROR_CODE: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub seq: u64,
    pub trace_id: String,
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub error_code: String,
    pub detail: String,
}

/// Append-only event buffer with a monotonically increasing sequence.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    trace_id: String,
    events: Vec<EngineEvent>,
    next_event_seq: u64,
}

impl EventLog {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            events: Vec::new(),
            next_event_seq: 0,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn push_event(
        &mut self,
        component: &str,
        event: impl Into<String>,
        outcome: impl Into<String>,
        error_code: impl Into<String>,
        detail: impl Into<String>,
    ) {
        let event = EngineEvent {
            seq: self.next_event_seq,
            trace_id: self.trace_id.clone(),
            component: component.to_string(),
            event: event.into(),
            outcome: outcome.into(),
            error_code: error_code.into(),
            detail: detail.into(),
        };
        self.next_event_seq = self.next_event_seq.saturating_add(1);
        self.events.push(event);
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    /// Take all buffered events; sequence numbers keep counting.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_survives_drain() {
        let mut log = EventLog::new("trace-events");
        log.push_event("serializer", "serialize", OUTCOME_ALLOW, NO_ERROR_CODE, "root=ref0");
        log.push_event("serializer", "serialize", OUTCOME_DENY, "FE-SER-1001", "f");
        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].seq, 1);
        assert!(log.events().is_empty());

        log.push_event("deserializer", "deserialize", OUTCOME_ALLOW, NO_ERROR_CODE, "");
        assert_eq!(log.events()[0].seq, 2);
        assert_eq!(log.events()[0].trace_id, "trace-events");
    }
}
