// ConvStream - core/filter.rs
//
// Composable filter for conversation events.
// All active filters are AND-combined.
// Core layer: pure logic, no I/O.

use crate::core::model::{ConversationEvent, EventType};
use crate::util::error::FilterError;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Complete filter state. All fields are AND-combined when applied.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Event types to include (empty = all).
    pub event_types: BTreeSet<EventType>,

    /// Match events whose `agent_id` or `worker_id` equals this value.
    pub agent: Option<String>,

    pub worker_id: Option<String>,

    pub task_id: Option<String>,

    /// Start of time range (inclusive). None = no lower bound.
    pub time_start: Option<DateTime<Utc>>,

    /// End of time range (exclusive). None = no upper bound.
    pub time_end: Option<DateTime<Utc>>,

    /// Substring text search (case-insensitive) over message and ids. Empty = no filter.
    pub text_search: String,

    /// Compiled regex search over the message. None = no regex filter.
    pub regex_search: Option<Regex>,
}

impl EventFilter {
    /// Returns true if no filters are active.
    pub fn is_empty(&self) -> bool {
        self.event_types.is_empty()
            && self.agent.is_none()
            && self.worker_id.is_none()
            && self.task_id.is_none()
            && self.time_start.is_none()
            && self.time_end.is_none()
            && self.text_search.is_empty()
            && self.regex_search.is_none()
    }

    /// Set the regex search pattern, compiling it.
    /// Returns an error if the pattern is invalid.
    pub fn set_regex(&mut self, pattern: &str) -> Result<(), FilterError> {
        if pattern.is_empty() {
            self.regex_search = None;
            return Ok(());
        }
        let regex = Regex::new(pattern).map_err(|e| FilterError::InvalidRegex {
            pattern: pattern.to_string(),
            source: e,
        })?;
        self.regex_search = Some(regex);
        Ok(())
    }

    /// Quick filter for one event type.
    pub fn of_type(event_type: EventType) -> Self {
        let mut types = BTreeSet::new();
        types.insert(event_type);
        Self {
            event_types: types,
            ..Default::default()
        }
    }

    /// Check if a single event matches all active filters.
    pub fn matches(&self, event: &ConversationEvent) -> bool {
        matches_all(event, self, &self.text_search.to_lowercase())
    }

    /// Stable hash of the active criteria, used in analysis cache keys.
    /// Two filters with the same criteria always hash equal.
    pub fn fingerprint(&self) -> u64 {
        let mut h = DefaultHasher::new();
        for t in &self.event_types {
            t.as_str().hash(&mut h);
        }
        0xffu8.hash(&mut h);
        self.agent.hash(&mut h);
        self.worker_id.hash(&mut h);
        self.task_id.hash(&mut h);
        self.time_start.map(|t| t.timestamp_micros()).hash(&mut h);
        self.time_end.map(|t| t.timestamp_micros()).hash(&mut h);
        self.text_search.to_lowercase().hash(&mut h);
        self.regex_search.as_ref().map(Regex::as_str).hash(&mut h);
        h.finish()
    }
}

/// Apply the filter to a slice of events, returning indices of matching events.
pub fn apply_filter(events: &[ConversationEvent], filter: &EventFilter) -> Vec<usize> {
    if filter.is_empty() {
        return (0..events.len()).collect();
    }

    let text_lower = filter.text_search.to_lowercase();

    events
        .iter()
        .enumerate()
        .filter(|(_, event)| matches_all(event, filter, &text_lower))
        .map(|(idx, _)| idx)
        .collect()
}

fn matches_all(event: &ConversationEvent, filter: &EventFilter, text_lower: &str) -> bool {
    if !filter.event_types.is_empty() && !filter.event_types.contains(&event.event_type) {
        return false;
    }

    if let Some(ref agent) = filter.agent {
        let hit = event.agent_id.as_deref() == Some(agent.as_str())
            || event.worker_id.as_deref() == Some(agent.as_str());
        if !hit {
            return false;
        }
    }

    if let Some(ref worker) = filter.worker_id {
        if event.worker_id.as_deref() != Some(worker.as_str()) {
            return false;
        }
    }

    if let Some(ref task) = filter.task_id {
        if event.task_id.as_deref() != Some(task.as_str()) {
            return false;
        }
    }

    let ts = event.timestamp_utc();
    if let Some(start) = filter.time_start {
        if ts < start {
            return false;
        }
    }
    if let Some(end) = filter.time_end {
        if ts >= end {
            return false;
        }
    }

    if !text_lower.is_empty() {
        let in_message = event.message.to_lowercase().contains(text_lower);
        let in_ids = [&event.agent_id, &event.worker_id, &event.task_id]
            .iter()
            .filter_map(|v| v.as_deref())
            .any(|v| v.to_lowercase().contains(text_lower));
        if !in_message && !in_ids {
            return false;
        }
    }

    if let Some(ref regex) = filter.regex_search {
        if !regex.is_match(&event.message) {
            return false;
        }
    }

    true
}
