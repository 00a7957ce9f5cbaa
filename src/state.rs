//! Per-instance mutable runtime state: tokens, history and the derived views.
//!
//! Everything here is plain data — serializable as-is into a persistence
//! [`Document`](crate::persistence::Document) and restored byte-for-byte on
//! load.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timer::TimerRecord;

/// User key/value data. Dot-separated keys descend into nested objects for
/// `findByProperty` (see [`crate::manager::ProcessManager::find_by_property`]).
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// `setProperty` (spec §4.1): descends dot-separated segments, creating
/// nested objects as needed and overwriting anything in the way that isn't
/// already an object.
pub fn set_dot_path(properties: &mut Properties, key: &str, value: serde_json::Value) {
    let segments: Vec<&str> = key.split('.').collect();
    let Some((last, init)) = segments.split_last() else {
        return;
    };
    let mut current = properties;
    for segment in init {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = serde_json::Value::Object(serde_json::Map::new());
        }
        current = entry.as_object_mut().expect("just ensured object");
    }
    current.insert(last.to_string(), value);
}

/// `getProperty`/`findByProperty` dot-path descent (spec §4.1/§4.5). Strict:
/// any missing segment or non-object intermediate yields `None`.
pub fn get_dot_path(properties: &Properties, key: &str) -> Option<serde_json::Value> {
    let mut segments = key.split('.');
    let mut current = properties.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

/// A marker indicating an instance's current position.
///
/// `called_process_id` is set only on call-activity tokens and names the
/// child process instance spawned for that call. `substate` is populated
/// only when a main instance is serialized for persistence: it carries the
/// full snapshot of the called child so a crash between the call activity
/// starting and returning can be recovered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub position: String,
    pub owning_process_id: String,
    pub called_process_id: Option<String>,
    pub substate: Option<Box<ChildSnapshot>>,
}

impl Token {
    pub fn new(position: impl Into<String>, owning_process_id: impl Into<String>) -> Self {
        Self {
            position: position.into(),
            owning_process_id: owning_process_id.into(),
            called_process_id: None,
            substate: None,
        }
    }

    pub fn call_activity(
        position: impl Into<String>,
        owning_process_id: impl Into<String>,
        called_process_id: impl Into<String>,
    ) -> Self {
        Self {
            position: position.into(),
            owning_process_id: owning_process_id.into(),
            called_process_id: Some(called_process_id.into()),
            substate: None,
        }
    }
}

/// The recursive snapshot of a called (child) process, nested under its
/// call-activity token at persist time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSnapshot {
    pub properties: Properties,
    pub state: ProcessState,
    pub history: ProcessHistory,
    pub pending_timeouts: HashMap<String, TimerRecord>,
    pub views: Views,
}

/// The token set. Set semantics on `(position, owningProcessId)` is
/// deliberately not enforced: a parallel-gateway position may hold several
/// tokens simultaneously, one per arrival.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub tokens: Vec<Token>,
}

impl ProcessState {
    pub fn add(&mut self, token: Token) {
        self.tokens.push(token);
    }

    /// Removes the first token found at `position`, if any.
    pub fn remove_one_at(&mut self, position: &str) -> Option<Token> {
        let index = self.tokens.iter().position(|t| t.position == position)?;
        Some(self.tokens.remove(index))
    }

    pub fn count_at(&self, position: &str) -> usize {
        self.tokens.iter().filter(|t| t.position == position).count()
    }

    pub fn has_token_at(&self, position: &str) -> bool {
        self.tokens.iter().any(|t| t.position == position)
    }

    pub fn remove_all_at(&mut self, position: &str) -> Vec<Token> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.tokens.drain(..).partition(|t| t.position == position);
        self.tokens = kept;
        removed
    }
}

/// One append-only entry in [`ProcessHistory`]. `end` is the only field ever
/// mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub begin: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub subhistory: Option<Box<ProcessHistory>>,
}

/// Append-only log of every flow object an instance has visited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessHistory {
    pub entries: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessHistory {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            entries: Vec::new(),
            created_at,
            finished_at: None,
        }
    }

    /// Appends a new open entry and returns its index so callers can close it later.
    pub fn begin(&mut self, name: impl Into<String>, entry_type: impl Into<String>, at: DateTime<Utc>) -> usize {
        self.entries.push(HistoryEntry {
            name: name.into(),
            entry_type: entry_type.into(),
            begin: at,
            end: None,
            subhistory: None,
        });
        self.entries.len() - 1
    }

    pub fn end(&mut self, index: usize, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.end = Some(at);
        }
    }

    pub fn attach_subhistory(&mut self, index: usize, subhistory: ProcessHistory) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.subhistory = Some(Box::new(subhistory));
        }
    }

    /// Whether `name` has an entry already — used by `triggerEvent`'s
    /// `AlreadyStarted` check for start events.
    pub fn has_started(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
    }

    /// Count of entries with `end == None`, excluding gateways (which never
    /// get a history entry of their own) — used by the token-count invariant.
    pub fn open_non_gateway_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.end.is_none() && !e.entry_type.ends_with("Gateway"))
            .count()
    }
}

/// A named flow object reference captured in [`Views`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventView {
    pub name: String,
}

/// Derived per-instance summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Views {
    pub start_event: Option<EventView>,
    pub end_event: Option<EventView>,
    pub duration: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_one_at_removes_first_match_only() {
        let mut state = ProcessState::default();
        state.add(Token::new("join", "p1"));
        state.add(Token::new("join", "p1"));
        assert_eq!(state.count_at("join"), 2);
        state.remove_one_at("join");
        assert_eq!(state.count_at("join"), 1);
    }

    #[test]
    fn history_tracks_open_entries() {
        let mut history = ProcessHistory::new(Utc::now());
        let idx = history.begin("start", "event", Utc::now());
        assert_eq!(history.open_non_gateway_count(), 1);
        history.end(idx, Utc::now());
        assert_eq!(history.open_non_gateway_count(), 0);
    }
}
