use std::collections::HashMap;

use crate::telemetry::format::Value;

const LOG_CAPACITY: usize = 256;

pub type NameId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Value,
    Time,
    /// Span length in clock ticks.
    Span(u64),
}

/// A deferred record. `time` is in clock ticks; for spans it is the end time.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub time: u64,
    pub kind: EntryKind,
    pub name: NameId,
    pub value: Option<Value>,
}

/// Records appended during a frame and encoded together on flush.
///
/// Names are interned so repeated entries only carry an id until they are
/// encoded.
pub struct EventLog {
    entries: Vec<LogEntry>,
    names: Vec<String>,
    name_ids: HashMap<String, NameId>,
    min_span_ticks: u64,
    dropped_spans: u64,
}

impl EventLog {
    pub fn new(min_span_ticks: u64) -> Self {
        Self {
            entries: Vec::with_capacity(LOG_CAPACITY),
            names: Vec::new(),
            name_ids: HashMap::new(),
            min_span_ticks,
            dropped_spans: 0,
        }
    }

    pub fn intern(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.name_ids.get(name) {
            return id;
        }
        let id = self.names.len() as NameId;
        self.names.push(name.to_string());
        self.name_ids.insert(name.to_string(), id);
        id
    }

    pub fn name(&self, id: NameId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Returns false, counting the drop, for spans shorter than the minimum.
    pub fn admit_span(&mut self, length_ticks: u64) -> bool {
        if length_ticks < self.min_span_ticks {
            self.dropped_spans += 1;
            return false;
        }
        true
    }

    pub fn dropped_spans(&self) -> u64 {
        self.dropped_spans
    }

    pub fn append_value(&mut self, time: u64, name: &str, value: Value) {
        let name = self.intern(name);
        self.entries.push(LogEntry {
            time,
            kind: EntryKind::Value,
            name,
            value: Some(value),
        });
    }

    pub fn append_time(&mut self, time: u64, name: &str) {
        let name = self.intern(name);
        self.entries.push(LogEntry {
            time,
            kind: EntryKind::Time,
            name,
            value: None,
        });
    }

    /// Returns false if the span was too short to keep.
    pub fn append_span(&mut self, start: u64, end: u64, name: &str, value: Option<Value>) -> bool {
        let length = end.saturating_sub(start);
        if !self.admit_span(length) {
            return false;
        }
        let name = self.intern(name);
        self.entries.push(LogEntry {
            time: end,
            kind: EntryKind::Span(length),
            name,
            value,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every pending entry in append order.
    pub fn take(&mut self) -> Vec<LogEntry> {
        std::mem::replace(&mut self.entries, Vec::with_capacity(LOG_CAPACITY))
    }

    /// Clear pending entries; interned names are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
