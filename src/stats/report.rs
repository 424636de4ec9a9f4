//! Raw transport statistics
//!
//! A flat, typed-by-string view of a statistics report: one entry per stats
//! object id, every numeric member kept as `f64` under its camelCase name.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{AppError, Result};

pub const INBOUND_RTP: &str = "inbound-rtp";
pub const OUTBOUND_RTP: &str = "outbound-rtp";
pub const REMOTE_INBOUND_RTP: &str = "remote-inbound-rtp";
pub const REMOTE_OUTBOUND_RTP: &str = "remote-outbound-rtp";

/// One stats object
#[derive(Debug, Clone, PartialEq)]
pub struct StatsEntry {
    pub id: String,
    pub stats_type: String,
    pub kind: Option<String>,
    /// Milliseconds
    pub timestamp: f64,
    pub values: HashMap<String, f64>,
}

impl StatsEntry {
    pub fn new(id: impl Into<String>, stats_type: impl Into<String>, timestamp: f64) -> Self {
        Self {
            id: id.into(),
            stats_type: stats_type.into(),
            kind: None,
            timestamp,
            values: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Numeric member, `timestamp` included
    pub fn value(&self, name: &str) -> Option<f64> {
        if name == "timestamp" {
            return Some(self.timestamp);
        }
        self.values.get(name).copied()
    }

    pub fn is_audio(&self) -> bool {
        self.kind.as_deref().map_or(true, |k| k == "audio")
    }
}

/// Statistics report keyed by stats object id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStatsReport {
    entries: HashMap<String, StatsEntry>,
}

/// `packets_received` -> `packetsReceived`
fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

impl RawStatsReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: StatsEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn with_entry(mut self, entry: StatsEntry) -> Self {
        self.insert(entry);
        self
    }

    pub fn get(&self, id: &str) -> Option<&StatsEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &StatsEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First audio entry of `stats_type`, lowest id first for determinism.
    pub fn audio_entry(&self, stats_type: &str) -> Option<&StatsEntry> {
        self.entries
            .values()
            .filter(|e| e.stats_type == stats_type && e.is_audio())
            .min_by(|a, b| a.id.cmp(&b.id))
    }

    /// Overwrite every entry's timestamp with the poll instant (ms).
    pub fn restamped(mut self, timestamp: f64) -> Self {
        for entry in self.entries.values_mut() {
            entry.timestamp = timestamp;
        }
        self
    }

    /// Parse a JSON statistics report.
    ///
    /// Accepts either a map of id to stats object, or such a map under a
    /// `reports` key. Objects without a `type` are skipped; member names are
    /// normalised to camelCase.
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value
            .get("reports")
            .unwrap_or(value)
            .as_object()
            .ok_or_else(|| AppError::StatsUnavailable("report is not an object".to_string()))?;

        let mut report = Self::new();
        for (key, object) in map {
            let Some(fields) = object.as_object() else {
                continue;
            };
            let Some(stats_type) = fields.get("type").and_then(Value::as_str) else {
                continue;
            };
            let id = fields
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(key)
                .to_string();

            let mut entry = StatsEntry::new(id, stats_type, 0.0);
            entry.kind = fields.get("kind").and_then(Value::as_str).map(str::to_string);
            for (name, member) in fields {
                if let Some(n) = member.as_f64() {
                    let name = camel_case(name);
                    if name == "timestamp" {
                        entry.timestamp = n;
                    } else {
                        entry.values.insert(name, n);
                    }
                }
            }
            report.insert(entry);
        }
        Ok(report)
    }
}
