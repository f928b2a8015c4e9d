//! Structured allocator lifecycle records.
//!
//! The allocator keeps an in-memory list of lifecycle records (mapping and
//! unmapping superpages, large blocks, failures). Records below the
//! configured level are dropped before any formatting happens, so the default
//! `Info` level costs one comparison per operation.

use std::fmt;

use serde::Serialize;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// Threshold only: disables recording. Never attached to a record.
    Off,
}

impl AllocatorLogLevel {
    /// Parse from string (case-insensitive). Unknown values give `Info`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Info,
        }
    }

    pub(crate) const fn from_index(index: u8) -> Self {
        match index {
            0 => Self::Trace,
            1 => Self::Debug,
            3 => Self::Warn,
            4 => Self::Error,
            5 => Self::Off,
            _ => Self::Info,
        }
    }

    /// Lowercase name, as used in JSON output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: AllocatorLogLevel,
    /// API symbol (`malloc`, `calloc`, `realloc`, `free`, `close`).
    pub symbol: &'static str,
    /// Event kind (`superpage_map`, `large_unmap`, `oom`, ...).
    pub event: &'static str,
    /// Address involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    /// Size involved in the event (request or mapping size).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Size-class exponent, when the event concerns a slotted block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<u32>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: outstanding user allocations.
    pub allocs: usize,
    /// Snapshot: outstanding OS mappings.
    pub mmaps: usize,
    /// Snapshot: mapped bytes.
    pub bytes: usize,
}

/// Addresses and sizes attached to one record.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LogFields {
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    pub log: Option<u32>,
}

/// Bounded-cost sink for lifecycle records.
#[derive(Debug)]
pub(crate) struct LifecycleLog {
    level: AllocatorLogLevel,
    next_decision_id: u64,
    records: Vec<AllocatorLogRecord>,
}

impl LifecycleLog {
    pub(crate) fn new(level: AllocatorLogLevel) -> Self {
        Self {
            level,
            next_decision_id: 1,
            records: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn enabled(&self, level: AllocatorLogLevel) -> bool {
        level != AllocatorLogLevel::Off && level >= self.level
    }

    pub(crate) fn level(&self) -> AllocatorLogLevel {
        self.level
    }

    pub(crate) fn set_level(&mut self, level: AllocatorLogLevel) {
        self.level = level;
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        fields: LogFields,
        outcome: &'static str,
        details: fmt::Arguments<'_>,
        counters: (usize, usize, usize),
    ) {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        let (allocs, mmaps, bytes) = counters;
        self.records.push(AllocatorLogRecord {
            decision_id,
            trace_id: format!("core::malloc::{}::{:016x}", symbol, decision_id),
            level,
            symbol,
            event,
            ptr: fields.ptr,
            size: fields.size,
            log: fields.log,
            outcome,
            details: details.to_string(),
            allocs,
            mmaps,
            bytes,
        });
    }

    pub(crate) fn records(&self) -> &[AllocatorLogRecord] {
        &self.records
    }

    pub(crate) fn drain(&mut self) -> Vec<AllocatorLogRecord> {
        std::mem::take(&mut self.records)
    }

    /// One JSON object per line.
    pub(crate) fn to_jsonl(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(log: &mut LifecycleLog, level: AllocatorLogLevel, event: &'static str) {
        log.record(
            level,
            "malloc",
            event,
            LogFields {
                ptr: Some(0x1000),
                size: Some(64),
                log: Some(6),
            },
            "success",
            format_args!("path={}", event),
            (1, 1, 65536),
        );
    }

    #[test]
    fn parse_levels() {
        assert_eq!(
            AllocatorLogLevel::from_str_loose("TRACE"),
            AllocatorLogLevel::Trace
        );
        assert_eq!(
            AllocatorLogLevel::from_str_loose("debug"),
            AllocatorLogLevel::Debug
        );
        assert_eq!(
            AllocatorLogLevel::from_str_loose("warning"),
            AllocatorLogLevel::Warn
        );
        assert_eq!(
            AllocatorLogLevel::from_str_loose(" error "),
            AllocatorLogLevel::Error
        );
        assert_eq!(
            AllocatorLogLevel::from_str_loose("none"),
            AllocatorLogLevel::Off
        );
        assert_eq!(
            AllocatorLogLevel::from_str_loose("bogus"),
            AllocatorLogLevel::Info
        );
    }

    #[test]
    fn index_roundtrip() {
        for level in [
            AllocatorLogLevel::Trace,
            AllocatorLogLevel::Debug,
            AllocatorLogLevel::Info,
            AllocatorLogLevel::Warn,
            AllocatorLogLevel::Error,
            AllocatorLogLevel::Off,
        ] {
            assert_eq!(AllocatorLogLevel::from_index(level as u8), level);
        }
    }

    #[test]
    fn records_below_threshold_are_dropped() {
        let mut log = LifecycleLog::new(AllocatorLogLevel::Debug);
        push(&mut log, AllocatorLogLevel::Trace, "slot_alloc");
        push(&mut log, AllocatorLogLevel::Debug, "superpage_map");
        push(&mut log, AllocatorLogLevel::Warn, "oom");
        let events: Vec<_> = log.records().iter().map(|r| r.event).collect();
        assert_eq!(events, ["superpage_map", "oom"]);
    }

    #[test]
    fn off_disables_everything() {
        let mut log = LifecycleLog::new(AllocatorLogLevel::Off);
        push(&mut log, AllocatorLogLevel::Error, "unmap_failed");
        assert!(log.records().is_empty());
    }

    #[test]
    fn decision_ids_and_trace_ids() {
        let mut log = LifecycleLog::new(AllocatorLogLevel::Trace);
        push(&mut log, AllocatorLogLevel::Trace, "slot_alloc");
        push(&mut log, AllocatorLogLevel::Trace, "slot_free");
        let drained = log.drain();
        assert_eq!(drained[0].decision_id, 1);
        assert_eq!(drained[1].decision_id, 2);
        assert_eq!(drained[1].trace_id, "core::malloc::malloc::0000000000000002");
        assert_eq!(drained[0].details, "path=slot_alloc");
        assert!(log.records().is_empty());
    }

    #[test]
    fn jsonl_export_has_one_object_per_line() {
        let mut log = LifecycleLog::new(AllocatorLogLevel::Trace);
        push(&mut log, AllocatorLogLevel::Trace, "slot_alloc");
        push(&mut log, AllocatorLogLevel::Warn, "oom");
        let text = log.to_jsonl().unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(value["level"], "warn");
        assert_eq!(value["event"], "oom");
        assert_eq!(value["log"], 6);
        assert_eq!(value["bytes"], 65536);
    }

    #[test]
    fn as_str_matches_serialized_name() {
        for level in [
            AllocatorLogLevel::Trace,
            AllocatorLogLevel::Debug,
            AllocatorLogLevel::Info,
            AllocatorLogLevel::Warn,
            AllocatorLogLevel::Error,
            AllocatorLogLevel::Off,
        ] {
            let json = serde_json::to_string(&level).unwrap();
            assert_eq!(json, format!("\"{}\"", level.as_str()));
            assert_eq!(AllocatorLogLevel::from_str_loose(level.as_str()), level);
        }
    }
}
