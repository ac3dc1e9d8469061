//! Lightweight per-request query tracing.
//!
//! When a client sets the trace bit in the call header, the server collects
//! timestamped annotations while executing the request and ships them back as
//! the trailing trace string of the response. A disabled tracer records
//! nothing and serializes to an empty string, which costs one empty frame on
//! the wire.

use std::time::Instant;

/// Collects trace annotations for a single request.
#[derive(Debug)]
pub struct Tracer {
    enabled: bool,
    started: Instant,
    lines: Vec<String>,
}

impl Tracer {
    pub fn new(enabled: bool, label: &str) -> Self {
        let mut t = Self {
            enabled,
            started: Instant::now(),
            lines: Vec::new(),
        };
        if enabled {
            t.lines.push(label.to_string());
        }
        t
    }

    /// A tracer that records nothing.
    pub fn disabled() -> Self {
        Self::new(false, "")
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Records one annotation with the elapsed time since the trace started.
    pub fn record(&mut self, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        let elapsed = self.started.elapsed();
        self.lines
            .push(format!("{:>9.3}ms  {}", elapsed.as_secs_f64() * 1e3, msg.as_ref()));
    }

    /// Serializes the collected annotations; empty when tracing is off.
    pub fn finish(self) -> String {
        self.lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_tracer_is_empty() {
        let mut t = Tracer::disabled();
        t.record("ignored");
        assert!(!t.enabled());
        assert_eq!(t.finish(), "");
    }

    #[test]
    fn test_enabled_tracer_records_lines() {
        let mut t = Tracer::new(true, "labelNames_v1() at storage node");
        t.record("found 12 label names");
        let out = t.finish();
        assert!(out.starts_with("labelNames_v1() at storage node"));
        assert!(out.contains("found 12 label names"));
    }
}
