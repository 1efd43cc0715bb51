//! Initialization progress reporting.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::runtime::{InitProgressCallback, InitProgressReport};

/// One progress update as seen by the caller of `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 0 - 100, non-decreasing within one `init` call.
    pub percent: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent,
            message: message.into(),
        }
    }
}

/// Receives progress events during `init`.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Turns raw runtime progress into caller-facing events.
///
/// One adapter serves a whole `init` call, across the offloaded attempt and the
/// fallback, so the percent it forwards never goes backwards.
#[derive(Clone)]
pub struct ProgressAdapter {
    sink: Option<ProgressSink>,
    high_water: Arc<AtomicU8>,
}

impl ProgressAdapter {
    pub fn new(sink: Option<ProgressSink>) -> Self {
        Self {
            sink,
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Forward an event, clamping its percent to what was already reported.
    pub fn emit(&self, percent: u8, message: impl Into<String>) {
        let percent = percent.min(100);
        let previous = self.high_water.fetch_max(percent, Ordering::SeqCst);
        if let Some(sink) = &self.sink {
            sink(ProgressEvent::new(percent.max(previous), message));
        }
    }

    /// Forward a raw fractional report.
    pub fn report(&self, report: InitProgressReport) {
        self.emit(to_percent(report.progress), report.text);
    }

    /// Callback handed to runtimes.
    pub fn callback(&self) -> InitProgressCallback {
        let adapter = self.clone();
        Arc::new(move |report| adapter.report(report))
    }
}

/// Rescale a 0.0 - 1.0 fraction to an integer percent.
pub fn to_percent(fraction: f64) -> u8 {
    if fraction.is_nan() {
        return 0;
    }
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording() -> (ProgressAdapter, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let adapter = ProgressAdapter::new(Some(Arc::new(move |e| sink.lock().unwrap().push(e))));
        (adapter, events)
    }

    #[test]
    fn test_to_percent() {
        assert_eq!(to_percent(0.0), 0);
        assert_eq!(to_percent(0.334), 33);
        assert_eq!(to_percent(0.335), 34);
        assert_eq!(to_percent(1.0), 100);
        assert_eq!(to_percent(1.7), 100);
        assert_eq!(to_percent(-0.2), 0);
        assert_eq!(to_percent(f64::NAN), 0);
    }

    #[test]
    fn test_reports_keep_text() {
        let (adapter, events) = recording();
        adapter.report(InitProgressReport {
            progress: 0.5,
            text: "Loading shard 2".to_string(),
        });
        assert_eq!(events.lock().unwrap()[0], ProgressEvent::new(50, "Loading shard 2"));
    }

    #[test]
    fn test_percent_never_decreases() {
        let (adapter, events) = recording();
        adapter.emit(0, "starting");
        adapter.emit(60, "offloaded load");
        // fallback restarts its own progress from zero
        adapter.emit(10, "in-process load");
        adapter.emit(100, "ready");

        let percents: Vec<u8> = events.lock().unwrap().iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![0, 60, 60, 100]);
    }

    #[test]
    fn test_without_sink_is_silent() {
        let adapter = ProgressAdapter::new(None);
        adapter.emit(40, "nobody listens");
        (adapter.callback())(InitProgressReport {
            progress: 1.0,
            text: "done".to_string(),
        });
    }
}
