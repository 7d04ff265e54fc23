use parallax_core::placement::Placement;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePoint {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub label: String,
    pub placement: Placement,
    pub point: TracePoint,
    pub tick: u64,
}

/// Logical clock over task starts and ends across all streams.
#[derive(Debug, Default)]
pub struct ExecutionTrace {
    clock: AtomicU64,
    entries: Mutex<Vec<TraceEntry>>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, label: &str, placement: Placement, point: TracePoint) {
        if let Ok(mut entries) = self.entries.lock() {
            let tick = self.clock.fetch_add(1, Ordering::SeqCst);
            entries.push(TraceEntry {
                label: label.to_string(),
                placement,
                point,
                tick,
            });
        }
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// `(start, end)` ticks of the latest task with this label.
    pub fn span(&self, label: &str) -> Option<(u64, u64)> {
        let entries = self.entries.lock().ok()?;
        let find = |point| {
            entries
                .iter()
                .rev()
                .find(|e| e.label == label && e.point == point)
                .map(|e| e.tick)
        };
        Some((find(TracePoint::Start)?, find(TracePoint::End)?))
    }

    /// True when `first` ended before `second` started.
    pub fn happened_before(&self, first: &str, second: &str) -> bool {
        match (self.span(first), self.span(second)) {
            (Some((_, end)), Some((start, _))) => end < start,
            _ => false,
        }
    }

    /// Labels in the order their tasks started.
    pub fn started(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.point == TracePoint::Start)
            .map(|e| e.label)
            .collect()
    }
}
