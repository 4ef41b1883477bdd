use super::{DecisionLogEntry, DecisionLogSink};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Ring buffer of recent decisions. Clones share the same buffer, so one
/// handle can feed the logger task while another serves reports.
#[derive(Clone)]
pub struct MemoryLogSink {
    buffer: Arc<RwLock<VecDeque<DecisionLogEntry>>>,
    capacity: usize,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity,
        }
    }

    pub fn get_recent(&self) -> Vec<DecisionLogEntry> {
        self.buffer.read().iter().cloned().collect()
    }

    pub fn since(&self, start: DateTime<Utc>) -> Vec<DecisionLogEntry> {
        self.buffer
            .read()
            .iter()
            .filter(|e| e.timestamp >= start)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DecisionLogSink for MemoryLogSink {
    fn log(&self, entry: &DecisionLogEntry) {
        let mut buffer = self.buffer.write();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry.clone());
    }
}
