pub mod console_sink;
pub mod memory_sink;
pub mod types;

pub use self::console_sink::ConsoleLogSink;
pub use self::memory_sink::MemoryLogSink;
pub use self::types::{DecisionLogEntry, DecisionLogSink};

use crate::config::LoggingConfig;
use crate::model::Verdict;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

const SINK_BUFFER: usize = 1000;

/// Fans decision log entries out to the configured sinks. Each sink runs on
/// its own task behind a bounded channel; a full channel drops the entry
/// instead of slowing the check path.
pub struct DecisionLogger {
    sinks: Vec<mpsc::Sender<DecisionLogEntry>>,
    memory: Option<MemoryLogSink>,
}

impl DecisionLogger {
    pub fn new(config: LoggingConfig, extra_sinks: Vec<Box<dyn DecisionLogSink>>) -> Arc<Self> {
        let mut sinks = Vec::new();
        let mut memory = None;

        for sink_type in &config.decision_log_sinks {
            match sink_type.as_str() {
                "console" => {
                    sinks.push(Self::spawn_sink(Box::new(ConsoleLogSink::new(config.clone()))));
                }
                "memory" => {
                    let sink = MemoryLogSink::new(config.memory_log_capacity);
                    memory = Some(sink.clone());
                    sinks.push(Self::spawn_sink(Box::new(sink)));
                }
                other => warn!("Unknown decision log sink type: {}", other),
            }
        }

        for sink in extra_sinks {
            sinks.push(Self::spawn_sink(sink));
        }

        Arc::new(Self { sinks, memory })
    }

    fn spawn_sink(sink: Box<dyn DecisionLogSink>) -> mpsc::Sender<DecisionLogEntry> {
        let (tx, mut rx) = mpsc::channel::<DecisionLogEntry>(SINK_BUFFER);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                sink.log(&entry);
            }
        });
        tx
    }

    /// Handle on the in-memory ring buffer, if the `memory` sink is enabled.
    pub fn memory_sink(&self) -> Option<&MemoryLogSink> {
        self.memory.as_ref()
    }

    pub fn log_verdict(&self, verdict: &Verdict) {
        if self.sinks.is_empty() {
            return;
        }
        self.log(DecisionLogEntry::from_verdict(verdict));
    }

    pub fn log(&self, entry: DecisionLogEntry) {
        let Some((last, rest)) = self.sinks.split_last() else {
            return;
        };
        for sink in rest {
            let _ = sink.try_send(entry.clone());
        }
        let _ = last.try_send(entry);
    }
}
