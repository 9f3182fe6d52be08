use tracing::info;

/// Receives batch progress. Returning `false` from [`Progress::advance`] stops the loop
/// before the next batch starts.
pub trait Progress {
    fn start(&mut self, total: u64);

    fn advance(&mut self, processed: u64) -> bool;
}

/// Ignores progress and never stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&mut self, _total: u64) {}

    fn advance(&mut self, _processed: u64) -> bool {
        true
    }
}

/// Emits one `migrate_progress` event per batch.
#[derive(Debug, Clone)]
pub struct LogProgress {
    label: String,
    total: u64,
    done: u64,
}

impl LogProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            total: 0,
            done: 0,
        }
    }

    pub fn done(&self) -> u64 {
        self.done
    }
}

impl Progress for LogProgress {
    fn start(&mut self, total: u64) {
        self.total = total;
        self.done = 0;
    }

    fn advance(&mut self, processed: u64) -> bool {
        self.done += processed;
        info!(
            target: "extupdate",
            event = "migrate_progress",
            step = %self.label,
            done = self.done,
            total = self.total
        );
        true
    }
}

/// Stops after a fixed number of batches.
#[derive(Debug, Clone, Copy)]
pub struct StopAfter(pub usize);

impl Progress for StopAfter {
    fn start(&mut self, _total: u64) {}

    fn advance(&mut self, _processed: u64) -> bool {
        self.0 = self.0.saturating_sub(1);
        self.0 > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_progress_accumulates() {
        let mut progress = LogProgress::new("news");
        progress.start(10);
        assert!(progress.advance(4));
        assert!(progress.advance(6));
        assert_eq!(progress.done(), 10);
    }

    #[test]
    fn stop_after_counts_batches() {
        let mut progress = StopAfter(2);
        assert!(progress.advance(1));
        assert!(!progress.advance(1));
    }
}
