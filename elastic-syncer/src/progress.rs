use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Live counters for one replication run.
///
/// Counters are always maintained; the bar is only drawn when built with
/// [`SyncProgress::spinner`].
pub struct SyncProgress {
    bar: ProgressBar,
    read: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    start: Instant,
}

impl SyncProgress {
    /// Progress without any terminal output
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    /// Spinner for interactive runs; the total is unknown up front
    pub fn spinner() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {msg} ({per_sec})",
        ) {
            bar.set_style(style);
        }
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self::with_bar(bar)
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            read: AtomicU64::new(0),
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn inc_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
        self.refresh();
    }

    pub fn inc_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
        self.bar.inc(1);
        self.refresh();
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.bar.inc(1);
        self.refresh();
    }

    fn refresh(&self) {
        if self.bar.is_hidden() {
            return;
        }
        self.bar.set_message(format!(
            "read {} / written {} / failed {}",
            self.read(),
            self.written(),
            self.failed()
        ));
    }

    pub fn finish(&self) {
        let elapsed = self.start.elapsed();
        self.bar.finish_with_message(format!(
            "Done! Copied {} of {} documents in {:.1}s ({} failed)",
            self.written(),
            self.read(),
            elapsed.as_secs_f64(),
            self.failed()
        ));
    }

    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Documents handed to the writer whose outcome has not been reported yet
    pub fn pending(&self) -> u64 {
        self.read()
            .saturating_sub(self.written())
            .saturating_sub(self.failed())
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::hidden()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let progress = SyncProgress::hidden();
        for _ in 0..5 {
            progress.inc_read();
        }
        progress.inc_written();
        progress.inc_written();
        progress.inc_failed();

        assert_eq!(progress.read(), 5);
        assert_eq!(progress.written(), 2);
        assert_eq!(progress.failed(), 1);
        assert_eq!(progress.pending(), 2);
        progress.finish();
    }
}
