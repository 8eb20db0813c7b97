//! Page-load progress aggregation.
//!
//! The embedded browser reports load progress as a stream of percentages.
//! [`ProgressTracker`] folds that stream into exactly one
//! [`CompletionEvent`] per load, regardless of how many intermediate values
//! arrive or whether any arrive at all.

/// Emitted once per load when it reaches 100%.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent;

#[derive(Debug, Default)]
pub struct ProgressTracker {
    percent: u8,
    loading: bool,
    completed: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new load has begun.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed one progress report.
    ///
    /// Values outside `0..=100` are ignored. The first 100 of a load
    /// completes it; everything after that is ignored until [`reset`](Self::reset).
    pub fn on_progress(&mut self, percent: i32) -> Option<CompletionEvent> {
        if self.completed {
            return None;
        }

        let percent = match u8::try_from(percent) {
            Ok(p) if p <= 100 => p,
            _ => {
                tracing::debug!(percent, "Ignoring out-of-range load progress");
                return None;
            }
        };

        self.percent = percent;
        self.loading = true;

        if percent == 100 {
            self.complete()
        } else {
            None
        }
    }

    /// The browser signalled the load finished. Completes the load if no 100%
    /// report arrived first.
    pub fn on_load_finished(&mut self) -> Option<CompletionEvent> {
        if self.completed {
            return None;
        }
        self.percent = 100;
        self.complete()
    }

    fn complete(&mut self) -> Option<CompletionEvent> {
        self.completed = true;
        self.loading = false;
        Some(CompletionEvent)
    }

    /// Last accepted percentage.
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// True between the first accepted report and completion. Drives the
    /// progress bar's visibility.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }
}
