//! Progress reporting seam between the pipeline and the CLI.

/// Progress callbacks for long-running pipeline stages.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Item-level progress within the current phase.
    fn item_progress(&self, current: usize, total: usize, detail: &str);
}

/// No-op reporter for tests and library use.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item_progress(&self, _current: usize, _total: usize, _detail: &str) {}
}
