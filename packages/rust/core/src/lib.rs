//! Pipeline orchestration for tunebook.
//!
//! Two resumable stages operate on the checkpoint store: scraping
//! (search + detail pages into candidates) and classification (judge
//! votes into verdicts). Export turns classified records into the
//! verified index.

mod classify;
mod export;
mod input;
mod progress;
mod scrape;

pub use classify::{ClassificationOrchestrator, ClassifyReport};
pub use export::{export_verified_index, VerifiedIndexEntry, VerifiedTune};
pub use input::load_catalogue;
pub use progress::{ProgressReporter, SilentProgress};
pub use scrape::{ScrapeOrchestrator, ScrapeReport};
