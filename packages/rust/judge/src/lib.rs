//! External judge for hymn/tune relevance.
//!
//! A [`Judge`] takes one scraped item and returns one relevance vote per
//! candidate. The production implementation calls OpenRouter's chat
//! completions API; tests script their own judges. Votes from several
//! independent runs are folded into final verdicts by [`aggregate`].

mod aggregate;
mod openrouter;
mod prompt;

pub use aggregate::{aggregate, aggregate_all};
pub use openrouter::OpenRouterJudge;
pub use prompt::{build_user_message, SYSTEM_PROMPT};

use async_trait::async_trait;

use tunebook_shared::error::Result;
use tunebook_shared::types::{ScrapedItem, Vote};

/// One relevance-classification backend.
///
/// A call covers every candidate of the item at once; the returned votes
/// carry the given `run_index`. A failed call fails the whole run, which
/// the orchestrator absorbs as long as other runs succeed.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, scraped: &ScrapedItem, run_index: usize) -> Result<Vec<Vote>>;
}
