//! Shared types, config, and errors for tunebook.

pub mod config;
pub mod error;
pub mod normalize;
pub mod retry;
pub mod types;

pub use config::{AppConfig, FetchConfig, TieBreak};
pub use error::{Result, TunebookError};
pub use retry::RetryPolicy;
pub use types::{
    AggregatedVerdict, Candidate, CatalogueItem, CheckpointPayload, CheckpointRecord,
    ClassifiedItem, ScrapedItem, Stage, Vote, MAX_CANDIDATES_PER_ITEM,
};
