//! Core domain types for the tunebook pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize::item_id_from_title;

/// Hard cap on candidates kept per catalogue item, ordered by popularity.
pub const MAX_CANDIDATES_PER_ITEM: usize = 5;

// ---------------------------------------------------------------------------
// CatalogueItem
// ---------------------------------------------------------------------------

/// One organ-resident hymn needing tune identification. Immutable input;
/// the id is derived from the normalized title and stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueItem {
    /// Filesystem-safe stable key, e.g. `a_mighty_fortress`.
    pub id: String,
    /// Human-readable hymn title, e.g. "A Mighty Fortress".
    pub title: String,
    /// Abbreviated name shown on the organ console.
    pub console_display: String,
}

impl CatalogueItem {
    /// Build an item from the raw input row, deriving the stable id.
    pub fn from_input(console_display: &str, full_title: &str) -> Self {
        Self {
            id: item_id_from_title(full_title),
            title: full_title.trim().to_string(),
            console_display: console_display.trim().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A text associated with a tune on its detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slug: String,
}

/// How often a tune instance appears with a given text, as published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceShare {
    pub text_name: String,
    /// Percentage of the tune's published instances, 0.0–100.0.
    pub percentage: f64,
}

/// Media links scraped from a tune detail page. First of each kind only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub midi_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,
}

/// One tune record returned by search for a catalogue item, enriched with
/// detail-page fields. Belongs to exactly one item. Candidate lists hold at
/// most [`MAX_CANDIDATES_PER_ITEM`] entries ordered by `popularity_rank`
/// ascending (1 = most popular); that order is significant and preserved
/// through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Canonical tune slug, e.g. `ein_feste_burg_luther`.
    pub slug: String,
    pub tune_title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub composer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub meter: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub incipit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub copyright: String,
    /// 1-based rank by popularity within this item's candidate list.
    pub popularity_rank: usize,
    /// "Appears in N hymnals" count, the popularity signal.
    pub num_hymnals: u32,
    /// Which text the search card says the tune is primarily used with.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub used_with_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub associated_texts: Vec<TextRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_percentages: Vec<InstanceShare>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    /// Canonical tune page URL.
    pub source_url: String,
    #[serde(default, skip_serializing_if = "media_is_empty")]
    pub media: MediaLinks,
}

fn media_is_empty(m: &MediaLinks) -> bool {
    m.midi_url.is_none() && m.pdf_url.is_none() && m.recording_url.is_none()
}

// ---------------------------------------------------------------------------
// Votes and verdicts
// ---------------------------------------------------------------------------

/// One judge judgment for one candidate in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub candidate_slug: String,
    pub is_relevant: bool,
    /// Judge-reported confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    /// 0-based index of the judge run that produced this vote.
    pub run_index: usize,
}

/// Majority-vote outcome for one candidate. Derived, never hand-edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedVerdict {
    pub candidate_slug: String,
    pub is_relevant_final: bool,
    /// Count of votes agreeing with the final verdict.
    pub agreeing_votes: usize,
    pub total_votes: usize,
    /// Mean confidence over the agreeing votes only.
    pub mean_confidence_of_majority: f64,
    /// Joined reasoning of the disagreeing votes; `None` when unanimous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minority_reasoning: Option<String>,
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

/// Per-item pipeline stage. Transitions are monotonic in [`Stage::rank`]
/// order; the checkpoint store refuses to move a record backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Scraped,
    Failed,
    Classified,
    ClassificationFailed,
}

impl Stage {
    /// Monotonic ordering: pending < scraped/failed < classified/classification_failed.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Scraped | Self::Failed => 1,
            Self::Classified | Self::ClassificationFailed => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scraped => "scraped",
            Self::Failed => "failed",
            Self::Classified => "classified",
            Self::ClassificationFailed => "classification_failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scraped" => Ok(Self::Scraped),
            "failed" => Ok(Self::Failed),
            "classified" => Ok(Self::Classified),
            "classification_failed" => Ok(Self::ClassificationFailed),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint payloads
// ---------------------------------------------------------------------------

/// Everything the scrape stage produces for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedItem {
    pub item: CatalogueItem,
    /// The query string sent to search, for traceability.
    pub search_query: String,
    /// How many results search returned before truncation.
    pub total_search_results: usize,
    /// Top candidates, popularity_rank ascending, at most 5.
    pub candidates: Vec<Candidate>,
}

/// Everything the classify stage produces for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedItem {
    pub scraped: ScrapedItem,
    /// All raw votes across all successful runs, for audit.
    pub votes: Vec<Vote>,
    /// One verdict per candidate, in candidate order.
    pub verdicts: Vec<AggregatedVerdict>,
    pub runs_attempted: usize,
    pub runs_succeeded: usize,
}

/// Checkpoint payload variants, tagged by stage semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointPayload {
    /// No stage output yet (failed items carry only a reason).
    Empty,
    Scraped(ScrapedItem),
    Classified(ClassifiedItem),
}

/// Durable per-item progress record. One per catalogue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub item_id: String,
    pub stage: Stage,
    pub payload: CheckpointPayload,
    /// Number of failed processing attempts so far for the current stage.
    pub attempts: u32,
    /// Failure reason, present on failed stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Fresh record for a stage transition, resetting the failure counter.
    pub fn new(item_id: impl Into<String>, stage: Stage, payload: CheckpointPayload) -> Self {
        Self {
            item_id: item_id.into(),
            stage,
            payload,
            attempts: 0,
            reason: None,
            updated_at: Utc::now(),
        }
    }

    /// The scraped payload, if this record carries one (directly or nested).
    pub fn scraped(&self) -> Option<&ScrapedItem> {
        match &self.payload {
            CheckpointPayload::Scraped(s) => Some(s),
            CheckpointPayload::Classified(c) => Some(&c.scraped),
            CheckpointPayload::Empty => None,
        }
    }

    /// The classified payload, if present.
    pub fn classified(&self) -> Option<&ClassifiedItem> {
        match &self.payload {
            CheckpointPayload::Classified(c) => Some(c),
            _ => None,
        }
    }
}
