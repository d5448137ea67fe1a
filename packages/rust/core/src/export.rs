//! Verified index export.
//!
//! Turns classified checkpoint records into the final JSON artifact:
//! one entry per hymn, carrying only the candidates the majority vote
//! confirmed, with the audit numbers alongside.

use std::path::Path;

use serde::Serialize;
use tracing::info;

use tunebook_shared::error::{Result, TunebookError};
use tunebook_shared::types::{MediaLinks, Stage};
use tunebook_storage::CheckpointStore;

/// One verified tune in the exported index.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedTune {
    pub slug: String,
    pub tune_title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub composer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub meter: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub incipit: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub copyright: String,
    pub num_hymnals: u32,
    pub popularity_rank: usize,
    pub source_url: String,
    pub media: MediaLinks,
    /// Vote audit: how the verdict came about.
    pub agreeing_votes: usize,
    pub total_votes: usize,
    pub mean_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minority_reasoning: Option<String>,
}

/// One hymn in the exported index.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedIndexEntry {
    pub id: String,
    pub title: String,
    pub console_display: String,
    pub total_search_results: usize,
    pub runs_succeeded: usize,
    /// Verified tunes only, in popularity order.
    pub tunes: Vec<VerifiedTune>,
}

/// Write the verified index for all classified items to `path`.
///
/// Returns the number of hymn entries written. Items that never reached
/// the classified stage are left out; rerun the pipeline to pick them up.
pub async fn export_verified_index(store: &CheckpointStore, path: &Path) -> Result<usize> {
    let mut records: Vec<_> = store
        .load_all()
        .await?
        .into_values()
        .filter(|r| r.stage == Stage::Classified)
        .collect();
    records.sort_by(|a, b| a.item_id.cmp(&b.item_id));

    let mut entries = Vec::with_capacity(records.len());
    for record in &records {
        let Some(classified) = record.classified() else {
            continue;
        };
        let scraped = &classified.scraped;

        let tunes = classified
            .verdicts
            .iter()
            .filter(|v| v.is_relevant_final)
            .filter_map(|verdict| {
                let candidate = scraped
                    .candidates
                    .iter()
                    .find(|c| c.slug == verdict.candidate_slug)?;
                Some(VerifiedTune {
                    slug: candidate.slug.clone(),
                    tune_title: candidate.tune_title.clone(),
                    composer: candidate.composer.clone(),
                    meter: candidate.meter.clone(),
                    key: candidate.key.clone(),
                    incipit: candidate.incipit.clone(),
                    copyright: candidate.copyright.clone(),
                    num_hymnals: candidate.num_hymnals,
                    popularity_rank: candidate.popularity_rank,
                    source_url: candidate.source_url.clone(),
                    media: candidate.media.clone(),
                    agreeing_votes: verdict.agreeing_votes,
                    total_votes: verdict.total_votes,
                    mean_confidence: verdict.mean_confidence_of_majority,
                    minority_reasoning: verdict.minority_reasoning.clone(),
                })
            })
            .collect();

        entries.push(VerifiedIndexEntry {
            id: scraped.item.id.clone(),
            title: scraped.item.title.clone(),
            console_display: scraped.item.console_display.clone(),
            total_search_results: scraped.total_search_results,
            runs_succeeded: classified.runs_succeeded,
            tunes,
        });
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TunebookError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(&entries)
        .map_err(|e| TunebookError::validation(format!("index serialization: {e}")))?;
    std::fs::write(path, json).map_err(|e| TunebookError::io(path, e))?;

    info!(entries = entries.len(), path = %path.display(), "wrote verified index");
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tunebook_shared::config::TieBreak;
    use tunebook_shared::types::{
        Candidate, CatalogueItem, CheckpointPayload, CheckpointRecord, ClassifiedItem,
        ScrapedItem, Vote,
    };

    fn candidate(slug: &str, rank: usize) -> Candidate {
        Candidate {
            slug: slug.into(),
            tune_title: slug.to_uppercase(),
            composer: "Composer".into(),
            meter: String::new(),
            incipit: String::new(),
            key: String::new(),
            copyright: String::new(),
            popularity_rank: rank,
            num_hymnals: 100,
            used_with_text: String::new(),
            associated_texts: vec![],
            instance_percentages: vec![],
            notes: String::new(),
            source_url: format!("https://hymnary.org/tune/{slug}"),
            media: Default::default(),
        }
    }

    fn vote(slug: &str, is_relevant: bool, run_index: usize) -> Vote {
        Vote {
            candidate_slug: slug.into(),
            is_relevant,
            confidence: 0.9,
            reasoning: "r".into(),
            run_index,
        }
    }

    #[tokio::test]
    async fn export_includes_only_verified_tunes() {
        let root = std::env::temp_dir().join(format!(
            "tunebook-export-test-{}",
            uuid::Uuid::now_v7()
        ));
        let store = CheckpointStore::open(&root.join("checkpoint.db")).await.unwrap();

        let mut scraped = ScrapedItem {
            item: CatalogueItem::from_input("Abide", "Abide with Me"),
            search_query: "Abide+with+Me".into(),
            total_search_results: 9,
            candidates: vec![candidate("eventide", 1), candidate("false_match", 2)],
        };
        scraped.candidates[0].copyright = "Public Domain".into();
        let votes = vec![
            vote("eventide", true, 0),
            vote("eventide", true, 1),
            vote("false_match", false, 0),
            vote("false_match", false, 1),
        ];
        let slugs = vec!["eventide".to_string(), "false_match".to_string()];
        let verdicts = tunebook_judge::aggregate_all(&slugs, &votes, TieBreak::NotRelevant).unwrap();

        store
            .save(&CheckpointRecord::new(
                "abide_with_me",
                Stage::Classified,
                CheckpointPayload::Classified(ClassifiedItem {
                    scraped,
                    votes,
                    verdicts,
                    runs_attempted: 2,
                    runs_succeeded: 2,
                }),
            ))
            .await
            .unwrap();

        // A still-scraped item must not appear in the export.
        store
            .save(&CheckpointRecord::new(
                "unfinished_hymn",
                Stage::Scraped,
                CheckpointPayload::Scraped(ScrapedItem {
                    item: CatalogueItem::from_input("X", "Unfinished Hymn"),
                    search_query: "q".into(),
                    total_search_results: 0,
                    candidates: vec![],
                }),
            ))
            .await
            .unwrap();

        let out = root.join("processed").join("verified_index.json");
        let written = export_verified_index(&store, &out).await.unwrap();
        assert_eq!(written, 1);

        let content = std::fs::read_to_string(&out).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["id"], "abide_with_me");

        let tunes = entries[0]["tunes"].as_array().unwrap();
        assert_eq!(tunes.len(), 1);
        assert_eq!(tunes[0]["slug"], "eventide");
        assert_eq!(tunes[0]["copyright"], "Public Domain");
        assert_eq!(tunes[0]["agreeing_votes"], 2);
        assert!(content.find("false_match").is_none());

        let _ = std::fs::remove_dir_all(&root);
    }
}
