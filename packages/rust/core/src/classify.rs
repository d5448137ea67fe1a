//! Classification stage: judge votes into aggregated verdicts.
//!
//! Each scraped item gets `num_runs` independent judge calls. Individual
//! runs retry transient failures and may be lost entirely; verdicts are
//! aggregated over whatever runs succeeded. Only an item with zero
//! successful runs is marked failed.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use tunebook_judge::{aggregate_all, Judge};
use tunebook_shared::config::TieBreak;
use tunebook_shared::error::Result;
use tunebook_shared::retry::RetryPolicy;
use tunebook_shared::types::{
    CheckpointPayload, CheckpointRecord, ClassifiedItem, ScrapedItem, Stage, Vote,
};
use tunebook_storage::CheckpointStore;

use crate::progress::ProgressReporter;

/// Summary of a classification run.
#[derive(Debug, Clone, Default)]
pub struct ClassifyReport {
    /// Scraped items that were eligible this run.
    pub eligible: usize,
    /// Items that received verdicts.
    pub classified: usize,
    /// Items skipped (already classified, or retry budget exhausted).
    pub skipped: usize,
    /// Items where every judge run failed.
    pub failed: usize,
    /// Judge runs lost across all items.
    pub runs_lost: usize,
    /// Items that exhausted their retry budget, with the last reason.
    pub permanently_failed: Vec<(String, String)>,
}

/// Orchestrator for the classification stage.
pub struct ClassificationOrchestrator {
    judge: Arc<dyn Judge>,
    num_runs: usize,
    retry: RetryPolicy,
    tie_break: TieBreak,
    max_item_retries: u32,
    limit: Option<usize>,
}

impl ClassificationOrchestrator {
    pub fn new(
        judge: Arc<dyn Judge>,
        num_runs: usize,
        retry: RetryPolicy,
        tie_break: TieBreak,
        max_item_retries: u32,
    ) -> Self {
        Self {
            judge,
            num_runs: num_runs.max(1),
            retry,
            tie_break,
            max_item_retries: max_item_retries.max(1),
            limit: None,
        }
    }

    /// Cap the number of items processed this run (for testing).
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Classify every scraped item that still needs verdicts.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        store: &CheckpointStore,
        progress: &dyn ProgressReporter,
    ) -> Result<ClassifyReport> {
        let mut report = ClassifyReport::default();
        progress.phase("Classifying candidates");

        // Deterministic order for logs and progress.
        let mut records: Vec<CheckpointRecord> = store.load_all().await?.into_values().collect();
        records.sort_by(|a, b| a.item_id.cmp(&b.item_id));

        let mut eligible: Vec<(CheckpointRecord, u32)> = records
            .into_iter()
            .filter_map(|record| match record.stage {
                Stage::Scraped => Some((record, 0)),
                Stage::ClassificationFailed => {
                    if record.attempts >= self.max_item_retries {
                        let reason = record.reason.clone().unwrap_or_else(|| "unknown".into());
                        report.permanently_failed.push((record.item_id, reason));
                        report.skipped += 1;
                        None
                    } else {
                        let attempts = record.attempts;
                        Some((record, attempts))
                    }
                }
                Stage::Classified => {
                    report.skipped += 1;
                    None
                }
                Stage::Pending | Stage::Failed => None,
            })
            .collect();

        if let Some(limit) = self.limit {
            eligible.truncate(limit);
            info!(limit, "limiting eligible items");
        }

        report.eligible = eligible.len();
        let total = eligible.len();

        for (i, (record, prior_attempts)) in eligible.into_iter().enumerate() {
            let Some(scraped) = record.scraped().cloned() else {
                warn!(item = %record.item_id, "scraped record without payload, skipping");
                report.skipped += 1;
                continue;
            };
            // The scrape stage fails items with no candidates, so an empty
            // list here means a malformed record; nothing to judge.
            if scraped.candidates.is_empty() {
                warn!(item = %record.item_id, "scraped record without candidates, skipping");
                report.skipped += 1;
                continue;
            }
            progress.item_progress(i + 1, total, &scraped.item.title);

            let classified = self.classify_item(&scraped, &mut report).await;

            match classified {
                Ok(item) => {
                    store
                        .save(&CheckpointRecord::new(
                            &record.item_id,
                            Stage::Classified,
                            CheckpointPayload::Classified(item),
                        ))
                        .await?;
                    report.classified += 1;
                }
                Err(reason) => {
                    let attempts = prior_attempts + 1;
                    warn!(item = %record.item_id, attempts, %reason, "all judge runs failed");
                    let mut failed = CheckpointRecord::new(
                        &record.item_id,
                        Stage::ClassificationFailed,
                        CheckpointPayload::Scraped(scraped),
                    );
                    failed.attempts = attempts;
                    failed.reason = Some(reason.clone());
                    store.save(&failed).await?;

                    if attempts >= self.max_item_retries {
                        report.permanently_failed.push((record.item_id, reason));
                    }
                    report.failed += 1;
                }
            }
        }

        info!(
            classified = report.classified,
            failed = report.failed,
            skipped = report.skipped,
            runs_lost = report.runs_lost,
            "classification run complete"
        );
        Ok(report)
    }

    /// Run all judge rounds for one item and aggregate.
    ///
    /// The error carries the last run failure as plain text for the
    /// checkpoint reason column.
    async fn classify_item(
        &self,
        scraped: &ScrapedItem,
        report: &mut ClassifyReport,
    ) -> std::result::Result<ClassifiedItem, String> {
        let mut votes: Vec<Vote> = Vec::new();
        let mut runs_succeeded = 0;
        let mut last_error = String::new();

        for run_index in 0..self.num_runs {
            match self.judge_run(scraped, run_index).await {
                Ok(run_votes) => {
                    votes.extend(run_votes);
                    runs_succeeded += 1;
                }
                Err(reason) => {
                    warn!(item = %scraped.item.id, run_index, %reason, "judge run lost");
                    report.runs_lost += 1;
                    last_error = reason;
                }
            }
        }

        if runs_succeeded == 0 {
            return Err(format!(
                "all {} judge runs failed: {last_error}",
                self.num_runs
            ));
        }

        let slugs: Vec<String> = scraped.candidates.iter().map(|c| c.slug.clone()).collect();
        let verdicts = aggregate_all(&slugs, &votes, self.tie_break)
            .map_err(|e| format!("aggregation failed: {e}"))?;

        Ok(ClassifiedItem {
            scraped: scraped.clone(),
            votes,
            verdicts,
            runs_attempted: self.num_runs,
            runs_succeeded,
        })
    }

    /// One judge run with the configured retry schedule.
    async fn judge_run(
        &self,
        scraped: &ScrapedItem,
        run_index: usize,
    ) -> std::result::Result<Vec<Vote>, String> {
        let mut last_error = String::new();

        for attempt in self.retry.attempts() {
            match self.judge.judge(scraped, run_index).await {
                Ok(votes) => return Ok(votes),
                Err(e) => {
                    warn!(item = %scraped.item.id, run_index, attempt, error = %e, "judge attempt failed");
                    last_error = e.to_string();
                    if let Some(backoff) = self.retry.backoff_after(attempt) {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_error)
    }
}
