//! Scrape stage: search and detail pages into candidate lists.
//!
//! Resumable: items already at or past the scraped stage are skipped,
//! failed items are retried until `max_item_retries`, and a checkpoint
//! is written after every item so an interrupted run loses at most the
//! item in flight.

use tracing::{info, instrument, warn};

use tunebook_fetch::RateLimitedFetcher;
use tunebook_parser::{parse_search_results, parse_tune_detail, TuneCard};
use tunebook_shared::error::{Result, TunebookError};
use tunebook_shared::normalize::title_to_search_query;
use tunebook_shared::types::{
    Candidate, CatalogueItem, CheckpointPayload, CheckpointRecord, ScrapedItem, Stage,
    MAX_CANDIDATES_PER_ITEM,
};
use tunebook_storage::CheckpointStore;

use crate::progress::ProgressReporter;

/// Summary of a scrape run.
#[derive(Debug, Clone, Default)]
pub struct ScrapeReport {
    pub total: usize,
    /// Items scraped during this run.
    pub processed: usize,
    /// Items skipped because a checkpoint already covers them.
    pub skipped: usize,
    /// Items that failed this run but remain retryable.
    pub failed: usize,
    /// Items that exhausted their retry budget, with the last reason.
    pub permanently_failed: Vec<(String, String)>,
}

/// Orchestrator for the scrape stage.
pub struct ScrapeOrchestrator {
    fetcher: RateLimitedFetcher,
    max_item_retries: u32,
}

impl ScrapeOrchestrator {
    pub fn new(fetcher: RateLimitedFetcher, max_item_retries: u32) -> Self {
        Self {
            fetcher,
            max_item_retries: max_item_retries.max(1),
        }
    }

    /// Scrape every item in the catalogue that still needs it.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn run(
        &self,
        items: &[CatalogueItem],
        store: &CheckpointStore,
        progress: &dyn ProgressReporter,
    ) -> Result<ScrapeReport> {
        let mut report = ScrapeReport {
            total: items.len(),
            ..Default::default()
        };
        progress.phase("Scraping tune candidates");

        for (i, item) in items.iter().enumerate() {
            progress.item_progress(i + 1, items.len(), &item.title);

            let prior_attempts = match store.get(&item.id).await? {
                Some(record) if record.stage == Stage::Failed => {
                    if record.attempts >= self.max_item_retries {
                        let reason = record.reason.unwrap_or_else(|| "unknown".into());
                        info!(item = %item.id, attempts = record.attempts, "retry budget exhausted");
                        report.permanently_failed.push((item.id.clone(), reason));
                        continue;
                    }
                    record.attempts
                }
                Some(record) if record.stage.rank() >= Stage::Scraped.rank() => {
                    report.skipped += 1;
                    continue;
                }
                _ => 0,
            };

            match self.scrape_item(item).await {
                Ok(scraped) => {
                    info!(
                        item = %item.id,
                        candidates = scraped.candidates.len(),
                        search_results = scraped.total_search_results,
                        "item scraped"
                    );
                    store
                        .save(&CheckpointRecord::new(
                            &item.id,
                            Stage::Scraped,
                            CheckpointPayload::Scraped(scraped),
                        ))
                        .await?;
                    report.processed += 1;
                }
                Err(e) if e.is_item_scoped() => {
                    let attempts = prior_attempts + 1;
                    warn!(item = %item.id, attempts, error = %e, "item failed");
                    let mut record =
                        CheckpointRecord::new(&item.id, Stage::Failed, CheckpointPayload::Empty);
                    record.attempts = attempts;
                    record.reason = Some(e.to_string());
                    store.save(&record).await?;

                    if attempts >= self.max_item_retries {
                        report
                            .permanently_failed
                            .push((item.id.clone(), e.to_string()));
                    }
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            permanent = report.permanently_failed.len(),
            "scrape run complete"
        );
        Ok(report)
    }

    /// Search, truncate to the most popular candidates, fetch details.
    async fn scrape_item(&self, item: &CatalogueItem) -> Result<ScrapedItem> {
        let query = title_to_search_query(&item.title);
        let search_url = self.fetcher.search_url(&query)?;
        let search = self.fetcher.fetch(&search_url).await?;

        let mut cards = parse_search_results(&search.body);
        let total_search_results = cards.len();

        cards.retain(|card| {
            if card.tune_slug.is_empty() {
                warn!(item = %item.id, title = %card.title, "skipping card without slug");
                false
            } else {
                true
            }
        });
        // Zero candidates is a per-item failure: the item stays retryable
        // instead of entering classification with nothing to judge.
        if cards.is_empty() {
            return Err(TunebookError::parse(format!(
                "search for '{query}' yielded no tune candidates"
            )));
        }

        // Most widely published first; search order breaks ties.
        cards.sort_by_key(|card| std::cmp::Reverse(card.num_hymnals));
        cards.truncate(MAX_CANDIDATES_PER_ITEM);

        let mut candidates = Vec::with_capacity(cards.len());
        for (rank, card) in cards.into_iter().enumerate() {
            let candidate = self.fetch_candidate(item, card, rank + 1).await?;
            candidates.push(candidate);
        }

        Ok(ScrapedItem {
            item: item.clone(),
            search_query: query,
            total_search_results,
            candidates,
        })
    }

    /// Enrich one search card with its detail page.
    ///
    /// A detail page that cannot be fetched or parsed degrades to a
    /// card-only candidate instead of failing the item; the search card
    /// already carries enough evidence for the judge.
    async fn fetch_candidate(
        &self,
        item: &CatalogueItem,
        card: TuneCard,
        popularity_rank: usize,
    ) -> Result<Candidate> {
        let tune_url = self.fetcher.tune_url(&card.tune_slug)?;

        let detail = match self.fetcher.fetch(&tune_url).await {
            Ok(outcome) => Some(parse_tune_detail(&outcome.body)),
            Err(e) if e.is_item_scoped() => {
                warn!(item = %item.id, slug = %card.tune_slug, error = %e, "detail fetch failed, keeping card only");
                None
            }
            Err(e) => return Err(e),
        };

        let pick = |from_detail: Option<&str>, from_card: &str| -> String {
            match from_detail {
                Some(value) if !value.is_empty() => value.to_string(),
                _ => from_card.to_string(),
            }
        };

        let detail_ref = detail.as_ref();
        Ok(Candidate {
            slug: card.tune_slug.clone(),
            tune_title: pick(detail_ref.map(|d| d.title.as_str()), &card.title),
            composer: pick(detail_ref.map(|d| d.composer.as_str()), &card.composer),
            meter: pick(detail_ref.map(|d| d.meter.as_str()), &card.meter),
            incipit: pick(detail_ref.map(|d| d.incipit.as_str()), &card.incipit),
            key: pick(detail_ref.map(|d| d.key.as_str()), &card.tune_key),
            // Search cards never carry copyright; only the detail page does.
            copyright: detail_ref.map(|d| d.copyright.clone()).unwrap_or_default(),
            popularity_rank,
            num_hymnals: detail_ref
                .map(|d| d.num_hymnals)
                .filter(|n| *n > 0)
                .unwrap_or(card.num_hymnals),
            used_with_text: card.used_with_text,
            associated_texts: detail_ref
                .map(|d| d.associated_texts.clone())
                .unwrap_or_default(),
            instance_percentages: detail_ref
                .map(|d| d.instance_percentages.clone())
                .unwrap_or_default(),
            notes: detail_ref.map(|d| d.notes.clone()).unwrap_or_default(),
            source_url: tune_url.to_string(),
            media: detail_ref.map(|d| d.media.clone()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use url::Url;
    use wiremock::matchers::{method, path, query_param_contains};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use tunebook_shared::config::FetchConfig;
    use tunebook_shared::retry::RetryPolicy;
    use crate::progress::SilentProgress;

    fn fetch_config(server_uri: &str, tmp: &std::path::Path) -> FetchConfig {
        FetchConfig {
            base_url: Url::parse(server_uri).unwrap(),
            allowed_path_prefixes: vec!["/search".into(), "/tune/".into()],
            min_interval: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(1, 0),
            cache_dir: tmp.join("raw"),
            user_agent: "tunebook/test".into(),
        }
    }

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("tunebook-scrape-test-{}", uuid::Uuid::now_v7()))
    }

    fn search_page(cards: &[(&str, &str, u32)]) -> String {
        let mut html = String::from("<html><body>");
        for (title, slug, hymnals) in cards {
            html.push_str(&format!(
                r#"<div class="resultcard resultcard-normal">
                     <h2><a href="/tune/{slug}">{title}</a></h2>
                     <span data-fieldname="total">Appears in {hymnals} hymnals</span>
                   </div>"#
            ));
        }
        html.push_str("</body></html>");
        html
    }

    fn detail_page(title: &str, composer: &str) -> String {
        format!(
            r#"<html><body><h1>{title}</h1>
               <div id="at_tuneinfo"><table>
                 <tr class="result-row">
                   <td><span class="hy_infoLabel">Composer:</span></td>
                   <td><span class="hy_infoItem">{composer}</span></td>
                 </tr>
               </table></div>
               </body></html>"#
        )
    }

    async fn mount_search(server: &MockServer, query_part: &str, body: String) {
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param_contains("qu", query_part))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    async fn mount_detail(server: &MockServer, slug: &str, body: String) {
        Mock::given(method("GET"))
            .and(path(format!("/tune/{slug}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn scrapes_and_checkpoints_items() {
        let server = MockServer::start().await;
        let tmp = temp_root();

        mount_search(
            &server,
            "Abide",
            search_page(&[("EVENTIDE", "eventide", 1200)]),
        )
        .await;
        mount_detail(&server, "eventide", detail_page("EVENTIDE", "W. H. Monk")).await;

        let store = CheckpointStore::open(&tmp.join("checkpoint.db")).await.unwrap();
        let fetcher = RateLimitedFetcher::new(fetch_config(&server.uri(), &tmp)).unwrap();
        let orchestrator = ScrapeOrchestrator::new(fetcher, 3);

        let items = vec![CatalogueItem::from_input("Abide", "Abide with Me")];
        let report = orchestrator.run(&items, &store, &SilentProgress).await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let record = store.get("abide_with_me").await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Scraped);
        let scraped = record.scraped().unwrap();
        assert_eq!(scraped.candidates.len(), 1);
        assert_eq!(scraped.candidates[0].slug, "eventide");
        assert_eq!(scraped.candidates[0].composer, "W. H. Monk");
        assert_eq!(scraped.candidates[0].popularity_rank, 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn rerun_skips_completed_items() {
        let server = MockServer::start().await;
        let tmp = temp_root();

        mount_search(
            &server,
            "Abide",
            search_page(&[("EVENTIDE", "eventide", 1200)]),
        )
        .await;
        mount_detail(&server, "eventide", detail_page("EVENTIDE", "W. H. Monk")).await;

        let store = CheckpointStore::open(&tmp.join("checkpoint.db")).await.unwrap();
        let fetcher = RateLimitedFetcher::new(fetch_config(&server.uri(), &tmp)).unwrap();
        let orchestrator = ScrapeOrchestrator::new(fetcher, 3);
        let items = vec![CatalogueItem::from_input("Abide", "Abide with Me")];

        let first = orchestrator.run(&items, &store, &SilentProgress).await.unwrap();
        assert_eq!(first.processed, 1);

        let second = orchestrator.run(&items, &store, &SilentProgress).await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn keeps_top_candidates_by_popularity() {
        let server = MockServer::start().await;
        let tmp = temp_root();

        let cards: Vec<(String, String, u32)> = (0..7)
            .map(|i| (format!("TUNE {i}"), format!("tune_{i}"), (i as u32) * 100))
            .collect();
        let card_refs: Vec<(&str, &str, u32)> = cards
            .iter()
            .map(|(t, s, n)| (t.as_str(), s.as_str(), *n))
            .collect();
        mount_search(&server, "Crown", search_page(&card_refs)).await;
        for (_, slug, _) in &cards {
            mount_detail(&server, slug, detail_page(slug, "")).await;
        }

        let store = CheckpointStore::open(&tmp.join("checkpoint.db")).await.unwrap();
        let fetcher = RateLimitedFetcher::new(fetch_config(&server.uri(), &tmp)).unwrap();
        let orchestrator = ScrapeOrchestrator::new(fetcher, 3);
        let items = vec![CatalogueItem::from_input("Crown", "Crown Him")];

        orchestrator.run(&items, &store, &SilentProgress).await.unwrap();

        let record = store.get("crown_him").await.unwrap().unwrap();
        let scraped = record.scraped().unwrap();
        assert_eq!(scraped.total_search_results, 7);
        assert_eq!(scraped.candidates.len(), MAX_CANDIDATES_PER_ITEM);
        // Sorted by hymnal count descending, ranks 1..=5
        assert_eq!(scraped.candidates[0].slug, "tune_6");
        assert_eq!(scraped.candidates[4].slug, "tune_2");
        for (i, candidate) in scraped.candidates.iter().enumerate() {
            assert_eq!(candidate.popularity_rank, i + 1);
        }

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn failed_item_is_recorded_and_rest_continue() {
        let server = MockServer::start().await;
        let tmp = temp_root();

        // First item's search 404s; second item succeeds.
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param_contains("qu", "Broken"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        mount_search(
            &server,
            "Abide",
            search_page(&[("EVENTIDE", "eventide", 1200)]),
        )
        .await;
        mount_detail(&server, "eventide", detail_page("EVENTIDE", "")).await;

        let store = CheckpointStore::open(&tmp.join("checkpoint.db")).await.unwrap();
        let fetcher = RateLimitedFetcher::new(fetch_config(&server.uri(), &tmp)).unwrap();
        let orchestrator = ScrapeOrchestrator::new(fetcher, 3);
        let items = vec![
            CatalogueItem::from_input("Broken", "Broken Hymn"),
            CatalogueItem::from_input("Abide", "Abide with Me"),
        ];

        let report = orchestrator.run(&items, &store, &SilentProgress).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);

        let failed = store.get("broken_hymn").await.unwrap().unwrap();
        assert_eq!(failed.stage, Stage::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.reason.unwrap().contains("404"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn exhausted_retries_become_permanent() {
        let server = MockServer::start().await;
        let tmp = temp_root();

        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = CheckpointStore::open(&tmp.join("checkpoint.db")).await.unwrap();
        let fetcher = RateLimitedFetcher::new(fetch_config(&server.uri(), &tmp)).unwrap();
        let orchestrator = ScrapeOrchestrator::new(fetcher, 2);
        let items = vec![CatalogueItem::from_input("Broken", "Broken Hymn")];

        let first = orchestrator.run(&items, &store, &SilentProgress).await.unwrap();
        assert_eq!(first.failed, 1);
        assert!(first.permanently_failed.is_empty());

        let second = orchestrator.run(&items, &store, &SilentProgress).await.unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(second.permanently_failed.len(), 1);

        // Budget exhausted: no more network attempts, reported as permanent.
        let third = orchestrator.run(&items, &store, &SilentProgress).await.unwrap();
        assert_eq!(third.failed, 0);
        assert_eq!(third.permanently_failed.len(), 1);
        assert_eq!(third.permanently_failed[0].0, "broken_hymn");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn empty_search_marks_item_failed() {
        let server = MockServer::start().await;
        let tmp = temp_root();

        mount_search(&server, "Obscure", search_page(&[])).await;

        let store = CheckpointStore::open(&tmp.join("checkpoint.db")).await.unwrap();
        let fetcher = RateLimitedFetcher::new(fetch_config(&server.uri(), &tmp)).unwrap();
        let orchestrator = ScrapeOrchestrator::new(fetcher, 3);
        let items = vec![CatalogueItem::from_input("Obscure", "Obscure Hymn")];

        let report = orchestrator.run(&items, &store, &SilentProgress).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 1);

        let record = store.get("obscure_hymn").await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert!(record.reason.unwrap().contains("no tune candidates"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn detail_failure_degrades_to_card_only() {
        let server = MockServer::start().await;
        let tmp = temp_root();

        mount_search(
            &server,
            "Abide",
            search_page(&[("EVENTIDE", "eventide", 1200)]),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/tune/eventide"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = CheckpointStore::open(&tmp.join("checkpoint.db")).await.unwrap();
        let fetcher = RateLimitedFetcher::new(fetch_config(&server.uri(), &tmp)).unwrap();
        let orchestrator = ScrapeOrchestrator::new(fetcher, 3);
        let items = vec![CatalogueItem::from_input("Abide", "Abide with Me")];

        let report = orchestrator.run(&items, &store, &SilentProgress).await.unwrap();
        assert_eq!(report.processed, 1);

        let record = store.get("abide_with_me").await.unwrap().unwrap();
        let scraped = record.scraped().unwrap();
        assert_eq!(scraped.candidates.len(), 1);
        // Card data survives, detail enrichment is absent.
        assert_eq!(scraped.candidates[0].tune_title, "EVENTIDE");
        assert_eq!(scraped.candidates[0].num_hymnals, 1200);
        assert!(scraped.candidates[0].associated_texts.is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
