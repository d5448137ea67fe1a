//! OpenRouter-backed judge using the chat completions API.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use tunebook_shared::error::{Result, TunebookError};
use tunebook_shared::types::{ScrapedItem, Vote};

use crate::prompt::{build_user_message, SYSTEM_PROMPT};
use crate::Judge;

// Trailing slash matters: Url::join drops the last path segment without it.
const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1/";
const SAMPLING_TEMPERATURE: f64 = 0.3;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// The JSON document the model is instructed to produce.
#[derive(Debug, Deserialize)]
struct JudgmentDocument {
    classifications: Vec<CandidateJudgment>,
}

#[derive(Debug, Deserialize)]
struct CandidateJudgment {
    candidate_slug: String,
    is_relevant: bool,
    confidence: f64,
    reasoning: String,
}

// ---------------------------------------------------------------------------
// OpenRouterJudge
// ---------------------------------------------------------------------------

/// Judge implementation calling OpenRouter chat completions.
pub struct OpenRouterJudge {
    client: reqwest::Client,
    api_base: Url,
    api_key: String,
    model: String,
}

impl OpenRouterJudge {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let api_base = Url::parse(DEFAULT_API_BASE)
            .map_err(|e| TunebookError::Judge(format!("bad API base: {e}")))?;
        Self::with_api_base(api_key, model, api_base)
    }

    /// Point the judge at a different API base (mock servers in tests).
    pub fn with_api_base(
        api_key: impl Into<String>,
        model: impl Into<String>,
        api_base: Url,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| TunebookError::Judge(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    async fn chat(&self, scraped: &ScrapedItem) -> Result<String> {
        let endpoint = self
            .api_base
            .join("chat/completions")
            .map_err(|e| TunebookError::Judge(format!("bad endpoint: {e}")))?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: SYSTEM_PROMPT.into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: build_user_message(scraped),
                },
            ],
            temperature: SAMPLING_TEMPERATURE,
        };

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TunebookError::Judge(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(TunebookError::Judge(format!("HTTP {status}: {snippet}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TunebookError::Judge(format!("invalid response envelope: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TunebookError::Judge("response carried no choices".into()))
    }
}

#[async_trait]
impl Judge for OpenRouterJudge {
    async fn judge(&self, scraped: &ScrapedItem, run_index: usize) -> Result<Vec<Vote>> {
        debug!(item = %scraped.item.id, run_index, model = %self.model, "judge call");
        let content = self.chat(scraped).await?;
        votes_from_content(&content, scraped, run_index)
    }
}

/// Parse and validate model output into one vote per candidate.
///
/// Validation is strict: a missing or duplicated candidate fails the run.
/// Unknown slugs are dropped with a warning since they cannot be attached
/// to any candidate. Confidence is clamped into [0, 1].
fn votes_from_content(content: &str, scraped: &ScrapedItem, run_index: usize) -> Result<Vec<Vote>> {
    let json = strip_code_fences(content);
    let document: JudgmentDocument = serde_json::from_str(json)
        .map_err(|e| TunebookError::Judge(format!("unparseable judgment: {e}")))?;

    let expected: HashSet<&str> = scraped.candidates.iter().map(|c| c.slug.as_str()).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut votes = Vec::with_capacity(scraped.candidates.len());

    for judgment in document.classifications {
        if !expected.contains(judgment.candidate_slug.as_str()) {
            warn!(slug = %judgment.candidate_slug, "judge voted on unknown candidate, dropping");
            continue;
        }
        if !seen.insert(judgment.candidate_slug.clone()) {
            return Err(TunebookError::Judge(format!(
                "duplicate judgment for candidate '{}'",
                judgment.candidate_slug
            )));
        }
        votes.push(Vote {
            candidate_slug: judgment.candidate_slug,
            is_relevant: judgment.is_relevant,
            confidence: judgment.confidence.clamp(0.0, 1.0),
            reasoning: judgment.reasoning,
            run_index,
        });
    }

    if seen.len() != expected.len() {
        let missing: Vec<&str> = scraped
            .candidates
            .iter()
            .map(|c| c.slug.as_str())
            .filter(|slug| !seen.contains(*slug))
            .collect();
        return Err(TunebookError::Judge(format!(
            "judgment missing candidates: {}",
            missing.join(", ")
        )));
    }

    // Keep votes in candidate order regardless of model ordering.
    votes.sort_by_key(|v| {
        scraped
            .candidates
            .iter()
            .position(|c| c.slug == v.candidate_slug)
            .unwrap_or(usize::MAX)
    });

    Ok(votes)
}

/// Models sometimes wrap JSON in markdown fences despite instructions.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end_matches('`').trim_end_matches("```").trim()
}
