//! Majority-vote aggregation of judge runs.
//!
//! Pure functions: votes in, verdicts out. All the audit fields on
//! [`AggregatedVerdict`] are derived here and nowhere else.

use tunebook_shared::config::TieBreak;
use tunebook_shared::error::{Result, TunebookError};
use tunebook_shared::types::{AggregatedVerdict, Vote};

/// Fold all votes for one candidate into a final verdict.
///
/// A strict majority decides; an exact even split falls to `tie_break`.
/// Zero votes is a caller bug and an error, never a silent verdict.
pub fn aggregate(candidate_slug: &str, votes: &[Vote], tie_break: TieBreak) -> Result<AggregatedVerdict> {
    let votes: Vec<&Vote> = votes
        .iter()
        .filter(|v| v.candidate_slug == candidate_slug)
        .collect();

    if votes.is_empty() {
        return Err(TunebookError::validation(format!(
            "no votes for candidate '{candidate_slug}'"
        )));
    }

    let total_votes = votes.len();
    let relevant_count = votes.iter().filter(|v| v.is_relevant).count();

    let is_relevant_final = if relevant_count * 2 == total_votes {
        tie_break == TieBreak::Relevant
    } else {
        relevant_count * 2 > total_votes
    };

    let (majority, minority): (Vec<&&Vote>, Vec<&&Vote>) = votes
        .iter()
        .partition(|v| v.is_relevant == is_relevant_final);

    let agreeing_votes = majority.len();
    let mean_confidence_of_majority = if majority.is_empty() {
        // Only reachable on a tie decided against every vote.
        0.0
    } else {
        majority.iter().map(|v| v.confidence).sum::<f64>() / majority.len() as f64
    };

    let minority_reasoning = if minority.is_empty() {
        None
    } else {
        Some(
            minority
                .iter()
                .map(|v| v.reasoning.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    };

    Ok(AggregatedVerdict {
        candidate_slug: candidate_slug.to_string(),
        is_relevant_final,
        agreeing_votes,
        total_votes,
        mean_confidence_of_majority,
        minority_reasoning,
    })
}

/// Aggregate every candidate, preserving the given candidate order.
pub fn aggregate_all(
    candidate_slugs: &[String],
    votes: &[Vote],
    tie_break: TieBreak,
) -> Result<Vec<AggregatedVerdict>> {
    candidate_slugs
        .iter()
        .map(|slug| aggregate(slug, votes, tie_break))
        .collect()
}
