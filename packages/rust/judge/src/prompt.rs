//! Prompt assembly for the relevance judge.

use std::fmt::Write;

use tunebook_shared::types::ScrapedItem;

/// System prompt framing the classification task and the evidence order.
pub const SYSTEM_PROMPT: &str = "\
You are an expert hymnologist and church music scholar. Your task is to classify
whether each candidate tune is genuinely associated with a given hymn.

CONTEXT:
We have an organ with a fixed set of built-in hymns. For each hymn we searched a
tune metadata site by title to find associated tunes. Because the search is
broad, many results are FALSE POSITIVES: tunes that happen to match some words
in the hymn title but are not actually musical settings of that hymn text.

YOUR JOB:
For each tune candidate, decide if it is a genuine musical setting of the hymn
(is_relevant = true) or a false positive (is_relevant = false).

KEY EVIDENCE TO USE:
1. associated_texts: if the hymn title (or a close variant) appears in the
   tune's associated texts, the tune is almost certainly relevant.
2. instance_percentages: if the hymn title appears with a significant
   percentage, this confirms the tune is commonly used with that hymn.
3. used_with_text (from the search card): states which text the tune is
   primarily associated with. If it names the hymn, that's strong evidence.
4. Tune name vs hymn title: some tunes share a name or obvious link with the
   hymn (e.g. \"EIN FESTE BURG\" for \"A Mighty Fortress\").
5. Meter compatibility: a meter that could plausibly fit the hymn is
   supporting (but not conclusive) evidence.
6. Your own knowledge of hymn repertoire.

GUIDELINES:
- Be fairly GENEROUS: if a tune is a recognised (even if uncommon) setting of
  the hymn, mark it relevant.
- But filter out obvious noise: a tune whose associated texts and percentages
  show it is primarily used with a COMPLETELY DIFFERENT hymn is a false
  positive.
- When in doubt, lean towards relevant if there is any credible evidence.

OUTPUT FORMAT:
Respond with a single JSON object, no prose and no markdown fences:
{\"classifications\": [{\"candidate_slug\": \"...\", \"is_relevant\": true,
\"confidence\": 0.9, \"reasoning\": \"1-3 sentences citing the evidence\"}]}
Include exactly one entry per candidate, using the candidate_slug values given.
confidence is a number between 0 and 1.";

/// Render all candidate evidence for one item into the user message.
pub fn build_user_message(scraped: &ScrapedItem) -> String {
    let mut msg = String::new();
    let _ = writeln!(
        msg,
        "# Hymn: \"{}\" (key: {})",
        scraped.item.title, scraped.item.id
    );
    let _ = writeln!(
        msg,
        "Total search results: {}",
        scraped.total_search_results
    );
    let _ = writeln!(
        msg,
        "We kept the top {} tunes by popularity.\n\n---\n",
        scraped.candidates.len()
    );

    for (i, candidate) in scraped.candidates.iter().enumerate() {
        let _ = writeln!(msg, "## Tune {}: {}", i + 1, candidate.tune_title);
        let _ = writeln!(msg, "- candidate_slug: `{}`", candidate.slug);
        let _ = writeln!(msg, "- composer: {}", or_dash(&candidate.composer));
        let _ = writeln!(msg, "- meter: {}", or_dash(&candidate.meter));
        let _ = writeln!(msg, "- key: {}", or_dash(&candidate.key));
        let _ = writeln!(msg, "- num_hymnals: {}", candidate.num_hymnals);

        if !candidate.used_with_text.is_empty() {
            let _ = writeln!(
                msg,
                "- used_with_text (search card): {}",
                candidate.used_with_text
            );
        }
        if !candidate.associated_texts.is_empty() {
            let names: Vec<&str> = candidate
                .associated_texts
                .iter()
                .map(|t| t.name.as_str())
                .collect();
            let _ = writeln!(msg, "- associated_texts: {}", names.join("; "));
        }
        if !candidate.instance_percentages.is_empty() {
            let shares: Vec<String> = candidate
                .instance_percentages
                .iter()
                .map(|s| format!("{} ({:.1}%)", s.text_name, s.percentage))
                .collect();
            let _ = writeln!(msg, "- instance_percentages: {}", shares.join("; "));
        }
        if !candidate.notes.is_empty() {
            let _ = writeln!(msg, "- notes: {}", truncate(&candidate.notes, 400));
        }
        let _ = writeln!(msg);
    }

    let _ = writeln!(msg, "---");
    let _ = write!(
        msg,
        "For EACH tune above, classify it as relevant or not relevant to the \
         hymn \"{}\".",
        scraped.item.title
    );

    msg
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() { "—" } else { value }
}

/// Keep long notes from blowing up the context window.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}…")
    }
}
