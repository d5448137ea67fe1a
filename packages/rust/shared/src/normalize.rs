//! Title normalization for search queries and stable item ids.

use std::sync::OnceLock;

use regex::Regex;

fn variant_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*-\s*[AB]$").expect("valid regex"))
}

fn punctuation() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[!?,;:"'()]"#).expect("valid regex"))
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s-]").expect("valid regex"))
}

/// Clean a hymn title for use as a search query.
///
/// Strips `- A` / `- B` variant suffixes, removes punctuation that would
/// confuse search, and collapses whitespace.
///
/// ```
/// use tunebook_shared::normalize::normalize_title;
/// assert_eq!(normalize_title("Away in a Manger - A"), "Away in a Manger");
/// assert_eq!(
///     normalize_title("Hark! The Herald Angels Sing"),
///     "Hark The Herald Angels Sing"
/// );
/// ```
pub fn normalize_title(title: &str) -> String {
    let stripped = variant_suffix().replace(title.trim(), "");
    let cleaned = punctuation().replace_all(&stripped, "");
    whitespace().replace_all(&cleaned, " ").trim().to_string()
}

/// Convert a hymn title to the `+`-separated query string the search
/// endpoint expects.
pub fn title_to_search_query(title: &str) -> String {
    normalize_title(title).replace(' ', "+")
}

/// Derive the stable, filesystem-safe item id from a hymn title.
pub fn item_id_from_title(title: &str) -> String {
    let safe = unsafe_chars().replace_all(title.trim(), "");
    whitespace()
        .replace_all(&safe, "_")
        .trim_matches('_')
        .to_lowercase()
}
