//! HTML parsing for the two tune metadata page types.
//!
//! Search results pages yield [`TuneCard`]s; detail pages yield a
//! [`TuneDetail`]. Both parsers are tolerant: missing fields come back
//! empty rather than failing the page, and the caller decides whether
//! an empty result is an error.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::warn;

use tunebook_shared::types::{InstanceShare, MediaLinks, TextRef};

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

fn tune_slug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/tune/([a-z0-9_]+)").expect("valid regex"))
}

fn text_slug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/text/([a-z0-9_]+)").expect("valid regex"))
}

fn published_count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Published in (\d[\d,]*) hymnals?").expect("valid regex"))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

// ---------------------------------------------------------------------------
// Search results page
// ---------------------------------------------------------------------------

/// One tune result card from a search page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TuneCard {
    pub title: String,
    /// Canonical slug extracted from the card's `/tune/{slug}` link.
    pub tune_slug: String,
    pub meter: String,
    /// "Appears in N hymnals" count from the card.
    pub num_hymnals: u32,
    pub composer: String,
    pub tune_key: String,
    pub incipit: String,
    pub used_with_text: String,
}

/// Parse a search results page into its tune cards.
///
/// Two layouts exist. A combined search groups cards under headings
/// ("Texts", "Tunes", "Instances", ...); only cards in the "Tunes" group
/// count. A tune-filtered search has no group headers and every normal
/// card is a tune. Presence of any group-head card picks the layout.
pub fn parse_search_results(html: &str) -> Vec<TuneCard> {
    let doc = Html::parse_document(html);

    let grouphead_sel = sel("div.resultcard-grouphead");
    let has_groups = doc.select(&grouphead_sel).next().is_some();

    let mut cards = Vec::new();

    if has_groups {
        let card_sel = sel("div.resultcard");
        let h2_sel = sel("h2");
        let mut current_group = String::new();

        for card in doc.select(&card_sel) {
            let classes: Vec<&str> = card.value().classes().collect();
            if classes.contains(&"resultcard-grouphead") {
                current_group = card
                    .select(&h2_sel)
                    .next()
                    .map(element_text)
                    .unwrap_or_default();
                continue;
            }
            if classes.contains(&"resultcard-tiny") {
                continue;
            }
            if current_group != "Tunes" {
                continue;
            }
            if let Some(tune) = parse_tune_card(card) {
                cards.push(tune);
            }
        }
    } else {
        let card_sel = sel("div.resultcard.resultcard-normal");
        for card in doc.select(&card_sel) {
            if let Some(tune) = parse_tune_card(card) {
                cards.push(tune);
            }
        }
    }

    cards
}

fn parse_tune_card(card: ElementRef<'_>) -> Option<TuneCard> {
    let title_sel = sel("h2 > a");
    let title_link = card.select(&title_sel).next()?;

    let title = element_text(title_link);
    let href = title_link.value().attr("href").unwrap_or("");
    let tune_slug = tune_slug_re()
        .captures(href)
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    // Field spans carry a label prefix like "Meter: "; strip it off.
    let span_sel = sel("span[data-fieldname]");
    let label_sel = sel("b.fieldLabel");
    let mut fields = std::collections::HashMap::new();
    for span in card.select(&span_sel) {
        let Some(name) = span.value().attr("data-fieldname") else {
            continue;
        };
        let mut text = element_text(span);
        if let Some(label) = span.select(&label_sel).next() {
            text = text
                .replacen(element_text(label).as_str(), "", 1)
                .trim()
                .to_string();
        }
        fields.insert(name.to_string(), text);
    }

    let num_hymnals = fields
        .get("total")
        .and_then(|t| {
            static RE: OnceLock<Regex> = OnceLock::new();
            let digits = RE.get_or_init(|| Regex::new(r"(\d+)").expect("valid regex"));
            digits.captures(t).map(|c| c[1].to_string())
        })
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);

    let field = |name: &str| fields.get(name).cloned().unwrap_or_default();

    Some(TuneCard {
        title,
        tune_slug,
        meter: field("meter"),
        num_hymnals,
        composer: field("Composer and/or Arranger"),
        tune_key: field("tuneKey"),
        incipit: field("incipit"),
        used_with_text: field("usedWithText"),
    })
}

// ---------------------------------------------------------------------------
// Tune detail page
// ---------------------------------------------------------------------------

/// Full metadata from a `/tune/{slug}` detail page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TuneDetail {
    pub title: String,
    pub composer: String,
    pub meter: String,
    pub incipit: String,
    pub key: String,
    pub copyright: String,
    /// "Published in N hymnals" count from the above-fold area.
    pub num_hymnals: u32,
    pub associated_texts: Vec<TextRef>,
    pub instance_percentages: Vec<InstanceShare>,
    pub notes: String,
    pub media: MediaLinks,
}

/// Parse a tune detail page.
pub fn parse_tune_detail(html: &str) -> TuneDetail {
    let doc = Html::parse_document(html);
    let mut detail = TuneDetail::default();

    if let Some(h1) = doc.select(&sel("h1")).next() {
        detail.title = element_text(h1);
    }

    parse_info_table(&doc, &mut detail);
    parse_above_fold(&doc, &mut detail);
    parse_associated_texts(&doc, &mut detail);

    if let Some(notes) = doc.select(&sel("#notes_content")).next() {
        detail.notes = notes
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
    }

    parse_instance_percentages(&doc, &mut detail);

    detail
}

/// The `#at_tuneinfo` label/value table.
fn parse_info_table(doc: &Html, detail: &mut TuneDetail) {
    let Some(section) = doc.select(&sel("#at_tuneinfo")).next() else {
        return;
    };
    let row_sel = sel("tr.result-row");
    let label_sel = sel("span.hy_infoLabel");
    let item_sel = sel("span.hy_infoItem");

    for row in section.select(&row_sel) {
        let (Some(label_el), Some(item_el)) =
            (row.select(&label_sel).next(), row.select(&item_sel).next())
        else {
            continue;
        };
        let label = element_text(label_el);
        let label = label.trim_end_matches(':');
        let value = element_text(item_el);

        match label {
            "Title" => detail.title = value,
            "Composer" => detail.composer = value,
            "Meter" => detail.meter = value,
            "Incipit" => detail.incipit = value,
            "Key" => detail.key = value,
            "Copyright" => detail.copyright = value,
            _ => {}
        }
    }
}

/// Hymnal count and primary media links from `#authority_above_fold`.
fn parse_above_fold(doc: &Html, detail: &mut TuneDetail) {
    let Some(above) = doc.select(&sel("#authority_above_fold")).next() else {
        return;
    };

    let text = above.text().collect::<Vec<_>>().join(" ");
    if let Some(caps) = published_count_re().captures(&text) {
        detail.num_hymnals = caps[1].replace(',', "").parse().unwrap_or(0);
    }

    // Only the first link of each kind counts as the primary one.
    let link_sel = sel("a[href*='media/fetch']");
    for a in above.select(&link_sel) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let href = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("https://hymnary.org{href}")
        };
        let link_text = element_text(a).to_lowercase();

        if link_text.contains("midi") && detail.media.midi_url.is_none() {
            detail.media.midi_url = Some(href);
        } else if link_text.contains("pdf") && detail.media.pdf_url.is_none() {
            detail.media.pdf_url = Some(href);
        } else if link_text.contains("recording") && detail.media.recording_url.is_none() {
            detail.media.recording_url = Some(href);
        }
    }
}

fn parse_associated_texts(doc: &Html, detail: &mut TuneDetail) {
    let Some(section) = doc.select(&sel("#at_texts")).next() else {
        return;
    };
    let link_sel = sel("a");

    for link in section.select(&link_sel) {
        let href = link.value().attr("href").unwrap_or("");
        if !href.contains("/text/") {
            continue;
        }
        let name = element_text(link);
        if name.is_empty() || name == "Go to text page..." {
            continue;
        }
        let slug = text_slug_re()
            .captures(href)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        detail.associated_texts.push(TextRef { name, slug });
    }
}

/// The page embeds `var instancePercentages = [["Text name", 56.27, "slug"], ...]`
/// in an inline script; it is the only place the text/tune pairing share
/// is published.
fn parse_instance_percentages(doc: &Html, detail: &mut TuneDetail) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let array_re = RE.get_or_init(|| {
        Regex::new(r"(?s)var instancePercentages\s*=\s*(\[.+?\]);").expect("valid regex")
    });

    let script_sel = sel("script");
    for script in doc.select(&script_sel) {
        let body = script.text().collect::<String>();
        if !body.contains("instancePercentages") {
            continue;
        }
        let Some(caps) = array_re.captures(&body) else {
            break;
        };
        match serde_json::from_str::<serde_json::Value>(&caps[1]) {
            Ok(serde_json::Value::Array(rows)) => {
                for row in rows {
                    let (Some(name), Some(pct)) = (
                        row.get(0).and_then(|v| v.as_str()),
                        row.get(1).and_then(|v| v.as_f64()),
                    ) else {
                        continue;
                    };
                    detail.instance_percentages.push(InstanceShare {
                        text_name: name.to_string(),
                        percentage: pct,
                    });
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "unparseable instancePercentages array"),
        }
        break;
    }
}
