//! Catalogue input loading.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use tunebook_shared::error::{Result, TunebookError};
use tunebook_shared::types::CatalogueItem;

/// One row of the input file.
#[derive(Debug, Deserialize)]
struct InputRow {
    /// Abbreviated name shown on the organ console.
    console_display: String,
    /// Human-readable hymn title used for searching.
    full_title: String,
}

/// Load the hymn catalogue from an `items.json` file.
///
/// Item ids are derived from titles, so two rows normalizing to the same
/// id would silently overwrite each other's checkpoints; that is rejected
/// up front.
pub fn load_catalogue(path: &Path) -> Result<Vec<CatalogueItem>> {
    let content = std::fs::read_to_string(path).map_err(|e| TunebookError::io(path, e))?;
    let rows: Vec<InputRow> = serde_json::from_str(&content).map_err(|e| {
        TunebookError::validation(format!("invalid input file {}: {e}", path.display()))
    })?;

    let mut items = Vec::with_capacity(rows.len());
    let mut seen = std::collections::HashSet::new();

    for row in &rows {
        let item = CatalogueItem::from_input(&row.console_display, &row.full_title);
        if item.id.is_empty() {
            return Err(TunebookError::validation(format!(
                "title '{}' normalizes to an empty id",
                row.full_title
            )));
        }
        if !seen.insert(item.id.clone()) {
            return Err(TunebookError::validation(format!(
                "duplicate item id '{}' (titles must be distinct after normalization)",
                item.id
            )));
        }
        items.push(item);
    }

    info!(count = items.len(), path = %path.display(), "loaded catalogue");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tunebook-input-test-{}.json",
            uuid::Uuid::now_v7()
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn loads_items_with_derived_ids() {
        let path = write_temp(
            r#"[
              {"console_display": "AMightyFortress", "full_title": "A Mighty Fortress"},
              {"console_display": "AbideWithMe", "full_title": "Abide with Me"}
            ]"#,
        );
        let items = load_catalogue(&path).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a_mighty_fortress");
        assert_eq!(items[1].id, "abide_with_me");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let path = write_temp(
            r#"[
              {"console_display": "A", "full_title": "Abide with Me"},
              {"console_display": "B", "full_title": "Abide, with Me!"}
            ]"#,
        );
        let err = load_catalogue(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate item id"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_malformed_json() {
        let path = write_temp("{not json");
        assert!(load_catalogue(&path).is_err());
        let _ = std::fs::remove_file(path);
    }
}
