use crate::config::ExtractionConfig;
use crate::layout::{Line, LineKey};
use crate::pdf::PageLoader;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

static PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(.*?\)").expect("parenthetical pattern"));

/// Label variants: "Description and physical address", "... and physical
/// address of property".
fn is_label_line(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("and") && lower.contains("physical") && lower.contains("address")
}

/// Text following the address label, up to and including the first line
/// that carries a digit (the street number). `None` when there is no label.
pub fn harvest_address(lines: &BTreeMap<LineKey, Line>) -> Option<String> {
    let mut rows = lines.values().map(Line::text);
    rows.by_ref().find(|text| is_label_line(text))?;

    let mut harvested = Vec::new();
    for text in rows {
        if text.trim().is_empty() {
            continue;
        }
        let has_number = text.chars().any(|c| c.is_ascii_digit());
        harvested.push(text);
        if has_number {
            break;
        }
    }

    let joined = harvested.join(" ");
    Some(PARENTHETICAL.replace_all(&joined, "").trim().to_string())
}

/// Raw (un-normalized) address of the notice, or an empty string.
///
/// Only the first `address_pages` pages are tried.
pub async fn locate_address(pages: &PageLoader, cfg: &ExtractionConfig) -> String {
    for index in 0..cfg.address_pages.min(pages.page_count()) {
        let Ok(page) = pages.load(index).await else {
            continue;
        };
        if let Some(address) = harvest_address(&page.lines()) {
            debug!(page = index, address = %address, "Address label found");
            return address;
        }
    }
    String::new()
}
