// src/heuristics/mod.rs

mod address;
mod closing_date;
mod description;
mod normalize;

pub use address::locate_address;
pub use closing_date::locate_closing_date;
pub use description::locate_description;
pub use normalize::normalize_address;

use crate::config::ExtractionConfig;
use crate::llm_extract::Summarize;
use crate::pdf::PageLoader;
use serde::Serialize;

/// The fields recovered from one notice PDF.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NoticeFields {
    pub address: String,
    pub title: String,
    pub description: String,
    pub closing_date: String,
}

impl NoticeFields {
    /// How many fields were successfully extracted.
    pub fn coverage(&self) -> (usize, usize) {
        let filled = [&self.address, &self.description, &self.closing_date]
            .iter()
            .filter(|v| !v.is_empty())
            .count();
        (filled, 3)
    }
}

/// Run all three locators over one document.
///
/// `doc_id` keys the summary cache.
pub async fn extract_notice(
    pages: &PageLoader,
    doc_id: &str,
    cfg: &ExtractionConfig,
    summarizer: &dyn Summarize,
) -> NoticeFields {
    let raw_address = locate_address(pages, cfg).await;
    let address = if raw_address.is_empty() {
        raw_address
    } else {
        normalize_address(&raw_address, &cfg.locality)
    };
    let title = title_of(&address);
    let description = locate_description(pages, doc_id, cfg, summarizer).await;
    let closing_date = locate_closing_date(pages, cfg).await;

    NoticeFields {
        address,
        title,
        description,
        closing_date,
    }
}

/// The street part of an address: everything before the first comma.
pub fn title_of(address: &str) -> String {
    address.split(',').next().unwrap_or_default().trim().to_string()
}

/// Capitalize each whitespace-separated word and lowercase the rest of it.
pub fn title_case(words: &str) -> String {
    words
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layout::{Page, Token};
    use crate::pdf::tests::FakePages;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn page(tokens: &[(&str, f64, f64)]) -> Page {
        Page {
            tokens: tokens
                .iter()
                .map(|&(text, x0, top)| Token::new(text, x0, top))
                .collect(),
            width: 595.0,
            height: 842.0,
        }
    }

    /// Lay out `lines` as tokens, one line every 20 units starting at `top`.
    pub(crate) fn text_page(top: f64, lines: &[&str]) -> Page {
        let mut tokens = Vec::new();
        for (row, line) in lines.iter().enumerate() {
            let y = top + row as f64 * 20.0;
            for (col, word) in line.split_whitespace().enumerate() {
                tokens.push(Token::new(word, 60.0 + col as f64 * 40.0, y));
            }
        }
        Page {
            tokens,
            width: 595.0,
            height: 842.0,
        }
    }

    pub(crate) fn loader(pages: Vec<Page>) -> PageLoader {
        PageLoader::new(Arc::new(FakePages::new(pages)), Duration::from_secs(5))
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("123 LONG street"), "123 Long Street");
        assert_eq!(title_case("  12   jUNE 2025 "), "12 June 2025");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn test_title_of() {
        assert_eq!(title_of("12 Main Road, Observatory, Cape Town"), "12 Main Road");
        assert_eq!(title_of(""), "");
    }

    #[test]
    fn test_coverage() {
        let fields = NoticeFields {
            address: "1 Long Street, Cape Town".into(),
            title: "1 Long Street".into(),
            closing_date: "1 June 2025".into(),
            ..Default::default()
        };
        assert_eq!(fields.coverage(), (2, 3));
    }
}
