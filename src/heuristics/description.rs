use crate::config::ExtractionConfig;
use crate::layout::Page;
use crate::llm_extract::Summarize;
use crate::pdf::PageLoader;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

const START_LABEL: &str = "purpose of the application";
const START_WORD: &str = "Purpose";
const STOP_WORD: &str = "Enquiries";

static SMART_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\u{201C}.*?\u{201D}").expect("quoted span pattern"));
static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[.*?\]|\(.*?\)").expect("bracket pattern"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwww\.\S+").expect("url pattern"));

/// Capture state carried from one page to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Capture {
    /// Start label not seen yet.
    Idle,
    /// Collecting text below `start_top`; `0.0` on continuation pages.
    Active { start_top: f64 },
    /// Stop label found, nothing more to read.
    Done,
}

/// Scan one page, returning the next state and the region text captured on
/// this page (if any).
pub fn scan_page(page: &Page, state: Capture, cfg: &ExtractionConfig) -> (Capture, Option<String>) {
    let words = page.words();
    let mut state = state;

    for (i, word) in words.iter().enumerate() {
        match state {
            Capture::Idle if word.text == START_WORD && i + 3 < words.len() => {
                let phrase = words[i..i + 4]
                    .iter()
                    .map(|w| w.text.to_lowercase())
                    .collect::<Vec<_>>()
                    .join(" ");
                if phrase.contains(START_LABEL) {
                    state = Capture::Active {
                        start_top: word.top,
                    };
                }
            }
            Capture::Active { start_top } if word.text == STOP_WORD => {
                let text = page.region_text(
                    cfg.region_x0,
                    start_top + cfg.capture_offset,
                    cfg.region_x1,
                    word.top - cfg.enquiries_margin,
                );
                return (Capture::Done, Some(text));
            }
            _ => {}
        }
    }

    match state {
        Capture::Active { start_top } => {
            let text = page.region_text(
                cfg.region_x0,
                start_top + cfg.capture_offset,
                cfg.region_x1,
                page.height,
            );
            (Capture::Active { start_top: 0.0 }, Some(text))
        }
        other => (other, None),
    }
}

/// Raw description text from up to `max_description_pages` pages.
///
/// Pages that fail or time out are skipped; capture state carries over.
pub async fn capture_description(pages: &PageLoader, cfg: &ExtractionConfig) -> String {
    let mut state = Capture::Idle;
    let mut raw = String::new();

    for index in 0..cfg.max_description_pages.min(pages.page_count()) {
        let page = match pages.load(index).await {
            Ok(page) => page,
            Err(e) => {
                debug!(page = index, error = %e, "Description page unavailable");
                continue;
            }
        };

        let (next, text) = scan_page(&page, state, cfg);
        if let Some(text) = text {
            raw.push('\n');
            raw.push_str(&text);
        }
        state = next;
        if state == Capture::Done {
            break;
        }
    }

    raw
}

/// Strip layout noise, references and boilerplate from captured text.
pub fn clean_description(raw: &str, cfg: &ExtractionConfig) -> String {
    let text = raw.replace('\n', ". ");
    let text = SMART_QUOTED.replace_all(&text, "");
    let mut text = text.replace(":.", ":");
    if let Some(pos) = text.find(&cfg.truncate_marker) {
        text.truncate(pos);
    }

    let text = BRACKETED.replace_all(&text, "");
    let text = URL.replace_all(&text, "");
    let text = match Regex::new(&cfg.reference_pattern) {
        Ok(reference) => reference.replace_all(&text, "").into_owned(),
        Err(e) => {
            warn!(pattern = %cfg.reference_pattern, error = %e, "Invalid reference pattern");
            text.into_owned()
        }
    };

    let mut text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    for fragment in &cfg.boilerplate {
        text = text.replace(fragment.as_str(), "");
    }
    while text.contains(". .") || text.contains("..") {
        text = text.replace(". .", ".").replace("..", ".");
    }

    text.trim_start_matches(['.', ' ']).trim().to_string()
}

/// Summarized purpose of the application, or an empty string.
pub async fn locate_description(
    pages: &PageLoader,
    doc_id: &str,
    cfg: &ExtractionConfig,
    summarizer: &dyn Summarize,
) -> String {
    let raw = capture_description(pages, cfg).await;
    let cleaned = clean_description(&raw, cfg);
    if cleaned.is_empty() {
        return String::new();
    }

    match summarizer.summarize(&cleaned, doc_id).await {
        Ok(summary) => summary,
        Err(e) => {
            warn!(doc_id = %doc_id, error = %e, "Summarizer failed");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::heuristics::tests::{loader, page};
    use crate::pdf::tests::FakePages;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Echoes the text back, remembering what it was asked.
    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Summarize for Echo {
        async fn summarize(&self, text: &str, id: &str) -> Result<String, BoxError> {
            self.seen
                .lock()
                .unwrap()
                .push((text.to_string(), id.to_string()));
            Ok(text.to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl Summarize for Failing {
        async fn summarize(&self, _text: &str, _id: &str) -> Result<String, BoxError> {
            Err("quota exceeded".into())
        }
    }

    fn purpose_label(top: f64) -> Vec<(&'static str, f64, f64)> {
        vec![
            ("Purpose", 60.0, top),
            ("of", 110.0, top),
            ("the", 130.0, top),
            ("application", 160.0, top),
        ]
    }

    #[test]
    fn test_single_page_bounded_by_enquiries() {
        let mut tokens = purpose_label(100.0);
        tokens.extend([
            ("Rezoning", 60.0, 120.0),
            ("to", 120.0, 120.0),
            ("GB7", 140.0, 120.0),
            ("margin", 10.0, 130.0),
            ("Departure", 60.0, 140.0),
            ("Enquiries", 60.0, 200.0),
            ("J", 140.0, 200.0),
        ]);
        let cfg = ExtractionConfig::default();
        let (state, text) = scan_page(&page(&tokens), Capture::Idle, &cfg);
        assert_eq!(state, Capture::Done);
        assert_eq!(text.as_deref(), Some("Rezoning to GB7\nDeparture"));
    }

    #[test]
    fn test_missing_enquiries_spills_to_next_page() {
        let mut first = purpose_label(700.0);
        first.push(("Subdivision", 60.0, 720.0));
        let cfg = ExtractionConfig::default();

        let (state, text) = scan_page(&page(&first), Capture::Idle, &cfg);
        assert_eq!(state, Capture::Active { start_top: 0.0 });
        assert_eq!(text.as_deref(), Some("Subdivision"));

        let second = page(&[
            ("header", 60.0, 5.0),
            ("into", 60.0, 30.0),
            ("two", 100.0, 30.0),
            ("portions", 140.0, 30.0),
            ("Enquiries", 60.0, 80.0),
        ]);
        let (state, text) = scan_page(&second, state, &cfg);
        assert_eq!(state, Capture::Done);
        assert_eq!(text.as_deref(), Some("into two portions"));
    }

    #[test]
    fn test_partial_label_does_not_start_capture() {
        let tokens = [
            ("Purpose", 60.0, 100.0),
            ("of", 110.0, 100.0),
            ("this", 130.0, 100.0),
            ("notice", 160.0, 100.0),
            ("Enquiries", 60.0, 200.0),
        ];
        let cfg = ExtractionConfig::default();
        assert_eq!(scan_page(&page(&tokens), Capture::Idle, &cfg), (Capture::Idle, None));
    }

    #[test]
    fn test_clean_description() {
        let cfg = ExtractionConfig::default();
        let raw = "\nApplication for \u{201C}consent use\u{201D} (regulation 4) to operate a guest house:\n\
                   see www.capetown.gov.za/notices ref No.T12/345 [draft].\n\
                   Making progress possible. Together.\n\
                   Viewing of Application Documents at the district office";
        assert_eq!(
            clean_description(raw, &cfg),
            "Application for to operate a guest house: see ref .ogether."
        );
    }

    #[test]
    fn test_clean_empty() {
        assert_eq!(clean_description("\n\n", &ExtractionConfig::default()), "");
    }

    #[tokio::test]
    async fn test_locate_description_summarizes_with_doc_id() {
        let mut tokens = purpose_label(100.0);
        tokens.extend([("Rezoning", 60.0, 120.0), ("Enquiries", 60.0, 200.0)]);
        let pages = loader(vec![page(&tokens)]);
        let echo = Echo::default();

        let description =
            locate_description(&pages, "email-42", &ExtractionConfig::default(), &echo).await;
        assert_eq!(description, "Rezoning");
        assert_eq!(
            echo.seen.lock().unwrap().as_slice(),
            &[("Rezoning".to_string(), "email-42".to_string())]
        );
    }

    #[tokio::test]
    async fn test_no_label_skips_summarizer() {
        let pages = loader(vec![page(&[("Nothing", 60.0, 100.0)])]);
        let echo = Echo::default();
        let description =
            locate_description(&pages, "email-1", &ExtractionConfig::default(), &echo).await;
        assert_eq!(description, "");
        assert!(echo.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summarizer_failure_leaves_description_empty() {
        let mut tokens = purpose_label(100.0);
        tokens.extend([("Rezoning", 60.0, 120.0), ("Enquiries", 60.0, 200.0)]);
        let pages = loader(vec![page(&tokens)]);
        let description =
            locate_description(&pages, "email-2", &ExtractionConfig::default(), &Failing).await;
        assert_eq!(description, "");
    }

    #[tokio::test]
    async fn test_timed_out_page_does_not_stop_later_pages() {
        let first = page(&[
            ("Purpose", 60.0, 700.0),
            ("of", 110.0, 700.0),
            ("the", 130.0, 700.0),
            ("application", 160.0, 700.0),
            ("Consolidation", 60.0, 720.0),
        ]);
        let hanging = page(&[("never", 60.0, 30.0)]);
        let last = page(&[("of", 60.0, 30.0), ("erven", 90.0, 30.0), ("Enquiries", 60.0, 90.0)]);

        let mut fake = FakePages::new(vec![first, hanging, last]);
        fake.slow.insert(1);
        let pages = crate::pdf::PageLoader::new(Arc::new(fake), Duration::from_millis(50));

        let raw = capture_description(&pages, &ExtractionConfig::default()).await;
        assert_eq!(raw, "\nConsolidation\nof erven");
    }

    #[tokio::test]
    async fn test_capture_stops_at_page_limit() {
        let mut first = purpose_label(700.0);
        first.push(("Start", 60.0, 720.0));
        let filler = |word: &'static str| page(&[(word, 60.0, 30.0)]);
        let pages = loader(vec![
            page(&first),
            filler("p2"),
            filler("p3"),
            filler("p4"),
            filler("p5"),
            filler("p6"),
            filler("p7"),
        ]);
        let raw = capture_description(&pages, &ExtractionConfig::default()).await;
        // more than two continuation pages: each is captured from its top
        assert_eq!(raw, "\nStart\np2\np3\np4\np5\np6");
    }
}
