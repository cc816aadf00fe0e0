use super::title_case;
use crate::config::ExtractionConfig;
use crate::layout::Page;
use crate::pdf::PageLoader;

/// Date text in the window below a "Closing date" label on this page.
///
/// The window is exclusive on both bounds.
pub fn harvest_closing_date(page: &Page, cfg: &ExtractionConfig) -> Option<String> {
    let words = page.words();
    let label_top = words
        .windows(2)
        .find(|pair| pair[0].text == "Closing" && pair[1].text == "date")
        .map(|pair| pair[0].top)?;

    let low = label_top + cfg.closing_window_min;
    let high = label_top + cfg.closing_window_max;
    let date = words
        .iter()
        .filter(|w| low < w.top && w.top < high)
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let date = date.trim();
    (!date.is_empty()).then(|| title_case(date))
}

/// First non-empty closing date found, scanning pages in order.
pub async fn locate_closing_date(pages: &PageLoader, cfg: &ExtractionConfig) -> String {
    for index in 0..pages.page_count() {
        let Ok(page) = pages.load(index).await else {
            continue;
        };
        if let Some(date) = harvest_closing_date(&page, cfg) {
            return date;
        }
    }
    String::new()
}
