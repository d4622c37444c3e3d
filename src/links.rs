//! Extracts file download links from a saved clearinghouse HTML page.
//!
//! The portal GUI renders a page of anchor tags once a query is set up; the
//! page is saved and handed to this extractor, which keeps every href that
//! contains the marker substring (`download` for clearinghouse exports).

use scraper::{Html, Selector};

pub const DEFAULT_MARKER: &str = "download";

/// Returns every anchor href containing `marker`, in document order.
/// No deduplication is applied.
pub fn extract_download_links(html: &str, marker: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").expect("static selector");

    document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.contains(marker))
        .map(str::to_string)
        .collect()
}
