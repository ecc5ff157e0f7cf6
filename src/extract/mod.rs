//! Card extraction strategies, one per known set page layout.
//!
//! The layout is chosen from a page-version marker ([`detect_layout`]): the
//! embedded `__NEXT_DATA__` payload when it carries the term list, otherwise
//! whichever DOM structure is present. JSON the page fetched from the web
//! API is read separately by [`captured_entries`].

mod captured;
mod dom_layout;
mod next_data;

pub use captured::{captured_entries, is_card_payload};
pub use dom_layout::{DomLayout, LEGACY, TERM_LIST};
pub use next_data::NextDataLayout;

use crate::browser::{dom, PageDriver};
use crate::error::Result;
use crate::models::Card;
use crate::throttle::pause;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A parsed entry, or why the entry at that position could not be read.
pub type EntryResult = std::result::Result<Card, String>;

#[async_trait]
pub trait CardLayout: Send + Sync {
    fn version(&self) -> &'static str;

    /// Whether this layout's marker is present and carries cards.
    fn detect(&self, html: &str) -> bool;

    /// Number of card entries currently on the page.
    fn entry_count(&self, html: &str) -> usize;

    /// Every entry in display order.
    fn parse_entries(&self, html: &str) -> Vec<EntryResult>;

    /// Whether more cards can appear after "See all", "load more" or scrolling.
    fn paginated(&self) -> bool {
        false
    }

    /// Waits until more than `seen` entries are rendered. Returns the latest
    /// count, which equals `seen` if nothing new arrived within `timeout`.
    async fn wait_for_render(
        &self,
        driver: &dyn PageDriver,
        seen: usize,
        timeout: Duration,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut latest = seen;
        loop {
            if let Ok(html) = driver.html().await {
                latest = self.entry_count(&html).max(latest);
                if latest > seen {
                    return Ok(latest);
                }
            }
            if Instant::now() >= deadline {
                return Ok(latest);
            }
            pause(poll, cancel).await?;
        }
    }
}

static NEXT_DATA: NextDataLayout = NextDataLayout;

/// Known layouts, most reliable first.
pub fn layouts() -> [&'static dyn CardLayout; 3] {
    [&NEXT_DATA, &TERM_LIST, &LEGACY]
}

pub fn detect_layout(html: &str) -> Option<&'static dyn CardLayout> {
    layouts().into_iter().find(|layout| layout.detect(html))
}

/// Polls until some layout recognises rendered cards, or `timeout` passes.
pub async fn wait_for_layout(
    driver: &dyn PageDriver,
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<Option<&'static dyn CardLayout>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(html) = driver.html().await {
            if let Some(layout) = detect_layout(&html) {
                log::debug!("Detected set page layout: {}", layout.version());
                return Ok(Some(layout));
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        pause(poll, cancel).await?;
    }
}

/// Set title as shown on the page.
pub fn page_title(html: &str) -> Option<String> {
    dom::first_text(html, r#"h1, [class*="SetTitle"]"#).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_prefers_embedded_data() {
        let html = r#"<html><body>
            <div class="SetPageTerms-term">
              <div class="SetPageTerm-wordText">dom</div>
              <div class="SetPageTerm-definitionText">layout</div>
            </div>
            <script id="__NEXT_DATA__" type="application/json">
              {"props":{"pageProps":{"studiableItem":[{"word":"a","definition":"b"}]}}}
            </script></body></html>"#;
        assert_eq!(detect_layout(html).map(|l| l.version()), Some("next-data"));
    }

    #[test]
    fn test_detect_falls_back_to_dom() {
        let html = r#"<script id="__NEXT_DATA__" type="application/json">{"props":{}}</script>
            <div class="SetPageTerms-term">
              <div class="SetPageTerm-wordText">dom</div>
              <div class="SetPageTerm-definitionText">layout</div>
            </div>"#;
        assert_eq!(detect_layout(html).map(|l| l.version()), Some("term-list"));

        let legacy = r#"<div class="term"><span class="qWord">a</span><span class="qDef">b</span></div>"#;
        assert_eq!(detect_layout(legacy).map(|l| l.version()), Some("legacy"));

        assert!(detect_layout("<p>Loading…</p>").is_none());
    }

    #[test]
    fn test_page_title() {
        assert_eq!(
            page_title("<h1> Cell Biology </h1>").as_deref(),
            Some("Cell Biology")
        );
    }
}
