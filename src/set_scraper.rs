//! Extracts every card of one set, in display order.

use crate::auth::SessionLease;
use crate::browser::{dom, PageDriver};
use crate::config::SiteConfig;
use crate::error::{Error, Result, Unavailable};
use crate::extract::{captured_entries, detect_layout, page_title, wait_for_layout, CardLayout, EntryResult};
use crate::models::{CardEntry, Completeness, PartialReason, ScrapeResult, SetMetadata, UNTITLED_SET};
use crate::throttle::Throttle;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EXPAND_BUTTON: &str = "button";
const SEE_ALL: &str = "See all";
const LOAD_MORE: &str = "Load more";
const NOT_FOUND_MESSAGE: &str = "Page not found";
const PRIVATE_MESSAGE: &str = "This set is private";

#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    pub site: SiteConfig,
    /// Bounded wait for the first cards to render.
    pub render_timeout: Duration,
    /// Bounded wait for each further batch of lazy-loaded cards.
    pub batch_wait: Duration,
    pub poll_interval: Duration,
    pub max_scroll_rounds: usize,
}

/// Fails when the tab was sent to the login page or a 404 route.
fn check_url(site: &SiteConfig, id: &str, url: &str) -> Result<()> {
    if site.is_login_url(url) {
        return Err(Error::SessionExpired);
    }
    if url.contains("/404") {
        return Err(Error::SetUnavailable {
            id: id.to_string(),
            reason: Unavailable::NotFound,
        });
    }
    Ok(())
}

/// Maps error pages to the matching failure.
///
/// The error messages are only looked for on pages without recognisable
/// cards, since a card may quote them.
fn check_page(site: &SiteConfig, id: &str, url: &str, html: &str) -> Result<()> {
    check_url(site, id, url)?;
    if detect_layout(html).is_some() {
        return Ok(());
    }
    if dom::has_text(html, NOT_FOUND_MESSAGE) {
        return Err(Error::SetUnavailable {
            id: id.to_string(),
            reason: Unavailable::NotFound,
        });
    }
    if dom::has_text(html, PRIVATE_MESSAGE) {
        return Err(Error::SetUnavailable {
            id: id.to_string(),
            reason: Unavailable::AccessDenied,
        });
    }
    Ok(())
}

pub struct SetScraper {
    throttle: Arc<Throttle>,
    settings: ScrapeSettings,
}

impl SetScraper {
    pub fn new(throttle: Arc<Throttle>, settings: ScrapeSettings) -> Self {
        Self { throttle, settings }
    }

    /// Scrapes `set` through the leased session.
    ///
    /// A session rejected mid-scrape surfaces as [`Error::SessionExpired`]
    /// and whatever was read of the set is dropped. Cancellation surfaces as
    /// [`Error::Cancelled`].
    pub async fn scrape(
        &self,
        lease: &SessionLease<'_>,
        set: &SetMetadata,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResult> {
        self.scrape_on(lease.driver(), set, cancel).await
    }

    async fn scrape_on(
        &self,
        driver: &dyn PageDriver,
        set: &SetMetadata,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResult> {
        let settings = &self.settings;
        self.throttle.delay(cancel).await?;
        log::info!("Scraping set {}: {}", set.id, set.title);
        driver.navigate(&set.url).await?;

        let url = driver.current_url().await?;
        check_page(&settings.site, &set.id, &url, &driver.html().await?)?;

        let layout = wait_for_layout(driver, settings.render_timeout, settings.poll_interval, cancel).await?;
        let Some(layout) = layout else {
            let html = driver.html().await?;
            if let Some(entries) = captured_entries(&driver.captured_responses().await?) {
                log::info!("Set {} did not render, using {} cards from the web API", set.id, entries.len());
                return Ok(self.finish(set, entries, &html));
            }
            // An error message may have rendered after the first check.
            check_page(&settings.site, &set.id, &url, &html)?;
            log::warn!(
                "No cards rendered for set {} within {:?}",
                set.id,
                settings.render_timeout
            );
            return Ok(ScrapeResult {
                set: set.clone(),
                cards: Vec::new(),
                completeness: Completeness::Partial {
                    reason: PartialReason::RenderTimeout,
                },
                extracted_at: Utc::now(),
            });
        };

        if layout.paginated() {
            self.load_all(driver, layout, cancel).await?;
        }

        check_url(&settings.site, &set.id, &driver.current_url().await?)?;
        let html = driver.html().await?;
        let rendered = layout.parse_entries(&html);
        let entries = match captured_entries(&driver.captured_responses().await?) {
            Some(api) if api.len() >= rendered.len() => {
                log::debug!(
                    "Set {}: using {} cards from the web API over {} rendered",
                    set.id,
                    api.len(),
                    rendered.len()
                );
                api
            }
            _ => rendered,
        };
        Ok(self.finish(set, entries, &html))
    }

    fn finish(&self, set: &SetMetadata, entries: Vec<EntryResult>, html: &str) -> ScrapeResult {
        let cards: Vec<CardEntry> = entries
            .into_iter()
            .enumerate()
            .map(|(position, entry)| match entry {
                Ok(card) => CardEntry::Parsed(card),
                Err(reason) => {
                    log::warn!("Set {}: card {} unreadable: {}", set.id, position + 1, reason);
                    CardEntry::Missing { position, reason }
                }
            })
            .collect();

        let mut metadata = set.clone();
        if metadata.title.is_empty() || metadata.title == UNTITLED_SET {
            if let Some(title) = page_title(html) {
                metadata.title = title;
            }
        }
        let result = ScrapeResult::from_entries(metadata, cards);
        log::info!(
            "Scraped {} cards from {} ({})",
            result.parsed_cards().count(),
            result.set.title,
            result.completeness
        );
        result
    }

    /// Expands "See all", then clicks "Load more" or scrolls until a batch
    /// wait passes with no new cards.
    async fn load_all(
        &self,
        driver: &dyn PageDriver,
        layout: &dyn CardLayout,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let settings = &self.settings;
        let mut count = layout.entry_count(&driver.html().await?);

        if driver.click_with_text(EXPAND_BUTTON, SEE_ALL).await? {
            log::debug!("Expanded the full term list");
            self.throttle.delay(cancel).await?;
            count = layout
                .wait_for_render(driver, count, settings.batch_wait, settings.poll_interval, cancel)
                .await?;
        }

        for round in 0..settings.max_scroll_rounds {
            if !driver.click_with_text(EXPAND_BUTTON, LOAD_MORE).await? {
                driver.scroll_to_bottom().await?;
            }
            let latest = layout
                .wait_for_render(driver, count, settings.batch_wait, settings.poll_interval, cancel)
                .await?;
            if latest <= count {
                log::debug!("No more cards after {} rounds ({} rendered)", round + 1, count);
                break;
            }
            count = latest;
        }
        Ok(())
    }
}
