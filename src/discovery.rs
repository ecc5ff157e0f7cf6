//! Library discovery: walks the signed-in user's library, classes and folders
//! and yields every reachable set once.
//!
//! Sections are visited breadth-first starting from the library root. Owned
//! sets come first, so a set that is also shared through a class or folder
//! keeps the `owned` tag; between shared sections the first one reached wins.

use crate::auth::SessionLease;
use crate::browser::{dom, wait_for_any, PageDriver, WaitOutcome};
use crate::config::SiteConfig;
use crate::error::{Error, Result};
use crate::models::{SetMetadata, SetSource, UNTITLED_SET};
use crate::throttle::{pause, Throttle};
use chrono::Utc;
use regex::Regex;
use scraper::{ElementRef, Html};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SET_LINKS: &str = r#"a[href*="-flash-cards"], a[href*="/set/"], [class*="SetPreview"] a[href], [class*="DashboardListItem"] a[href]"#;
const CLASS_LINKS: &str = r#"a[href*="/class/"]"#;
const FOLDER_LINKS: &str = r#"a[href*="/folders/"]"#;
const EMPTY_STATE: &str = r#"[class*="EmptyState"], [data-testid*="empty"]"#;
const SETS_TAB: &str = "a, button";

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub site: SiteConfig,
    /// Bounded wait for a section's first content.
    pub render_timeout: Duration,
    /// How long to wait for more sets after a scroll.
    pub settle_wait: Duration,
    pub poll_interval: Duration,
    pub max_scroll_rounds: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Library,
    Class,
    Folder,
}

impl SectionKind {
    fn source(self) -> SetSource {
        match self {
            Self::Library => SetSource::Owned,
            Self::Class => SetSource::SharedClass,
            Self::Folder => SetSource::SharedFolder,
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Library => write!(f, "library"),
            Self::Class => write!(f, "class"),
            Self::Folder => write!(f, "folder"),
        }
    }
}

#[derive(Debug, Clone)]
struct Section {
    url: String,
    kind: SectionKind,
}

/// Everything readable from one rendered library, class or folder page.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LibraryPage {
    pub sets: Vec<SetMetadata>,
    pub classes: Vec<String>,
    pub folders: Vec<String>,
}

/// Most specific first.
static SET_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"/(\d+)/[^/]+-flash-cards", r"/set/(\d+)", r"/(\d+)/"]
        .into_iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

static CARD_COUNT_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(?:terms?|cards?)\b").ok());

/// Set ID from a set URL: `/<id>/<slug>-flash-cards`, `/set/<id>` or `/<id>/`.
pub fn extract_set_id(url: &str) -> Option<String> {
    SET_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(url))
        .map(|caps| caps[1].to_string())
}

/// Best-effort card count from an "N terms" label near the link.
fn card_count_near(link: ElementRef<'_>) -> Option<u32> {
    let re = CARD_COUNT_LABEL.as_ref()?;
    let scope = link.parent().and_then(ElementRef::wrap).unwrap_or(link);
    let text = scope.text().collect::<Vec<_>>().join(" ");
    re.captures(&text).and_then(|c| c[1].parse().ok())
}

fn link_title(link: ElementRef<'_>) -> String {
    dom::text_of(link)
        .or_else(|| link.value().attr("aria-label").map(str::trim).map(str::to_string))
        .or_else(|| link.value().attr("title").map(str::trim).map(str::to_string))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED_SET.to_string())
}

fn strip_query(href: &str) -> &str {
    href.split(['?', '#']).next().unwrap_or(href)
}

fn is_section_link(href: &str) -> bool {
    href.contains("/class/") || href.contains("/folders/")
}

fn section_links(document: &Html, css: &str, site: &SiteConfig) -> Vec<String> {
    let Ok(sel) = dom::selector(css) else {
        return Vec::new();
    };
    let mut urls: Vec<String> = Vec::new();
    for href in document.select(&sel).filter_map(|a| a.value().attr("href")) {
        let url = site.absolute(strip_query(href));
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

/// Reads set links and class/folder links from a rendered page.
///
/// Sets are deduplicated by ID within the page, first link wins.
pub fn parse_library_page(html: &str, site: &SiteConfig, source: SetSource) -> LibraryPage {
    let document = Html::parse_document(html);
    let mut page = LibraryPage {
        classes: section_links(&document, CLASS_LINKS, site),
        folders: section_links(&document, FOLDER_LINKS, site),
        ..LibraryPage::default()
    };

    let Ok(sel) = dom::selector(SET_LINKS) else {
        return page;
    };
    let now = Utc::now();
    let mut seen = HashSet::new();
    for link in document.select(&sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if is_section_link(href) {
            continue;
        }
        let url = site.absolute(strip_query(href));
        let Some(id) = extract_set_id(&url) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }
        page.sets.push(SetMetadata {
            id,
            title: link_title(link),
            url,
            card_count: card_count_near(link),
            source,
            discovered_at: now,
        });
    }
    page
}

/// Result of a complete walk.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub sets: Vec<SetMetadata>,
    /// Sections whose content never rendered within the bounded wait.
    pub partial_sections: Vec<String>,
}

impl DiscoveryReport {
    pub fn is_partial(&self) -> bool {
        !self.partial_sections.is_empty()
    }
}

pub struct LibraryCrawler {
    throttle: Arc<Throttle>,
    settings: CrawlSettings,
}

impl LibraryCrawler {
    pub fn new(throttle: Arc<Throttle>, settings: CrawlSettings) -> Self {
        Self { throttle, settings }
    }

    /// Lazily walks the library behind `lease`. Each section is fetched only
    /// when the sets already yielded run out.
    pub fn walk<'a>(
        &'a self,
        lease: &'a SessionLease<'_>,
        cancel: &'a CancellationToken,
    ) -> DiscoveryWalk<'a> {
        self.walk_on(lease.driver(), cancel)
    }

    fn walk_on<'a>(&'a self, driver: &'a dyn PageDriver, cancel: &'a CancellationToken) -> DiscoveryWalk<'a> {
        let root = Section {
            url: self.settings.site.latest_url(),
            kind: SectionKind::Library,
        };
        DiscoveryWalk {
            crawler: self,
            driver,
            cancel,
            queue: VecDeque::from([root]),
            queued: HashSet::new(),
            seen: HashSet::new(),
            ready: VecDeque::new(),
            partial_sections: Vec::new(),
            finished: false,
        }
    }

    /// Runs the walk to completion.
    pub async fn discover(
        &self,
        lease: &SessionLease<'_>,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryReport> {
        collect(self.walk(lease, cancel)).await
    }

    async fn crawl_section(
        &self,
        driver: &dyn PageDriver,
        section: &Section,
        cancel: &CancellationToken,
    ) -> Result<(LibraryPage, bool)> {
        let settings = &self.settings;
        self.throttle.delay(cancel).await?;
        log::info!("Discovering sets in {} {}", section.kind, section.url);
        driver.navigate(&section.url).await?;

        let landed = driver.current_url().await?;
        if settings.site.is_login_url(&landed) {
            return Err(Error::SessionExpired);
        }

        let outcome = wait_for_any(
            driver,
            &[SET_LINKS, EMPTY_STATE],
            settings.render_timeout,
            settings.poll_interval,
            cancel,
        )
        .await?;
        let partial = outcome == WaitOutcome::TimedOut;
        if partial {
            log::warn!(
                "No content rendered in {} {} within {:?}, reporting it as partial",
                section.kind,
                section.url,
                settings.render_timeout
            );
        }

        if section.kind == SectionKind::Class {
            self.throttle.delay(cancel).await?;
            if driver.click_with_text(SETS_TAB, "Sets").await? {
                log::debug!("Opened the Sets tab of {}", section.url);
            }
        }

        self.scroll_until_stable(driver, cancel).await?;

        let html = driver.html().await?;
        let page = parse_library_page(&html, &settings.site, section.kind.source());
        log::info!("Found {} sets in {} {}", page.sets.len(), section.kind, section.url);
        Ok((page, partial))
    }

    fn set_count(&self, html: &str) -> usize {
        parse_library_page(html, &self.settings.site, SetSource::Owned)
            .sets
            .len()
    }

    /// Scrolls until a round loads no new sets.
    async fn scroll_until_stable(&self, driver: &dyn PageDriver, cancel: &CancellationToken) -> Result<()> {
        let settings = &self.settings;
        let html = driver.html().await?;
        let mut count = self.set_count(&html);
        for _ in 0..settings.max_scroll_rounds {
            driver.scroll_to_bottom().await?;
            let deadline = Instant::now() + settings.settle_wait;
            let mut latest = count;
            loop {
                if let Ok(html) = driver.html().await {
                    latest = self.set_count(&html);
                }
                if latest > count || Instant::now() >= deadline {
                    break;
                }
                pause(settings.poll_interval, cancel).await?;
            }
            if latest <= count {
                break;
            }
            count = latest;
        }
        Ok(())
    }
}

/// A lazy, fallible sequence of discovered sets.
///
/// An error ends the walk: the next call after an error returns `None`.
pub struct DiscoveryWalk<'a> {
    crawler: &'a LibraryCrawler,
    driver: &'a dyn PageDriver,
    cancel: &'a CancellationToken,
    queue: VecDeque<Section>,
    queued: HashSet<String>,
    seen: HashSet<String>,
    ready: VecDeque<SetMetadata>,
    partial_sections: Vec<String>,
    finished: bool,
}

impl DiscoveryWalk<'_> {
    pub async fn next(&mut self) -> Option<Result<SetMetadata>> {
        loop {
            if let Some(set) = self.ready.pop_front() {
                return Some(Ok(set));
            }
            if self.finished {
                return None;
            }
            let Some(section) = self.queue.pop_front() else {
                self.finished = true;
                return None;
            };
            match self.crawler.crawl_section(self.driver, &section, self.cancel).await {
                Ok((page, partial)) => self.absorb(&section, page, partial),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }

    pub fn partial_sections(&self) -> &[String] {
        &self.partial_sections
    }

    fn absorb(&mut self, section: &Section, page: LibraryPage, partial: bool) {
        self.queued.insert(section.url.trim_end_matches('/').to_string());
        if partial {
            self.partial_sections.push(section.url.clone());
        }
        for set in page.sets {
            if self.seen.insert(set.id.clone()) {
                self.ready.push_back(set);
            } else {
                log::debug!("Set {} already discovered, keeping its first source", set.id);
            }
        }
        let links = page
            .classes
            .into_iter()
            .map(|url| (url, SectionKind::Class))
            .chain(page.folders.into_iter().map(|url| (url, SectionKind::Folder)));
        for (url, kind) in links {
            if self.queued.insert(url.trim_end_matches('/').to_string()) {
                self.queue.push_back(Section { url, kind });
            }
        }
    }
}

async fn collect(mut walk: DiscoveryWalk<'_>) -> Result<DiscoveryReport> {
    let mut sets = Vec::new();
    while let Some(set) = walk.next().await {
        sets.push(set?);
    }
    let report = DiscoveryReport {
        sets,
        partial_sections: walk.partial_sections().to_vec(),
    };
    log::info!(
        "Discovery finished: {} sets, {} partial sections",
        report.sets.len(),
        report.partial_sections.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedDriver, ScriptedPage};
    use crate::throttle::ThrottleProfile;

    const BASE: &str = "https://quizlet.test";

    fn crawler() -> LibraryCrawler {
        let throttle = Arc::new(Throttle::new(ThrottleProfile::from_secs(0.5, 1.0).unwrap()).unwrap());
        LibraryCrawler::new(
            throttle,
            CrawlSettings {
                site: SiteConfig::new(BASE),
                render_timeout: Duration::from_secs(5),
                settle_wait: Duration::from_secs(2),
                poll_interval: Duration::from_millis(250),
                max_scroll_rounds: 5,
            },
        )
    }

    fn set_link(id: &str, slug: &str, title: &str, terms: u32) -> String {
        format!(
            r#"<div class="SetPreview"><a href="/{}/{}-flash-cards/">{}</a><span>{} terms</span></div>"#,
            id, slug, title, terms
        )
    }

    #[test]
    fn test_extract_set_id() {
        assert_eq!(
            extract_set_id("https://quizlet.com/123456789/cell-biology-flash-cards/").as_deref(),
            Some("123456789")
        );
        assert_eq!(extract_set_id("https://quizlet.com/set/42").as_deref(), Some("42"));
        assert_eq!(extract_set_id("https://quizlet.com/987/").as_deref(), Some("987"));
        assert_eq!(extract_set_id("https://quizlet.com/latest"), None);
    }

    #[test]
    fn test_patterns_compile_once() {
        assert_eq!(SET_ID_PATTERNS.len(), 3);
        assert!(CARD_COUNT_LABEL.is_some());
        for id in 1..=200u32 {
            let url = format!("https://quizlet.com/{}/set-{}-flash-cards/", id, id);
            assert_eq!(extract_set_id(&url), Some(id.to_string()));
        }
    }

    #[test]
    fn test_parse_library_page() {
        let html = format!(
            r#"<main>{}{}{}
            <a href="/class/77/biology-101/">Biology 101</a>
            <a href="/user/student42/folders/exam-prep/sets">Exam prep</a>
            <a href="/class/77/biology-101/">Biology 101 again</a></main>"#,
            set_link("111", "cells", "Cells", 12),
            set_link("222", "genetics", "Genetics", 30),
            set_link("111", "cells", "Cells (duplicate)", 12),
        );
        let page = parse_library_page(&html, &SiteConfig::new(BASE), SetSource::Owned);

        let ids: Vec<&str> = page.sets.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["111", "222"]);
        assert_eq!(page.sets[0].title, "Cells");
        assert_eq!(page.sets[0].url, "https://quizlet.test/111/cells-flash-cards/");
        assert_eq!(page.sets[1].card_count, Some(30));
        assert_eq!(page.classes, vec!["https://quizlet.test/class/77/biology-101/"]);
        assert_eq!(
            page.folders,
            vec!["https://quizlet.test/user/student42/folders/exam-prep/sets"]
        );
    }

    #[test]
    fn test_title_falls_back_to_attributes() {
        let html = r#"<a href="/5/x-flash-cards/" aria-label="Spanish verbs"></a>
            <a href="/6/y-flash-cards/"></a>"#;
        let page = parse_library_page(html, &SiteConfig::new(BASE), SetSource::Owned);
        assert_eq!(page.sets[0].title, "Spanish verbs");
        assert_eq!(page.sets[1].title, UNTITLED_SET);
        assert_eq!(page.sets[1].card_count, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_walk_deduplicates_across_sections() {
        let driver = ScriptedDriver::new();
        driver.add_page(
            &format!("{}/latest", BASE),
            ScriptedPage::new(format!(
                r#"{}<a href="/class/1/bio/">Bio class</a><a href="/user/me/folders/review/sets">Review</a>"#,
                set_link("100", "mine", "Mine", 3)
            )),
        );
        driver.add_page(
            &format!("{}/class/1/bio", BASE),
            ScriptedPage::new(format!(
                "{}{}",
                set_link("200", "shared", "Shared", 5),
                set_link("100", "mine", "Mine", 3)
            )),
        );
        driver.add_page(
            &format!("{}/user/me/folders/review/sets", BASE),
            ScriptedPage::new(format!(
                "{}{}",
                set_link("200", "shared", "Shared", 5),
                set_link("300", "folder-only", "Folder only", 8)
            )),
        );

        let crawler = crawler();
        let cancel = CancellationToken::new();
        let report = collect(crawler.walk_on(&driver, &cancel)).await.unwrap();

        let tagged: Vec<(&str, SetSource)> = report.sets.iter().map(|s| (s.id.as_str(), s.source)).collect();
        assert_eq!(
            tagged,
            vec![
                ("100", SetSource::Owned),
                ("200", SetSource::SharedClass),
                ("300", SetSource::SharedFolder),
            ]
        );
        assert!(!report.is_partial());
        assert!(driver.clicked().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_walk_scrolls_until_stable() {
        let driver = ScriptedDriver::new();
        driver.add_page(
            &format!("{}/latest", BASE),
            ScriptedPage::new(set_link("1", "a", "A", 1))
                .then_on_scroll(format!("{}{}", set_link("1", "a", "A", 1), set_link("2", "b", "B", 1))),
        );
        let crawler = crawler();
        let cancel = CancellationToken::new();
        let report = collect(crawler.walk_on(&driver, &cancel)).await.unwrap();
        assert_eq!(report.sets.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrendered_section_is_partial_not_empty() {
        let driver = ScriptedDriver::new();
        driver.add_page(&format!("{}/latest", BASE), ScriptedPage::new("<div class='spinner'></div>"));
        let crawler = crawler();
        let cancel = CancellationToken::new();
        let report = collect(crawler.walk_on(&driver, &cancel)).await.unwrap();
        assert!(report.sets.is_empty());
        assert_eq!(report.partial_sections, vec![format!("{}/latest", BASE)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_state_is_confirmed_empty() {
        let driver = ScriptedDriver::new();
        driver.add_page(
            &format!("{}/latest", BASE),
            ScriptedPage::new(r#"<div class="EmptyState">No sets yet</div>"#),
        );
        let crawler = crawler();
        let cancel = CancellationToken::new();
        let report = collect(crawler.walk_on(&driver, &cancel)).await.unwrap();
        assert!(report.sets.is_empty());
        assert!(!report.is_partial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_class_page_opens_sets_tab() {
        let driver = ScriptedDriver::new();
        driver.add_page(
            &format!("{}/latest", BASE),
            ScriptedPage::new(r#"<div class="EmptyState"></div><a href="/class/9/chem/">Chem</a>"#),
        );
        driver.add_page(
            &format!("{}/class/9/chem", BASE),
            ScriptedPage::new(r#"<div class="EmptyState"></div><button>Sets</button>"#)
                .then_on_click(SETS_TAB, set_link("900", "acids", "Acids", 20)),
        );
        let crawler = crawler();
        let cancel = CancellationToken::new();
        let report = collect(crawler.walk_on(&driver, &cancel)).await.unwrap();
        assert_eq!(report.sets.len(), 1);
        assert_eq!(report.sets[0].source, SetSource::SharedClass);
        assert_eq!(report.sets[0].card_count, Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_redirect_is_session_expired() {
        let driver = ScriptedDriver::new();
        driver.require_cookie("qlts", &format!("{}/login", BASE));
        driver.add_page(&format!("{}/latest", BASE), ScriptedPage::new(set_link("1", "a", "A", 1)));
        let crawler = crawler();
        let cancel = CancellationToken::new();
        let mut walk = crawler.walk_on(&driver, &cancel);
        assert!(matches!(walk.next().await, Some(Err(Error::SessionExpired))));
        assert!(walk.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_walk_is_lazy() {
        let driver = ScriptedDriver::new();
        driver.add_page(
            &format!("{}/latest", BASE),
            ScriptedPage::new(format!(r#"{}<a href="/class/1/x/">X</a>"#, set_link("1", "a", "A", 1))),
        );
        driver.add_page(&format!("{}/class/1/x", BASE), ScriptedPage::new(set_link("2", "b", "B", 1)));
        let crawler = crawler();
        let cancel = CancellationToken::new();
        let mut walk = crawler.walk_on(&driver, &cancel);
        let first = walk.next().await.unwrap().unwrap();
        assert_eq!(first.id, "1");
        assert_eq!(driver.visit_count(&format!("{}/class/1/x", BASE)), 0);
    }
}
