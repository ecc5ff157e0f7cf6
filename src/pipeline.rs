//! Runs the commands end to end: session, discovery, scraping, export.
//!
//! A batch keeps going past a set that fails, and stops early only when the
//! session is lost for good or the run is cancelled. A session that expires
//! mid-batch is re-established once (when a login method is available) and
//! only the affected set is scraped again.

use crate::auth::{Authenticator, LoginMethod};
use crate::browser::PageDriver;
use crate::catalog::SetCatalog;
use crate::config::{Config, SiteConfig};
use crate::discovery::{extract_set_id, DiscoveryReport, LibraryCrawler};
use crate::error::{Error, ExitStatus, Result};
use crate::export::ExportWriter;
use crate::models::{Completeness, PartialReason, ScrapeResult, Session, SetMetadata, SetSource, UNTITLED_SET};
use crate::session_store::SessionStore;
use crate::set_scraper::SetScraper;
use crate::throttle::Throttle;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of `discover`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub found: usize,
    pub added: usize,
    pub total: usize,
    pub partial_sections: Vec<String>,
}

impl DiscoverySummary {
    pub fn exit_status(&self) -> ExitStatus {
        if self.partial_sections.is_empty() {
            ExitStatus::Success
        } else {
            ExitStatus::PartialCompletion
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetStatus {
    Exported {
        completeness: Completeness,
        files: Vec<PathBuf>,
    },
    Failed {
        error: String,
        exit: ExitStatus,
    },
    /// Cancelled while this set was being scraped. Nothing was written.
    Aborted,
    /// Never started because the batch stopped early.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetReport {
    pub id: String,
    pub title: String,
    pub status: SetStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub sets: Vec<SetReport>,
    pub combined_files: Vec<PathBuf>,
}

impl BatchReport {
    fn push(&mut self, set: &SetMetadata, status: SetStatus) {
        self.sets.push(SetReport {
            id: set.id.clone(),
            title: set.title.clone(),
            status,
        });
    }

    pub fn exported(&self) -> usize {
        self.count(|s| matches!(s, SetStatus::Exported { .. }))
    }

    /// Exported sets that yielded cards. A set whose cards never rendered is
    /// still written out but does not make the run a success.
    fn delivered(&self) -> usize {
        const NOTHING_RENDERED: Completeness = Completeness::Partial {
            reason: PartialReason::RenderTimeout,
        };
        self.count(|s| matches!(s, SetStatus::Exported { completeness, .. } if *completeness != NOTHING_RENDERED))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SetStatus::Failed { .. }))
    }

    pub fn interrupted(&self) -> bool {
        self.sets.iter().any(|s| s.status == SetStatus::Aborted)
    }

    fn count(&self, pred: impl Fn(&SetStatus) -> bool) -> usize {
        self.sets.iter().filter(|s| pred(&s.status)).count()
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.delivered() == self.sets.len() {
            return ExitStatus::Success;
        }
        if self.exported() > 0 {
            return ExitStatus::PartialCompletion;
        }
        if self.interrupted() {
            return ExitStatus::Interrupted;
        }
        self.sets
            .iter()
            .find_map(|s| match &s.status {
                SetStatus::Failed { exit, .. } => Some(*exit),
                _ => None,
            })
            .unwrap_or(ExitStatus::GeneralError)
    }

    pub fn log_summary(&self) {
        log::info!("=== Scrape summary ===");
        for set in &self.sets {
            match &set.status {
                SetStatus::Exported { completeness, files } => {
                    log::info!("  {} {}: {} ({} files)", set.id, set.title, completeness, files.len())
                }
                SetStatus::Failed { error, .. } => log::warn!("  {} {}: failed: {}", set.id, set.title, error),
                SetStatus::Aborted => log::warn!("  {} {}: partial: aborted", set.id, set.title),
                SetStatus::Skipped => log::warn!("  {} {}: skipped", set.id, set.title),
            }
        }
        for path in &self.combined_files {
            log::info!("  combined export: {}", path.display());
        }
        log::info!(
            "{} of {} sets exported, {} failed",
            self.exported(),
            self.sets.len(),
            self.failed()
        );
    }
}

/// Sets named on the command line, looked up in the catalog.
///
/// `--url` references outside the catalog are scraped with a placeholder
/// title that the set page replaces.
pub fn resolve_targets(
    catalog: &SetCatalog,
    site: &SiteConfig,
    ids: &[String],
    urls: &[String],
    all: bool,
) -> Result<Vec<SetMetadata>> {
    let mut targets: Vec<SetMetadata> = if all { catalog.sets.clone() } else { Vec::new() };
    let mut push = |set: SetMetadata| {
        if !targets.iter().any(|t| t.id == set.id) {
            targets.push(set);
        }
    };

    for id in ids {
        let set = catalog.find(id).cloned().ok_or_else(|| {
            Error::Config(format!(
                "set {} is not in the catalog, run discover first or pass --url",
                id
            ))
        })?;
        push(set);
    }
    for url in urls {
        let url = site.absolute(url);
        let id = extract_set_id(&url)
            .ok_or_else(|| Error::Config(format!("no set ID in URL {}", url)))?;
        let set = catalog.find(&id).cloned().unwrap_or_else(|| SetMetadata {
            id,
            title: UNTITLED_SET.to_string(),
            url,
            card_count: None,
            source: SetSource::Owned,
            discovered_at: Utc::now(),
        });
        push(set);
    }
    Ok(targets)
}

pub struct Pipeline {
    auth: Authenticator,
    crawler: LibraryCrawler,
    scraper: SetScraper,
    writer: ExportWriter,
    catalog_path: PathBuf,
    combined: bool,
}

impl Pipeline {
    pub fn new(config: &Config, driver: Arc<dyn PageDriver>, throttle: Arc<Throttle>) -> Result<Self> {
        let store = SessionStore::in_dir(&config.auth.session_dir);
        let auth = Authenticator::new(driver, store, throttle.clone(), config.auth_settings());
        Ok(Self {
            auth,
            crawler: LibraryCrawler::new(throttle.clone(), config.crawl_settings()),
            scraper: SetScraper::new(throttle, config.scrape_settings()),
            writer: ExportWriter::new(
                &config.export.output_dir,
                config.export_formats()?,
                config.export.include_images,
            ),
            catalog_path: SetCatalog::path_in(&config.export.output_dir),
            combined: config.export.combined,
        })
    }

    pub fn auth(&self) -> &Authenticator {
        &self.auth
    }

    pub fn catalog(&self) -> Result<SetCatalog> {
        SetCatalog::load(&self.catalog_path)
    }

    pub async fn login(&self, method: LoginMethod, cancel: &CancellationToken) -> Result<Session> {
        self.auth.login(method, cancel).await
    }

    pub async fn logout(&self, remote: bool, cancel: &CancellationToken) -> Result<()> {
        self.auth.logout(remote, cancel).await
    }

    /// Drops the expired session and logs in again with `method`, if any.
    async fn reauthenticate(&self, method: Option<&LoginMethod>, cancel: &CancellationToken) -> Result<()> {
        self.auth.handle_expired()?;
        let Some(method) = method else {
            self.auth.abandon();
            return Err(Error::SessionExpired);
        };
        self.auth.login(method.clone(), cancel).await?;
        Ok(())
    }

    async fn discover_once(&self, cancel: &CancellationToken) -> Result<DiscoveryReport> {
        let lease = self.auth.checkout()?;
        self.crawler.discover(&lease, cancel).await
    }

    /// Discovers every reachable set and merges it into the catalog.
    pub async fn discover(
        &self,
        method: Option<LoginMethod>,
        cancel: &CancellationToken,
    ) -> Result<DiscoverySummary> {
        self.auth.ensure_session(method.clone(), cancel).await?;
        let report = match self.discover_once(cancel).await {
            Err(Error::SessionExpired) => {
                self.reauthenticate(method.as_ref(), cancel).await?;
                self.discover_once(cancel).await?
            }
            other => other?,
        };

        let mut catalog = self.catalog()?;
        let added = catalog.merge(report.sets.iter().cloned());
        catalog.save(&self.catalog_path)?;
        log::info!(
            "Discovered {} sets ({} new, {} in catalog)",
            report.sets.len(),
            added,
            catalog.len()
        );
        Ok(DiscoverySummary {
            found: report.sets.len(),
            added,
            total: catalog.len(),
            partial_sections: report.partial_sections,
        })
    }

    async fn scrape_once(&self, set: &SetMetadata, cancel: &CancellationToken) -> Result<ScrapeResult> {
        let lease = self.auth.checkout()?;
        self.scraper.scrape(&lease, set, cancel).await
    }

    async fn scrape_one(
        &self,
        set: &SetMetadata,
        relogin: Option<&LoginMethod>,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResult> {
        match self.scrape_once(set, cancel).await {
            Err(Error::SessionExpired) => {
                self.reauthenticate(relogin, cancel).await?;
                log::info!("Session re-established, scraping set {} again", set.id);
                self.scrape_once(set, cancel).await
            }
            other => other,
        }
    }

    /// Scrapes and exports `sets` in order.
    ///
    /// Needs a session (active, stored, or from `relogin`); without one the
    /// whole batch fails with [`Error::NoSession`].
    pub async fn scrape_batch(
        &self,
        sets: &[SetMetadata],
        relogin: Option<LoginMethod>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        self.auth.ensure_session(relogin.clone(), cancel).await?;

        let mut report = BatchReport::default();
        let mut results = Vec::new();
        let total = sets.len();
        let mut remaining = sets.iter().enumerate();

        for (i, set) in remaining.by_ref() {
            log::info!("Set {}/{}: {}", i + 1, total, set.url);
            match self.scrape_one(set, relogin.as_ref(), cancel).await {
                Ok(result) => {
                    let status = self.export(&result);
                    report.push(&result.set, status);
                    results.push(result);
                }
                Err(Error::Cancelled) => {
                    log::warn!("Cancelled while scraping set {}, nothing written for it", set.id);
                    report.push(set, SetStatus::Aborted);
                    break;
                }
                Err(e) => {
                    log::error!("Failed to scrape {}: {}", set.url, e);
                    let fatal = e.is_session_fatal();
                    report.push(
                        set,
                        SetStatus::Failed {
                            exit: ExitStatus::for_error(&e),
                            error: e.to_string(),
                        },
                    );
                    if fatal {
                        log::error!("Session lost, stopping the batch");
                        break;
                    }
                }
            }
        }
        for (_, set) in remaining {
            report.push(set, SetStatus::Skipped);
        }

        if self.combined && !results.is_empty() {
            match self.writer.write_combined(&results) {
                Ok(files) => report.combined_files = files,
                Err(e) => log::error!("Failed to write combined export: {}", e),
            }
        }
        report.log_summary();
        Ok(report)
    }

    fn export(&self, result: &ScrapeResult) -> SetStatus {
        if self.combined {
            return SetStatus::Exported {
                completeness: result.completeness,
                files: Vec::new(),
            };
        }
        match self.writer.write_set(result) {
            Ok(files) => SetStatus::Exported {
                completeness: result.completeness,
                files,
            },
            Err(e) => {
                log::error!("Failed to export set {}: {}", result.set.id, e);
                SetStatus::Failed {
                    exit: ExitStatus::for_error(&e),
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(id: &str) -> SetMetadata {
        SetMetadata {
            id: id.into(),
            title: format!("Set {}", id),
            url: format!("https://quizlet.com/{}/s-flash-cards/", id),
            card_count: None,
            source: SetSource::SharedClass,
            discovered_at: Utc::now(),
        }
    }

    fn report(statuses: Vec<SetStatus>) -> BatchReport {
        let mut report = BatchReport::default();
        for (i, status) in statuses.into_iter().enumerate() {
            report.push(&set(&i.to_string()), status);
        }
        report
    }

    fn exported() -> SetStatus {
        SetStatus::Exported {
            completeness: Completeness::Full,
            files: vec![],
        }
    }

    fn nothing_rendered() -> SetStatus {
        SetStatus::Exported {
            completeness: Completeness::Partial {
                reason: PartialReason::RenderTimeout,
            },
            files: vec![],
        }
    }

    fn failed(exit: ExitStatus) -> SetStatus {
        SetStatus::Failed {
            error: "x".into(),
            exit,
        }
    }

    #[test]
    fn test_batch_exit_status() {
        assert_eq!(report(vec![]).exit_status(), ExitStatus::Success);
        assert_eq!(report(vec![exported(), exported()]).exit_status(), ExitStatus::Success);
        assert_eq!(
            report(vec![exported(), failed(ExitStatus::GeneralError)]).exit_status(),
            ExitStatus::PartialCompletion
        );
        assert_eq!(
            report(vec![exported(), SetStatus::Aborted, SetStatus::Skipped]).exit_status(),
            ExitStatus::PartialCompletion
        );
        assert_eq!(
            report(vec![SetStatus::Aborted, SetStatus::Skipped]).exit_status(),
            ExitStatus::Interrupted
        );
        assert_eq!(
            report(vec![failed(ExitStatus::AuthenticationFailed), SetStatus::Skipped]).exit_status(),
            ExitStatus::AuthenticationFailed
        );
    }

    #[test]
    fn test_unrendered_sets_are_not_a_clean_run() {
        assert_eq!(
            report(vec![nothing_rendered(), nothing_rendered()]).exit_status(),
            ExitStatus::PartialCompletion
        );
        assert_eq!(
            report(vec![exported(), nothing_rendered()]).exit_status(),
            ExitStatus::PartialCompletion
        );
        let missing_one = SetStatus::Exported {
            completeness: Completeness::Partial {
                reason: PartialReason::MissingCards(1),
            },
            files: vec![],
        };
        assert_eq!(report(vec![exported(), missing_one]).exit_status(), ExitStatus::Success);
    }

    #[test]
    fn test_resolve_targets() {
        let mut catalog = SetCatalog::default();
        catalog.merge(vec![set("1"), set("2")]);
        let site = SiteConfig::new("https://quizlet.com");

        let all = resolve_targets(&catalog, &site, &[], &[], true).unwrap();
        assert_eq!(all.len(), 2);

        let picked = resolve_targets(
            &catalog,
            &site,
            &["2".to_string()],
            &["/2/s-flash-cards/".to_string(), "https://quizlet.com/9/new-flash-cards/".to_string()],
            false,
        )
        .unwrap();
        let ids: Vec<&str> = picked.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "9"]);
        assert_eq!(picked[0].source, SetSource::SharedClass);
        assert_eq!(picked[1].title, UNTITLED_SET);

        assert!(matches!(
            resolve_targets(&catalog, &site, &["404".to_string()], &[], false),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            resolve_targets(&catalog, &site, &[], &["https://quizlet.com/latest".to_string()], false),
            Err(Error::Config(_))
        ));
    }
}
