//! Browser automation seam.
//!
//! Everything that talks to the remote service goes through [`PageDriver`].
//! [`ChromeDriver`] drives a real Chrome instance with `headless_chrome`;
//! tests use `crate::testing::ScriptedDriver`.
//!
//! # Example
//!
//! ```no_run
//! use quizlet_scraper::browser::{BrowserConfig, ChromeDriver, PageDriver};
//! use quizlet_scraper::throttle::{Throttle, ThrottleProfile};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let throttle = Throttle::new(ThrottleProfile::default())?;
//! let driver = ChromeDriver::launch(BrowserConfig::default(), throttle.fingerprint()).await?;
//!
//! driver.navigate("https://quizlet.com/latest").await?;
//! let html = driver.html().await?;
//! println!("Extracted {} bytes of HTML", html.len());
//! # Ok(())
//! # }
//! ```

pub mod chrome;
pub mod config;
pub mod dom;
pub mod stealth;
pub mod wait;

use crate::models::StorageState;
use async_trait::async_trait;

pub use chrome::ChromeDriver;
pub use config::BrowserConfig;
pub use wait::{wait_for_any, wait_for_url, WaitOutcome};

/// Errors that can occur during browser operations
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("Browser initialization failed: {0}")]
    InitializationError(String),

    #[error("Browser configuration error: {0}")]
    ConfigurationError(String),

    #[error("Navigation error: {0}")]
    NavigationError(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("JavaScript execution error: {0}")]
    JavaScriptError(String),

    #[error("HTML extraction error: {0}")]
    HtmlExtractionError(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Browser task failed: {0}")]
    TaskFailed(String),
}

/// A JSON body the page fetched from the service's web API.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedResponse {
    pub url: String,
    pub body: String,
}

/// Path segment of the service's JSON endpoints.
pub const WEB_API_PATH: &str = "/webapi/";

/// One browser tab, driven sequentially.
///
/// The remote service tolerates a single navigation context per session, so
/// implementations are shared behind an `Arc` but never driven concurrently.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate to a URL and wait for page load
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// URL after any redirects.
    async fn current_url(&self) -> Result<String, BrowserError>;

    async fn html(&self) -> Result<String, BrowserError>;

    async fn exists(&self, selector: &str) -> Result<bool, BrowserError> {
        let html = self.html().await?;
        dom::matches(&html, selector)
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;

    /// Clicks the first match. Returns `false` when nothing matched.
    async fn click(&self, selector: &str) -> Result<bool, BrowserError>;

    /// Clicks the first match whose text contains `text`.
    async fn click_with_text(&self, selector: &str, text: &str) -> Result<bool, BrowserError>;

    /// Scroll to the bottom of the page
    /// Useful for lazy-loaded content
    async fn scroll_to_bottom(&self) -> Result<(), BrowserError>;

    /// JSON responses from [`WEB_API_PATH`] endpoints received since the
    /// last `navigate`, oldest first.
    async fn captured_responses(&self) -> Result<Vec<CapturedResponse>, BrowserError>;

    /// Snapshot of cookies and local storage.
    async fn export_state(&self) -> Result<StorageState, BrowserError>;

    async fn import_state(&self, state: &StorageState) -> Result<(), BrowserError>;

    /// Drops every cookie and local storage entry.
    async fn clear_state(&self) -> Result<(), BrowserError>;
}
