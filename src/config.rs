use crate::auth::AuthSettings;
use crate::browser::BrowserConfig;
use crate::discovery::CrawlSettings;
use crate::error::{Error, Result};
use crate::export::ExportFormat;
use crate::set_scraper::ScrapeSettings;
use crate::throttle::ThrottleProfile;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub browser: BrowserSection,
    #[serde(default)]
    pub throttle: ThrottleSection,
    #[serde(default)]
    pub export: ExportSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub timing: TimingSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrowserSection {
    /// Run without a visible browser window
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Navigation timeout in seconds
    #[serde(default = "default_browser_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_false")]
    pub disable_images: bool,

    /// Hide automation markers and spoof the fingerprint
    #[serde(default = "default_true")]
    pub stealth: bool,

    #[serde(default)]
    pub chrome_flags: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThrottleSection {
    #[serde(default = "default_delay_min")]
    pub delay_min_secs: f64,
    #[serde(default = "default_delay_max")]
    pub delay_max_secs: f64,
    /// Replaces the built-in user agent pool when non-empty
    #[serde(default)]
    pub user_agents: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportSection {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
    /// Emit `/image/` tags in the delimited format
    #[serde(default = "default_true")]
    pub include_images: bool,
    /// One file per batch instead of one per set
    #[serde(default = "default_false")]
    pub combined: bool,
}

#[derive(Deserialize, Clone)]
pub struct AuthSection {
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
    #[serde(default)]
    pub username: Option<String>,
    /// Only ever taken from `QUIZLET_PASSWORD`.
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(default = "default_manual_timeout")]
    pub manual_timeout_secs: u64,
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingSection {
    /// Bounded wait for content to appear on a page
    #[serde(default = "default_render_timeout")]
    pub render_timeout_secs: u64,
    /// How long to wait for another batch of lazy-loaded cards
    #[serde(default = "default_batch_wait")]
    pub batch_wait_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_scroll_rounds")]
    pub max_scroll_rounds: usize,
}

fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_browser_timeout() -> u64 { 30 }
fn default_delay_min() -> f64 { 2.0 }
fn default_delay_max() -> f64 { 5.0 }
fn default_output_dir() -> PathBuf { PathBuf::from("output") }
fn default_formats() -> Vec<String> { vec!["quizlet".to_string()] }
fn default_session_dir() -> PathBuf { PathBuf::from("auth") }
fn default_manual_timeout() -> u64 { 300 }
fn default_login_timeout() -> u64 { 30 }
fn default_base_url() -> String { "https://quizlet.com".to_string() }
fn default_render_timeout() -> u64 { 15 }
fn default_batch_wait() -> u64 { 3 }
fn default_poll_interval() -> u64 { 250 }
fn default_max_scroll_rounds() -> usize { 20 }

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            headless: true,
            timeout_secs: default_browser_timeout(),
            disable_images: false,
            stealth: true,
            chrome_flags: vec![],
        }
    }
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            delay_min_secs: default_delay_min(),
            delay_max_secs: default_delay_max(),
            user_agents: vec![],
        }
    }
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            formats: default_formats(),
            include_images: true,
            combined: false,
        }
    }
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            session_dir: default_session_dir(),
            username: None,
            password: None,
            manual_timeout_secs: default_manual_timeout(),
            login_timeout_secs: default_login_timeout(),
        }
    }
}

impl fmt::Debug for AuthSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSection")
            .field("session_dir", &self.session_dir)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("manual_timeout_secs", &self.manual_timeout_secs)
            .field("login_timeout_secs", &self.login_timeout_secs)
            .finish()
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            render_timeout_secs: default_render_timeout(),
            batch_wait_secs: default_batch_wait(),
            poll_interval_ms: default_poll_interval(),
            max_scroll_rounds: default_max_scroll_rounds(),
        }
    }
}

impl SiteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base(), path.trim_start_matches('/'))
    }

    pub fn login_url(&self) -> String {
        self.url("login")
    }

    pub fn logout_url(&self) -> String {
        self.url("logout")
    }

    /// Landing page that requires an authenticated session.
    pub fn latest_url(&self) -> String {
        self.url("latest")
    }

    pub fn is_login_url(&self, url: &str) -> bool {
        url.contains("/login")
    }

    pub fn is_on_site(&self, url: &str) -> bool {
        url.starts_with(self.base())
    }

    /// Resolves a link found on a page.
    pub fn absolute(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if let Some(rest) = href.strip_prefix("//") {
            format!("https://{}", rest)
        } else {
            self.url(href)
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{} must be a boolean, got {:?}", name, other))),
    }
}

impl Config {
    /// Loads `path`, or `config.toml` when `path` is `None`.
    ///
    /// A missing default file means defaults; a missing explicit file or a
    /// malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if !path.exists() {
            if explicit {
                return Err(Error::Config(format!("config file {} not found", path.display())));
            }
            log::debug!("No {} found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Applies `QUIZLET_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("QUIZLET_HEADLESS") {
            self.browser.headless = parse_bool("QUIZLET_HEADLESS", &v)?;
        }
        if let Some(v) = lookup("QUIZLET_OUTPUT_DIR").filter(|v| !v.is_empty()) {
            self.export.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUIZLET_USERNAME").filter(|v| !v.is_empty()) {
            self.auth.username = Some(v);
        }
        if let Some(v) = lookup("QUIZLET_PASSWORD").filter(|v| !v.is_empty()) {
            self.auth.password = Some(v);
        }
        Ok(())
    }

    /// Fails fast on anything that would otherwise surface mid-run.
    pub fn validate(&self) -> Result<()> {
        self.throttle_profile()?;
        self.export_formats()?;
        if self.timing.poll_interval_ms == 0 {
            return Err(Error::Config("timing.poll_interval_ms must be positive".into()));
        }
        if !self.site.base_url.starts_with("http") {
            return Err(Error::Config(format!(
                "site.base_url must be an http(s) URL, got {:?}",
                self.site.base_url
            )));
        }
        Ok(())
    }

    pub fn throttle_profile(&self) -> Result<ThrottleProfile> {
        let mut profile =
            ThrottleProfile::from_secs(self.throttle.delay_min_secs, self.throttle.delay_max_secs)?;
        if !self.throttle.user_agents.is_empty() {
            profile.user_agents = self.throttle.user_agents.clone();
        }
        profile.validate()?;
        Ok(profile)
    }

    pub fn export_formats(&self) -> Result<Vec<ExportFormat>> {
        let mut formats = Vec::new();
        for name in &self.export.formats {
            let format: ExportFormat = name.parse()?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        if formats.is_empty() {
            return Err(Error::Config("export.formats must name at least one format".into()));
        }
        Ok(formats)
    }

    pub fn browser_config(&self) -> BrowserConfig {
        BrowserConfig {
            headless: self.browser.headless,
            timeout_seconds: self.browser.timeout_secs,
            disable_images: self.browser.disable_images,
            stealth: self.browser.stealth,
            chrome_flags: self.browser.chrome_flags.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.poll_interval_ms)
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            site: self.site.clone(),
            login_timeout: Duration::from_secs(self.auth.login_timeout_secs),
            manual_timeout: Duration::from_secs(self.auth.manual_timeout_secs),
            poll_interval: self.poll_interval(),
        }
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            site: self.site.clone(),
            render_timeout: Duration::from_secs(self.timing.render_timeout_secs),
            settle_wait: Duration::from_secs(self.timing.batch_wait_secs),
            poll_interval: self.poll_interval(),
            max_scroll_rounds: self.timing.max_scroll_rounds,
        }
    }

    pub fn scrape_settings(&self) -> ScrapeSettings {
        ScrapeSettings {
            site: self.site.clone(),
            render_timeout: Duration::from_secs(self.timing.render_timeout_secs),
            batch_wait: Duration::from_secs(self.timing.batch_wait_secs),
            poll_interval: self.poll_interval(),
            max_scroll_rounds: self.timing.max_scroll_rounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.browser.headless);
        assert_eq!(config.throttle.delay_min_secs, 2.0);
        assert_eq!(config.throttle.delay_max_secs, 5.0);
        assert_eq!(config.export.output_dir, PathBuf::from("output"));
        assert_eq!(config.auth.session_dir, PathBuf::from("auth"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_site_urls() {
        let site = SiteConfig::new("https://quizlet.com/");
        assert_eq!(site.login_url(), "https://quizlet.com/login");
        assert_eq!(site.latest_url(), "https://quizlet.com/latest");
        assert_eq!(site.absolute("/class/123/"), "https://quizlet.com/class/123/");
        assert_eq!(
            site.absolute("https://quizlet.com/1/a-flash-cards/"),
            "https://quizlet.com/1/a-flash-cards/"
        );
        assert!(site.is_login_url("https://quizlet.com/login?redirect=/latest"));
        assert!(!site.is_login_url("https://quizlet.com/latest"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut config = Config::default();
        config.auth.password = Some("hunter2".into());
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
