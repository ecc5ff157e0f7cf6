//! Login state machine and the single-checkout session handle.
//!
//! ```text
//! LoggedOut ──login──▶ Authenticating ──ok──▶ Authenticated
//!     ▲                    │   ▲                 │    │
//!     └──────failure───────┘   └────expired──────┘    │
//!     ▲                                               │
//!     └────────────────────logout─────────────────────┘
//! ```
//!
//! Manual login passes through `AwaitingManualLogin`, which is observable via
//! [`Authenticator::subscribe`] so a UI can tell the user to finish in the
//! browser window.

use crate::browser::{dom, wait_for_any, wait_for_url, PageDriver, WaitOutcome};
use crate::config::SiteConfig;
use crate::error::{AuthFailure, ChallengeKind, Error, Result};
use crate::models::Session;
use crate::session_store::SessionStore;
use crate::throttle::{pause, Throttle};
use regex::Regex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const USERNAME_INPUT: &str = r#"input[type="text"], input[type="email"]"#;
const PASSWORD_INPUT: &str = r#"input[type="password"]"#;
const SUBMIT_BUTTON: &str = r#"button[type="submit"]"#;
const LOGIN_ERROR: &str = r#"[class*="error"], [class*="Error"], [role="alert"]"#;

const CAPTCHA_MARKERS: &str =
    r#"iframe[src*="recaptcha"], iframe[src*="hcaptcha"], .g-recaptcha, .h-captcha, #captcha"#;
const TWO_FACTOR_MARKERS: &str = r#"input[autocomplete="one-time-code"], input[name*="otp"], [data-testid*="two-factor"]"#;

/// Elements only rendered for a signed-in user.
const USER_INDICATORS: &str = r#"[data-testid="user-menu"], [class*="UserAvatar"], [class*="ProfileIcon"], button[aria-label*="profile"], [class*="NavigationUser"]"#;

static PROFILE_LINK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"href="[^"]*/user/([^/"?#]+)"#).ok());

/// Account name from a `/user/<name>/` profile link.
fn account_from_html(html: &str) -> Option<String> {
    let re = PROFILE_LINK.as_ref()?;
    re.captures(html).map(|c| c[1].to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    Authenticating,
    /// Waiting for a person to finish logging in in the browser window.
    AwaitingManualLogin { timeout_secs: u64 },
    Authenticated { account: String },
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum LoginMethod {
    Credentials(Credentials),
    /// Someone completes the login (e.g. Google OAuth) in a visible window.
    /// Without a timeout, waits for [`AuthSettings::manual_timeout`].
    Manual { timeout: Option<Duration> },
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub site: SiteConfig,
    pub login_timeout: Duration,
    /// Default wait for a manual login.
    pub manual_timeout: Duration,
    pub poll_interval: Duration,
}

pub struct Authenticator {
    driver: Arc<dyn PageDriver>,
    store: SessionStore,
    throttle: Arc<Throttle>,
    settings: AuthSettings,
    state: watch::Sender<AuthState>,
    session: Mutex<Option<Session>>,
    checked_out: AtomicBool,
}

impl Authenticator {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        store: SessionStore,
        throttle: Arc<Throttle>,
        settings: AuthSettings,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::LoggedOut);
        Self {
            driver,
            store,
            throttle,
            settings,
            state,
            session: Mutex::new(None),
            checked_out: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    fn transition(&self, next: AuthState) {
        log::debug!("Auth state: {:?}", next);
        self.state.send_replace(next);
    }

    fn active(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Logs in and persists the new session.
    ///
    /// Any stored or in-memory session is discarded first, so a failed
    /// attempt never leaves the previous account's cookies behind.
    pub async fn login(&self, method: LoginMethod, cancel: &CancellationToken) -> Result<Session> {
        if self.checked_out.load(Ordering::Acquire) {
            return Err(Error::SessionBusy);
        }
        self.transition(AuthState::Authenticating);

        match self.run_login(method, cancel).await {
            Ok(session) => {
                self.transition(AuthState::Authenticated {
                    account: session.account.clone(),
                });
                log::info!("Login successful as {}", session.account);
                Ok(session)
            }
            Err(e) => {
                log::error!("Login failed: {}", e);
                self.transition(AuthState::LoggedOut);
                Err(e)
            }
        }
    }

    async fn run_login(&self, method: LoginMethod, cancel: &CancellationToken) -> Result<Session> {
        self.active().take();
        self.store.clear()?;
        self.driver.clear_state().await?;

        let username = match method {
            LoginMethod::Credentials(creds) => {
                self.credential_login(&creds, cancel).await?;
                Some(creds.username)
            }
            LoginMethod::Manual { timeout } => {
                let timeout = timeout.unwrap_or(self.settings.manual_timeout);
                self.manual_login(timeout, cancel).await?;
                None
            }
        };

        if !self.is_signed_in(cancel).await? {
            return Err(Error::AuthenticationFailed(AuthFailure::NotConfirmed));
        }
        let account = match username {
            Some(name) => name,
            None => self.detect_account().await,
        };

        let state = self.driver.export_state().await?;
        let session = Session::new(account, self.throttle.fingerprint(), state);
        self.store.save(&session)?;
        *self.active() = Some(session.clone());
        Ok(session)
    }

    async fn credential_login(&self, creds: &Credentials, cancel: &CancellationToken) -> Result<()> {
        if creds.password.is_empty() {
            return Err(Error::AuthenticationFailed(AuthFailure::MissingCredentials));
        }
        let site = &self.settings.site;
        let poll = self.settings.poll_interval;

        log::info!("Navigating to login page...");
        self.throttle.delay(cancel).await?;
        self.driver.navigate(&site.login_url()).await?;

        let form = wait_for_any(
            self.driver.as_ref(),
            &[USERNAME_INPUT, CAPTCHA_MARKERS],
            self.settings.login_timeout,
            poll,
            cancel,
        )
        .await?;
        match form {
            WaitOutcome::Found(0) => {}
            WaitOutcome::Found(_) => {
                return Err(Error::AuthenticationFailed(AuthFailure::UnsupportedChallenge(
                    ChallengeKind::Captcha,
                )))
            }
            WaitOutcome::TimedOut => {
                return Err(Error::AuthenticationFailed(AuthFailure::Rejected(
                    "login form did not load".to_string(),
                )))
            }
        }

        log::info!("Filling login credentials...");
        self.driver.fill(USERNAME_INPUT, &creds.username).await?;
        self.driver.fill(PASSWORD_INPUT, &creds.password).await?;
        if !self.driver.click(SUBMIT_BUTTON).await? {
            return Err(Error::AuthenticationFailed(AuthFailure::Rejected(
                "login button not found".to_string(),
            )));
        }

        log::info!("Waiting for login to complete...");
        let deadline = Instant::now() + self.settings.login_timeout;
        loop {
            if let Ok(url) = self.driver.current_url().await {
                if !site.is_login_url(&url) {
                    return Ok(());
                }
            }
            if let Some(kind) = self.detect_challenge().await {
                return Err(Error::AuthenticationFailed(AuthFailure::UnsupportedChallenge(kind)));
            }
            if Instant::now() >= deadline {
                break;
            }
            pause(poll, cancel).await?;
        }

        let message = match self.driver.html().await {
            Ok(html) => dom::first_text(&html, LOGIN_ERROR).ok().flatten(),
            Err(_) => None,
        };
        Err(Error::AuthenticationFailed(AuthFailure::Rejected(match message {
            Some(text) => format!("Login failed: {}", text),
            None => "Login timed out".to_string(),
        })))
    }

    async fn detect_challenge(&self) -> Option<ChallengeKind> {
        let html = self.driver.html().await.ok()?;
        if dom::matches(&html, CAPTCHA_MARKERS).unwrap_or(false) {
            Some(ChallengeKind::Captcha)
        } else if dom::matches(&html, TWO_FACTOR_MARKERS).unwrap_or(false) {
            Some(ChallengeKind::TwoFactor)
        } else {
            None
        }
    }

    async fn manual_login(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let site = &self.settings.site;
        self.transition(AuthState::AwaitingManualLogin {
            timeout_secs: timeout.as_secs(),
        });
        log::info!("Opening login page for manual login...");
        log::info!("Please complete the login in the browser window.");
        log::info!("Waiting up to {} seconds for login...", timeout.as_secs());

        self.driver.navigate(&site.login_url()).await?;
        let landed = wait_for_url(
            self.driver.as_ref(),
            |url| site.is_on_site(url) && !site.is_login_url(url),
            timeout,
            self.settings.poll_interval,
            cancel,
        )
        .await?;

        match landed {
            Some(url) => {
                log::info!("Manual login finished on {}", url);
                self.transition(AuthState::Authenticating);
                Ok(())
            }
            None => Err(Error::AuthenticationFailed(AuthFailure::ManualTimeout(
                timeout.as_secs(),
            ))),
        }
    }

    /// Visits a page that needs authentication and reports whether the
    /// service still treats us as signed in.
    async fn is_signed_in(&self, cancel: &CancellationToken) -> Result<bool> {
        let site = &self.settings.site;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.driver.navigate(&site.latest_url()).await?;
        let url = self.driver.current_url().await?;
        if site.is_login_url(&url) {
            return Ok(false);
        }
        if self.driver.exists(USER_INDICATORS).await.unwrap_or(false) {
            return Ok(true);
        }
        Ok(url.contains("/latest") || url.contains("/home"))
    }

    async fn detect_account(&self) -> String {
        self.driver
            .html()
            .await
            .ok()
            .and_then(|html| account_from_html(&html))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Loads `session` into the browser and checks it is still accepted.
    pub async fn validate(&self, session: &Session, cancel: &CancellationToken) -> Result<bool> {
        self.throttle.pin(session.fingerprint.clone());
        self.driver.import_state(&session.state).await?;
        let valid = self.is_signed_in(cancel).await?;
        log::info!(
            "Stored session for {} is {}",
            session.account,
            if valid { "valid" } else { "no longer accepted" }
        );
        Ok(valid)
    }

    /// Reuses the stored session if the service still accepts it. A rejected
    /// session is removed so the next run does not try it again.
    pub async fn restore(&self, cancel: &CancellationToken) -> Result<Option<Session>> {
        let Some(session) = self.store.load() else {
            return Ok(None);
        };
        if self.validate(&session, cancel).await? {
            *self.active() = Some(session.clone());
            self.transition(AuthState::Authenticated {
                account: session.account.clone(),
            });
            return Ok(Some(session));
        }
        self.store.clear()?;
        self.driver.clear_state().await?;
        self.transition(AuthState::LoggedOut);
        Ok(None)
    }

    /// Active session, restoring the stored one or logging in with `method`
    /// as needed.
    pub async fn ensure_session(
        &self,
        method: Option<LoginMethod>,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let active = self.active().clone();
        if let Some(session) = active {
            return Ok(session);
        }
        if let Some(session) = self.restore(cancel).await? {
            return Ok(session);
        }
        match method {
            Some(method) => self.login(method, cancel).await,
            None => Err(Error::NoSession),
        }
    }

    /// Drops a session the service rejected mid-operation.
    pub fn handle_expired(&self) -> Result<()> {
        log::warn!("Session expired, re-authentication required");
        self.active().take();
        self.store.clear()?;
        self.transition(AuthState::Authenticating);
        Ok(())
    }

    /// Gives up on re-authenticating after an expiry.
    pub fn abandon(&self) {
        if self.state() != AuthState::LoggedOut {
            self.transition(AuthState::LoggedOut);
        }
    }

    /// Forgets the session, first signing out on the service when `remote`
    /// is set. Calling it with no session anywhere does nothing.
    pub async fn logout(&self, remote: bool, cancel: &CancellationToken) -> Result<()> {
        if self.checked_out.load(Ordering::Acquire) {
            return Err(Error::SessionBusy);
        }
        let active = self.active().clone();
        let session = active.or_else(|| self.store.load());
        if session.is_none() && !self.store.exists() {
            log::info!("No active session, nothing to log out");
            self.transition(AuthState::LoggedOut);
            return Ok(());
        }

        if let Some(session) = session.filter(|_| remote) {
            if let Err(e) = self.remote_logout(&session, cancel).await {
                if matches!(e, Error::Cancelled) {
                    return Err(e);
                }
                log::warn!("Remote logout failed: {}", e);
            }
        }

        self.active().take();
        self.store.clear()?;
        if let Err(e) = self.driver.clear_state().await {
            log::warn!("Failed to clear browser state: {}", e);
        }
        self.transition(AuthState::LoggedOut);
        log::info!("Logged out successfully");
        Ok(())
    }

    async fn remote_logout(&self, session: &Session, cancel: &CancellationToken) -> Result<()> {
        self.driver.import_state(&session.state).await?;
        self.throttle.delay(cancel).await?;
        self.driver.navigate(&self.settings.site.logout_url()).await?;
        Ok(())
    }

    /// Lends the active session to one consumer at a time.
    pub fn checkout(&self) -> Result<SessionLease<'_>> {
        let session = self.active().clone().ok_or(Error::NoSession)?;
        if self.checked_out.swap(true, Ordering::AcqRel) {
            return Err(Error::SessionBusy);
        }
        Ok(SessionLease {
            auth: self,
            session,
        })
    }
}

/// Exclusive, read-only use of the active session and its browser tab.
/// Released on drop.
pub struct SessionLease<'a> {
    auth: &'a Authenticator,
    session: Session,
}

impl SessionLease<'_> {
    pub fn driver(&self) -> &dyn PageDriver {
        self.auth.driver.as_ref()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.auth.checked_out.store(false, Ordering::Release);
    }
}
