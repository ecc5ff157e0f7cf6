//! In-memory [`PageDriver`] for tests.
//!
//! Pages are registered by URL as a list of HTML stages. A stage becomes
//! current after a number of `html()` polls, a scroll or a click, which is
//! enough to model asynchronously rendered and lazy-loaded pages. A cookie
//! gate redirects every non-public page to the login page until the named
//! cookie is present.

use crate::browser::{dom, BrowserError, CapturedResponse, PageDriver};
use crate::models::{Cookie, StorageState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

const NOT_FOUND_HTML: &str = "<html><head><title>404</title></head><body><h1>Page not found</h1></body></html>";

#[derive(Debug, Clone)]
enum Trigger {
    AfterPolls(usize),
    OnScroll,
    OnClick(String),
}

#[derive(Debug, Clone)]
struct Stage {
    trigger: Option<Trigger>,
    html: String,
}

/// Side effects of clicking an element.
#[derive(Debug, Clone)]
pub enum Effect {
    Navigate(String),
    SetCookie { name: String, value: String },
    ClearCookies,
}

#[derive(Debug, Clone)]
pub struct ScriptedPage {
    stages: Vec<Stage>,
    clicks: Vec<(String, Vec<Effect>)>,
    responses: Vec<CapturedResponse>,
    public: bool,
}

impl ScriptedPage {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            stages: vec![Stage {
                trigger: None,
                html: html.into(),
            }],
            clicks: Vec::new(),
            responses: Vec::new(),
            public: false,
        }
    }

    /// Next stage renders after `polls` further reads of the page.
    pub fn then_after_polls(mut self, polls: usize, html: impl Into<String>) -> Self {
        self.stages.push(Stage {
            trigger: Some(Trigger::AfterPolls(polls)),
            html: html.into(),
        });
        self
    }

    pub fn then_on_scroll(mut self, html: impl Into<String>) -> Self {
        self.stages.push(Stage {
            trigger: Some(Trigger::OnScroll),
            html: html.into(),
        });
        self
    }

    pub fn then_on_click(mut self, selector: impl Into<String>, html: impl Into<String>) -> Self {
        self.stages.push(Stage {
            trigger: Some(Trigger::OnClick(selector.into())),
            html: html.into(),
        });
        self
    }

    pub fn on_click(mut self, selector: impl Into<String>, effects: Vec<Effect>) -> Self {
        self.clicks.push((selector.into(), effects));
        self
    }

    /// A JSON response the page fetches while loading.
    pub fn with_response(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.responses.push(CapturedResponse {
            url: url.into(),
            body: body.into(),
        });
        self
    }

    /// Reachable without the gate cookie.
    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }
}

struct Gate {
    cookie: String,
    login_url: String,
}

struct ManualLogin {
    polls_left: usize,
    cookie: String,
    landing_url: String,
}

#[derive(Default)]
struct Inner {
    pages: HashMap<String, ScriptedPage>,
    gate: Option<Gate>,
    manual: Option<ManualLogin>,
    cancel_on: Vec<(String, CancellationToken)>,
    current_url: String,
    stage: usize,
    polls: usize,
    visited: Vec<String>,
    filled: Vec<(String, String)>,
    clicked: Vec<String>,
    state: StorageState,
}

fn key(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

impl Inner {
    fn page(&self) -> Option<&ScriptedPage> {
        self.pages.get(&key(&self.current_url))
    }

    fn current_html(&self) -> String {
        match self.page() {
            Some(page) => page.stages[self.stage.min(page.stages.len() - 1)].html.clone(),
            None => NOT_FOUND_HTML.to_string(),
        }
    }

    fn next_trigger(&self) -> Option<Trigger> {
        self.page()
            .and_then(|page| page.stages.get(self.stage + 1))
            .and_then(|stage| stage.trigger.clone())
    }

    fn advance(&mut self) {
        self.stage += 1;
        self.polls = 0;
    }

    fn has_cookie(&self, name: &str) -> bool {
        self.state.cookies.iter().any(|c| c.name == name)
    }

    fn set_cookie(&mut self, name: &str, value: &str) {
        self.state.cookies.retain(|c| c.name != name);
        self.state.cookies.push(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: ".quizlet.test".to_string(),
            path: "/".to_string(),
            expires: None,
            http_only: true,
            secure: true,
        });
    }

    fn load(&mut self, url: &str) {
        let mut target = url.to_string();
        if let Some(gate) = &self.gate {
            let public = self.pages.get(&key(url)).map(|p| p.public).unwrap_or(false);
            if !public && key(url) != key(&gate.login_url) && !self.has_cookie(&gate.cookie) {
                target = gate.login_url.clone();
            }
        }
        self.current_url = target;
        self.stage = 0;
        self.polls = 0;
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Navigate(url) => self.load(&url),
                Effect::SetCookie { name, value } => self.set_cookie(&name, &value),
                Effect::ClearCookies => self.state.cookies.clear(),
            }
        }
    }
}

/// Scripted, in-memory browser tab.
#[derive(Default)]
pub struct ScriptedDriver {
    inner: Mutex<Inner>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        let driver = Self::default();
        driver.lock().current_url = "about:blank".to_string();
        driver
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_page(&self, url: &str, page: ScriptedPage) {
        self.lock().pages.insert(key(url), page);
    }

    /// Redirects every non-public page to `login_url` while `cookie` is unset.
    pub fn require_cookie(&self, cookie: &str, login_url: &str) {
        self.lock().gate = Some(Gate {
            cookie: cookie.to_string(),
            login_url: login_url.to_string(),
        });
    }

    /// Simulates a person finishing the login in the window: after `polls`
    /// URL checks on the login page, `cookie` is set and the tab lands on
    /// `landing_url`.
    pub fn complete_manual_login_after(&self, polls: usize, cookie: &str, landing_url: &str) {
        self.lock().manual = Some(ManualLogin {
            polls_left: polls,
            cookie: cookie.to_string(),
            landing_url: landing_url.to_string(),
        });
    }

    /// Cancels `token` when `url` is requested.
    pub fn cancel_on_visit(&self, url: &str, token: CancellationToken) {
        self.lock().cancel_on.push((key(url), token));
    }

    pub fn set_cookie(&self, name: &str, value: &str) {
        self.lock().set_cookie(name, value);
    }

    pub fn has_cookie(&self, name: &str) -> bool {
        self.lock().has_cookie(name)
    }

    /// Every URL passed to `navigate`, in order.
    pub fn visited(&self) -> Vec<String> {
        self.lock().visited.clone()
    }

    pub fn visit_count(&self, url: &str) -> usize {
        let wanted = key(url);
        self.lock().visited.iter().filter(|u| key(u) == wanted).count()
    }

    pub fn filled(&self) -> Vec<(String, String)> {
        self.lock().filled.clone()
    }

    pub fn clicked(&self) -> Vec<String> {
        self.lock().clicked.clone()
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let mut inner = self.lock();
        inner.visited.push(url.to_string());
        let wanted = key(url);
        for (target, token) in &inner.cancel_on {
            if *target == wanted {
                token.cancel();
            }
        }
        inner.load(url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let on_login = inner
            .gate
            .as_ref()
            .map(|g| key(&g.login_url) == key(&inner.current_url))
            .unwrap_or(false);
        if on_login {
            if let Some(manual) = inner.manual.as_mut() {
                if manual.polls_left == 0 {
                    let cookie = manual.cookie.clone();
                    let landing = manual.landing_url.clone();
                    inner.manual = None;
                    inner.set_cookie(&cookie, "manual");
                    inner.load(&landing);
                } else {
                    manual.polls_left -= 1;
                }
            }
        }
        Ok(inner.current_url.clone())
    }

    async fn html(&self) -> Result<String, BrowserError> {
        let mut inner = self.lock();
        inner.polls += 1;
        if let Some(Trigger::AfterPolls(n)) = inner.next_trigger() {
            if inner.polls > n {
                inner.advance();
            }
        }
        Ok(inner.current_html())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let mut inner = self.lock();
        if !dom::matches(&inner.current_html(), selector)? {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        inner.filled.push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<bool, BrowserError> {
        let mut inner = self.lock();
        if !dom::matches(&inner.current_html(), selector)? {
            return Ok(false);
        }
        inner.clicked.push(selector.to_string());

        let effects = inner
            .page()
            .and_then(|p| p.clicks.iter().find(|(s, _)| s == selector))
            .map(|(_, effects)| effects.clone());
        if matches!(inner.next_trigger(), Some(Trigger::OnClick(ref s)) if s == selector) {
            inner.advance();
        }
        if let Some(effects) = effects {
            inner.apply(effects);
        }
        Ok(true)
    }

    async fn click_with_text(&self, selector: &str, text: &str) -> Result<bool, BrowserError> {
        let found = {
            let inner = self.lock();
            let sel = dom::selector(selector)?;
            let document = scraper::Html::parse_document(&inner.current_html());
            document
                .select(&sel)
                .any(|el| el.text().collect::<String>().contains(text))
        };
        if !found {
            return Ok(false);
        }
        self.click(selector).await
    }

    async fn scroll_to_bottom(&self) -> Result<(), BrowserError> {
        let mut inner = self.lock();
        if let Some(Trigger::OnScroll) = inner.next_trigger() {
            inner.advance();
        }
        Ok(())
    }

    async fn captured_responses(&self) -> Result<Vec<CapturedResponse>, BrowserError> {
        Ok(self.lock().page().map(|p| p.responses.clone()).unwrap_or_default())
    }

    async fn export_state(&self) -> Result<StorageState, BrowserError> {
        Ok(self.lock().state.clone())
    }

    async fn import_state(&self, state: &StorageState) -> Result<(), BrowserError> {
        self.lock().state = state.clone();
        Ok(())
    }

    async fn clear_state(&self) -> Result<(), BrowserError> {
        self.lock().state = StorageState::default();
        Ok(())
    }
}
