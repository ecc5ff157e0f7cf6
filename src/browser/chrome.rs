use super::stealth::stealth_script;
use super::{BrowserConfig, BrowserError, CapturedResponse, PageDriver, WEB_API_PATH};
use crate::models::{Cookie, OriginStorage, StorageState};
use crate::throttle::Fingerprint;
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Network::events::ResponseReceivedEventParams;
use headless_chrome::protocol::cdp::Network::{CookieParam, DeleteCookies, GetResponseBodyReturnObject};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Chrome closes itself after this long without DevTools traffic. Manual
/// logins can sit idle for minutes.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const RESPONSE_HANDLER: &str = "webapi-capture";

type Captured = Arc<Mutex<Vec<CapturedResponse>>>;

fn lock(captured: &Captured) -> MutexGuard<'_, Vec<CapturedResponse>> {
    captured.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the body of a finished web API response when it is JSON.
fn capture(
    captured: &Captured,
    params: &ResponseReceivedEventParams,
    body: anyhow::Result<GetResponseBodyReturnObject>,
) {
    let response = &params.response;
    if !response.url.contains(WEB_API_PATH) || !response.mime_type.contains("json") {
        return;
    }
    match body {
        Ok(body) => {
            log::debug!("Captured API response from {}", response.url);
            lock(captured).push(CapturedResponse {
                url: response.url.clone(),
                body: body.body,
            });
        }
        Err(e) => log::debug!("Could not read API response from {}: {}", response.url, e),
    }
}

/// Cookie as reported by `Network.getCookies`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdpCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    #[serde(default)]
    expires: f64,
    #[serde(default)]
    http_only: bool,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    session: bool,
}

impl From<CdpCookie> for Cookie {
    fn from(c: CdpCookie) -> Self {
        Self {
            name: c.name,
            value: c.value,
            domain: c.domain,
            path: c.path,
            expires: (!c.session && c.expires > 0.0).then_some(c.expires),
            http_only: c.http_only,
            secure: c.secure,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageStorage {
    origin: String,
    items: BTreeMap<String, String>,
}

/// [`PageDriver`] backed by a single headless_chrome tab.
pub struct ChromeDriver {
    // Dropping the browser kills the Chrome process.
    _browser: Browser,
    tab: Arc<Tab>,
    fingerprint: Fingerprint,
    stealth: bool,
    captured: Captured,
}

impl ChromeDriver {
    /// Launches Chrome presenting `fingerprint`.
    pub async fn launch(config: BrowserConfig, fingerprint: Fingerprint) -> Result<Self, BrowserError> {
        tokio::task::spawn_blocking(move || Self::launch_blocking(&config, fingerprint))
            .await
            .map_err(|e| BrowserError::TaskFailed(e.to_string()))?
    }

    fn launch_blocking(config: &BrowserConfig, fingerprint: Fingerprint) -> Result<Self, BrowserError> {
        let owned_args = config.launch_args(&fingerprint);
        let args: Vec<&OsStr> = owned_args.iter().map(OsStr::new).collect();

        let options = LaunchOptions::default_builder()
            .headless(config.headless)
            .window_size(Some((fingerprint.viewport.width, fingerprint.viewport.height)))
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .args(args)
            .build()
            .map_err(|e| BrowserError::ConfigurationError(e.to_string()))?;

        let browser =
            Browser::new(options).map_err(|e| BrowserError::InitializationError(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| BrowserError::InitializationError(e.to_string()))?;
        tab.set_default_timeout(config.timeout());
        tab.set_user_agent(&fingerprint.user_agent, Some(&fingerprint.locale), None)
            .map_err(|e| BrowserError::ConfigurationError(e.to_string()))?;

        let captured: Captured = Arc::default();
        let sink = Arc::clone(&captured);
        tab.register_response_handling(
            RESPONSE_HANDLER,
            Box::new(move |params, fetch_body| capture(&sink, &params, fetch_body())),
        )
        .map_err(|e| BrowserError::InitializationError(format!("Response capture failed: {}", e)))?;

        log::info!(
            "Launched Chrome (headless: {}, viewport {}x{})",
            config.headless,
            fingerprint.viewport.width,
            fingerprint.viewport.height
        );

        Ok(Self {
            _browser: browser,
            tab,
            fingerprint,
            stealth: config.stealth,
            captured,
        })
    }

    /// Runs a blocking CDP call off the async runtime.
    async fn run<T, F>(&self, f: F) -> Result<T, BrowserError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T, BrowserError> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| BrowserError::TaskFailed(e.to_string()))?
    }
}

fn evaluate(tab: &Tab, script: &str) -> Result<Value, BrowserError> {
    let result = tab
        .evaluate(script, false)
        .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
    Ok(result.value.unwrap_or(Value::Null))
}

/// JS string literal for `s`.
fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

#[async_trait]
impl PageDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        log::info!("Browser navigating to: {}", url);
        let url = url.to_string();
        let script = self.stealth.then(|| stealth_script(&self.fingerprint));
        lock(&self.captured).clear();

        self.run(move |tab| {
            tab.navigate_to(&url).map_err(|e| {
                BrowserError::NavigationError(format!("Failed to navigate to {}: {}", url, e))
            })?;
            tab.wait_until_navigated().map_err(|e| {
                BrowserError::NavigationError(format!("Navigation timeout for {}: {}", url, e))
            })?;
            if let Some(script) = script {
                if let Err(e) = tab.evaluate(&script, false) {
                    log::debug!("Stealth script failed on {}: {}", url, e);
                }
            }
            Ok(())
        })
        .await
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.run(|tab| Ok(tab.get_url())).await
    }

    async fn html(&self) -> Result<String, BrowserError> {
        self.run(|tab| {
            tab.get_content()
                .map_err(|e| BrowserError::HtmlExtractionError(e.to_string()))
        })
        .await
    }

    async fn exists(&self, selector: &str) -> Result<bool, BrowserError> {
        let script = format!("document.querySelector({}) !== null", js_string(selector));
        self.run(move |tab| Ok(evaluate(tab, &script)?.as_bool() == Some(true)))
            .await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let selector = selector.to_string();
        let value = value.to_string();
        self.run(move |tab| {
            let element = tab
                .find_element(&selector)
                .map_err(|_| BrowserError::ElementNotFound(selector.clone()))?;
            element
                .click()
                .map_err(|e| BrowserError::JavaScriptError(format!("Focus failed: {}", e)))?;
            element
                .type_into(&value)
                .map_err(|e| BrowserError::JavaScriptError(format!("Typing failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<bool, BrowserError> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({});
                if (!el) return false;
                el.click();
                return true;
            }})()"#,
            js_string(selector)
        );
        self.run(move |tab| Ok(evaluate(tab, &script)?.as_bool() == Some(true)))
            .await
    }

    async fn click_with_text(&self, selector: &str, text: &str) -> Result<bool, BrowserError> {
        let script = format!(
            r#"(() => {{
                const needle = {};
                const el = Array.from(document.querySelectorAll({}))
                    .find(e => (e.innerText || e.textContent || '').includes(needle));
                if (!el) return false;
                el.click();
                return true;
            }})()"#,
            js_string(text),
            js_string(selector)
        );
        self.run(move |tab| Ok(evaluate(tab, &script)?.as_bool() == Some(true)))
            .await
    }

    async fn scroll_to_bottom(&self) -> Result<(), BrowserError> {
        self.run(|tab| {
            evaluate(tab, "window.scrollTo(0, document.body.scrollHeight);")
                .map_err(|e| BrowserError::JavaScriptError(format!("Scroll failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn captured_responses(&self) -> Result<Vec<CapturedResponse>, BrowserError> {
        Ok(lock(&self.captured).clone())
    }

    async fn export_state(&self) -> Result<StorageState, BrowserError> {
        self.run(|tab| {
            let cookies = tab
                .get_cookies()
                .map_err(|e| BrowserError::JavaScriptError(format!("Reading cookies failed: {}", e)))?
                .into_iter()
                .map(|c| {
                    serde_json::to_value(&c)
                        .and_then(serde_json::from_value::<CdpCookie>)
                        .map(Cookie::from)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BrowserError::JavaScriptError(format!("Unexpected cookie shape: {}", e)))?;

            let raw = evaluate(
                tab,
                "JSON.stringify({ origin: location.origin, items: Object.assign({}, localStorage) })",
            )?;
            let mut origins = Vec::new();
            if let Some(raw) = raw.as_str() {
                let storage: PageStorage = serde_json::from_str(raw)
                    .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
                if storage.origin.starts_with("http") && !storage.items.is_empty() {
                    origins.push(OriginStorage {
                        origin: storage.origin,
                        local_storage: storage.items,
                    });
                }
            }

            Ok(StorageState { cookies, origins })
        })
        .await
    }

    async fn import_state(&self, state: &StorageState) -> Result<(), BrowserError> {
        let params = state
            .cookies
            .iter()
            .map(|c| {
                let mut param = json!({
                    "name": c.name,
                    "value": c.value,
                    "domain": c.domain,
                    "path": c.path,
                    "secure": c.secure,
                    "httpOnly": c.http_only,
                });
                if let Some(expires) = c.expires {
                    param["expires"] = json!(expires);
                }
                serde_json::from_value::<CookieParam>(param)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BrowserError::ConfigurationError(format!("Invalid cookie: {}", e)))?;

        if !params.is_empty() {
            self.run(move |tab| {
                tab.set_cookies(params)
                    .map_err(|e| BrowserError::JavaScriptError(format!("Setting cookies failed: {}", e)))
            })
            .await?;
        }

        for origin in &state.origins {
            if origin.local_storage.is_empty() {
                continue;
            }
            // localStorage is only writable from a page on its origin.
            self.navigate(&origin.origin).await?;
            let items = serde_json::to_string(&origin.local_storage)
                .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
            let script = format!(
                "(() => {{ const items = {}; for (const [k, v] of Object.entries(items)) localStorage.setItem(k, v); }})()",
                items
            );
            self.run(move |tab| evaluate(tab, &script).map(|_| ())).await?;
        }
        Ok(())
    }

    async fn clear_state(&self) -> Result<(), BrowserError> {
        self.run(|tab| {
            let cookies = tab
                .get_cookies()
                .map_err(|e| BrowserError::JavaScriptError(format!("Reading cookies failed: {}", e)))?;
            let doomed = cookies
                .iter()
                .map(|c| {
                    serde_json::from_value::<DeleteCookies>(json!({
                        "name": c.name,
                        "domain": c.domain,
                        "path": c.path,
                    }))
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
            if !doomed.is_empty() {
                tab.delete_cookies(doomed)
                    .map_err(|e| BrowserError::JavaScriptError(format!("Deleting cookies failed: {}", e)))?;
            }
            // about:blank has no storage; ignore the SecurityError there.
            evaluate(
                tab,
                "(() => { try { localStorage.clear(); sessionStorage.clear(); } catch (e) {} })()",
            )?;
            Ok(())
        })
        .await
    }
}
