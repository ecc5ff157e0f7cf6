//! Bounded re-checks for asynchronously rendered content.
//!
//! These loops are the only local recovery in the crate: they poll until a
//! signal appears or the deadline passes, and every sleep is a cancellable
//! suspension point.

use super::{dom, PageDriver};
use crate::error::Result;
use crate::throttle::pause;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Index of the first selector that matched.
    Found(usize),
    TimedOut,
}

/// Polls the page until one of `selectors` matches or `timeout` elapses.
///
/// Driver errors while polling count as "not yet"; invalid selectors are
/// reported immediately.
pub async fn wait_for_any(
    driver: &dyn PageDriver,
    selectors: &[&str],
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<WaitOutcome> {
    let compiled = selectors
        .iter()
        .map(|css| dom::selector(css))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let deadline = Instant::now() + timeout;

    loop {
        if let Ok(html) = driver.html().await {
            let document = scraper::Html::parse_document(&html);
            if let Some(idx) = compiled
                .iter()
                .position(|sel| document.select(sel).next().is_some())
            {
                return Ok(WaitOutcome::Found(idx));
            }
        }

        if Instant::now() >= deadline {
            log::debug!("Timed out after {:?} waiting for {:?}", timeout, selectors);
            return Ok(WaitOutcome::TimedOut);
        }
        pause(poll, cancel).await?;
    }
}

/// Polls the current URL until `done` accepts it. Returns the accepted URL,
/// or `None` on timeout.
pub async fn wait_for_url<F>(
    driver: &dyn PageDriver,
    mut done: F,
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<Option<String>>
where
    F: FnMut(&str) -> bool + Send,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(url) = driver.current_url().await {
            if done(&url) {
                return Ok(Some(url));
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        pause(poll, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::{ScriptedDriver, ScriptedPage};

    const URL: &str = "https://quizlet.test/latest";

    #[tokio::test(start_paused = true)]
    async fn test_wait_finds_late_content() {
        let driver = ScriptedDriver::new();
        driver.add_page(
            URL,
            ScriptedPage::new("<div class='spinner'></div>")
                .then_after_polls(3, "<div class='spinner'></div><a class='set'>x</a>"),
        );
        driver.navigate(URL).await.unwrap();

        let cancel = CancellationToken::new();
        let outcome = wait_for_any(
            &driver,
            &[".empty", "a.set"],
            Duration::from_secs(5),
            Duration::from_millis(250),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Found(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let driver = ScriptedDriver::new();
        driver.add_page(URL, ScriptedPage::new("<p>loading</p>"));
        driver.navigate(URL).await.unwrap();

        let cancel = CancellationToken::new();
        let start = Instant::now();
        let outcome = wait_for_any(
            &driver,
            &["a.set"],
            Duration::from_secs(2),
            Duration::from_millis(500),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let driver = ScriptedDriver::new();
        driver.add_page(URL, ScriptedPage::new("<p>loading</p>"));
        driver.navigate(URL).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_for_any(
            &driver,
            &["a.set"],
            Duration::from_secs(60),
            Duration::from_millis(500),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_url() {
        let driver = ScriptedDriver::new();
        driver.add_page(URL, ScriptedPage::new("<p>home</p>"));
        driver.navigate(URL).await.unwrap();

        let cancel = CancellationToken::new();
        let found = wait_for_url(
            &driver,
            |url| url.ends_with("/latest"),
            Duration::from_secs(1),
            Duration::from_millis(100),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(found.as_deref(), Some(URL));

        let missing = wait_for_url(
            &driver,
            |url| url.contains("/never"),
            Duration::from_secs(1),
            Duration::from_millis(100),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(missing, None);
    }
}
