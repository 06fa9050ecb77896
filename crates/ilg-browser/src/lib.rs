//! Managed Chromium sessions: launch, stealth page setup, paced navigation.

use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use rand::Rng;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "ilg-browser";

/// Flags passed to every Chromium launch. Sandboxing is disabled because the
/// crawler commonly runs inside containers without user namespaces.
const CHROME_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-accelerated-2d-canvas",
    "--disable-gpu",
    "--window-size=1280,800",
];

/// URL patterns blocked on every page. Listing and profile extraction only
/// needs the DOM, so heavyweight assets are dropped at the network layer.
const BLOCKED_URL_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.svg", "*.webp", "*.ico", "*.css", "*.woff",
    "*.woff2", "*.ttf", "*.otf", "*.mp4", "*.avi",
];

/// Script injected before any document loads to mask obvious automation
/// fingerprints.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
Object.defineProperty(navigator, 'languages', { get: () => ['de-DE', 'de'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
"#;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("devtools error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("script result was not deserializable: {0}")]
    ScriptResult(#[from] serde_json::Error),
    #[error("invalid script parameters: {0}")]
    Script(String),
    #[error("timed out during {what}")]
    Timeout { what: String },
}

/// Launch settings for one browser session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub headless: bool,
    /// Explicit Chromium binary; when `None` the system default is probed.
    pub executable: Option<String>,
    pub nav_timeout: Duration,
    pub selector_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            nav_timeout: Duration::from_secs(60),
            selector_timeout: Duration::from_secs(60),
        }
    }
}

/// A running Chromium instance plus the task that pumps its event stream.
pub struct BrowserSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    config: SessionConfig,
}

impl BrowserSession {
    pub async fn launch(config: SessionConfig) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder().args(CHROME_ARGS.to_vec());
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &config.executable {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(browser_config).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser event stream error");
                }
            }
        });
        Ok(Self {
            browser,
            handler_task,
            config,
        })
    }

    /// Open a fresh tab with stealth scripts installed and nonessential
    /// resources blocked.
    pub async fn open_page(&self) -> Result<PageSession, BrowserError> {
        let page = self.browser.new_page("about:blank").await?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_SCRIPT))
            .await?;
        page.execute(EnableParams::default()).await?;
        page.execute(SetBlockedUrLsParams::new(
            BLOCKED_URL_PATTERNS.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        ))
        .await?;
        Ok(PageSession {
            page,
            nav_timeout: self.config.nav_timeout,
            selector_timeout: self.config.selector_timeout,
        })
    }

    pub async fn close(mut self) -> Result<(), BrowserError> {
        self.browser.close().await?;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        Ok(())
    }
}

/// One open tab. Navigation and selector waits are bounded by the session's
/// timeouts.
pub struct PageSession {
    page: Page,
    nav_timeout: Duration,
    selector_timeout: Duration,
}

impl PageSession {
    pub async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        match tokio::time::timeout(self.nav_timeout, self.page.goto(url)).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(BrowserError::Timeout {
                what: format!("navigation to {url}"),
            }),
        }
    }

    /// Poll for a selector until it appears or the selector timeout elapses.
    /// Returns whether the element showed up.
    pub async fn wait_for_selector(&self, selector: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.selector_timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn has_element(&self, selector: &str) -> bool {
        self.page.find_element(selector).await.is_ok()
    }

    /// Run a script in the page and deserialize its (awaited) result.
    pub async fn evaluate_json<T: DeserializeOwned>(&self, js: &str) -> Result<T, BrowserError> {
        let params = EvaluateParams::builder()
            .expression(js)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(BrowserError::Script)?;
        let value = self.page.evaluate(params).await?.into_value()?;
        Ok(value)
    }

    /// Current DOM serialized to HTML.
    pub async fn content(&self) -> Result<String, BrowserError> {
        Ok(self.page.content().await?)
    }

    pub async fn close(self) -> Result<(), BrowserError> {
        self.page.close().await?;
        Ok(())
    }
}

/// Navigate with a bounded number of attempts, pausing briefly between
/// failures. The last error is propagated if every attempt fails.
pub async fn navigate_with_retry(
    page: &PageSession,
    url: &str,
    max_attempts: u32,
) -> Result<(), BrowserError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match page.goto(url).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < max_attempts => {
                warn!(%url, attempt, error = %err, "navigation failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Sleep for a uniformly random duration in `[min, max]`.
pub async fn random_delay(min: Duration, max: Duration) {
    let wait = {
        let mut rng = rand::thread_rng();
        rng.gen_range(min..=max)
    };
    tokio::time::sleep(wait).await;
}

pub fn is_valid_url(candidate: &str) -> bool {
    Url::parse(candidate).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_urls_are_valid() {
        assert!(is_valid_url("https://de.indeed.com/jobs?q=nurse&start=0"));
        assert!(is_valid_url("http://localhost:3000/api/leads"));
    }

    #[test]
    fn fragments_and_relative_paths_are_not() {
        assert!(!is_valid_url("/cmp/acme"));
        assert!(!is_valid_url("not a url"));
        assert!(!is_valid_url(""));
    }

    #[tokio::test(start_paused = true)]
    async fn random_delay_stays_within_bounds() {
        let start = tokio::time::Instant::now();
        random_delay(Duration::from_secs(2), Duration::from_secs(5)).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed <= Duration::from_secs(5) + Duration::from_millis(10));
    }
}
