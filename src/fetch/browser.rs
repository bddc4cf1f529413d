use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::auth::Credentials;
use chromiumoxide::cdp::browser_protocol::network::{
    Cookie as BrowserCookie, CookieParam, SetUserAgentOverrideParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::EventLifecycleEvent;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::{AttemptOutcome, FetchStrategy, FetchedPage};
use crate::config::BrowserSettings;
use crate::models::FetchTarget;
use crate::proxy::ProxyCandidate;
use crate::session::{persist_session, Cookie, SessionState};

pub const NAME: &str = "browser";

const CONTENT_SELECTOR: &str = "article, main";
const CONTENT_POLLS: usize = 3;
const CONTENT_POLL_INTERVAL: Duration = Duration::from_secs(4);

/// What a navigation waits for before the page counts as loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    NetworkIdle,
    /// Looser: the main document has been parsed. Pages with endless
    /// background requests never go idle.
    DomReady,
}

/// A timeout moves on to the next stage; a navigation error ends the attempt.
const SETTLE_STAGES: [Settle; 2] = [Settle::NetworkIdle, Settle::DomReady];

impl Settle {
    fn reached_by(self, lifecycle: &str) -> bool {
        match self {
            Settle::NetworkIdle => lifecycle == "networkIdle",
            Settle::DomReady => matches!(
                lifecycle,
                "DOMContentLoaded" | "load" | "networkAlmostIdle" | "networkIdle"
            ),
        }
    }
}

/// Watches main-frame lifecycle names. Events only count once the new
/// document has committed (`init`), so leftovers from `about:blank` or an
/// earlier stage are ignored.
struct SettleTracker {
    stage: Settle,
    committed: bool,
}

impl SettleTracker {
    fn new(stage: Settle) -> Self {
        Self {
            stage,
            committed: false,
        }
    }

    fn observe(&mut self, lifecycle: &str) -> bool {
        if lifecycle == "init" {
            self.committed = true;
            return false;
        }
        self.committed && self.stage.reached_by(lifecycle)
    }
}

#[derive(Debug)]
enum NavError {
    TimedOut,
    Failed(String),
}

/// Pause before the next content check; `None` once the checks are used up.
fn poll_pause(poll: usize) -> Option<Duration> {
    (poll + 1 < CONTENT_POLLS).then_some(CONTENT_POLL_INTERVAL)
}

/// Chromium takes only the endpoint on the command line; credentials are
/// answered per page through the auth challenge handler.
fn proxy_server_arg(proxy: &ProxyCandidate) -> String {
    format!("--proxy-server={}", proxy.server())
}

fn proxy_credentials(proxy: &ProxyCandidate) -> Option<Credentials> {
    proxy
        .credentials()
        .map(|(username, password)| Credentials { username, password })
}

pub struct BrowserStrategy {
    settings: BrowserSettings,
    user_agent: String,
    timeout: Duration,
    persist_to: Option<PathBuf>,
}

impl BrowserStrategy {
    pub fn new(
        settings: BrowserSettings,
        user_agent: String,
        timeout: Duration,
        persist_to: Option<PathBuf>,
    ) -> Self {
        Self {
            settings,
            user_agent,
            timeout,
            persist_to,
        }
    }

    /// Every attempt launches its own browser so nothing leaks between proxies.
    async fn launch(&self, proxy: Option<&ProxyCandidate>) -> Result<(Browser, JoinHandle<()>), String> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(self.timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");

        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.settings.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if let Some(proxy) = proxy {
            builder = builder.arg(proxy_server_arg(proxy));
        }

        let config = builder
            .build()
            .map_err(|e| format!("browser config rejected: {}", e))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| format!("browser launch failed: {}", e))?;

        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        Ok((browser, events))
    }

    /// Start navigating to `url` and wait, within the timeout, until the main
    /// frame reaches `stage`.
    async fn settle(&self, page: &Page, url: &str, stage: Settle) -> Result<(), NavError> {
        let mut lifecycle = page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(|e| NavError::Failed(format!("could not watch page lifecycle: {}", e)))?;
        let main_frame = page.mainframe().await.ok().flatten();

        let navigating = page.clone();
        let destination = url.to_string();
        let mut navigation =
            tokio::spawn(async move { navigating.goto(destination).await.map(|_| ()) });
        let mut tracker = SettleTracker::new(stage);
        let mut navigated = false;

        let waited = tokio::time::timeout(self.timeout, async {
            loop {
                tokio::select! {
                    joined = &mut navigation, if !navigated => {
                        navigated = true;
                        match joined {
                            Ok(Ok(())) | Ok(Err(CdpError::Timeout)) => {}
                            Ok(Err(e)) => return Err(NavError::Failed(format!("navigation failed: {}", e))),
                            Err(e) => return Err(NavError::Failed(format!("navigation task failed: {}", e))),
                        }
                    }
                    event = lifecycle.next() => match event {
                        Some(event) => {
                            let in_main_frame = main_frame.as_ref().map_or(true, |f| *f == event.frame_id);
                            if in_main_frame && tracker.observe(&event.name) {
                                return Ok(());
                            }
                        }
                        None => return Err(NavError::Failed("page closed during navigation".to_string())),
                    }
                }
            }
        })
        .await;

        navigation.abort();
        waited.unwrap_or(Err(NavError::TimedOut))
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<(), String> {
        for stage in SETTLE_STAGES {
            match self.settle(page, url, stage).await {
                Ok(()) => {
                    debug!(?stage, "page settled");
                    return Ok(());
                }
                Err(NavError::TimedOut) => debug!(?stage, "page did not settle in time"),
                Err(NavError::Failed(message)) => return Err(message),
            }
        }
        Err(format!("navigation timed out after {}ms", self.timeout.as_millis()))
    }

    /// Challenges and lazy loaders need a moment before the article exists.
    async fn await_content(&self, page: &Page) -> bool {
        let mut poll = 0;
        loop {
            if page.find_element(CONTENT_SELECTOR).await.is_ok() {
                return true;
            }
            match poll_pause(poll) {
                Some(pause) => {
                    debug!(poll = poll + 1, "content region not present yet");
                    tokio::time::sleep(pause).await;
                }
                None => return false,
            }
            poll += 1;
        }
    }

    async fn load(&self, page: &Page, target: &FetchTarget) -> AttemptOutcome {
        if let Err(message) = self.navigate(page, target.url.as_str()).await {
            return AttemptOutcome::transient(NAME, message);
        }
        if !self.await_content(page).await {
            warn!("content region never appeared; reading the page as is");
        }

        let markup = match page.content().await {
            Ok(markup) => markup,
            Err(e) => return AttemptOutcome::transient(NAME, format!("could not read page: {}", e)),
        };
        let title = page.get_title().await.ok().flatten().unwrap_or_default();

        AttemptOutcome::classify(FetchedPage {
            markup,
            title: title.trim().to_string(),
            strategy: NAME,
        })
    }

    async fn drive(
        &self,
        browser: &Browser,
        target: &FetchTarget,
        proxy: Option<&ProxyCandidate>,
        session: &SessionState,
    ) -> AttemptOutcome {
        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => return AttemptOutcome::transient(NAME, format!("could not open page: {}", e)),
        };

        if let Err(e) = page
            .execute(SetUserAgentOverrideParams::new(self.user_agent.clone()))
            .await
        {
            warn!("user agent override failed: {}", e);
        }

        if let Some(credentials) = proxy.and_then(proxy_credentials) {
            debug!("answering proxy auth challenges");
            if let Err(e) = page.authenticate(credentials).await {
                return AttemptOutcome::transient(NAME, format!("could not register proxy credentials: {}", e));
            }
        }

        let params = cookie_params(session.cookies(), &target.url);
        if !params.is_empty() {
            debug!(count = params.len(), "seeding browser cookies");
            if let Err(e) = page.set_cookies(params).await {
                warn!("could not seed cookies: {}", e);
            }
        }

        let outcome = self.load(&page, target).await;

        if let Some(path) = &self.persist_to {
            persist_hook(&page, path).await;
        }
        if let Err(e) = page.close().await {
            debug!("page close failed: {}", e);
        }
        outcome
    }
}

#[async_trait]
impl FetchStrategy for BrowserStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn attempt(
        &self,
        target: &FetchTarget,
        proxy: Option<&ProxyCandidate>,
        session: &SessionState,
    ) -> AttemptOutcome {
        let (mut browser, events) = match self.launch(proxy).await {
            Ok(launched) => launched,
            Err(message) => return AttemptOutcome::fatal(NAME, message),
        };

        let outcome = self.drive(&browser, target, proxy, session).await;

        if let Err(e) = browser.close().await {
            debug!("browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        events.abort();
        outcome
    }
}

/// Write the browser's cookie jar back to the session document, whatever the
/// attempt's outcome. Never fails the attempt.
async fn persist_hook(page: &Page, path: &Path) {
    match page.get_cookies().await {
        Ok(cookies) => save_browser_cookies(path, &cookies),
        Err(e) => warn!("could not read browser cookies: {}", e),
    }
}

fn save_browser_cookies(path: &Path, cookies: &[BrowserCookie]) {
    let cookies: Vec<Cookie> = cookies.iter().map(from_browser_cookie).collect();
    match persist_session(path, &cookies) {
        Ok(()) => debug!(path = %path.display(), count = cookies.len(), "session saved"),
        Err(e) => warn!(path = %path.display(), "could not save session: {}", e),
    }
}

fn cookie_params(cookies: &[Cookie], url: &Url) -> Vec<CookieParam> {
    cookies
        .iter()
        .filter(|c| !c.name.is_empty() && !c.value.is_empty())
        .filter_map(|c| {
            let mut builder = CookieParam::builder()
                .name(c.name.clone())
                .value(c.value.clone())
                .path(c.path.clone())
                .secure(c.secure)
                .http_only(c.http_only);
            builder = if c.domain.is_empty() {
                builder.url(url.as_str())
            } else {
                builder.domain(c.domain.clone())
            };
            if let Some(expires) = c.expires {
                builder = builder.expires(TimeSinceEpoch::new(expires as f64));
            }
            builder.build().ok()
        })
        .collect()
}

fn from_browser_cookie(c: &BrowserCookie) -> Cookie {
    Cookie {
        name: c.name.clone(),
        value: c.value.clone(),
        domain: c.domain.clone(),
        path: c.path.clone(),
        secure: c.secure,
        http_only: c.http_only,
        expires: if c.session || c.expires < 0.0 {
            None
        } else {
            Some(c.expires as i64)
        },
    }
}
