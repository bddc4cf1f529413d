pub mod browser;
pub mod impersonate;
pub mod render_api;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detect::is_challenge_page;
use crate::error::FetchError;
use crate::models::FetchTarget;
use crate::proxy::{ProxyCandidate, ProxyPool};
use crate::session::SessionState;

/// Markup as delivered by one strategy.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub markup: String,
    pub title: String,
    pub strategy: &'static str,
}

impl FetchedPage {
    /// Build a page from raw markup, reading the title from `<title>`.
    pub fn from_markup(markup: String, strategy: &'static str) -> Self {
        let title = document_title(&markup);
        Self {
            markup,
            title,
            strategy,
        }
    }
}

pub fn document_title(markup: &str) -> String {
    let document = Html::parse_document(markup);
    let sel = Selector::parse("title").unwrap();
    document
        .select(&sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Success(FetchedPage),
    ChallengeBlocked(FetchedPage),
    TransientError {
        strategy: &'static str,
        message: String,
    },
    FatalError {
        strategy: &'static str,
        message: String,
    },
}

impl AttemptOutcome {
    /// Run the bot-defense detector over a delivered page.
    pub fn classify(page: FetchedPage) -> Self {
        if is_challenge_page(&page.markup, &page.title) {
            AttemptOutcome::ChallengeBlocked(page)
        } else {
            AttemptOutcome::Success(page)
        }
    }

    pub fn transient(strategy: &'static str, message: impl Into<String>) -> Self {
        AttemptOutcome::TransientError {
            strategy,
            message: message.into(),
        }
    }

    pub fn fatal(strategy: &'static str, message: impl Into<String>) -> Self {
        AttemptOutcome::FatalError {
            strategy,
            message: message.into(),
        }
    }
}

/// One way of getting the page's markup.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(
        &self,
        target: &FetchTarget,
        proxy: Option<&ProxyCandidate>,
        session: &SessionState,
    ) -> AttemptOutcome;
}

/// Ranked strategies for this configuration: the render API alone when it is
/// configured, otherwise the impersonating client (if enabled) backed by the
/// browser.
pub fn ranked_strategies(config: &Config) -> Vec<Box<dyn FetchStrategy>> {
    if let Some(render) = &config.render_api {
        return vec![Box::new(render_api::RenderApiStrategy::new(
            render.clone(),
            config.timeout,
        ))];
    }

    let mut strategies: Vec<Box<dyn FetchStrategy>> = Vec::new();
    if config.impersonation.enabled {
        strategies.push(Box::new(impersonate::ImpersonateStrategy::new(
            config.impersonation.clone(),
            config.user_agent.clone(),
            config.timeout,
        )));
    }
    strategies.push(Box::new(browser::BrowserStrategy::new(
        config.browser.clone(),
        config.user_agent.clone(),
        config.timeout,
        config.session.save_storage_state.clone(),
    )));
    strategies
}

#[derive(Debug)]
pub struct FetchReport {
    pub page: FetchedPage,
    pub proxy: Option<ProxyCandidate>,
    pub attempts: usize,
}

#[derive(Debug)]
pub struct CascadeFailure {
    pub error: FetchError,
    /// The final recorded outcome was a challenge page.
    pub fallback_eligible: bool,
    pub last_proxy: Option<ProxyCandidate>,
}

/// Bounded attempt loop. Each attempt picks a proxy, then walks the ranked
/// strategies until one succeeds or the list runs out.
pub struct Cascade {
    strategies: Vec<Box<dyn FetchStrategy>>,
    pool: ProxyPool,
    attempts: usize,
}

impl Cascade {
    pub fn new(strategies: Vec<Box<dyn FetchStrategy>>, pool: ProxyPool, attempts: usize) -> Self {
        Self {
            strategies,
            pool,
            attempts: attempts.max(1),
        }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn run(
        &self,
        target: &FetchTarget,
        session: &SessionState,
    ) -> Result<FetchReport, CascadeFailure> {
        let mut rng = StdRng::from_entropy();
        self.run_with_rng(target, session, &mut rng).await
    }

    pub async fn run_with_rng<R: Rng + Send>(
        &self,
        target: &FetchTarget,
        session: &SessionState,
        rng: &mut R,
    ) -> Result<FetchReport, CascadeFailure> {
        let mut last: Option<AttemptOutcome> = None;
        let mut last_proxy: Option<ProxyCandidate> = None;

        for attempt in 0..self.attempts {
            let proxy = self.pool.select(attempt, rng).cloned();
            match &proxy {
                Some(p) => info!(
                    attempt = attempt + 1,
                    of = self.attempts,
                    proxy = %p.server(),
                    "fetch attempt"
                ),
                None => info!(attempt = attempt + 1, of = self.attempts, "fetch attempt without proxy"),
            }

            let outcome = self.attempt_once(target, proxy.as_ref(), session).await;
            match outcome {
                AttemptOutcome::Success(page) => {
                    info!(strategy = page.strategy, bytes = page.markup.len(), "page fetched");
                    return Ok(FetchReport {
                        page,
                        proxy,
                        attempts: attempt + 1,
                    });
                }
                AttemptOutcome::FatalError { strategy, message } => {
                    return Err(CascadeFailure {
                        error: FetchError::Unexpected {
                            strategy: strategy.to_string(),
                            message,
                        },
                        fallback_eligible: false,
                        last_proxy: proxy,
                    });
                }
                AttemptOutcome::ChallengeBlocked(ref page) => {
                    warn!(attempt = attempt + 1, strategy = page.strategy, title = %page.title, "challenge page");
                    last = Some(outcome);
                }
                AttemptOutcome::TransientError {
                    strategy,
                    ref message,
                } => {
                    warn!(attempt = attempt + 1, strategy, "attempt failed: {}", message);
                    last = Some(outcome);
                }
            }
            last_proxy = proxy;
        }

        let attempts = self.attempts;
        Err(match last {
            Some(AttemptOutcome::ChallengeBlocked(page)) => CascadeFailure {
                error: FetchError::BotDefense {
                    strategy: page.strategy.to_string(),
                    attempts,
                },
                fallback_eligible: true,
                last_proxy,
            },
            Some(AttemptOutcome::TransientError { strategy, message }) => CascadeFailure {
                error: FetchError::Network {
                    strategy: strategy.to_string(),
                    message,
                },
                fallback_eligible: false,
                last_proxy,
            },
            // Success and Fatal return from inside the loop.
            _ => CascadeFailure {
                error: FetchError::Unexpected {
                    strategy: "cascade".to_string(),
                    message: "no attempt was recorded".to_string(),
                },
                fallback_eligible: false,
                last_proxy,
            },
        })
    }

    /// One attempt: walk the ranked list, falling through on retryable
    /// outcomes. The last strategy's outcome stands for the attempt.
    async fn attempt_once(
        &self,
        target: &FetchTarget,
        proxy: Option<&ProxyCandidate>,
        session: &SessionState,
    ) -> AttemptOutcome {
        let mut outcome = AttemptOutcome::fatal("cascade", "no fetch strategy configured");
        for (rank, strategy) in self.strategies.iter().enumerate() {
            outcome = strategy.attempt(target, proxy, session).await;
            match &outcome {
                AttemptOutcome::Success(_) | AttemptOutcome::FatalError { .. } => return outcome,
                _ if rank + 1 < self.strategies.len() => {
                    debug!(
                        from = strategy.name(),
                        to = self.strategies[rank + 1].name(),
                        "falling back within attempt"
                    );
                }
                _ => {}
            }
        }
        outcome
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::models::OutputFormat;
    use crate::proxy::RotationPolicy;
    use std::sync::Arc;

    fn target() -> FetchTarget {
        FetchTarget::parse("https://medium.com/@a/post-1", OutputFormat::Markdown).unwrap()
    }

    fn pool(entries: &[&str]) -> ProxyPool {
        ProxyPool::new(
            entries
                .iter()
                .map(|e| ProxyCandidate::parse(e).unwrap())
                .collect(),
            RotationPolicy::RoundRobin,
        )
    }

    #[tokio::test]
    async fn round_robin_proxy_sequence_over_five_attempts() {
        let strategy = Arc::new(ScriptedStrategy::new("flaky", |_| {
            AttemptOutcome::transient("flaky", "connection reset")
        }));
        let cascade = Cascade::new(vec![Box::new(strategy.clone())], pool(&["p0:1", "p1:2"]), 5);

        let failure = cascade
            .run(&target(), &SessionState::default())
            .await
            .unwrap_err();

        let seen = strategy.seen.lock().unwrap().clone();
        let expected: Vec<Option<String>> = ["p0", "p1", "p1", "p1", "p1"]
            .iter()
            .map(|h| Some(h.to_string()))
            .collect();
        assert_eq!(seen, expected);
        assert_eq!(failure.error.code(), "network");
        assert!(!failure.fallback_eligible);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let strategy = Arc::new(ScriptedStrategy::new("s", |call| {
            if call == 0 {
                AttemptOutcome::transient("s", "timeout")
            } else {
                AttemptOutcome::classify(page(ARTICLE, "s"))
            }
        }));
        let cascade = Cascade::new(vec![Box::new(strategy.clone())], ProxyPool::unproxied(), 3);
        let report = cascade.run(&target(), &SessionState::default()).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(strategy.calls(), 2);
        assert_eq!(report.page.title, "Story");
    }

    #[tokio::test]
    async fn fatal_error_propagates_without_retry() {
        let strategy = Arc::new(ScriptedStrategy::new("s", |_| {
            AttemptOutcome::fatal("s", "401 Unauthorized")
        }));
        let cascade = Cascade::new(vec![Box::new(strategy.clone())], ProxyPool::unproxied(), 3);
        let failure = cascade
            .run(&target(), &SessionState::default())
            .await
            .unwrap_err();
        assert_eq!(strategy.calls(), 1);
        assert_eq!(failure.error.code(), "unexpected");
        assert!(!failure.fallback_eligible);
    }

    #[tokio::test]
    async fn exhausted_challenges_are_fallback_eligible() {
        let strategy = Arc::new(ScriptedStrategy::new("s", |_| {
            AttemptOutcome::classify(page(CHALLENGE, "s"))
        }));
        let cascade = Cascade::new(vec![Box::new(strategy.clone())], ProxyPool::unproxied(), 3);
        let failure = cascade
            .run(&target(), &SessionState::default())
            .await
            .unwrap_err();
        assert_eq!(strategy.calls(), 3);
        assert!(failure.fallback_eligible);
        assert_eq!(failure.error.code(), "bot_defense_exhausted");
    }

    #[tokio::test]
    async fn last_outcome_decides_eligibility() {
        let strategy = Arc::new(ScriptedStrategy::new("s", |call| {
            if call < 2 {
                AttemptOutcome::classify(page(CHALLENGE, "s"))
            } else {
                AttemptOutcome::transient("s", "reset")
            }
        }));
        let cascade = Cascade::new(vec![Box::new(strategy)], ProxyPool::unproxied(), 3);
        let failure = cascade
            .run(&target(), &SessionState::default())
            .await
            .unwrap_err();
        assert!(!failure.fallback_eligible);
    }

    #[tokio::test]
    async fn lower_rank_runs_within_the_same_attempt() {
        let first = Arc::new(ScriptedStrategy::new("impersonation", |_| {
            AttemptOutcome::transient("impersonation", "curl exited with 35")
        }));
        let second = Arc::new(ScriptedStrategy::new("browser", |_| {
            AttemptOutcome::classify(page(ARTICLE, "browser"))
        }));
        let cascade = Cascade::new(
            vec![Box::new(first.clone()), Box::new(second.clone())],
            pool(&["p0:1"]),
            3,
        );
        let report = cascade.run(&target(), &SessionState::default()).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.page.strategy, "browser");
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(report.proxy.unwrap().host, "p0");
    }

    #[test]
    fn classify_uses_detector() {
        assert!(matches!(
            AttemptOutcome::classify(page(CHALLENGE, "x")),
            AttemptOutcome::ChallengeBlocked(_)
        ));
        assert!(matches!(
            AttemptOutcome::classify(page(ARTICLE, "x")),
            AttemptOutcome::Success(_)
        ));
    }
}
