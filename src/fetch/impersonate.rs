use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{AttemptOutcome, FetchStrategy, FetchedPage};
use crate::config::ImpersonationConfig;
use crate::models::FetchTarget;
use crate::proxy::ProxyCandidate;
use crate::session::SessionState;

pub const NAME: &str = "impersonation";

const MIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace on top of curl's own `--max-time` before the process is killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Plain HTTP fetch through a curl build that mimics a browser's TLS and
/// HTTP/2 fingerprint. Every failure here is retryable: the next rank
/// (a real browser) may still get through.
pub struct ImpersonateStrategy {
    config: ImpersonationConfig,
    user_agent: String,
    timeout: Duration,
}

impl ImpersonateStrategy {
    pub fn new(config: ImpersonationConfig, user_agent: String, timeout: Duration) -> Self {
        Self {
            config,
            user_agent,
            timeout: timeout.max(MIN_TIMEOUT),
        }
    }

    fn args(&self, url: &str, proxy: Option<&ProxyCandidate>, cookies: &[(String, String)]) -> Vec<String> {
        let mut args = vec![
            "-sS".to_string(),
            "-L".to_string(),
            "--compressed".to_string(),
            "--fail".to_string(),
            "--max-time".to_string(),
            self.timeout.as_secs().to_string(),
            "-A".to_string(),
            self.user_agent.clone(),
        ];
        if !cookies.is_empty() {
            let header = cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            args.push("-H".to_string());
            args.push(format!("Cookie: {}", header));
        }
        if let Some(proxy) = proxy {
            args.push("-x".to_string());
            args.push(proxy.url());
        }
        args.push(url.to_string());
        args
    }
}

#[async_trait]
impl FetchStrategy for ImpersonateStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn attempt(
        &self,
        target: &FetchTarget,
        proxy: Option<&ProxyCandidate>,
        session: &SessionState,
    ) -> AttemptOutcome {
        let binary = self.config.binary();
        let cookies = session.pairs_for(&target.url);
        debug!(binary = %binary, cookies = cookies.len(), "impersonated fetch");

        let mut command = Command::new(&binary);
        command
            .args(self.args(target.url.as_str(), proxy, &cookies))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout + KILL_GRACE, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return AttemptOutcome::transient(NAME, format!("{} could not be run: {}", binary, e))
            }
            Err(_) => {
                return AttemptOutcome::transient(
                    NAME,
                    format!("timed out after {}s", self.timeout.as_secs()),
                )
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return AttemptOutcome::transient(
                NAME,
                format!("{} exited with {}: {}", binary, code, stderr.trim()),
            );
        }

        let markup = String::from_utf8_lossy(&output.stdout).into_owned();
        if markup.trim().is_empty() {
            return AttemptOutcome::transient(NAME, "empty response body");
        }
        AttemptOutcome::classify(FetchedPage::from_markup(markup, NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutputFormat;

    fn strategy(profile: &str) -> ImpersonateStrategy {
        ImpersonateStrategy::new(
            ImpersonationConfig {
                enabled: true,
                profile: profile.to_string(),
            },
            "UA/1.0".to_string(),
            Duration::from_secs(3),
        )
    }

    #[test]
    fn builds_curl_arguments() {
        let proxy = ProxyCandidate::parse("http://user:pw@10.0.0.1:8080").unwrap();
        let args = strategy("chrome116").args(
            "https://medium.com/p",
            Some(&proxy),
            &[("sid".to_string(), "1".to_string()), ("uid".to_string(), "2".to_string())],
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-sS -L --compressed --fail --max-time 10 -A UA/1.0"));
        assert!(args.contains(&"Cookie: sid=1; uid=2".to_string()));
        let proxy_at = args.iter().position(|a| a == "-x").unwrap();
        assert_eq!(args[proxy_at + 1], "http://user:pw@10.0.0.1:8080");
        assert_eq!(args.last().unwrap(), "https://medium.com/p");
    }

    #[tokio::test]
    async fn missing_binary_is_retryable() {
        let target = FetchTarget::parse("https://medium.com/p", OutputFormat::Markdown).unwrap();
        let outcome = strategy("no-such-profile-xyz")
            .attempt(&target, None, &SessionState::default())
            .await;
        assert!(matches!(outcome, AttemptOutcome::TransientError { .. }));
    }
}
