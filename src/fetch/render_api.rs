use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value};
use tracing::debug;

use super::{AttemptOutcome, FetchStrategy, FetchedPage};
use crate::config::RenderApiConfig;
use crate::http::{self, FailureClass};
use crate::models::FetchTarget;
use crate::proxy::ProxyCandidate;
use crate::session::SessionState;

pub const NAME: &str = "render_api";

const MIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote rendering service. It egresses through its own network, so the
/// attempt's proxy and the local session are not forwarded.
pub struct RenderApiStrategy {
    config: RenderApiConfig,
    timeout: Duration,
}

impl RenderApiStrategy {
    pub fn new(config: RenderApiConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout: timeout.max(MIN_TIMEOUT),
        }
    }

    fn payload(&self, url: &str) -> Value {
        let mut body = Map::new();
        body.insert("url".to_string(), Value::String(url.to_string()));
        body.insert("http_method".to_string(), Value::String("GET".to_string()));
        if let Some(target) = &self.config.target {
            body.insert("target".to_string(), Value::String(target.clone()));
        }
        if self.config.advanced {
            body.insert("headless".to_string(), Value::String("html".to_string()));
        }
        for (key, value) in &self.config.extra {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }

    async fn fetch(&self, url: &str) -> Result<String, AttemptOutcome> {
        let client = http::client(http::DEFAULT_USER_AGENT, self.timeout, None)
            .map_err(|e| AttemptOutcome::fatal(NAME, format!("client setup failed: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&authorization(&self.config.credential))
            .map_err(|_| AttemptOutcome::fatal(NAME, "render API credential is not a valid header value"))?;
        headers.insert(AUTHORIZATION, auth);

        let response = client
            .post(&self.config.endpoint)
            .headers(headers)
            .json(&self.payload(url))
            .send()
            .await
            .map_err(|e| outcome_for_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("render API returned HTTP {}", status);
            return Err(match http::classify_status(status) {
                FailureClass::Transient => AttemptOutcome::transient(NAME, message),
                FailureClass::Fatal => AttemptOutcome::fatal(NAME, message),
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("application/json"))
            .unwrap_or(false);
        let text = response.text().await.map_err(|e| outcome_for_transport(&e))?;

        if is_json {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                if let Some(markup) = unwrap_markup(&value) {
                    return Ok(markup);
                }
            }
        }
        Ok(text)
    }
}

#[async_trait]
impl FetchStrategy for RenderApiStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn attempt(
        &self,
        target: &FetchTarget,
        _proxy: Option<&ProxyCandidate>,
        _session: &SessionState,
    ) -> AttemptOutcome {
        debug!(endpoint = %self.config.endpoint, advanced = self.config.advanced, "calling render API");
        match self.fetch(target.url.as_str()).await {
            Ok(markup) if markup.trim().is_empty() => {
                AttemptOutcome::transient(NAME, "render API returned an empty document")
            }
            Ok(markup) => AttemptOutcome::classify(FetchedPage::from_markup(markup, NAME)),
            Err(outcome) => outcome,
        }
    }
}

fn outcome_for_transport(err: &reqwest::Error) -> AttemptOutcome {
    match http::classify_transport(err) {
        FailureClass::Transient => AttemptOutcome::transient(NAME, http::describe_transport(err)),
        FailureClass::Fatal => AttemptOutcome::fatal(NAME, http::describe_transport(err)),
    }
}

/// Prepared `Basic`/`Bearer` values pass through; a `user:pass` pair is
/// base64-encoded; anything else is sent as a raw Basic token.
pub fn authorization(credential: &str) -> String {
    if credential.starts_with("Basic ") || credential.starts_with("Bearer ") {
        return credential.to_string();
    }
    if credential.contains(':') && !credential.contains(' ') {
        let token = base64::engine::general_purpose::STANDARD.encode(credential.as_bytes());
        return format!("Basic {}", token);
    }
    format!("Basic {}", credential)
}

fn non_blank_str<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| map.get(*k).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
}

/// Markup from a JSON-wrapped response. A nested `data` object wins over
/// top-level fields.
pub fn unwrap_markup(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    let nested = object
        .get("data")
        .and_then(Value::as_object)
        .and_then(|data| non_blank_str(data, &["content", "html", "body"]));
    nested
        .or_else(|| non_blank_str(object, &["content", "html", "body", "data"]))
        .map(str::to_string)
}
