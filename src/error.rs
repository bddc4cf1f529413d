use serde::Serialize;

// ── Configuration errors ─────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid render API extra parameters: {0}")]
    RenderExtra(String),
    #[error("proxy leasing API needs a public key, a private key and a proxy user id (missing: {0})")]
    LeaseCredentials(String),
    #[error("proxy list not readable: {path}: {reason}")]
    ProxyList { path: String, reason: String },
    #[error("invalid target URL: {0}")]
    InvalidUrl(String),
}

// ── Proxy provisioning errors ────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{error}: {message}{}", request_suffix(.request_id))]
    Lease {
        error: String,
        message: String,
        request_id: Option<String>,
    },
    #[error("proxy leasing API returned an empty proxy list")]
    EmptyLease,
    #[error("proxy leasing request failed: {0}")]
    Request(String),
    #[error("proxy leasing API unreachable: {0}")]
    Transport(String),
}

fn request_suffix(request_id: &Option<String>) -> String {
    match request_id {
        Some(id) => format!(" (request_id={})", id),
        None => String::new(),
    }
}

// ── Run-level error ──────────────────────────────────────────────────────────

/// Every failure that can end a run. Each variant maps to one stable code.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("{strategy}: {message}")]
    Network { strategy: String, message: String },
    #[error("bot-defense challenge blocked the request after {attempts} attempt(s) ({strategy})")]
    BotDefense { strategy: String, attempts: usize },
    /// The feed fallback could not recover; the message is the original
    /// blocking error, untouched.
    #[error("{blocked}")]
    FallbackExhausted {
        #[source]
        blocked: Box<FetchError>,
    },
    #[error("{strategy}: {message}")]
    Unexpected { strategy: String, message: String },
    #[error("writing output failed: {0}")]
    Output(String),
}

impl FetchError {
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Config(_) => "configuration",
            FetchError::Proxy(ProxyError::Transport(_)) => "network",
            // Leasing failures happen at startup, before any fetch.
            FetchError::Proxy(_) => "configuration",
            FetchError::Network { .. } => "network",
            FetchError::BotDefense { .. } => "bot_defense_exhausted",
            FetchError::FallbackExhausted { .. } => "fallback_exhausted",
            FetchError::Unexpected { .. } => "unexpected",
            FetchError::Output(_) => "output",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            FetchError::Proxy(ProxyError::Transport(_)) => 1,
            FetchError::Config(_) | FetchError::Proxy(_) => 2,
            _ => 1,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_exhaustion_keeps_the_blocking_message() {
        let blocked = FetchError::BotDefense {
            strategy: "browser".to_string(),
            attempts: 3,
        };
        let original = blocked.to_string();
        let err = FetchError::FallbackExhausted {
            blocked: Box::new(blocked),
        };
        assert_eq!(err.to_string(), original);
        assert_eq!(err.code(), "fallback_exhausted");
    }

    #[test]
    fn lease_error_includes_request_id() {
        let err = ProxyError::Lease {
            error: "Unauthorized".to_string(),
            message: "bad key".to_string(),
            request_id: Some("req-1".to_string()),
        };
        assert_eq!(err.to_string(), "Unauthorized: bad key (request_id=req-1)");

        let run: FetchError = err.into();
        assert_eq!(run.code(), "configuration");
        assert_eq!(run.exit_code(), 2);
    }

    #[test]
    fn payload_carries_code_and_message() {
        let err = FetchError::Network {
            strategy: "render_api".to_string(),
            message: "timed out".to_string(),
        };
        let json = serde_json::to_value(err.payload()).unwrap();
        assert_eq!(json["error"]["code"], "network");
        assert_eq!(json["error"]["message"], "render_api: timed out");
    }
}
