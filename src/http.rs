use std::time::Duration;

use reqwest::StatusCode;

use crate::proxy::ProxyCandidate;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// How a failed HTTP exchange should be treated by the attempt loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth another attempt through another proxy.
    Transient,
    /// Retrying will not help.
    Fatal,
}

/// Client with the browser-like defaults every outbound request shares.
pub fn client(
    user_agent: &str,
    timeout: Duration,
    proxy: Option<&ProxyCandidate>,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        reqwest::header::HeaderValue::from_static("en-US,en;q=0.9"),
    );

    let mut builder = reqwest::ClientBuilder::new()
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(user_agent)
        .default_headers(headers);

    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy.url())?);
    }

    builder.build()
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    if status.is_server_error()
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}

pub fn classify_transport(err: &reqwest::Error) -> FailureClass {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}

/// Transport error text in `Kind: detail` form.
pub fn describe_transport(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("TimeoutError: {}", err)
    } else if err.is_connect() {
        format!("ConnectError: {}", err)
    } else {
        format!("RequestError: {}", err)
    }
}

/// `Cookie` header value, or `None` when there is nothing to send.
pub fn cookie_header(pairs: &[(String, String)]) -> Option<reqwest::header::HeaderValue> {
    if pairs.is_empty() {
        return None;
    }
    let joined = pairs
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ");
    reqwest::header::HeaderValue::from_str(&joined).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_and_overload_statuses_are_transient() {
        for code in [403u16, 408, 429, 500, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), FailureClass::Transient, "{}", code);
        }
    }

    #[test]
    fn client_errors_are_fatal() {
        for code in [400u16, 401, 404, 410] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), FailureClass::Fatal, "{}", code);
        }
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let pairs = vec![
            ("sid".to_string(), "abc".to_string()),
            ("uid".to_string(), "42".to_string()),
        ];
        let header = cookie_header(&pairs).unwrap();
        assert_eq!(header.to_str().unwrap(), "sid=abc; uid=42");
        assert!(cookie_header(&[]).is_none());
    }
}
