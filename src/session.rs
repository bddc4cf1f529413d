use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::SessionPaths;

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

#[derive(Debug, Clone, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Unix seconds; `None` for session cookies.
    pub expires: Option<i64>,
}

impl Cookie {
    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let domain = self.domain.trim_start_matches('.').to_lowercase();
        let host = host.to_lowercase();
        let domain_ok = !domain.is_empty()
            && (host == domain || host.ends_with(&format!(".{}", domain)));
        let path_ok = url.path().starts_with(&self.path);
        let scheme_ok = !self.secure || url.scheme() == "https";
        domain_ok && path_ok && scheme_ok
    }
}

// ── Structured session document (browser storage-state format) ──────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default, deserialize_with = "usable_cookies")]
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "root_path")]
    pub path: String,
    /// `-1` marks a session cookie.
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

/// Entries that are not cookie objects, or have no name, are dropped one by
/// one instead of rejecting the document.
fn usable_cookies<'de, D>(deserializer: D) -> Result<Vec<StoredCookie>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    let total = raw.len();
    let cookies: Vec<StoredCookie> = raw
        .into_iter()
        .filter_map(|value| serde_json::from_value::<StoredCookie>(value).ok())
        .filter(|c| !c.name.is_empty())
        .collect();
    if cookies.len() < total {
        warn!(skipped = total - cookies.len(), "ignoring unusable stored cookies");
    }
    Ok(cookies)
}

fn root_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

impl From<StoredCookie> for Cookie {
    fn from(c: StoredCookie) -> Self {
        Cookie {
            name: c.name,
            value: c.value,
            domain: c.domain,
            path: if c.path.is_empty() { root_path() } else { c.path },
            secure: c.secure,
            http_only: c.http_only,
            expires: if c.expires >= 0.0 {
                Some(c.expires as i64)
            } else {
                None
            },
        }
    }
}

impl From<&Cookie> for StoredCookie {
    fn from(c: &Cookie) -> Self {
        StoredCookie {
            name: c.name.clone(),
            value: c.value.clone(),
            domain: c.domain.clone(),
            path: c.path.clone(),
            expires: c.expires.map(|e| e as f64).unwrap_or(-1.0),
            http_only: c.http_only,
            secure: c.secure,
            same_site: None,
        }
    }
}

/// Missing or malformed documents count as absent.
pub fn load_storage_state(path: &Path) -> Option<StorageState> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %path.display(), "no session document: {}", e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), "ignoring malformed session document: {}", e);
            None
        }
    }
}

// ── Legacy browser-exported cookie file ──────────────────────────────────────

/// Parse a Netscape-format cookie export. Bad records are skipped.
pub fn parse_netscape_cookies(content: &str) -> Vec<Cookie> {
    let mut cookies = Vec::new();

    for raw in content.lines() {
        let mut line = raw.trim();
        let mut http_only = false;
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            match line.strip_prefix(HTTP_ONLY_PREFIX) {
                Some(rest) => {
                    line = rest;
                    http_only = true;
                }
                None => continue,
            }
        }

        let mut parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 7 {
            parts = line.split_whitespace().collect();
        }
        if parts.len() < 7 {
            continue;
        }

        let (domain, path, secure, expires, name, value) =
            (parts[0], parts[2], parts[3], parts[4], parts[5], parts[6]);
        if name.is_empty() {
            continue;
        }

        cookies.push(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: if path.is_empty() { root_path() } else { path.to_string() },
            secure: secure.eq_ignore_ascii_case("TRUE"),
            http_only,
            expires: expires.parse::<i64>().ok().filter(|e| *e > 0),
        });
    }

    cookies
}

pub fn load_netscape_cookies(path: &Path) -> Vec<Cookie> {
    match std::fs::read(path) {
        Ok(bytes) => parse_netscape_cookies(&String::from_utf8_lossy(&bytes)),
        Err(e) => {
            debug!(path = %path.display(), "no legacy cookie file: {}", e);
            Vec::new()
        }
    }
}

// ── Merged session ───────────────────────────────────────────────────────────

/// Cookies for the run: structured-source cookies first, then legacy-file
/// cookies. Read-only once loaded.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    cookies: Vec<Cookie>,
}

impl SessionState {
    #[cfg(test)]
    pub fn new(cookies: Vec<Cookie>) -> Self {
        Self { cookies }
    }

    pub fn load(paths: &SessionPaths) -> Self {
        let structured: Vec<Cookie> = paths
            .storage_state
            .as_deref()
            .and_then(load_storage_state)
            .map(|state| state.cookies.into_iter().map(Cookie::from).collect())
            .unwrap_or_default();
        let legacy = paths
            .netscape_cookies
            .as_deref()
            .map(load_netscape_cookies)
            .unwrap_or_default();

        if !legacy.is_empty() {
            debug!(count = legacy.len(), "loaded legacy cookies");
        }
        if !structured.is_empty() {
            debug!(count = structured.len(), "loaded session document");
        }

        let mut cookies = structured;
        cookies.extend(legacy);
        Self { cookies }
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// `name=value` pairs applicable to `url`. When two cookies share a
    /// name the later one wins, so legacy-file cookies override the
    /// structured document.
    pub fn pairs_for(&self, url: &Url) -> Vec<(String, String)> {
        let mut order: Vec<&str> = Vec::new();
        let mut values: HashMap<&str, &str> = HashMap::new();
        for cookie in self.cookies.iter().filter(|c| c.matches(url)) {
            if values.insert(&cookie.name, &cookie.value).is_none() {
                order.push(&cookie.name);
            }
        }
        order
            .into_iter()
            .filter(|name| !values[name].is_empty())
            .map(|name| (name.to_string(), values[name].to_string()))
            .collect()
    }
}

/// Overwrite the session document with `cookies`. Last writer wins.
pub fn persist_session(path: &Path, cookies: &[Cookie]) -> std::io::Result<()> {
    let state = StorageState {
        cookies: cookies.iter().map(StoredCookie::from).collect(),
        origins: Vec::new(),
    };
    let json = serde_json::to_string_pretty(&state)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)
}
