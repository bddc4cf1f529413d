use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Parser;
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::http::DEFAULT_USER_AGENT;
use crate::models::{FetchTarget, OutputFormat};
use crate::proxy::RotationPolicy;

const DEFAULT_RENDER_ENDPOINT: &str = "https://scraper-api.decodo.com/v2/scrape";
const DEFAULT_LEASE_BASE_URL: &str = "https://api.pingproxies.com/1.0/public";

/// Fetch one article page and turn it into markdown, text and local images.
#[derive(Debug, Parser)]
#[command(name = "medium-fetch", version)]
pub struct Cli {
    /// Article URL
    pub url: String,

    #[arg(long, value_enum, default_value = "markdown")]
    pub format: OutputFormat,
    /// Output directory (default: ./output/<slug>)
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
    #[arg(long)]
    pub no_images: bool,
    #[arg(long)]
    pub no_clean: bool,
    #[arg(long, env = "MEDIUM_FETCH_VERBOSE", value_parser = BoolishValueParser::new())]
    pub verbose: bool,
    /// Do not print the result to stdout
    #[arg(long)]
    pub quiet: bool,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "MEDIUM_FETCH_TIMEOUT_MS", default_value_t = 60_000)]
    pub timeout: u64,
    #[arg(long, env = "MEDIUM_FETCH_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,
    /// Run the browser with a visible window
    #[arg(long)]
    pub headful: bool,
    #[arg(long, env = "MEDIUM_FETCH_CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    // Remote-render API
    #[arg(long, env = "MEDIUM_FETCH_DECODO_API_KEY")]
    pub render_api_key: Option<String>,
    #[arg(long, env = "MEDIUM_FETCH_DECODO_USER")]
    pub render_api_user: Option<String>,
    #[arg(long, env = "MEDIUM_FETCH_DECODO_PASS")]
    pub render_api_pass: Option<String>,
    #[arg(long, env = "MEDIUM_FETCH_DECODO_ENDPOINT", default_value = DEFAULT_RENDER_ENDPOINT)]
    pub render_api_endpoint: String,
    /// Use the headless-rendering tier
    #[arg(long, env = "MEDIUM_FETCH_DECODO_ADVANCED", value_parser = BoolishValueParser::new())]
    pub render_api_advanced: bool,
    #[arg(long, env = "MEDIUM_FETCH_DECODO_TARGET", default_value = "universal")]
    pub render_api_target: String,
    /// Extra JSON object merged into the render request
    #[arg(long, env = "MEDIUM_FETCH_DECODO_EXTRA_JSON")]
    pub render_api_extra: Option<String>,
    /// Skip the render API even when a key is configured
    #[arg(long, env = "MEDIUM_FETCH_FORCE_PLAYWRIGHT", value_parser = BoolishValueParser::new())]
    pub force_browser: bool,

    // Proxies
    #[arg(long, env = "MEDIUM_FETCH_PROXY")]
    pub proxy: Option<String>,
    #[arg(long, env = "MEDIUM_FETCH_PROXY_LIST")]
    pub proxy_list: Option<PathBuf>,
    #[arg(long, env = "MEDIUM_FETCH_PROXY_ROTATE", value_enum, default_value = "round_robin")]
    pub proxy_rotate: RotationPolicy,
    /// Attempts before giving up
    #[arg(long, env = "MEDIUM_FETCH_PROXY_RETRIES", default_value_t = 3)]
    pub proxy_retries: usize,

    // Proxy leasing API
    #[arg(long, env = "PROXY_API_PUBLIC_KEY")]
    pub proxy_api_public_key: Option<String>,
    #[arg(long, env = "PROXY_API_PRIVATE_KEY")]
    pub proxy_api_private_key: Option<String>,
    #[arg(long, env = "MEDIUM_FETCH_PROXY_API_USER_ID")]
    pub proxy_api_user_id: Option<String>,
    #[arg(long, env = "MEDIUM_FETCH_PROXY_API_COUNTRY", default_value = "us")]
    pub proxy_api_country: String,
    #[arg(long, env = "MEDIUM_FETCH_PROXY_API_SESSION_TYPE", default_value = "sticky")]
    pub proxy_api_session_type: String,
    #[arg(long, env = "MEDIUM_FETCH_PROXY_API_COUNT", default_value_t = 10)]
    pub proxy_api_count: u32,
    #[arg(long, env = "MEDIUM_FETCH_PROXY_API_FORMAT", default_value = "http")]
    pub proxy_api_format: String,
    #[arg(long, env = "MEDIUM_FETCH_PROXY_API_BASE_URL", default_value = DEFAULT_LEASE_BASE_URL)]
    pub proxy_api_base_url: String,

    // TLS impersonation
    /// Try the TLS-impersonating client before the browser
    #[arg(long, env = "MEDIUM_FETCH_CURL_CFFI_FIRST", value_parser = BoolishValueParser::new())]
    pub impersonate_first: bool,
    #[arg(long, env = "MEDIUM_FETCH_CURL_CFFI_IMPERSONATE", default_value = "chrome116")]
    pub impersonate_profile: String,

    // Session
    #[arg(long, env = "MEDIUM_FETCH_STORAGE_STATE")]
    pub storage_state: Option<PathBuf>,
    #[arg(long, env = "MEDIUM_FETCH_NETSCAPE_COOKIES")]
    pub netscape_cookies: Option<PathBuf>,
    #[arg(long, env = "MEDIUM_FETCH_SAVE_STORAGE_STATE")]
    pub save_storage_state: Option<PathBuf>,

    /// Use the publication feed when the page stays blocked
    #[arg(long, env = "MEDIUM_FETCH_RSS_FALLBACK", value_parser = BoolishValueParser::new())]
    pub feed_fallback: bool,
}

/// Unprefixed names still honoured when the `MEDIUM_FETCH_*` one is unset.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("MEDIUM_FETCH_DECODO_API_KEY", "DECODO_API_KEY"),
    ("MEDIUM_FETCH_DECODO_USER", "DECODO_USER"),
    ("MEDIUM_FETCH_DECODO_PASS", "DECODO_PASS"),
    ("MEDIUM_FETCH_PROXY_API_USER_ID", "PROXY_API_PROXY_USER_ID"),
    ("MEDIUM_FETCH_PROXY_API_COUNTRY", "PROXY_API_COUNTRY_ID"),
    ("MEDIUM_FETCH_PROXY_API_SESSION_TYPE", "PROXY_API_LIST_SESSION_TYPE"),
    ("MEDIUM_FETCH_PROXY_API_COUNT", "PROXY_API_LIST_COUNT"),
    ("MEDIUM_FETCH_PROXY_API_FORMAT", "PROXY_API_LIST_FORMAT"),
    ("MEDIUM_FETCH_PROXY_API_BASE_URL", "PROXY_API_BASE_URL"),
];

/// Primary variables to fill from their aliases before the CLI is parsed.
/// Blank values count as unset.
pub fn env_aliases(lookup: impl Fn(&str) -> Option<String>) -> Vec<(&'static str, String)> {
    let present = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    ENV_ALIASES
        .iter()
        .filter(|(primary, _)| present(*primary).is_none())
        .filter_map(|(primary, alias)| present(*alias).map(|value| (*primary, value)))
        .collect()
}

// ── Resolved configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RenderApiConfig {
    pub credential: String,
    pub endpoint: String,
    pub advanced: bool,
    pub target: Option<String>,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    pub value: Option<String>,
    pub list_path: Option<PathBuf>,
    pub rotation: RotationPolicy,
    pub retries: usize,
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub public_key: String,
    pub private_key: String,
    pub user_id: String,
    pub country: String,
    pub session_type: String,
    pub count: u32,
    pub format: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct ImpersonationConfig {
    pub enabled: bool,
    pub profile: String,
}

impl ImpersonationConfig {
    /// curl-impersonate ships one wrapper script per browser profile.
    pub fn binary(&self) -> String {
        format!("curl_{}", self.profile)
    }
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionPaths {
    pub storage_state: Option<PathBuf>,
    pub netscape_cookies: Option<PathBuf>,
    pub save_storage_state: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct OutputOptions {
    pub out_dir: PathBuf,
    pub quiet: bool,
}

/// Everything a run needs, built once in `main` and passed down explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub target: FetchTarget,
    pub user_agent: String,
    pub timeout: Duration,
    pub render_api: Option<RenderApiConfig>,
    pub proxy: ProxySettings,
    pub lease: Option<LeaseConfig>,
    pub impersonation: ImpersonationConfig,
    pub browser: BrowserSettings,
    pub session: SessionPaths,
    pub fallback_enabled: bool,
    pub output: OutputOptions,
}

impl Cli {
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let mut target = FetchTarget::parse(&self.url, self.format)?;
        target.download_images = !self.no_images;
        target.clean_markdown = !self.no_clean;

        let render_api = if self.force_browser {
            None
        } else {
            render_credential(
                self.render_api_key.as_deref(),
                self.render_api_user.as_deref(),
                self.render_api_pass.as_deref(),
            )
            .map(|credential| -> Result<RenderApiConfig, ConfigError> {
                Ok(RenderApiConfig {
                    credential,
                    endpoint: self.render_api_endpoint.clone(),
                    advanced: self.render_api_advanced,
                    target: non_blank(&self.render_api_target),
                    extra: parse_extra(self.render_api_extra.as_deref())?,
                })
            })
            .transpose()?
        };

        let lease = lease_config(
            self.proxy_api_public_key,
            self.proxy_api_private_key,
            self.proxy_api_user_id,
        )?
        .map(|(public_key, private_key, user_id)| LeaseConfig {
            public_key,
            private_key,
            user_id,
            country: self.proxy_api_country,
            session_type: self.proxy_api_session_type,
            count: self.proxy_api_count,
            format: self.proxy_api_format,
            base_url: self.proxy_api_base_url,
        });

        let out_dir = self
            .out_dir
            .unwrap_or_else(|| PathBuf::from("output").join(target.slug()));

        Ok(Config {
            target,
            user_agent: self.user_agent,
            timeout: Duration::from_millis(self.timeout.max(1_000)),
            render_api,
            proxy: ProxySettings {
                value: self.proxy.and_then(|v| non_blank(&v)),
                list_path: self.proxy_list,
                rotation: self.proxy_rotate,
                retries: self.proxy_retries.max(1),
            },
            lease,
            impersonation: ImpersonationConfig {
                enabled: self.impersonate_first,
                profile: self.impersonate_profile,
            },
            browser: BrowserSettings {
                headless: !self.headful,
                chrome_path: self.chrome_path,
            },
            session: SessionPaths {
                storage_state: self.storage_state,
                netscape_cookies: self.netscape_cookies,
                save_storage_state: self.save_storage_state,
            },
            fallback_enabled: self.feed_fallback,
            output: OutputOptions {
                out_dir,
                quiet: self.quiet,
            },
        })
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn strip_quotes(value: &str) -> String {
    value.trim().trim_matches('"').trim_matches('\'').to_string()
}

/// An explicit key wins; otherwise a user/pass pair becomes `user:pass`.
fn render_credential(key: Option<&str>, user: Option<&str>, pass: Option<&str>) -> Option<String> {
    if let Some(key) = key.map(strip_quotes).filter(|k| !k.is_empty()) {
        return Some(key);
    }
    match (user.map(strip_quotes), pass.map(strip_quotes)) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(format!("{}:{}", u, p)),
        _ => None,
    }
}

fn parse_extra(raw: Option<&str>) -> Result<Map<String, Value>, ConfigError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ConfigError::RenderExtra("expected a JSON object".to_string())),
        Err(e) => Err(ConfigError::RenderExtra(e.to_string())),
    }
}

/// All three credentials or none; a partial set is a configuration error.
fn lease_config(
    public_key: Option<String>,
    private_key: Option<String>,
    user_id: Option<String>,
) -> Result<Option<(String, String, String)>, ConfigError> {
    let public_key = public_key.and_then(|v| non_blank(&v));
    let private_key = private_key.and_then(|v| non_blank(&v));
    let user_id = user_id.and_then(|v| non_blank(&v));

    match (public_key, private_key, user_id) {
        (None, None, None) => Ok(None),
        (Some(p), Some(k), Some(u)) => Ok(Some((p, k, u))),
        (p, k, u) => {
            let missing: Vec<&str> = [
                (p.is_none(), "public key"),
                (k.is_none(), "private key"),
                (u.is_none(), "proxy user id"),
            ]
            .iter()
            .filter(|(absent, _)| *absent)
            .map(|(_, name)| *name)
            .collect();
            Err(ConfigError::LeaseCredentials(missing.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["medium-fetch"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_resolve() {
        let config = cli(&["https://medium.com/@a/post-123"]).resolve().unwrap();
        assert_eq!(config.proxy.retries, 3);
        assert_eq!(config.proxy.rotation, RotationPolicy::RoundRobin);
        assert_eq!(config.output.out_dir, PathBuf::from("output/post-123"));
        assert_eq!(config.impersonation.binary(), "curl_chrome116");
        assert!(config.browser.headless);
        assert!(!config.fallback_enabled);
    }

    #[test]
    fn flags_override_defaults() {
        let config = cli(&[
            "https://medium.com/@a/post",
            "--proxy-rotate",
            "random",
            "--proxy-retries",
            "0",
            "--format",
            "json",
            "--no-images",
        ])
        .resolve()
        .unwrap();
        assert_eq!(config.proxy.rotation, RotationPolicy::Random);
        assert_eq!(config.proxy.retries, 1);
        assert_eq!(config.target.format, OutputFormat::Json);
        assert!(!config.target.download_images);
    }

    #[test]
    fn render_api_uses_user_pass_pair() {
        let config = cli(&[
            "https://medium.com/@a/post",
            "--render-api-user",
            "\"alice\"",
            "--render-api-pass",
            "s3cret",
        ])
        .resolve()
        .unwrap();
        assert_eq!(config.render_api.unwrap().credential, "alice:s3cret");
    }

    #[test]
    fn force_browser_disables_render_api() {
        let config = cli(&[
            "https://medium.com/@a/post",
            "--render-api-key",
            "token",
            "--force-browser",
        ])
        .resolve()
        .unwrap();
        assert!(config.render_api.is_none());
    }

    #[test]
    fn malformed_render_extra_fails_fast() {
        let err = cli(&[
            "https://medium.com/@a/post",
            "--render-api-key",
            "token",
            "--render-api-extra",
            "{not json",
        ])
        .resolve()
        .unwrap_err();
        assert!(matches!(err, ConfigError::RenderExtra(_)));

        let err = cli(&[
            "https://medium.com/@a/post",
            "--render-api-key",
            "token",
            "--render-api-extra",
            "[1, 2]",
        ])
        .resolve()
        .unwrap_err();
        assert!(matches!(err, ConfigError::RenderExtra(_)));
    }

    #[test]
    fn partial_lease_credentials_fail_fast() {
        let err = cli(&["https://medium.com/@a/post", "--proxy-api-public-key", "pub"])
            .resolve()
            .unwrap_err();
        match err {
            ConfigError::LeaseCredentials(missing) => {
                assert_eq!(missing, "private key, proxy user id")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn boolean_env_flags_accept_common_spellings() {
        for (raw, expected) in [("1", true), ("yes", true), ("on", true), ("0", false), ("false", false)] {
            std::env::set_var("MEDIUM_FETCH_VERBOSE", raw);
            let parsed = Cli::try_parse_from(["medium-fetch", "https://medium.com/@a/post"]);
            std::env::remove_var("MEDIUM_FETCH_VERBOSE");
            assert_eq!(parsed.unwrap().verbose, expected, "{}", raw);
        }
    }

    #[test]
    fn boolish_flags_still_work_without_a_value() {
        let cli = cli(&["https://medium.com/@a/post", "--feed-fallback", "--impersonate-first"]);
        assert!(cli.feed_fallback);
        assert!(cli.impersonate_first);
        assert!(!cli.force_browser);
    }

    #[test]
    fn unprefixed_env_names_fill_unset_primaries() {
        let env: std::collections::HashMap<&str, &str> = [
            ("DECODO_API_KEY", "alias-key"),
            ("MEDIUM_FETCH_PROXY_API_COUNTRY", "de"),
            ("PROXY_API_COUNTRY_ID", "fr"),
            ("MEDIUM_FETCH_PROXY_API_USER_ID", "  "),
            ("PROXY_API_PROXY_USER_ID", "u-7"),
        ]
        .into_iter()
        .collect();

        let filled = env_aliases(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(
            filled,
            vec![
                ("MEDIUM_FETCH_DECODO_API_KEY", "alias-key".to_string()),
                ("MEDIUM_FETCH_PROXY_API_USER_ID", "u-7".to_string()),
            ]
        );
    }
}
