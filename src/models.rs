use serde::Serialize;
use url::Url;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Markdown,
    Json,
    Text,
}

/// The one page a run is about. Built once from configuration.
#[derive(Debug, Clone)]
pub struct FetchTarget {
    pub url: Url,
    pub format: OutputFormat,
    pub download_images: bool,
    pub clean_markdown: bool,
}

impl FetchTarget {
    pub fn parse(url: &str, format: OutputFormat) -> Result<Self, ConfigError> {
        let parsed = Url::parse(url.trim()).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }
        Ok(Self {
            url: parsed,
            format,
            download_images: true,
            clean_markdown: true,
        })
    }

    pub fn slug(&self) -> String {
        slugify(&self.url)
    }
}

/// Last path segment reduced to `[A-Za-z0-9-_]`, at most 80 chars.
pub fn slugify(url: &Url) -> String {
    let last = url
        .path()
        .trim_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string();
    let mut slug = String::with_capacity(last.len());
    let mut in_run = false;
    for c in last.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            slug.push(c);
            in_run = false;
        } else if !in_run {
            slug.push('-');
            in_run = true;
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(80).collect();
    if slug.is_empty() {
        "article".to_string()
    } else {
        slug
    }
}

/// Title used when neither the page nor the feed supplies one.
pub const UNTITLED: &str = "Medium Article";

/// Where the document's markup came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Primary { strategy: String },
    Fallback { feed_url: String },
}

impl Provenance {
    pub fn tag(&self) -> &str {
        match self {
            Provenance::Primary { strategy } => strategy,
            Provenance::Fallback { .. } => "rss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArticleDocument {
    pub url: String,
    pub title: String,
    pub author: Option<String>,
    pub published: Option<String>,
    pub description: Option<String>,
    pub section: Option<String>,
    pub hero_image: Option<String>,
    /// Markup the body region is extracted from.
    pub body_markup: String,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageReference {
    pub local: String,
    pub remote: String,
}

/// A downloaded image waiting to be written next to the other artifacts.
#[derive(Debug, Clone)]
pub struct LocalizedImage {
    /// Position of the source element among the region's image candidates.
    pub index: usize,
    pub reference: ImageReference,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
    pub section: Option<String>,
    pub og_image: Option<String>,
    pub fetched_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,
    pub image_count: usize,
    pub images: Vec<ImageReference>,
}

/// Everything a finished run produces. Nothing is written before this exists.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub region_html: String,
    pub markdown: String,
    pub text: String,
    pub metadata: Metadata,
    pub images: Vec<LocalizedImage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slug_of(url: &str) -> String {
        slugify(&Url::parse(url).unwrap())
    }

    #[test]
    fn slug_uses_last_segment() {
        assert_eq!(
            slug_of("https://medium.com/@someone/my-post-1a2b3c"),
            "my-post-1a2b3c"
        );
        assert_eq!(slug_of("https://medium.com/pub/a.b!!c?x=1"), "a-b-c");
        assert_eq!(slug_of("https://medium.com/"), "article");
    }

    #[test]
    fn slug_is_truncated() {
        let long = "x".repeat(120);
        assert_eq!(slug_of(&format!("https://medium.com/{}", long)).len(), 80);
    }

    #[test]
    fn target_rejects_non_http_urls() {
        assert!(FetchTarget::parse("ftp://example.com/a", OutputFormat::Markdown).is_err());
        assert!(FetchTarget::parse("not a url", OutputFormat::Markdown).is_err());
        assert!(FetchTarget::parse("https://example.com/a", OutputFormat::Text).is_ok());
    }
}
