use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{info, warn};
use url::Url;

use crate::error::FetchError;
use crate::http;
use crate::models::{ArticleDocument, FetchTarget, Provenance, UNTITLED};
use crate::proxy::ProxyCandidate;
use crate::session::SessionState;

const FEED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub content: String,
    pub author: String,
    pub published: String,
}

/// `{scheme}://{host}/feed/{first path segment}`. Author pages (`/@handle/...`)
/// and publications share the same shape. `None` for a bare host.
pub fn feed_url(url: &Url) -> Option<String> {
    let path = url.path().trim_matches('/');
    let first = path.split('/').next().filter(|s| !s.is_empty())?;
    let host = url.host_str()?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Some(format!("{}://{}/feed/{}", url.scheme(), authority, first))
}

#[derive(Clone, Copy)]
enum Field {
    Title,
    Link,
    Description,
    Content,
    Author,
    Published,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"description" => Some(Field::Description),
            b"content:encoded" => Some(Field::Content),
            b"dc:creator" => Some(Field::Author),
            b"pubDate" => Some(Field::Published),
            _ => None,
        }
    }

    fn slot<'a>(&self, item: &'a mut FeedItem) -> &'a mut String {
        match self {
            Field::Title => &mut item.title,
            Field::Link => &mut item.link,
            Field::Description => &mut item.description,
            Field::Content => &mut item.content,
            Field::Author => &mut item.author,
            Field::Published => &mut item.published,
        }
    }
}

/// Every `<item>` of an RSS document, text fields trimmed.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut items = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = e.name();
                if name.as_ref() == b"item" {
                    current = Some(FeedItem::default());
                } else if current.is_some() {
                    field = Field::from_tag(name.as_ref());
                }
            }
            Event::End(e) => {
                if e.name().as_ref() == b"item" {
                    if let Some(mut item) = current.take() {
                        for f in [
                            Field::Title,
                            Field::Link,
                            Field::Description,
                            Field::Content,
                            Field::Author,
                            Field::Published,
                        ] {
                            let slot = f.slot(&mut item);
                            *slot = slot.trim().to_string();
                        }
                        items.push(item);
                    }
                }
                field = None;
            }
            Event::Text(e) => {
                if let (Some(item), Some(f)) = (current.as_mut(), field) {
                    f.slot(item).push_str(&e.unescape()?);
                }
            }
            Event::CData(e) => {
                if let (Some(item), Some(f)) = (current.as_mut(), field) {
                    f.slot(item).push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}

/// The item whose link contains `slug`, else the newest (first) item.
pub fn select_item<'a>(items: &'a [FeedItem], slug: &str) -> Option<&'a FeedItem> {
    items
        .iter()
        .find(|item| !slug.is_empty() && item.link.contains(slug))
        .or_else(|| items.first())
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

async fn read_feed(
    feed: &str,
    session: &SessionState,
    user_agent: &str,
    proxy: Option<&ProxyCandidate>,
) -> Result<String, String> {
    let client = http::client(user_agent, FEED_TIMEOUT, proxy).map_err(|e| e.to_string())?;
    let mut request = client.get(feed);
    if let Ok(parsed) = Url::parse(feed) {
        if let Some(cookie) = http::cookie_header(&session.pairs_for(&parsed)) {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
    }
    let response = request
        .send()
        .await
        .map_err(|e| http::describe_transport(&e))?;
    if !response.status().is_success() {
        return Err(format!("feed returned HTTP {}", response.status()));
    }
    response.text().await.map_err(|e| e.to_string())
}

async fn try_feed(
    target: &FetchTarget,
    session: &SessionState,
    user_agent: &str,
    proxy: Option<&ProxyCandidate>,
) -> Result<ArticleDocument, String> {
    let feed = feed_url(&target.url).ok_or("no feed for a bare host")?;
    info!(feed = %feed, "trying feed fallback");

    let xml = read_feed(&feed, session, user_agent, proxy).await?;
    let items = parse_feed(&xml).map_err(|e| format!("feed is not valid XML: {}", e))?;
    let item = select_item(&items, &target.slug()).ok_or("feed has no items")?;

    let body = if item.content.is_empty() {
        &item.description
    } else {
        &item.content
    };

    Ok(ArticleDocument {
        url: target.url.to_string(),
        title: non_empty(&item.title).unwrap_or_else(|| UNTITLED.to_string()),
        author: non_empty(&item.author),
        published: non_empty(&item.published),
        description: None,
        section: None,
        hero_image: None,
        body_markup: body.clone(),
        provenance: Provenance::Fallback { feed_url: feed },
    })
}

/// Recover the article from the feed, or give back the blocking error as
/// `FallbackExhausted`.
pub async fn recover(
    target: &FetchTarget,
    session: &SessionState,
    user_agent: &str,
    proxy: Option<&ProxyCandidate>,
    blocked: FetchError,
) -> Result<ArticleDocument, FetchError> {
    match try_feed(target, session, user_agent, proxy).await {
        Ok(document) => {
            info!(title = %document.title, "recovered article from feed");
            Ok(document)
        }
        Err(reason) => {
            warn!("feed fallback failed: {}", reason);
            Err(FetchError::FallbackExhausted {
                blocked: Box::new(blocked),
            })
        }
    }
}
