use std::collections::HashMap;

use tracing::{info, warn};
use url::Url;

use crate::config::Config;
use crate::error::FetchError;
use crate::extract::{self, ImageCandidate, Region, RenderedRegion};
use crate::fallback;
use crate::fetch::{self, Cascade};
use crate::images::ImageLocalizer;
use crate::markdown;
use crate::models::{
    ArticleDocument, FetchTarget, ImageReference, Metadata, OutputArtifact, Provenance,
};
use crate::proxy::{ProxyCandidate, ProxyPool};
use crate::session::SessionState;

/// A document plus the proxy that delivered it.
#[derive(Debug)]
pub struct Acquired {
    pub document: ArticleDocument,
    pub proxy: Option<ProxyCandidate>,
}

/// Run the cascade; when it ends on a challenge page and the fallback is
/// enabled, try the feed through the last attempt's proxy.
pub async fn acquire(
    cascade: &Cascade,
    target: &FetchTarget,
    session: &SessionState,
    user_agent: &str,
    fallback_enabled: bool,
) -> Result<Acquired, FetchError> {
    let failure = match cascade.run(target, session).await {
        Ok(report) => {
            info!(strategy = report.page.strategy, attempts = report.attempts, "primary fetch succeeded");
            return Ok(Acquired {
                document: extract::primary_document(&report.page, &target.url),
                proxy: report.proxy,
            });
        }
        Err(failure) => failure,
    };

    if !(failure.fallback_eligible && fallback_enabled) {
        return Err(failure.error);
    }

    warn!("{}; falling back to the feed", failure.error);
    let document = fallback::recover(
        target,
        session,
        user_agent,
        failure.last_proxy.as_ref(),
        failure.error,
    )
    .await?;
    Ok(Acquired {
        document,
        proxy: failure.last_proxy,
    })
}

fn image_candidates(markup: &str, base: &Url) -> Vec<ImageCandidate> {
    Region::parse(markup, base).image_candidates()
}

fn render_region(markup: &str, base: &Url, rewrites: &HashMap<usize, String>) -> RenderedRegion {
    Region::parse(markup, base).render(rewrites)
}

fn metadata(doc: &ArticleDocument, images: &[ImageReference]) -> Metadata {
    let (fetch_mode, fallback, feed_url) = match &doc.provenance {
        Provenance::Primary { strategy } => (Some(strategy.clone()), None, None),
        Provenance::Fallback { feed_url } => {
            (None, Some(doc.provenance.tag().to_string()), Some(feed_url.clone()))
        }
    };
    Metadata {
        url: doc.url.clone(),
        title: doc.title.clone(),
        description: doc.description.clone(),
        author: doc.author.clone(),
        published: doc.published.clone(),
        section: doc.section.clone(),
        og_image: doc.hero_image.clone(),
        fetched_at: extract::fetched_at(),
        fetch_mode,
        fallback,
        feed_url,
        image_count: images.len(),
        images: images.to_vec(),
    }
}

/// Region extraction, image localization, markdown/text rendering and
/// document assembly.
pub async fn normalize(
    document: &ArticleDocument,
    target: &FetchTarget,
    proxy: Option<&ProxyCandidate>,
    user_agent: &str,
) -> Result<OutputArtifact, FetchError> {
    let candidates = if target.download_images {
        image_candidates(&document.body_markup, &target.url)
    } else {
        Vec::new()
    };

    let images = if candidates.is_empty() {
        Vec::new()
    } else {
        let localizer = ImageLocalizer::new(user_agent, proxy).map_err(|e| FetchError::Unexpected {
            strategy: "images".to_string(),
            message: e.to_string(),
        })?;
        localizer.localize(&candidates).await
    };

    let rewrites: HashMap<usize, String> = images
        .iter()
        .map(|image| (image.index, image.reference.local.clone()))
        .collect();
    let rendered = render_region(&document.body_markup, &target.url, &rewrites);

    let body = if target.clean_markdown {
        markdown::clean_markdown(&rendered.markdown)
    } else {
        rendered.markdown
    };
    let references: Vec<ImageReference> = images.iter().map(|i| i.reference.clone()).collect();

    Ok(OutputArtifact {
        markdown: markdown::build_document(document, &body, &references),
        metadata: metadata(document, &references),
        region_html: rendered.html,
        text: rendered.text,
        images,
    })
}

/// Full run for a resolved configuration and proxy pool.
pub async fn run(
    config: &Config,
    pool: ProxyPool,
    session: &SessionState,
) -> Result<OutputArtifact, FetchError> {
    let cascade = Cascade::new(fetch::ranked_strategies(config), pool, config.proxy.retries);
    info!(url = %config.target.url, strategies = ?cascade.strategy_names(), "fetching");

    let acquired = acquire(
        &cascade,
        &config.target,
        session,
        &config.user_agent,
        config.fallback_enabled,
    )
    .await?;
    normalize(
        &acquired.document,
        &config.target,
        acquired.proxy.as_ref(),
        &config.user_agent,
    )
    .await
}
