use std::collections::HashMap;

use chrono::Utc;
use ego_tree::NodeId;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::fetch::FetchedPage;
use crate::models::{ArticleDocument, Provenance, UNTITLED};

// ── Noise vocabulary ─────────────────────────────────────────────────────────

const NOISE_TAGS: &[&str] = &[
    "header", "nav", "footer", "aside", "form", "button", "svg", "script", "style", "noscript",
    "iframe", "dialog",
];

const SIGNIN_PATH: &str = "/m/signin";

static ARIA_NOISE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)share|listen|follow|bookmark|clap|sign in|sign up|subscribe").unwrap()
});

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static MULTI_NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static FIGURE_IMG: Lazy<Selector> = Lazy::new(|| Selector::parse("figure img").unwrap());
static ANY_IMG: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());
static OG_SOURCE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"source[data-testid="og"]"#).unwrap());
static ANY_SOURCE: Lazy<Selector> = Lazy::new(|| Selector::parse("source").unwrap());

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

// ── Page metadata ────────────────────────────────────────────────────────────

/// Head-level metadata of a primary page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
    pub section: Option<String>,
    pub og_image: Option<String>,
}

fn meta_content(document: &Html, attr: &str, key: &str) -> Option<String> {
    let sel = Selector::parse(&format!(r#"meta[{}="{}"]"#, attr, key)).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

pub fn page_metadata(markup: &str) -> PageMeta {
    let document = Html::parse_document(markup);
    PageMeta {
        title: meta_content(&document, "property", "og:title"),
        description: meta_content(&document, "property", "og:description"),
        author: meta_content(&document, "name", "author"),
        published: meta_content(&document, "name", "parsely-pub-date"),
        section: meta_content(&document, "name", "parsely-section"),
        og_image: meta_content(&document, "property", "og:image"),
    }
}

/// Build the document for a page delivered by one of the primary strategies.
pub fn primary_document(page: &FetchedPage, url: &Url) -> ArticleDocument {
    let meta = page_metadata(&page.markup);
    let title = meta
        .title
        .or_else(|| Some(page.title.trim().to_string()).filter(|t| !t.is_empty()))
        .unwrap_or_else(|| UNTITLED.to_string());

    ArticleDocument {
        url: url.to_string(),
        title,
        author: meta.author,
        published: meta.published,
        description: meta.description,
        section: meta.section,
        hero_image: meta.og_image,
        body_markup: page.markup.clone(),
        provenance: Provenance::Primary {
            strategy: page.strategy.to_string(),
        },
    }
}

pub fn fetched_at() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── Region ───────────────────────────────────────────────────────────────────

/// An image element that can be localized, in document order. `index` is the
/// 1-based position among all candidate elements, including skipped ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub index: usize,
    pub remote: String,
}

/// The three renditions of a cleaned region.
#[derive(Debug, Clone)]
pub struct RenderedRegion {
    pub html: String,
    pub markdown: String,
    pub text: String,
}

/// The article region of one document with UI chrome already removed.
///
/// Parsing is deterministic, so two `Region`s built from the same markup
/// agree on candidate indexes. The localizer relies on this to avoid holding
/// a parsed tree across downloads.
pub struct Region {
    document: Html,
    root: NodeId,
    base: Url,
}

impl Region {
    pub fn parse(markup: &str, base: &Url) -> Self {
        let document = Html::parse_document(markup);
        let root = find_region(&document);
        let mut region = Region {
            document,
            root,
            base: base.clone(),
        };
        region.strip_noise();
        region
    }

    fn root(&self) -> ElementRef<'_> {
        self.document
            .tree
            .get(self.root)
            .and_then(ElementRef::wrap)
            .unwrap_or_else(|| self.document.root_element())
    }

    fn strip_noise(&mut self) {
        let root = self.root();
        let doomed: Vec<NodeId> = root
            .descendants()
            .skip(1)
            .filter_map(ElementRef::wrap)
            .filter(|el| is_noise(*el))
            .map(|el| el.id())
            .collect();

        for id in doomed {
            if let Some(mut node) = self.document.tree.get_mut(id) {
                node.detach();
            }
        }
    }

    fn candidate_elements(&self) -> Vec<ElementRef<'_>> {
        let root = self.root();
        let in_figures: Vec<ElementRef<'_>> = root.select(&FIGURE_IMG).collect();
        if in_figures.is_empty() {
            root.select(&ANY_IMG).collect()
        } else {
            in_figures
        }
    }

    /// Resolvable, network-hosted image sources, in document order.
    pub fn image_candidates(&self) -> Vec<ImageCandidate> {
        self.candidate_elements()
            .into_iter()
            .enumerate()
            .filter_map(|(i, el)| {
                let remote = image_source(el).and_then(|src| absolute(&self.base, &src))?;
                Some(ImageCandidate {
                    index: i + 1,
                    remote,
                })
            })
            .collect()
    }

    /// Render the region, pointing the images in `rewrites` (candidate index
    /// to local path) at their local copies.
    pub fn render(&self, rewrites: &HashMap<usize, String>) -> RenderedRegion {
        let overlay: HashMap<NodeId, String> = self
            .candidate_elements()
            .into_iter()
            .enumerate()
            .filter_map(|(i, el)| rewrites.get(&(i + 1)).map(|local| (el.id(), local.clone())))
            .collect();

        let root = self.root();
        let ctx = WalkCtx {
            base: &self.base,
            overlay: &overlay,
        };

        let mut html = String::new();
        serialize(root, &overlay, &mut html);

        RenderedRegion {
            html,
            markdown: tidy(&walk_element(root, &ctx)),
            text: region_text(root),
        }
    }
}

/// `article`, else `main`, else `body`, else the whole document.
fn find_region(document: &Html) -> NodeId {
    for tag in ["article", "main", "body"] {
        let found = document
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == tag);
        if let Some(el) = found {
            return el.id();
        }
    }
    document.root_element().id()
}

fn is_noise(el: ElementRef<'_>) -> bool {
    let v = el.value();
    if NOISE_TAGS.contains(&v.name()) {
        return true;
    }
    if v.attr("aria-label").map(|a| ARIA_NOISE_RE.is_match(a)).unwrap_or(false) {
        return true;
    }
    v.name() == "a" && v.attr("href").map(|h| h.contains(SIGNIN_PATH)).unwrap_or(false)
}

fn absolute(base: &Url, src: &str) -> Option<String> {
    if src.starts_with("data:") {
        return None;
    }
    base.join(src).ok().map(|u| u.to_string())
}

/// `src`, then `data-src`; failing both, the largest (last) entry of the
/// enclosing `<picture>`'s preferred `<source srcset>`.
pub fn image_source(el: ElementRef<'_>) -> Option<String> {
    let v = el.value();
    let direct = v
        .attr("src")
        .filter(|s| !s.trim().is_empty())
        .or_else(|| v.attr("data-src").filter(|s| !s.trim().is_empty()));
    if let Some(src) = direct {
        return Some(src.trim().to_string());
    }

    let picture = el
        .parent()
        .and_then(ElementRef::wrap)
        .filter(|p| p.value().name() == "picture")?;
    let source = picture
        .select(&OG_SOURCE)
        .next()
        .or_else(|| picture.select(&ANY_SOURCE).next())?;
    last_srcset_entry(source.value().attr("srcset")?)
}

fn last_srcset_entry(srcset: &str) -> Option<String> {
    srcset
        .split(',')
        .filter_map(|part| part.split_whitespace().next())
        .last()
        .map(str::to_string)
}

// ── DOM tree walker → Markdown ───────────────────────────────────────────────

struct WalkCtx<'a> {
    base: &'a Url,
    overlay: &'a HashMap<NodeId, String>,
}

impl WalkCtx<'_> {
    fn image_target(&self, img: ElementRef<'_>) -> Option<String> {
        if let Some(local) = self.overlay.get(&img.id()) {
            return Some(local.clone());
        }
        image_source(img).and_then(|src| absolute(self.base, &src))
    }
}

fn image_markdown(img: ElementRef<'_>, ctx: &WalkCtx) -> Option<String> {
    let src = ctx.image_target(img)?;
    let alt = img.value().attr("alt").map(str::trim).unwrap_or("");
    Some(format!("![{}]({})\n\n", alt, src))
}

const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "figure", "ul", "ol", "blockquote", "pre", "div",
    "section", "hr",
];

/// Blocks always start on a fresh paragraph, even after inline content.
fn walk_element(el: ElementRef<'_>, ctx: &WalkCtx) -> String {
    let out = render_element(el, ctx);
    if !out.is_empty() && BLOCK_TAGS.contains(&el.value().name()) {
        format!("\n\n{}", out)
    } else {
        out
    }
}

fn render_element(el: ElementRef<'_>, ctx: &WalkCtx) -> String {
    let name = el.value().name();

    if matches!(name, "audio" | "video" | "source" | "track" | "template") {
        return String::new();
    }

    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name[1..].parse::<usize>().unwrap_or(1);
            let text = normalize_text(walk_children(el, ctx));
            if text.is_empty() {
                return String::new();
            }
            format!("{} {}\n\n", "#".repeat(level), text)
        }

        "figure" => handle_figure(el, ctx),

        "img" => image_markdown(el, ctx).unwrap_or_default(),

        "a" => {
            let href = el.value().attr("href").map(|h| {
                ctx.base
                    .join(h)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| h.to_string())
            });
            let content = walk_children(el, ctx);
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return String::new();
            }
            match href {
                Some(href) => format!("[{}]({})", trimmed, href),
                None => trimmed.to_string(),
            }
        }

        "p" => {
            let content = walk_children(el, ctx);
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return String::new();
            }
            format!("{}\n\n", trimmed)
        }

        "br" => "\n".to_string(),
        "hr" => "\n---\n\n".to_string(),

        "ul" => handle_list(el, ctx, false),
        "ol" => handle_list(el, ctx, true),

        "li" => {
            let content = walk_children(el, ctx);
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return String::new();
            }
            format!("- {}\n", trimmed)
        }

        "strong" | "b" => wrap_inline(el, ctx, "**"),
        "em" | "i" => wrap_inline(el, ctx, "*"),

        "blockquote" => {
            let content = walk_children(el, ctx);
            let quoted = content
                .trim()
                .lines()
                .map(|l| format!("> {}", l.trim()))
                .collect::<Vec<_>>()
                .join("\n");
            format!("{}\n\n", quoted)
        }

        "pre" => {
            let text = collect_text(el);
            format!("```\n{}\n```\n\n", text.trim_end())
        }

        "code" => format!("`{}`", collect_text(el)),

        "div" | "section" => {
            let content = walk_children(el, ctx);
            if content.trim().is_empty() {
                return String::new();
            }
            format!("{}\n\n", content.trim())
        }

        _ => walk_children(el, ctx),
    }
}

fn walk_children(el: ElementRef<'_>, ctx: &WalkCtx) -> String {
    let mut result = String::new();
    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                result.push_str(&WHITESPACE_RE.replace_all(&text.text, " "));
            }
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    result.push_str(&walk_element(child_el, ctx));
                }
            }
            _ => {}
        }
    }
    result
}

fn wrap_inline(el: ElementRef<'_>, ctx: &WalkCtx, marker: &str) -> String {
    let content = walk_children(el, ctx);
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("{}{}{}", marker, trimmed, marker)
}

fn handle_figure(el: ElementRef<'_>, ctx: &WalkCtx) -> String {
    let image = find_first_tag(el, "img").and_then(|img| image_markdown(img, ctx));
    let Some(mut result) = image else {
        return walk_children(el, ctx);
    };

    let caption = find_first_tag(el, "figcaption")
        .map(|fc| normalize_text(walk_children(fc, ctx)))
        .filter(|s| !s.is_empty());
    if let Some(cap) = caption {
        result.push_str(&format!("*{}*\n\n", cap));
    }
    result
}

fn handle_list(el: ElementRef<'_>, ctx: &WalkCtx, ordered: bool) -> String {
    let mut result = String::new();
    let mut idx = 1usize;

    for child in el.children().filter_map(ElementRef::wrap) {
        if child.value().name() != "li" {
            continue;
        }
        let content = walk_children(child, ctx);
        let trimmed = content.trim();
        if trimmed.is_empty() {
            continue;
        }
        if ordered {
            result.push_str(&format!("{}. {}\n", idx, trimmed));
            idx += 1;
        } else {
            result.push_str(&format!("- {}\n", trimmed));
        }
    }

    if !result.is_empty() {
        result.push('\n');
    }
    result
}

/// Strip per-line padding outside code fences and collapse blank runs.
fn tidy(markdown: &str) -> String {
    let mut in_fence = false;
    let lines: Vec<&str> = markdown
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return line.trim();
            }
            if in_fence {
                line.trim_end()
            } else {
                line.trim()
            }
        })
        .collect();
    MULTI_NEWLINE_RE
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

// ── HTML serialization ───────────────────────────────────────────────────────

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

/// Outer HTML of `el` with overlaid `src` values for localized images.
fn serialize(el: ElementRef<'_>, overlay: &HashMap<NodeId, String>, out: &mut String) {
    let v = el.value();
    let name = v.name();
    let local_src = overlay.get(&el.id());

    out.push('<');
    out.push_str(name);
    for (attr, value) in v.attrs() {
        out.push(' ');
        out.push_str(attr);
        out.push_str("=\"");
        match (attr, local_src) {
            ("src", Some(local)) => escape_attr(local, out),
            _ => escape_attr(value, out),
        }
        out.push('"');
    }
    if let Some(local) = local_src {
        if v.attr("src").is_none() {
            out.push_str(" src=\"");
            escape_attr(local, out);
            out.push('"');
        }
    }
    out.push('>');

    if VOID_TAGS.contains(&name) {
        return;
    }

    for child in el.children() {
        match child.value() {
            Node::Text(text) => escape_text(&text.text, out),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    serialize(child_el, overlay, out);
                }
            }
            _ => {}
        }
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

// ── DOM utility helpers ──────────────────────────────────────────────────────

/// Non-empty text runs of the region, trimmed, one per line.
fn region_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(el: ElementRef<'_>) -> String {
    el.text().collect()
}

fn normalize_text(text: String) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Depth-first search for the first element with the given tag name.
fn find_first_tag<'a>(el: ElementRef<'a>, tag: &str) -> Option<ElementRef<'a>> {
    el.descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .find(|child| child.value().name() == tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://medium.com/@a/post-1").unwrap()
    }

    fn render(markup: &str) -> RenderedRegion {
        Region::parse(markup, &base()).render(&HashMap::new())
    }

    #[test]
    fn prefers_article_then_main_then_body() {
        let both = "<body><main><p>main text</p><article><p>article text</p></article></main></body>";
        assert_eq!(render(both).text, "article text");
        let main_only = "<body><div>outside</div><main><p>main text</p></main></body>";
        assert_eq!(render(main_only).text, "main text");
        let body_only = "<body><div><p>one</p><p>two</p></div></body>";
        assert_eq!(render(body_only).text, "one\ntwo");
    }

    #[test]
    fn strips_chrome_and_labelled_controls() {
        let markup = r#"<article>
            <header><p>Top bar</p></header>
            <nav>Menu</nav>
            <h1>Title</h1>
            <div aria-label="Share this story"><span>Share</span></div>
            <div aria-label="Listen"><span>Play</span></div>
            <a href="https://medium.com/m/signin?redirect=x">Sign in</a>
            <p>Body text <a href="/@a/other">link</a></p>
            <button>Follow</button>
            <script>var x = 1;</script>
        </article>"#;
        let region = render(markup);
        assert_eq!(region.text, "Title\nBody text\nlink");
        assert!(!region.html.contains("Top bar"));
        assert!(!region.html.contains("signin"));
        assert!(region.markdown.contains("[link](https://medium.com/@a/other)"));
    }

    #[test]
    fn picture_srcset_yields_largest_candidate() {
        let markup = r#"<html><body><article>
            <figure><img src="https://cdn.example.com/direct.png" alt="one"></figure>
            <figure><picture><source srcset="a.jpg 400w, b.jpg 800w"><img alt="two"></picture></figure>
        </article></body></html>"#;
        let candidates = Region::parse(markup, &base()).image_candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].remote, "https://cdn.example.com/direct.png");
        assert_eq!(candidates[1].index, 2);
        assert_eq!(candidates[1].remote, "https://medium.com/@a/b.jpg");
    }

    #[test]
    fn og_source_wins_and_inline_sources_are_skipped() {
        let markup = r#"<article>
            <img src="data:image/png;base64,AAAA">
            <picture>
                <source srcset="https://x/webp-small.webp 1x, https://x/webp-big.webp 2x" type="image/webp">
                <source data-testid="og" srcset="https://x/og-small.jpeg 640w, https://x/og-big.jpeg 1400w">
                <img alt="hero">
            </picture>
            <img alt="nothing">
        </article>"#;
        let candidates = Region::parse(markup, &base()).image_candidates();
        assert_eq!(
            candidates,
            vec![ImageCandidate {
                index: 2,
                remote: "https://x/og-big.jpeg".to_string()
            }]
        );
    }

    #[test]
    fn figure_images_take_precedence() {
        let markup = r#"<article>
            <img src="https://x/avatar.png">
            <figure><img src="https://x/content.png"><figcaption>Caption</figcaption></figure>
        </article>"#;
        let region = Region::parse(markup, &base());
        let candidates = region.image_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].remote, "https://x/content.png");
        let md = region.render(&HashMap::new()).markdown;
        assert!(md.contains("![](https://x/content.png)\n\n*Caption*"));
    }

    #[test]
    fn rewrites_apply_to_markdown_and_html() {
        let markup = r#"<article>
            <figure><img src="https://x/one.png" alt="a &quot;b&quot;"></figure>
            <figure><picture><source srcset="https://x/two.jpg 800w"><img alt="two"></picture></figure>
        </article>"#;
        let region = Region::parse(markup, &base());
        let rewrites: HashMap<usize, String> = [
            (1, "images/image_01.png".to_string()),
            (2, "images/image_02.jpg".to_string()),
        ]
        .into_iter()
        .collect();
        let rendered = region.render(&rewrites);
        assert!(rendered.markdown.contains("(images/image_01.png)"));
        assert!(rendered.markdown.contains("![two](images/image_02.jpg)"));
        assert!(rendered.html.contains(r#"src="images/image_01.png""#));
        assert!(rendered.html.contains(r#"alt="a &quot;b&quot;""#));
        assert!(rendered.html.contains(r#"<img alt="two" src="images/image_02.jpg">"#));
        assert!(!rendered.html.contains("https://x/one.png"));
    }

    #[test]
    fn linked_thumbnail_keeps_its_shape() {
        let markup = r#"<article><a href="/@a"><img src="https://x/avatar.png" alt="A"></a><p>Hi</p></article>"#;
        let md = render(markup).markdown;
        assert!(md.lines().any(|l| l == "[![A](https://x/avatar.png)](https://medium.com/@a)"));
    }

    #[test]
    fn markdown_structure() {
        let markup = r#"<article>
            <h2>Section</h2>
            <p>Some <strong>bold</strong> and <em>soft</em>
               text.</p>
            <ol><li>first</li><li>second</li></ol>
            <blockquote><p>quoted</p></blockquote>
            <pre>let x = 1;
    indented();</pre>
        </article>"#;
        let md = render(markup).markdown;
        assert!(md.starts_with("## Section\n\nSome **bold** and *soft* text.\n\n1. first\n2. second"));
        assert!(md.contains("> quoted"));
        assert!(md.contains("```\nlet x = 1;\n    indented();\n```"));
        assert!(!md.contains("\n\n\n"));
    }

    #[test]
    fn head_metadata() {
        let markup = r#"<html><head>
            <title>Fallback title</title>
            <meta property="og:title" content="OG Title">
            <meta property="og:description" content=" A summary ">
            <meta name="author" content="A Writer">
            <meta name="parsely-pub-date" content="2024-01-01T10:00:00Z">
            <meta name="parsely-section" content="tech">
            <meta property="og:image" content="https://x/hero.png">
        </head><body></body></html>"#;
        let meta = page_metadata(markup);
        assert_eq!(meta.title.as_deref(), Some("OG Title"));
        assert_eq!(meta.description.as_deref(), Some("A summary"));
        assert_eq!(meta.author.as_deref(), Some("A Writer"));
        assert_eq!(meta.section.as_deref(), Some("tech"));
        assert_eq!(meta.og_image.as_deref(), Some("https://x/hero.png"));

        let page = FetchedPage::from_markup(markup.to_string(), "browser");
        let doc = primary_document(&page, &base());
        assert_eq!(doc.title, "OG Title");
        assert_eq!(doc.provenance.tag(), "browser");

        let bare = FetchedPage::from_markup("<title>Page</title>".to_string(), "browser");
        assert_eq!(primary_document(&bare, &base()).title, "Page");
        let empty = FetchedPage::from_markup("<p>x</p>".to_string(), "browser");
        assert_eq!(primary_document(&empty, &base()).title, UNTITLED);
    }
}
