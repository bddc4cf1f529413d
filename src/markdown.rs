use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{ArticleDocument, ImageReference};

/// Whole lines (case-insensitive) that are UI labels, never prose.
const DROP_EXACT: &[&str] = &[
    "follow",
    "share",
    "listen",
    "sign in",
    "sign up",
    "write",
    "subscribe",
    "clap",
    "comments",
    "bookmark",
    "press enter or click to view image in full size",
];

const SIGNIN_MARKER: &str = "m/signin";

static LINKED_THUMBNAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[!\[.*\]\(.*\)\]\(.*\)$").unwrap());

static MULTI_NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn is_noise_line(stripped: &str) -> bool {
    let lower = stripped.to_lowercase();
    DROP_EXACT.contains(&lower.as_str())
        || stripped.contains(SIGNIN_MARKER)
        || LINKED_THUMBNAIL_RE.is_match(stripped)
        || (stripped.len() <= 3 && stripped.chars().all(|c| c.is_ascii_digit()))
}

/// Drop residual UI lines and collapse blank runs to a single blank line.
pub fn clean_markdown(markdown: &str) -> String {
    let kept: Vec<&str> = markdown
        .lines()
        .filter_map(|line| {
            let stripped = line.trim();
            if stripped.is_empty() {
                Some("")
            } else if is_noise_line(stripped) {
                None
            } else {
                Some(line)
            }
        })
        .collect();

    MULTI_NEWLINE_RE
        .replace_all(&kept.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Header block, separator, body and, when images were localized, the
/// reference list.
pub fn build_document(doc: &ArticleDocument, body: &str, images: &[ImageReference]) -> String {
    let mut header = vec![format!("# {}", doc.title), String::new(), format!("Source: {}", doc.url)];
    if let Some(author) = &doc.author {
        header.push(format!("Author: {}", author));
    }
    if let Some(published) = &doc.published {
        header.push(format!("Published: {}", published));
    }
    if let Some(description) = &doc.description {
        header.push(String::new());
        header.push(format!("> {}", description));
    }

    let mut markdown = format!("{}\n\n---\n\n{}", header.join("\n"), body);

    if !images.is_empty() {
        markdown.push_str("\n\n---\n\n## Image References\n");
        for image in images {
            markdown.push_str(&format!("- `{}` — {}\n", image.local, image.remote));
        }
    }

    format!("{}\n", markdown.trim())
}
