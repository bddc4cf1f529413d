use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::FetchError;
use crate::images::IMAGES_DIR;
use crate::models::{Metadata, OutputArtifact, OutputFormat};

pub const HTML_FILE: &str = "article.html";
pub const MARKDOWN_FILE: &str = "article.md";
pub const TEXT_FILE: &str = "article.txt";
pub const METADATA_FILE: &str = "metadata.json";

fn write(path: &Path, contents: impl AsRef<[u8]>) -> Result<(), FetchError> {
    fs::write(path, contents).map_err(|e| FetchError::Output(format!("{}: {}", path.display(), e)))
}

/// Write every artifact of a finished run under `out_dir`.
pub fn write_artifacts(out_dir: &Path, artifact: &OutputArtifact) -> Result<(), FetchError> {
    let images_dir = out_dir.join(IMAGES_DIR);
    fs::create_dir_all(&images_dir)
        .map_err(|e| FetchError::Output(format!("{}: {}", images_dir.display(), e)))?;

    for image in &artifact.images {
        write(&images_dir.join(&image.file_name), &image.bytes)?;
    }

    let metadata = serde_json::to_string_pretty(&artifact.metadata)
        .map_err(|e| FetchError::Output(e.to_string()))?;

    write(&out_dir.join(HTML_FILE), &artifact.region_html)?;
    write(&out_dir.join(MARKDOWN_FILE), &artifact.markdown)?;
    write(&out_dir.join(TEXT_FILE), &artifact.text)?;
    write(&out_dir.join(METADATA_FILE), metadata)?;

    info!(dir = %out_dir.display(), images = artifact.images.len(), "artifacts written");
    Ok(())
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    meta: &'a Metadata,
    markdown: &'a str,
    text: &'a str,
}

/// What goes to standard output for `format`.
pub fn render_stdout(format: OutputFormat, artifact: &OutputArtifact) -> Result<String, FetchError> {
    match format {
        OutputFormat::Markdown => Ok(artifact.markdown.clone()),
        OutputFormat::Text => Ok(artifact.text.clone()),
        OutputFormat::Json => serde_json::to_string_pretty(&JsonOutput {
            meta: &artifact.metadata,
            markdown: &artifact.markdown,
            text: &artifact.text,
        })
        .map_err(|e| FetchError::Output(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageReference, LocalizedImage};
    use std::path::PathBuf;

    fn artifact_paths(out_dir: &Path) -> Vec<PathBuf> {
        [HTML_FILE, MARKDOWN_FILE, TEXT_FILE, METADATA_FILE]
            .iter()
            .map(|name| out_dir.join(name))
            .collect()
    }

    fn artifact() -> OutputArtifact {
        let reference = ImageReference {
            local: "images/image_01.png".to_string(),
            remote: "https://x/one.png".to_string(),
        };
        OutputArtifact {
            region_html: "<article><p>Hi</p></article>".to_string(),
            markdown: "# T\n\nHi\n".to_string(),
            text: "Hi".to_string(),
            metadata: Metadata {
                url: "https://medium.com/@a/p".to_string(),
                title: "T".to_string(),
                description: None,
                author: Some("A".to_string()),
                published: None,
                section: None,
                og_image: None,
                fetched_at: "2024-01-01T00:00:00Z".to_string(),
                fetch_mode: Some("browser".to_string()),
                fallback: None,
                feed_url: None,
                image_count: 1,
                images: vec![reference.clone()],
            },
            images: vec![LocalizedImage {
                index: 1,
                reference,
                file_name: "image_01.png".to_string(),
                bytes: vec![0x89, b'P', b'N', b'G'],
            }],
        }
    }

    #[test]
    fn writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("my-post");
        write_artifacts(&out, &artifact()).unwrap();

        for path in artifact_paths(&out) {
            assert!(path.exists(), "{} missing", path.display());
        }
        assert_eq!(fs::read(out.join("images/image_01.png")).unwrap(), vec![0x89, b'P', b'N', b'G']);

        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(meta["image_count"], 1);
        assert_eq!(meta["images"][0]["local"], "images/image_01.png");
        assert_eq!(meta["fetch_mode"], "browser");
        assert!(meta.get("fallback").is_none());
        assert!(meta["published"].is_null());
    }

    #[test]
    fn stdout_formats() {
        let a = artifact();
        assert_eq!(render_stdout(OutputFormat::Markdown, &a).unwrap(), "# T\n\nHi\n");
        assert_eq!(render_stdout(OutputFormat::Text, &a).unwrap(), "Hi");
        let json: serde_json::Value =
            serde_json::from_str(&render_stdout(OutputFormat::Json, &a).unwrap()).unwrap();
        assert_eq!(json["meta"]["title"], "T");
        assert_eq!(json["text"], "Hi");
        assert!(json["markdown"].as_str().unwrap().starts_with("# T"));
    }
}
