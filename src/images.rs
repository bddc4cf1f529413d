use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::extract::ImageCandidate;
use crate::http;
use crate::models::{ImageReference, LocalizedImage};
use crate::proxy::ProxyCandidate;

pub const IMAGES_DIR: &str = "images";

const DEFAULT_EXTENSION: &str = "jpg";
const MAX_EXTENSION_LEN: usize = 4;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// `image_{index:02}.{ext}`, with the extension taken from the URL path.
pub fn local_name(index: usize, remote: &str) -> String {
    let ext = Url::parse(remote)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_string)
        })
        .filter(|e| !e.is_empty() && e.len() <= MAX_EXTENSION_LEN)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    format!("image_{:02}.{}", index, ext)
}

/// Downloads candidates one at a time through the run's proxy. Bytes stay in
/// memory until the artifact is written.
pub struct ImageLocalizer {
    client: reqwest::Client,
}

impl ImageLocalizer {
    pub fn new(user_agent: &str, proxy: Option<&ProxyCandidate>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http::client(user_agent, DOWNLOAD_TIMEOUT, proxy)?,
        })
    }

    async fn download(&self, remote: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self.client.get(remote).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Failed downloads are skipped and leave their element untouched.
    pub async fn localize(&self, candidates: &[ImageCandidate]) -> Vec<LocalizedImage> {
        let mut localized = Vec::new();
        for candidate in candidates {
            let file_name = local_name(candidate.index, &candidate.remote);
            match self.download(&candidate.remote).await {
                Ok(bytes) => {
                    debug!(index = candidate.index, file = %file_name, bytes = bytes.len(), "image downloaded");
                    localized.push(LocalizedImage {
                        index: candidate.index,
                        reference: ImageReference {
                            local: format!("{}/{}", IMAGES_DIR, file_name),
                            remote: candidate.remote.clone(),
                        },
                        file_name,
                        bytes,
                    });
                }
                Err(e) => warn!(index = candidate.index, url = %candidate.remote, "image download failed: {}", e),
            }
        }
        info!(found = candidates.len(), downloaded = localized.len(), "images localized");
        localized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn names_keep_plausible_extensions() {
        assert_eq!(local_name(1, "https://x/a/photo.png"), "image_01.png");
        assert_eq!(local_name(2, "https://x/a/photo.jpeg?w=800"), "image_02.jpeg");
        assert_eq!(local_name(3, "https://x/a/photo"), "image_03.jpg");
        assert_eq!(local_name(4, "https://x/a/photo.original"), "image_04.jpg");
        assert_eq!(local_name(12, "https://x/1*abc.webp"), "image_12.webp");
    }

    #[tokio::test]
    async fn sequential_downloads_with_unique_names() {
        let server = MockServer::start().await;
        for name in ["one", "two", "four"] {
            Mock::given(method("GET"))
                .and(path(format!("/{}.png", name)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(name.as_bytes().to_vec()))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/three.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let candidates: Vec<ImageCandidate> = ["one", "two", "three", "four"]
            .iter()
            .enumerate()
            .map(|(i, name)| ImageCandidate {
                index: i + 1,
                remote: format!("{}/{}.png", server.uri(), name),
            })
            .collect();

        let localizer = ImageLocalizer::new("UA", None).unwrap();
        let images = localizer.localize(&candidates).await;

        let names: Vec<&str> = images.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, ["image_01.png", "image_02.png", "image_04.png"]);
        assert_eq!(images[2].bytes, b"four".to_vec());
        assert_eq!(images[2].reference.local, "images/image_04.png");
        assert!(images.iter().all(|i| !i.reference.remote.ends_with("three.png")));
    }
}
