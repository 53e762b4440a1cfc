use std::sync::Arc;
use std::time::Duration;

use crate::cache::ImageCache;
use crate::images::tools::{convert_image, detect_image_type, ImageProxyError};
use crate::images::types::{ImageFormat, TransformSpec};
use crate::images::worker::{transcode_blocking, TranscodeWorker};

pub struct OptimizedImage {
    pub data: Vec<u8>,
    pub content_type: String,
    pub from_cache: bool,
}

/// Transformation endpoint in front of the S3-compatible store: fetches the
/// stored object, transcodes it and memoizes the variant on disk.
pub struct ImageOptimizer {
    client: reqwest::Client,
    cache: ImageCache,
    worker: Option<TranscodeWorker>,
    allowed_origins: Vec<String>,
    avif_decoding: bool,
}

impl ImageOptimizer {
    pub fn new(
        timeout: u64,
        cache: ImageCache,
        allowed_origins: Vec<String>,
    ) -> Result<Self, ImageProxyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            client,
            cache,
            worker: None,
            allowed_origins: allowed_origins
                .into_iter()
                .map(|origin| origin.trim_end_matches('/').to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            avif_decoding: false,
        })
    }

    pub fn with_worker(mut self, worker: TranscodeWorker) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Whether AVIF sources can be decoded. When not, they only pass through
    /// untouched to clients that asked for AVIF.
    pub fn with_avif_decoding(mut self, supported: bool) -> Self {
        self.avif_decoding = supported;
        self
    }

    pub fn is_allowed_source(&self, url: &str) -> bool {
        self.allowed_origins.iter().any(|origin| {
            url.strip_prefix(origin.as_str())
                .map_or(false, |rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    // Fetch and optionally convert an image
    pub async fn optimize(&self, url: &str, spec: &TransformSpec) -> Result<OptimizedImage, ImageProxyError> {
        if !self.is_allowed_source(url) {
            log::warn!("Rejected image source outside allowed origins: {}", url);
            return Err(ImageProxyError::ForbiddenSource(url.to_string()));
        }

        if !spec.needs_conversion() {
            let (data, content_type) = self.fetch_image(url).await?;
            return Ok(OptimizedImage {
                data,
                content_type,
                from_cache: false,
            });
        }

        let key = spec.fingerprint(url);
        if let Some(entry) = self.cache.check_cache(&key).await {
            match self.cache.read(&entry).await {
                Ok(data) => {
                    log::info!("Optimized image found in cache: {} with params: {:?}", url, spec);
                    return Ok(OptimizedImage {
                        data,
                        content_type: entry.format.content_type().to_string(),
                        from_cache: true,
                    });
                }
                Err(e) => log::warn!("Failed to read cached variant {}: {}", entry.path.display(), e),
            }
        }

        log::info!("Optimized image not found in cache: {} with params: {:?}", url, spec);

        let (original_data, original_content_type) = self.fetch_image(url).await?;

        let is_avif = ImageFormat::from_content_type(&original_content_type) == Some(ImageFormat::Avif);
        if is_avif && !self.avif_decoding {
            // Untouched AVIF is only useful to a client that asked for AVIF
            if spec.format != Some(ImageFormat::Avif) {
                return Err(ImageProxyError::ConversionError(format!(
                    "Cannot decode AVIF source {} into {}",
                    url,
                    spec.format.unwrap_or(ImageFormat::Jpg)
                )));
            }
            log::warn!("Cannot decode AVIF source {}, serving original", url);
            return Ok(OptimizedImage {
                data: original_data,
                content_type: original_content_type,
                from_cache: false,
            });
        }

        let (data, format) = match &self.worker {
            Some(worker) => worker.transcode(original_data, spec).await?,
            None => transcode_blocking(convert_image, Arc::new(original_data), spec).await?,
        };

        // Cache writes are best effort
        if let Err(e) = self.cache.write_cache(&key, &data, format).await {
            log::warn!("Failed to cache optimized image {}: {}", url, e);
        }

        Ok(OptimizedImage {
            data,
            content_type: format.content_type().to_string(),
            from_cache: false,
        })
    }

    // Fetch an image from a URL
    pub async fn fetch_image(&self, url: &str) -> Result<(Vec<u8>, String), ImageProxyError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "image/avif,image/webp,image/*,*/*;q=0.8")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::error!("Image request failed with status: {}", status);
            return Err(ImageProxyError::ImageError(format!(
                "Image request failed with status: {}",
                status
            )));
        }

        // Get the content-type from headers or default to octet-stream
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let image_data = response.bytes().await?.to_vec();

        // If content type is missing or generic, try to detect from image data
        let content_type = if content_type == "application/octet-stream" || content_type.is_empty() {
            detect_image_type(&image_data).unwrap_or("image/jpeg").to_string()
        } else {
            content_type
        };

        Ok((image_data, content_type))
    }
}
