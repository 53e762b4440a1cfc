//! Backend URL construction.
//!
//! Both conventions are pure: the same backend, reference and spec always
//! produce the same string, and unset spec fields are left out entirely.
//! Defaults belong to the caller.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;
use crate::images::types::{ImageReference, TransformSpec};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("{0} backend is not configured")]
    NotConfigured(Backend),

    #[error("Invalid {backend} endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        backend: Backend,
        endpoint: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Primary,
    Secondary,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Primary => f.write_str("primary"),
            Backend::Secondary => f.write_str("secondary"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UrlBuilder {
    /// Image CDN endpoint, e.g. `https://ik.imagekit.io/site`.
    pub primary_endpoint: String,
    /// S3-compatible store endpoint, e.g. `https://s3.tebi.io`.
    pub store_endpoint: String,
    pub bucket: String,
    /// Absolute URL of the optimizer route fronting the store.
    pub optimizer_url: String,
}

impl UrlBuilder {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            primary_endpoint: config.primary_url_endpoint.clone(),
            store_endpoint: config.secondary_endpoint.clone(),
            bucket: config.secondary_bucket.clone(),
            optimizer_url: config.optimizer_url.clone(),
        }
    }

    pub fn build_url(
        &self,
        backend: Backend,
        reference: &ImageReference,
        spec: &TransformSpec,
    ) -> Result<String, BuildError> {
        match backend {
            Backend::Primary => self.build_primary(reference, spec),
            Backend::Secondary => self.build_secondary(reference, spec),
        }
    }

    fn build_primary(&self, reference: &ImageReference, spec: &TransformSpec) -> Result<String, BuildError> {
        let endpoint = parse_endpoint(Backend::Primary, &self.primary_endpoint)?;
        let transformation = primary_transformation(spec);

        // Sources already hosted under the endpoint are addressed by path.
        let relative_path = if reference.is_absolute() {
            reference
                .source()
                .strip_prefix(self.primary_endpoint.trim_end_matches('/'))
                .filter(|rest| rest.starts_with('/'))
                .map(|rest| rest.trim_start_matches('/'))
        } else {
            Some(reference.path())
        };

        let mut url = endpoint;
        {
            let mut segments = url.path_segments_mut().map_err(|_| BuildError::InvalidEndpoint {
                backend: Backend::Primary,
                endpoint: self.primary_endpoint.clone(),
                reason: "cannot be a base URL".to_string(),
            })?;
            segments.pop_if_empty();

            match relative_path {
                Some(path) => {
                    if !transformation.is_empty() {
                        segments.push(&format!("tr:{}", transformation));
                    }
                    segments.extend(path.split('/').filter(|s| !s.is_empty()));
                }
                None => {
                    // Web proxy form: the whole source URL is one encoded segment.
                    segments.push(reference.source());
                }
            }
        }

        if relative_path.is_none() && !transformation.is_empty() {
            url.query_pairs_mut().append_pair("tr", &transformation);
        }

        Ok(url.to_string())
    }

    fn build_secondary(&self, reference: &ImageReference, spec: &TransformSpec) -> Result<String, BuildError> {
        let mut url = parse_endpoint(Backend::Secondary, &self.optimizer_url)?;
        let source = self.object_url(reference)?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("src", &source);
            if let Some(width) = spec.width {
                query.append_pair("w", &width.to_string());
            }
            if let Some(height) = spec.height {
                query.append_pair("h", &height.to_string());
            }
            if let Some(quality) = spec.quality {
                query.append_pair("q", &quality.to_string());
            }
            if let Some(format) = spec.format {
                query.append_pair("fm", format.as_str());
            }
            if let Some(crop) = spec.crop {
                query.append_pair("crop", crop.as_str());
            }
            if let Some(focus) = spec.focus {
                query.append_pair("focus", focus.as_str());
            }
            if let Some(blur) = spec.blur {
                query.append_pair("bl", &blur.to_string());
            }
        }

        Ok(url.to_string())
    }

    /// Public URL of the stored object behind a reference.
    pub fn object_url(&self, reference: &ImageReference) -> Result<String, BuildError> {
        if reference.is_absolute() {
            return Ok(reference.source().to_string());
        }
        if self.bucket.trim().is_empty() {
            return Err(BuildError::NotConfigured(Backend::Secondary));
        }
        let mut url = parse_endpoint(Backend::Secondary, &self.store_endpoint)?;
        url.path_segments_mut()
            .map_err(|_| BuildError::InvalidEndpoint {
                backend: Backend::Secondary,
                endpoint: self.store_endpoint.clone(),
                reason: "cannot be a base URL".to_string(),
            })?
            .pop_if_empty()
            .push(self.bucket.trim_matches('/'))
            .extend(reference.path().split('/').filter(|s| !s.is_empty()));
        Ok(url.to_string())
    }
}

fn parse_endpoint(backend: Backend, endpoint: &str) -> Result<Url, BuildError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(BuildError::NotConfigured(backend));
    }
    let url = Url::parse(endpoint).map_err(|e| BuildError::InvalidEndpoint {
        backend,
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(BuildError::InvalidEndpoint {
            backend,
            endpoint: endpoint.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}

// Comma separated `key-value` pairs in a fixed order.
fn primary_transformation(spec: &TransformSpec) -> String {
    let mut parts = Vec::new();

    if let Some(width) = spec.width {
        parts.push(format!("w-{}", width));
    }
    if let Some(height) = spec.height {
        parts.push(format!("h-{}", height));
    }
    if let Some(quality) = spec.quality {
        parts.push(format!("q-{}", quality));
    }
    if let Some(format) = spec.format {
        parts.push(format!("f-{}", format.as_str()));
    }
    if let Some(crop) = spec.crop {
        parts.push(format!("c-{}", crop.as_str()));
    }
    if let Some(focus) = spec.focus {
        parts.push(format!("fo-{}", focus.as_str()));
    }
    if let Some(blur) = spec.blur {
        parts.push(format!("bl-{}", blur));
    }

    parts.join(",")
}
