use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::HealthRegistry;
use crate::images::builder::{Backend, BuildError, UrlBuilder};
use crate::images::types::{ImageReference, TransformSpec};

/// What to do when no backend URL can be built.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    /// Serve the unmodified source reference.
    #[default]
    Original,
    /// Propagate the failure to the caller.
    Error,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("No backend could address '{source_ref}': {reason}")]
    Exhausted { source_ref: String, reason: BuildError },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedImage {
    pub url: String,
    /// `None` when the original source is served unmodified.
    pub backend: Option<Backend>,
}

pub struct FailoverResolver {
    builder: UrlBuilder,
    health: HealthRegistry,
    strategy: FallbackStrategy,
}

impl FailoverResolver {
    pub fn new(builder: UrlBuilder, health: HealthRegistry, strategy: FallbackStrategy) -> Self {
        Self {
            builder,
            health,
            strategy,
        }
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn builder(&self) -> &UrlBuilder {
        &self.builder
    }

    /// Resolves through the configured strategy: with `Original` this never
    /// fails, with `Error` an exhausted resolution is returned to the caller.
    pub fn get_image_with_failover(
        &self,
        reference: &ImageReference,
        spec: &TransformSpec,
    ) -> Result<ResolvedImage, ResolveError> {
        match self.resolve(reference, spec) {
            Ok(resolved) => Ok(resolved),
            Err(err) => match self.strategy {
                FallbackStrategy::Original => {
                    log::error!("{}, serving original", err);
                    Ok(ResolvedImage {
                        url: reference.source().to_string(),
                        backend: None,
                    })
                }
                FallbackStrategy::Error => Err(err),
            },
        }
    }

    /// Health is a hint: a healthy primary is tried first, but a primary that
    /// cannot build a URL falls through to the secondary. An unhealthy
    /// primary is never addressed.
    pub fn resolve(&self, reference: &ImageReference, spec: &TransformSpec) -> Result<ResolvedImage, ResolveError> {
        if self.health.is_healthy() {
            match self.builder.build_url(Backend::Primary, reference, spec) {
                Ok(url) => {
                    return Ok(ResolvedImage {
                        url,
                        backend: Some(Backend::Primary),
                    })
                }
                Err(e) => log::warn!("Primary URL for '{}' failed ({}), using secondary", reference.source(), e),
            }
        }

        self.builder
            .build_url(Backend::Secondary, reference, spec)
            .map(|url| ResolvedImage {
                url,
                backend: Some(Backend::Secondary),
            })
            .map_err(|reason| ResolveError::Exhausted {
                source_ref: reference.source().to_string(),
                reason,
            })
    }
}
