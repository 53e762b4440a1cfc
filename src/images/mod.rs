pub mod builder;
pub mod failover;
pub mod proxy;
pub mod responsive;
pub mod tools;
pub mod types;
pub mod worker;

pub use builder::{Backend, BuildError, UrlBuilder};
pub use failover::{FailoverResolver, FallbackStrategy, ResolveError, ResolvedImage};
pub use proxy::{ImageOptimizer, OptimizedImage};
pub use responsive::{get_responsive_image_attributes, ResponsiveAttributes, ResponsiveOptions};
pub use tools::ImageProxyError;
pub use types::{AspectRatio, CropPolicy, Focus, ImageFormat, ImageReference, TransformSpec};
pub use worker::TranscodeWorker;
