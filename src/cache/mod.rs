mod image;

pub use image::{CacheEntry, CacheError, ImageCache};
