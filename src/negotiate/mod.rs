//! Output format negotiation.
//!
//! Per request, a client's own probe report beats an `Accept` header, which
//! beats the User-Agent heuristic. A weaker signal only fills in what the
//! stronger ones left unknown. Decode probes run against this binary's own
//! decoders and are persisted once.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::images::ImageFormat;

pub const AVIF_SUPPORT_KEY: &str = "avif-support";
pub const WEBP_SUPPORT_KEY: &str = "webp-support";

/// Name of the cookie in which clients persist their own probe results.
pub const CLIENT_FORMATS_COOKIE: &str = "image_formats";

// 1x1 AVIF still image.
const AVIF_SAMPLE: &str = "AAAAIGZ0eXBhdmlmAAAAAGF2aWZtaWYxbWlhZk1BMUIAAADybWV0YQAAAAAAAAAoaGRscgAAAAAAAAAAcGljdAAAAAAAAAAAAAAAAGxpYmF2aWYAAAAADnBpdG0AAAAAAAEAAAAeaWxvYwAAAABEAAABAAEAAAABAAABGgAAAB0AAAAoaWluZgAAAAAAAQAAABppbmZlAgAAAAABAABhdjAxQ29sb3IAAAAAamlwcnAAAABLaXBjbwAAABRpc3BlAAAAAAAAAAIAAAACAAAAEHBpeGkAAAAAAwgICAAAAAxhdjFDgQ0MAAAAABNjb2xybmNseAACAAIAAYAAAAAXaXBtYQAAAAAAAAABAAEEAQKDBAAAACVtZGF0EgAKCBgANogQEAwgMg8f8D///8WfhwB8+ErK42A=";

// 1x1 lossy WebP.
const WEBP_SAMPLE: &str = "UklGRiIAAABXRUJQVlA4IBYAAAAwAQCdASoBAAEADsD+JaQAA3AAAAAA";

lazy_static! {
    static ref CHROME_VERSION: Regex = Regex::new(r"(?:Chrome|CriOS)/(\d+)").unwrap();
    static ref FIREFOX_VERSION: Regex = Regex::new(r"(?:Firefox|FxiOS)/(\d+)").unwrap();
    static ref SAFARI_VERSION: Regex = Regex::new(r"Version/(\d+)(?:\.\d+)*.*Safari/").unwrap();
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Support {
    #[default]
    Unknown,
    Supported,
    Unsupported,
}

impl Support {
    fn from_flag(flag: bool) -> Self {
        if flag {
            Support::Supported
        } else {
            Support::Unsupported
        }
    }

    fn from_stored(value: &str) -> Self {
        match value {
            "true" => Support::Supported,
            "false" => Support::Unsupported,
            _ => Support::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        *self != Support::Unknown
    }

    // A known value always wins over an unknown one.
    fn or(self, weaker: Support) -> Support {
        if self.is_known() {
            self
        } else {
            weaker
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FormatSupport {
    pub avif: Support,
    pub webp: Support,
}

impl FormatSupport {
    /// Best encoding for this client: AVIF, then WebP, then JPEG.
    pub fn best_format(&self) -> ImageFormat {
        if self.avif == Support::Supported {
            ImageFormat::Avif
        } else if self.webp == Support::Supported {
            ImageFormat::Webp
        } else {
            ImageFormat::Jpg
        }
    }

    /// Fill the formats still unknown here from a weaker signal.
    pub fn merge(self, weaker: FormatSupport) -> FormatSupport {
        FormatSupport {
            avif: self.avif.or(weaker.avif),
            webp: self.webp.or(weaker.webp),
        }
    }

    /// Parses a client probe report such as `avif:1,webp:0`.
    pub fn from_client_report(report: &str) -> FormatSupport {
        let mut support = FormatSupport::default();
        for entry in report.split(',') {
            let Some((name, flag)) = entry.trim().split_once(':') else {
                continue;
            };
            let value = match flag.trim() {
                "1" | "true" => Support::Supported,
                "0" | "false" => Support::Unsupported,
                _ => continue,
            };
            match name.trim() {
                "avif" => support.avif = value,
                "webp" => support.webp = value,
                _ => {}
            }
        }
        support
    }

    /// Formats explicitly listed in an `Accept` header. Absence proves
    /// nothing, so unlisted formats stay unknown.
    pub fn from_accept(accept: &str) -> FormatSupport {
        let mut support = FormatSupport::default();
        for media_range in accept.split(',') {
            match media_range.split(';').next().map(str::trim) {
                Some("image/avif") => support.avif = Support::Supported,
                Some("image/webp") => support.webp = Support::Supported,
                _ => {}
            }
        }
        support
    }

    /// Coarse, best-effort guess from browser version substrings.
    pub fn from_user_agent(user_agent: &str) -> FormatSupport {
        let version = |re: &Regex| -> Option<u32> {
            re.captures(user_agent)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok())
        };

        let (avif_since, webp_since, major) = if let Some(major) = version(&CHROME_VERSION) {
            (85, 32, major)
        } else if let Some(major) = version(&FIREFOX_VERSION) {
            (93, 65, major)
        } else if let Some(major) = version(&SAFARI_VERSION) {
            (16, 14, major)
        } else {
            return FormatSupport {
                avif: Support::Unsupported,
                webp: Support::Unsupported,
            };
        };

        FormatSupport {
            avif: Support::from_flag(major >= avif_since),
            webp: Support::from_flag(major >= webp_since),
        }
    }
}

/// Server-side negotiation from request metadata: the client's own probe
/// report first, then `Accept`, then the User-Agent heuristic.
pub fn negotiate_from_headers(
    client_report: Option<&str>,
    accept: Option<&str>,
    user_agent: Option<&str>,
) -> FormatSupport {
    let reported = client_report.map(FormatSupport::from_client_report).unwrap_or_default();
    let accepted = accept.map(FormatSupport::from_accept).unwrap_or_default();
    let guessed = user_agent.map(FormatSupport::from_user_agent).unwrap_or_default();
    reported.merge(accepted).merge(guessed)
}

/// Persisted key-value storage for capability probe results.
pub trait CapabilityStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryCapabilityStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryCapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CapabilityStore for MemoryCapabilityStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON file backed store; survives restarts.
#[derive(Debug)]
pub struct FileCapabilityStore {
    path: PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl FileCapabilityStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable capability store {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }
}

impl CapabilityStore for FileCapabilityStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.write();
        values.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&*values)?)?;
        Ok(())
    }
}

/// Attempts a throwaway decode of sample bytes.
pub trait DecodeProbe: Send + Sync {
    fn decodes(&self, format: ImageFormat, bytes: &[u8]) -> bool;
}

/// Decodes with the `image` crate as compiled into this binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageDecodeProbe;

impl DecodeProbe for ImageDecodeProbe {
    fn decodes(&self, format: ImageFormat, bytes: &[u8]) -> bool {
        let format = match format {
            ImageFormat::Avif => image::ImageFormat::Avif,
            ImageFormat::Webp => image::ImageFormat::WebP,
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpg | ImageFormat::Auto => image::ImageFormat::Jpeg,
        };
        image::load_from_memory_with_format(bytes, format).is_ok()
    }
}

/// Probes decode support at most once per store: results are written under
/// fixed keys and never invalidated, so a decoder gained or lost later is
/// only noticed once the store is cleared.
pub struct FormatNegotiator<S, P> {
    store: S,
    probe: P,
}

impl<S: CapabilityStore, P: DecodeProbe> FormatNegotiator<S, P> {
    pub fn new(store: S, probe: P) -> Self {
        Self { store, probe }
    }

    pub fn detect_avif_support(&self) -> bool {
        self.detect(AVIF_SUPPORT_KEY, ImageFormat::Avif, AVIF_SAMPLE)
    }

    pub fn detect_webp_support(&self) -> bool {
        self.detect(WEBP_SUPPORT_KEY, ImageFormat::Webp, WEBP_SAMPLE)
    }

    /// Cached results only, without probing.
    pub fn cached_support(&self) -> FormatSupport {
        let read = |key| self.store.get(key).map_or(Support::Unknown, |v| Support::from_stored(&v));
        FormatSupport {
            avif: read(AVIF_SUPPORT_KEY),
            webp: read(WEBP_SUPPORT_KEY),
        }
    }

    pub fn negotiate(&self) -> FormatSupport {
        FormatSupport {
            avif: Support::from_flag(self.detect_avif_support()),
            webp: Support::from_flag(self.detect_webp_support()),
        }
    }

    fn detect(&self, key: &str, format: ImageFormat, sample: &str) -> bool {
        if let Some(cached) = self.store.get(key) {
            match Support::from_stored(&cached) {
                Support::Supported => return true,
                Support::Unsupported => return false,
                Support::Unknown => debug!("Ignoring malformed cached value for {}: {}", key, cached),
            }
        }

        let supported = match STANDARD.decode(sample) {
            Ok(bytes) => self.probe.decodes(format, &bytes),
            Err(e) => {
                warn!("Invalid {} probe sample: {}", format, e);
                false
            }
        };
        info!("{} decode support: {}", format, supported);

        if let Err(e) = self.store.set(key, if supported { "true" } else { "false" }) {
            warn!("Failed to persist {}: {}", key, e);
        }
        supported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingProbe {
        result: bool,
        calls: AtomicUsize,
    }

    impl CountingProbe {
        fn new(result: bool) -> Self {
            Self {
                result,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl DecodeProbe for &CountingProbe {
        fn decodes(&self, _format: ImageFormat, bytes: &[u8]) -> bool {
            assert!(!bytes.is_empty());
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    #[test]
    fn avif_probe_runs_once() {
        let probe = CountingProbe::new(true);
        let negotiator = FormatNegotiator::new(MemoryCapabilityStore::new(), &probe);

        assert!(negotiator.detect_avif_support());
        assert!(negotiator.detect_avif_support());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(negotiator.cached_support().avif, Support::Supported);
    }

    #[test]
    fn failed_avif_decode_caches_false() {
        let probe = CountingProbe::new(false);
        let store = MemoryCapabilityStore::new();
        let negotiator = FormatNegotiator::new(store, &probe);

        assert!(!negotiator.detect_avif_support());
        assert_eq!(negotiator.store.get(AVIF_SUPPORT_KEY).as_deref(), Some("false"));
        assert!(!negotiator.detect_avif_support());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_support_does_not_probe() {
        let probe = CountingProbe::new(true);
        let negotiator = FormatNegotiator::new(MemoryCapabilityStore::new(), &probe);

        assert_eq!(negotiator.cached_support(), FormatSupport::default());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("capabilities.json");
        let probe = CountingProbe::new(false);

        let negotiator = FormatNegotiator::new(FileCapabilityStore::open(&path).unwrap(), &probe);
        assert!(!negotiator.detect_webp_support());

        let reopened = FormatNegotiator::new(FileCapabilityStore::open(&path).unwrap(), &probe);
        assert!(!reopened.detect_webp_support());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn best_format_prefers_avif_then_webp() {
        let mut support = FormatSupport::default();
        assert_eq!(support.best_format(), ImageFormat::Jpg);
        support.webp = Support::Supported;
        assert_eq!(support.best_format(), ImageFormat::Webp);
        support.avif = Support::Supported;
        assert_eq!(support.best_format(), ImageFormat::Avif);
    }

    #[test]
    fn user_agent_heuristic() {
        let chrome = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        let old_chrome = "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/70.0.3538.77 Safari/537.36";
        let firefox = "Mozilla/5.0 (X11; Linux x86_64; rv:90.0) Gecko/20100101 Firefox/90.0";
        let safari = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.4 Safari/605.1.15";
        let old_safari = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_13_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.1 Safari/605.1.15";

        assert_eq!(FormatSupport::from_user_agent(chrome).best_format(), ImageFormat::Avif);
        assert_eq!(FormatSupport::from_user_agent(old_chrome).best_format(), ImageFormat::Webp);
        assert_eq!(FormatSupport::from_user_agent(firefox).best_format(), ImageFormat::Webp);
        assert_eq!(FormatSupport::from_user_agent(safari).best_format(), ImageFormat::Avif);
        assert_eq!(FormatSupport::from_user_agent(old_safari).best_format(), ImageFormat::Jpg);
        assert_eq!(FormatSupport::from_user_agent("curl/8.0").best_format(), ImageFormat::Jpg);
    }

    #[test]
    fn client_report_overrides_heuristics() {
        let chrome = "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        let support = negotiate_from_headers(Some("avif:0,webp:1"), Some("image/avif,image/webp,*/*"), Some(chrome));
        assert_eq!(support.avif, Support::Unsupported);
        assert_eq!(support.best_format(), ImageFormat::Webp);
    }

    #[test]
    fn accept_header_fills_unknowns() {
        let support = negotiate_from_headers(None, Some("image/webp,image/*;q=0.8"), Some("curl/8.0"));
        assert_eq!(support.webp, Support::Supported);
        assert_eq!(support.avif, Support::Unsupported);
        assert_eq!(support.best_format(), ImageFormat::Webp);

        assert_eq!(negotiate_from_headers(None, None, None), FormatSupport::default());
    }

    #[test]
    fn malformed_client_report_is_ignored() {
        let support = FormatSupport::from_client_report("avif,webp:maybe,jxl:1");
        assert_eq!(support, FormatSupport::default());
    }
}
