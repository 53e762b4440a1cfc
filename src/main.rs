#[macro_use]
extern crate rocket;

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use env_logger::Env;
use imgrelay::cache::ImageCache;
use imgrelay::config::AppConfig;
use imgrelay::health::{start_health_monitor, HealthMonitorConfig, HealthRegistry, HttpProbe};
use imgrelay::images::{ImageOptimizer, TranscodeWorker};
use imgrelay::negotiate::{
    FileCapabilityStore, FormatNegotiator, ImageDecodeProbe, MemoryCapabilityStore,
};
use log::{error, info, warn};
use rocket::{
    figment::{
        providers::{Format, Toml},
        Figment, Profile,
    },
    Config,
};

// Environment variables overriding App.toml keys
const ENV_OVERRIDES: [(&str, &str); 5] = [
    ("IMAGEKIT_URL_ENDPOINT", "primary_url_endpoint"),
    ("TEBI_ENDPOINT", "secondary_endpoint"),
    ("TEBI_BUCKET", "secondary_bucket"),
    ("OPTIMIZER_URL", "optimizer_url"),
    ("LOG_LEVEL", "log_filter"),
];

#[launch]
async fn rocket() -> _ {
    dotenv().ok();

    // Load config
    let mut figment = Figment::from(Config::default())
        .merge(Toml::file("App.toml").nested());

    for (var, key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(var) {
            figment = figment.merge((key, value));
        }
    }

    if let Ok(interval) = env::var("HEALTH_CHECK_INTERVAL") {
        match interval.parse::<u64>() {
            Ok(secs) => figment = figment.merge(("health_check_interval", secs)),
            Err(_) => eprintln!("Ignoring invalid HEALTH_CHECK_INTERVAL: {}", interval),
        }
    }

    figment = figment.select(Profile::from_env_or("APP_PROFILE", "default"));

    let config = match figment.extract::<AppConfig>() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logger
    env_logger::init_from_env(Env::default().default_filter_or(config.log_filter.as_str()));
    info!("Configuration loaded successfully");

    // Optimization cache
    let cache = match ImageCache::new(&config.cache_dir, config.cache_max_bytes).await {
        Ok(cache) => cache,
        Err(e) => {
            error!("Failed to open optimization cache at {}: {}", config.cache_dir, e);
            std::process::exit(1);
        }
    };
    info!(
        "Optimization cache at {} (cap: {} bytes)",
        config.cache_dir, config.cache_max_bytes
    );

    // Which source formats this build can decode
    let store_path = Path::new(&config.cache_dir).join("capabilities.json");
    let avif_decoding = match FileCapabilityStore::open(store_path) {
        Ok(store) => FormatNegotiator::new(store, ImageDecodeProbe).detect_avif_support(),
        Err(e) => {
            warn!("Capability store unavailable ({}), probing without persistence", e);
            FormatNegotiator::new(MemoryCapabilityStore::new(), ImageDecodeProbe)
                .detect_avif_support()
        }
    };

    let worker = TranscodeWorker::spawn(
        config.worker_queue_size,
        Duration::from_millis(config.worker_timeout_ms),
    );

    let optimizer = match ImageOptimizer::new(config.timeout, cache, config.source_origins()) {
        Ok(optimizer) => optimizer.with_worker(worker).with_avif_decoding(avif_decoding),
        Err(e) => {
            error!("Failed to build image optimizer: {}", e);
            std::process::exit(1);
        }
    };
    info!("Image optimizer initialized");

    // Primary backend health
    let health = HealthRegistry::new(config.failure_threshold);
    match HttpProbe::new(config.probe_url(), Duration::from_secs(config.timeout)) {
        Ok(probe) => {
            let monitor_config = HealthMonitorConfig {
                check_interval: Duration::from_secs(config.health_check_interval.max(1)),
                log_level: log::Level::from_str(&config.log_filter).unwrap_or(log::Level::Debug),
            };
            start_health_monitor(monitor_config, health.clone(), Arc::new(probe));
        }
        Err(e) => {
            warn!("Health probe unavailable ({}), primary stays optimistically healthy", e);
        }
    }

    info!(
        "Starting image service on {}:{}",
        config.address, config.port
    );

    imgrelay::build_rocket(figment, config, health, optimizer)
}
