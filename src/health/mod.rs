use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Unexpected status: {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealth {
    pub last_checked_at: Option<DateTime<Utc>>,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
}

/// Health snapshot plus bookkeeping for the operational endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    #[serde(flatten)]
    pub health: BackendHealth,
    pub failure_threshold: u32,
    pub total_checks: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub stale: bool,
}

#[derive(Debug)]
struct HealthState {
    health: BackendHealth,
    total_checks: u64,
    total_failures: u64,
    last_error: Option<String>,
}

/// Shared primary backend health. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
    failure_threshold: u32,
}

impl HealthRegistry {
    /// Starts out healthy: the primary is trusted until probes say otherwise.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(HealthState {
                health: BackendHealth {
                    last_checked_at: None,
                    is_healthy: true,
                    consecutive_failures: 0,
                },
                total_checks: 0,
                total_failures: 0,
                last_error: None,
            })),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.read().health.is_healthy
    }

    pub fn snapshot(&self) -> BackendHealth {
        self.state.read().health.clone()
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn record_success(&self) {
        let mut state = self.state.write();
        state.total_checks += 1;
        state.health.last_checked_at = Some(Utc::now());
        state.health.consecutive_failures = 0;
        state.last_error = None;
        if !state.health.is_healthy {
            state.health.is_healthy = true;
            info!("Primary backend recovered, switching back from secondary");
        }
    }

    pub fn record_failure(&self, reason: &str) {
        let mut state = self.state.write();
        state.total_checks += 1;
        state.total_failures += 1;
        state.health.last_checked_at = Some(Utc::now());
        state.health.consecutive_failures = state.health.consecutive_failures.saturating_add(1);
        state.last_error = Some(reason.to_string());

        if state.health.is_healthy && state.health.consecutive_failures >= self.failure_threshold {
            state.health.is_healthy = false;
            warn!(
                "Primary backend marked unhealthy after {} consecutive failures: {}",
                state.health.consecutive_failures, reason
            );
        }
    }

    /// `check_interval` decides freshness: a snapshot older than two
    /// intervals, or one never checked, is stale.
    pub fn metrics(&self, check_interval: Duration) -> HealthMetrics {
        let state = self.state.read();
        let stale = match state.health.last_checked_at {
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                let limit = check_interval.checked_mul(2).unwrap_or(Duration::MAX);
                age.to_std().map_or(false, |age| age > limit)
            }
            None => true,
        };

        HealthMetrics {
            health: state.health.clone(),
            failure_threshold: self.failure_threshold,
            total_checks: state.total_checks,
            total_failures: state.total_failures,
            last_error: state.last_error.clone(),
            stale,
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), ProbeError>;
}

/// GETs a known asset on the primary CDN; any 2xx counts as healthy.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self) -> Result<(), ProbeError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    /// Level for routine probe results; transitions are always logged.
    pub log_level: log::Level,
}

/// Runs one probe and records its outcome. Probe errors never escape.
pub async fn run_check(registry: &HealthRegistry, probe: &dyn HealthProbe, log_level: log::Level) {
    match probe.probe().await {
        Ok(()) => {
            registry.record_success();
            log::log!(log_level, "Primary backend probe succeeded");
        }
        Err(err) => {
            let reason = err.to_string();
            registry.record_failure(&reason);
            log::log!(log_level, "Primary backend probe failed: {}", reason);
        }
    }
}

/// Probes the primary backend on a fixed timer until the handle is aborted.
pub fn start_health_monitor(
    config: HealthMonitorConfig,
    registry: HealthRegistry,
    probe: Arc<dyn HealthProbe>,
) -> JoinHandle<()> {
    info!(
        "Health monitor started (interval: {}s, failure threshold: {})",
        config.check_interval.as_secs(),
        registry.failure_threshold()
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_check(&registry, probe.as_ref(), config.log_level).await;
        }
    })
}
