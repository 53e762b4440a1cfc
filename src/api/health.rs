use std::time::Duration;

use rocket::serde::json::Json;
use rocket::State;

use crate::config::AppConfig;
use crate::health::{HealthMetrics, HealthRegistry};

#[get("/health")]
pub fn health(registry: &State<HealthRegistry>, config: &State<AppConfig>) -> Json<HealthMetrics> {
    Json(registry.metrics(Duration::from_secs(config.health_check_interval)))
}
