#[macro_use]
extern crate rocket;

pub mod api;
pub mod cache;
pub mod config;
pub mod cors;
pub mod health;
pub mod images;
pub mod negotiate;

use rocket::figment::Figment;
use rocket::{Build, Rocket};

use config::AppConfig;
use cors::CORS;
use health::HealthRegistry;
use images::{FailoverResolver, ImageOptimizer, UrlBuilder};

/// Assembles the server from already constructed services.
pub fn build_rocket(
    figment: Figment,
    config: AppConfig,
    health: HealthRegistry,
    optimizer: ImageOptimizer,
) -> Rocket<Build> {
    let resolver = FailoverResolver::new(
        UrlBuilder::from_config(&config),
        health.clone(),
        config.fallback_strategy,
    );

    rocket::custom(figment)
        .attach(CORS)
        .manage(resolver)
        .manage(health)
        .manage(optimizer)
        .manage(config)
        .mount(
            "/",
            routes![
                api::images::optimize_image,
                api::images::resolve_image,
                api::images::responsive_image,
                api::health::health,
            ],
        )
}
