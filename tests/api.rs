use imgrelay::cache::ImageCache;
use imgrelay::config::AppConfig;
use imgrelay::health::HealthRegistry;
use imgrelay::images::tools::MAX_DIMENSION;
use imgrelay::images::{FallbackStrategy, ImageFormat, ImageOptimizer, TransformSpec};
use rocket::figment::Figment;
use rocket::http::{ContentType, Cookie, Header, Status};
use rocket::local::asynchronous::Client;
use serde_json::Value;
use tempfile::TempDir;

fn test_config(cache_dir: &TempDir) -> AppConfig {
    AppConfig {
        port: 0,
        address: "127.0.0.1".to_string(),
        timeout: 2,
        primary_url_endpoint: "https://ik.imagekit.io/mag".to_string(),
        primary_probe_path: "/health-check.png".to_string(),
        secondary_endpoint: "https://s3.tebi.io".to_string(),
        secondary_bucket: "mag-images".to_string(),
        optimizer_url: "https://mag.example.com/image".to_string(),
        allowed_source_origins: None,
        health_check_interval: 60,
        failure_threshold: 2,
        fallback_strategy: FallbackStrategy::Original,
        cache_dir: cache_dir.path().to_string_lossy().into_owned(),
        cache_max_bytes: 0,
        max_dimension: MAX_DIMENSION,
        worker_queue_size: 4,
        worker_timeout_ms: 1000,
        log_filter: "off".to_string(),
    }
}

async fn client_with(health: HealthRegistry) -> (Client, TempDir) {
    client_in(TempDir::new().unwrap(), health).await
}

async fn client_in(temp_dir: TempDir, health: HealthRegistry) -> (Client, TempDir) {
    let config = test_config(&temp_dir);
    let cache = ImageCache::new(&config.cache_dir, config.cache_max_bytes).await.unwrap();
    let optimizer = ImageOptimizer::new(config.timeout, cache, config.source_origins()).unwrap();

    let figment = Figment::from(rocket::Config::debug_default());
    let rocket = imgrelay::build_rocket(figment, config, health, optimizer);
    let client = Client::tracked(rocket).await.unwrap();
    (client, temp_dir)
}

async fn json_body(response: rocket::local::asynchronous::LocalResponse<'_>) -> Value {
    let body = response.into_string().await.unwrap();
    serde_json::from_str(&body).unwrap()
}

#[tokio::test]
async fn health_reports_never_checked_primary_as_stale() {
    let (client, _dir) = client_with(HealthRegistry::new(2)).await;

    let response = client.get("/health").dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(response.content_type(), Some(ContentType::JSON));

    let body = json_body(response).await;
    assert_eq!(body["isHealthy"], true);
    assert_eq!(body["consecutiveFailures"], 0);
    assert_eq!(body["failureThreshold"], 2);
    assert_eq!(body["lastCheckedAt"], Value::Null);
    assert_eq!(body["stale"], true);
}

#[tokio::test]
async fn health_reflects_recorded_failures() {
    let health = HealthRegistry::new(2);
    health.record_failure("timeout");
    health.record_failure("timeout");
    let (client, _dir) = client_with(health).await;

    let body = json_body(client.get("/health").dispatch().await).await;
    assert_eq!(body["isHealthy"], false);
    assert_eq!(body["consecutiveFailures"], 2);
    assert_eq!(body["totalFailures"], 2);
    assert_eq!(body["lastError"], "timeout");
    assert_eq!(body["stale"], false);
}

#[tokio::test]
async fn responsive_uses_primary_and_negotiated_format() {
    let (client, _dir) = client_with(HealthRegistry::new(2)).await;

    let response = client
        .get("/image/responsive?src=/images/hero.jpg&widths=800,400")
        .header(Header::new("Accept", "image/avif,image/webp,*/*"))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let body = json_body(response).await;
    let candidates = body["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0]["width"], 400);
    assert_eq!(candidates[1]["width"], 800);
    assert!(candidates[0]["url"]
        .as_str()
        .unwrap()
        .starts_with("https://ik.imagekit.io/mag/tr:w-400,f-avif"));
    assert_eq!(body["sizes"], "100vw");
    assert_eq!(body["width"], 800);
}

#[tokio::test]
async fn responsive_switches_to_secondary_when_primary_is_down() {
    let health = HealthRegistry::new(1);
    health.record_failure("connection refused");
    let (client, _dir) = client_with(health).await;

    let response = client
        .get("/image/responsive?src=/images/hero.jpg&widths=400&fm=webp")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let body = json_body(response).await;
    let url = body["candidates"][0]["url"].as_str().unwrap();
    assert!(url.starts_with("https://mag.example.com/image?src="));
    assert!(url.contains("fm=webp"));
}

#[tokio::test]
async fn resolve_honors_client_format_cookie() {
    let (client, _dir) = client_with(HealthRegistry::new(2)).await;

    let response = client
        .get("/image/resolve?src=/images/hero.jpg&w=640&fm=auto")
        .cookie(Cookie::new("image_formats", "avif:0,webp:1"))
        .header(Header::new("Accept", "image/avif,image/webp"))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let body = json_body(response).await;
    assert_eq!(body["backend"], "primary");
    assert_eq!(body["url"], "https://ik.imagekit.io/mag/tr:w-640,f-webp/images/hero.jpg");
}

#[tokio::test]
async fn resolve_derives_height_from_aspect_ratio() {
    let (client, _dir) = client_with(HealthRegistry::new(2)).await;

    let response = client
        .get("/image/resolve?src=/images/hero.jpg&w=1600&ar=16:9&fm=jpg")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let body = json_body(response).await;
    assert_eq!(
        body["url"],
        "https://ik.imagekit.io/mag/tr:w-1600,h-900,f-jpg,c-maintain_ratio/images/hero.jpg"
    );
}

#[tokio::test]
async fn invalid_parameters_are_rejected() {
    let (client, _dir) = client_with(HealthRegistry::new(2)).await;

    let response = client.get("/image/resolve?src=/a.jpg&fm=tiff").dispatch().await;
    assert_eq!(response.status(), Status::BadRequest);
    let body = json_body(response).await;
    assert_eq!(body["error"], "Invalid parameter");

    let response = client.get("/image?src=https://s3.tebi.io/mag-images/a.jpg&q=0").dispatch().await;
    assert_eq!(response.status(), Status::BadRequest);

    let response = client
        .get("/image/responsive?src=/a.jpg&widths=400,wide")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);
}

#[tokio::test]
async fn out_of_range_transforms_are_rejected() {
    let (client, _dir) = client_with(HealthRegistry::new(2)).await;

    for uri in [
        "/image?src=https://s3.tebi.io/mag-images/a.jpg&w=50000",
        "/image?src=https://s3.tebi.io/mag-images/a.jpg&w=1&h=8193",
        "/image?src=https://s3.tebi.io/mag-images/a.jpg&w=100&bl=0",
        "/image?src=https://s3.tebi.io/mag-images/a.jpg&w=100&bl=101",
        "/image/resolve?src=/a.jpg&w=9000",
        "/image/responsive?src=/a.jpg&widths=400&q=0",
        "/image/responsive?src=/a.jpg&widths=400&q=101",
        "/image/responsive?src=/a.jpg&widths=400,20000",
    ] {
        let response = client.get(uri).dispatch().await;
        assert_eq!(response.status(), Status::BadRequest, "{}", uri);
    }
}

#[tokio::test]
async fn cached_image_carries_validators_and_vary() {
    let temp_dir = TempDir::new().unwrap();
    let src = "https://s3.tebi.io/mag-images/hero.jpg";
    // No Accept or User-Agent header, so the negotiated format is JPEG
    let spec = TransformSpec::default().with_width(400).with_format(ImageFormat::Jpg);
    let seed = ImageCache::new(temp_dir.path(), 0).await.unwrap();
    seed.write_cache(&spec.fingerprint(src), b"cached jpeg", ImageFormat::Jpg)
        .await
        .unwrap();

    let (client, _dir) = client_in(temp_dir, HealthRegistry::new(2)).await;
    let uri = "/image?src=https://s3.tebi.io/mag-images/hero.jpg&w=400";

    let response = client.get(uri).dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(response.content_type(), Some(ContentType::JPEG));
    assert_eq!(response.headers().get_one("X-Cache"), Some("HIT"));
    assert_eq!(response.headers().get_one("Vary"), Some("Accept, User-Agent, Cookie"));
    assert_eq!(
        response.headers().get_one("Cache-Control"),
        Some("public, max-age=31536000, immutable")
    );
    let etag = response.headers().get_one("ETag").unwrap().to_string();
    assert_eq!(etag, format!("\"{:x}\"", md5::compute(b"cached jpeg")));
    assert_eq!(response.into_bytes().await.unwrap(), b"cached jpeg");

    let response = client
        .get(uri)
        .header(Header::new("If-None-Match", etag.clone()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::NotModified);
    assert_eq!(response.headers().get_one("ETag"), Some(etag.as_str()));
    assert_eq!(response.headers().get_one("Vary"), Some("Accept, User-Agent, Cookie"));
    assert!(response.into_bytes().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn optimizer_refuses_foreign_sources() {
    let (client, _dir) = client_with(HealthRegistry::new(2)).await;

    let response = client
        .get("/image?src=https://evil.example.com/a.jpg&w=100")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Forbidden);
    let body = json_body(response).await;
    assert_eq!(body["error"], "Forbidden source");
}

#[tokio::test]
async fn responses_carry_cors_headers() {
    let (client, _dir) = client_with(HealthRegistry::new(2)).await;

    let response = client.get("/health").dispatch().await;
    assert_eq!(response.headers().get_one("Access-Control-Allow-Origin"), Some("*"));
}
