//! The HTTP surface of `serve`: health check and bearer-guarded cron routes.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use footfall_pipeline::routes::{self, AppState};
use footfall_pipeline::store::{MemoryStore, SensorStore};

use common::*;

// ---

const SECRET: &str = "cron-test-secret";

async fn spawn_app() -> SocketAddr {
    // ---
    let memory = Arc::new(MemoryStore::new());
    memory.add_store(create_test_store("Europe/Lisbon"));
    let store: Arc<dyn SensorStore> = memory.clone();

    let app = routes::router(AppState {
        store,
        pipeline: Arc::new(create_test_pipeline(memory)),
        cron_secret: Arc::from(SECRET),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn health_is_public() -> Result<()> {
    // ---
    let addr = spawn_app().await;
    let body: Value = Client::new()
        .get(format!("http://{addr}/health"))
        .send()
        .await?
        .json()
        .await?;

    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "footfall-pipeline");
    Ok(())
}

#[tokio::test]
async fn cron_routes_require_the_secret() -> Result<()> {
    // ---
    let addr = spawn_app().await;
    let client = Client::new();

    let missing = client.post(format!("http://{addr}/cron/collect")).send().await?;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = client
        .post(format!("http://{addr}/cron/aggregate/hourly"))
        .bearer_auth("not-the-secret")
        .send()
        .await?;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    // Same length, last byte differs.
    let near = client
        .post(format!("http://{addr}/cron/aggregate/daily"))
        .bearer_auth("cron-test-secreT")
        .send()
        .await?;
    assert_eq!(near.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn collect_returns_the_run_summary() -> Result<()> {
    // ---
    let addr = spawn_app().await;
    let resp = Client::new()
        .post(format!("http://{addr}/cron/collect"))
        .bearer_auth(SECRET)
        .send()
        .await?;

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["sensors"], 0);
    assert_eq!(body["failed"], 0);
    Ok(())
}

#[tokio::test]
async fn daily_aggregation_takes_a_date() -> Result<()> {
    // ---
    let addr = spawn_app().await;
    let client = Client::new();

    let resp = client
        .post(format!("http://{addr}/cron/aggregate/daily?date=2025-07-22"))
        .bearer_auth(SECRET)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["level"], "daily");
    assert_eq!(body["date"], "2025-07-22");
    assert_eq!(body["stores"], 1);
    assert_eq!(body["skipped"], 1);

    let bad = client
        .post(format!("http://{addr}/cron/aggregate/daily?date=22-07-2025"))
        .bearer_auth(SECRET)
        .send()
        .await?;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    // Without a date every store runs on its own local default.
    let body: Value = client
        .post(format!("http://{addr}/cron/aggregate/hourly"))
        .bearer_auth(SECRET)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["level"], "hourly");
    assert!(body["date"].is_null());
    Ok(())
}
