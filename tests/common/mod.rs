//! Shared fixtures: an in-process fake sensor and a pipeline wired to `MemoryStore`.
#![allow(dead_code)]

pub mod postgrest;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use footfall_pipeline::circuit::CircuitBreaker;
use footfall_pipeline::collector::{CollectorConfig, ParallelCollector};
use footfall_pipeline::config::{Credentials, SensorAuth};
use footfall_pipeline::models::{CircuitPhase, Sensor, SensorStatus, SensorType, Store};
use footfall_pipeline::retry::{RetryHandler, RetryPolicy};
use footfall_pipeline::sensor::SensorClient;
use footfall_pipeline::store::MemoryStore;
use footfall_pipeline::Pipeline;

// ---

pub const PEOPLE_HEADER: &str = "StartTime,EndTime,Line1 In,Line1 Out,Line1 Sum,Line2 In,Line2 Out,\
Line2 Sum,Line3 In,Line3 Out,Line3 Sum,Line4 In,Line4 Out,Line4 Sum,Total In,Total Out,Total Sum";

pub const REGIONAL_HEADER: &str = "StartTime,EndTime,Region1,Region2,Region3,Region4";

#[derive(Clone)]
struct SensorState {
    status: StatusCode,
    people: Arc<str>,
    regional: Arc<str>,
    hits: Arc<AtomicUsize>,
}

/// A running fake sensor.
pub struct FakeSensor {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl FakeSensor {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn dataloader(
    State(state): State<SensorState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // ---
    state.hits.fetch_add(1, Ordering::SeqCst);

    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "auth required".to_string());
    }
    if state.status != StatusCode::OK {
        return (state.status, "sensor busy".to_string());
    }

    match params.get("dw").map(String::as_str) {
        Some("vcalogcsv") => (StatusCode::OK, state.people.to_string()),
        Some("regionalcountlogcsv") => (StatusCode::OK, state.regional.to_string()),
        _ => (StatusCode::BAD_REQUEST, "unknown export".to_string()),
    }
}

/// Serve the given CSV exports on an ephemeral port, answering every request with `status`.
pub async fn spawn_sensor(status: StatusCode, people: &str, regional: &str) -> FakeSensor {
    // ---
    let hits = Arc::new(AtomicUsize::new(0));
    let state = SensorState {
        status,
        people: Arc::from(people),
        regional: Arc::from(regional),
        hits: hits.clone(),
    };
    let app = Router::new()
        .route("/dataloader.cgi", get(dataloader))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeSensor { addr, hits }
}

/// One people-counting row whose entrance lines add up to `entries`.
pub fn people_row(start: &str, end: &str, entries: i64) -> String {
    // ---
    let (l1, l2) = (entries / 2, entries / 4);
    let l3 = entries - l1 - l2;
    let (p_in, p_out) = (entries * 2, entries * 2);
    format!(
        "{start},{end},{l1},{o1},{s1},{l2},{o2},{s2},{l3},{o3},{s3},{p_in},{p_out},{ps},{ti},{to},{ts}",
        o1 = l1 - 1,
        s1 = 2 * l1 - 1,
        o2 = l2,
        s2 = 2 * l2,
        o3 = l3,
        s3 = 2 * l3,
        ps = p_in + p_out,
        ti = entries + p_in,
        to = entries - 1 + p_out,
        ts = 2 * entries - 1 + p_in + p_out,
    )
}

pub fn create_test_store(timezone: &str) -> Store {
    Store {
        id: Uuid::new_v4(),
        name: "Omnia Lisboa".to_string(),
        organization_id: Some(Uuid::new_v4()),
        timezone: Some(timezone.to_string()),
    }
}

pub fn create_test_sensor(name: &str, store: &Store, addr: SocketAddr) -> Sensor {
    // ---
    Sensor {
        sensor_id: Uuid::new_v4(),
        sensor_name: name.to_string(),
        sensor_type: SensorType::Omnia,
        ip_address: addr.ip().to_string(),
        port: addr.port(),
        store_id: store.id,
        store_name: Some(store.name.clone()),
        organization_id: store.organization_id,
        organization_name: None,
        timezone: store.tz(),
        is_active: true,
        status: SensorStatus::Online,
        consecutive_failures: 0,
        offline_since: None,
        recovery_attempts: 0,
        circuit_state: CircuitPhase::Closed,
        last_successful_check: None,
        last_failed_check: None,
    }
}

/// Mark a sensor as tripped since `since`.
pub fn trip(sensor: &mut Sensor, since: DateTime<Utc>) {
    sensor.status = SensorStatus::Offline;
    sensor.circuit_state = CircuitPhase::Open;
    sensor.consecutive_failures = 5;
    sensor.offline_since = Some(since);
    sensor.last_failed_check = Some(since);
}

pub fn test_auth() -> SensorAuth {
    SensorAuth {
        milesight: Credentials::parse("admin:milesight-test").unwrap(),
        omnia: Credentials::parse("admin:omnia-test").unwrap(),
    }
}

/// Pipeline over `store` with millisecond backoff and one retry.
pub fn create_test_pipeline(store: Arc<MemoryStore>) -> Pipeline {
    create_test_pipeline_with(store, CollectorConfig::default())
}

pub fn create_test_pipeline_with(store: Arc<MemoryStore>, collector: CollectorConfig) -> Pipeline {
    // ---
    let retry = RetryHandler::new(RetryPolicy {
        max_retries: 1,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        jitter_max: Duration::ZERO,
    });
    let client = SensorClient::new(test_auth(), Duration::from_secs(5), retry).unwrap();

    Pipeline::new(
        store,
        client,
        CircuitBreaker::default(),
        ParallelCollector::new(collector),
        3,
    )
}
