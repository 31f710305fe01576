//! In-process stand-in for Supabase's PostgREST: `/rest/v1/{table}` over JSON rows.
//!
//! Supports the subset `RestStore` speaks: `eq`/`gte`/`lt`/`in` filters,
//! `limit`/`offset` paging, `on_conflict` upserts that honour
//! `Prefer: resolution=merge-duplicates`, inserts and PATCH.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde_json::{json, Value};

// ---

pub const SERVICE_KEY: &str = "service-role-test-key";

const RESERVED: &[&str] = &["select", "limit", "offset", "order", "on_conflict"];

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub table: String,
    pub params: Vec<(String, String)>,
    pub prefer: Option<String>,
}

impl Recorded {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Value>>,
    requests: Vec<Recorded>,
}

#[derive(Clone, Default)]
pub struct FakePostgrest {
    pub base_url: String,
    inner: Arc<Mutex<Inner>>,
}

impl FakePostgrest {
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        self.inner
            .lock()
            .unwrap()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn requests_to(&self, method: Method, table: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.table == table)
            .collect()
    }
}

fn rendered(row: &Value, column: &str) -> String {
    match row.get(column) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "null".to_string(),
        Some(other) => other.to_string(),
    }
}

fn matches(row: &Value, column: &str, filter: &str) -> bool {
    // ---
    let Some((op, expected)) = filter.split_once('.') else {
        return true;
    };
    let actual = rendered(row, column);
    match op {
        "eq" => actual == expected,
        "gte" => actual.as_str() >= expected,
        "lt" => actual.as_str() < expected,
        "in" => expected
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .any(|v| v == actual),
        _ => true,
    }
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn select(rows: &[Value], params: &[(String, String)]) -> Vec<Value> {
    // ---
    let offset = param(params, "offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit = param(params, "limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(usize::MAX);

    rows.iter()
        .filter(|row| {
            params
                .iter()
                .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
                .all(|(column, filter)| matches(row, column, filter))
        })
        .skip(offset)
        .take(limit)
        .cloned()
        .collect()
}

fn upsert(
    table: &mut Vec<Value>,
    on_conflict: &str,
    merge: bool,
    incoming: Vec<Value>,
) -> Result<(), Response> {
    // ---
    let columns: Vec<&str> = on_conflict.split(',').collect();
    let key_of = |row: &Value| columns.iter().map(|c| rendered(row, c)).collect::<Vec<_>>();

    let mut batch_keys = HashSet::new();
    if !incoming.iter().all(|row| batch_keys.insert(key_of(row))) {
        let body = json!({
            "code": "21000",
            "message": "ON CONFLICT DO UPDATE command cannot affect row a second time",
        });
        return Err((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response());
    }

    for row in incoming {
        let key = key_of(&row);
        match table.iter_mut().find(|existing| key_of(&**existing) == key) {
            Some(_) if !merge => {
                let body = json!({ "code": "23505", "message": "duplicate key value" });
                return Err((StatusCode::CONFLICT, Json(body)).into_response());
            }
            Some(existing) => *existing = row,
            None => table.push(row),
        }
    }
    Ok(())
}

async fn handle(
    State(server): State<FakePostgrest>,
    method: Method,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // ---
    if headers.get("apikey").and_then(|v| v.to_str().ok()) != Some(SERVICE_KEY) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "bad apikey" }))).into_response();
    }
    let prefer = headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut inner = server.inner.lock().unwrap();
    inner.requests.push(Recorded {
        method: method.clone(),
        table: table.clone(),
        params: params.clone(),
        prefer: prefer.clone(),
    });
    let rows = inner.tables.entry(table).or_default();

    match method {
        Method::GET => Json(select(rows, &params)).into_response(),
        Method::POST => {
            let incoming = match serde_json::from_slice::<Value>(&body) {
                Ok(Value::Array(items)) => items,
                Ok(item) => vec![item],
                Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
            };
            match param(&params, "on_conflict") {
                Some(on_conflict) => {
                    let merge = prefer
                        .as_deref()
                        .is_some_and(|p| p.contains("resolution=merge-duplicates"));
                    if let Err(resp) = upsert(rows, on_conflict, merge, incoming) {
                        return resp;
                    }
                }
                None => rows.extend(incoming),
            }
            StatusCode::CREATED.into_response()
        }
        Method::PATCH => StatusCode::NO_CONTENT.into_response(),
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Serve an empty fake PostgREST on an ephemeral port.
pub async fn spawn_postgrest() -> FakePostgrest {
    // ---
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let server = FakePostgrest {
        base_url: format!("http://{addr}"),
        ..FakePostgrest::default()
    };

    let app = Router::new()
        .route("/rest/v1/{table}", any(handle))
        .with_state(server.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    server
}
