//! HTTP gateway for the `serve` command.
//!
//! Sibling modules each export a subrouter; this module merges them and
//! attaches the shared [`AppState`] so `main.rs` only calls [`router`].

use std::sync::Arc;

use axum::Router;

use crate::pipeline::Pipeline;
use crate::store::SensorStore;

mod cron;
mod health;

// ---

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    // ---
    pub store: Arc<dyn SensorStore>,
    pub pipeline: Arc<Pipeline>,
    /// Bearer token the cron routes require.
    pub cron_secret: Arc<str>,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(cron::router(state.clone()))
        .merge(health::router())
        .with_state(state)
}
