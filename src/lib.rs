//! Foot-traffic sensor collection and analytics pipeline.
//!
//! Pulls people-counting and regional-occupancy exports from Milesight and
//! Omnia sensors, stores them in a Supabase/Postgres warehouse and rolls them
//! up into hourly and daily analytics. The binary in `main.rs` exposes the
//! jobs as CLI commands and as cron-triggered HTTP routes.
//!
//! Module boundaries follow the gateway style: each module exports a small
//! surface and the jobs only talk to the warehouse through [`store::SensorStore`].

pub mod aggregate;
pub mod circuit;
pub mod collector;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod routes;
pub mod schema;
pub mod sensor;
pub mod store;

pub use config::Config;
pub use pipeline::{CollectionSummary, Pipeline};
