//! Database schema management for `footfall-pipeline`.
//!
//! Ensures the warehouse tables, identity constraints and indexes exist.
//! Applied by the `migrate` command (EMBP: single gateway call). The unique
//! constraints are what the store's `ON CONFLICT` upserts rely on, so running
//! this against an existing Supabase project also closes the duplicate-row
//! gap on the raw tables.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Statements applied in order inside one transaction.
const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS organizations (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stores (
        id              UUID PRIMARY KEY,
        name            TEXT NOT NULL,
        organization_id UUID REFERENCES organizations (id),
        timezone        TEXT
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensor_metadata (
        sensor_id             UUID PRIMARY KEY,
        sensor_name           TEXT        NOT NULL,
        sensor_type           TEXT        NOT NULL,
        sensor_ip             TEXT        NOT NULL,
        sensor_port           INTEGER     NOT NULL DEFAULT 80,
        store_id              UUID        NOT NULL REFERENCES stores (id),
        organization_id       UUID        REFERENCES organizations (id),
        timezone              TEXT,
        is_active             BOOLEAN     NOT NULL DEFAULT TRUE,
        status                TEXT        NOT NULL DEFAULT 'online',
        consecutive_failures  INTEGER     NOT NULL DEFAULT 0,
        offline_since         TIMESTAMPTZ,
        recovery_attempts     INTEGER     NOT NULL DEFAULT 0,
        circuit_state         TEXT        NOT NULL DEFAULT 'CLOSED',
        last_successful_check TIMESTAMPTZ,
        last_failed_check     TIMESTAMPTZ,
        updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS people_counting_raw (
        id          BIGSERIAL PRIMARY KEY,
        sensor_id   UUID        NOT NULL REFERENCES sensor_metadata (sensor_id),
        store_id    UUID        NOT NULL,
        "timestamp" TIMESTAMPTZ NOT NULL,
        end_time    TIMESTAMPTZ NOT NULL,
        line1_in    BIGINT      NOT NULL DEFAULT 0,
        line1_out   BIGINT      NOT NULL DEFAULT 0,
        line2_in    BIGINT      NOT NULL DEFAULT 0,
        line2_out   BIGINT      NOT NULL DEFAULT 0,
        line3_in    BIGINT      NOT NULL DEFAULT 0,
        line3_out   BIGINT      NOT NULL DEFAULT 0,
        line4_in    BIGINT      NOT NULL DEFAULT 0,
        line4_out   BIGINT      NOT NULL DEFAULT 0,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT people_counting_raw_identity UNIQUE (sensor_id, "timestamp")
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS regional_counting_raw (
        id                BIGSERIAL PRIMARY KEY,
        sensor_id         UUID        NOT NULL REFERENCES sensor_metadata (sensor_id),
        store_id          UUID        NOT NULL,
        "timestamp"       TIMESTAMPTZ NOT NULL,
        end_time          TIMESTAMPTZ NOT NULL,
        region1_count     BIGINT      NOT NULL DEFAULT 0,
        region2_count     BIGINT      NOT NULL DEFAULT 0,
        region3_count     BIGINT      NOT NULL DEFAULT 0,
        region4_count     BIGINT      NOT NULL DEFAULT 0,
        avg_dwell_seconds DOUBLE PRECISION,
        updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT regional_counting_raw_identity UNIQUE (sensor_id, "timestamp")
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hourly_analytics (
        store_id             UUID        NOT NULL,
        date                 DATE        NOT NULL,
        hour                 INTEGER     NOT NULL CHECK (hour BETWEEN 0 AND 23),
        start_time           TIMESTAMPTZ NOT NULL,
        end_time             TIMESTAMPTZ NOT NULL,
        store_entries        BIGINT      NOT NULL,
        store_exits          BIGINT      NOT NULL,
        passerby_count       BIGINT      NOT NULL,
        passerby_in          BIGINT      NOT NULL,
        passerby_out         BIGINT      NOT NULL,
        capture_rate         DOUBLE PRECISION,
        line1_in             BIGINT      NOT NULL,
        line1_out            BIGINT      NOT NULL,
        line2_in             BIGINT      NOT NULL,
        line2_out            BIGINT      NOT NULL,
        line3_in             BIGINT      NOT NULL,
        line3_out            BIGINT      NOT NULL,
        entry_line1_pct      DOUBLE PRECISION,
        entry_line2_pct      DOUBLE PRECISION,
        entry_line3_pct      DOUBLE PRECISION,
        exit_line1_pct       DOUBLE PRECISION,
        exit_line2_pct       DOUBLE PRECISION,
        exit_line3_pct       DOUBLE PRECISION,
        zone1_peak_occupancy BIGINT,
        zone2_peak_occupancy BIGINT,
        zone3_peak_occupancy BIGINT,
        zone4_peak_occupancy BIGINT,
        avg_dwell_seconds    DOUBLE PRECISION,
        is_business_hours    BOOLEAN     NOT NULL,
        sample_count         INTEGER     NOT NULL,
        updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (store_id, date, hour)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily_analytics (
        store_id               UUID    NOT NULL,
        date                   DATE    NOT NULL,
        total_entries          BIGINT  NOT NULL,
        total_exits            BIGINT  NOT NULL,
        total_passerby         BIGINT  NOT NULL,
        capture_rate           DOUBLE PRECISION,
        peak_hour              INTEGER,
        peak_hour_entries      BIGINT  NOT NULL,
        peak_exit_hour         INTEGER,
        peak_exit_count        BIGINT  NOT NULL,
        peak_traffic_hour      INTEGER,
        peak_traffic_count     BIGINT  NOT NULL,
        peak_passerby_hour     INTEGER,
        peak_passerby_count    BIGINT  NOT NULL,
        business_hours_entries BIGINT  NOT NULL,
        after_hours_entries    BIGINT  NOT NULL,
        entry_line1_pct        DOUBLE PRECISION,
        entry_line2_pct        DOUBLE PRECISION,
        entry_line3_pct        DOUBLE PRECISION,
        exit_line1_pct         DOUBLE PRECISION,
        exit_line2_pct         DOUBLE PRECISION,
        exit_line3_pct         DOUBLE PRECISION,
        zone1_peak_occupancy   BIGINT,
        zone1_peak_hour        INTEGER,
        zone2_peak_occupancy   BIGINT,
        zone2_peak_hour        INTEGER,
        zone3_peak_occupancy   BIGINT,
        zone3_peak_hour        INTEGER,
        zone4_peak_occupancy   BIGINT,
        zone4_peak_hour        INTEGER,
        avg_dwell_seconds      DOUBLE PRECISION,
        hours_with_data        INTEGER NOT NULL,
        updated_at             TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (store_id, date)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensor_health_log (
        id               BIGSERIAL PRIMARY KEY,
        sensor_id        UUID        NOT NULL,
        status           TEXT        NOT NULL,
        response_time_ms BIGINT,
        readings_count   BIGINT      NOT NULL DEFAULT 0,
        error_message    TEXT,
        checked_at       TIMESTAMPTZ NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id              UUID PRIMARY KEY,
        organization_id UUID,
        store_id        UUID        NOT NULL,
        sensor_id       UUID,
        alert_type      TEXT        NOT NULL,
        severity        TEXT        NOT NULL,
        title           TEXT        NOT NULL,
        message         TEXT        NOT NULL,
        metadata        JSONB       NOT NULL DEFAULT '{}'::jsonb,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_people_counting_raw_store_ts
        ON people_counting_raw (store_id, "timestamp");
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_regional_counting_raw_store_ts
        ON regional_counting_raw (store_id, "timestamp");
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_health_log_sensor
        ON sensor_health_log (sensor_id, checked_at);
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every run; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::info!("Schema is up to date ({} statements)", STATEMENTS.len());
    Ok(())
}
