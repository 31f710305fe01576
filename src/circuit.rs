//! Per-sensor circuit breaker persisted in `sensor_metadata`.
//!
//! Nothing is held in process memory: the state is re-derived from the
//! sensor's flat columns on every call, so separate scheduled runs see the
//! same breaker. Transitions are computed as pure [`Transition`] values and
//! then written back through the [`SensorStore`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{CircuitPhase, CircuitUpdate, NewAlert, Sensor, SensorStatus, Severity};
use crate::store::SensorStore;

// ---

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    // ---
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a trial.
    pub recovery_timeout: Duration,
    /// Total attempts a half-open trial may make.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(3600),
            half_open_max_attempts: 1,
        }
    }
}

/// Breaker state of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    // ---
    Closed { failures: u32 },
    Open { since: DateTime<Utc>, recovery_attempts: u32 },
    HalfOpen { recovery_attempts: u32 },
}

impl CircuitState {
    pub fn phase(&self) -> CircuitPhase {
        match self {
            CircuitState::Closed { .. } => CircuitPhase::Closed,
            CircuitState::Open { .. } => CircuitPhase::Open,
            CircuitState::HalfOpen { .. } => CircuitPhase::HalfOpen,
        }
    }
}

/// Outcome of [`CircuitBreaker::should_process`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    // ---
    pub should_process: bool,
    pub state: CircuitPhase,
    pub reason: String,
    /// Attempt cap for a half-open trial; `None` means the normal retry policy.
    pub max_attempts: Option<u32>,
}

/// A computed state change, ready to persist.
#[derive(Debug, Clone)]
pub struct Transition {
    // ---
    pub from: CircuitPhase,
    pub update: CircuitUpdate,
    pub alert: Option<NewAlert>,
}

impl Transition {
    pub fn to(&self) -> CircuitPhase {
        self.update.circuit_state
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    config: CircuitConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Derive the breaker state from the sensor's persisted columns.
    pub fn state_of(&self, sensor: &Sensor) -> CircuitState {
        // ---
        if sensor.circuit_state == CircuitPhase::HalfOpen {
            return CircuitState::HalfOpen {
                recovery_attempts: sensor.recovery_attempts,
            };
        }

        let tripped = sensor.consecutive_failures >= self.config.failure_threshold
            || sensor.status == SensorStatus::Offline
            || sensor.circuit_state == CircuitPhase::Open;

        if tripped {
            let since = sensor
                .offline_since
                .or(sensor.last_failed_check)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            CircuitState::Open {
                since,
                recovery_attempts: sensor.recovery_attempts,
            }
        } else {
            CircuitState::Closed {
                failures: sensor.consecutive_failures,
            }
        }
    }

    /// Decide whether this run should call the sensor at all.
    pub fn should_process(&self, sensor: &Sensor, now: DateTime<Utc>) -> Decision {
        // ---
        match self.state_of(sensor) {
            CircuitState::Closed { failures } => Decision {
                should_process: true,
                state: CircuitPhase::Closed,
                reason: format!("circuit closed ({failures} recent failures)"),
                max_attempts: None,
            },
            CircuitState::HalfOpen { recovery_attempts } => Decision {
                should_process: true,
                state: CircuitPhase::HalfOpen,
                reason: format!("trial pending (recovery attempt {})", recovery_attempts + 1),
                max_attempts: Some(self.config.half_open_max_attempts),
            },
            CircuitState::Open {
                since,
                recovery_attempts,
            } => {
                let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    Decision {
                        should_process: true,
                        state: CircuitPhase::HalfOpen,
                        reason: format!(
                            "recovery timeout elapsed, probing (recovery attempt {})",
                            recovery_attempts + 1
                        ),
                        max_attempts: Some(self.config.half_open_max_attempts),
                    }
                } else {
                    let remaining = self.config.recovery_timeout - elapsed;
                    Decision {
                        should_process: false,
                        state: CircuitPhase::Open,
                        reason: format!(
                            "circuit open since {}, next trial in {}s",
                            since.to_rfc3339(),
                            remaining.as_secs()
                        ),
                        max_attempts: None,
                    }
                }
            }
        }
    }

    /// Columns to write before a half-open trial runs.
    pub fn trial_update(&self, sensor: &Sensor) -> CircuitUpdate {
        // ---
        CircuitUpdate {
            status: SensorStatus::Offline,
            consecutive_failures: sensor.consecutive_failures,
            offline_since: sensor.offline_since,
            recovery_attempts: sensor.recovery_attempts,
            circuit_state: CircuitPhase::HalfOpen,
            last_successful_check: None,
            last_failed_check: None,
        }
    }

    /// Transition after a successful call: always back to CLOSED/online.
    pub fn on_success(&self, sensor: &Sensor, now: DateTime<Utc>) -> Transition {
        // ---
        let from = self.state_of(sensor).phase();
        let alert = match from {
            CircuitPhase::Closed => None,
            CircuitPhase::Open | CircuitPhase::HalfOpen => Some(self.alert(
                sensor,
                "sensor_recovered",
                Severity::Info,
                format!("Sensor {} is back online", sensor.sensor_name),
                format!(
                    "{} responded after {} recovery attempt(s)",
                    sensor.sensor_name,
                    sensor.recovery_attempts + 1
                ),
                now,
            )),
        };

        Transition {
            from,
            update: CircuitUpdate {
                status: SensorStatus::Online,
                consecutive_failures: 0,
                offline_since: None,
                recovery_attempts: 0,
                circuit_state: CircuitPhase::Closed,
                last_successful_check: Some(now),
                last_failed_check: None,
            },
            alert,
        }
    }

    /// Transition after a failed call.
    pub fn on_failure(&self, sensor: &Sensor, error: &str, now: DateTime<Utc>) -> Transition {
        // ---
        let failures = sensor.consecutive_failures.saturating_add(1);
        let state = self.state_of(sensor);
        let from = state.phase();

        match state {
            CircuitState::HalfOpen { recovery_attempts }
            | CircuitState::Open {
                recovery_attempts, ..
            } => Transition {
                from,
                update: CircuitUpdate {
                    status: SensorStatus::Offline,
                    consecutive_failures: failures,
                    offline_since: Some(now),
                    recovery_attempts: recovery_attempts + 1,
                    circuit_state: CircuitPhase::Open,
                    last_successful_check: None,
                    last_failed_check: Some(now),
                },
                alert: Some(self.alert(
                    sensor,
                    "circuit_reopened",
                    Severity::Warning,
                    format!("Sensor {} still offline", sensor.sensor_name),
                    format!(
                        "Recovery trial {} failed: {}",
                        recovery_attempts + 1,
                        error
                    ),
                    now,
                )),
            },
            CircuitState::Closed { .. } if failures >= self.config.failure_threshold => {
                Transition {
                    from,
                    update: CircuitUpdate {
                        status: SensorStatus::Offline,
                        consecutive_failures: failures,
                        offline_since: Some(now),
                        recovery_attempts: 0,
                        circuit_state: CircuitPhase::Open,
                        last_successful_check: None,
                        last_failed_check: Some(now),
                    },
                    alert: Some(self.alert(
                        sensor,
                        "sensor_offline",
                        Severity::Critical,
                        format!("Sensor {} offline", sensor.sensor_name),
                        format!(
                            "{} failed {} consecutive checks: {}",
                            sensor.sensor_name, failures, error
                        ),
                        now,
                    )),
                }
            }
            CircuitState::Closed { .. } => Transition {
                from,
                update: CircuitUpdate {
                    status: SensorStatus::Warning,
                    consecutive_failures: failures,
                    offline_since: None,
                    recovery_attempts: 0,
                    circuit_state: CircuitPhase::Closed,
                    last_successful_check: None,
                    last_failed_check: Some(now),
                },
                alert: None,
            },
        }
    }

    /// Persist the HALF_OPEN marker before probing.
    pub async fn mark_trial(&self, store: &dyn SensorStore, sensor: &mut Sensor) -> Result<()> {
        // ---
        let update = self.trial_update(sensor);
        store.update_sensor_health(sensor.sensor_id, &update).await?;
        sensor.apply(&update);
        Ok(())
    }

    /// Compute and persist the success transition.
    pub async fn record_success(
        &self,
        store: &dyn SensorStore,
        sensor: &Sensor,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        // ---
        let transition = self.on_success(sensor, now);
        self.persist(store, sensor, &transition).await?;
        if transition.from != CircuitPhase::Closed {
            tracing::info!(sensor = %sensor.sensor_name, from = ?transition.from, "Circuit closed");
        }
        Ok(transition)
    }

    /// Compute and persist the failure transition.
    pub async fn record_failure(
        &self,
        store: &dyn SensorStore,
        sensor: &Sensor,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        // ---
        let transition = self.on_failure(sensor, error, now);
        self.persist(store, sensor, &transition).await?;
        if transition.to() == CircuitPhase::Open {
            tracing::warn!(
                sensor = %sensor.sensor_name,
                failures = transition.update.consecutive_failures,
                recovery_attempts = transition.update.recovery_attempts,
                "Circuit opened"
            );
        }
        Ok(transition)
    }

    async fn persist(
        &self,
        store: &dyn SensorStore,
        sensor: &Sensor,
        transition: &Transition,
    ) -> Result<()> {
        // ---
        store
            .update_sensor_health(sensor.sensor_id, &transition.update)
            .await?;

        // Alerts are fire-and-forget.
        if let Some(alert) = &transition.alert {
            if let Err(e) = store.create_alert(alert).await {
                tracing::error!(sensor = %sensor.sensor_name, error = %e, "Failed to create alert");
            }
        }
        Ok(())
    }

    fn alert(
        &self,
        sensor: &Sensor,
        alert_type: &str,
        severity: Severity,
        title: String,
        message: String,
        now: DateTime<Utc>,
    ) -> NewAlert {
        // ---
        NewAlert {
            id: Uuid::new_v4(),
            organization_id: sensor.organization_id,
            store_id: sensor.store_id,
            sensor_id: sensor.sensor_id,
            alert_type: alert_type.to_string(),
            severity,
            title,
            message,
            metadata: serde_json::json!({
                "sensor_name": sensor.sensor_name,
                "store_name": sensor.store_name,
                "consecutive_failures": sensor.consecutive_failures,
                "recovery_attempts": sensor.recovery_attempts,
            }),
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::SensorType;
    use chrono::TimeZone;

    fn create_test_sensor() -> Sensor {
        // ---
        Sensor {
            sensor_id: Uuid::new_v4(),
            sensor_name: "OML01".to_string(),
            sensor_type: SensorType::Omnia,
            ip_address: "10.0.0.12".to_string(),
            port: 80,
            store_id: Uuid::new_v4(),
            store_name: Some("Omnia Lisboa".to_string()),
            organization_id: Some(Uuid::new_v4()),
            organization_name: None,
            timezone: chrono_tz::Europe::Lisbon,
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

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 22, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_offline_past_timeout_is_half_open() {
        // ---
        let breaker = CircuitBreaker::default();
        let mut sensor = create_test_sensor();
        sensor.consecutive_failures = 5;
        sensor.status = SensorStatus::Offline;
        sensor.offline_since = Some(now() - chrono::Duration::minutes(61));

        let decision = breaker.should_process(&sensor, now());
        assert_eq!(decision.state, CircuitPhase::HalfOpen);
        assert!(decision.should_process);
        assert_eq!(decision.max_attempts, Some(1));
    }

    #[test]
    fn test_offline_within_timeout_is_open() {
        // ---
        let breaker = CircuitBreaker::default();
        let mut sensor = create_test_sensor();
        sensor.consecutive_failures = 5;
        sensor.status = SensorStatus::Offline;
        sensor.offline_since = Some(now() - chrono::Duration::minutes(10));

        let decision = breaker.should_process(&sensor, now());
        assert_eq!(decision.state, CircuitPhase::Open);
        assert!(!decision.should_process);
        assert!(decision.reason.contains("next trial in 3000s"));
    }

    #[test]
    fn test_closed_below_threshold() {
        // ---
        let breaker = CircuitBreaker::default();
        let mut sensor = create_test_sensor();
        sensor.consecutive_failures = 4;
        sensor.status = SensorStatus::Warning;

        let decision = breaker.should_process(&sensor, now());
        assert_eq!(decision.state, CircuitPhase::Closed);
        assert!(decision.should_process);
        assert_eq!(decision.max_attempts, None);
    }

    #[test]
    fn test_failures_escalate_to_open() {
        // ---
        let breaker = CircuitBreaker::default();
        let mut sensor = create_test_sensor();

        for expected in 1..5 {
            let t = breaker.on_failure(&sensor, "timeout", now());
            assert_eq!(t.update.status, SensorStatus::Warning);
            assert_eq!(t.update.circuit_state, CircuitPhase::Closed);
            assert_eq!(t.update.consecutive_failures, expected);
            assert!(t.alert.is_none());
            sensor.apply(&t.update);
        }

        let t = breaker.on_failure(&sensor, "timeout", now());
        assert_eq!(t.update.status, SensorStatus::Offline);
        assert_eq!(t.update.circuit_state, CircuitPhase::Open);
        assert_eq!(t.update.offline_since, Some(now()));
        assert_eq!(t.alert.as_ref().unwrap().alert_type, "sensor_offline");
    }

    #[test]
    fn test_failed_trial_reopens_and_counts_attempt() {
        // ---
        let breaker = CircuitBreaker::default();
        let mut sensor = create_test_sensor();
        sensor.consecutive_failures = 5;
        sensor.status = SensorStatus::Offline;
        sensor.offline_since = Some(now() - chrono::Duration::hours(2));
        sensor.recovery_attempts = 2;
        sensor.apply(&breaker.trial_update(&sensor));

        let t = breaker.on_failure(&sensor, "connection refused", now());
        assert_eq!(t.from, CircuitPhase::HalfOpen);
        assert_eq!(t.update.circuit_state, CircuitPhase::Open);
        assert_eq!(t.update.recovery_attempts, 3);
        assert_eq!(t.update.consecutive_failures, 6);
        assert_eq!(t.update.offline_since, Some(now()));
        assert_eq!(t.alert.as_ref().unwrap().alert_type, "circuit_reopened");
    }

    #[test]
    fn test_successful_trial_closes_and_resets() {
        // ---
        let breaker = CircuitBreaker::default();
        let mut sensor = create_test_sensor();
        sensor.consecutive_failures = 7;
        sensor.status = SensorStatus::Offline;
        sensor.recovery_attempts = 1;
        sensor.circuit_state = CircuitPhase::HalfOpen;

        let t = breaker.on_success(&sensor, now());
        assert_eq!(t.from, CircuitPhase::HalfOpen);
        assert_eq!(t.update.circuit_state, CircuitPhase::Closed);
        assert_eq!(t.update.status, SensorStatus::Online);
        assert_eq!(t.update.consecutive_failures, 0);
        assert_eq!(t.update.recovery_attempts, 0);
        assert_eq!(t.update.offline_since, None);
        assert_eq!(t.alert.as_ref().unwrap().alert_type, "sensor_recovered");
    }

    #[test]
    fn test_open_without_offline_since_uses_last_failure() {
        // ---
        let breaker = CircuitBreaker::default();
        let mut sensor = create_test_sensor();
        sensor.circuit_state = CircuitPhase::Open;
        sensor.last_failed_check = Some(now() - chrono::Duration::minutes(5));

        assert_eq!(
            breaker.state_of(&sensor),
            CircuitState::Open {
                since: now() - chrono::Duration::minutes(5),
                recovery_attempts: 0
            }
        );
        assert!(!breaker.should_process(&sensor, now()).should_process);
    }
}
