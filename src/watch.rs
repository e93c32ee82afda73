//! Scheduled preview runs.
//!
//! Watch mode only previews. Committing stays an explicit, reviewed step.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::pipeline::service::{IntakeService, PreviewResponse};

/// Parse a cron expression (seconds field first).
pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expression.trim()).map_err(|e| ConfigError::InvalidValue {
        key: "INTAKE_SCHEDULE".into(),
        message: format!("invalid cron: {e}"),
    })
}

/// Next fire time strictly after `after`.
pub fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Spawn the watch loop. Each tick runs a preview over the default window
/// and hands the response to `on_report`.
pub fn spawn_watch<F>(
    service: Arc<IntakeService>,
    schedule: cron::Schedule,
    on_report: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(&PreviewResponse) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = next_fire(&schedule, now) else {
                warn!("Schedule has no upcoming fire time; watch stopped");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next = %next, "Waiting for next scheduled preview");
            tokio::time::sleep(wait).await;

            let response = service.preview(None, None).await;
            if response.success {
                info!(
                    candidates = response.summary.total,
                    selected = response.summary.selected,
                    errors = response.errors.len(),
                    "Scheduled preview complete"
                );
            } else {
                error!(message = %response.message, "Scheduled preview failed");
            }
            on_report(&response);
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    #[test]
    fn daily_schedule_fires_next_morning() {
        let schedule = parse_schedule("0 0 7 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap();
        let next = next_fire(&schedule, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 4, 7, 0, 0).unwrap());
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn invalid_expression_is_a_config_error() {
        let err = parse_schedule("every morning").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "INTAKE_SCHEDULE"));
    }
}
