use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, SchedulerConfig};
use crate::scheduler::notifier::{ScheduledNotifier, TickOutcome};

/// Fires the notifier on a cron schedule. Ticks run one at a time and
/// occurrences missed while a tick was running are skipped.
#[derive(Clone)]
pub struct SchedulerService {
    notifier: ScheduledNotifier,
    schedule: Schedule,
    timezone: Tz,
}

impl SchedulerService {
    pub fn new(notifier: ScheduledNotifier, config: &SchedulerConfig) -> Result<Self, ConfigError> {
        let schedule = parse_schedule(config.cron())?;
        let timezone = parse_timezone(config.timezone())?;
        Ok(Self {
            notifier,
            schedule,
            timezone,
        })
    }

    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    pub async fn tick(&self) -> TickOutcome {
        self.notifier.tick().await
    }

    pub async fn run_loop(&self, shutdown: CancellationToken) {
        tracing::info!(
            event = "scheduler_started",
            timezone = %self.timezone,
            "scheduler loop started"
        );
        loop {
            let now = Utc::now();
            let Some(next) = self.next_fire(now) else {
                tracing::warn!(event = "scheduler_exhausted", "schedule has no further occurrences");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tracing::debug!(event = "scheduler_sleep", next = %next, "waiting for next occurrence");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(event = "scheduler_stopped", "scheduler loop stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            let outcome = self.tick().await;
            tracing::debug!(event = "scheduler_tick_done", outcome = ?outcome, "tick finished");
        }
    }
}

/// Five-field expressions get a leading seconds field.
pub fn normalize_cron_expr(expr: &str) -> Result<String, ConfigError> {
    let fields = expr.split_whitespace().collect::<Vec<_>>();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        _ => Err(ConfigError::Invalid(format!(
            "cron expression must have 5, 6 or 7 fields: {expr}"
        ))),
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    let normalized = normalize_cron_expr(expr)?;
    Schedule::from_str(&normalized)
        .map_err(|err| ConfigError::Invalid(format!("cron expression {expr}: {err}")))
}

pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.parse::<Tz>()
        .map_err(|_| ConfigError::Invalid(format!("unknown timezone: {name}")))
}

pub fn next_cron_occurrence(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ConfigError> {
    let schedule = parse_schedule(expr)?;
    let tz = parse_timezone(timezone)?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|next| next.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn five_field_expressions_gain_seconds() {
        assert_eq!(normalize_cron_expr("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_cron_expr("0 */5 * * * *").unwrap(), "0 */5 * * * *");
        assert!(normalize_cron_expr("* *").is_err());
    }

    #[test]
    fn next_occurrence_is_strictly_after() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 5, 0).unwrap();
        let next = next_cron_occurrence("0 */5 * * * *", "UTC", now)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 10, 0).unwrap());
    }

    #[test]
    fn occurrences_follow_configured_timezone() {
        // 09:00 in Berlin during winter is 08:00 UTC.
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let next = next_cron_occurrence("0 9 * * *", "Europe/Berlin", now)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(parse_timezone("Mars/Olympus").is_err());
    }
}
