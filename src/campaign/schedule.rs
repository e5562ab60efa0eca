use chrono::{DateTime, Duration, Utc};

use super::types::Template;

/// Backoff base for transient send failures.
const RETRY_BASE_SECS: i64 = 60;
/// Backoff ceiling.
const RETRY_CAP_SECS: i64 = 3_600;

pub const DEFAULT_MAX_RETRY_ATTEMPTS: i32 = 3;

/// Step-1 anchor: the campaign start time, but never in the past.
pub fn first_step_at(start_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match start_time {
        Some(start) if start > now => start,
        _ => now,
    }
}

/// Follow-up steps chain from the actual send time of the previous step,
/// not its scheduled time, so spacing stays deterministic after pauses and
/// retries.
pub fn follow_up_at(previous_sent_at: DateTime<Utc>, template: &Template) -> DateTime<Utc> {
    previous_sent_at + Duration::minutes(template.delay_minutes)
}

/// Exponential backoff for attempt `attempts` (1-based): 60s, 120s, 240s …
/// capped at one hour.
pub fn retry_backoff(attempts: i32) -> Duration {
    let exponent = attempts.max(1) - 1;
    let secs = RETRY_BASE_SECS.saturating_mul(1_i64 << exponent.min(12));
    Duration::seconds(secs.min(RETRY_CAP_SECS))
}

pub fn retry_at(now: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
    now + retry_backoff(attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn template(delay_minutes: i64) -> Template {
        let now = Utc::now();
        Template {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            step_number: 2,
            subject: "Following up".to_string(),
            body_html: "<p>ping</p>".to_string(),
            delay_minutes,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn first_step_uses_start_time_when_in_future() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let start = now + Duration::hours(2);
        assert_eq!(first_step_at(Some(start), now), start);
    }

    #[test]
    fn first_step_clamps_past_start_time_to_now() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let start = now - Duration::hours(2);
        assert_eq!(first_step_at(Some(start), now), now);
        assert_eq!(first_step_at(None, now), now);
    }

    #[test]
    fn follow_up_chains_from_actual_send_time() {
        let sent_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let at = follow_up_at(sent_at, &template(60));
        assert_eq!(at, sent_at + Duration::minutes(60));
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(1), Duration::seconds(60));
        assert_eq!(retry_backoff(2), Duration::seconds(120));
        assert_eq!(retry_backoff(3), Duration::seconds(240));
        assert_eq!(retry_backoff(10), Duration::seconds(3_600));
    }
}
