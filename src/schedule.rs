use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fallback expression for unknown or malformed frequencies: daily at
/// 02:00.
pub const FALLBACK_EXPR: &str = "0 2 * * *";

/// User-facing frequency descriptor normalized into a 5-field
/// expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Hourly,
    Daily { hour: u32 },
    Weekly { weekday: u32, hour: u32 },
    Monthly { day: u32, hour: u32 },
    Custom { expr: String },
}

impl Frequency {
    /// Parse the compact CLI form: `hourly`, `daily[:H]`, `weekly:W:H`,
    /// `monthly:D:H`, or a raw 5-field expression. Anything else maps
    /// to daily-at-02:00 via [`ScheduleEngine::build_expression`].
    pub fn parse(s: &str) -> Frequency {
        let s = s.trim();
        if s.split_whitespace().count() == 5 {
            return Frequency::Custom {
                expr: s.to_string(),
            };
        }

        let mut parts = s.split(':');
        match parts.next() {
            Some("hourly") => Frequency::Hourly,
            Some("daily") => Frequency::Daily {
                hour: parts.next().and_then(|h| h.parse().ok()).unwrap_or(2),
            },
            Some("weekly") => {
                let weekday = parts.next().and_then(|d| d.parse().ok()).unwrap_or(0);
                let hour = parts.next().and_then(|h| h.parse().ok()).unwrap_or(2);
                Frequency::Weekly { weekday, hour }
            }
            Some("monthly") => {
                let day = parts.next().and_then(|d| d.parse().ok()).unwrap_or(1);
                let hour = parts.next().and_then(|h| h.parse().ok()).unwrap_or(2);
                Frequency::Monthly { day, hour }
            }
            _ => Frequency::Daily { hour: 2 },
        }
    }
}

/// Turns frequency descriptors into normalized 5-field expressions and
/// computes next run times.
#[derive(Debug, Default)]
pub struct ScheduleEngine;

impl ScheduleEngine {
    pub fn new() -> Self {
        Self
    }

    /// Normalize a frequency into a 5-field expression. Out-of-range
    /// components fall back to [`FALLBACK_EXPR`]. Deterministic:
    /// identical input yields an identical string.
    pub fn build_expression(&self, freq: &Frequency) -> String {
        match freq {
            Frequency::Hourly => "0 * * * *".to_string(),
            Frequency::Daily { hour } if *hour < 24 => format!("0 {hour} * * *"),
            Frequency::Weekly { weekday, hour } if *weekday < 7 && *hour < 24 => {
                format!("0 {hour} * * {weekday}")
            }
            Frequency::Monthly { day, hour } if (1..=31).contains(day) && *hour < 24 => {
                format!("0 {hour} {day} * *")
            }
            Frequency::Custom { expr } if expr.split_whitespace().count() == 5 => expr.clone(),
            other => {
                debug!("Malformed frequency {:?}, falling back to daily", other);
                FALLBACK_EXPR.to_string()
            }
        }
    }

    /// Next occurrence strictly after `now`.
    ///
    /// Only the common case where day-of-month and weekday are both
    /// wildcards (pure hourly/daily expressions) is resolved exactly.
    /// Weekly, monthly, custom, and malformed expressions get a
    /// conservative `now + 1 day` placeholder; callers that need real
    /// evaluation for those shapes need a full cron evaluator, which
    /// this engine deliberately does not carry.
    pub fn next_run(&self, expr: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return now + Duration::days(1);
        }
        let (minute, hour, dom, _month, dow) =
            (fields[0], fields[1], fields[2], fields[3], fields[4]);

        if dom != "*" || dow != "*" {
            return now + Duration::days(1);
        }

        let Ok(minute) = minute.parse::<u32>() else {
            return now + Duration::days(1);
        };
        if minute > 59 {
            return now + Duration::days(1);
        }

        match hour.parse::<u32>() {
            // Daily at hour:minute.
            Ok(hour) if hour < 24 => {
                let today = now
                    .with_hour(hour)
                    .and_then(|t| t.with_minute(minute))
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                if today > now {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
            // Hourly at :minute.
            Err(_) if hour == "*" => {
                let this_hour = now
                    .with_minute(minute)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                if this_hour > now {
                    this_hour
                } else {
                    this_hour + Duration::hours(1)
                }
            }
            _ => now + Duration::days(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn engine() -> ScheduleEngine {
        ScheduleEngine::new()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, h, m, 30).unwrap()
    }

    #[test]
    fn test_build_expression_shapes() {
        let e = engine();
        assert_eq!(e.build_expression(&Frequency::Hourly), "0 * * * *");
        assert_eq!(e.build_expression(&Frequency::Daily { hour: 4 }), "0 4 * * *");
        assert_eq!(
            e.build_expression(&Frequency::Weekly { weekday: 0, hour: 3 }),
            "0 3 * * 0"
        );
        assert_eq!(
            e.build_expression(&Frequency::Monthly { day: 15, hour: 1 }),
            "0 1 15 * *"
        );
        assert_eq!(
            e.build_expression(&Frequency::Custom {
                expr: "*/5 * * * *".to_string()
            }),
            "*/5 * * * *"
        );
    }

    #[test]
    fn test_malformed_frequencies_fall_back_to_daily_two_am() {
        let e = engine();
        assert_eq!(e.build_expression(&Frequency::Daily { hour: 99 }), FALLBACK_EXPR);
        assert_eq!(
            e.build_expression(&Frequency::Weekly { weekday: 9, hour: 3 }),
            FALLBACK_EXPR
        );
        assert_eq!(
            e.build_expression(&Frequency::Monthly { day: 0, hour: 3 }),
            FALLBACK_EXPR
        );
        assert_eq!(
            e.build_expression(&Frequency::Custom {
                expr: "not an expression".to_string()
            }),
            FALLBACK_EXPR
        );
    }

    #[test]
    fn test_build_expression_is_idempotent() {
        let e = engine();
        let freq = Frequency::Weekly { weekday: 3, hour: 5 };
        assert_eq!(e.build_expression(&freq), e.build_expression(&freq));
    }

    #[test]
    fn test_daily_next_run_resolves_exactly() {
        let e = engine();
        // 02:00 has passed today at 14:xx, so tomorrow.
        let next = e.next_run("0 2 * * *", at(14, 30));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 11, 2, 0, 0).unwrap());

        // 22:00 is still ahead today.
        let next = e.next_run("0 22 * * *", at(14, 30));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 10, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_hourly_next_run_resolves_exactly() {
        let e = engine();
        let next = e.next_run("0 * * * *", at(14, 30));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 10, 15, 0, 0).unwrap());

        let next = e.next_run("45 * * * *", at(14, 30));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 10, 14, 45, 0).unwrap());
    }

    #[test]
    fn test_next_run_is_strictly_in_the_future() {
        let e = engine();
        let exactly = Utc.with_ymd_and_hms(2024, 6, 10, 2, 0, 0).unwrap();
        let next = e.next_run("0 2 * * *", exactly);
        assert!(next > exactly);
    }

    #[test]
    fn test_weekly_monthly_custom_get_placeholder() {
        let e = engine();
        let now = at(14, 30);
        assert_eq!(e.next_run("0 3 * * 0", now), now + Duration::days(1));
        assert_eq!(e.next_run("0 1 15 * *", now), now + Duration::days(1));
        assert_eq!(e.next_run("*/5 * * * *", now), now + Duration::days(1));
        assert_eq!(e.next_run("garbage", now), now + Duration::days(1));
    }

    #[test]
    fn test_frequency_parse_compact_forms() {
        assert_eq!(Frequency::parse("hourly"), Frequency::Hourly);
        assert_eq!(Frequency::parse("daily"), Frequency::Daily { hour: 2 });
        assert_eq!(Frequency::parse("daily:6"), Frequency::Daily { hour: 6 });
        assert_eq!(
            Frequency::parse("weekly:1:3"),
            Frequency::Weekly { weekday: 1, hour: 3 }
        );
        assert_eq!(
            Frequency::parse("monthly:15:4"),
            Frequency::Monthly { day: 15, hour: 4 }
        );
        assert_eq!(
            Frequency::parse("30 4 * * 2"),
            Frequency::Custom {
                expr: "30 4 * * 2".to_string()
            }
        );
        assert_eq!(Frequency::parse("whenever"), Frequency::Daily { hour: 2 });
    }
}
