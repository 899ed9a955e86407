//! Classical five-field cron: minute, hour, day-of-month, month,
//! day-of-week. Supports `*`, comma lists, ranges, and `*/n` steps — no
//! seconds field and no named shortcuts.

use time::{Duration, OffsetDateTime};

use crate::error::LitMcpError;

#[derive(Debug, Clone)]
pub struct CronExpr {
    text: String,
    minutes: u64,
    hours: u32,
    dom: u32,
    months: u16,
    dow: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn parse_field(field: &str, min: u8, max: u8, name: &str) -> Result<(u64, bool), LitMcpError> {
    let mut mask: u64 = 0;
    let mut restricted = false;

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(LitMcpError::invalid(format!(
                "Malformed cron {name} field \"{field}\""
            )));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step.parse().map_err(|_| {
                    LitMcpError::invalid(format!("Malformed cron step in \"{part}\""))
                })?;
                if step == 0 {
                    return Err(LitMcpError::invalid("Cron step must be at least 1"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            restricted |= step > 1;
            (min, max)
        } else {
            restricted = true;
            match range.split_once('-') {
                Some((a, b)) => {
                    let lo: u8 = a.parse().map_err(|_| bad_value(name, a))?;
                    let hi: u8 = b.parse().map_err(|_| bad_value(name, b))?;
                    (lo, hi)
                }
                None => {
                    let v: u8 = range.parse().map_err(|_| bad_value(name, range))?;
                    (v, v)
                }
            }
        };

        // Day-of-week 7 is an alias for Sunday.
        let (lo, hi) = if name == "day-of-week" {
            (if lo == 7 { 0 } else { lo }, if hi == 7 { 0 } else { hi })
        } else {
            (lo, hi)
        };

        if lo < min || hi > max || lo > hi {
            return Err(LitMcpError::invalid(format!(
                "Cron {name} value out of range in \"{part}\" (expected {min}-{max})"
            )));
        }
        let mut v = lo;
        loop {
            mask |= 1u64 << v;
            match v.checked_add(step) {
                Some(next) if next <= hi => v = next,
                _ => break,
            }
        }
    }

    Ok((mask, restricted))
}

fn bad_value(name: &str, value: &str) -> LitMcpError {
    LitMcpError::invalid(format!("Malformed cron {name} value \"{value}\""))
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, LitMcpError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(LitMcpError::invalid(format!(
                "Cron expression \"{expr}\" must have exactly five fields (minute hour day-of-month month day-of-week)"
            )));
        }
        let (minutes, _) = parse_field(fields[0], 0, 59, "minute")?;
        let (hours, _) = parse_field(fields[1], 0, 23, "hour")?;
        let (dom, dom_restricted) = parse_field(fields[2], 1, 31, "day-of-month")?;
        let (months, _) = parse_field(fields[3], 1, 12, "month")?;
        let (dow, dow_restricted) = parse_field(fields[4], 0, 7, "day-of-week")?;
        Ok(Self {
            text: expr.trim().to_string(),
            minutes,
            hours: hours as u32,
            dom: dom as u32,
            months: months as u16,
            dow: dow as u8,
            dom_restricted,
            dow_restricted,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn matches(&self, t: OffsetDateTime) -> bool {
        if self.minutes & (1 << t.minute()) == 0 {
            return false;
        }
        if self.hours & (1 << t.hour()) == 0 {
            return false;
        }
        if self.months & (1 << u8::from(t.month())) == 0 {
            return false;
        }
        let dom_hit = self.dom & (1 << t.day()) != 0;
        let dow_hit = self.dow & (1 << t.weekday().number_days_from_sunday()) != 0;
        // Classical rule: when both day fields are restricted, either match
        // fires; otherwise the restricted one (or any day) decides.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_hit || dow_hit,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (false, false) => true,
        }
    }

    /// First fire time strictly after `t`, scanning at most 366 days.
    pub fn next_after(&self, t: OffsetDateTime) -> Option<OffsetDateTime> {
        let mut candidate = t
            .replace_nanosecond(0)
            .ok()?
            .replace_second(0)
            .ok()?
            + Duration::minutes(1);
        for _ in 0..(366 * 24 * 60) {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }

    /// Smallest gap between consecutive fires, sampled over the next few
    /// occurrences. Used to enforce the minimum schedule interval.
    pub fn min_fire_gap(&self, from: OffsetDateTime) -> Option<Duration> {
        let mut previous = self.next_after(from)?;
        let mut min_gap: Option<Duration> = None;
        for _ in 0..4 {
            let next = self.next_after(previous)?;
            let gap = next - previous;
            min_gap = Some(match min_gap {
                Some(current) if current <= gap => current,
                _ => gap,
            });
            previous = next;
        }
        min_gap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parses_the_supported_forms() {
        for expr in [
            "0 9 * * 1",
            "*/15 * * * *",
            "0 0 1,15 * *",
            "30 8-17 * * 1-5",
            "0 12 * 1,6 7",
        ] {
            CronExpr::parse(expr).unwrap_or_else(|e| panic!("{expr}: {e}"));
        }
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "a * * * *",
            "*/0 * * * *",
            "5-1 * * * *",
        ] {
            assert!(CronExpr::parse(expr).is_err(), "accepted {expr:?}");
        }
    }

    #[test]
    fn monday_nine_fires_weekly() {
        let cron = CronExpr::parse("0 9 * * 1").unwrap();
        // 2026-08-03 is a Monday.
        let before = datetime!(2026-08-03 08:59:30 UTC);
        let fire = cron.next_after(before).unwrap();
        assert_eq!(fire, datetime!(2026-08-03 09:00 UTC));
        let next = cron.next_after(fire).unwrap();
        assert_eq!(next, datetime!(2026-08-10 09:00 UTC));
        assert_eq!(next - fire, Duration::days(7));
    }

    #[test]
    fn step_ranges_expand() {
        let cron = CronExpr::parse("*/20 3 * * *").unwrap();
        let t = datetime!(2026-08-01 03:25 UTC);
        assert_eq!(
            cron.next_after(t).unwrap(),
            datetime!(2026-08-01 03:40 UTC)
        );
    }

    #[test]
    fn dow_seven_is_sunday() {
        let a = CronExpr::parse("0 0 * * 0").unwrap();
        let b = CronExpr::parse("0 0 * * 7").unwrap();
        // 2026-08-02 is a Sunday.
        let t = datetime!(2026-08-01 12:00 UTC);
        assert_eq!(a.next_after(t), b.next_after(t));
        assert_eq!(
            a.next_after(t).unwrap(),
            datetime!(2026-08-02 00:00 UTC)
        );
    }

    #[test]
    fn restricted_dom_and_dow_fire_on_either() {
        // Day 15 of the month, or any Monday.
        let cron = CronExpr::parse("0 0 15 * 1").unwrap();
        assert!(cron.matches(datetime!(2026-08-15 00:00 UTC))); // a Saturday
        assert!(cron.matches(datetime!(2026-08-03 00:00 UTC))); // a Monday
        assert!(!cron.matches(datetime!(2026-08-04 00:00 UTC)));
    }

    #[test]
    fn min_fire_gap_flags_sub_hour_schedules() {
        let every_minute = CronExpr::parse("* * * * *").unwrap();
        let gap = every_minute
            .min_fire_gap(datetime!(2026-08-01 00:00 UTC))
            .unwrap();
        assert!(gap < Duration::hours(1));

        let hourly = CronExpr::parse("0 * * * *").unwrap();
        let gap = hourly
            .min_fire_gap(datetime!(2026-08-01 00:30 UTC))
            .unwrap();
        assert_eq!(gap, Duration::hours(1));

        let weekly = CronExpr::parse("0 9 * * 1").unwrap();
        let gap = weekly
            .min_fire_gap(datetime!(2026-08-01 00:00 UTC))
            .unwrap();
        assert_eq!(gap, Duration::days(7));
    }
}
