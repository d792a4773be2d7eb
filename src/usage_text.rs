use crate::error::{SwitchError, SwitchResult};
use crate::models::{RateLimitSnapshot, UsageSource};
use chrono::{
    DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::OnceLock;

const MODEL_NAMES: &[&str] = &["opus", "sonnet", "haiku"];
const MONTH_DAY_FORMATS: &[&str] = &[
    "%Y %b %d, %I:%M%p",
    "%Y %b %d at %I:%M%p",
    "%Y %b %d %I:%M%p",
    "%Y %B %d, %I:%M%p",
    "%Y %B %d %I:%M%p",
];
const TIME_FORMAT: &str = "%I:%M%p";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Session,
    WeeklyAll,
    WeeklyModel,
}

fn ansi_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][A-Za-z0-9]")
            .expect("valid ansi regex")
    })
}

fn percent_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\d{1,3})\s*%\s*(used|left)").expect("valid percent regex")
    })
}

fn timezone_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\(([^)]*)\)").expect("valid timezone regex"))
}

fn hour_only_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(:?)\b(\d{1,2})(am|pm)\b").expect("valid hour regex")
    })
}

fn spaced_meridiem_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\d)\s+(am|pm)\b").expect("valid meridiem regex")
    })
}

pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").replace('\r', "")
}

/// Parses the plain-text table printed by `claude -p /usage` into a
/// percent-scale snapshot.
pub fn parse_usage_report(output: &str, now: DateTime<Utc>) -> SwitchResult<RateLimitSnapshot> {
    let cleaned = strip_ansi(output);
    let mut section = Section::None;
    let mut session_used = None;
    let mut weekly_used = None;
    let mut session_reset = None;
    let mut weekly_reset = None;

    for line in cleaned.lines() {
        let lower = line.to_lowercase();
        if lower.contains("current session") {
            section = Section::Session;
        } else if lower.contains("current week") {
            section = if lower.contains("all") {
                Section::WeeklyAll
            } else if MODEL_NAMES.iter().any(|model| lower.contains(model)) {
                Section::WeeklyModel
            } else {
                Section::WeeklyAll
            };
        }

        if let Some(captures) = percent_regex().captures(line) {
            let value = captures[1].parse::<f64>().unwrap_or(0.0);
            let used = if captures[2].eq_ignore_ascii_case("left") {
                100.0 - value
            } else {
                value
            };
            match section {
                Section::Session => session_used = Some(used),
                Section::WeeklyAll => weekly_used = Some(used),
                Section::WeeklyModel | Section::None => {}
            }
        }

        if lower.contains("reset") {
            let parsed = parse_reset_line(line, now);
            match section {
                Section::Session if parsed.is_some() => session_reset = parsed,
                Section::WeeklyAll if parsed.is_some() => weekly_reset = parsed,
                _ => {}
            }
        }
    }

    if session_used.is_none() && weekly_used.is_none() {
        return Err(SwitchError::ParseError(
            "no usage percentages found in claude output".to_string(),
        ));
    }

    let mut snapshot = RateLimitSnapshot::percent_scale(UsageSource::Cli, now);
    snapshot.session_used = session_used.unwrap_or(0.0);
    snapshot.weekly_used = weekly_used.unwrap_or(0.0);
    snapshot.session_reset = session_reset;
    snapshot.weekly_reset = weekly_reset.or_else(|| next_monday_midnight(&Local, now));
    Ok(snapshot)
}

/// Resolves a "Resets ..." line to an instant. A trailing `(Area/City)`
/// names the zone; without one the local zone is used.
pub fn parse_reset_line(line: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let start = line.to_ascii_lowercase().find("reset")?;
    let mut rest = &line[start..];
    rest = rest
        .split_once(char::is_whitespace)
        .map(|(_, tail)| tail)
        .unwrap_or("");

    let zone = timezone_regex()
        .captures(rest)
        .and_then(|captures| captures[1].trim().parse::<Tz>().ok());
    let text = timezone_regex().replace_all(rest, "");
    let text = normalize_time_text(&text);
    if text.is_empty() {
        return None;
    }

    match zone {
        Some(zone) => resolve_in_zone(&zone, &text, now),
        None => resolve_in_zone(&Local, &text, now),
    }
}

fn normalize_time_text(text: &str) -> String {
    let trimmed = text
        .trim()
        .trim_start_matches(|c: char| c == ':' || c == '·' || c.is_whitespace())
        .trim_end_matches(|c: char| c == '.' || c == '·' || c.is_whitespace());
    let joined = spaced_meridiem_regex().replace_all(trimmed, "$1$2");
    hour_only_regex()
        .replace_all(&joined, |captures: &regex::Captures| {
            if captures[1].is_empty() {
                format!("{}:00{}", &captures[2], &captures[3])
            } else {
                captures[0].to_string()
            }
        })
        .to_string()
}

fn resolve_in_zone<Z: TimeZone>(zone: &Z, text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local_now = now.with_timezone(zone);
    let today = local_now.date_naive();

    if let Some(naive) = parse_month_day(text, today.year()) {
        let mut resolved = to_utc(zone, naive)?;
        // "Jan 2" seen in late December belongs to next year.
        if resolved < now - Duration::days(1) {
            let next_year = parse_month_day(text, today.year() + 1)?;
            resolved = to_utc(zone, next_year)?;
        }
        return Some(resolved);
    }

    let time = NaiveTime::parse_from_str(&text.to_uppercase(), TIME_FORMAT).ok()?;
    let mut resolved = to_utc(zone, today.and_time(time))?;
    if resolved <= now {
        let tomorrow = today.succ_opt()?;
        resolved = to_utc(zone, tomorrow.and_time(time))?;
    }
    Some(resolved)
}

fn parse_month_day(text: &str, year: i32) -> Option<NaiveDateTime> {
    let candidate = format!("{} {}", year, text);
    MONTH_DAY_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&candidate, format).ok())
}

fn to_utc<Z: TimeZone>(zone: &Z, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&naive)
        .earliest()
        .map(|value| value.with_timezone(&Utc))
}

/// Monday 00:00 in `zone` strictly after `now`.
pub fn next_monday_midnight<Z: TimeZone>(zone: &Z, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today: NaiveDate = now.with_timezone(zone).date_naive();
    let offset = 7 - i64::from(today.weekday().num_days_from_monday());
    let monday = today + Duration::days(offset);
    to_utc(zone, monday.and_hms_opt(0, 0, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).unwrap()
    }

    #[test]
    fn parses_session_block_with_named_zone() {
        let snapshot = parse_usage_report(
            "Current session\n45% used\nResets 3:00pm (America/New_York)",
            now(),
        )
        .expect("parse");
        assert_eq!(snapshot.session_used, 45.0);
        assert_eq!(snapshot.session_limit, 100.0);
        assert_eq!(snapshot.source, UsageSource::Cli);
        assert_eq!(
            snapshot.session_reset,
            Some(Utc.with_ymd_and_hms(2026, 10, 19, 19, 0, 0).unwrap())
        );
        assert!(snapshot.weekly_reset.is_some_and(|reset| reset > now()));
    }

    #[test]
    fn bare_time_already_past_rolls_to_tomorrow() {
        let reset = parse_reset_line("Resets 9am (America/New_York)", now()).expect("reset");
        assert_eq!(reset, Utc.with_ymd_and_hms(2026, 10, 20, 13, 0, 0).unwrap());
    }

    #[test]
    fn full_table_with_ansi_and_left_markers() {
        let output = "\x1b[1mCurrent session\x1b[0m\n\
                      \x1b[32m█████\x1b[0m 20% left\n\
                      Resets 11pm (Europe/London)\n\
                      \n\
                      Current week (all models)\n\
                      62% used\n\
                      Resets Oct 24, 3pm (Europe/London)\n\
                      \n\
                      Current week (Opus)\n\
                      99% used\n\
                      Resets Oct 25 at 1:30am (Europe/London)\n";
        let snapshot = parse_usage_report(output, now()).expect("parse");
        assert_eq!(snapshot.session_used, 80.0);
        assert_eq!(snapshot.weekly_used, 62.0);
        assert_eq!(
            snapshot.session_reset,
            Some(Utc.with_ymd_and_hms(2026, 10, 19, 22, 0, 0).unwrap())
        );
        assert_eq!(
            snapshot.weekly_reset,
            Some(Utc.with_ymd_and_hms(2026, 10, 24, 14, 0, 0).unwrap())
        );
    }

    #[test]
    fn month_day_in_the_past_rolls_into_next_year() {
        let late_december = Utc.with_ymd_and_hms(2026, 12, 30, 12, 0, 0).unwrap();
        let reset = parse_reset_line("Resets Jan 2, 10:00am (UTC)", late_december).expect("reset");
        assert_eq!(reset, Utc.with_ymd_and_hms(2027, 1, 2, 10, 0, 0).unwrap());
    }

    #[test]
    fn unparseable_reset_is_ignored() {
        assert!(parse_reset_line("Resets whenever", now()).is_none());
    }

    #[test]
    fn output_without_percentages_is_a_parse_error() {
        let err = parse_usage_report("Error: not logged in", now()).expect_err("no data");
        assert!(matches!(err, SwitchError::ParseError(_)));
    }

    #[test]
    fn next_monday_is_strictly_after_now() {
        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap();
        assert_eq!(
            next_monday_midnight(&Utc, monday),
            Some(Utc.with_ymd_and_hms(2026, 10, 26, 0, 0, 0).unwrap())
        );
        let thursday = Utc.with_ymd_and_hms(2026, 10, 22, 15, 0, 0).unwrap();
        assert_eq!(
            next_monday_midnight(&Utc, thursday),
            Some(Utc.with_ymd_and_hms(2026, 10, 26, 0, 0, 0).unwrap())
        );
    }
}
