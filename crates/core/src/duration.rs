//! Human delay expressions ("30m", "2 horas", "imediatamente") to milliseconds.
//!
//! Campaign authors write delays in English or Portuguese, with or without
//! accents. Anything unparseable falls back to [`DEFAULT_DELAY_MS`].

use chrono::{DateTime, Utc};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Delay used when an expression cannot be understood: 30 minutes.
pub const DEFAULT_DELAY_MS: u64 = 30 * 60 * 1000;

/// Longest wait a timer is ever armed for: roughly one hundred years.
pub const MAX_DELAY_MS: u64 = 100 * 365 * DAY_MS;

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

const IMMEDIATE_WORDS: &[&str] = &["imediatamente", "imediato", "immediately", "agora", "now"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDelay {
    pub millis: u64,
    /// True when the expression was not understood and the default was used.
    pub defaulted: bool,
}

/// The instant `millis` after `from`. Waits beyond [`MAX_DELAY_MS`] are
/// clamped so saturated delays stay far in the future instead of overflowing.
pub fn due_after(from: DateTime<Utc>, millis: u64) -> DateTime<Utc> {
    let millis = i64::try_from(millis.min(MAX_DELAY_MS)).unwrap_or(i64::MAX);
    from.checked_add_signed(chrono::Duration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Parses a delay expression, falling back to the default on failure.
pub fn parse_delay(expr: &str) -> u64 {
    parse_delay_detailed(expr).millis
}

pub fn parse_delay_detailed(expr: &str) -> ParsedDelay {
    match try_parse(expr) {
        Some(millis) => ParsedDelay {
            millis,
            defaulted: false,
        },
        None => {
            tracing::warn!(
                expr = expr,
                default_ms = DEFAULT_DELAY_MS,
                "Unparseable delay expression, using default"
            );
            ParsedDelay {
                millis: DEFAULT_DELAY_MS,
                defaulted: true,
            }
        }
    }
}

/// Accent-folded, lowercased and trimmed form of `expr`.
fn normalize(expr: &str) -> String {
    expr.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

fn try_parse(expr: &str) -> Option<u64> {
    let text = normalize(expr);
    if text.is_empty() {
        return None;
    }
    if IMMEDIATE_WORDS.contains(&text.as_str()) {
        return Some(0);
    }

    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let unit: String = text[digits.len()..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphabetic())
        .collect();

    let unit_ms = if unit.is_empty() {
        MINUTE_MS
    } else {
        unit_millis(&unit)?
    };
    Some(amount.saturating_mul(unit_ms))
}

fn unit_millis(unit: &str) -> Option<u64> {
    match unit {
        "s" | "seg" | "segs" | "segundo" | "segundos" | "sec" | "secs" | "second" | "seconds" => {
            Some(SECOND_MS)
        }
        "m" | "min" | "mins" | "minuto" | "minutos" | "minute" | "minutes" => Some(MINUTE_MS),
        "h" | "hr" | "hrs" | "hora" | "horas" | "hour" | "hours" => Some(HOUR_MS),
        "d" | "dia" | "dias" | "day" | "days" => Some(DAY_MS),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_words() {
        assert_eq!(parse_delay("imediatamente"), 0);
        assert_eq!(parse_delay("  Immediately "), 0);
        assert_eq!(parse_delay("agora"), 0);
    }

    #[test]
    fn test_compact_units() {
        assert_eq!(parse_delay("2h"), 7_200_000);
        assert_eq!(parse_delay("30m"), 1_800_000);
        assert_eq!(parse_delay("45s"), 45_000);
        assert_eq!(parse_delay("1d"), 86_400_000);
    }

    #[test]
    fn test_worded_units_with_accents() {
        assert_eq!(parse_delay("2 horas"), 7_200_000);
        assert_eq!(parse_delay("5 segundos"), 5_000);
        assert_eq!(parse_delay("10 MINUTOS"), 600_000);
        assert_eq!(parse_delay("3 dias"), 3 * 86_400_000);
        assert_eq!(parse_delay("1 hóra"), 3_600_000);
    }

    #[test]
    fn test_bare_number_means_minutes() {
        assert_eq!(parse_delay("30"), 1_800_000);
        assert_eq!(parse_delay("0"), 0);
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let parsed = parse_delay_detailed("whenever you like");
        assert_eq!(parsed.millis, DEFAULT_DELAY_MS);
        assert!(parsed.defaulted);
        assert_eq!(parse_delay(""), DEFAULT_DELAY_MS);
        assert_eq!(parse_delay("5 fortnights"), DEFAULT_DELAY_MS);
    }

    #[test]
    fn test_huge_amount_saturates() {
        assert_eq!(parse_delay("99999999999999999999d"), DEFAULT_DELAY_MS);
        assert_eq!(parse_delay("9999999999999999d"), u64::MAX);
    }

    #[test]
    fn test_due_after_clamps_saturated_waits() {
        let now = Utc::now();
        assert_eq!(due_after(now, 2 * HOUR_MS), now + chrono::Duration::hours(2));

        let capped = due_after(now, u64::MAX);
        assert_eq!(capped, due_after(now, MAX_DELAY_MS));
        assert!(capped > now + chrono::Duration::days(365 * 99));
    }
}
