use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

/// Storefront placeholders that never resolve to a date.
const PLACEHOLDERS: &[&str] = &["coming soon", "to be announced", "tba", "tbd"];

/// Formats tried in order; first match wins. Day-first before month-first so that
/// "05/06/2024" resolves the way the EU storefronts print it.
const DATE_FORMATS: &[&str] = &["%d %b, %Y", "%b %d, %Y", "%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"];

fn year_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(20\d{2})\b").ok()).as_ref()
}

/// Replace localized month abbreviations some regions leak into English payloads.
pub fn normalize_month_names(raw: &str) -> String {
    raw.replace("maj", "May")
        .replace("Maj", "May")
        .replace("okt", "Oct")
        .replace("Okt", "Oct")
}

/// Parse a storefront release-date string. Year-only strings map to January 1st, but only
/// when that year is not in the future relative to `today` ("2027" for an unreleased game
/// is a target, not a date).
pub fn parse_release_date(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || PLACEHOLDERS.contains(&trimmed.to_ascii_lowercase().as_str()) {
        return None;
    }
    let normalized = normalize_month_names(trimmed);

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&normalized, fmt) {
            return Some(date);
        }
    }

    let year: i32 = year_regex()?
        .captures(&normalized)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    if year <= today.year() {
        NaiveDate::from_ymd_opt(year, 1, 1)
    } else {
        None
    }
}

/// True when any category mentions early access, in any casing.
pub fn is_early_access<S: AsRef<str>>(categories: &[S]) -> bool {
    categories.iter().any(|c| {
        let lowered = c.as_ref().to_ascii_lowercase();
        lowered.contains("early access") || lowered.contains("earlyaccess")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()
    }

    #[test]
    fn parses_storefront_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 11, 25).unwrap();
        for raw in ["25 Nov, 2024", "Nov 25, 2024", "2024-11-25", "25/11/2024"] {
            assert_eq!(parse_release_date(raw, today()), Some(expected), "{raw}");
        }
        assert_eq!(
            parse_release_date("11/25/2024", today()),
            Some(expected),
            "month-first fallback"
        );
    }

    #[test]
    fn fixes_localized_month_names() {
        assert_eq!(
            parse_release_date("3 maj, 2023", today()),
            NaiveDate::from_ymd_opt(2023, 5, 3)
        );
        assert_eq!(
            parse_release_date("12 okt, 2022", today()),
            NaiveDate::from_ymd_opt(2022, 10, 12)
        );
    }

    #[test]
    fn placeholders_and_future_years_are_not_dates() {
        assert_eq!(parse_release_date("Coming soon", today()), None);
        assert_eq!(parse_release_date("TBA", today()), None);
        assert_eq!(parse_release_date("   ", today()), None);
        assert_eq!(parse_release_date("Q4 2027", today()), None);
        assert_eq!(
            parse_release_date("Q1 2024", today()),
            NaiveDate::from_ymd_opt(2024, 1, 1)
        );
    }

    #[test]
    fn detects_early_access_category() {
        assert!(is_early_access(&["Single-player", "Early Access"]));
        assert!(is_early_access(&["EARLYACCESS"]));
        assert!(!is_early_access(&["Steam Achievements"]));
        assert!(!is_early_access::<&str>(&[]));
    }
}
