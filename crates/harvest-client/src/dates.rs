//! Regional date formats normalized to ISO `YYYY-MM-DD`.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

static CJK_YMD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})\s*[年년]\s*(\d{1,2})\s*[月월]\s*(\d{1,2})\s*[日일]?")
        .expect("CJK date regex is valid")
});

static NUMERIC_YMD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})\b").expect("y/m/d regex is valid")
});

static NUMERIC_DMY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[-/.](\d{1,2})[-/.](\d{4})\b").expect("d/m/y regex is valid")
});

static DAY_MONTH_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})(?:er)?\.?\s+(?:de\s+)?(\p{L}+)\.?,?\s+(?:de\s+)?(\d{4})\b")
        .expect("day-month-year regex is valid")
});

static MONTH_NAME_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\p{L}+)\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b")
        .expect("month-day-year regex is valid")
});

/// Month number for an English, German, French or Spanish month name.
fn month_from_name(name: &str) -> Option<u32> {
    let name = name.to_lowercase();
    let month = match name.as_str() {
        "january" | "jan" | "januar" | "jänner" | "janvier" | "enero" => 1,
        "february" | "feb" | "februar" | "février" | "fevrier" | "febrero" => 2,
        "march" | "mar" | "märz" | "maerz" | "mars" | "marzo" => 3,
        "april" | "apr" | "avril" | "abril" => 4,
        "may" | "mai" | "mayo" => 5,
        "june" | "jun" | "juni" | "juin" | "junio" => 6,
        "july" | "jul" | "juli" | "juillet" | "julio" => 7,
        "august" | "aug" | "août" | "aout" | "agosto" => 8,
        "september" | "sep" | "sept" | "septembre" | "septiembre" => 9,
        "october" | "oct" | "oktober" | "octobre" | "octubre" => 10,
        "november" | "nov" | "novembre" | "noviembre" => 11,
        "december" | "dec" | "dezember" | "décembre" | "decembre" | "diciembre" => 12,
        _ => return None,
    };
    Some(month)
}

fn ymd(year: &str, month: u32, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month, day.parse().ok()?)
}

/// First date found in `text`.
///
/// Numeric `a/b/yyyy` dates are read day-first; when that is not a valid
/// date they are read month-first.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    if let Some(c) = CJK_YMD.captures(text) {
        return ymd(&c[1], c[2].parse().ok()?, &c[3]);
    }
    if let Some(c) = NUMERIC_YMD.captures(text) {
        return ymd(&c[1], c[2].parse().ok()?, &c[3]);
    }
    if let Some(c) = NUMERIC_DMY.captures(text) {
        let (a, b): (u32, u32) = (c[1].parse().ok()?, c[2].parse().ok()?);
        let year = &c[3];
        return ymd(year, b, &c[1]).or_else(|| ymd(year, a, &c[2]));
    }
    if let Some(date) = DAY_MONTH_NAME
        .captures_iter(text)
        .find_map(|c| ymd(&c[3], month_from_name(&c[2])?, &c[1]))
    {
        return Some(date);
    }
    MONTH_NAME_DAY
        .captures_iter(text)
        .find_map(|c| ymd(&c[3], month_from_name(&c[1])?, &c[2]))
}

/// `text` as `YYYY-MM-DD` when it contains a date.
pub fn normalize_date(text: &str) -> Option<String> {
    parse_date(text).map(|d| d.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cjk_dates() {
        assert_eq!(normalize_date("2024年3月15日").as_deref(), Some("2024-03-15"));
        assert_eq!(normalize_date("공개일: 2023년 11월 2일").as_deref(), Some("2023-11-02"));
    }

    #[test]
    fn test_numeric_orders() {
        assert_eq!(normalize_date("2024/03/15").as_deref(), Some("2024-03-15"));
        assert_eq!(normalize_date("15.03.2024").as_deref(), Some("2024-03-15"));
        assert_eq!(normalize_date("04/05/2024").as_deref(), Some("2024-05-04"));
        // Not a valid day-first date, read month-first.
        assert_eq!(normalize_date("03/25/2024").as_deref(), Some("2024-03-25"));
    }

    #[test]
    fn test_month_names() {
        assert_eq!(normalize_date("Published 5 March 2024").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("March 5th, 2024").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("12. Oktober 2023").as_deref(), Some("2023-10-12"));
        assert_eq!(normalize_date("1er août 2022").as_deref(), Some("2022-08-01"));
        assert_eq!(normalize_date("3 de mayo de 2021").as_deref(), Some("2021-05-03"));
        assert_eq!(normalize_date("15 février 2020").as_deref(), Some("2020-02-15"));
    }

    #[test]
    fn test_no_date() {
        assert!(normalize_date("Contact the licensing office").is_none());
        assert!(normalize_date("31/31/2024").is_none());
    }
}
