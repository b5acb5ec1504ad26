use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;

use crate::sheet::Cell;

pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 2100;

/// Excel's day-serial epoch. 1899-12-30 rather than 1899-12-31 absorbs the
/// fictitious 1900-02-29 that Excel inherited from Lotus 1-2-3.
fn excel_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or(NaiveDate::MIN)
}

fn two_digit_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{1,2})[/.](\d{1,2})[/.](\d{2})$").expect("invalid 2-digit-year regex")
    })
}

fn year_in_range(date: NaiveDate) -> Option<NaiveDate> {
    if (MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        Some(date)
    } else {
        None
    }
}

/// Two-digit years split at 50: 00-49 map to the 2000s, 50-99 to the 1900s.
/// This boundary is a deliberate business convention, not chrono's default.
fn resolve_two_digit_year(yy: i32) -> i32 {
    if yy < 50 {
        2000 + yy
    } else {
        1900 + yy
    }
}

pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial >= 100_000.0 {
        return None;
    }
    excel_epoch()
        .checked_add_signed(Duration::days(serial.floor() as i64))
        .and_then(year_in_range)
}

/// String dates, tried against an ordered pattern table. All ambiguous d/m
/// patterns are day-first; month-first is never attempted.
pub fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    // Numeric strings are Excel serials that survived cell stringification.
    if let Ok(serial) = s.parse::<f64>() {
        return excel_serial_to_date(serial);
    }

    if let Some(caps) = two_digit_year_re().captures(s) {
        let day = caps.get(1)?.as_str().parse::<u32>().ok()?;
        let month = caps.get(2)?.as_str().parse::<u32>().ok()?;
        let yy = caps.get(3)?.as_str().parse::<i32>().ok()?;
        return NaiveDate::from_ymd_opt(resolve_two_digit_year(yy), month, day);
    }

    for fmt in ["%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d", "%d-%m-%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return year_in_range(date);
        }
    }

    // Generic fallback for date-time stringifications, gated on a sane year.
    for fmt in [
        "%d/%m/%Y %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return year_in_range(dt.date());
        }
    }
    None
}

/// The DateNormalizer entry point. Resolution order: native date-time value,
/// Excel serial, then the string pattern table.
pub fn parse_cell_date(cell: &Cell) -> Option<NaiveDate> {
    match cell {
        Cell::DateTime(dt) => year_in_range(dt.date()),
        Cell::Number(n) => excel_serial_to_date(*n),
        Cell::Text(s) => parse_date_text(s),
        Cell::Empty | Cell::Bool(_) => None,
    }
}

/// Naive local dates must never leak timezone drift into month attribution,
/// so every normalized date is pinned to UTC midnight.
pub fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}
