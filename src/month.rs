use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dates::utc_midnight;
use crate::sheet::Grid;

pub const MIN_MONTH_YEAR: i32 = 2000;
pub const MAX_MONTH_YEAR: i32 = 2100;

/// The accounting month a batch of records is attributed to. Day is always
/// the first of the month, pinned to UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        let key = Self { year, month };
        key.is_valid().then_some(key)
    }

    pub fn is_valid(&self) -> bool {
        (1..=12).contains(&self.month) && (MIN_MONTH_YEAR..=MAX_MONTH_YEAR).contains(&self.year)
    }

    /// One calendar month back, rolling the year at January.
    pub fn shifted_back(&self) -> MonthKey {
        if self.month == 1 {
            MonthKey {
                year: self.year - 1,
                month: 12,
            }
        } else {
            MonthKey {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        utc_midnight(self.first_day())
    }
}

impl std::fmt::Display for MonthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}/{:04}", self.month, self.year)
    }
}

/// Candidate landmark region scanned for the self-reported billing month.
const CANDIDATE_ROWS: usize = 4;
const CANDIDATE_COLS: usize = 3;

fn embedded_dmy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("invalid embedded d/m/y regex")
    })
}

fn exact_my_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2})/(\d{4})$").expect("invalid m/y regex"))
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(20\d{2})\b").expect("invalid year regex"))
}

/// Hebrew month names; March has two accepted spellings.
const MONTH_NAMES: &[(&str, u32)] = &[
    ("ינואר", 1),
    ("פברואר", 2),
    ("מרץ", 3),
    ("מארס", 3),
    ("אפריל", 4),
    ("מאי", 5),
    ("יוני", 6),
    ("יולי", 7),
    ("אוגוסט", 8),
    ("ספטמבר", 9),
    ("אוקטובר", 10),
    ("נובמבר", 11),
    ("דצמבר", 12),
];

fn from_embedded_date(text: &str) -> Option<MonthKey> {
    let caps = embedded_dmy_re().captures(text)?;
    // Day token discarded; only MM/YYYY is kept.
    let month = caps.get(2)?.as_str().parse::<u32>().ok()?;
    let year = caps.get(3)?.as_str().parse::<i32>().ok()?;
    MonthKey::new(year, month)
}

fn from_exact_month_year(text: &str) -> Option<MonthKey> {
    let caps = exact_my_re().captures(text.trim())?;
    let month = caps.get(1)?.as_str().parse::<u32>().ok()?;
    let year = caps.get(2)?.as_str().parse::<i32>().ok()?;
    MonthKey::new(year, month)
}

fn from_month_name(text: &str) -> Option<MonthKey> {
    let month = MONTH_NAMES
        .iter()
        .find(|(name, _)| text.contains(name))
        .map(|(_, m)| *m)?;
    let year = year_re()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i32>().ok())?;
    MonthKey::new(year, month)
}

/// Extracts the statement's self-reported billing month from the candidate
/// top-left cells, rule by rule: an embedded DD/MM/YYYY token, an exact
/// MM/YYYY token, then a month name paired with a 4-digit year.
pub fn extract_billing_month(grid: &Grid) -> Option<MonthKey> {
    let rules: [fn(&str) -> Option<MonthKey>; 3] =
        [from_embedded_date, from_exact_month_year, from_month_name];
    for rule in rules {
        for row in 0..CANDIDATE_ROWS {
            for col in 0..CANDIDATE_COLS {
                let text = grid.display_at(row, col);
                if text.is_empty() {
                    continue;
                }
                if let Some(key) = rule(&text) {
                    return Some(key);
                }
            }
        }
    }
    None
}

/// The billing month printed on a statement covers the prior calendar
/// month's charges, so the accounting month is always one month back. This
/// is a deliberate business convention; callers must not undo it.
pub fn extract_assigned_month(grid: &Grid) -> Option<MonthKey> {
    extract_billing_month(grid).map(|key| key.shifted_back())
}
