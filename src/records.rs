use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dates::parse_cell_date;
use crate::error::{ImportError, Result};
use crate::headers::{FieldRole, HeaderMap};
use crate::month::MonthKey;
use crate::sheet::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnKind {
    Income,
    Expense,
}

impl TxnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnKind::Income => "income",
            TxnKind::Expense => "expense",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "ILS")]
    Ils,
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "EUR")]
    Eur,
}

impl Currency {
    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Ils => "ILS",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }

    /// Normalizes an explicit currency-column value. Anything unrecognized
    /// falls back to the shekel default.
    pub fn from_text(text: &str) -> Currency {
        let t = text.trim().to_lowercase();
        if t.contains('$') || t.contains("usd") || t.contains("דולר") {
            Currency::Usd
        } else if t.contains('€') || t.contains("eur") || t.contains("אירו") {
            Currency::Eur
        } else {
            Currency::Ils
        }
    }

    /// Infers a currency from glyphs embedded in a raw amount string.
    pub fn from_amount_glyphs(raw: &str) -> Currency {
        if raw.contains('$') {
            Currency::Usd
        } else if raw.contains('€') {
            Currency::Eur
        } else {
            Currency::Ils
        }
    }
}

/// One normalized statement line, the unit the reconciliation store persists.
/// Invariants: `amount_cents` is strictly positive and `assigned_month`
/// always refers to the first of the month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub transaction_date: NaiveDate,
    pub billing_date: NaiveDate,
    pub assigned_month: MonthKey,
    pub amount_cents: i64,
    pub kind: TxnKind,
    pub merchant_name: String,
    pub currency: Currency,
    pub card_last4: Option<String>,
    pub reference: Option<String>,
    pub branch: Option<String>,
    pub notes: Option<String>,
    pub installments: Option<u32>,
    /// Business flag toggled by the user after import; parsing never sets it.
    pub recurring: bool,
}

/// One parsed bank-statement line. `for_benefit_of` and `for_detail` are
/// display-only columns and are not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BankStatementRow {
    pub date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub description: String,
    pub action_type: Option<String>,
    pub reference: Option<String>,
    pub debit_cents: i64,
    pub credit_cents: i64,
    pub balance_cents: Option<i64>,
    pub for_benefit_of: Option<String>,
    pub for_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BankStatement {
    pub account_number: Option<String>,
    pub issued_on: Option<NaiveDate>,
    pub rows: Vec<BankStatementRow>,
}

/// Why a data row was left out of the batch. Skips are expected and counted,
/// never treated as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoDate,
    NoMerchant,
    ZeroOrInvalidAmount,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::NoDate => "no transaction date",
            SkipReason::NoMerchant => "no merchant or description",
            SkipReason::ZeroOrInvalidAmount => "zero or invalid amount",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
pub enum ParsedRow {
    Record(Box<CanonicalRecord>),
    Skipped(SkipReason),
}

fn installment_note_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"תשלום\s*(\d+)\s*מתוך\s*(\d+)").expect("invalid installment regex")
    })
}

fn ends_with_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:המסתיים ב[-־]?\s*|ending\s+(?:in|with)\s*)(\d{4})")
            .expect("invalid ends-with regex")
    })
}

fn leading_digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4})[_\-. ]").expect("invalid leading-digits regex"))
}

fn brand_digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:isracard|mastercard|visa|amex|ישראכרט|מאסטרקארד|ויזה|מקס|כאל)\D{0,10}(\d{4})",
        )
        .expect("invalid brand-digits regex")
    })
}

fn bare_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\D)(\d{4})(?:\D|$)").expect("invalid bare-token regex"))
}

/// Card-number inference from a filename, tried in order: an explicit
/// "ends with ..." marker, leading four digits before a separator, digits
/// following a known card-brand word, then any bare 4-digit token.
pub fn card_from_filename(file_name: &str) -> Option<String> {
    for re in [
        ends_with_marker_re(),
        leading_digits_re(),
        brand_digits_re(),
        bare_token_re(),
    ] {
        if let Some(caps) = re.captures(file_name) {
            if let Some(m) = caps.get(1) {
                return Some(m.as_str().to_string());
            }
        }
    }
    None
}

/// An explicit card column wins over filename inference; only the rightmost
/// four digits are kept (the column may hold a masked full number).
pub fn card_from_cell(cell: &Cell) -> Option<String> {
    let digits: String = cell.display().chars().filter(char::is_ascii_digit).collect();
    if digits.len() >= 4 {
        Some(digits[digits.len() - 4..].to_string())
    } else {
        None
    }
}

/// Strips currency glyphs and separators, then parses a decimal into cents.
/// The sign is preserved; callers decide what a negative amount means.
pub fn amount_text_to_cents(raw: &str) -> Option<i64> {
    let mut s = raw.trim().to_string();
    for noise in ["₪", "$", "€", "ש\"ח", "שח", "NIS", "ILS", "USD", "EUR"] {
        s = s.replace(noise, "");
    }
    s = s.replace([',', ' ', '\u{a0}'], "");
    if s.is_empty() {
        return None;
    }

    let negative = s.starts_with('-');
    if s.starts_with('-') || s.starts_with('+') {
        s = s[1..].to_string();
    }
    if s.is_empty() {
        return None;
    }

    let parts = s.split('.').collect::<Vec<_>>();
    if parts.len() > 2 {
        return None;
    }
    let int_part = if parts[0].is_empty() { "0" } else { parts[0] };
    if !int_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let frac_part = if parts.len() == 2 { parts[1] } else { "" };
    if !frac_part.chars().all(|c| c.is_ascii_digit()) || frac_part.len() > 2 {
        return None;
    }

    let int_val = int_part.parse::<i64>().ok()?;
    let frac_val = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<i64>().ok()? * 10,
        _ => frac_part.parse::<i64>().ok()?,
    };
    let cents = int_val.checked_mul(100)?.checked_add(frac_val)?;
    Some(if negative { -cents } else { cents })
}

pub fn cell_amount_to_cents(cell: &Cell) -> Option<i64> {
    match cell {
        Cell::Number(n) if n.is_finite() => Some((n * 100.0).round() as i64),
        Cell::Text(s) => amount_text_to_cents(s),
        _ => None,
    }
}

fn cell_for<'a>(row: &'a [Cell], map: &HeaderMap, role: FieldRole) -> Option<&'a Cell> {
    map.iter()
        .find(|(_, r)| **r == role)
        .and_then(|(col, _)| row.get(*col))
        .filter(|c| !c.is_empty())
}

fn display_for(row: &[Cell], map: &HeaderMap, role: FieldRole) -> Option<String> {
    cell_for(row, map, role)
        .map(Cell::display)
        .filter(|s| !s.is_empty())
}

fn explicit_credit_marker(row: &[Cell], map: &HeaderMap) -> bool {
    [FieldRole::ActionType, FieldRole::Notes]
        .into_iter()
        .filter_map(|role| display_for(row, map, role))
        .any(|text| text.contains("זיכוי") || text.contains("החזר"))
}

fn installments_from_row(row: &[Cell], map: &HeaderMap) -> Option<u32> {
    if let Some(text) = display_for(row, map, FieldRole::Installments) {
        let digits: String = text.chars().filter(char::is_ascii_digit).collect();
        if let Ok(n) = digits.parse::<u32>() {
            if n > 0 {
                return Some(n);
            }
        }
    }
    // Free-text "payment X of Y" note; the total Y is kept, the index X is not.
    let notes = display_for(row, map, FieldRole::Notes)?;
    let caps = installment_note_re().captures(&notes)?;
    caps.get(2)?.as_str().parse::<u32>().ok()
}

/// Parses one data row into a [`CanonicalRecord`].
///
/// Rows missing a date, missing a merchant, or carrying a zero/invalid
/// amount are skipped, not failed; the parsed-versus-raw count discrepancy
/// is reported to the caller. A date that is present but unparsable is fatal
/// because the transaction date is an ordering and dedup key.
pub fn parse_card_row(
    row: &[Cell],
    row_idx: usize,
    map: &HeaderMap,
    assigned_month: MonthKey,
    fallback_card: Option<&str>,
) -> Result<ParsedRow> {
    let Some(date_cell) = cell_for(row, map, FieldRole::TransactionDate) else {
        return Ok(ParsedRow::Skipped(SkipReason::NoDate));
    };
    let transaction_date =
        parse_cell_date(date_cell).ok_or_else(|| ImportError::DateParse {
            value: date_cell.display(),
            column: "transaction date".to_string(),
            row: row_idx,
        })?;

    let merchant_name = display_for(row, map, FieldRole::MerchantName)
        .or_else(|| display_for(row, map, FieldRole::Description));
    let Some(merchant_name) = merchant_name else {
        return Ok(ParsedRow::Skipped(SkipReason::NoMerchant));
    };

    let Some(amount_cell) = cell_for(row, map, FieldRole::Amount) else {
        return Ok(ParsedRow::Skipped(SkipReason::ZeroOrInvalidAmount));
    };
    let raw_amount = amount_cell.display();
    let Some(signed_cents) = cell_amount_to_cents(amount_cell).filter(|c| *c != 0) else {
        return Ok(ParsedRow::Skipped(SkipReason::ZeroOrInvalidAmount));
    };

    // A negative raw amount is income no matter what a type column says;
    // explicit type text only disambiguates non-negative values.
    let kind = if signed_cents < 0 {
        TxnKind::Income
    } else if explicit_credit_marker(row, map) {
        TxnKind::Income
    } else {
        TxnKind::Expense
    };

    // Billing date is cosmetic here, so an unparsable value safely defaults
    // to the transaction date instead of failing the row.
    let billing_date = cell_for(row, map, FieldRole::BillingDate)
        .and_then(parse_cell_date)
        .unwrap_or(transaction_date);

    let currency = match display_for(row, map, FieldRole::Currency) {
        Some(text) => Currency::from_text(&text),
        None => Currency::from_amount_glyphs(&raw_amount),
    };

    let card_last4 = cell_for(row, map, FieldRole::CardNumber)
        .and_then(card_from_cell)
        .or_else(|| fallback_card.map(str::to_string));

    Ok(ParsedRow::Record(Box::new(CanonicalRecord {
        transaction_date,
        billing_date,
        assigned_month,
        amount_cents: signed_cents.abs(),
        kind,
        merchant_name,
        currency,
        card_last4,
        reference: display_for(row, map, FieldRole::Reference),
        branch: display_for(row, map, FieldRole::Branch),
        notes: display_for(row, map, FieldRole::Notes),
        installments: installments_from_row(row, map),
        recurring: false,
    })))
}
