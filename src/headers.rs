use std::collections::HashMap;

use serde::Serialize;

use crate::error::{ImportError, Result};
use crate::sheet::Grid;

/// Canonical role a statement column can play. Card exports and bank exports
/// share the enum; their synonym tables differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    TransactionDate,
    BillingDate,
    MerchantName,
    Amount,
    Currency,
    CardNumber,
    Reference,
    Branch,
    Notes,
    Installments,
    Balance,
    ValueDate,
    Debit,
    Credit,
    Description,
    ActionType,
    ForBenefitOf,
    For,
}

/// Column index to role. Resolved once per file from the header row.
pub type HeaderMap = HashMap<usize, FieldRole>;

#[derive(Debug)]
pub struct HeaderAlias {
    pub role: FieldRole,
    pub aliases: &'static [&'static str],
}

/// Header vocabulary of the supported card issuers. Issuer templates differ
/// only in these phrases, not in layout, so adding a template is a table
/// edit, not a control-flow change.
pub const CARD_HEADER_ALIASES: &[HeaderAlias] = &[
    HeaderAlias {
        role: FieldRole::TransactionDate,
        aliases: &["תאריך עסקה", "תאריך העסקה", "תאריך רכישה", "תאריך"],
    },
    HeaderAlias {
        role: FieldRole::BillingDate,
        aliases: &["תאריך חיוב", "מועד חיוב"],
    },
    HeaderAlias {
        role: FieldRole::MerchantName,
        aliases: &["שם בית עסק", "שם בית העסק", "בית עסק"],
    },
    HeaderAlias {
        role: FieldRole::Amount,
        aliases: &["סכום חיוב", "סכום חיוב ₪", "סכום לחיוב", "סכום"],
    },
    HeaderAlias {
        role: FieldRole::Currency,
        aliases: &["מטבע", "מטבע חיוב", "מטבע עסקה"],
    },
    HeaderAlias {
        role: FieldRole::CardNumber,
        aliases: &[
            "מספר כרטיס",
            "4 ספרות אחרונות",
            "4 ספרות אחרונות של כרטיס האשראי",
        ],
    },
    HeaderAlias {
        role: FieldRole::Reference,
        aliases: &["אסמכתא", "מספר אסמכתא", "מס' אסמכתא", "שובר"],
    },
    HeaderAlias {
        role: FieldRole::Branch,
        aliases: &["ענף", "סניף"],
    },
    HeaderAlias {
        role: FieldRole::Notes,
        aliases: &["הערות", "פירוט נוסף", "מידע נוסף"],
    },
    HeaderAlias {
        role: FieldRole::Installments,
        aliases: &["תשלומים", "מספר תשלומים", "מס' תשלומים"],
    },
    HeaderAlias {
        role: FieldRole::ActionType,
        aliases: &["סוג עסקה", "סוג פעולה"],
    },
];

/// Bank-statement header vocabulary, both the current and the legacy layout.
/// The two description-column labels deliberately resolve to one role.
pub const BANK_HEADER_ALIASES: &[HeaderAlias] = &[
    HeaderAlias {
        role: FieldRole::TransactionDate,
        aliases: &["תאריך", "תאריך פעולה"],
    },
    HeaderAlias {
        role: FieldRole::ValueDate,
        aliases: &["תאריך ערך", "יום ערך"],
    },
    HeaderAlias {
        role: FieldRole::Description,
        aliases: &["תיאור", "תאור הפעולה", "תיאור פעולה"],
    },
    HeaderAlias {
        role: FieldRole::ActionType,
        aliases: &["סוג פעולה", "סוג תנועה"],
    },
    HeaderAlias {
        role: FieldRole::Reference,
        aliases: &["אסמכתא", "מספר אסמכתא", "מס' אסמכתא"],
    },
    HeaderAlias {
        role: FieldRole::Debit,
        aliases: &["חובה", "בחובה", "חובה ₪"],
    },
    HeaderAlias {
        role: FieldRole::Credit,
        aliases: &["זכות", "בזכות", "זכות ₪"],
    },
    HeaderAlias {
        role: FieldRole::Balance,
        aliases: &["יתרה", "יתרה ₪", "יתרה בש\"ח"],
    },
    HeaderAlias {
        role: FieldRole::ForBenefitOf,
        aliases: &["לזכות"],
    },
    HeaderAlias {
        role: FieldRole::For,
        aliases: &["עבור"],
    },
];

/// A marker group the header row must satisfy; any listed role counts.
#[derive(Debug)]
pub struct MandatoryMarker {
    pub label: &'static str,
    pub any_of: &'static [FieldRole],
}

pub const CARD_MANDATORY: &[MandatoryMarker] = &[
    MandatoryMarker {
        label: "transaction date",
        any_of: &[FieldRole::TransactionDate],
    },
    MandatoryMarker {
        label: "merchant/description",
        any_of: &[FieldRole::MerchantName, FieldRole::Description],
    },
    MandatoryMarker {
        label: "amount",
        any_of: &[FieldRole::Amount],
    },
];

pub const BANK_MANDATORY: &[MandatoryMarker] = &[
    MandatoryMarker {
        label: "date",
        any_of: &[FieldRole::TransactionDate],
    },
    MandatoryMarker {
        label: "description",
        any_of: &[FieldRole::Description],
    },
    MandatoryMarker {
        label: "debit/credit amount",
        any_of: &[FieldRole::Debit, FieldRole::Credit],
    },
];

pub const CARD_SCAN_WINDOW: usize = 15;
pub const BANK_SCAN_WINDOW: usize = 10;

/// Rows qualifying as headers need this many populated cells, which keeps
/// data rows that echo header vocabulary from being mistaken for headers.
const MIN_POPULATED_HEADER_CELLS: usize = 4;

/// Collapses CR/LF and repeated whitespace, trims, and case-folds. Exported
/// spreadsheets routinely wrap header phrases across lines.
pub fn normalize_header(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_start_matches('\u{feff}')
        .to_lowercase()
}

/// Classifies one header cell against a synonym table.
pub fn classify(text: &str, table: &[HeaderAlias]) -> Option<FieldRole> {
    let key = normalize_header(text);
    if key.is_empty() {
        return None;
    }
    for entry in table {
        if entry.aliases.iter().any(|alias| normalize_header(alias) == key) {
            return Some(entry.role);
        }
    }
    None
}

fn map_row(grid: &Grid, row: usize, table: &[HeaderAlias]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (col, cell) in grid.row(row).iter().enumerate() {
        if let Some(role) = classify(&cell.display(), table) {
            map.entry(col).or_insert(role);
        }
    }
    map
}

fn missing_markers(map: &HeaderMap, mandatory: &[MandatoryMarker]) -> Vec<&'static str> {
    mandatory
        .iter()
        .filter(|marker| !marker.any_of.iter().any(|role| map.values().any(|r| r == role)))
        .map(|marker| marker.label)
        .collect()
}

/// Finds the header row within the scan window. A row qualifies only when
/// every mandatory marker group is present AND at least
/// [`MIN_POPULATED_HEADER_CELLS`] cells are populated. On failure the error
/// names the markers missing from the closest candidate row.
pub fn find_header_row(
    grid: &Grid,
    table: &[HeaderAlias],
    mandatory: &[MandatoryMarker],
    window: usize,
    start_row: usize,
) -> Result<(usize, HeaderMap)> {
    let mut best_missing: Option<Vec<&'static str>> = None;

    for row in start_row..(start_row + window).min(grid.height()) {
        if grid.populated_in_row(row) < MIN_POPULATED_HEADER_CELLS {
            continue;
        }
        let map = map_row(grid, row, table);
        let missing = missing_markers(&map, mandatory);
        if missing.is_empty() {
            return Ok((row, map));
        }
        let better = match &best_missing {
            Some(current) => missing.len() < current.len(),
            None => true,
        };
        if better && !map.is_empty() {
            best_missing = Some(missing);
        }
    }

    let missing = best_missing
        .unwrap_or_else(|| mandatory.iter().map(|m| m.label).collect())
        .join(", ");
    Err(ImportError::HeaderNotFound { window, missing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::Cell;

    fn text_row(cells: &[&str]) -> Vec<Cell> {
        cells
            .iter()
            .map(|s| {
                if s.is_empty() {
                    Cell::Empty
                } else {
                    Cell::Text(s.to_string())
                }
            })
            .collect()
    }

    #[test]
    fn issuer_variants_map_to_one_role() {
        for label in ["תאריך עסקה", "תאריך העסקה", "תאריך רכישה"] {
            assert_eq!(
                classify(label, CARD_HEADER_ALIASES),
                Some(FieldRole::TransactionDate)
            );
        }
        for label in ["תיאור", "תאור הפעולה"] {
            assert_eq!(
                classify(label, BANK_HEADER_ALIASES),
                Some(FieldRole::Description)
            );
        }
        assert_eq!(classify("לא קיים", CARD_HEADER_ALIASES), None);
    }

    #[test]
    fn normalization_collapses_line_breaks_and_whitespace() {
        assert_eq!(
            classify("שם\r\nבית   עסק", CARD_HEADER_ALIASES),
            Some(FieldRole::MerchantName)
        );
        assert_eq!(normalize_header("  A\nB  "), "a b");
    }

    #[test]
    fn header_row_is_found_past_preamble_rows() {
        let grid = Grid::from_rows(vec![
            text_row(&["פירוט עסקאות לחודש 11/2025"]),
            text_row(&[]),
            text_row(&["תאריך עסקה", "שם בית עסק", "סכום חיוב", "מטבע", "הערות"]),
            text_row(&["01/11/2025", "סופר", "100.00", "₪", ""]),
        ]);
        let (row, map) = find_header_row(
            &grid,
            CARD_HEADER_ALIASES,
            CARD_MANDATORY,
            CARD_SCAN_WINDOW,
            0,
        )
        .expect("header row");
        assert_eq!(row, 2);
        assert_eq!(map.get(&0), Some(&FieldRole::TransactionDate));
        assert_eq!(map.get(&2), Some(&FieldRole::Amount));
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn sparse_rows_never_qualify_as_headers() {
        // All three mandatory markers, but only three populated cells.
        let grid = Grid::from_rows(vec![text_row(&[
            "תאריך עסקה",
            "שם בית עסק",
            "סכום חיוב",
        ])]);
        assert!(find_header_row(
            &grid,
            CARD_HEADER_ALIASES,
            CARD_MANDATORY,
            CARD_SCAN_WINDOW,
            0
        )
        .is_err());
    }

    #[test]
    fn missing_amount_marker_is_named_in_the_error() {
        let grid = Grid::from_rows(vec![text_row(&[
            "תאריך עסקה",
            "שם בית עסק",
            "מטבע",
            "הערות",
        ])]);
        let err = find_header_row(
            &grid,
            CARD_HEADER_ALIASES,
            CARD_MANDATORY,
            CARD_SCAN_WINDOW,
            0,
        )
        .expect_err("should fail");
        match err {
            ImportError::HeaderNotFound { missing, window } => {
                assert!(missing.contains("amount"), "missing: {missing}");
                assert!(!missing.contains("date"), "missing: {missing}");
                assert_eq!(window, CARD_SCAN_WINDOW);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bank_mandatory_accepts_either_debit_or_credit() {
        let grid = Grid::from_rows(vec![text_row(&[
            "תאריך",
            "תיאור",
            "זכות",
            "יתרה",
        ])]);
        let (_, map) = find_header_row(
            &grid,
            BANK_HEADER_ALIASES,
            BANK_MANDATORY,
            BANK_SCAN_WINDOW,
            0,
        )
        .expect("credit-only header row");
        assert!(map.values().any(|r| *r == FieldRole::Credit));
    }
}
