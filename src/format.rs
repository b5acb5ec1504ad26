use serde::Serialize;

use crate::error::{ImportError, Result};
use crate::headers::{normalize_header, FieldRole, HeaderMap};
use crate::sheet::Grid;

/// Known institutional templates, resolved once per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementFormat {
    BankCurrent,
    BankLegacy,
    Isracard,
    Max,
    Cal,
}

impl StatementFormat {
    pub fn is_bank(self) -> bool {
        matches!(self, StatementFormat::BankCurrent | StatementFormat::BankLegacy)
    }

    /// First row of the header scan. The legacy bank layout has one fewer
    /// preamble row, so its scan starts one row earlier.
    pub fn header_scan_start(self) -> usize {
        match self {
            StatementFormat::BankCurrent => 2,
            StatementFormat::BankLegacy => 1,
            _ => 0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StatementFormat::BankCurrent => "bank (current layout)",
            StatementFormat::BankLegacy => "bank (legacy layout)",
            StatementFormat::Isracard => "isracard",
            StatementFormat::Max => "max",
            StatementFormat::Cal => "cal",
        }
    }
}

/// Landmark row of bank exports: the current layout carries the account
/// number and the issue date in one metadata row above the preamble.
pub const BANK_LANDMARK_ROW: usize = 1;

const ACCOUNT_MARKER: &str = "מספר חשבון";
const ISSUE_DATE_MARKER: &str = "תאריך הפקה";

fn landmark_row_text(grid: &Grid) -> String {
    grid.row(BANK_LANDMARK_ROW)
        .iter()
        .map(|c| c.display())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Bank-file detection. Both markers at the landmark row select the current
/// template; their absence falls back to the legacy template. A file with no
/// populated content at all is not a bank export and aborts the upload.
pub fn detect_bank_format(grid: &Grid) -> Result<StatementFormat> {
    if grid.is_effectively_empty() {
        return Err(ImportError::FormatDetection(
            "the workbook has no populated cells; expected a bank statement export".to_string(),
        ));
    }

    let landmark = landmark_row_text(grid);
    if landmark.contains(ACCOUNT_MARKER) && landmark.contains(ISSUE_DATE_MARKER) {
        Ok(StatementFormat::BankCurrent)
    } else {
        Ok(StatementFormat::BankLegacy)
    }
}

/// Card files carry no landmark; the issuer is inferred from which synonym
/// phrase the header classifier matched for the transaction-date column, so
/// detection and classification collapse into the same pass.
pub fn infer_card_format(header_cells: &[crate::sheet::Cell], map: &HeaderMap) -> StatementFormat {
    let date_col = map
        .iter()
        .find(|(_, role)| **role == FieldRole::TransactionDate)
        .map(|(col, _)| *col);

    let Some(col) = date_col else {
        return StatementFormat::Max;
    };
    let label = header_cells
        .get(col)
        .map(|c| normalize_header(&c.display()))
        .unwrap_or_default();

    if label.contains("רכישה") {
        StatementFormat::Isracard
    } else if label.contains("העסקה") {
        StatementFormat::Cal
    } else {
        StatementFormat::Max
    }
}
