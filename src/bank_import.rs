use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::card_import::{sha1_hex, SkippedRow, SKIP_SAMPLE_CAP};
use crate::dates::{parse_cell_date, parse_date_text};
use crate::error::{ImportError, Result};
use crate::format::{detect_bank_format, StatementFormat, BANK_LANDMARK_ROW};
use crate::headers::{
    find_header_row, FieldRole, HeaderMap, BANK_HEADER_ALIASES, BANK_MANDATORY, BANK_SCAN_WINDOW,
};
use crate::records::{cell_amount_to_cents, BankStatement, BankStatementRow, SkipReason};
use crate::sheet::{extension_of, load_grid, Cell, Grid};
use crate::store::{ImportJob, JobKind, JobStatus, TransactionStore};

#[derive(Debug, Clone)]
pub struct BankUpload {
    pub user_id: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct BankBatch {
    pub format: StatementFormat,
    pub statement: BankStatement,
    pub total_parsed: usize,
    pub skipped_count: usize,
    pub skipped_samples: Vec<SkippedRow>,
}

#[derive(Debug, Serialize)]
pub struct BankImportOutcome {
    pub job_id: String,
    pub format: StatementFormat,
    pub account_number: Option<String>,
    pub total_parsed: usize,
    pub total_created: usize,
    pub skipped_count: usize,
    pub skipped_samples: Vec<SkippedRow>,
}

fn account_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"מספר חשבון[:\s]*([\d][\d\-/]*)").expect("invalid account-number regex")
    })
}

fn issue_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"תאריך הפקה[:\s]*(\d{1,2}[./]\d{1,2}[./]\d{2,4})")
            .expect("invalid issue-date regex")
    })
}

/// Statement metadata only the current layout carries, read from the
/// landmark row. Either field may be absent; both are informational.
fn landmark_metadata(grid: &Grid) -> (Option<String>, Option<chrono::NaiveDate>) {
    let text = grid
        .row(BANK_LANDMARK_ROW)
        .iter()
        .map(Cell::display)
        .collect::<Vec<_>>()
        .join(" ");
    let account = account_number_re()
        .captures(&text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    let issued_on = issue_date_re()
        .captures(&text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_date_text(m.as_str()));
    (account, issued_on)
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

fn amount_for(row: &[Cell], map: &HeaderMap, role: FieldRole) -> Option<i64> {
    cell_for(row, map, role).and_then(cell_amount_to_cents)
}

fn parse_bank_row(
    row: &[Cell],
    row_idx: usize,
    map: &HeaderMap,
) -> Result<std::result::Result<BankStatementRow, SkipReason>> {
    let Some(date_cell) = cell_for(row, map, FieldRole::TransactionDate) else {
        return Ok(Err(SkipReason::NoDate));
    };
    let date = parse_cell_date(date_cell).ok_or_else(|| ImportError::DateParse {
        value: date_cell.display(),
        column: "date".to_string(),
        row: row_idx,
    })?;

    let Some(description) = display_for(row, map, FieldRole::Description) else {
        return Ok(Err(SkipReason::NoMerchant));
    };

    let debit_cents = amount_for(row, map, FieldRole::Debit).unwrap_or(0).abs();
    let credit_cents = amount_for(row, map, FieldRole::Credit).unwrap_or(0).abs();
    if debit_cents == 0 && credit_cents == 0 {
        return Ok(Err(SkipReason::ZeroOrInvalidAmount));
    }

    Ok(Ok(BankStatementRow {
        date,
        // Value date is cosmetic; an unparsable one is simply dropped.
        value_date: cell_for(row, map, FieldRole::ValueDate).and_then(parse_cell_date),
        description,
        action_type: display_for(row, map, FieldRole::ActionType),
        reference: display_for(row, map, FieldRole::Reference),
        debit_cents,
        credit_cents,
        balance_cents: amount_for(row, map, FieldRole::Balance),
        for_benefit_of: display_for(row, map, FieldRole::ForBenefitOf),
        for_detail: display_for(row, map, FieldRole::For),
    }))
}

pub fn parse_bank_grid(grid: &Grid) -> Result<BankBatch> {
    let format = detect_bank_format(grid)?;
    let (account_number, issued_on) = if format == StatementFormat::BankCurrent {
        landmark_metadata(grid)
    } else {
        (None, None)
    };

    let (header_row, map) = find_header_row(
        grid,
        BANK_HEADER_ALIASES,
        BANK_MANDATORY,
        BANK_SCAN_WINDOW,
        format.header_scan_start(),
    )?;

    let mut rows = Vec::new();
    let mut total_parsed = 0usize;
    let mut skipped_count = 0usize;
    let mut skipped_samples = Vec::new();

    for row_idx in (header_row + 1)..grid.height() {
        if grid.populated_in_row(row_idx) == 0 {
            continue;
        }
        total_parsed += 1;
        match parse_bank_row(grid.row(row_idx), row_idx, &map)? {
            Ok(row) => rows.push(row),
            Err(reason) => {
                skipped_count += 1;
                if skipped_samples.len() < SKIP_SAMPLE_CAP {
                    skipped_samples.push(SkippedRow {
                        row: row_idx,
                        reason,
                    });
                }
                tracing::debug!(row = row_idx, %reason, "skipped bank row");
            }
        }
    }

    tracing::info!(
        format = format.label(),
        account = account_number.as_deref().unwrap_or("-"),
        total_parsed,
        created = rows.len(),
        skipped = skipped_count,
        "parsed bank statement"
    );

    Ok(BankBatch {
        format,
        statement: BankStatement {
            account_number,
            issued_on,
            rows,
        },
        total_parsed,
        skipped_count,
        skipped_samples,
    })
}

/// Bank exports arrive only as workbooks; CSV uploads are rejected up front.
pub fn parse_bank_file(file_name: &str, bytes: &[u8]) -> Result<BankBatch> {
    let ext = extension_of(file_name)?;
    if ext == "csv" {
        return Err(ImportError::UnsupportedExtension(
            "csv (bank statements must be .xls or .xlsx exports)".to_string(),
        ));
    }
    let grid = load_grid(file_name, bytes)?;
    parse_bank_grid(&grid)
}

/// Replaces the user's bank statement wholesale and records the attempt in
/// the job ledger. Only the most recent upload is ever kept.
pub fn import_bank_upload(
    store: &mut impl TransactionStore,
    upload: &BankUpload,
) -> Result<BankImportOutcome> {
    let job_id = Uuid::new_v4().to_string();
    let source_sha1 = sha1_hex(&upload.bytes);
    let started_at = Utc::now();

    let result = parse_bank_file(&upload.file_name, &upload.bytes).and_then(|batch| {
        let created = store.replace_bank_statement(&upload.user_id, &batch.statement)?;
        Ok(BankImportOutcome {
            job_id: job_id.clone(),
            format: batch.format,
            account_number: batch.statement.account_number.clone(),
            total_parsed: batch.total_parsed,
            total_created: created,
            skipped_count: batch.skipped_count,
            skipped_samples: batch.skipped_samples,
        })
    });

    let (status, counts, error_message) = match &result {
        Ok(outcome) => (
            JobStatus::Completed,
            (outcome.total_parsed, outcome.total_created, outcome.skipped_count),
            None,
        ),
        Err(err) => (JobStatus::Failed, (0, 0, 0), Some(err.to_string())),
    };
    store.record_job(&ImportJob {
        id: job_id,
        user_id: upload.user_id.clone(),
        kind: JobKind::Bank,
        source_file: upload.file_name.clone(),
        source_sha1,
        status,
        started_at,
        finished_at: Utc::now(),
        total_parsed: counts.0,
        total_created: counts.1,
        skipped_count: counts.2,
        error_message,
    })?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

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

    fn current_layout_grid() -> Grid {
        Grid::from_rows(vec![
            text_row(&["תנועות בחשבון"]),
            text_row(&["מספר חשבון: 123-456789", "תאריך הפקה: 01/12/2025"]),
            text_row(&["תאריך", "תיאור", "אסמכתא", "חובה", "זכות", "יתרה"]),
            text_row(&["03/11/2025", "העברה לחשבון", "771", "250.00", "", "8,500.00"]),
            vec![
                Cell::Number(45_964.0), // 2025-11-03 as a serial
                Cell::Text("משכורת".to_string()),
                Cell::Text("772".to_string()),
                Cell::Empty,
                Cell::Text("12,000.00".to_string()),
                Cell::Text("20,500.00".to_string()),
            ],
            text_row(&["04/11/2025", "", "773", "10.00", "", ""]),
            text_row(&["", "סה\"כ", "", "", "", "20,490.00"]),
        ])
    }

    #[test]
    fn current_layout_parses_metadata_and_rows() {
        let batch = parse_bank_grid(&current_layout_grid()).expect("parse");
        assert_eq!(batch.format, StatementFormat::BankCurrent);
        assert_eq!(
            batch.statement.account_number.as_deref(),
            Some("123-456789")
        );
        assert_eq!(batch.statement.issued_on, Some(ymd(2025, 12, 1)));

        assert_eq!(batch.total_parsed, 4);
        assert_eq!(batch.statement.rows.len(), 2);
        assert_eq!(batch.skipped_count, 2);

        let transfer = &batch.statement.rows[0];
        assert_eq!(transfer.date, ymd(2025, 11, 3));
        assert_eq!(transfer.debit_cents, 25_000);
        assert_eq!(transfer.credit_cents, 0);
        assert_eq!(transfer.balance_cents, Some(850_000));

        let salary = &batch.statement.rows[1];
        assert_eq!(salary.date, ymd(2025, 11, 3));
        assert_eq!(salary.credit_cents, 1_200_000);
        assert_eq!(salary.description, "משכורת");
    }

    #[test]
    fn legacy_layout_is_detected_and_scanned_earlier() {
        let grid = Grid::from_rows(vec![
            text_row(&["תנועות אחרונות"]),
            text_row(&["תאריך", "תיאור", "אסמכתא", "חובה", "זכות", "יתרה"]),
            text_row(&["03/11/2025", "עמלה", "1", "15.00", "", "100.00"]),
        ]);
        let batch = parse_bank_grid(&grid).expect("parse");
        assert_eq!(batch.format, StatementFormat::BankLegacy);
        assert_eq!(batch.statement.account_number, None);
        assert_eq!(batch.statement.rows.len(), 1);
    }

    #[test]
    fn summary_rows_without_a_date_are_skipped() {
        let batch = parse_bank_grid(&current_layout_grid()).expect("parse");
        let reasons: Vec<SkipReason> =
            batch.skipped_samples.iter().map(|s| s.reason).collect();
        assert!(reasons.contains(&SkipReason::NoDate));
        assert!(reasons.contains(&SkipReason::NoMerchant));
    }

    #[test]
    fn unparsable_date_in_a_data_row_is_fatal() {
        let grid = Grid::from_rows(vec![
            text_row(&["תנועות"]),
            text_row(&["תאריך", "תיאור", "אסמכתא", "חובה", "זכות", "יתרה"]),
            text_row(&["לא תאריך", "עמלה", "1", "15.00", "", ""]),
        ]);
        assert!(matches!(
            parse_bank_grid(&grid),
            Err(ImportError::DateParse { .. })
        ));
    }

    #[test]
    fn display_only_columns_are_carried_but_not_required() {
        let grid = Grid::from_rows(vec![
            text_row(&["תנועות"]),
            text_row(&["תאריך", "תיאור", "לזכות", "עבור", "חובה", "זכות"]),
            text_row(&["03/11/2025", "העברה", "ועד הבית", "נובמבר", "300.00", ""]),
        ]);
        let batch = parse_bank_grid(&grid).expect("parse");
        let row = &batch.statement.rows[0];
        assert_eq!(row.for_benefit_of.as_deref(), Some("ועד הבית"));
        assert_eq!(row.for_detail.as_deref(), Some("נובמבר"));
    }

    #[test]
    fn csv_uploads_are_rejected_for_bank_statements() {
        assert!(matches!(
            parse_bank_file("bank.csv", b"whatever"),
            Err(ImportError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            parse_bank_file("bank.pdf", b"whatever"),
            Err(ImportError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn failed_bank_import_still_records_a_job() {
        use crate::store::MemoryStore;
        let mut store = MemoryStore::new();
        let upload = BankUpload {
            user_id: "u1".to_string(),
            file_name: "bank.csv".to_string(),
            bytes: b"x".to_vec(),
        };
        assert!(import_bank_upload(&mut store, &upload).is_err());
        assert!(store.statement_for("u1").is_none());
        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Bank);
        assert_eq!(jobs[0].status, JobStatus::Failed);
    }
}
