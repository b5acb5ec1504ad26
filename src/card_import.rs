use std::collections::BTreeSet;

use chrono::Utc;
use serde::Serialize;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::error::{ImportError, Result};
use crate::format::{infer_card_format, StatementFormat};
use crate::headers::{
    find_header_row, CARD_HEADER_ALIASES, CARD_MANDATORY, CARD_SCAN_WINDOW,
};
use crate::month::{extract_assigned_month, MonthKey};
use crate::records::{card_from_filename, parse_card_row, CanonicalRecord, ParsedRow, SkipReason};
use crate::sheet::{load_grid, Grid};
use crate::store::{
    ImportJob, JobKind, JobStatus, PersistedRecord, ReplacementKey, TransactionStore,
};

/// At most this many skipped-row samples are echoed back to the caller; the
/// totals always cover every skip.
pub const SKIP_SAMPLE_CAP: usize = 20;

#[derive(Debug, Clone)]
pub struct CardUpload {
    pub user_id: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// When set, used verbatim as the accounting month; the one-month-back
    /// billing shift applies only to months read off the statement itself.
    pub month_override: Option<MonthKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub row: usize,
    pub reason: SkipReason,
}

/// The parse result shared by preview and import, so the review screen can
/// never show records that a later import would parse differently.
#[derive(Debug)]
pub struct CardBatch {
    pub format: StatementFormat,
    pub assigned_month: MonthKey,
    pub replacement_card: Option<String>,
    pub records: Vec<CanonicalRecord>,
    pub total_parsed: usize,
    pub skipped_count: usize,
    pub skipped_samples: Vec<SkippedRow>,
}

#[derive(Debug, Serialize)]
pub struct CardImportOutcome {
    pub job_id: String,
    pub format: StatementFormat,
    pub assigned_month: MonthKey,
    pub replacement_card: Option<String>,
    pub total_parsed: usize,
    pub total_created: usize,
    pub skipped_count: usize,
    pub skipped_samples: Vec<SkippedRow>,
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    Sha1::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Resolves the card the batch replaces. The delete scope must cover every
/// row the insert will add back, or a re-upload duplicates records: a card
/// shared uniformly by all rows scopes the replace to that card; any mix of
/// cards (or of card and no-card) widens the key to null, replacing the
/// user's whole month.
fn resolve_batch_card(
    records: &[CanonicalRecord],
    filename_card: Option<&str>,
) -> Option<String> {
    if records.is_empty() {
        return filename_card.map(str::to_string);
    }
    let distinct: BTreeSet<Option<&str>> =
        records.iter().map(|r| r.card_last4.as_deref()).collect();
    if distinct.len() == 1 {
        return distinct.into_iter().next().flatten().map(str::to_string);
    }
    None
}

/// Grid-level card parse. Separated from the byte-level entry point so the
/// row semantics can be tested without authoring workbook files.
pub fn parse_card_grid(
    grid: &Grid,
    file_name: &str,
    month_override: Option<MonthKey>,
) -> Result<CardBatch> {
    let assigned_month = match month_override {
        Some(month) => month,
        None => extract_assigned_month(grid).ok_or(ImportError::MonthYearNotFound)?,
    };

    let (header_row, map) = find_header_row(
        grid,
        CARD_HEADER_ALIASES,
        CARD_MANDATORY,
        CARD_SCAN_WINDOW,
        0,
    )?;
    let format = infer_card_format(grid.row(header_row), &map);
    let filename_card = card_from_filename(file_name);

    let mut records = Vec::new();
    let mut total_parsed = 0usize;
    let mut skipped_count = 0usize;
    let mut skipped_samples = Vec::new();

    for row_idx in (header_row + 1)..grid.height() {
        if grid.populated_in_row(row_idx) == 0 {
            continue;
        }
        total_parsed += 1;
        match parse_card_row(
            grid.row(row_idx),
            row_idx,
            &map,
            assigned_month,
            filename_card.as_deref(),
        )? {
            ParsedRow::Record(record) => records.push(*record),
            ParsedRow::Skipped(reason) => {
                skipped_count += 1;
                if skipped_samples.len() < SKIP_SAMPLE_CAP {
                    skipped_samples.push(SkippedRow {
                        row: row_idx,
                        reason,
                    });
                }
                tracing::debug!(row = row_idx, %reason, "skipped statement row");
            }
        }
    }

    let replacement_card = resolve_batch_card(&records, filename_card.as_deref());
    tracing::info!(
        format = format.label(),
        month = %assigned_month,
        card = replacement_card.as_deref().unwrap_or("-"),
        total_parsed,
        created = records.len(),
        skipped = skipped_count,
        "parsed card statement"
    );

    Ok(CardBatch {
        format,
        assigned_month,
        replacement_card,
        records,
        total_parsed,
        skipped_count,
        skipped_samples,
    })
}

pub fn parse_card_file(upload: &CardUpload) -> Result<CardBatch> {
    let grid = load_grid(&upload.file_name, &upload.bytes)?;
    parse_card_grid(&grid, &upload.file_name, upload.month_override)
}

/// Dry run for the review screen: same parse, nothing persisted, no job
/// ledger entry.
pub fn preview_card_upload(upload: &CardUpload) -> Result<CardBatch> {
    parse_card_file(upload)
}

/// Full import: parse, atomically replace the month partition, and record
/// the attempt in the job ledger whether it succeeded or failed.
pub fn import_card_upload(
    store: &mut impl TransactionStore,
    upload: &CardUpload,
) -> Result<CardImportOutcome> {
    let job_id = Uuid::new_v4().to_string();
    let source_sha1 = sha1_hex(&upload.bytes);
    let started_at = Utc::now();

    let result = run_card_import(store, upload, &job_id);

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
        kind: JobKind::Card,
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

fn run_card_import(
    store: &mut impl TransactionStore,
    upload: &CardUpload,
    job_id: &str,
) -> Result<CardImportOutcome> {
    let batch = parse_card_file(upload)?;
    let key = ReplacementKey {
        user_id: upload.user_id.clone(),
        month: batch.assigned_month,
        card_last4: batch.replacement_card.clone(),
    };
    let persisted: Vec<PersistedRecord> = store.replace_month(&key, &batch.records)?;

    Ok(CardImportOutcome {
        job_id: job_id.to_string(),
        format: batch.format,
        assigned_month: batch.assigned_month,
        replacement_card: batch.replacement_card,
        total_parsed: batch.total_parsed,
        total_created: persisted.len(),
        skipped_count: batch.skipped_count,
        skipped_samples: batch.skipped_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TxnKind;
    use crate::store::MemoryStore;

    const CSV_BODY: &str = "\
פירוט עסקאות לחודש נובמבר 2025,,,
,,,
תאריך עסקה,שם בית עסק,סכום חיוב,הערות
02/11/2025,סופר,120.50,
03/11/2025,החזר ביטוח,-150.00,
,,,
04/11/2025,,50.00,
05/11/2025,ריהוט,600.00,תשלום 2 מתוך 6
";

    fn upload(file_name: &str) -> CardUpload {
        CardUpload {
            user_id: "u1".to_string(),
            file_name: file_name.to_string(),
            bytes: CSV_BODY.as_bytes().to_vec(),
            month_override: None,
        }
    }

    #[test]
    fn end_to_end_csv_import_counts_and_persists() {
        let mut store = MemoryStore::new();
        let outcome =
            import_card_upload(&mut store, &upload("8354_12_2025.csv")).expect("import");

        assert_eq!(outcome.assigned_month, MonthKey { year: 2025, month: 10 });
        assert_eq!(outcome.total_parsed, 4);
        assert_eq!(outcome.total_created, 3);
        assert_eq!(outcome.skipped_count, 1);
        assert_eq!(outcome.skipped_samples.len(), 1);
        assert_eq!(outcome.skipped_samples[0].reason, SkipReason::NoMerchant);
        assert_eq!(outcome.replacement_card.as_deref(), Some("8354"));
        assert_eq!(outcome.format, StatementFormat::Max);

        let records = store.month_records("u1", outcome.assigned_month);
        assert_eq!(records.len(), 3);
        let refund = records
            .iter()
            .find(|r| r.merchant_name == "החזר ביטוח")
            .expect("refund row");
        assert_eq!(refund.kind, TxnKind::Income);
        assert_eq!(refund.amount_cents, 15_000);
        let furniture = records
            .iter()
            .find(|r| r.merchant_name == "ריהוט")
            .expect("furniture row");
        assert_eq!(furniture.installments, Some(6));
        assert!(records
            .iter()
            .all(|r| r.card_last4.as_deref() == Some("8354")));
    }

    #[test]
    fn reimport_replaces_instead_of_duplicating() {
        let mut store = MemoryStore::new();
        let upload = upload("8354_12_2025.csv");
        let first = import_card_upload(&mut store, &upload).expect("first");
        let second = import_card_upload(&mut store, &upload).expect("second");
        assert_eq!(first.total_created, second.total_created);
        assert_eq!(store.month_records("u1", second.assigned_month).len(), 3);
        assert_eq!(store.jobs().len(), 2);
    }

    #[test]
    fn month_override_is_used_verbatim_without_the_billing_shift() {
        let mut store = MemoryStore::new();
        let mut upload = upload("8354_12_2025.csv");
        upload.month_override = MonthKey::new(2026, 2);
        let outcome = import_card_upload(&mut store, &upload).expect("import");
        assert_eq!(outcome.assigned_month, MonthKey { year: 2026, month: 2 });
    }

    #[test]
    fn preview_parses_without_persisting_or_logging_a_job() {
        let store = MemoryStore::new();
        let batch = preview_card_upload(&upload("8354_12_2025.csv")).expect("preview");
        assert_eq!(batch.records.len(), 3);
        assert!(store
            .month_records("u1", batch.assigned_month)
            .is_empty());
        assert!(store.jobs().is_empty());
    }

    #[test]
    fn missing_month_landmark_fails_the_upload() {
        let body = "\
דוח עסקאות,,,
ללא ציון חודש,,,
,,,
,,,
תאריך עסקה,שם בית עסק,סכום חיוב,הערות
02/11/2025,סופר,120.50,
";
        let mut store = MemoryStore::new();
        let upload = CardUpload {
            user_id: "u1".to_string(),
            file_name: "statement.csv".to_string(),
            bytes: body.as_bytes().to_vec(),
            month_override: None,
        };
        let err = import_card_upload(&mut store, &upload).expect_err("no month");
        assert!(matches!(err, ImportError::MonthYearNotFound));

        // Failures still land in the job ledger.
        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error_message.is_some());
    }

    #[test]
    fn rejects_extensions_outside_the_allow_list() {
        let upload = CardUpload {
            user_id: "u1".to_string(),
            file_name: "statement.pdf".to_string(),
            bytes: Vec::new(),
            month_override: None,
        };
        assert!(matches!(
            preview_card_upload(&upload),
            Err(ImportError::UnsupportedExtension(_))
        ));
    }

    const MIXED_CARD_CSV: &str = "\
נובמבר 2025,,,
תאריך עסקה,שם בית עסק,סכום חיוב,מספר כרטיס
02/11/2025,סופר,120.50,1111
03/11/2025,דלק,80.00,2222
";

    #[test]
    fn uniform_row_cards_scope_the_replacement() {
        let single = "\
נובמבר 2025,,,
תאריך עסקה,שם בית עסק,סכום חיוב,מספר כרטיס
02/11/2025,סופר,120.50,1111
03/11/2025,דלק,80.00,1111
";
        let grid = load_grid("x.csv", single.as_bytes()).expect("grid");
        let batch = parse_card_grid(&grid, "statement.csv", None).expect("parse");
        assert_eq!(batch.replacement_card.as_deref(), Some("1111"));
    }

    #[test]
    fn mixed_row_cards_widen_the_replacement_to_the_whole_month() {
        // A filename card must not scope the delete when the rows disagree;
        // nothing stored under 1111/2222 would match a delete keyed on 8354.
        let grid = load_grid("x.csv", MIXED_CARD_CSV.as_bytes()).expect("grid");
        let batch = parse_card_grid(&grid, "8354_12_2025.csv", None).expect("parse");
        assert_eq!(batch.replacement_card, None);
        assert_eq!(batch.records[0].card_last4.as_deref(), Some("1111"));
        assert_eq!(batch.records[1].card_last4.as_deref(), Some("2222"));
    }

    #[test]
    fn mixed_card_reimport_does_not_duplicate() {
        let mut store = MemoryStore::new();
        let upload = CardUpload {
            user_id: "u1".to_string(),
            file_name: "8354_12_2025.csv".to_string(),
            bytes: MIXED_CARD_CSV.as_bytes().to_vec(),
            month_override: None,
        };
        let first = import_card_upload(&mut store, &upload).expect("first");
        let second = import_card_upload(&mut store, &upload).expect("second");
        assert_eq!(first.total_created, 2);
        assert_eq!(second.total_created, 2);
        assert_eq!(store.month_records("u1", second.assigned_month).len(), 2);
    }

    #[test]
    fn partially_carded_reimport_does_not_duplicate() {
        // One row carries a card, the other none, and the filename offers
        // nothing; the batch must still replace the whole month on re-upload.
        let body = "\
נובמבר 2025,,,
תאריך עסקה,שם בית עסק,סכום חיוב,מספר כרטיס
02/11/2025,סופר,120.50,1111
03/11/2025,דלק,80.00,
";
        let mut store = MemoryStore::new();
        let upload = CardUpload {
            user_id: "u1".to_string(),
            file_name: "statement.csv".to_string(),
            bytes: body.as_bytes().to_vec(),
            month_override: None,
        };
        let first = import_card_upload(&mut store, &upload).expect("first");
        assert_eq!(first.replacement_card, None);
        let second = import_card_upload(&mut store, &upload).expect("second");
        assert_eq!(store.month_records("u1", second.assigned_month).len(), 2);
    }

    #[test]
    fn outcome_serializes_for_the_api_boundary() {
        let mut store = MemoryStore::new();
        let outcome =
            import_card_upload(&mut store, &upload("8354_12_2025.csv")).expect("import");
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["format"], "max");
        assert_eq!(json["assigned_month"]["month"], 10);
        assert_eq!(json["total_created"], 3);
        assert_eq!(json["skipped_samples"][0]["reason"], "no_merchant");
    }

    #[test]
    fn sha1_digest_is_stable_hex() {
        assert_eq!(
            sha1_hex(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
