use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::Result;
use crate::month::MonthKey;
use crate::records::{BankStatement, CanonicalRecord, Currency, TxnKind};

/// Embedded migrations, applied in order on open. Each entry is recorded in
/// `schema_migrations` so a reopened database only runs what it is missing.
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_init",
    include_str!("../db/migrations/0001_init.sql"),
)];

/// The partition a batch replaces: one user, one accounting month, and
/// optionally one card. A batch with no card replaces the whole month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementKey {
    pub user_id: String,
    pub month: MonthKey,
    pub card_last4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: CanonicalRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Card,
    Bank,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Card => "card",
            JobKind::Bank => "bank",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// One audit-ledger entry per upload attempt, failures included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportJob {
    pub id: String,
    pub user_id: String,
    pub kind: JobKind,
    pub source_file: String,
    pub source_sha1: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_parsed: usize,
    pub total_created: usize,
    pub skipped_count: usize,
    pub error_message: Option<String>,
}

/// Persistence seam between the import pipelines and the database, so the
/// pipelines can be exercised against the in-memory store in tests.
pub trait TransactionStore {
    /// Deletes whatever the key's partition currently holds and inserts the
    /// batch in its place, atomically. Re-importing the same file twice must
    /// leave the partition identical to importing it once.
    fn replace_month(
        &mut self,
        key: &ReplacementKey,
        records: &[CanonicalRecord],
    ) -> Result<Vec<PersistedRecord>>;

    /// Bank statements are replaced wholesale per user; only the most recent
    /// upload is kept. Returns the number of rows stored.
    fn replace_bank_statement(&mut self, user_id: &str, statement: &BankStatement)
        -> Result<usize>;

    fn record_job(&mut self, job: &ImportJob) -> Result<()>;

    fn month_record_count(
        &self,
        user_id: &str,
        month: MonthKey,
        card_last4: Option<&str>,
    ) -> Result<usize>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        apply_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             name TEXT PRIMARY KEY,
             applied_at TEXT NOT NULL DEFAULT (datetime('now'))
         );",
    )?;
    for (name, sql) in MIGRATIONS {
        let applied: Option<String> = conn
            .query_row(
                "SELECT name FROM schema_migrations WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if applied.is_none() {
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_migrations (name) VALUES (?1)",
                params![name],
            )?;
            tracing::info!(migration = name, "applied schema migration");
        }
    }
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedRecord> {
    let kind: String = row.get("kind")?;
    let currency: String = row.get("currency")?;
    let date_col = |name: &str| -> rusqlite::Result<chrono::NaiveDate> {
        let text: String = row.get(name)?;
        chrono::NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    };
    Ok(PersistedRecord {
        id: row.get("id")?,
        record: CanonicalRecord {
            transaction_date: date_col("transaction_date")?,
            billing_date: date_col("billing_date")?,
            assigned_month: MonthKey {
                year: row.get("assigned_year")?,
                month: row.get("assigned_month")?,
            },
            amount_cents: row.get("amount_cents")?,
            kind: if kind == "income" {
                TxnKind::Income
            } else {
                TxnKind::Expense
            },
            merchant_name: row.get("merchant")?,
            currency: match currency.as_str() {
                "USD" => Currency::Usd,
                "EUR" => Currency::Eur,
                _ => Currency::Ils,
            },
            card_last4: row.get("card_last4")?,
            reference: row.get("reference")?,
            branch: row.get("branch")?,
            notes: row.get("notes")?,
            installments: row.get::<_, Option<i64>>("installments")?.map(|n| n as u32),
            recurring: row.get::<_, i64>("recurring")? != 0,
        },
    })
}

impl TransactionStore for SqliteStore {
    fn replace_month(
        &mut self,
        key: &ReplacementKey,
        records: &[CanonicalRecord],
    ) -> Result<Vec<PersistedRecord>> {
        let tx = self.conn.transaction()?;

        let deleted = match &key.card_last4 {
            Some(card) => tx.execute(
                "DELETE FROM transactions
                 WHERE user_id = ?1 AND assigned_year = ?2 AND assigned_month = ?3
                   AND card_last4 = ?4",
                params![key.user_id, key.month.year, key.month.month, card],
            )?,
            None => tx.execute(
                "DELETE FROM transactions
                 WHERE user_id = ?1 AND assigned_year = ?2 AND assigned_month = ?3",
                params![key.user_id, key.month.year, key.month.month],
            )?,
        };

        let mut persisted = Vec::with_capacity(records.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO transactions
                 (user_id, transaction_date, billing_date, assigned_year, assigned_month,
                  amount_cents, kind, merchant, currency, card_last4, reference, branch,
                  notes, installments, recurring)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            for record in records {
                stmt.execute(params![
                    key.user_id,
                    record.transaction_date.format("%Y-%m-%d").to_string(),
                    record.billing_date.format("%Y-%m-%d").to_string(),
                    record.assigned_month.year,
                    record.assigned_month.month,
                    record.amount_cents,
                    record.kind.as_str(),
                    record.merchant_name,
                    record.currency.as_str(),
                    record.card_last4,
                    record.reference,
                    record.branch,
                    record.notes,
                    record.installments.map(|n| n as i64),
                    record.recurring as i64,
                ])?;
                persisted.push(PersistedRecord {
                    id: tx.last_insert_rowid(),
                    record: record.clone(),
                });
            }
        }

        tx.commit()?;
        tracing::debug!(
            user = %key.user_id,
            month = %key.month,
            card = key.card_last4.as_deref().unwrap_or("-"),
            deleted,
            inserted = persisted.len(),
            "replaced month partition"
        );
        Ok(persisted)
    }

    fn replace_bank_statement(
        &mut self,
        user_id: &str,
        statement: &BankStatement,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;

        // Child rows go with the statement via ON DELETE CASCADE.
        tx.execute(
            "DELETE FROM bank_statements WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute(
            "INSERT INTO bank_statements (user_id, account_number, issued_on)
             VALUES (?1, ?2, ?3)",
            params![
                user_id,
                statement.account_number,
                statement
                    .issued_on
                    .map(|d| d.format("%Y-%m-%d").to_string()),
            ],
        )?;
        let statement_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO bank_statement_rows
                 (statement_id, seq, row_date, value_date, description, action_type,
                  reference, debit_cents, credit_cents, balance_cents)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for (seq, row) in statement.rows.iter().enumerate() {
                stmt.execute(params![
                    statement_id,
                    seq as i64,
                    row.date.format("%Y-%m-%d").to_string(),
                    row.value_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    row.description,
                    row.action_type,
                    row.reference,
                    row.debit_cents,
                    row.credit_cents,
                    row.balance_cents,
                ])?;
            }
        }

        tx.commit()?;
        Ok(statement.rows.len())
    }

    fn record_job(&mut self, job: &ImportJob) -> Result<()> {
        self.conn.execute(
            "INSERT INTO import_jobs
             (id, user_id, kind, source_file, source_sha1, status, started_at,
              finished_at, total_parsed, total_created, skipped_count, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.user_id,
                job.kind.as_str(),
                job.source_file,
                job.source_sha1,
                job.status.as_str(),
                job.started_at.to_rfc3339(),
                job.finished_at.to_rfc3339(),
                job.total_parsed as i64,
                job.total_created as i64,
                job.skipped_count as i64,
                job.error_message,
            ],
        )?;
        Ok(())
    }

    fn month_record_count(
        &self,
        user_id: &str,
        month: MonthKey,
        card_last4: Option<&str>,
    ) -> Result<usize> {
        let count: i64 = match card_last4 {
            Some(card) => self.conn.query_row(
                "SELECT COUNT(*) FROM transactions
                 WHERE user_id = ?1 AND assigned_year = ?2 AND assigned_month = ?3
                   AND card_last4 = ?4",
                params![user_id, month.year, month.month, card],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM transactions
                 WHERE user_id = ?1 AND assigned_year = ?2 AND assigned_month = ?3",
                params![user_id, month.year, month.month],
                |row| row.get(0),
            )?,
        };
        Ok(count as usize)
    }
}

impl SqliteStore {
    /// Month listing used by the review screen, ordered by transaction date.
    pub fn month_records(
        &self,
        user_id: &str,
        month: MonthKey,
    ) -> Result<Vec<PersistedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM transactions
             WHERE user_id = ?1 AND assigned_year = ?2 AND assigned_month = ?3
             ORDER BY transaction_date, id",
        )?;
        let rows = stmt.query_map(
            params![user_id, month.year, month.month],
            row_to_record,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    id: i64,
    user_id: String,
    record: CanonicalRecord,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    records: Vec<StoredRecord>,
    statements: HashMap<String, BankStatement>,
    jobs: Vec<ImportJob>,
}

/// In-memory stand-in for [`SqliteStore`], for pipeline tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<ImportJob> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jobs
            .clone()
    }

    pub fn statement_for(&self, user_id: &str) -> Option<BankStatement> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statements
            .get(user_id)
            .cloned()
    }

    pub fn month_records(&self, user_id: &str, month: MonthKey) -> Vec<CanonicalRecord> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .records
            .iter()
            .filter(|r| r.user_id == user_id && r.record.assigned_month == month)
            .map(|r| r.record.clone())
            .collect()
    }
}

fn in_partition(stored: &StoredRecord, key: &ReplacementKey) -> bool {
    stored.user_id == key.user_id
        && stored.record.assigned_month == key.month
        && match &key.card_last4 {
            Some(card) => stored.record.card_last4.as_deref() == Some(card.as_str()),
            None => true,
        }
}

impl TransactionStore for MemoryStore {
    fn replace_month(
        &mut self,
        key: &ReplacementKey,
        records: &[CanonicalRecord],
    ) -> Result<Vec<PersistedRecord>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.records.retain(|r| !in_partition(r, key));
        let mut persisted = Vec::with_capacity(records.len());
        for record in records {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.records.push(StoredRecord {
                id,
                user_id: key.user_id.clone(),
                record: record.clone(),
            });
            persisted.push(PersistedRecord {
                id,
                record: record.clone(),
            });
        }
        Ok(persisted)
    }

    fn replace_bank_statement(
        &mut self,
        user_id: &str,
        statement: &BankStatement,
    ) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .statements
            .insert(user_id.to_string(), statement.clone());
        Ok(statement.rows.len())
    }

    fn record_job(&mut self, job: &ImportJob) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jobs
            .push(job.clone());
        Ok(())
    }

    fn month_record_count(
        &self,
        user_id: &str,
        month: MonthKey,
        card_last4: Option<&str>,
    ) -> Result<usize> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = ReplacementKey {
            user_id: user_id.to_string(),
            month,
            card_last4: card_last4.map(str::to_string),
        };
        Ok(inner.records.iter().filter(|r| in_partition(r, &key)).count())
    }
}
