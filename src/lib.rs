//! Statement ingestion and reconciliation engine for the Shekelbook
//! household ledger.
//!
//! Uploaded card and bank statement exports (CSV, XLS, XLSX) are normalized
//! into canonical transaction records and reconciled into SQLite with
//! replace-don't-append semantics: re-importing a statement replaces its
//! month partition instead of duplicating it.

pub mod bank_import;
pub mod card_import;
pub mod dates;
pub mod error;
pub mod format;
pub mod headers;
pub mod month;
pub mod records;
pub mod sheet;
pub mod store;

pub use bank_import::{import_bank_upload, parse_bank_file, BankImportOutcome, BankUpload};
pub use card_import::{
    import_card_upload, preview_card_upload, CardBatch, CardImportOutcome, CardUpload,
};
pub use error::{ImportError, Result};
pub use format::StatementFormat;
pub use month::MonthKey;
pub use records::{BankStatement, BankStatementRow, CanonicalRecord, Currency, SkipReason, TxnKind};
pub use store::{
    ImportJob, JobKind, JobStatus, MemoryStore, PersistedRecord, ReplacementKey, SqliteStore,
    TransactionStore,
};
