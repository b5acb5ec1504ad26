use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImportError>;

/// Structural failures abort the whole upload before anything is persisted;
/// `Persistence` is raised only after a transactional rollback, so a failed
/// import never leaves a half-replaced month behind.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unsupported file extension \"{0}\": expected .csv, .xls or .xlsx")]
    UnsupportedExtension(String),

    #[error("could not read the uploaded file: {0}")]
    WorkbookRead(String),

    #[error("could not recognize the statement layout: {0}")]
    FormatDetection(String),

    #[error(
        "no header row found within the first {window} rows; \
         missing column markers: {missing}"
    )]
    HeaderNotFound { window: usize, missing: String },

    #[error(
        "could not determine the billing month: none of the top-left cells \
         contains a DD/MM/YYYY or MM/YYYY token or a month name with a year"
    )]
    MonthYearNotFound,

    #[error("unparsable date \"{value}\" in the {column} column (row {row})")]
    DateParse {
        value: String,
        column: String,
        row: usize,
    },

    #[error("storage failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("{0}")]
    InvalidRequest(String),
}
