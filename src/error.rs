use serde_json::json;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    BadParams(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("class {class_id} has no active students")]
    EmptyRoster { class_id: String },

    #[error("grade {grade_id} has value {value} above max_value {max_value}")]
    GradeOutOfRange {
        grade_id: String,
        value: f64,
        max_value: f64,
    },

    #[error("grade {grade_id} is invalid: {reason}")]
    InvalidGrade { grade_id: String, reason: String },

    #[error("report card generation exceeded {timeout_ms}ms")]
    GenerationTimeout { timeout_ms: u64 },

    #[error("database is busy: {0}")]
    Busy(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("insert into {table} failed: {message}")]
    Insert { table: &'static str, message: String },

    #[error("transaction failed: {0}")]
    Tx(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BadParams(_) => "bad_params",
            EngineError::NotFound(_) => "not_found",
            EngineError::EmptyRoster { .. } => "empty_roster",
            EngineError::GradeOutOfRange { .. } => "grade_out_of_range",
            EngineError::InvalidGrade { .. } => "invalid_grade",
            EngineError::GenerationTimeout { .. } => "generation_timeout",
            EngineError::Busy(_) => "db_busy",
            EngineError::Query(_) => "db_query_failed",
            EngineError::Insert { .. } => "db_insert_failed",
            EngineError::Tx(_) => "db_tx_failed",
            EngineError::Commit(_) => "db_commit_failed",
            EngineError::Config(_) => "config_invalid",
            EngineError::Internal(_) => "internal_error",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            EngineError::EmptyRoster { class_id } => Some(json!({ "classId": class_id })),
            EngineError::GradeOutOfRange {
                grade_id,
                value,
                max_value,
            } => Some(json!({
                "gradeId": grade_id,
                "value": value,
                "maxValue": max_value,
            })),
            EngineError::InvalidGrade { grade_id, .. } => Some(json!({ "gradeId": grade_id })),
            EngineError::Insert { table, .. } => Some(json!({ "table": table })),
            _ => None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        EngineError::BadParams(message.into())
    }

    pub fn insert(table: &'static str, e: rusqlite::Error) -> Self {
        EngineError::Insert {
            table,
            message: e.to_string(),
        }
    }
}

/// Read-path mapping. Lock contention surfaces as `db_busy` so callers can retry.
pub fn query_err(e: rusqlite::Error) -> EngineError {
    if is_busy(&e) {
        return EngineError::Busy(e.to_string());
    }
    EngineError::Query(e.to_string())
}

pub fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
