use rusqlite::{Connection, OptionalExtension};

use crate::error::{query_err, EngineError, EngineResult};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};

pub type DbHandler = fn(&Connection, &serde_json::Value) -> EngineResult<serde_json::Value>;

/// Runs `f` against the open workspace and wraps its result in a response.
pub fn with_db<F>(state: &AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> EngineResult<serde_json::Value>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => engine_err(&req.id, &e),
    }
}

pub fn required_str(params: &serde_json::Value, key: &str) -> EngineResult<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::bad_params(format!("missing {}", key)))
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> EngineResult<Option<String>> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.trim().to_string()))
            .ok_or_else(|| EngineError::bad_params(format!("{} must be a string", key))),
    }
}

pub fn optional_f64(params: &serde_json::Value, key: &str) -> EngineResult<Option<f64>> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| EngineError::bad_params(format!("{} must be a number", key))),
    }
}

pub fn required_f64(params: &serde_json::Value, key: &str) -> EngineResult<f64> {
    optional_f64(params, key)?.ok_or_else(|| EngineError::bad_params(format!("missing {}", key)))
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> EngineResult<Option<bool>> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| EngineError::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn positive(key: &str, value: f64) -> EngineResult<f64> {
    if value > 0.0 {
        Ok(value)
    } else {
        Err(EngineError::bad_params(format!("{} must be positive", key)))
    }
}

/// Looks up a single TEXT column by id, mapping a missing row to `not_found`.
pub fn lookup_text(
    conn: &Connection,
    sql: &str,
    id: &str,
    what: &'static str,
) -> EngineResult<String> {
    conn.query_row(sql, [id], |r| r.get(0))
        .optional()
        .map_err(query_err)?
        .ok_or(EngineError::NotFound(what))
}
