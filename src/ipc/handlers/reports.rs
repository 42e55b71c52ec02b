use rusqlite::Connection;
use serde_json::json;

use crate::badges::{self, SqliteBadgeStore};
use crate::error::{EngineError, EngineResult};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{required_str, with_db, DbHandler};
use crate::ipc::types::{AppState, Request};
use crate::reportcards::{self, ReportCardStatus};

fn handle_report_cards_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, &e),
    };
    let period_id = match required_str(&req.params, "periodId") {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, &e),
    };

    let outcome =
        match reportcards::generate_class_report_cards(conn, &state.config, &class_id, &period_id)
        {
            Ok(v) => v,
            Err(e) => return engine_err(&req.id, &e),
        };

    // Badges run after commit; their failures never undo the report cards.
    let awards = badges::award_for_events(&SqliteBadgeStore::new(conn), &outcome.events);

    ok(
        &req.id,
        json!({
            "generatedCount": outcome.generated_count,
            "badges": awards,
        }),
    )
}

fn report_cards_list(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let class_id = required_str(params, "classId")?;
    let period_id = required_str(params, "periodId")?;
    let cards = reportcards::get_class_report_cards(conn, &class_id, &period_id)?;
    Ok(json!({ "reportCards": cards }))
}

fn report_cards_detail(
    conn: &Connection,
    params: &serde_json::Value,
) -> EngineResult<serde_json::Value> {
    let report_card_id = required_str(params, "reportCardId")?;
    let detail = reportcards::get_report_card_detail(conn, &report_card_id)?;
    Ok(json!(detail))
}

fn report_cards_set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> EngineResult<serde_json::Value> {
    let report_card_id = required_str(params, "reportCardId")?;
    let raw = required_str(params, "status")?;
    let status = ReportCardStatus::parse(&raw).ok_or_else(|| {
        EngineError::bad_params("status must be one of: draft, published, archived")
    })?;
    reportcards::set_report_card_status(conn, &report_card_id, status)?;
    Ok(json!({ "reportCardId": report_card_id, "status": status.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: DbHandler = match req.method.as_str() {
        "reportCards.generate" => return Some(handle_report_cards_generate(state, req)),
        "reportCards.list" => report_cards_list,
        "reportCards.detail" => report_cards_detail,
        "reportCards.setStatus" => report_cards_set_status,
        _ => return None,
    };
    Some(with_db(state, req, f))
}
