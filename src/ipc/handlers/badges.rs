use rusqlite::Connection;
use serde_json::json;

use crate::badges::{self, SqliteBadgeStore};
use crate::error::EngineResult;
use crate::ipc::helpers::{lookup_text, optional_str, required_str, with_db, DbHandler};
use crate::ipc::types::{AppState, Request};
use crate::reportcards::{self, ReportCardGenerated};

fn badges_create(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let name = required_str(params, "name")?;
    let description = optional_str(params, "description")?;
    let badge_id = badges::create_badge(conn, &name, description.as_deref(), params.get("criteria"))?;
    Ok(json!({ "badgeId": badge_id, "name": name }))
}

fn badges_list(conn: &Connection, _params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    Ok(json!({ "badges": badges::list_badges(conn)? }))
}

/// Re-runs the award rules for one existing report card.
fn badges_evaluate(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let report_card_id = required_str(params, "reportCardId")?;
    let card = reportcards::get_report_card_detail(conn, &report_card_id)?.card;
    let event = ReportCardGenerated {
        report_card_id: card.id,
        student_id: card.student_id,
        class_id: card.class_id,
        period_id: card.period_id,
        overall_average: card.overall_average,
        rank: card.rank,
    };
    let summary = badges::award_for_report_card(&SqliteBadgeStore::new(conn), &event);
    Ok(json!(summary))
}

fn badges_awards(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let student_id = required_str(params, "studentId")?;
    lookup_text(conn, "SELECT id FROM students WHERE id = ?", &student_id, "student")?;
    Ok(json!({ "awards": badges::list_student_badges(conn, &student_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: DbHandler = match req.method.as_str() {
        "badges.create" => badges_create,
        "badges.list" => badges_list,
        "badges.evaluate" => badges_evaluate,
        "badges.awards" => badges_awards,
        _ => return None,
    };
    Some(with_db(state, req, f))
}
