use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::error::{query_err, EngineError, EngineResult};
use crate::gradebook;
use crate::ipc::helpers::{
    lookup_text, optional_f64, optional_str, positive, required_f64, required_str, with_db,
    DbHandler,
};
use crate::ipc::types::{AppState, Request};

fn check_grade_values(value: f64, max_value: f64, weight: f64) -> EngineResult<()> {
    if value < 0.0 {
        return Err(EngineError::bad_params("value must not be negative"));
    }
    positive("maxValue", max_value)?;
    positive("weight", weight)?;
    if value > max_value {
        return Err(EngineError::bad_params("value must not exceed maxValue"));
    }
    Ok(())
}

fn grades_create(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let class_id = required_str(params, "classId")?;
    let period_id = required_str(params, "periodId")?;
    let student_id = required_str(params, "studentId")?;
    let subject_id = required_str(params, "subjectId")?;
    let value = required_f64(params, "value")?;
    let max_value = required_f64(params, "maxValue")?;
    let weight = optional_f64(params, "weight")?.unwrap_or(1.0);
    let exam_id = optional_str(params, "examId")?.filter(|s| !s.is_empty());
    check_grade_values(value, max_value, weight)?;

    let school_id = gradebook::class_school(conn, &class_id)?;
    let student_class = lookup_text(
        conn,
        "SELECT class_id FROM students WHERE id = ?",
        &student_id,
        "student",
    )?;
    if student_class != class_id {
        return Err(EngineError::bad_params("student is not enrolled in the class"));
    }
    for (sql, id, what) in [
        ("SELECT school_id FROM subjects WHERE id = ?", &subject_id, "subject"),
        (
            "SELECT school_id FROM reporting_periods WHERE id = ?",
            &period_id,
            "reporting period",
        ),
    ] {
        if lookup_text(conn, sql, id, what)? != school_id {
            return Err(EngineError::bad_params(format!(
                "{} belongs to a different school than the class",
                what
            )));
        }
    }

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, student_id, subject_id, class_id, period_id, value, max_value, weight, exam_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            grade_id, student_id, subject_id, class_id, period_id, value, max_value, weight, exam_id
        ],
    )
    .map_err(|e| EngineError::insert("grades", e))?;
    Ok(json!({ "gradeId": grade_id }))
}

fn grades_update(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let grade_id = required_str(params, "gradeId")?;
    let current: Option<(f64, f64, f64)> = conn
        .query_row(
            "SELECT value, max_value, weight FROM grades WHERE id = ?",
            [&grade_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(query_err)?;
    let Some((cur_value, cur_max, cur_weight)) = current else {
        return Err(EngineError::NotFound("grade"));
    };

    let value = optional_f64(params, "value")?.unwrap_or(cur_value);
    let max_value = optional_f64(params, "maxValue")?.unwrap_or(cur_max);
    let weight = optional_f64(params, "weight")?.unwrap_or(cur_weight);
    check_grade_values(value, max_value, weight)?;

    conn.execute(
        "UPDATE grades SET value = ?, max_value = ?, weight = ? WHERE id = ?",
        (value, max_value, weight, &grade_id),
    )
    .map_err(query_err)?;
    Ok(json!({
        "gradeId": grade_id,
        "value": value,
        "maxValue": max_value,
        "weight": weight,
    }))
}

fn grades_delete(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let grade_id = required_str(params, "gradeId")?;
    let changed = conn
        .execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(query_err)?;
    if changed == 0 {
        return Err(EngineError::NotFound("grade"));
    }
    Ok(json!({ "deleted": true }))
}

fn grades_list(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let class_id = required_str(params, "classId")?;
    let period_id = required_str(params, "periodId")?;
    let student_id = optional_str(params, "studentId")?.filter(|s| !s.is_empty());
    gradebook::class_school(conn, &class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, subject_id, value, max_value, weight, exam_id
             FROM grades
             WHERE class_id = ?1 AND period_id = ?2 AND (?3 IS NULL OR student_id = ?3)
             ORDER BY student_id, subject_id, id",
        )
        .map_err(query_err)?;
    let grades = stmt
        .query_map((&class_id, &period_id, &student_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "value": r.get::<_, f64>(3)?,
                "maxValue": r.get::<_, f64>(4)?,
                "weight": r.get::<_, f64>(5)?,
                "examId": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "grades": grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: DbHandler = match req.method.as_str() {
        "grades.create" => grades_create,
        "grades.update" => grades_update,
        "grades.delete" => grades_delete,
        "grades.list" => grades_list,
        _ => return None,
    };
    Some(with_db(state, req, f))
}
