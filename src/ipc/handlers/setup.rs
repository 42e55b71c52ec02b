use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::error::{query_err, EngineError, EngineResult};
use crate::gradebook::{self, GRADING_SCALE_KEY};
use crate::ipc::helpers::{
    lookup_text, optional_bool, optional_f64, positive, required_f64, required_str, with_db,
    DbHandler,
};
use crate::ipc::types::{AppState, Request};

fn schools_create(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let name = required_str(params, "name")?;
    let grading_scale_max = optional_f64(params, "gradingScaleMax")?
        .map(|v| positive("gradingScaleMax", v))
        .transpose()?;

    let school_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schools(id, name) VALUES(?, ?)",
        (&school_id, &name),
    )
    .map_err(|e| EngineError::insert("schools", e))?;
    if let Some(max) = grading_scale_max {
        db::settings_set_json(conn, &school_id, GRADING_SCALE_KEY, &json!(max))
            .map_err(|e| EngineError::insert("school_settings", e))?;
    }
    Ok(json!({ "schoolId": school_id, "name": name }))
}

fn schools_set_grading_scale(
    conn: &Connection,
    params: &serde_json::Value,
) -> EngineResult<serde_json::Value> {
    let school_id = required_str(params, "schoolId")?;
    let max = positive("max", required_f64(params, "max")?)?;
    lookup_text(conn, "SELECT id FROM schools WHERE id = ?", &school_id, "school")?;
    db::settings_set_json(conn, &school_id, GRADING_SCALE_KEY, &json!(max))
        .map_err(|e| EngineError::insert("school_settings", e))?;
    Ok(json!({ "schoolId": school_id, "max": max }))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let school_id = required_str(params, "schoolId")?;
    let name = required_str(params, "name")?;
    lookup_text(conn, "SELECT id FROM schools WHERE id = ?", &school_id, "school")?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, school_id, name) VALUES(?, ?, ?)",
        (&class_id, &school_id, &name),
    )
    .map_err(|e| EngineError::insert("classes", e))?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_list(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let school_id = required_str(params, "schoolId")?;
    let mut stmt = conn
        .prepare("SELECT id, name FROM classes WHERE school_id = ? ORDER BY name, id")
        .map_err(query_err)?;
    let classes = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "classes": classes }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let class_id = required_str(params, "classId")?;
    let last_name = required_str(params, "lastName")?;
    let first_name = required_str(params, "firstName")?;
    let active = optional_bool(params, "active")?.unwrap_or(true);
    gradebook::class_school(conn, &class_id)?;

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(query_err)?;
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            active as i64,
            sort_order,
        ),
    )
    .map_err(|e| EngineError::insert("students", e))?;
    Ok(json!({ "studentId": student_id, "sortOrder": sort_order }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let class_id = required_str(params, "classId")?;
    gradebook::class_school(conn, &class_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order, id",
        )
        .map_err(query_err)?;
    let students = stmt
        .query_map([&class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
                "active": r.get::<_, i64>(3)? != 0,
                "sortOrder": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "students": students }))
}

fn students_set_active(
    conn: &Connection,
    params: &serde_json::Value,
) -> EngineResult<serde_json::Value> {
    let student_id = required_str(params, "studentId")?;
    let active = optional_bool(params, "active")?
        .ok_or_else(|| EngineError::bad_params("missing active"))?;
    let changed = conn
        .execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (active as i64, &student_id),
        )
        .map_err(query_err)?;
    if changed == 0 {
        return Err(EngineError::NotFound("student"));
    }
    Ok(json!({ "studentId": student_id, "active": active }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let school_id = required_str(params, "schoolId")?;
    let name = required_str(params, "name")?;
    lookup_text(conn, "SELECT id FROM schools WHERE id = ?", &school_id, "school")?;

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, school_id, name) VALUES(?, ?, ?)",
        (&subject_id, &school_id, &name),
    )
    .map_err(|e| EngineError::insert("subjects", e))?;
    Ok(json!({ "subjectId": subject_id, "name": name }))
}

/// Attaches a subject to a class. A null coefficient keeps the default of 1.
fn subjects_set_coefficient(
    conn: &Connection,
    params: &serde_json::Value,
) -> EngineResult<serde_json::Value> {
    let class_id = required_str(params, "classId")?;
    let subject_id = required_str(params, "subjectId")?;
    let coefficient = optional_f64(params, "coefficient")?
        .map(|v| positive("coefficient", v))
        .transpose()?;

    let class_school = gradebook::class_school(conn, &class_id)?;
    let subject_school = lookup_text(
        conn,
        "SELECT school_id FROM subjects WHERE id = ?",
        &subject_id,
        "subject",
    )?;
    if class_school != subject_school {
        return Err(EngineError::bad_params(
            "subject belongs to a different school than the class",
        ));
    }

    conn.execute(
        "INSERT INTO class_subjects(class_id, subject_id, coefficient)
         VALUES(?, ?, ?)
         ON CONFLICT(class_id, subject_id) DO UPDATE SET
           coefficient = excluded.coefficient",
        (&class_id, &subject_id, coefficient),
    )
    .map_err(|e| EngineError::insert("class_subjects", e))?;
    Ok(json!({
        "classId": class_id,
        "subjectId": subject_id,
        "coefficient": coefficient.unwrap_or(1.0),
    }))
}

fn parse_date(params: &serde_json::Value, key: &str) -> EngineResult<NaiveDate> {
    let raw = required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| EngineError::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

fn periods_create(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let school_id = required_str(params, "schoolId")?;
    let name = required_str(params, "name")?;
    let start = parse_date(params, "startDate")?;
    let end = parse_date(params, "endDate")?;
    if end < start {
        return Err(EngineError::bad_params("endDate is before startDate"));
    }
    lookup_text(conn, "SELECT id FROM schools WHERE id = ?", &school_id, "school")?;

    let period_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO reporting_periods(id, school_id, name, start_date, end_date)
         VALUES(?, ?, ?, ?, ?)",
        (
            &period_id,
            &school_id,
            &name,
            start.format("%Y-%m-%d").to_string(),
            end.format("%Y-%m-%d").to_string(),
        ),
    )
    .map_err(|e| EngineError::insert("reporting_periods", e))?;
    Ok(json!({ "periodId": period_id, "name": name }))
}

fn periods_list(conn: &Connection, params: &serde_json::Value) -> EngineResult<serde_json::Value> {
    let school_id = required_str(params, "schoolId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_date, end_date
             FROM reporting_periods
             WHERE school_id = ?
             ORDER BY start_date, name",
        )
        .map_err(query_err)?;
    let periods = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "periods": periods }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: DbHandler = match req.method.as_str() {
        "schools.create" => schools_create,
        "schools.setGradingScale" => schools_set_grading_scale,
        "classes.create" => classes_create,
        "classes.list" => classes_list,
        "students.create" => students_create,
        "students.list" => students_list,
        "students.setActive" => students_set_active,
        "subjects.create" => subjects_create,
        "subjects.setCoefficient" => subjects_set_coefficient,
        "periods.create" => periods_create,
        "periods.list" => periods_list,
        _ => return None,
    };
    Some(with_db(state, req, f))
}
