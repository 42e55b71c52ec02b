use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;

use crate::calc::{GradeRow, GradingScale};
use crate::config::EngineConfig;
use crate::db;
use crate::error::{query_err, EngineError, EngineResult};

pub const GRADING_SCALE_KEY: &str = "grading_scale.max";

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct SubjectCoefficient {
    pub subject_id: String,
    pub coefficient: f64,
}

/// Everything one generation run reads, fetched up front in a handful of queries.
#[derive(Debug, Clone)]
pub struct ClassGradebook {
    pub class_id: String,
    pub period_id: String,
    pub school_id: String,
    pub scale: GradingScale,
    pub students: Vec<RosterStudent>,
    pub subjects: Vec<SubjectCoefficient>,
    // student_id -> subject_id -> grades
    grades: HashMap<String, HashMap<String, Vec<GradeRow>>>,
}

impl ClassGradebook {
    pub fn grades_for(&self, student_id: &str, subject_id: &str) -> &[GradeRow] {
        self.grades
            .get(student_id)
            .and_then(|by_subject| by_subject.get(subject_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        students: Vec<RosterStudent>,
        subjects: Vec<SubjectCoefficient>,
        grades: HashMap<String, HashMap<String, Vec<GradeRow>>>,
        scale: GradingScale,
    ) -> Self {
        ClassGradebook {
            class_id: "class".to_string(),
            period_id: "period".to_string(),
            school_id: "school".to_string(),
            scale,
            students,
            subjects,
            grades,
        }
    }
}

pub fn load_class_gradebook(
    conn: &Connection,
    config: &EngineConfig,
    class_id: &str,
    period_id: &str,
) -> EngineResult<ClassGradebook> {
    let school_id = class_school(conn, class_id)?;
    let period_school: Option<String> = conn
        .query_row(
            "SELECT school_id FROM reporting_periods WHERE id = ?",
            [period_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    let Some(period_school) = period_school else {
        return Err(EngineError::NotFound("reporting period"));
    };
    if period_school != school_id {
        return Err(EngineError::bad_params(
            "reporting period belongs to a different school than the class",
        ));
    }

    let students = list_active_students(conn, class_id)?;
    if students.is_empty() {
        return Err(EngineError::EmptyRoster {
            class_id: class_id.to_string(),
        });
    }

    let subjects = list_subjects_with_coefficients(conn, class_id, period_id)?;
    let ceiling = grading_scale_ceiling(conn, &school_id, config.default_grading_ceiling)?;

    let mut grades: HashMap<String, HashMap<String, Vec<GradeRow>>> = HashMap::new();
    for (student_id, subject_id, row) in list_class_period_grades(conn, class_id, period_id)? {
        grades
            .entry(student_id)
            .or_default()
            .entry(subject_id)
            .or_default()
            .push(row);
    }

    Ok(ClassGradebook {
        class_id: class_id.to_string(),
        period_id: period_id.to_string(),
        school_id,
        scale: GradingScale { ceiling },
        students,
        subjects,
        grades,
    })
}

pub fn class_school(conn: &Connection, class_id: &str) -> EngineResult<String> {
    conn.query_row(
        "SELECT school_id FROM classes WHERE id = ?",
        [class_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)?
    .ok_or(EngineError::NotFound("class"))
}

pub fn list_active_students(conn: &Connection, class_id: &str) -> EngineResult<Vec<RosterStudent>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name
             FROM students
             WHERE class_id = ? AND active = 1
             ORDER BY sort_order, id",
        )
        .map_err(query_err)?;
    stmt.query_map([class_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(RosterStudent {
            id: r.get(0)?,
            display_name: format!("{}, {}", last, first),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

/// Subjects configured for the class plus any subject graded in the period.
/// Missing or non-positive coefficients read as 1.0.
pub fn list_subjects_with_coefficients(
    conn: &Connection,
    class_id: &str,
    period_id: &str,
) -> EngineResult<Vec<SubjectCoefficient>> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, cs.coefficient
             FROM subjects s
             LEFT JOIN class_subjects cs ON cs.subject_id = s.id AND cs.class_id = ?1
             WHERE s.id IN (
               SELECT subject_id FROM class_subjects WHERE class_id = ?1
               UNION
               SELECT subject_id FROM grades WHERE class_id = ?1 AND period_id = ?2
             )
             ORDER BY s.name, s.id",
        )
        .map_err(query_err)?;
    stmt.query_map((class_id, period_id), |r| {
        let coefficient: Option<f64> = r.get(1)?;
        Ok(SubjectCoefficient {
            subject_id: r.get(0)?,
            coefficient: coefficient
                .filter(|c| c.is_finite() && *c > 0.0)
                .unwrap_or(1.0),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

fn list_class_period_grades(
    conn: &Connection,
    class_id: &str,
    period_id: &str,
) -> EngineResult<Vec<(String, String, GradeRow)>> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, subject_id, id, value, max_value, weight
             FROM grades
             WHERE class_id = ? AND period_id = ?
             ORDER BY student_id, subject_id, id",
        )
        .map_err(query_err)?;
    stmt.query_map((class_id, period_id), |r| {
        Ok((
            r.get(0)?,
            r.get(1)?,
            GradeRow {
                id: r.get(2)?,
                value: r.get(3)?,
                max_value: r.get(4)?,
                weight: r.get(5)?,
            },
        ))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

pub fn grading_scale_ceiling(conn: &Connection, school_id: &str, default: f64) -> EngineResult<f64> {
    let stored = db::settings_get_json(conn, school_id, GRADING_SCALE_KEY).map_err(query_err)?;
    Ok(stored
        .and_then(|v| v.as_f64())
        .filter(|c| c.is_finite() && *c > 0.0)
        .unwrap_or(default))
}
