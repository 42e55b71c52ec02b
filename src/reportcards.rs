use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::calc::{self, CohortStats};
use crate::config::EngineConfig;
use crate::error::{is_busy, query_err, EngineError, EngineResult};
use crate::gradebook::{self, ClassGradebook};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportCardStatus {
    Draft,
    Published,
    Archived,
}

impl ReportCardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportCardStatus::Draft => "draft",
            ReportCardStatus::Published => "published",
            ReportCardStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(ReportCardStatus::Draft),
            "published" => Some(ReportCardStatus::Published),
            "archived" => Some(ReportCardStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub id: String,
    pub student_id: String,
    pub display_name: String,
    pub class_id: String,
    pub period_id: String,
    pub overall_average: f64,
    pub class_average: f64,
    pub min_average: f64,
    pub max_average: f64,
    pub rank: i64,
    pub total_students: i64,
    pub status: String,
    pub generated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardSubject {
    pub subject_id: String,
    pub subject_name: String,
    pub average: f64,
    pub class_min: f64,
    pub class_max: f64,
    pub class_average: f64,
    pub coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardDetail {
    #[serde(flatten)]
    pub card: ReportCard,
    pub subjects: Vec<ReportCardSubject>,
}

/// Emitted once per persisted card after the generation transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardGenerated {
    pub report_card_id: String,
    pub student_id: String,
    pub class_id: String,
    pub period_id: String,
    pub overall_average: f64,
    pub rank: i64,
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub generated_count: usize,
    pub events: Vec<ReportCardGenerated>,
}

#[derive(Debug, Clone)]
struct PlannedSubject {
    subject_id: String,
    average: f64,
    coefficient: f64,
}

#[derive(Debug, Clone)]
struct PlannedCard {
    student_id: String,
    overall_average: f64,
    rank: i64,
    subjects: Vec<PlannedSubject>,
}

/// The full new report-card set for one class and period, computed before
/// anything is written.
#[derive(Debug, Clone)]
struct ReportPlan {
    cards: Vec<PlannedCard>,
    overall: CohortStats,
    per_subject: HashMap<String, CohortStats>,
}

fn plan_report_cards(book: &ClassGradebook) -> EngineResult<ReportPlan> {
    let mut cards: Vec<PlannedCard> = Vec::with_capacity(book.students.len());
    let mut subject_values: HashMap<String, Vec<f64>> = HashMap::new();

    for student in &book.students {
        let mut subjects: Vec<PlannedSubject> = Vec::new();
        for subject in &book.subjects {
            let grades = book.grades_for(&student.id, &subject.subject_id);
            let Some(average) = calc::subject_average(grades, book.scale)? else {
                continue;
            };
            subject_values
                .entry(subject.subject_id.clone())
                .or_default()
                .push(average);
            subjects.push(PlannedSubject {
                subject_id: subject.subject_id.clone(),
                average,
                coefficient: subject.coefficient,
            });
        }

        if subjects.is_empty() {
            tracing::debug!(student = %student.display_name, "no graded subjects, overall average is 0");
        }
        let weighted: Vec<(f64, f64)> = subjects
            .iter()
            .map(|s| (s.average, s.coefficient))
            .collect();
        cards.push(PlannedCard {
            student_id: student.id.clone(),
            overall_average: calc::overall_average(&weighted),
            rank: 0,
            subjects,
        });
    }

    // Rank on the stored 2-decimal values so equal printed averages tie.
    let rounded: Vec<f64> = cards
        .iter()
        .map(|c| calc::round_off_2_decimals(c.overall_average))
        .collect();
    for (card, rank) in cards.iter_mut().zip(calc::rank_competition(&rounded)) {
        card.rank = rank;
    }

    let overall_values: Vec<f64> = cards.iter().map(|c| c.overall_average).collect();
    let overall = calc::cohort_stats(&overall_values).ok_or_else(|| EngineError::EmptyRoster {
        class_id: book.class_id.clone(),
    })?;

    let per_subject: HashMap<String, CohortStats> = subject_values
        .into_iter()
        .filter_map(|(subject_id, values)| {
            calc::cohort_stats(&values).map(|stats| (subject_id, stats))
        })
        .collect();

    Ok(ReportPlan {
        cards,
        overall,
        per_subject,
    })
}

/// Every planned subject contributed to its own cohort stats, so a miss
/// here means the plan is inconsistent.
fn subject_stats(plan: &ReportPlan, subject_id: &str) -> EngineResult<CohortStats> {
    plan.per_subject.get(subject_id).copied().ok_or_else(|| {
        EngineError::Internal(format!("no cohort stats for graded subject {}", subject_id))
    })
}

fn replace_report_cards(
    tx: &Transaction<'_>,
    book: &ClassGradebook,
    plan: &ReportPlan,
    generated_at: &str,
) -> EngineResult<Vec<ReportCardGenerated>> {
    // Children first; the cascade would do it too but the order is explicit here.
    tx.execute(
        "DELETE FROM report_card_subjects
         WHERE report_card_id IN (
           SELECT id FROM report_cards WHERE class_id = ? AND period_id = ?
         )",
        (&book.class_id, &book.period_id),
    )
    .map_err(query_err)?;
    tx.execute(
        "DELETE FROM report_cards WHERE class_id = ? AND period_id = ?",
        (&book.class_id, &book.period_id),
    )
    .map_err(query_err)?;

    let overall = plan.overall.rounded();
    let total_students = plan.cards.len() as i64;

    let mut card_stmt = tx
        .prepare(
            "INSERT INTO report_cards(
               id, student_id, class_id, period_id, overall_average,
               class_average, min_average, max_average, rank, total_students,
               status, generated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .map_err(query_err)?;
    let mut subject_stmt = tx
        .prepare(
            "INSERT INTO report_card_subjects(
               id, report_card_id, subject_id, average,
               class_min, class_max, class_average, coefficient
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .map_err(query_err)?;

    let mut events: Vec<ReportCardGenerated> = Vec::with_capacity(plan.cards.len());
    for card in &plan.cards {
        let report_card_id = Uuid::new_v4().to_string();
        let overall_average = calc::round_off_2_decimals(card.overall_average);
        card_stmt
            .execute(rusqlite::params![
                report_card_id,
                card.student_id,
                book.class_id,
                book.period_id,
                overall_average,
                overall.mean,
                overall.min,
                overall.max,
                card.rank,
                total_students,
                ReportCardStatus::Draft.as_str(),
                generated_at,
            ])
            .map_err(|e| EngineError::insert("report_cards", e))?;

        for subject in &card.subjects {
            let stats = subject_stats(plan, &subject.subject_id)?.rounded();
            subject_stmt
                .execute(rusqlite::params![
                    Uuid::new_v4().to_string(),
                    report_card_id,
                    subject.subject_id,
                    calc::round_off_2_decimals(subject.average),
                    stats.min,
                    stats.max,
                    stats.mean,
                    subject.coefficient,
                ])
                .map_err(|e| EngineError::insert("report_card_subjects", e))?;
        }

        events.push(ReportCardGenerated {
            report_card_id,
            student_id: card.student_id.clone(),
            class_id: book.class_id.clone(),
            period_id: book.period_id.clone(),
            overall_average,
            rank: card.rank,
        });
    }

    Ok(events)
}

/// Only a statement aborted by the deadline handler reads as a timeout;
/// every other staging error keeps its own code and details.
fn stage_error(e: EngineError, interrupted: bool, timeout_ms: u64) -> EngineError {
    match e {
        EngineError::Query(_) | EngineError::Insert { .. } if interrupted => {
            EngineError::GenerationTimeout { timeout_ms }
        }
        e => e,
    }
}

fn begin_immediate(conn: &Connection) -> EngineResult<Transaction<'_>> {
    // IMMEDIATE takes the write lock up front, so a second generation for the
    // same workspace waits (busy_timeout) instead of interleaving.
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate).map_err(|e| {
        if is_busy(&e) {
            EngineError::Busy(e.to_string())
        } else {
            EngineError::Tx(e.to_string())
        }
    })
}

fn stage_generation(
    tx: &Transaction<'_>,
    config: &EngineConfig,
    class_id: &str,
    period_id: &str,
) -> EngineResult<Vec<ReportCardGenerated>> {
    let book = gradebook::load_class_gradebook(tx, config, class_id, period_id)?;
    tracing::debug!(
        school_id = %book.school_id,
        ceiling = book.scale.ceiling,
        students = book.students.len(),
        subjects = book.subjects.len(),
        "gradebook loaded"
    );
    let plan = plan_report_cards(&book)?;
    let generated_at = chrono::Utc::now().to_rfc3339();
    replace_report_cards(tx, &book, &plan, &generated_at)
}

/// Recompute and atomically replace every report card for `(class_id, period_id)`.
///
/// Either the whole new set is committed or the previous set is left untouched.
pub fn generate_class_report_cards(
    conn: &Connection,
    config: &EngineConfig,
    class_id: &str,
    period_id: &str,
) -> EngineResult<GenerationOutcome> {
    let started = Instant::now();
    let timeout_ms = config.generation_timeout_ms;
    let deadline = started + Duration::from_millis(timeout_ms);
    tracing::info!(class_id, period_id, "generating report cards");

    let tx = begin_immediate(conn)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let fired = Arc::clone(&interrupted);
    conn.progress_handler(
        1_000,
        Some(move || {
            let expired = Instant::now() >= deadline;
            if expired {
                fired.store(true, Ordering::SeqCst);
            }
            expired
        }),
    );
    let staged = stage_generation(&tx, config, class_id, period_id);
    conn.progress_handler(0, None::<fn() -> bool>);

    let staged = staged.and_then(|events| {
        if Instant::now() >= deadline {
            return Err(EngineError::GenerationTimeout { timeout_ms });
        }
        Ok(events)
    });

    let events = match staged {
        Ok(events) => events,
        Err(e) => {
            let e = stage_error(e, interrupted.load(Ordering::SeqCst), timeout_ms);
            if let Err(rb) = tx.rollback() {
                tracing::error!(class_id, period_id, error = %rb, "rollback failed");
            }
            tracing::warn!(class_id, period_id, code = e.code(), error = %e, "report card generation rolled back");
            return Err(e);
        }
    };

    tx.commit()
        .map_err(|e| EngineError::Commit(e.to_string()))?;

    tracing::info!(
        class_id,
        period_id,
        generated = events.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "report cards generated"
    );
    Ok(GenerationOutcome {
        generated_count: events.len(),
        events,
    })
}

const REPORT_CARD_COLUMNS: &str = "rc.id, rc.student_id, s.last_name, s.first_name, rc.class_id,
    rc.period_id, rc.overall_average, rc.class_average, rc.min_average, rc.max_average,
    rc.rank, rc.total_students, rc.status, rc.generated_at";

fn report_card_from_row(r: &Row<'_>) -> rusqlite::Result<ReportCard> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    Ok(ReportCard {
        id: r.get(0)?,
        student_id: r.get(1)?,
        display_name: format!("{}, {}", last, first),
        class_id: r.get(4)?,
        period_id: r.get(5)?,
        overall_average: r.get(6)?,
        class_average: r.get(7)?,
        min_average: r.get(8)?,
        max_average: r.get(9)?,
        rank: r.get(10)?,
        total_students: r.get(11)?,
        status: r.get(12)?,
        generated_at: r.get(13)?,
    })
}

pub fn get_class_report_cards(
    conn: &Connection,
    class_id: &str,
    period_id: &str,
) -> EngineResult<Vec<ReportCard>> {
    gradebook::class_school(conn, class_id)?;
    let sql = format!(
        "SELECT {}
         FROM report_cards rc
         JOIN students s ON s.id = rc.student_id
         WHERE rc.class_id = ? AND rc.period_id = ?
         ORDER BY rc.rank, s.sort_order, s.id",
        REPORT_CARD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    stmt.query_map((class_id, period_id), report_card_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)
}

pub fn get_report_card_detail(conn: &Connection, report_card_id: &str) -> EngineResult<ReportCardDetail> {
    let sql = format!(
        "SELECT {}
         FROM report_cards rc
         JOIN students s ON s.id = rc.student_id
         WHERE rc.id = ?",
        REPORT_CARD_COLUMNS
    );
    let card = conn
        .query_row(&sql, [report_card_id], report_card_from_row)
        .optional()
        .map_err(query_err)?
        .ok_or(EngineError::NotFound("report card"))?;

    let mut stmt = conn
        .prepare(
            "SELECT rcs.subject_id, sub.name, rcs.average, rcs.class_min, rcs.class_max,
                    rcs.class_average, rcs.coefficient
             FROM report_card_subjects rcs
             JOIN subjects sub ON sub.id = rcs.subject_id
             WHERE rcs.report_card_id = ?
             ORDER BY sub.name, sub.id",
        )
        .map_err(query_err)?;
    let subjects = stmt
        .query_map([report_card_id], |r| {
            Ok(ReportCardSubject {
                subject_id: r.get(0)?,
                subject_name: r.get(1)?,
                average: r.get(2)?,
                class_min: r.get(3)?,
                class_max: r.get(4)?,
                class_average: r.get(5)?,
                coefficient: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    Ok(ReportCardDetail { card, subjects })
}

pub fn set_report_card_status(
    conn: &Connection,
    report_card_id: &str,
    status: ReportCardStatus,
) -> EngineResult<()> {
    let changed = conn
        .execute(
            "UPDATE report_cards SET status = ? WHERE id = ?",
            (status.as_str(), report_card_id),
        )
        .map_err(query_err)?;
    if changed == 0 {
        return Err(EngineError::NotFound("report card"));
    }
    Ok(())
}
