use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{query_err, EngineError, EngineResult};
use crate::reportcards::ReportCardGenerated;

/// Declarative eligibility rule stored as a badge's `criteria` JSON.
///
/// A badge is earned when ANY present key matches. Unknown keys are ignored,
/// and an object with no recognised key never matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BadgeCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
}

impl BadgeCriteria {
    pub fn from_json(v: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(v.clone())
    }

    pub fn is_eligible(&self, overall_average: f64, rank: i64) -> bool {
        let by_average = self
            .min_average
            .map(|min| overall_average >= min)
            .unwrap_or(false);
        let by_rank = self.rank.map(|r| rank == r).unwrap_or(false);
        by_average || by_rank
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub criteria: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBadge {
    pub badge_id: String,
    pub badge_name: String,
    pub awarded_at: String,
}

pub trait BadgeStore {
    fn list_badges_with_criteria(&self) -> EngineResult<Vec<Badge>>;
    fn has_award(&self, student_id: &str, badge_id: &str) -> EngineResult<bool>;
    /// Returns false when the pair was already awarded (including by a concurrent writer).
    fn insert_award(&self, student_id: &str, badge_id: &str) -> EngineResult<bool>;
}

pub struct SqliteBadgeStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteBadgeStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl BadgeStore for SqliteBadgeStore<'_> {
    fn list_badges_with_criteria(&self) -> EngineResult<Vec<Badge>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, criteria_json
                 FROM badges
                 WHERE criteria_json IS NOT NULL AND criteria_json <> 'null'
                 ORDER BY name, id",
            )
            .map_err(query_err)?;
        stmt.query_map([], badge_from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)
    }

    fn has_award(&self, student_id: &str, badge_id: &str) -> EngineResult<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM student_badges WHERE student_id = ? AND badge_id = ?)",
                (student_id, badge_id),
                |r| r.get::<_, i64>(0),
            )
            .map(|v| v != 0)
            .map_err(query_err)
    }

    fn insert_award(&self, student_id: &str, badge_id: &str) -> EngineResult<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO student_badges(id, student_id, badge_id, awarded_at)
                 VALUES(?, ?, ?, ?)
                 ON CONFLICT(student_id, badge_id) DO NOTHING",
                (
                    Uuid::new_v4().to_string(),
                    student_id,
                    badge_id,
                    chrono::Utc::now().to_rfc3339(),
                ),
            )
            .map_err(|e| EngineError::insert("student_badges", e))?;
        Ok(inserted > 0)
    }
}

fn badge_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Badge> {
    let raw: Option<String> = r.get(3)?;
    Ok(Badge {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        // Unparsable criteria are kept as a JSON string so evaluation can skip them.
        criteria: raw.map(|s| serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardSummary {
    pub awarded: Vec<String>,
    pub already_held: usize,
    pub skipped: usize,
}

impl AwardSummary {
    fn merge(&mut self, other: AwardSummary) {
        self.awarded.extend(other.awarded);
        self.already_held += other.already_held;
        self.skipped += other.skipped;
    }
}

fn evaluate_badges<S: BadgeStore + ?Sized>(
    store: &S,
    badges: &[Badge],
    event: &ReportCardGenerated,
) -> AwardSummary {
    let mut summary = AwardSummary::default();
    for badge in badges {
        let Some(raw) = badge.criteria.as_ref().filter(|v| !v.is_null()) else {
            continue;
        };
        let criteria = match BadgeCriteria::from_json(raw) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(badge_id = %badge.id, error = %e, "skipping badge with invalid criteria");
                summary.skipped += 1;
                continue;
            }
        };
        if !criteria.is_eligible(event.overall_average, event.rank) {
            continue;
        }

        match store.has_award(&event.student_id, &badge.id) {
            Ok(true) => {
                summary.already_held += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(badge_id = %badge.id, student_id = %event.student_id, error = %e, "badge lookup failed");
                summary.skipped += 1;
                continue;
            }
        }

        match store.insert_award(&event.student_id, &badge.id) {
            Ok(true) => {
                tracing::debug!(
                    badge_id = %badge.id,
                    student_id = %event.student_id,
                    report_card_id = %event.report_card_id,
                    "badge awarded"
                );
                summary.awarded.push(badge.id.clone());
            }
            Ok(false) => summary.already_held += 1,
            Err(e) => {
                tracing::warn!(badge_id = %badge.id, student_id = %event.student_id, error = %e, "badge award failed");
                summary.skipped += 1;
            }
        }
    }
    summary
}

/// Best-effort: failures are logged and counted, never returned.
pub fn award_for_report_card<S: BadgeStore + ?Sized>(
    store: &S,
    event: &ReportCardGenerated,
) -> AwardSummary {
    award_for_events(store, std::slice::from_ref(event))
}

pub fn award_for_events<S: BadgeStore + ?Sized>(
    store: &S,
    events: &[ReportCardGenerated],
) -> AwardSummary {
    let mut summary = AwardSummary::default();
    if events.is_empty() {
        return summary;
    }
    let badges = match store.list_badges_with_criteria() {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "could not load badges, no awards evaluated");
            return summary;
        }
    };
    for event in events {
        summary.merge(evaluate_badges(store, &badges, event));
    }
    summary
}

pub fn create_badge(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
    criteria: Option<&serde_json::Value>,
) -> EngineResult<String> {
    let criteria = criteria.filter(|v| !v.is_null());
    if let Some(c) = criteria {
        if !c.is_object() {
            return Err(EngineError::bad_params("criteria must be an object or null"));
        }
        BadgeCriteria::from_json(c)
            .map_err(|e| EngineError::bad_params(format!("invalid criteria: {}", e)))?;
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO badges(id, name, description, criteria_json) VALUES(?, ?, ?, ?)",
        (&id, name, description, criteria.map(|c| c.to_string())),
    )
    .map_err(|e| EngineError::insert("badges", e))?;
    Ok(id)
}

pub fn list_badges(conn: &Connection) -> EngineResult<Vec<Badge>> {
    let mut stmt = conn
        .prepare("SELECT id, name, description, criteria_json FROM badges ORDER BY name, id")
        .map_err(query_err)?;
    stmt.query_map([], badge_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)
}

pub fn list_student_badges(conn: &Connection, student_id: &str) -> EngineResult<Vec<StudentBadge>> {
    let mut stmt = conn
        .prepare(
            "SELECT sb.badge_id, b.name, sb.awarded_at
             FROM student_badges sb
             JOIN badges b ON b.id = sb.badge_id
             WHERE sb.student_id = ?
             ORDER BY sb.awarded_at, b.name",
        )
        .map_err(query_err)?;
    stmt.query_map([student_id], |r| {
        Ok(StudentBadge {
            badge_id: r.get(0)?,
            badge_name: r.get(1)?,
            awarded_at: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}
