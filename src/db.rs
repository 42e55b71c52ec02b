use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

use crate::config::EngineConfig;

pub const DB_FILE_NAME: &str = "reportcard.sqlite3";

pub fn open_db(workspace: &Path, config: &EngineConfig) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_settings(
            school_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY(school_id, key),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_school ON classes(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            coefficient REAL,
            PRIMARY KEY(class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reporting_periods(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            value REAL NOT NULL,
            max_value REAL NOT NULL,
            weight REAL NOT NULL DEFAULT 1,
            exam_id TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id) ON DELETE CASCADE,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(period_id) REFERENCES reporting_periods(id)
        )",
        [],
    )?;
    // Workspaces created before exams were linked lack exam_id.
    ensure_grades_exam_id(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_class_period ON grades(class_id, period_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_cards(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            overall_average REAL NOT NULL,
            class_average REAL NOT NULL,
            min_average REAL NOT NULL,
            max_average REAL NOT NULL,
            rank INTEGER NOT NULL,
            total_students INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            generated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(period_id) REFERENCES reporting_periods(id),
            UNIQUE(student_id, class_id, period_id)
        )",
        [],
    )?;
    ensure_report_cards_status(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_report_cards_class_period ON report_cards(class_id, period_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_card_subjects(
            id TEXT PRIMARY KEY,
            report_card_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            average REAL NOT NULL,
            class_min REAL NOT NULL,
            class_max REAL NOT NULL,
            class_average REAL NOT NULL,
            coefficient REAL NOT NULL,
            FOREIGN KEY(report_card_id) REFERENCES report_cards(id) ON DELETE CASCADE,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(report_card_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_report_card_subjects_card ON report_card_subjects(report_card_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS badges(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            criteria_json TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_badges(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            badge_id TEXT NOT NULL,
            awarded_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(badge_id) REFERENCES badges(id),
            UNIQUE(student_id, badge_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_badges_student ON student_badges(student_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_grades_exam_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "exam_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grades ADD COLUMN exam_id TEXT", [])?;
    Ok(())
}

fn ensure_report_cards_status(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "report_cards", "status")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE report_cards ADD COLUMN status TEXT NOT NULL DEFAULT 'draft'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    school_id: &str,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM school_settings WHERE school_id = ? AND key = ?",
            (school_id, key),
            |r| r.get(0),
        )
        .optional()?;
    // Unparsable values read as unset.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    school_id: &str,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO school_settings(school_id, key, value_json)
         VALUES(?, ?, ?)
         ON CONFLICT(school_id, key) DO UPDATE SET
           value_json = excluded.value_json",
        (school_id, key, value.to_string()),
    )?;
    Ok(())
}
