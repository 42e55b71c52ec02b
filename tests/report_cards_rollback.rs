use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_reportcardd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn reportcardd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

struct Seed {
    class_id: String,
    period_id: String,
    school_id: String,
}

fn seed_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    grading_scale_max: Option<f64>,
) -> Seed {
    let school = request_ok(
        stdin,
        reader,
        "seed-school",
        "schools.create",
        json!({ "name": "Lycee Test", "gradingScaleMax": grading_scale_max }),
    );
    let school_id = str_field(&school, "schoolId");
    let class = request_ok(
        stdin,
        reader,
        "seed-class",
        "classes.create",
        json!({ "schoolId": school_id, "name": "3e B" }),
    );
    let period = request_ok(
        stdin,
        reader,
        "seed-period",
        "periods.create",
        json!({
            "schoolId": school_id,
            "name": "Trimestre 1",
            "startDate": "2026-09-01",
            "endDate": "2026-11-30"
        }),
    );
    Seed {
        class_id: str_field(&class, "classId"),
        period_id: str_field(&period, "periodId"),
        school_id,
    }
}

fn add_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    class_id: &str,
    first: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("student-{}", first),
        "students.create",
        json!({ "classId": class_id, "lastName": "Test", "firstName": first }),
    );
    str_field(&res, "studentId")
}

fn add_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    seed: &Seed,
    name: &str,
    coefficient: f64,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("subject-{}", name),
        "subjects.create",
        json!({ "schoolId": seed.school_id, "name": name }),
    );
    let subject_id = str_field(&res, "subjectId");
    let _ = request_ok(
        stdin,
        reader,
        &format!("coef-{}", name),
        "subjects.setCoefficient",
        json!({ "classId": seed.class_id, "subjectId": subject_id, "coefficient": coefficient }),
    );
    subject_id
}

fn add_grade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    seed: &Seed,
    student_id: &str,
    subject_id: &str,
    value: f64,
    max_value: f64,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        "grade",
        "grades.create",
        json!({
            "classId": seed.class_id,
            "periodId": seed.period_id,
            "studentId": student_id,
            "subjectId": subject_id,
            "value": value,
            "maxValue": max_value
        }),
    );
    str_field(&res, "gradeId")
}

fn list_cards(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    seed: &Seed,
) -> Vec<serde_json::Value> {
    let res = request_ok(
        stdin,
        reader,
        id,
        "reportCards.list",
        json!({ "classId": seed.class_id, "periodId": seed.period_id }),
    );
    res.get("reportCards")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("reportCards")
}

fn select_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) {
    let _ = request_ok(
        stdin,
        reader,
        "select",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

fn card_ids(cards: &[serde_json::Value]) -> Vec<String> {
    cards.iter().map(|c| str_field(c, "id")).collect()
}

fn open_workspace_db(workspace: &PathBuf) -> rusqlite::Connection {
    let conn = rusqlite::Connection::open(workspace.join("reportcard.sqlite3")).expect("open db");
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .expect("busy timeout");
    conn
}

#[test]
fn failed_generation_keeps_the_previous_report_cards() {
    let workspace = temp_dir("reportcardd-rollback");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let seed = seed_class(&mut stdin, &mut reader, None);
    let math = add_subject(&mut stdin, &mut reader, &seed, "Maths", 1.0);
    let a = add_student(&mut stdin, &mut reader, &seed.class_id, "Ana");
    let b = add_student(&mut stdin, &mut reader, &seed.class_id, "Ben");
    add_grade(&mut stdin, &mut reader, &seed, &a, &math, 15.0, 20.0);
    let bad_grade = add_grade(&mut stdin, &mut reader, &seed, &b, &math, 11.0, 20.0);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "gen-1",
        "reportCards.generate",
        json!({ "classId": seed.class_id, "periodId": seed.period_id }),
    );
    let before = list_cards(&mut stdin, &mut reader, "list-1", &seed);
    assert_eq!(before.len(), 2);

    // The IPC layer refuses such values, so corrupt the row underneath it.
    let conn = open_workspace_db(&workspace);
    conn.execute("UPDATE grades SET value = 25 WHERE id = ?", [&bad_grade])
        .expect("corrupt grade");
    drop(conn);

    let resp = request(
        &mut stdin,
        &mut reader,
        "gen-2",
        "reportCards.generate",
        json!({ "classId": seed.class_id, "periodId": seed.period_id }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    let error = resp.get("error").cloned().expect("error");
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("grade_out_of_range")
    );
    assert_eq!(
        error
            .get("details")
            .and_then(|d| d.get("gradeId"))
            .and_then(|v| v.as_str()),
        Some(bad_grade.as_str())
    );

    let after = list_cards(&mut stdin, &mut reader, "list-2", &seed);
    assert_eq!(card_ids(&before), card_ids(&after));
    assert_eq!(before, after);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unknown_ids_and_empty_rosters_change_nothing() {
    let workspace = temp_dir("reportcardd-rollback-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let seed = seed_class(&mut stdin, &mut reader, None);
    let math = add_subject(&mut stdin, &mut reader, &seed, "Maths", 1.0);
    let a = add_student(&mut stdin, &mut reader, &seed.class_id, "Ana");
    add_grade(&mut stdin, &mut reader, &seed, &a, &math, 13.0, 20.0);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "gen-1",
        "reportCards.generate",
        json!({ "classId": seed.class_id, "periodId": seed.period_id }),
    );
    let before = list_cards(&mut stdin, &mut reader, "list-1", &seed);

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "gen-missing-class",
        "reportCards.generate",
        json!({ "classId": "no-such-class", "periodId": seed.period_id }),
    );
    assert_eq!(code, "not_found");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "gen-missing-period",
        "reportCards.generate",
        json!({ "classId": seed.class_id, "periodId": "no-such-period" }),
    );
    assert_eq!(code, "not_found");

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "empty-class",
        "classes.create",
        json!({ "schoolId": seed.school_id, "name": "Vide" }),
    );
    let empty_class = str_field(&empty, "classId");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "gen-empty",
        "reportCards.generate",
        json!({ "classId": empty_class, "periodId": seed.period_id }),
    );
    assert_eq!(code, "empty_roster");

    // A roster of only inactive students is empty too.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "deactivate",
        "students.setActive",
        json!({ "studentId": a, "active": false }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "gen-inactive",
        "reportCards.generate",
        json!({ "classId": seed.class_id, "periodId": seed.period_id }),
    );
    assert_eq!(code, "empty_roster");

    let after = list_cards(&mut stdin, &mut reader, "list-2", &seed);
    assert_eq!(before, after);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn locked_database_fails_fast_with_db_busy() {
    let workspace = temp_dir("reportcardd-busy");
    std::fs::write(workspace.join("reportcardd.toml"), "busy_timeout_ms = 100\n")
        .expect("write config");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let seed = seed_class(&mut stdin, &mut reader, None);
    let math = add_subject(&mut stdin, &mut reader, &seed, "Maths", 1.0);
    let a = add_student(&mut stdin, &mut reader, &seed.class_id, "Ana");
    add_grade(&mut stdin, &mut reader, &seed, &a, &math, 17.0, 20.0);

    let holder = open_workspace_db(&workspace);
    holder
        .execute_batch("BEGIN IMMEDIATE")
        .expect("take write lock");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "gen-locked",
        "reportCards.generate",
        json!({ "classId": seed.class_id, "periodId": seed.period_id }),
    );
    assert_eq!(code, "db_busy");

    holder.execute_batch("COMMIT").expect("release write lock");
    drop(holder);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "gen-unlocked",
        "reportCards.generate",
        json!({ "classId": seed.class_id, "periodId": seed.period_id }),
    );
    assert_eq!(res.get("generatedCount").and_then(|v| v.as_u64()), Some(1));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn overrunning_the_generation_deadline_rolls_back() {
    let workspace = temp_dir("reportcardd-timeout");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let seed = seed_class(&mut stdin, &mut reader, None);
    let mut subjects = Vec::new();
    for name in ["Maths", "Francais", "Histoire", "Anglais", "Physique"] {
        subjects.push(add_subject(&mut stdin, &mut reader, &seed, name, 1.0));
    }
    let a = add_student(&mut stdin, &mut reader, &seed.class_id, "Ana");
    add_grade(&mut stdin, &mut reader, &seed, &a, &subjects[0], 14.0, 20.0);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "gen-1",
        "reportCards.generate",
        json!({ "classId": seed.class_id, "periodId": seed.period_id }),
    );
    let before = list_cards(&mut stdin, &mut reader, "list-1", &seed);
    assert_eq!(before.len(), 1);

    // Bulk-load a roster large enough that one millisecond cannot cover it.
    let mut conn = open_workspace_db(&workspace);
    let tx = conn.transaction().expect("begin bulk load");
    {
        let mut student_stmt = tx
            .prepare(
                "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
                 VALUES(?, ?, 'Bulk', ?, 1, ?)",
            )
            .expect("prepare students");
        let mut grade_stmt = tx
            .prepare(
                "INSERT INTO grades(id, student_id, subject_id, class_id, period_id, value, max_value, weight)
                 VALUES(?, ?, ?, ?, ?, ?, 20, 1)",
            )
            .expect("prepare grades");
        for i in 0..3000_i64 {
            let student_id = format!("bulk-{}", i);
            student_stmt
                .execute(rusqlite::params![
                    student_id,
                    seed.class_id,
                    format!("S{}", i),
                    i + 1
                ])
                .expect("insert student");
            for (j, subject_id) in subjects.iter().enumerate() {
                grade_stmt
                    .execute(rusqlite::params![
                        format!("{}-{}", student_id, j),
                        student_id,
                        subject_id,
                        seed.class_id,
                        seed.period_id,
                        ((i + j as i64) % 21) as f64
                    ])
                    .expect("insert grade");
            }
        }
    }
    tx.commit().expect("commit bulk load");
    drop(conn);

    std::fs::write(workspace.join("reportcardd.toml"), "generation_timeout_ms = 1\n")
        .expect("write config");
    select_workspace(&mut stdin, &mut reader, &workspace);

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "gen-slow",
        "reportCards.generate",
        json!({ "classId": seed.class_id, "periodId": seed.period_id }),
    );
    assert_eq!(code, "generation_timeout");

    let after = list_cards(&mut stdin, &mut reader, "list-2", &seed);
    assert_eq!(before, after);

    drop(stdin);
    let _ = child.wait();
}
