#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Ids from `fixtures/demo_school.json`.
pub mod demo {
    pub const ADMIN: &str = "1";
    pub const SCHOOL_HEAD: &str = "2";
    pub const TEACHER_ALMAZ: &str = "4";
    pub const TEACHER_MULUGETA: &str = "5";
    pub const CLASS_HEAD: &str = "6";
    pub const STUDENT_USER_ABEBE: &str = "7";
    pub const STUDENT_USER_TIGIST: &str = "8";
    pub const STUDENT_USER_DAWIT: &str = "9";
    pub const PARENT_OF_ABEBE: &str = "10";
    pub const PARENT_OF_TIGIST: &str = "11";
    pub const STORE_HOUSE: &str = "12";

    pub const ABEBE: &str = "1";
    pub const TIGIST: &str = "2";
    pub const DAWIT: &str = "3";

    pub const YEAR: &str = "3";
    pub const OLD_YEAR: &str = "2";
    pub const SEM1: &str = "5";
    pub const SEM2: &str = "6";

    pub const MATH_TA: &str = "1";
    pub const PHYSICS_TA: &str = "2";
    pub const ENGLISH_TA: &str = "3";
    pub const CHEMISTRY_TA: &str = "4";
    pub const MATH: &str = "1";

    pub const TYPE_TEST: &str = "1";
    pub const TYPE_FINAL: &str = "5";
    /// Test, Quiz, Assignment, Mid-Exam, Final Exam: 100 percent in total.
    pub const ALL_TYPES: [&str; 5] = ["1", "2", "3", "4", "5"];
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

pub fn next_id() -> String {
    format!("r{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

pub fn fixture_path(rel: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(rel)
}

pub fn temp_dir(prefix: &str) -> PathBuf {
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

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn actor(role: &str, user_id: &str) -> serde_json::Value {
    json!({ "role": role, "user_id": user_id })
}

/// `params` with the actor claim added.
pub fn as_actor(role: &str, user_id: &str, mut params: serde_json::Value) -> serde_json::Value {
    params["actor"] = actor(role, user_id);
    params
}

pub fn request(
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

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    assert!(value.get("error").map(|e| e.is_null()).unwrap_or(false));
    value.get("data").cloned().unwrap_or_else(|| json!({}))
}

/// Expect a failure envelope and return its error code.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("success").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    assert!(value.get("data").map(|d| d.is_null()).unwrap_or(false));
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Fresh workspace with the demo school imported.
pub fn open_demo_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> PathBuf {
    let workspace = temp_dir(prefix);
    request_ok(
        stdin,
        reader,
        &next_id(),
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let text = std::fs::read_to_string(fixture_path("fixtures/demo_school.json"))
        .expect("read demo fixture");
    let document: serde_json::Value = serde_json::from_str(&text).expect("parse demo fixture");
    request_ok(
        stdin,
        reader,
        &next_id(),
        "directory.import",
        as_actor("admin", demo::ADMIN, json!({ "document": document })),
    );
    workspace
}

pub fn teacher_for(assignment_id: &str) -> &'static str {
    match assignment_id {
        demo::MATH_TA | demo::PHYSICS_TA => demo::TEACHER_ALMAZ,
        _ => demo::TEACHER_MULUGETA,
    }
}

pub fn record_mark(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    assignment_id: &str,
    student_id: &str,
    type_id: &str,
    semester_id: &str,
    score: f64,
    max_score: f64,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &next_id(),
        "marks.record",
        as_actor(
            "teacher",
            teacher_for(assignment_id),
            json!({
                "teaching_assignment_id": assignment_id,
                "student_id": student_id,
                "assessment_type_id": type_id,
                "semester_id": semester_id,
                "score": score,
                "max_score": max_score,
            }),
        ),
    )
}

/// One mark per assessment type, each `percent` out of 100. With the demo
/// default weights the subject score comes out as `percent`.
pub fn record_subject_percent(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    assignment_id: &str,
    student_id: &str,
    semester_id: &str,
    percent: f64,
) {
    for type_id in demo::ALL_TYPES {
        record_mark(
            stdin,
            reader,
            assignment_id,
            student_id,
            type_id,
            semester_id,
            percent,
            100.0,
        );
    }
}

/// Per student: Mathematics, Physics, English, Chemistry.
///
/// Abebe 80/70/90/60 (avg 75), Tigist 35/60/70/55 (avg 55, one failing),
/// Dawit 39/39/39/100 (avg 54.25, three failing so Retained).
pub const SEMESTER_SCENARIO: [(&str, [f64; 4]); 3] = [
    (demo::ABEBE, [80.0, 70.0, 90.0, 60.0]),
    (demo::TIGIST, [35.0, 60.0, 70.0, 55.0]),
    (demo::DAWIT, [39.0, 39.0, 39.0, 100.0]),
];

pub fn seed_semester_marks(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    semester_id: &str,
) {
    let assignments = [
        demo::MATH_TA,
        demo::PHYSICS_TA,
        demo::ENGLISH_TA,
        demo::CHEMISTRY_TA,
    ];
    for (student, percents) in SEMESTER_SCENARIO {
        for (ta, percent) in assignments.iter().zip(percents) {
            record_subject_percent(stdin, reader, ta, student, semester_id, percent);
        }
    }
}

pub fn class_head(params: serde_json::Value) -> serde_json::Value {
    as_actor("class_head", demo::CLASS_HEAD, params)
}

pub fn compile(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    semester_id: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &next_id(),
        "grades.compile",
        class_head(json!({ "semester_id": semester_id, "academic_year_id": demo::YEAR })),
    )
}

pub fn publish_semester(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    semester_id: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &next_id(),
        "publish.semester",
        class_head(json!({ "semester_id": semester_id, "academic_year_id": demo::YEAR })),
    )
}

pub fn assert_close(actual: &serde_json::Value, expected: f64) {
    let v = actual.as_f64().unwrap_or_else(|| panic!("not a number: {actual}"));
    assert!(
        (v - expected).abs() < 1e-9,
        "expected {expected}, got {v}"
    );
}
