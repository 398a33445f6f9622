use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::calc::{self, Remark, SubjectScore};
use crate::error::{AppError, AppResult};
use crate::grading::{self, ClassScope, SemesterInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterKind {
    Semester,
    Year,
}

impl RosterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RosterKind::Semester => "semester",
            RosterKind::Year => "year",
        }
    }
}

/// Whole years between `date_of_birth` and `on`. Unparseable dates give `None`.
pub fn age_on(date_of_birth: Option<&str>, on: NaiveDate) -> Option<i64> {
    let dob = NaiveDate::parse_from_str(date_of_birth?.trim(), "%Y-%m-%d").ok()?;
    if dob > on {
        return None;
    }
    let mut age = i64::from(on.year() - dob.year());
    if (on.month(), on.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    Some(age)
}

/// Hex SHA-256 of the payload's serialized form. `serde_json::Value` objects
/// keep their keys sorted, so equal payloads always hash equal.
pub fn payload_digest(payload: &serde_json::Value) -> AppResult<String> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| AppError::Internal(format!("failed to serialize roster payload: {e}")))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

#[derive(Debug, Clone)]
struct PublishedRow {
    result_id: String,
    student_id: String,
    student_code: String,
    name: String,
    sex: Option<String>,
    date_of_birth: Option<String>,
    total: f64,
    average: f64,
    rank: i64,
    remark: String,
}

fn published_rows(
    conn: &Connection,
    results_table: &str,
    scope_column: &str,
    class_id: &str,
    scope_id: &str,
) -> AppResult<Vec<PublishedRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT r.id, r.student_id, st.student_code, st.name, st.sex, st.date_of_birth,
                r.total_score, r.average_score, r.rank_in_class, r.remark
         FROM {results_table} r
         JOIN students st ON st.id = r.student_id
         WHERE r.class_id = ? AND r.{scope_column} = ? AND r.is_published = 1
         ORDER BY r.rank_in_class, r.student_id"
    ))?;
    let rows = stmt
        .query_map((class_id, scope_id), |r| {
            Ok(PublishedRow {
                result_id: r.get(0)?,
                student_id: r.get(1)?,
                student_code: r.get(2)?,
                name: r.get(3)?,
                sex: r.get(4)?,
                date_of_birth: r.get(5)?,
                total: r.get(6)?,
                average: r.get(7)?,
                rank: r.get(8)?,
                remark: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn subject_snapshot(
    conn: &Connection,
    scores_table: &str,
    result_id: &str,
) -> AppResult<Vec<SubjectScore>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT subject_id, subject_name, score FROM {scores_table}
         WHERE result_id = ?
         ORDER BY subject_name, subject_id"
    ))?;
    let rows = stmt
        .query_map([result_id], |r| {
            Ok(SubjectScore {
                subject_id: r.get(0)?,
                name: r.get(1)?,
                score: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn class_head(conn: &Connection, class_id: &str) -> AppResult<serde_json::Value> {
    let row: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT c.class_head_id, u.name
             FROM classes c
             LEFT JOIN users u ON u.id = c.class_head_id
             WHERE c.id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(match row {
        Some((Some(id), name)) => json!({ "id": id, "name": name }),
        _ => serde_json::Value::Null,
    })
}

fn build_payload(
    conn: &Connection,
    scope: &ClassScope,
    semester: Option<&SemesterInfo>,
    rows: Vec<PublishedRow>,
    scores_table: &str,
    at: DateTime<Utc>,
) -> AppResult<serde_json::Value> {
    let today = at.date_naive();
    let mut students = Vec::with_capacity(rows.len());
    let mut promoted = 0usize;
    let mut retained = 0usize;
    let mut averages = Vec::with_capacity(rows.len());
    for row in rows {
        match Remark::parse(&row.remark) {
            Some(Remark::Promoted) => promoted += 1,
            Some(Remark::Retained) => retained += 1,
            None => {}
        }
        averages.push(row.average);
        let subjects = subject_snapshot(conn, scores_table, &row.result_id)?;
        students.push(json!({
            "student_id": row.student_id,
            "student_code": row.student_code,
            "name": row.name,
            "sex": row.sex,
            "age": age_on(row.date_of_birth.as_deref(), today),
            "subjects": subjects,
            "total": row.total,
            "average": row.average,
            "rank": row.rank,
            "remark": row.remark,
        }));
    }

    let kind = if semester.is_some() {
        RosterKind::Semester
    } else {
        RosterKind::Year
    };
    Ok(json!({
        "kind": kind,
        "class": {
            "id": scope.class_id,
            "name": scope.class_name,
            "grade": scope.grade_name,
        },
        "class_head": class_head(conn, &scope.class_id)?,
        "academic_year": {
            "id": scope.academic_year_id,
            "name": scope.academic_year_name,
        },
        "semester": semester.map(|s| json!({
            "id": s.id,
            "name": s.name,
            "semester_number": s.semester_number,
        })),
        "students": students,
        "statistics": {
            "total_students": averages.len(),
            "class_average": calc::round_2dp(calc::mean(&averages)),
            "promoted": promoted,
            "retained": retained,
        },
    }))
}

pub fn build_semester_payload(
    conn: &Connection,
    scope: &ClassScope,
    semester: &SemesterInfo,
    at: DateTime<Utc>,
) -> AppResult<serde_json::Value> {
    let rows = published_rows(
        conn,
        "student_semester_results",
        "semester_id",
        &scope.class_id,
        &semester.id,
    )?;
    build_payload(conn, scope, Some(semester), rows, "result_subject_scores", at)
}

pub fn build_year_payload(
    conn: &Connection,
    scope: &ClassScope,
    at: DateTime<Utc>,
) -> AppResult<serde_json::Value> {
    let rows = published_rows(
        conn,
        "student_year_results",
        "academic_year_id",
        &scope.class_id,
        &scope.academic_year_id,
    )?;
    build_payload(conn, scope, None, rows, "year_subject_scores", at)
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterReceipt {
    pub roster_id: String,
    pub kind: RosterKind,
    pub class_name: String,
    pub students_count: i64,
    pub payload_sha256: String,
    pub sent_at: String,
    pub unchanged: bool,
}

/// Store a roster snapshot. An identical payload for the same class, year,
/// semester and kind leaves the stored row (and its `sent_at`) as it was.
pub fn store_roster(
    conn: &Connection,
    scope: &ClassScope,
    semester: Option<&SemesterInfo>,
    kind: RosterKind,
    payload: serde_json::Value,
    sent_by: &str,
    at: DateTime<Utc>,
) -> AppResult<RosterReceipt> {
    let digest = payload_digest(&payload)?;
    let semester_key = semester.map(|s| s.id.as_str()).unwrap_or("");
    let students_count = payload
        .get("students")
        .and_then(|v| v.as_array())
        .map(|a| a.len() as i64)
        .unwrap_or(0);
    let class_average = payload
        .pointer("/statistics/class_average")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    let existing: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, payload_sha256, sent_at FROM rosters
             WHERE class_id = ? AND academic_year_id = ? AND semester_key = ? AND kind = ?",
            (
                &scope.class_id,
                &scope.academic_year_id,
                semester_key,
                kind.as_str(),
            ),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    if let Some((roster_id, old_digest, sent_at)) = &existing {
        if *old_digest == digest {
            tracing::info!(roster_id = %roster_id, "roster unchanged; keeping previous snapshot");
            return Ok(RosterReceipt {
                roster_id: roster_id.clone(),
                kind,
                class_name: scope.class_name.clone(),
                students_count,
                payload_sha256: digest,
                sent_at: sent_at.clone(),
                unchanged: true,
            });
        }
    }

    let sent_at = grading::timestamp(&at);
    let text = serde_json::to_string(&payload)
        .map_err(|e| AppError::Internal(format!("failed to serialize roster payload: {e}")))?;
    let roster_id: String = conn.query_row(
        "INSERT INTO rosters(
            id, class_id, academic_year_id, semester_key, kind, students_count,
            class_average, payload, payload_sha256, sent_by, sent_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, academic_year_id, semester_key, kind) DO UPDATE SET
            students_count = excluded.students_count,
            class_average = excluded.class_average,
            payload = excluded.payload,
            payload_sha256 = excluded.payload_sha256,
            sent_by = excluded.sent_by,
            sent_at = excluded.sent_at
         RETURNING id",
        rusqlite::params![
            uuid::Uuid::new_v4().to_string(),
            scope.class_id,
            scope.academic_year_id,
            semester_key,
            kind.as_str(),
            students_count,
            class_average,
            text,
            digest,
            sent_by,
            sent_at,
        ],
        |r| r.get(0),
    )?;

    tracing::info!(
        roster_id = %roster_id,
        kind = kind.as_str(),
        class_id = %scope.class_id,
        students_count,
        replaced = existing.is_some(),
        "roster sent to store house"
    );

    Ok(RosterReceipt {
        roster_id,
        kind,
        class_name: scope.class_name.clone(),
        students_count,
        payload_sha256: digest,
        sent_at,
        unchanged: false,
    })
}

pub fn send_semester_roster(
    conn: &Connection,
    scope: &ClassScope,
    semester: &SemesterInfo,
    sent_by: &str,
    at: DateTime<Utc>,
) -> AppResult<RosterReceipt> {
    let tx = grading::begin_immediate(conn)?;
    let counts = grading::semester_scope_counts(&tx, &scope.class_id, &semester.id)?;
    if counts.published == 0 {
        return Err(AppError::not_found(
            "no published results to send; publish the semester first",
        ));
    }
    if counts.published < counts.compiled {
        return Err(AppError::conflict(
            "some compiled results are not published yet",
        )
        .with_details(json!({
            "students_compiled": counts.compiled,
            "students_published": counts.published,
        })));
    }
    let payload = build_semester_payload(&tx, scope, semester, at)?;
    let receipt = store_roster(
        &tx,
        scope,
        Some(semester),
        RosterKind::Semester,
        payload,
        sent_by,
        at,
    )?;
    tx.commit()?;
    Ok(receipt)
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterSummary {
    pub roster_id: String,
    pub kind: String,
    pub class_id: String,
    pub class_name: String,
    pub grade_id: String,
    pub grade_name: String,
    pub academic_year_id: String,
    pub academic_year_name: String,
    pub semester_id: Option<String>,
    pub students_count: i64,
    pub class_average: f64,
    pub payload_sha256: String,
    pub sent_by: String,
    pub sent_at: String,
}

const SUMMARY_SELECT: &str = "SELECT r.id, r.kind, r.class_id, c.name, g.id, g.name,
        r.academic_year_id, ay.name, r.semester_key, r.students_count, r.class_average,
        r.payload_sha256, r.sent_by, r.sent_at, r.payload
     FROM rosters r
     JOIN classes c ON c.id = r.class_id
     JOIN grades g ON g.id = c.grade_id
     JOIN academic_years ay ON ay.id = r.academic_year_id";

fn summary_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(RosterSummary, String)> {
    let semester_key: String = r.get(8)?;
    Ok((
        RosterSummary {
            roster_id: r.get(0)?,
            kind: r.get(1)?,
            class_id: r.get(2)?,
            class_name: r.get(3)?,
            grade_id: r.get(4)?,
            grade_name: r.get(5)?,
            academic_year_id: r.get(6)?,
            academic_year_name: r.get(7)?,
            semester_id: (!semester_key.is_empty()).then_some(semester_key),
            students_count: r.get(9)?,
            class_average: r.get(10)?,
            payload_sha256: r.get(11)?,
            sent_by: r.get(12)?,
            sent_at: r.get(13)?,
        },
        r.get(14)?,
    ))
}

/// Stored rosters with their raw payload text, newest first.
pub fn load_rosters(
    conn: &Connection,
    academic_year_id: Option<&str>,
    grade_id: Option<&str>,
) -> AppResult<Vec<(RosterSummary, String)>> {
    let mut stmt = conn.prepare(&format!(
        "{SUMMARY_SELECT}
         WHERE (?1 IS NULL OR r.academic_year_id = ?1)
           AND (?2 IS NULL OR g.id = ?2)
         ORDER BY r.sent_at DESC, r.id"
    ))?;
    let rows = stmt
        .query_map((academic_year_id, grade_id), summary_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_rosters(
    conn: &Connection,
    academic_year_id: Option<&str>,
    grade_id: Option<&str>,
) -> AppResult<Vec<RosterSummary>> {
    Ok(load_rosters(conn, academic_year_id, grade_id)?
        .into_iter()
        .map(|(summary, _)| summary)
        .collect())
}

pub fn get_roster(conn: &Connection, roster_id: &str) -> AppResult<serde_json::Value> {
    let row = conn
        .query_row(
            &format!("{SUMMARY_SELECT} WHERE r.id = ?"),
            [roster_id],
            summary_from_row,
        )
        .optional()?;
    let Some((summary, text)) = row else {
        return Err(AppError::not_found("roster not found"));
    };
    let payload: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| AppError::Internal(format!("stored roster payload is corrupt: {e}")))?;
    Ok(json!({ "roster": summary, "payload": payload }))
}
