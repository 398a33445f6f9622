//! Read side for students and parents. Semester, year and rank reads only see
//! published results; anything else is reported as not found.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use crate::calc;
use crate::error::{AppError, AppResult};
use crate::grading;
use crate::roles::{Actor, Role};
use crate::roster;

#[derive(Debug, Clone, Serialize)]
pub struct StudentInfo {
    pub id: String,
    pub code: String,
    pub name: String,
    pub sex: Option<String>,
    pub class_id: String,
    pub class_name: String,
    pub grade_id: String,
    pub grade_name: String,
    pub school_name: String,
}

const STUDENT_SELECT: &str = "SELECT s.id, s.student_code, s.name, s.sex, s.class_id, c.name,
        g.id, g.name, sc.name
     FROM students s
     JOIN classes c ON c.id = s.class_id
     JOIN grades g ON g.id = c.grade_id
     JOIN schools sc ON sc.id = g.school_id";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentInfo> {
    Ok(StudentInfo {
        id: r.get(0)?,
        code: r.get(1)?,
        name: r.get(2)?,
        sex: r.get(3)?,
        class_id: r.get(4)?,
        class_name: r.get(5)?,
        grade_id: r.get(6)?,
        grade_name: r.get(7)?,
        school_name: r.get(8)?,
    })
}

pub fn student_for_user(conn: &Connection, user_id: &str) -> AppResult<StudentInfo> {
    conn.query_row(
        &format!("{STUDENT_SELECT} WHERE s.user_id = ? ORDER BY s.id LIMIT 1"),
        [user_id],
        student_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("student profile not found"))
}

pub fn student_by_id(conn: &Connection, student_id: &str) -> AppResult<StudentInfo> {
    conn.query_row(
        &format!("{STUDENT_SELECT} WHERE s.id = ?"),
        [student_id],
        student_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("student not found"))
}

pub fn is_parent_of(conn: &Connection, parent_id: &str, student_id: &str) -> AppResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM student_parents WHERE parent_id = ? AND student_id = ?",
        (parent_id, student_id),
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

/// Whose report is being read: a student reads their own, a parent names a
/// linked child.
pub fn report_subject(
    conn: &Connection,
    actor: &Actor,
    student_id: Option<&str>,
) -> AppResult<StudentInfo> {
    match actor.role {
        Role::Student => {
            let own = student_for_user(conn, &actor.user_id)?;
            if student_id.is_some_and(|id| id != own.id) {
                return Err(AppError::forbidden(
                    "students can only read their own reports",
                ));
            }
            Ok(own)
        }
        Role::Parent => {
            let student_id =
                student_id.ok_or_else(|| AppError::validation("missing student_id"))?;
            if !is_parent_of(conn, &actor.user_id, student_id)? {
                return Err(AppError::forbidden(
                    "this student is not linked to your account",
                ));
            }
            student_by_id(conn, student_id)
        }
        other => Err(AppError::forbidden(format!(
            "role {} cannot read student reports",
            other.as_str()
        ))),
    }
}

fn class_size(conn: &Connection, class_id: &str) -> AppResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [class_id],
        |r| r.get(0),
    )?)
}

#[derive(Debug)]
struct PublishedResult {
    id: String,
    total: f64,
    average: f64,
    rank: i64,
    remark: String,
    published_at: Option<String>,
}

fn published_result(
    conn: &Connection,
    results_table: &str,
    scope_column: &str,
    student_id: &str,
    scope_id: &str,
) -> AppResult<Option<PublishedResult>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT id, total_score, average_score, rank_in_class, remark, published_at
                 FROM {results_table}
                 WHERE student_id = ? AND {scope_column} = ? AND is_published = 1"
            ),
            (student_id, scope_id),
            |r| {
                Ok(PublishedResult {
                    id: r.get(0)?,
                    total: r.get(1)?,
                    average: r.get(2)?,
                    rank: r.get(3)?,
                    remark: r.get(4)?,
                    published_at: r.get(5)?,
                })
            },
        )
        .optional()?)
}

fn student_header(student: &StudentInfo) -> serde_json::Value {
    json!({
        "id": student.id,
        "code": student.code,
        "name": student.name,
        "class_name": student.class_name,
        "grade_name": student.grade_name,
    })
}

pub fn semester_report(
    conn: &Connection,
    student: &StudentInfo,
    semester_id: &str,
    academic_year_id: &str,
) -> AppResult<serde_json::Value> {
    let semester = grading::semester_in_year(conn, semester_id, academic_year_id)?;
    let year_name = grading::academic_year_name(conn, academic_year_id)?;
    let Some(result) = published_result(
        conn,
        "student_semester_results",
        "semester_id",
        &student.id,
        &semester.id,
    )?
    else {
        return Err(AppError::not_found("report not yet published"));
    };
    let subjects = roster::subject_snapshot(conn, "result_subject_scores", &result.id)?;
    Ok(json!({
        "student": student_header(student),
        "semester": semester.name,
        "academic_year": year_name,
        "subjects": subjects,
        "summary": {
            "total": result.total,
            "average": result.average,
            "rank_in_class": result.rank,
            "total_students": class_size(conn, &student.class_id)?,
            "remark": result.remark,
        },
        "status": "published",
        "published_at": result.published_at,
    }))
}

pub fn year_report(
    conn: &Connection,
    student: &StudentInfo,
    academic_year_id: &str,
) -> AppResult<serde_json::Value> {
    let year_name = grading::academic_year_name(conn, academic_year_id)?;
    let Some(result) = published_result(
        conn,
        "student_year_results",
        "academic_year_id",
        &student.id,
        academic_year_id,
    )?
    else {
        return Err(AppError::not_found("year report not yet published"));
    };
    let subjects = roster::subject_snapshot(conn, "year_subject_scores", &result.id)?;
    Ok(json!({
        "student": student_header(student),
        "academic_year": year_name,
        "subjects": subjects,
        "summary": {
            "total": result.total,
            "average": result.average,
            "rank_in_class": result.rank,
            "total_students": class_size(conn, &student.class_id)?,
            "remark": result.remark,
        },
        "status": "published",
        "published_at": result.published_at,
    }))
}

#[derive(Debug, Serialize)]
struct AssessmentLine {
    #[serde(rename = "type")]
    type_name: String,
    score: f64,
    max_score: f64,
    weight_percent: f64,
    weighted_score: f64,
    date: String,
}

/// Per-assessment breakdown of one subject. Marks are visible to the student
/// as they are recorded.
pub fn subject_grades(
    conn: &Connection,
    student: &StudentInfo,
    subject_id: &str,
    semester_id: &str,
) -> AppResult<serde_json::Value> {
    let semester = grading::semester_info(conn, semester_id)?;
    let subject_name: String = conn
        .query_row("SELECT name FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()?
        .ok_or_else(|| AppError::not_found("subject not found"))?;

    let assignment: Option<(String, String)> = conn
        .query_row(
            "SELECT ta.id, u.name
             FROM teaching_assignments ta
             JOIN users u ON u.id = ta.teacher_id
             WHERE ta.class_id = ? AND ta.subject_id = ? AND ta.academic_year_id = ?",
            (&student.class_id, subject_id, &semester.academic_year_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((assignment_id, teacher_name)) = assignment else {
        return Err(AppError::not_found("subject is not assigned to this class"));
    };

    let mut stmt = conn.prepare(
        "SELECT aty.name, m.score, m.max_score,
                COALESCE(aw.weight_percent, aty.default_weight_percent), m.created_at
         FROM marks m
         JOIN assessment_types aty ON aty.id = m.assessment_type_id
         LEFT JOIN assessment_weights aw
                ON aw.teaching_assignment_id = m.teaching_assignment_id
               AND aw.assessment_type_id = m.assessment_type_id
               AND aw.semester_id = m.semester_id
         WHERE m.student_id = ? AND m.teaching_assignment_id = ? AND m.semester_id = ?
         ORDER BY m.created_at, m.id",
    )?;
    let lines = stmt
        .query_map((&student.id, &assignment_id, &semester.id), |r| {
            let score: f64 = r.get(1)?;
            let max_score: f64 = r.get(2)?;
            let weight_percent: f64 = r.get(3)?;
            Ok(AssessmentLine {
                type_name: r.get(0)?,
                score,
                max_score,
                weight_percent,
                weighted_score: calc::round_2dp(
                    calc::weighted_contribution(score, max_score, weight_percent)
                        .unwrap_or(0.0),
                ),
                date: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let subject_total: f64 = lines.iter().map(|l| l.score).sum();
    let subject_score: f64 = lines.iter().map(|l| l.weighted_score).sum();
    Ok(json!({
        "subject": { "id": subject_id, "name": subject_name },
        "teacher": { "name": teacher_name },
        "semester": semester.name,
        "assessments": lines,
        "summary": {
            "subject_total": calc::round_2dp(subject_total),
            "subject_average": calc::round_2dp(subject_score),
        },
    }))
}

pub fn rank(
    conn: &Connection,
    student: &StudentInfo,
    semester_id: &str,
    academic_year_id: &str,
) -> AppResult<serde_json::Value> {
    let semester = grading::semester_in_year(conn, semester_id, academic_year_id)?;
    let year_name = grading::academic_year_name(conn, academic_year_id)?;
    let Some(result) = published_result(
        conn,
        "student_semester_results",
        "semester_id",
        &student.id,
        &semester.id,
    )?
    else {
        return Err(AppError::not_found("rank not yet published"));
    };

    let (class_average, highest, lowest, ranked): (Option<f64>, Option<f64>, Option<f64>, i64) =
        conn.query_row(
            "SELECT AVG(average_score), MAX(total_score), MIN(total_score), COUNT(*)
             FROM student_semester_results
             WHERE class_id = ? AND semester_id = ? AND is_published = 1",
            (&student.class_id, &semester.id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;
    let class_average = class_average.unwrap_or(0.0);

    Ok(json!({
        "student_id": student.id,
        "student_name": student.name,
        "class_name": student.class_name,
        "type": "semester",
        "period": format!("{} {}", semester.name, year_name),
        "rank": {
            "position": result.rank,
            "total_students": ranked,
        },
        "scores": {
            "total": result.total,
            "average": result.average,
        },
        "comparison": {
            "class_average": calc::round_2dp(class_average),
            "class_highest_total": highest.unwrap_or(0.0),
            "class_lowest_total": lowest.unwrap_or(0.0),
            "above_average": result.average > class_average,
            "difference_from_average": calc::round_2dp(result.average - class_average),
        },
        "remark": result.remark,
    }))
}

pub fn profile(student: &StudentInfo) -> serde_json::Value {
    json!({
        "id": student.id,
        "code": student.code,
        "name": student.name,
        "gender": student.sex,
        "class_name": student.class_name,
        "grade_name": student.grade_name,
        "school_name": student.school_name,
    })
}

pub fn children(conn: &Connection, parent_id: &str) -> AppResult<serde_json::Value> {
    let mut stmt = conn.prepare(&format!(
        "{STUDENT_SELECT}
         JOIN student_parents sp ON sp.student_id = s.id
         WHERE sp.parent_id = ?
         ORDER BY s.name, s.id"
    ))?;
    let items: Vec<serde_json::Value> = stmt
        .query_map([parent_id], student_from_row)?
        .map(|r| {
            r.map(|s| {
                json!({
                    "student_id": s.id,
                    "student_code": s.code,
                    "name": s.name,
                    "class_name": s.class_name,
                    "grade_name": s.grade_name,
                    "school_name": s.school_name,
                })
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "items": items }))
}
