use crate::error::{AppError, AppResult};
use crate::ipc::handlers::setup::{owned_assignment, semester_for_assignment};
use crate::ipc::helpers::{actor_with, now_rfc3339, required_f64, required_id, respond};
use crate::ipc::types::{AppState, Request};
use crate::roles::Capability;
use rusqlite::OptionalExtension;
use serde::Serialize;
use serde_json::json;

fn check_score(score: f64, max_score: f64) -> AppResult<()> {
    if max_score <= 0.0 {
        return Err(AppError::validation("max_score must be greater than 0")
            .with_details(json!({ "max_score": max_score })));
    }
    if score < 0.0 || score > max_score {
        return Err(
            AppError::validation("score must be between 0 and max_score")
                .with_details(json!({ "score": score, "max_score": max_score })),
        );
    }
    Ok(())
}

fn handle_record(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::RecordMarks)?;
    let conn = state.conn()?;
    let assignment_id = required_id(&req.params, "teaching_assignment_id")?;
    let student_id = required_id(&req.params, "student_id")?;
    let type_id = required_id(&req.params, "assessment_type_id")?;
    let semester_id = required_id(&req.params, "semester_id")?;
    let score = required_f64(&req.params, "score")?;
    let max_score = required_f64(&req.params, "max_score")?;
    check_score(score, max_score)?;

    let assignment = owned_assignment(conn, &actor, &assignment_id)?;
    semester_for_assignment(conn, &assignment, &semester_id)?;

    let student_class: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()?;
    match student_class {
        None => return Err(AppError::not_found("student not found")),
        Some(c) if c != assignment.class_id => {
            return Err(AppError::validation(
                "student is not in the teaching assignment's class",
            ))
        }
        Some(_) => {}
    }
    let type_exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assessment_types WHERE id = ?",
        [&type_id],
        |r| r.get(0),
    )?;
    if type_exists == 0 {
        return Err(AppError::not_found("assessment type not found"));
    }

    let mark_id = uuid::Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    conn.execute(
        "INSERT INTO marks(
            id, student_id, teaching_assignment_id, assessment_type_id, semester_id,
            score, max_score, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &mark_id,
            &student_id,
            &assignment.id,
            &type_id,
            &semester_id,
            score,
            max_score,
            &created_at,
        ),
    )?;
    tracing::debug!(mark_id = %mark_id, student_id = %student_id, "mark recorded");

    Ok(json!({
        "mark_id": mark_id,
        "student_id": student_id,
        "teaching_assignment_id": assignment.id,
        "assessment_type_id": type_id,
        "semester_id": semester_id,
        "score": score,
        "max_score": max_score,
        "created_at": created_at,
    }))
}

#[derive(Debug, Serialize)]
struct MarkItem {
    mark_id: String,
    student_id: String,
    student_name: String,
    assessment_type_id: String,
    assessment_type: String,
    score: f64,
    max_score: f64,
    weight_percent: f64,
    created_at: String,
}

fn handle_list(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::RecordMarks)?;
    let conn = state.conn()?;
    let assignment_id = required_id(&req.params, "teaching_assignment_id")?;
    let semester_id = required_id(&req.params, "semester_id")?;
    let assignment = owned_assignment(conn, &actor, &assignment_id)?;
    semester_for_assignment(conn, &assignment, &semester_id)?;

    let mut stmt = conn.prepare(
        "SELECT m.id, m.student_id, st.name, m.assessment_type_id, aty.name,
                m.score, m.max_score,
                COALESCE(aw.weight_percent, aty.default_weight_percent), m.created_at
         FROM marks m
         JOIN students st ON st.id = m.student_id
         JOIN assessment_types aty ON aty.id = m.assessment_type_id
         LEFT JOIN assessment_weights aw
                ON aw.teaching_assignment_id = m.teaching_assignment_id
               AND aw.assessment_type_id = m.assessment_type_id
               AND aw.semester_id = m.semester_id
         WHERE m.teaching_assignment_id = ? AND m.semester_id = ?
         ORDER BY st.name, m.student_id, m.created_at, m.id",
    )?;
    let items = stmt
        .query_map((&assignment.id, &semester_id), |r| {
            Ok(MarkItem {
                mark_id: r.get(0)?,
                student_id: r.get(1)?,
                student_name: r.get(2)?,
                assessment_type_id: r.get(3)?,
                assessment_type: r.get(4)?,
                score: r.get(5)?,
                max_score: r.get(6)?,
                weight_percent: r.get(7)?,
                created_at: r.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "items": items }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "marks.record" => handle_record(state, req),
        "marks.list" => handle_list(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
