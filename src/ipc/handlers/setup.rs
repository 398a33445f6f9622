use crate::error::{conflict_on_constraint, AppError, AppResult};
use crate::ipc::helpers::{
    actor_with, optional_f64, optional_id, required_f64, required_id, required_str, respond,
};
use crate::ipc::types::{AppState, Request};
use crate::roles::{Actor, Capability, Role};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Serialize)]
struct AssessmentType {
    id: String,
    school_id: Option<String>,
    name: String,
    default_weight_percent: f64,
}

fn check_weight(key: &str, w: f64) -> AppResult<f64> {
    if !(0.0..=100.0).contains(&w) {
        return Err(AppError::validation(format!(
            "{key} must be between 0 and 100"
        ))
        .with_details(json!({ "field": key, "value": w })));
    }
    Ok(w)
}

fn actor_school(conn: &Connection, actor: &Actor) -> AppResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT school_id FROM users WHERE id = ?",
            [&actor.user_id],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten())
}

fn load_type(conn: &Connection, type_id: &str) -> AppResult<AssessmentType> {
    conn.query_row(
        "SELECT id, school_id, name, default_weight_percent FROM assessment_types WHERE id = ?",
        [type_id],
        |r| {
            Ok(AssessmentType {
                id: r.get(0)?,
                school_id: r.get(1)?,
                name: r.get(2)?,
                default_weight_percent: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("assessment type not found"))
}

fn name_taken(
    conn: &Connection,
    school_id: Option<&str>,
    name: &str,
    except_id: Option<&str>,
) -> AppResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assessment_types
         WHERE school_id IS ? AND lower(name) = lower(?) AND (? IS NULL OR id <> ?)",
        (school_id, name, except_id, except_id),
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

fn handle_types_list(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = Actor::from_params(&req.params)?;
    if !actor.role.can(Capability::ManageAssessmentTypes) {
        actor.require(Capability::RecordMarks)?;
    }
    let conn = state.conn()?;
    let school_id = match optional_id(&req.params, "school_id")? {
        Some(id) => Some(id),
        None => actor_school(conn, &actor)?,
    };
    let mut stmt = conn.prepare(
        "SELECT id, school_id, name, default_weight_percent
         FROM assessment_types
         WHERE (?1 IS NULL OR school_id = ?1 OR school_id IS NULL)
         ORDER BY name, id",
    )?;
    let items = stmt
        .query_map([&school_id], |r| {
            Ok(AssessmentType {
                id: r.get(0)?,
                school_id: r.get(1)?,
                name: r.get(2)?,
                default_weight_percent: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "items": items }))
}

fn handle_types_create(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::ManageAssessmentTypes)?;
    let conn = state.conn()?;
    let name = required_str(&req.params, "name")?;
    let weight = check_weight(
        "default_weight_percent",
        required_f64(&req.params, "default_weight_percent")?,
    )?;
    let school_id = match optional_id(&req.params, "school_id")? {
        Some(id) => Some(id),
        None => actor_school(conn, &actor)?,
    };
    if name_taken(conn, school_id.as_deref(), &name, None)? {
        return Err(AppError::conflict(format!(
            "assessment type {name} already exists"
        )));
    }
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessment_types(id, school_id, name, default_weight_percent)
         VALUES(?, ?, ?, ?)",
        (&id, &school_id, &name, weight),
    )
    .map_err(|e| conflict_on_constraint(e, "assessment type already exists"))?;
    tracing::info!(type_id = %id, name = %name, "assessment type created");
    Ok(json!(load_type(conn, &id)?))
}

fn handle_types_update(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    actor_with(req, Capability::ManageAssessmentTypes)?;
    let conn = state.conn()?;
    let type_id = required_id(&req.params, "type_id")?;
    let current = load_type(conn, &type_id)?;

    let name = match req.params.get("name") {
        None | Some(serde_json::Value::Null) => current.name.clone(),
        Some(_) => required_str(&req.params, "name")?,
    };
    let weight = match optional_f64(&req.params, "default_weight_percent")? {
        Some(w) => check_weight("default_weight_percent", w)?,
        None => current.default_weight_percent,
    };
    if name_taken(conn, current.school_id.as_deref(), &name, Some(&type_id))? {
        return Err(AppError::conflict(format!(
            "assessment type {name} already exists"
        )));
    }
    conn.execute(
        "UPDATE assessment_types SET name = ?, default_weight_percent = ? WHERE id = ?",
        (&name, weight, &type_id),
    )
    .map_err(|e| conflict_on_constraint(e, "assessment type already exists"))?;
    Ok(json!(load_type(conn, &type_id)?))
}

fn handle_types_delete(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    actor_with(req, Capability::ManageAssessmentTypes)?;
    let conn = state.conn()?;
    let type_id = required_id(&req.params, "type_id")?;
    load_type(conn, &type_id)?;
    let (marks, weights): (i64, i64) = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM marks WHERE assessment_type_id = ?1),
            (SELECT COUNT(*) FROM assessment_weights WHERE assessment_type_id = ?1)",
        [&type_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if marks > 0 || weights > 0 {
        return Err(
            AppError::conflict("assessment type is in use and cannot be deleted")
                .with_details(json!({ "marks": marks, "weights": weights })),
        );
    }
    conn.execute("DELETE FROM assessment_types WHERE id = ?", [&type_id])?;
    tracing::info!(type_id = %type_id, "assessment type deleted");
    Ok(json!({ "deleted": true, "type_id": type_id }))
}

pub struct AssignmentInfo {
    pub id: String,
    pub teacher_id: String,
    pub class_id: String,
    pub academic_year_id: String,
}

pub fn load_assignment(conn: &Connection, assignment_id: &str) -> AppResult<AssignmentInfo> {
    conn.query_row(
        "SELECT id, teacher_id, class_id, academic_year_id
         FROM teaching_assignments WHERE id = ?",
        [assignment_id],
        |r| {
            Ok(AssignmentInfo {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                class_id: r.get(2)?,
                academic_year_id: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("teaching assignment not found"))
}

/// Teachers (class heads included) only touch their own assignments.
pub fn owned_assignment(
    conn: &Connection,
    actor: &Actor,
    assignment_id: &str,
) -> AppResult<AssignmentInfo> {
    let a = load_assignment(conn, assignment_id)?;
    let owner =
        matches!(actor.role, Role::Teacher | Role::ClassHead) && a.teacher_id == actor.user_id;
    if !owner {
        return Err(AppError::forbidden(
            "teaching assignment belongs to another teacher",
        ));
    }
    Ok(a)
}

/// Semester must exist and sit in the assignment's academic year.
pub fn semester_for_assignment(
    conn: &Connection,
    assignment: &AssignmentInfo,
    semester_id: &str,
) -> AppResult<()> {
    let year: Option<String> = conn
        .query_row(
            "SELECT academic_year_id FROM semesters WHERE id = ?",
            [semester_id],
            |r| r.get(0),
        )
        .optional()?;
    match year {
        None => Err(AppError::not_found("semester not found")),
        Some(y) if y != assignment.academic_year_id => Err(AppError::validation(
            "semester does not belong to the assignment's academic year",
        )),
        Some(_) => Ok(()),
    }
}

fn handle_weights_set(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::RecordMarks)?;
    let conn = state.conn()?;
    let assignment_id = required_id(&req.params, "teaching_assignment_id")?;
    let type_id = required_id(&req.params, "assessment_type_id")?;
    let semester_id = required_id(&req.params, "semester_id")?;
    let weight = check_weight(
        "weight_percent",
        required_f64(&req.params, "weight_percent")?,
    )?;

    let assignment = owned_assignment(conn, &actor, &assignment_id)?;
    semester_for_assignment(conn, &assignment, &semester_id)?;
    load_type(conn, &type_id)?;

    let id: String = conn.query_row(
        "INSERT INTO assessment_weights(
            id, teaching_assignment_id, assessment_type_id, semester_id, weight_percent
         ) VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(teaching_assignment_id, assessment_type_id, semester_id)
         DO UPDATE SET weight_percent = excluded.weight_percent
         RETURNING id",
        (
            uuid::Uuid::new_v4().to_string(),
            &assignment.id,
            &type_id,
            &semester_id,
            weight,
        ),
        |r| r.get(0),
    )?;
    Ok(json!({
        "weight_id": id,
        "teaching_assignment_id": assignment.id,
        "assessment_type_id": type_id,
        "semester_id": semester_id,
        "weight_percent": weight,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "assessmentTypes.list" => handle_types_list(state, req),
        "assessmentTypes.create" => handle_types_create(state, req),
        "assessmentTypes.update" => handle_types_update(state, req),
        "assessmentTypes.delete" => handle_types_delete(state, req),
        "weights.set" => handle_weights_set(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
